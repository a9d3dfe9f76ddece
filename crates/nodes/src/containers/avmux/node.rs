// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The muxer as a pipeline node.
//!
//! Every `video_N` / `audio_N` input carries `Caps`, then `Media`, optionally
//! `Tags`; closing the channel is end-of-stream. The node forwards container
//! bytes on `out` as they are produced and returns once the trailer has been
//! written, which closes its output.

use super::codec::{CapsCodecMapper, CodecMapper};
use super::error::MuxError;
use super::estimator::{TrailerEstimate, TrailerFamily};
use super::formats::FormatDescriptor;
use super::port::PortId;
use super::scheduler::{CollectOutcome, MuxSession, SessionOptions};
use async_trait::async_trait;
use muxkit_core::control::NodeControlMessage;
use muxkit_core::pins::PinManagementMessage;
use muxkit_core::stats::NodeStatsTracker;
use muxkit_core::types::{MediaKind, Packet, PacketMetadata, PacketType, TagList};
use muxkit_core::{
    state_helpers, InputPin, MuxKitError, NodeContext, OutputPin, OutputSender, PinCardinality,
    ProcessorNode,
};
use opentelemetry::metrics::{Counter, Gauge};
use opentelemetry::{global, KeyValue};
use schemars::JsonSchema;
use serde::Deserialize;
use std::borrow::Cow;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::Poll;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const OUTPUT_PIN: &str = "out";

/// Configuration for the `containers::avmux::*` nodes.
#[derive(Deserialize, Debug, Clone, Default, JsonSchema)]
#[serde(default)]
pub struct AvMuxerConfig {
    /// Initial demux-decode delay handed to the muxer, in microseconds.
    pub preload: u64,
    /// Maximum demux-decode delay, in microseconds.
    pub max_delay: u64,
    /// Number of `video_N` pins declared up front. Defaults to one when the
    /// format carries video.
    pub video_inputs: Option<usize>,
    /// Number of `audio_N` pins declared up front. Defaults to one when the
    /// format carries audio.
    pub audio_inputs: Option<usize>,
    /// Overrides the format's trailer size model.
    pub trailer_family: Option<TrailerFamily>,
    /// Written into the container header when the format supports it.
    pub tags: TagList,
}

/// Live muxing counters, readable while the node runs.
#[derive(Debug, Default)]
pub struct MuxMetrics {
    expected_trailer_size: AtomicU64,
    video_frames: AtomicU64,
    audio_frames: AtomicU64,
    write_errors: AtomicU64,
}

impl MuxMetrics {
    pub fn expected_trailer_size(&self) -> u64 {
        self.expected_trailer_size.load(Ordering::Relaxed)
    }

    pub fn video_frames(&self) -> u64 {
        self.video_frames.load(Ordering::Relaxed)
    }

    pub fn audio_frames(&self) -> u64 {
        self.audio_frames.load(Ordering::Relaxed)
    }

    pub fn write_errors(&self) -> u64 {
        self.write_errors.load(Ordering::Relaxed)
    }

    fn publish(&self, estimate: TrailerEstimate, write_errors: u64) {
        self.expected_trailer_size.store(estimate.expected_trailer_size, Ordering::Relaxed);
        self.video_frames.store(estimate.video_frames, Ordering::Relaxed);
        self.audio_frames.store(estimate.audio_frames, Ordering::Relaxed);
        self.write_errors.store(write_errors, Ordering::Relaxed);
    }
}

/// OpenTelemetry instruments for one node instance.
struct MuxInstruments {
    packets_muxed: Counter<u64>,
    trailer_size: Gauge<u64>,
    frames: Gauge<u64>,
    labels: [KeyValue; 1],
    frame_labels: [[KeyValue; 2]; 2],
}

impl MuxInstruments {
    fn new(format: &'static str) -> Self {
        let meter = global::meter("muxkit_nodes");
        Self {
            packets_muxed: meter.u64_counter("avmux_packets_muxed").build(),
            trailer_size: meter.u64_gauge("avmux_expected_trailer_size").build(),
            frames: meter.u64_gauge("avmux_frames").build(),
            labels: [KeyValue::new("format", format)],
            frame_labels: [
                [KeyValue::new("format", format), KeyValue::new("kind", "video")],
                [KeyValue::new("format", format), KeyValue::new("kind", "audio")],
            ],
        }
    }

    fn record(&self, estimate: TrailerEstimate) {
        self.trailer_size.record(estimate.expected_trailer_size, &self.labels);
        self.frames.record(estimate.video_frames, &self.frame_labels[0]);
        self.frames.record(estimate.audio_frames, &self.frame_labels[1]);
    }
}

/// Muxes any number of encoded video and audio inputs into one container stream.
pub struct AvMuxerNode {
    format: Arc<FormatDescriptor>,
    mapper: Arc<dyn CodecMapper>,
    config: AvMuxerConfig,
    metrics: Arc<MuxMetrics>,
}

impl AvMuxerNode {
    /// # Errors
    ///
    /// `MuxKitError::Configuration` when pins are requested for a stream kind
    /// the format cannot carry.
    pub fn new(format: Arc<FormatDescriptor>, config: AvMuxerConfig) -> Result<Self, MuxKitError> {
        for (kind, requested) in
            [(MediaKind::Video, config.video_inputs), (MediaKind::Audio, config.audio_inputs)]
        {
            if requested.unwrap_or(0) > 0 && !carries(&format, kind) {
                return Err(MuxKitError::Configuration(format!(
                    "{} cannot carry {kind} streams",
                    format.long_name
                )));
            }
        }
        Ok(Self {
            format,
            mapper: Arc::new(CapsCodecMapper),
            config,
            metrics: Arc::new(MuxMetrics::default()),
        })
    }

    /// Replaces the caps to codec translation.
    #[must_use]
    pub fn with_mapper(mut self, mapper: Arc<dyn CodecMapper>) -> Self {
        self.mapper = mapper;
        self
    }

    pub fn metrics(&self) -> Arc<MuxMetrics> {
        self.metrics.clone()
    }

    fn declared_inputs(&self, kind: MediaKind) -> usize {
        let configured = match kind {
            MediaKind::Video => self.config.video_inputs,
            MediaKind::Audio => self.config.audio_inputs,
        };
        configured.unwrap_or_else(|| usize::from(carries(&self.format, kind)))
    }
}

fn carries(format: &FormatDescriptor, kind: MediaKind) -> bool {
    match kind {
        MediaKind::Video => !format.video_codecs.is_empty(),
        MediaKind::Audio => !format.audio_codecs.is_empty(),
    }
}

fn media_pin(kind: MediaKind, name: String, cardinality: PinCardinality) -> InputPin {
    InputPin { name, accepts_types: vec![PacketType::Media(kind)], cardinality }
}

/// Stream kind from a pin name: `video`, `video_3`, `audio_0`, ...
fn pin_kind(name: &str) -> Option<MediaKind> {
    [MediaKind::Video, MediaKind::Audio].into_iter().find(|kind| {
        name.strip_prefix(kind.pin_prefix())
            .is_some_and(|rest| rest.is_empty() || rest.starts_with('_'))
    })
}

/// Video first, then audio, each by pin number.
fn pin_order(name: &str) -> (u8, u32, String) {
    let kind = match pin_kind(name) {
        Some(MediaKind::Video) => 0,
        Some(MediaKind::Audio) => 1,
        None => 2,
    };
    let number = name.rsplit('_').next().and_then(|n| n.parse().ok()).unwrap_or(u32::MAX);
    (kind, number, name.to_string())
}

#[async_trait]
impl ProcessorNode for AvMuxerNode {
    fn input_pins(&self) -> Vec<InputPin> {
        let mut pins = Vec::new();
        for kind in [MediaKind::Video, MediaKind::Audio] {
            if !carries(&self.format, kind) {
                continue;
            }
            let prefix = kind.pin_prefix();
            for i in 0..self.declared_inputs(kind) {
                pins.push(media_pin(kind, format!("{prefix}_{i}"), PinCardinality::One));
            }
            pins.push(media_pin(
                kind,
                prefix.to_string(),
                PinCardinality::Dynamic { prefix: prefix.to_string() },
            ));
        }
        pins
    }

    fn output_pins(&self) -> Vec<OutputPin> {
        vec![OutputPin {
            name: OUTPUT_PIN.to_string(),
            produces_type: PacketType::Binary,
            cardinality: PinCardinality::Broadcast,
        }]
    }

    fn content_type(&self) -> Option<String> {
        Some(self.format.content_type.to_string())
    }

    fn supports_dynamic_pins(&self) -> bool {
        true
    }

    async fn run(self: Box<Self>, mut context: NodeContext) -> Result<(), MuxKitError> {
        let node_name = context.output_sender.node_name().to_string();
        state_helpers::emit_initializing(&context.state_tx, &node_name);

        let session = MuxSession::new(
            self.format.clone(),
            self.mapper.clone(),
            SessionOptions {
                preload_us: self.config.preload,
                max_delay_us: self.config.max_delay,
                trailer_family: self.config.trailer_family,
                tags: self.config.tags.clone(),
            },
        );
        let mut run = MuxRun {
            session,
            slots: Vec::new(),
            stats: NodeStatsTracker::new(node_name.clone(), context.stats_tx.clone()),
            instruments: MuxInstruments::new(self.format.id),
            metrics: self.metrics.clone(),
            node_name: node_name.clone(),
            state_tx: context.state_tx.clone(),
            sequence: 0,
            reported_write_errors: 0,
            degraded: false,
        };

        // Pins connected at startup become ports in a stable order.
        let mut initial: Vec<_> = context.inputs.drain().collect();
        initial.sort_by_key(|(name, _)| pin_order(name));
        for (name, rx) in initial {
            if let Err(e) = run.attach(&name, rx) {
                state_helpers::emit_failed(&context.state_tx, &node_name, e.to_string());
                return Err(e);
            }
        }

        let mut pin_mgmt_rx = context.pin_management_rx.take();
        let cancellation_token = context.cancellation_token.clone();

        state_helpers::emit_running(&context.state_tx, &node_name);
        tracing::info!(
            format = self.format.id,
            inputs = run.slots.len(),
            "AvMuxerNode started"
        );

        let reason = loop {
            match run.drive(&mut context.output_sender).await {
                Ok(Drive::Continue) => {},
                Ok(Drive::Finished) => break "completed",
                Ok(Drive::OutputClosed) => {
                    tracing::debug!("Output channel closed, stopping muxer");
                    run.session.shutdown();
                    run.stats.force_send();
                    state_helpers::emit_stopped(&context.state_tx, &node_name, "output_closed");
                    return Ok(());
                },
                Err(e) => {
                    tracing::error!(error = %e, "Muxing failed");
                    run.stats.errored();
                    run.stats.force_send();
                    state_helpers::emit_failed(&context.state_tx, &node_name, e.to_string());
                    return Err(e.into());
                },
            }

            let wanted = run.wanted_slots();
            tokio::select! {
                Some(msg) = async {
                    match &mut pin_mgmt_rx {
                        Some(rx) => rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => {
                    run.on_pin_message(msg);
                }

                Some(control_msg) = context.control_rx.recv() => {
                    match control_msg {
                        NodeControlMessage::Shutdown => {
                            tracing::info!("AvMuxerNode received shutdown signal");
                            break "shutdown";
                        },
                        NodeControlMessage::Reset => run.reset(),
                        NodeControlMessage::UpdateParams(_) => {
                            tracing::debug!("AvMuxerNode parameters are fixed at creation, ignoring update");
                        },
                    }
                }

                () = cancelled(cancellation_token.as_ref()) => {
                    tracing::info!("AvMuxerNode cancelled");
                    break "shutdown";
                }

                (idx, packet) = next_packet(&mut run.slots, &wanted) => {
                    run.on_packet(idx, packet);
                }
            }
        };

        if reason != "completed" {
            run.session.shutdown();
            // Whatever the backend produced before closing still goes out.
            run.forward_output(&mut context.output_sender).await;
        }
        run.stats.force_send();
        state_helpers::emit_stopped(&context.state_tx, &node_name, reason);
        tracing::info!(reason, "AvMuxerNode finished");
        Ok(())
    }
}

async fn cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

enum SlotInput {
    /// Requested through pin management, channel not attached yet.
    Pending,
    Open(mpsc::Receiver<Packet>),
    Closed,
}

struct InputSlot {
    name: String,
    port: PortId,
    input: SlotInput,
}

/// Receives from the first open input flagged in `wanted`.
fn next_packet<'a>(
    slots: &'a mut [InputSlot],
    wanted: &'a [bool],
) -> impl Future<Output = (usize, Option<Packet>)> + Send + 'a {
    futures::future::poll_fn(move |cx| {
        for (idx, slot) in slots.iter_mut().enumerate() {
            if !wanted.get(idx).copied().unwrap_or(false) {
                continue;
            }
            let SlotInput::Open(rx) = &mut slot.input else { continue };
            if let Poll::Ready(packet) = rx.poll_recv(cx) {
                return Poll::Ready((idx, packet));
            }
        }
        Poll::Pending
    })
}

enum Drive {
    Continue,
    Finished,
    OutputClosed,
}

/// Per-run state owned by the node task.
struct MuxRun {
    session: MuxSession,
    slots: Vec<InputSlot>,
    stats: NodeStatsTracker,
    instruments: MuxInstruments,
    metrics: Arc<MuxMetrics>,
    node_name: String,
    state_tx: mpsc::Sender<muxkit_core::NodeStateUpdate>,
    sequence: u64,
    reported_write_errors: u64,
    degraded: bool,
}

impl MuxRun {
    fn attach(&mut self, name: &str, rx: mpsc::Receiver<Packet>) -> Result<(), MuxKitError> {
        let kind = pin_kind(name).ok_or_else(|| {
            MuxKitError::Configuration(format!("input pin '{name}' is neither video nor audio"))
        })?;
        let port = self.session.add_named_port(kind, name)?;
        self.slots.push(InputSlot { name: name.to_string(), port, input: SlotInput::Open(rx) });
        Ok(())
    }

    /// Slots whose port the session is waiting on: no queued buffer, or still
    /// waiting for caps. Upstream of every other slot is held back by the
    /// channel bound.
    fn wanted_slots(&self) -> Vec<bool> {
        self.slots
            .iter()
            .map(|slot| {
                self.session
                    .streams()
                    .get(slot.port)
                    .is_some_and(|p| p.wants_data() || !p.is_negotiated())
            })
            .collect()
    }

    /// Collects until the session needs more input, forwarding output as it appears.
    async fn drive(&mut self, out: &mut OutputSender) -> Result<Drive, MuxError> {
        loop {
            let outcome = self.session.collect()?;
            if outcome == CollectOutcome::Dispatched {
                self.instruments.packets_muxed.add(1, &self.instruments.labels);
            }
            self.publish_metrics();
            if !self.forward_output(out).await {
                return Ok(Drive::OutputClosed);
            }
            match outcome {
                CollectOutcome::Dispatched => {},
                CollectOutcome::Finished => return Ok(Drive::Finished),
                CollectOutcome::NeedData | CollectOutcome::AwaitingNegotiation => {
                    return Ok(Drive::Continue);
                },
            }
        }
    }

    /// Sends pending container bytes. Returns `false` once downstream is gone.
    async fn forward_output(&mut self, out: &mut OutputSender) -> bool {
        while let Some(output) = self.session.take_output() {
            if output.stream_header {
                tracing::debug!(bytes = output.data.len(), "Sending stream header");
            }
            let packet = Packet::Binary {
                data: output.data,
                content_type: Some(Cow::Owned(self.session.content_type())),
                metadata: Some(PacketMetadata {
                    sequence: Some(self.sequence),
                    stream_header: output.stream_header,
                    ..Default::default()
                }),
            };
            self.sequence += 1;
            if out.send(OUTPUT_PIN, packet).await.is_err() {
                return false;
            }
            self.stats.sent();
        }
        true
    }

    fn publish_metrics(&mut self) {
        let estimate = self.session.estimate();
        let write_errors = self.session.write_errors();
        if write_errors > self.reported_write_errors {
            self.stats.errored_n(write_errors - self.reported_write_errors);
            self.reported_write_errors = write_errors;
        }
        self.metrics.publish(estimate, write_errors);
        self.instruments.record(estimate);
    }

    fn on_packet(&mut self, idx: usize, packet: Option<Packet>) {
        let Some(slot) = self.slots.get_mut(idx) else { return };
        let port = slot.port;

        let Some(packet) = packet else {
            slot.input = SlotInput::Closed;
            tracing::debug!(pin = %slot.name, "Input channel closed");
            if let Err(e) = self.session.mark_eos(port) {
                tracing::warn!(error = %e, "Failed to mark input EOS");
            }
            return;
        };

        self.stats.received();
        match packet {
            Packet::Caps(caps) => match self.session.negotiate(port, &caps) {
                Ok(()) => {
                    if self.degraded && self.session.all_negotiated() {
                        self.degraded = false;
                        state_helpers::emit_running(&self.state_tx, &self.node_name);
                    }
                },
                Err(e) => {
                    tracing::warn!(pin = %slot.name, error = %e, "Rejected input caps");
                    self.stats.errored();
                    self.degraded = true;
                    state_helpers::emit_degraded(
                        &self.state_tx,
                        &self.node_name,
                        e.to_string(),
                        Some(serde_json::json!({
                            "pin": slot.name,
                            "media_type": caps.media_type,
                        })),
                    );
                },
            },
            Packet::Media(buffer) => match self.session.push(port, buffer) {
                Ok(true) => {},
                Ok(false) => self.stats.discarded(),
                Err(e) => {
                    tracing::warn!(pin = %slot.name, error = %e, "Failed to queue buffer");
                    self.stats.errored();
                },
            },
            Packet::Tags(tags) => self.session.merge_tags(&tags),
            Packet::Binary { .. } => {
                tracing::debug!(pin = %slot.name, "Ignoring binary packet on media input");
                self.stats.discarded();
            },
        }
        self.stats.maybe_send();
    }

    fn on_pin_message(&mut self, msg: PinManagementMessage) {
        match msg {
            PinManagementMessage::RequestAddInputPin { suggested_name, response_tx } => {
                let result = self.request_pin(suggested_name);
                if let Err(e) = &result {
                    tracing::warn!(error = %e, "Refused input pin request");
                }
                let _ = response_tx.send(result);
            },
            PinManagementMessage::AddedInputPin { pin, channel } => {
                if let Some(slot) = self.slots.iter_mut().find(|s| s.name == pin.name) {
                    if matches!(slot.input, SlotInput::Pending) {
                        slot.input = SlotInput::Open(channel);
                        tracing::info!(pin = %pin.name, "Activated input pin");
                    } else {
                        tracing::warn!(pin = %pin.name, "Input pin is already connected");
                    }
                } else if let Err(e) = self.attach(&pin.name, channel) {
                    tracing::warn!(pin = %pin.name, error = %e, "Cannot add input pin");
                }
            },
            PinManagementMessage::RemoveInputPin { pin_name } => self.remove_pin(&pin_name),
        }
    }

    fn request_pin(&mut self, suggested_name: Option<String>) -> Result<InputPin, MuxKitError> {
        let format = self.session.format();
        let kind = match suggested_name.as_deref() {
            Some(name) => pin_kind(name).ok_or_else(|| {
                MuxKitError::Configuration(format!("pin '{name}' must start with video or audio"))
            })?,
            None if carries(format, MediaKind::Audio) => MediaKind::Audio,
            None => MediaKind::Video,
        };
        if !carries(format, kind) {
            return Err(MuxKitError::Configuration(format!(
                "{} cannot carry {kind} streams",
                format.long_name
            )));
        }

        let name = match suggested_name {
            Some(name) if name != kind.pin_prefix() => name,
            _ => self.session.streams().default_name(kind),
        };
        let port = self.session.add_named_port(kind, &name)?;
        self.slots.push(InputSlot { name: name.clone(), port, input: SlotInput::Pending });
        tracing::info!(pin = %name, %kind, "Created input pin");
        Ok(media_pin(kind, name, PinCardinality::One))
    }

    fn remove_pin(&mut self, pin_name: &str) {
        let Some(idx) = self.slots.iter().position(|s| s.name == pin_name) else {
            tracing::debug!(pin = pin_name, "Remove for unknown input pin");
            return;
        };
        let port = self.slots[idx].port;
        match self.session.remove_port(port) {
            Ok(()) => {
                self.slots.remove(idx);
                tracing::info!(pin = pin_name, "Removed input pin");
            },
            Err(MuxError::AlreadyOpen) => {
                // The stream is already in the container; end it instead.
                self.slots[idx].input = SlotInput::Closed;
                if let Err(e) = self.session.mark_eos(port) {
                    tracing::warn!(error = %e, "Failed to end removed input");
                }
                tracing::info!(pin = pin_name, "Input pin removed while muxing, treating as EOS");
            },
            Err(e) => tracing::warn!(pin = pin_name, error = %e, "Failed to remove input pin"),
        }
    }

    fn reset(&mut self) {
        tracing::info!("Resetting muxer");
        self.session.reset();
        // Closed channels stay closed across runs.
        for slot in &self.slots {
            if matches!(slot.input, SlotInput::Closed) {
                let _ = self.session.mark_eos(slot.port);
            }
        }
        self.reported_write_errors = 0;
        self.sequence = 0;
        self.metrics.publish(TrailerEstimate::default(), 0);
    }
}
