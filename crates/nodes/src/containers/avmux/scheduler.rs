// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Collects buffers from every input and feeds them to the backend in
//! timestamp order.
//!
//! A [`MuxSession`] only makes a decision once each port either holds a
//! buffer or has reached end-of-stream, so "no data" is never mistaken for
//! "no more data". Each [`MuxSession::collect`] call performs at most one
//! dispatch (plus the open or close that may surround it) and never blocks.

use super::backend::{
    rescale_ns, MuxOptions, MuxPacket, MuxSink, MuxerBackend, OpenFlags, StreamParameters,
};
use super::codec::{CodecId, CodecMapper, CodecParameters};
use super::error::MuxError;
use super::estimator::{StreamCounters, TrailerEstimate, TrailerFamily, TrailerSizeEstimator};
use super::formats::{FormatDescriptor, TimestampMode};
use super::negotiation::NegotiationGate;
use super::port::PortId;
use super::streams::{PortGuard, StreamRegistry};
use bytes::Bytes;
use muxkit_core::types::{Caps, Fraction, MediaBuffer, MediaKind, TagList, SECOND_NS};
use std::sync::Arc;

const NS_PER_MS: u64 = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Negotiating,
    Opening,
    Streaming,
    Closing,
    Closed,
}

/// Result of one [`MuxSession::collect`] step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectOutcome {
    /// Some input has neither a buffer nor end-of-stream yet.
    NeedData,
    /// Every input is ready but at least one has no codec.
    AwaitingNegotiation,
    /// One buffer was handed to the backend.
    Dispatched,
    /// Trailer written (or the session already closed).
    Finished,
}

/// Bytes produced by the backend since the previous drain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxOutput {
    pub data: Bytes,
    /// First bytes of the run, needed by every consumer before anything else.
    pub stream_header: bool,
}

/// Session-wide options fixed at construction.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub preload_us: u64,
    pub max_delay_us: u64,
    /// Overrides the format's default trailer model.
    pub trailer_family: Option<TrailerFamily>,
    /// Tags applied on every run, before in-band tags.
    pub tags: TagList,
}

pub struct MuxSession {
    format: Arc<FormatDescriptor>,
    gate: NegotiationGate,
    streams: StreamRegistry,
    backend: Box<dyn MuxerBackend>,
    sink: MuxSink,
    state: SessionState,
    backend_open: bool,

    options: SessionOptions,
    tags: TagList,
    estimator: TrailerSizeEstimator,
    write_errors: u64,

    /// Port for each stream index, filled at open.
    stream_table: Vec<PortId>,
    time_bases: Vec<Fraction>,
    /// Header drained at open, handed out before any packet bytes.
    pending_header: Option<Bytes>,
    stream_header: Option<Bytes>,
}

impl MuxSession {
    pub fn new(
        format: Arc<FormatDescriptor>,
        mapper: Arc<dyn CodecMapper>,
        options: SessionOptions,
    ) -> Self {
        let family = options.trailer_family.unwrap_or(format.trailer_family);
        Self {
            gate: NegotiationGate::new(mapper, format.clone()),
            backend: format.create_backend(),
            format,
            streams: StreamRegistry::new(),
            sink: MuxSink::new(),
            state: SessionState::Idle,
            backend_open: false,
            tags: options.tags.clone(),
            options,
            estimator: TrailerSizeEstimator::new(family),
            write_errors: 0,
            stream_table: Vec::new(),
            time_bases: Vec::new(),
            pending_header: None,
            stream_header: None,
        }
    }

    pub const fn state(&self) -> SessionState {
        self.state
    }

    pub const fn streams(&self) -> &StreamRegistry {
        &self.streams
    }

    pub fn format(&self) -> &FormatDescriptor {
        &self.format
    }

    pub const fn estimate(&self) -> TrailerEstimate {
        self.estimator.last()
    }

    /// Per-packet write failures swallowed during this run.
    pub const fn write_errors(&self) -> u64 {
        self.write_errors
    }

    pub const fn tags(&self) -> &TagList {
        &self.tags
    }

    /// Header bytes of the current run, once produced.
    pub const fn stream_header(&self) -> Option<&Bytes> {
        self.stream_header.as_ref()
    }

    /// Content type including the codecs negotiated so far.
    pub fn content_type(&self) -> String {
        let codecs: Vec<CodecId> =
            self.streams.iter().filter_map(|p| p.codec().map(|c| c.codec)).collect();
        self.format.content_type_for(&codecs)
    }

    /// # Errors
    ///
    /// [`MuxError::AlreadyOpen`] once the muxer has been opened.
    pub fn add_port(&mut self, kind: MediaKind) -> Result<PortId, MuxError> {
        self.streams.add_port(kind)
    }

    /// # Errors
    ///
    /// [`MuxError::AlreadyOpen`] once the muxer has been opened,
    /// [`MuxError::DuplicatePort`] if `name` is taken.
    pub fn add_named_port(&mut self, kind: MediaKind, name: &str) -> Result<PortId, MuxError> {
        self.streams.add_named_port(kind, name)
    }

    /// # Errors
    ///
    /// [`MuxError::UnknownPort`] or [`MuxError::AlreadyOpen`] while muxing.
    pub fn remove_port(&mut self, id: PortId) -> Result<(), MuxError> {
        self.streams.remove_port(id)
    }

    /// # Errors
    ///
    /// See [`NegotiationGate::negotiate`].
    pub fn negotiate(&mut self, id: PortId, caps: &Caps) -> Result<(), MuxError> {
        self.gate.negotiate(&mut self.streams, id, caps)
    }

    pub fn all_negotiated(&self) -> bool {
        NegotiationGate::all_negotiated(&self.streams)
    }

    /// Queues a buffer on `id`. Returns `false` if the port already saw EOS.
    ///
    /// # Errors
    ///
    /// [`MuxError::UnknownPort`] for stale ids.
    pub fn push(&mut self, id: PortId, buffer: MediaBuffer) -> Result<bool, MuxError> {
        let port = self.streams.get_mut(id).ok_or(MuxError::UnknownPort(id))?;
        Ok(port.push(buffer))
    }

    /// # Errors
    ///
    /// [`MuxError::UnknownPort`] for stale ids.
    pub fn mark_eos(&mut self, id: PortId) -> Result<(), MuxError> {
        let port = self.streams.get_mut(id).ok_or(MuxError::UnknownPort(id))?;
        port.mark_eos();
        tracing::debug!(port = port.name(), queued = port.queued(), "Input reached end of stream");
        Ok(())
    }

    pub fn merge_tags(&mut self, tags: &TagList) {
        self.tags.merge(tags);
        if self.backend_open {
            tracing::debug!("Tags arrived after the header was written, keeping for the next run");
        }
    }

    /// Drains container bytes written since the last call. The stream
    /// header always comes out on its own, ahead of any packet bytes.
    pub fn take_output(&mut self) -> Option<MuxOutput> {
        if let Some(data) = self.pending_header.take() {
            return Some(MuxOutput { data, stream_header: true });
        }
        let data = self.sink.take_data()?;
        Some(MuxOutput { data, stream_header: false })
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            tracing::trace!(from = ?self.state, to = ?state, "Mux session state change");
        }
        self.state = state;
        let guard = match state {
            SessionState::Idle | SessionState::Negotiating => PortGuard::Open,
            SessionState::Opening | SessionState::Streaming | SessionState::Closing => {
                PortGuard::Frozen
            },
            SessionState::Closed => PortGuard::Drained,
        };
        self.streams.set_guard(guard);
    }

    /// Advances the session by at most one dispatch.
    ///
    /// # Errors
    ///
    /// Fatal [`MuxError`]s only (`NotNegotiated`, `OpenFailed`, `InitFailed`,
    /// `HeaderWriteFailed`). The session is `Closed` afterwards and further
    /// calls return [`CollectOutcome::Finished`].
    pub fn collect(&mut self) -> Result<CollectOutcome, MuxError> {
        if matches!(self.state, SessionState::Closed) {
            return Ok(CollectOutcome::Finished);
        }
        if self.streams.is_empty() || self.streams.iter().any(|p| p.wants_data()) {
            return Ok(CollectOutcome::NeedData);
        }

        if matches!(self.state, SessionState::Idle | SessionState::Negotiating) {
            if !self.all_negotiated() {
                return self.await_negotiation();
            }
            self.open()?;
        }

        if self.state == SessionState::Closing {
            return Ok(self.finish());
        }
        Ok(self.dispatch())
    }

    fn await_negotiation(&mut self) -> Result<CollectOutcome, MuxError> {
        // An input at EOS can no longer deliver caps, queued data or not.
        let pending: Vec<_> = self.streams.iter().filter(|p| !p.is_negotiated()).collect();
        if pending.iter().all(|p| p.is_eos()) {
            let names = pending.iter().map(|p| p.name().to_string()).collect();
            self.set_state(SessionState::Closed);
            return Err(MuxError::NotNegotiated(names));
        }
        self.set_state(SessionState::Negotiating);
        Ok(CollectOutcome::AwaitingNegotiation)
    }

    fn stream_parameters(&mut self) -> Vec<StreamParameters> {
        let mut params = Vec::with_capacity(self.streams.len());
        for (index, port) in self.streams.iter_mut().enumerate() {
            port.set_stream_index(Some(index));
            let Some(codec) = port.codec().cloned() else { continue };

            if port.kind() == MediaKind::Audio && port.frame_size_hint == 0 {
                port.frame_size_hint = port
                    .peek()
                    .and_then(|b| audio_frame_size(&codec, b))
                    .unwrap_or(0);
            }

            params.push(StreamParameters {
                index,
                kind: port.kind(),
                name: port.name().to_string(),
                codec,
                bitrate: port.bitrate_hint(),
                frame_size: port.frame_size_hint(),
            });
        }
        params
    }

    fn open(&mut self) -> Result<(), MuxError> {
        self.set_state(SessionState::Opening);

        let streams = self.stream_parameters();
        self.stream_table = self.streams.ports().collect();
        let options = MuxOptions {
            preload_us: self.options.preload_us,
            max_delay_us: self.options.max_delay_us,
            tags: self.tags.clone(),
            streams,
        };

        let flags = OpenFlags { stream_header: self.format.stream_header };
        if let Err(e) = self.backend.open(self.sink.clone(), flags) {
            return Err(self.abort_open(MuxError::OpenFailed(e.to_string())));
        }
        self.backend_open = true;
        if let Err(e) = self.backend.set_parameters(&options) {
            return Err(self.abort_open(MuxError::InitFailed(e.to_string())));
        }
        if let Err(e) = self.backend.write_header() {
            return Err(self.abort_open(MuxError::HeaderWriteFailed(e.to_string())));
        }
        if let Err(e) = self.backend.flush() {
            tracing::warn!(error = %e, "Failed to flush container header");
        }

        self.time_bases = (0..self.stream_table.len()).map(|i| self.backend.time_base(i)).collect();
        if self.format.stream_header {
            self.stream_header = self.sink.take_data();
            self.pending_header.clone_from(&self.stream_header);
        }
        self.set_state(SessionState::Streaming);
        tracing::info!(
            format = self.format.id,
            streams = options.streams.len(),
            content_type = %self.content_type(),
            "Muxer opened"
        );
        Ok(())
    }

    fn abort_open(&mut self, err: MuxError) -> MuxError {
        tracing::error!(error = %err, "Muxer failed to open");
        self.close_backend();
        self.set_state(SessionState::Closed);
        err
    }

    /// Picks the next port to dispatch from: an untimed buffer wins at once,
    /// otherwise the lowest pts with ties going to the earlier port.
    fn pick(&self) -> Option<usize> {
        let mut best: Option<(usize, u64)> = None;
        for (pos, port) in self.streams.iter().enumerate() {
            let Some(buffer) = port.peek() else { continue };
            let Some(pts) = buffer.pts else { return Some(pos) };
            if best.is_none_or(|(_, b)| pts < b) {
                best = Some((pos, pts));
            }
        }
        best.map(|(pos, _)| pos)
    }

    fn dispatch(&mut self) -> CollectOutcome {
        let Some(pos) = self.pick() else {
            self.set_state(SessionState::Closing);
            return self.finish();
        };

        let mode = self.format.timestamp_mode;
        let repack = self.format.repack_rgb24;
        let Some(port) = self.streams.by_position_mut(pos) else {
            return CollectOutcome::NeedData;
        };
        let Some(buffer) = port.pop() else {
            return CollectOutcome::NeedData;
        };
        let Some(index) = port.stream_index() else {
            return CollectOutcome::NeedData;
        };
        let kind = port.kind();
        let tb = self.time_bases.get(index).copied().unwrap_or(Fraction::new(1, 1_000_000_000));

        let convert = |ns: u64| -> i64 {
            if mode == TimestampMode::VideoMilliseconds && kind == MediaKind::Video {
                i64::try_from(ns / NS_PER_MS).unwrap_or(i64::MAX)
            } else {
                rescale_ns(ns, tb)
            }
        };
        let pts = buffer.pts.map(convert);
        let duration = buffer.duration.map(convert);
        let keyframe = buffer.is_keyframe();
        port.record_dispatch(keyframe, pts, duration);

        let data = match port.codec() {
            Some(c) if repack && c.codec == CodecId::RawRgb24 => {
                repack_rgb24(&buffer.data, c.width, c.height)
            },
            _ => buffer.data,
        };
        tracing::trace!(
            port = port.name(),
            stream = index,
            ?pts,
            keyframe,
            bytes = data.len(),
            "Dispatching buffer"
        );

        let packet = MuxPacket { stream_index: index, pts, dts: pts, duration, keyframe, data };
        if let Err(e) = self.backend.write_packet(&packet) {
            self.write_errors += 1;
            tracing::warn!(stream = index, error = %e, "Failed to write packet, dropping it");
        }

        let counters: Vec<StreamCounters> =
            self.streams.iter().filter_map(super::port::StreamPort::counters).collect();
        self.estimator.update(&counters);
        CollectOutcome::Dispatched
    }

    fn finish(&mut self) -> CollectOutcome {
        if let Err(e) = self.backend.write_trailer() {
            tracing::warn!(error = %e, "Failed to write container trailer");
        }
        if let Err(e) = self.backend.flush() {
            tracing::warn!(error = %e, "Failed to flush container trailer");
        }
        self.close_backend();
        self.set_state(SessionState::Closed);

        let est = self.estimator.last();
        tracing::info!(
            video_frames = est.video_frames,
            audio_frames = est.audio_frames,
            expected_trailer_size = est.expected_trailer_size,
            write_errors = self.write_errors,
            "Muxer finished"
        );
        CollectOutcome::Finished
    }

    fn close_backend(&mut self) {
        if std::mem::take(&mut self.backend_open) {
            self.backend.close();
        }
    }

    /// Returns to `Idle` for a new run. Negotiated codecs are kept; queued
    /// buffers, EOS flags, counters, in-band tags and pending output are not.
    pub fn reset(&mut self) {
        if self.backend_open {
            tracing::debug!("Reset while muxing, closing without trailer");
        }
        self.close_backend();
        for port in self.streams.iter_mut() {
            port.reset_run();
        }
        self.sink.take_data();
        self.tags = self.options.tags.clone();
        self.estimator.clear();
        self.write_errors = 0;
        self.stream_table.clear();
        self.time_bases.clear();
        self.pending_header = None;
        self.stream_header = None;
        self.set_state(SessionState::Idle);
    }

    /// Force-closes for a node exit. Pending output is left for a final drain.
    pub fn shutdown(&mut self) {
        self.close_backend();
        let mut dropped = 0;
        for port in self.streams.iter_mut() {
            while port.pop().is_some() {
                dropped += 1;
            }
            port.mark_eos();
        }
        if dropped > 0 {
            tracing::debug!(dropped, "Discarded queued buffers on shutdown");
        }
        self.set_state(SessionState::Closed);
    }
}

/// Samples per frame from the first buffer's duration.
fn audio_frame_size(codec: &CodecParameters, buffer: &MediaBuffer) -> Option<u32> {
    let duration = buffer.duration?;
    let samples = u128::from(codec.sample_rate) * u128::from(duration) / u128::from(SECOND_NS);
    u32::try_from(samples).ok()
}

/// Drops the 4-byte row alignment some producers add to packed RGB.
fn repack_rgb24(data: &Bytes, width: u32, height: u32) -> Bytes {
    let row = width as usize * 3;
    let rows = height as usize;
    let stride = (row + 3) & !3;
    if row == stride || data.len() < stride * rows {
        return data.clone();
    }
    let mut out = Vec::with_capacity(row * rows);
    for chunk in data.chunks(stride).take(rows) {
        out.extend_from_slice(&chunk[..row]);
    }
    Bytes::from(out)
}
