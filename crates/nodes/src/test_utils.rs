// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Test utilities for node testing

use crate::containers::avmux::backend::{
    BackendError, MuxOptions, MuxPacket, MuxSink, MuxerBackend, OpenFlags,
};
use crate::containers::avmux::formats::BackendFactory;
use bytes::Bytes;
use muxkit_core::control::NodeControlMessage;
use muxkit_core::node::{NodeContext, OutputRouting, OutputSender, RoutedPacketMessage};
use muxkit_core::pins::PinManagementMessage;
use muxkit_core::state::NodeStateUpdate;
use muxkit_core::types::{Caps, Fraction, MediaBuffer, Packet, TagList};
use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;

/// Channels a test keeps to drive a node from the outside.
pub struct TestHandles {
    pub control_tx: mpsc::Sender<NodeControlMessage>,
    pub pin_mgmt_tx: mpsc::Sender<PinManagementMessage>,
}

/// Creates a test NodeContext with mock channels
#[allow(clippy::implicit_hasher)]
pub fn create_test_context(
    inputs: HashMap<String, mpsc::Receiver<Packet>>,
) -> (NodeContext, MockOutputSender, mpsc::Receiver<NodeStateUpdate>) {
    // Dropping the handles closes control and pin management, so nodes only
    // react to their inputs.
    let (context, sender, state_rx, _handles) = create_test_context_with_handles(inputs);
    (context, sender, state_rx)
}

/// Like [`create_test_context`] but keeps the control and pin management senders.
#[allow(clippy::implicit_hasher)]
pub fn create_test_context_with_handles(
    inputs: HashMap<String, mpsc::Receiver<Packet>>,
) -> (NodeContext, MockOutputSender, mpsc::Receiver<NodeStateUpdate>, TestHandles) {
    let (control_tx, control_rx) = mpsc::channel(10);
    let (state_tx, state_rx) = mpsc::channel(32);
    let (stats_tx, _stats_rx) = mpsc::channel(10);
    let (pin_mgmt_tx, pin_mgmt_rx) = mpsc::channel(10);

    let mock_sender = MockOutputSender::new();
    let output_sender = mock_sender.to_output_sender("test_node".to_string());

    let context = NodeContext {
        inputs,
        control_rx,
        output_sender,
        state_tx,
        stats_tx: Some(stats_tx),
        cancellation_token: None,
        pin_management_rx: Some(pin_mgmt_rx),
    };

    (context, mock_sender, state_rx, TestHandles { control_tx, pin_mgmt_tx })
}

/// Mock OutputSender that captures sent packets via a channel.
/// Uses the same RoutedPacketMessage type as the real implementation for consistency.
#[derive(Clone)]
pub struct MockOutputSender {
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<RoutedPacketMessage>>>,
    sender: mpsc::Sender<RoutedPacketMessage>,
}

impl Default for MockOutputSender {
    fn default() -> Self {
        let (sender, receiver) = mpsc::channel(1000);
        Self { receiver: Arc::new(tokio::sync::Mutex::new(receiver)), sender }
    }
}

impl MockOutputSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an OutputSender from this mock
    pub fn to_output_sender(&self, node_name: String) -> OutputSender {
        OutputSender::new(node_name, OutputRouting::Routed(self.sender.clone()))
    }

    /// Receive a single packet (non-blocking).
    pub async fn try_recv(&self) -> Option<(String, String, Packet)> {
        let mut receiver = self.receiver.lock().await;
        receiver
            .try_recv()
            .ok()
            .map(|(node, pin, packet)| (node.to_string(), pin.to_string(), packet))
    }

    /// Receive packets with timeout.
    pub async fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> Option<(String, String, Packet)> {
        let mut receiver = self.receiver.lock().await;
        tokio::time::timeout(timeout, receiver.recv())
            .await
            .ok()
            .flatten()
            .map(|(node, pin, packet)| (node.to_string(), pin.to_string(), packet))
    }

    /// Collect all available packets.
    pub async fn collect_packets(&self) -> Vec<(String, String, Packet)> {
        let mut packets = Vec::new();
        while let Some(packet) = self.try_recv().await {
            packets.push(packet);
        }
        packets
    }

    /// Get all packets sent to a specific output pin
    pub async fn get_packets_for_pin(&self, pin_name: &str) -> Vec<Packet> {
        self.collect_packets()
            .await
            .into_iter()
            .filter(|(_, pin, _)| pin == pin_name)
            .map(|(_, _, packet)| packet)
            .collect()
    }
}

/// Helper to create a caps packet
pub fn create_test_caps_packet(caps: Caps) -> Packet {
    Packet::Caps(Arc::new(caps))
}

/// Helper to create a timed media packet; `delta` marks non-keyframes.
pub fn create_test_media_packet(data: &[u8], pts_ns: u64, delta: bool) -> Packet {
    Packet::Media(MediaBuffer::new(data.to_vec()).with_pts(pts_ns).delta(delta))
}

pub fn create_test_tags_packet(tags: TagList) -> Packet {
    Packet::Tags(Arc::new(tags))
}

/// Concatenates the payloads of binary packets.
pub fn concat_binary(packets: &[Packet]) -> Vec<u8> {
    let mut out = Vec::new();
    for p in packets {
        if let Packet::Binary { data, .. } = p {
            out.extend_from_slice(data);
        }
    }
    out
}

/// Helper to assert that a state update was received and matches the expected state type
///
/// # Panics
///
/// Panics if the state update is not received within the timeout or if the state does not match the expected state.
#[allow(clippy::expect_used)]
pub async fn assert_state_update(
    state_rx: &mut mpsc::Receiver<NodeStateUpdate>,
    expected_state_matcher: impl Fn(&muxkit_core::NodeState) -> bool,
    description: &str,
) {
    let update = tokio::time::timeout(std::time::Duration::from_secs(20), state_rx.recv())
        .await
        .expect("Timeout waiting for state update")
        .expect("State channel closed");

    assert!(
        expected_state_matcher(&update.state),
        "Unexpected state update: {:?}. Expected: {}",
        update.state,
        description
    );
}

pub async fn assert_state_initializing(state_rx: &mut mpsc::Receiver<NodeStateUpdate>) {
    assert_state_update(
        state_rx,
        |s| matches!(s, muxkit_core::NodeState::Initializing),
        "Initializing",
    )
    .await;
}

pub async fn assert_state_running(state_rx: &mut mpsc::Receiver<NodeStateUpdate>) {
    assert_state_update(state_rx, |s| matches!(s, muxkit_core::NodeState::Running), "Running")
        .await;
}

pub async fn assert_state_stopped(state_rx: &mut mpsc::Receiver<NodeStateUpdate>) {
    assert_state_update(
        state_rx,
        |s| matches!(s, muxkit_core::NodeState::Stopped { .. }),
        "Stopped",
    )
    .await;
}

pub async fn assert_state_failed(state_rx: &mut mpsc::Receiver<NodeStateUpdate>) {
    assert_state_update(
        state_rx,
        |s| matches!(s, muxkit_core::NodeState::Failed { .. }),
        "Failed",
    )
    .await;
}

/// One call observed by [`RecordingBackend`].
#[derive(Debug, Clone, PartialEq)]
pub enum BackendCall {
    Open(OpenFlags),
    SetParameters(MuxOptions),
    WriteHeader,
    WritePacket(MuxPacket),
    WriteTrailer,
    Flush,
    Close,
}

#[derive(Default)]
struct RecordingState {
    calls: Vec<BackendCall>,
    sink: Option<MuxSink>,
}

/// Backend double that records every call and writes marker bytes
/// (`HDR`, the packet payload, `END`) into the sink.
#[derive(Clone, Default)]
pub struct RecordingBackend {
    state: Arc<Mutex<RecordingState>>,
    fail_open: bool,
    fail_parameters: bool,
    fail_header: bool,
    fail_packets: bool,
    time_base: Option<Fraction>,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn fail_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    #[must_use]
    pub const fn fail_parameters(mut self) -> Self {
        self.fail_parameters = true;
        self
    }

    #[must_use]
    pub const fn fail_header(mut self) -> Self {
        self.fail_header = true;
        self
    }

    #[must_use]
    pub const fn fail_packets(mut self) -> Self {
        self.fail_packets = true;
        self
    }

    #[must_use]
    pub const fn with_time_base(mut self, tb: Fraction) -> Self {
        self.time_base = Some(tb);
        self
    }

    /// Factory handing out clones that share this recorder.
    pub fn factory(&self) -> BackendFactory {
        let backend = self.clone();
        Arc::new(move || Box::new(backend.clone()) as Box<dyn MuxerBackend>)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RecordingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, call: BackendCall) {
        self.lock().calls.push(call);
    }

    fn emit(&self, bytes: &[u8]) -> Result<(), BackendError> {
        let mut sink = self.lock().sink.clone().ok_or(BackendError::NotOpen)?;
        sink.write_all(bytes)?;
        Ok(())
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.lock().calls.clone()
    }

    pub fn packets(&self) -> Vec<MuxPacket> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                BackendCall::WritePacket(p) => Some(p),
                _ => None,
            })
            .collect()
    }

    /// The most recent `set_parameters` options.
    pub fn parameters(&self) -> Option<MuxOptions> {
        self.calls().into_iter().rev().find_map(|c| match c {
            BackendCall::SetParameters(o) => Some(o),
            _ => None,
        })
    }
}

impl MuxerBackend for RecordingBackend {
    fn open(&mut self, sink: MuxSink, flags: OpenFlags) -> Result<(), BackendError> {
        self.record(BackendCall::Open(flags));
        if self.fail_open {
            return Err(BackendError::Library("open refused".into()));
        }
        self.lock().sink = Some(sink);
        Ok(())
    }

    fn set_parameters(&mut self, options: &MuxOptions) -> Result<(), BackendError> {
        self.record(BackendCall::SetParameters(options.clone()));
        if self.fail_parameters {
            return Err(BackendError::Unsupported("parameters refused".into()));
        }
        Ok(())
    }

    fn write_header(&mut self) -> Result<(), BackendError> {
        self.record(BackendCall::WriteHeader);
        if self.fail_header {
            return Err(BackendError::Library("header refused".into()));
        }
        self.emit(b"HDR")
    }

    fn write_packet(&mut self, packet: &MuxPacket) -> Result<(), BackendError> {
        self.record(BackendCall::WritePacket(packet.clone()));
        if self.fail_packets {
            return Err(BackendError::Library("packet refused".into()));
        }
        self.emit(&packet.data)
    }

    fn write_trailer(&mut self) -> Result<(), BackendError> {
        self.record(BackendCall::WriteTrailer);
        self.emit(b"END")
    }

    fn flush(&mut self) -> Result<(), BackendError> {
        self.record(BackendCall::Flush);
        Ok(())
    }

    fn close(&mut self) {
        self.record(BackendCall::Close);
        self.lock().sink = None;
    }

    fn time_base(&self, _stream_index: usize) -> Fraction {
        self.time_base.unwrap_or(Fraction::new(1, 1_000_000_000))
    }
}

/// Payload bytes with a recognizable prefix, handy for asserting output order.
pub fn marker(tag: u8, n: u8) -> Bytes {
    Bytes::from(vec![tag, n])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[allow(clippy::unwrap_used)]
    fn recording_backend_writes_markers() {
        let sink = MuxSink::new();
        let mut backend = RecordingBackend::new();
        backend.open(sink.clone(), OpenFlags::default()).unwrap();
        backend.write_header().unwrap();
        backend
            .write_packet(&MuxPacket {
                stream_index: 0,
                pts: Some(1),
                dts: Some(1),
                duration: None,
                keyframe: true,
                data: marker(b'a', 1),
            })
            .unwrap();
        backend.write_trailer().unwrap();
        assert_eq!(sink.take_data().unwrap().as_ref(), b"HDRa\x01END");
        assert_eq!(backend.packets().len(), 1);
    }

    #[test]
    fn concat_skips_non_binary() {
        let packets = vec![
            Packet::Binary { data: Bytes::from_static(b"ab"), content_type: None, metadata: None },
            create_test_tags_packet(TagList::default()),
            Packet::Binary { data: Bytes::from_static(b"c"), content_type: None, metadata: None },
        ];
        assert_eq!(concat_binary(&packets), b"abc");
    }
}
