// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Node-level tests for the multi-stream muxer.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_macros)]

use super::codec::CodecId;
use super::estimator::TrailerFamily;
use super::formats::{CapsOverrides, FormatDescriptor, TimestampMode};
use super::node::{AvMuxerConfig, AvMuxerNode};
use crate::test_utils::{
    assert_state_failed, assert_state_initializing, assert_state_running, assert_state_stopped,
    assert_state_update, concat_binary, create_test_caps_packet, create_test_context,
    create_test_context_with_handles, create_test_media_packet, create_test_tags_packet, marker,
    BackendCall, RecordingBackend,
};
use muxkit_core::control::NodeControlMessage;
use muxkit_core::node::ProcessorNode;
use muxkit_core::pins::PinManagementMessage;
use muxkit_core::types::{Caps, MediaBuffer, Packet, TagList};
use muxkit_core::{MuxKitError, NodeRegistry, NodeState, PinCardinality};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

const MS: u64 = 1_000_000;

fn recording_format(backend: &RecordingBackend) -> Arc<FormatDescriptor> {
    Arc::new(FormatDescriptor {
        id: "rec",
        long_name: "Recording",
        content_type: "application/x-rec",
        video_codecs: vec![CodecId::Vp8, CodecId::H264],
        audio_codecs: vec![CodecId::Opus, CodecId::PcmS16le],
        overrides: CapsOverrides::default(),
        stream_header: true,
        repack_rgb24: false,
        timestamp_mode: TimestampMode::TimeBase,
        trailer_family: TrailerFamily::Simple,
        backend: backend.factory(),
    })
}

fn node(backend: &RecordingBackend) -> AvMuxerNode {
    AvMuxerNode::new(recording_format(backend), AvMuxerConfig::default()).unwrap()
}

fn vp8() -> Packet {
    create_test_caps_packet(Caps::video("video/x-vp8", 320, 240))
}

fn opus() -> Packet {
    create_test_caps_packet(Caps::audio("audio/x-opus", 48_000, 2))
}

fn media(tag: u8, n: u8, pts_ms: u64) -> Packet {
    Packet::Media(MediaBuffer::new(marker(tag, n)).with_pts(pts_ms * MS).with_duration(20 * MS))
}

/// Waits until the backend has seen `call`, failing after a few seconds.
async fn wait_for_call(backend: &RecordingBackend, call: &BackendCall) {
    for _ in 0..500 {
        if backend.calls().contains(call) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("backend never saw {call:?}");
}

#[tokio::test]
async fn test_avmux_interleaves_inputs_by_timestamp() {
    let backend = RecordingBackend::new();
    let (video_tx, video_rx) = mpsc::channel(10);
    let (audio_tx, audio_rx) = mpsc::channel(10);
    let mut inputs = HashMap::new();
    inputs.insert("audio_0".to_string(), audio_rx);
    inputs.insert("video_0".to_string(), video_rx);

    let (context, mock_sender, mut state_rx) = create_test_context(inputs);
    let node = node(&backend);
    let metrics = node.metrics();
    let handle = tokio::spawn(async move { Box::new(node).run(context).await });

    assert_state_initializing(&mut state_rx).await;
    assert_state_running(&mut state_rx).await;

    video_tx.send(vp8()).await.unwrap();
    video_tx.send(media(b'v', 0, 0)).await.unwrap();
    video_tx.send(media(b'v', 1, 40)).await.unwrap();
    audio_tx.send(opus()).await.unwrap();
    for (n, pts) in [(0, 0), (1, 20), (2, 40)] {
        audio_tx.send(media(b'a', n, pts)).await.unwrap();
    }
    drop(video_tx);
    drop(audio_tx);

    handle.await.unwrap().unwrap();
    assert_state_stopped(&mut state_rx).await;

    let packets = mock_sender.get_packets_for_pin("out").await;
    assert!(!packets.is_empty());
    let Packet::Binary { data, content_type, metadata } = &packets[0] else {
        panic!("expected binary output, got {:?}", packets[0]);
    };
    assert_eq!(data.as_ref(), b"HDR");
    assert!(metadata.as_ref().unwrap().stream_header);
    assert_eq!(content_type.as_deref(), Some("application/x-rec; codecs=\"vp8,opus\""));
    for p in &packets[1..] {
        let Packet::Binary { metadata, .. } = p else { panic!("expected binary output") };
        assert!(!metadata.as_ref().unwrap().stream_header);
    }

    // Video is port 0, so it wins the tie at 0ms and at 40ms.
    assert_eq!(concat_binary(&packets), b"HDRv\x00a\x00a\x01v\x01a\x02END".to_vec());

    let packets = backend.packets();
    assert_eq!(packets.len(), 5);
    assert!(packets.windows(2).all(|w| w[0].pts <= w[1].pts));
    assert_eq!(metrics.video_frames(), 2);
    assert_eq!(metrics.audio_frames(), 3);
    assert_eq!(metrics.write_errors(), 0);
    assert!(metrics.expected_trailer_size() > 0);
}

#[tokio::test]
async fn test_avmux_fails_when_an_input_never_negotiates() {
    let backend = RecordingBackend::new();
    let (video_tx, video_rx) = mpsc::channel(10);
    let (audio_tx, audio_rx) = mpsc::channel(10);
    let mut inputs = HashMap::new();
    inputs.insert("video_0".to_string(), video_rx);
    inputs.insert("audio_0".to_string(), audio_rx);

    let (context, mock_sender, mut state_rx) = create_test_context(inputs);
    let node = node(&backend);
    let handle = tokio::spawn(async move { Box::new(node).run(context).await });

    assert_state_initializing(&mut state_rx).await;
    assert_state_running(&mut state_rx).await;

    video_tx.send(vp8()).await.unwrap();
    video_tx.send(media(b'v', 0, 0)).await.unwrap();
    drop(audio_tx);

    let result = handle.await.unwrap();
    assert!(matches!(result, Err(MuxKitError::Negotiation(ref msg)) if msg.contains("audio_0")));
    assert_state_failed(&mut state_rx).await;

    assert!(backend.calls().is_empty(), "muxer must not open without every codec");
    assert!(mock_sender.get_packets_for_pin("out").await.is_empty());
    drop(video_tx);
}

#[tokio::test]
async fn test_avmux_rejected_caps_degrade_until_renegotiated() {
    let backend = RecordingBackend::new();
    let (audio_tx, audio_rx) = mpsc::channel(10);
    let mut inputs = HashMap::new();
    inputs.insert("audio_0".to_string(), audio_rx);

    let (context, mock_sender, mut state_rx) = create_test_context(inputs);
    let handle = tokio::spawn(async move { Box::new(node(&backend)).run(context).await });

    assert_state_initializing(&mut state_rx).await;
    assert_state_running(&mut state_rx).await;

    audio_tx.send(create_test_caps_packet(Caps::audio("audio/x-vorbis", 44_100, 2))).await.unwrap();
    assert_state_update(
        &mut state_rx,
        |s| matches!(s, NodeState::Degraded { reason, .. } if reason.contains("vorbis")),
        "Degraded",
    )
    .await;

    audio_tx.send(opus()).await.unwrap();
    assert_state_running(&mut state_rx).await;

    audio_tx.send(media(b'a', 0, 0)).await.unwrap();
    drop(audio_tx);
    handle.await.unwrap().unwrap();
    assert_state_stopped(&mut state_rx).await;

    let out = concat_binary(&mock_sender.get_packets_for_pin("out").await);
    assert_eq!(out, b"HDRa\x00END".to_vec());
}

#[tokio::test]
async fn test_avmux_counts_write_errors_without_failing() {
    let backend = RecordingBackend::new().fail_packets();
    let (audio_tx, audio_rx) = mpsc::channel(10);
    let mut inputs = HashMap::new();
    inputs.insert("audio_0".to_string(), audio_rx);

    let (context, _mock_sender, mut state_rx) = create_test_context(inputs);
    let node = node(&backend);
    let metrics = node.metrics();
    let handle = tokio::spawn(async move { Box::new(node).run(context).await });

    audio_tx.send(opus()).await.unwrap();
    audio_tx.send(media(b'a', 0, 0)).await.unwrap();
    audio_tx.send(media(b'a', 1, 20)).await.unwrap();
    drop(audio_tx);

    handle.await.unwrap().unwrap();
    assert_state_initializing(&mut state_rx).await;
    assert_state_running(&mut state_rx).await;
    assert_state_stopped(&mut state_rx).await;
    assert_eq!(metrics.write_errors(), 2);
    assert_eq!(metrics.audio_frames(), 2);
    assert!(backend.calls().contains(&BackendCall::WriteTrailer));
}

#[tokio::test]
async fn test_avmux_tags_reach_the_muxer() {
    let backend = RecordingBackend::new();
    let (audio_tx, audio_rx) = mpsc::channel(10);
    let mut inputs = HashMap::new();
    inputs.insert("audio_0".to_string(), audio_rx);

    let (context, _mock_sender, _state_rx) = create_test_context(inputs);
    let config = AvMuxerConfig {
        tags: TagList { title: Some("Configured".into()), ..Default::default() },
        ..Default::default()
    };
    let node = AvMuxerNode::new(recording_format(&backend), config).unwrap();
    let handle = tokio::spawn(async move { Box::new(node).run(context).await });

    audio_tx.send(opus()).await.unwrap();
    audio_tx
        .send(create_test_tags_packet(TagList { artist: Some("Live".into()), ..Default::default() }))
        .await
        .unwrap();
    audio_tx.send(media(b'a', 0, 0)).await.unwrap();
    drop(audio_tx);
    handle.await.unwrap().unwrap();

    let tags = backend.parameters().unwrap().tags;
    assert_eq!(tags.title.as_deref(), Some("Configured"));
    assert_eq!(tags.artist.as_deref(), Some("Live"));
}

#[tokio::test]
async fn test_avmux_shutdown_before_data() {
    let backend = RecordingBackend::new();
    let (_audio_tx, audio_rx) = mpsc::channel::<Packet>(10);
    let mut inputs = HashMap::new();
    inputs.insert("audio_0".to_string(), audio_rx);

    let (context, mock_sender, mut state_rx, handles) = create_test_context_with_handles(inputs);
    let handle = tokio::spawn(async move { Box::new(node(&backend)).run(context).await });

    assert_state_initializing(&mut state_rx).await;
    assert_state_running(&mut state_rx).await;
    handles.control_tx.send(NodeControlMessage::Shutdown).await.unwrap();

    handle.await.unwrap().unwrap();
    assert_state_update(
        &mut state_rx,
        |s| matches!(s, NodeState::Stopped { reason } if *reason == muxkit_core::StopReason::Shutdown),
        "Stopped(shutdown)",
    )
    .await;
    assert!(mock_sender.get_packets_for_pin("out").await.is_empty());
}

#[tokio::test]
async fn test_avmux_reset_starts_a_new_stream() {
    let backend = RecordingBackend::new();
    let (audio_tx, audio_rx) = mpsc::channel(10);
    let mut inputs = HashMap::new();
    inputs.insert("audio_0".to_string(), audio_rx);

    let (context, mock_sender, _state_rx, handles) = create_test_context_with_handles(inputs);
    let node = node(&backend);
    let handle = tokio::spawn(async move { Box::new(node).run(context).await });

    audio_tx.send(opus()).await.unwrap();
    audio_tx.send(media(b'a', 0, 0)).await.unwrap();
    let (_, _, header) = mock_sender.recv_timeout(Duration::from_secs(5)).await.expect("first header");
    let Packet::Binary { data, .. } = &header else { panic!("expected binary output") };
    assert_eq!(data.as_ref(), b"HDR");
    let (_, _, first) = mock_sender.recv_timeout(Duration::from_secs(5)).await.expect("first packet");
    let Packet::Binary { data, .. } = &first else { panic!("expected binary output") };
    assert_eq!(data.as_ref(), b"a\x00");

    handles.control_tx.send(NodeControlMessage::Reset).await.unwrap();
    wait_for_call(&backend, &BackendCall::Close).await;

    // The negotiated codec survives the reset, so data alone reopens the muxer.
    audio_tx.send(media(b'a', 1, 0)).await.unwrap();
    drop(audio_tx);
    handle.await.unwrap().unwrap();

    let calls = backend.calls();
    let headers = calls.iter().filter(|c| matches!(c, BackendCall::WriteHeader)).count();
    let trailers = calls.iter().filter(|c| matches!(c, BackendCall::WriteTrailer)).count();
    assert_eq!((headers, trailers), (2, 1));

    let rest = mock_sender.get_packets_for_pin("out").await;
    let Packet::Binary { data, metadata, .. } = &rest[0] else { panic!("expected binary output") };
    assert!(metadata.as_ref().unwrap().stream_header);
    assert_eq!(data.as_ref(), b"HDR");
    assert_eq!(concat_binary(&rest[1..]), b"a\x01END".to_vec());
}

#[tokio::test]
async fn test_avmux_dynamic_pins() {
    let backend = RecordingBackend::new();
    let (context, mock_sender, mut state_rx, handles) =
        create_test_context_with_handles(HashMap::new());
    let handle = tokio::spawn(async move { Box::new(node(&backend)).run(context).await });

    assert_state_initializing(&mut state_rx).await;
    assert_state_running(&mut state_rx).await;

    let (response_tx, response_rx) = oneshot::channel();
    handles
        .pin_mgmt_tx
        .send(PinManagementMessage::RequestAddInputPin { suggested_name: None, response_tx })
        .await
        .unwrap();
    let pin = response_rx.await.unwrap().unwrap();
    assert_eq!(pin.name, "audio_0");
    assert_eq!(pin.cardinality, PinCardinality::One);

    let (response_tx, response_rx) = oneshot::channel();
    handles
        .pin_mgmt_tx
        .send(PinManagementMessage::RequestAddInputPin {
            suggested_name: Some("subtitles".into()),
            response_tx,
        })
        .await
        .unwrap();
    assert!(matches!(response_rx.await.unwrap(), Err(MuxKitError::Configuration(_))));

    let (audio_tx, audio_rx) = mpsc::channel(10);
    handles
        .pin_mgmt_tx
        .send(PinManagementMessage::AddedInputPin { pin, channel: audio_rx })
        .await
        .unwrap();
    audio_tx.send(opus()).await.unwrap();
    audio_tx.send(media(b'a', 0, 0)).await.unwrap();
    mock_sender.recv_timeout(Duration::from_secs(5)).await.expect("header after first buffer");

    // Muxing has started, so the structure is frozen.
    let (response_tx, response_rx) = oneshot::channel();
    handles
        .pin_mgmt_tx
        .send(PinManagementMessage::RequestAddInputPin {
            suggested_name: Some("video_0".into()),
            response_tx,
        })
        .await
        .unwrap();
    assert!(matches!(response_rx.await.unwrap(), Err(MuxKitError::Runtime(_))));

    // Removing a live pin ends its stream, which finishes the file.
    handles
        .pin_mgmt_tx
        .send(PinManagementMessage::RemoveInputPin { pin_name: "audio_0".into() })
        .await
        .unwrap();
    handle.await.unwrap().unwrap();
    assert_state_stopped(&mut state_rx).await;

    let out = concat_binary(&mock_sender.get_packets_for_pin("out").await);
    assert_eq!(out, b"END".to_vec());
    drop(audio_tx);
}

#[tokio::test]
async fn test_avmux_removed_pin_before_open_is_forgotten() {
    let backend = RecordingBackend::new();
    let (video_tx, video_rx) = mpsc::channel::<Packet>(10);
    let (audio_tx, audio_rx) = mpsc::channel(10);
    let mut inputs = HashMap::new();
    inputs.insert("video_0".to_string(), video_rx);
    inputs.insert("audio_0".to_string(), audio_rx);

    let (context, _mock_sender, _state_rx, handles) = create_test_context_with_handles(inputs);
    let handle = tokio::spawn({
        let backend = backend.clone();
        async move { Box::new(node(&backend)).run(context).await }
    });

    handles
        .pin_mgmt_tx
        .send(PinManagementMessage::RemoveInputPin { pin_name: "video_0".into() })
        .await
        .unwrap();
    // Pin management and media are separate channels; give the removal a head start.
    tokio::time::sleep(Duration::from_millis(50)).await;

    audio_tx.send(opus()).await.unwrap();
    audio_tx.send(media(b'a', 0, 0)).await.unwrap();
    drop(audio_tx);
    handle.await.unwrap().unwrap();

    let params = backend.parameters().unwrap();
    assert_eq!(params.streams.len(), 1);
    assert_eq!(params.streams[0].name, "audio_0");
    assert_eq!(backend.packets()[0].stream_index, 0);
    drop(video_tx);
}

#[tokio::test]
async fn test_avmux_open_failure_is_fatal() {
    let backend = RecordingBackend::new().fail_header();
    let (audio_tx, audio_rx) = mpsc::channel(10);
    let mut inputs = HashMap::new();
    inputs.insert("audio_0".to_string(), audio_rx);

    let (context, _mock_sender, mut state_rx) = create_test_context(inputs);
    let handle = tokio::spawn({
        let backend = backend.clone();
        async move { Box::new(node(&backend)).run(context).await }
    });

    audio_tx.send(opus()).await.unwrap();
    audio_tx.send(create_test_media_packet(&[1, 2], 0, false)).await.unwrap();

    assert!(matches!(handle.await.unwrap(), Err(MuxKitError::Codec(_))));
    assert_state_initializing(&mut state_rx).await;
    assert_state_running(&mut state_rx).await;
    assert_state_failed(&mut state_rx).await;
    assert!(matches!(backend.calls().last(), Some(BackendCall::Close)));
}

#[test]
fn test_avmux_pins_follow_format_and_config() {
    let backend = RecordingBackend::new();
    let node = AvMuxerNode::new(
        recording_format(&backend),
        AvMuxerConfig { audio_inputs: Some(2), ..Default::default() },
    )
    .unwrap();
    let names: Vec<String> = node.input_pins().into_iter().map(|p| p.name).collect();
    assert_eq!(names, vec!["video_0", "video", "audio_0", "audio_1", "audio"]);
    let dynamic = &node.input_pins()[1];
    assert_eq!(dynamic.cardinality, PinCardinality::Dynamic { prefix: "video".into() });
    assert_eq!(node.output_pins()[0].name, "out");
    assert!(node.supports_dynamic_pins());
    assert_eq!(node.content_type().as_deref(), Some("application/x-rec"));

    let mut audio_only = (*recording_format(&backend)).clone();
    audio_only.video_codecs.clear();
    let audio_only = Arc::new(audio_only);
    let err = AvMuxerNode::new(
        audio_only.clone(),
        AvMuxerConfig { video_inputs: Some(1), ..Default::default() },
    );
    assert!(matches!(err, Err(MuxKitError::Configuration(_))));
    let node = AvMuxerNode::new(audio_only, AvMuxerConfig::default()).unwrap();
    assert!(node.input_pins().iter().all(|p| !p.name.starts_with("video")));
}

#[test]
fn test_avmux_registration() {
    let mut registry = NodeRegistry::new();
    crate::register_nodes(&mut registry);

    #[cfg(feature = "ogg")]
    {
        assert!(registry.contains("containers::avmux::ogg"));
        let bad = serde_json::json!({ "video_inputs": 1 });
        assert!(registry.create_node("containers::avmux::ogg", Some(&bad)).is_err());
        let node = registry.create_node("containers::avmux::ogg", None).unwrap();
        assert_eq!(node.content_type().as_deref(), Some("audio/ogg"));
    }
    #[cfg(feature = "webm")]
    assert!(registry.contains("containers::avmux::webm"));

    for def in registry.definitions() {
        assert!(def.kind.starts_with("containers::avmux::"));
        assert_eq!(def.categories[0], "containers");
        assert!(def.param_schema.get("properties").is_some());
        assert!(def.inputs.iter().any(|p| matches!(p.cardinality, PinCardinality::Dynamic { .. })));
    }
}

#[cfg(feature = "ogg")]
#[tokio::test]
async fn test_avmux_ogg_end_to_end() {
    use super::formats::FormatTable;
    use std::io::Cursor;

    let format = FormatTable::builtin().get("ogg").unwrap();
    let (audio_tx, audio_rx) = mpsc::channel(10);
    let mut inputs = HashMap::new();
    inputs.insert("audio_0".to_string(), audio_rx);

    let (context, mock_sender, mut state_rx) = create_test_context(inputs);
    let config = AvMuxerConfig {
        tags: TagList { title: Some("Muxed".into()), ..Default::default() },
        ..Default::default()
    };
    let node = AvMuxerNode::new(format, config).unwrap();
    let handle = tokio::spawn(async move { Box::new(node).run(context).await });

    audio_tx.send(opus()).await.unwrap();
    for i in 0..3u8 {
        let pts = u64::from(i) * 20 * MS;
        let buffer = MediaBuffer::new(vec![0xfc, i]).with_pts(pts).with_duration(20 * MS);
        audio_tx.send(Packet::Media(buffer)).await.unwrap();
    }
    drop(audio_tx);
    handle.await.unwrap().unwrap();
    assert_state_initializing(&mut state_rx).await;
    assert_state_running(&mut state_rx).await;
    assert_state_stopped(&mut state_rx).await;

    let packets = mock_sender.get_packets_for_pin("out").await;
    let Packet::Binary { data, content_type, metadata } = &packets[0] else {
        panic!("expected binary output");
    };
    assert!(metadata.as_ref().unwrap().stream_header);
    assert_eq!(content_type.as_deref(), Some("audio/ogg; codecs=\"opus\""));

    // The header holds the two header pages and nothing else.
    let mut header = ogg::PacketReader::new(Cursor::new(data.to_vec()));
    assert!(header.read_packet_expected().unwrap().data.starts_with(b"OpusHead"));
    assert!(header.read_packet_expected().unwrap().data.starts_with(b"OpusTags"));
    assert!(header.read_packet().unwrap().is_none());

    let bytes = concat_binary(&packets);
    assert_eq!(&bytes[..4], b"OggS");
    let mut reader = ogg::PacketReader::new(Cursor::new(bytes));
    assert!(reader.read_packet_expected().unwrap().data.starts_with(b"OpusHead"));
    let tags = reader.read_packet_expected().unwrap();
    assert!(String::from_utf8_lossy(&tags.data).contains("TITLE=Muxed"));
    let mut payloads = Vec::new();
    while let Some(p) = reader.read_packet().unwrap() {
        if !p.data.is_empty() {
            payloads.push((p.data[1], p.absgp_page()));
        }
    }
    assert_eq!(payloads, vec![(0, 960), (1, 1920), (2, 2880)]);
}
