// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! One muxer input: its queue, negotiated codec and dispatch accounting.

use super::codec::CodecParameters;
use super::estimator::StreamCounters;
use muxkit_core::types::{MediaBuffer, MediaKind};
use std::collections::VecDeque;

/// Video bitrate hint handed to the muxer when nothing better is known.
pub const DEFAULT_VIDEO_BITRATE: u32 = 64 * 1024;
/// Video frame size hint.
pub const DEFAULT_VIDEO_FRAME_SIZE: u32 = 1152;
pub const DEFAULT_AUDIO_BITRATE: u32 = 285 * 1024;

/// Stable handle for a port. Never reused while its registry lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PortId(pub(crate) u32);

impl PortId {
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for PortId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Per-run timing state, cleared on reset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortTiming {
    /// Timestamp of the first timed dispatch, in muxer units.
    pub start_time: Option<i64>,
    /// Span from `start_time` to the end of the last timed dispatch.
    pub duration: Option<i64>,
    /// Decode timestamp of the last timed dispatch.
    pub current_dts: Option<i64>,
}

pub struct StreamPort {
    id: PortId,
    kind: MediaKind,
    name: String,
    codec: Option<CodecParameters>,
    queue: VecDeque<MediaBuffer>,
    eos: bool,
    stream_index: Option<usize>,

    pub(crate) bitrate_hint: u32,
    pub(crate) frame_size_hint: u32,

    frame_count: u64,
    keyframe_count: u64,
    duration_change_count: u64,
    last_dts: Option<i64>,
    last_gap: Option<i64>,
    timing: PortTiming,
}

impl StreamPort {
    pub(crate) fn new(id: PortId, kind: MediaKind, name: String) -> Self {
        let (bitrate_hint, frame_size_hint) = match kind {
            MediaKind::Video => (DEFAULT_VIDEO_BITRATE, DEFAULT_VIDEO_FRAME_SIZE),
            MediaKind::Audio => (DEFAULT_AUDIO_BITRATE, 0),
        };
        Self {
            id,
            kind,
            name,
            codec: None,
            queue: VecDeque::new(),
            eos: false,
            stream_index: None,
            bitrate_hint,
            frame_size_hint,
            frame_count: 0,
            keyframe_count: 0,
            duration_change_count: 0,
            last_dts: None,
            last_gap: None,
            timing: PortTiming::default(),
        }
    }

    pub const fn id(&self) -> PortId {
        self.id
    }

    pub const fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn codec(&self) -> Option<&CodecParameters> {
        self.codec.as_ref()
    }

    pub const fn is_negotiated(&self) -> bool {
        self.codec.is_some()
    }

    /// Position in the muxer's stream table, assigned when the session opens.
    pub const fn stream_index(&self) -> Option<usize> {
        self.stream_index
    }

    pub const fn bitrate_hint(&self) -> u32 {
        self.bitrate_hint
    }

    pub const fn frame_size_hint(&self) -> u32 {
        self.frame_size_hint
    }

    pub const fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub const fn keyframe_count(&self) -> u64 {
        self.keyframe_count
    }

    pub const fn duration_change_count(&self) -> u64 {
        self.duration_change_count
    }

    pub const fn timing(&self) -> PortTiming {
        self.timing
    }

    pub const fn is_eos(&self) -> bool {
        self.eos
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn peek(&self) -> Option<&MediaBuffer> {
        self.queue.front()
    }

    /// Has an item or will never get one; either way the collector can decide.
    pub fn is_ready(&self) -> bool {
        self.eos || !self.queue.is_empty()
    }

    /// Needs more data from upstream before the collector can decide.
    pub fn wants_data(&self) -> bool {
        !self.eos && self.queue.is_empty()
    }

    pub(crate) fn set_codec(&mut self, codec: CodecParameters) {
        self.codec = Some(codec);
    }

    pub(crate) const fn set_stream_index(&mut self, index: Option<usize>) {
        self.stream_index = index;
    }

    /// Queues a buffer. Returns `false` (and drops it) once EOS was signalled.
    pub(crate) fn push(&mut self, buffer: MediaBuffer) -> bool {
        if self.eos {
            return false;
        }
        self.queue.push_back(buffer);
        true
    }

    pub(crate) const fn mark_eos(&mut self) {
        self.eos = true;
    }

    pub(crate) fn pop(&mut self) -> Option<MediaBuffer> {
        self.queue.pop_front()
    }

    /// Accounts for one dispatched item. `dts` is in muxer units, `None` when untimed.
    pub(crate) fn record_dispatch(&mut self, keyframe: bool, dts: Option<i64>, duration: Option<i64>) {
        self.frame_count += 1;
        if keyframe {
            self.keyframe_count += 1;
        }

        if self.frame_count == 1 {
            // The first sample always opens a run.
            self.duration_change_count += 1;
        }
        if let Some(dts) = dts {
            if let Some(prev) = self.last_dts {
                // The first gap always differs from "no gap yet".
                let gap = dts - prev;
                if self.last_gap != Some(gap) {
                    self.duration_change_count += 1;
                    self.last_gap = Some(gap);
                }
            }
            self.last_dts = Some(dts);

            let start = *self.timing.start_time.get_or_insert(dts);
            let end = dts + duration.unwrap_or(0);
            self.timing.duration = Some(end - start);
            self.timing.current_dts = Some(dts);
        }
    }

    pub(crate) fn counters(&self) -> Option<StreamCounters> {
        self.codec.as_ref().map(|c| StreamCounters {
            kind: self.kind,
            codec: c.codec,
            frames: self.frame_count,
            keyframes: self.keyframe_count,
            duration_changes: self.duration_change_count,
        })
    }

    /// Clears everything tied to one run. The negotiated codec survives.
    pub(crate) fn reset_run(&mut self) {
        self.queue.clear();
        self.eos = false;
        self.stream_index = None;
        self.frame_count = 0;
        self.keyframe_count = 0;
        self.duration_change_count = 0;
        self.last_dts = None;
        self.last_gap = None;
        self.timing = PortTiming::default();
        if self.kind == MediaKind::Audio && !self.codec.as_ref().is_some_and(|c| c.codec.is_pcm()) {
            self.frame_size_hint = 0;
        }
    }

    /// Drops queued data and the codec slot. Used when the port is removed.
    pub(crate) fn release(&mut self) -> usize {
        let dropped = self.queue.len();
        self.queue.clear();
        self.codec = None;
        dropped
    }
}

impl std::fmt::Debug for StreamPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamPort")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("codec", &self.codec.as_ref().map(|c| c.codec))
            .field("queued", &self.queue.len())
            .field("eos", &self.eos)
            .field("frames", &self.frame_count)
            .finish_non_exhaustive()
    }
}
