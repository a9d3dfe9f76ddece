// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Online trailer size prediction.
//!
//! Box-based containers write their sample index tables (`stts`, `stss`,
//! `stsz`, `stco`, ...) after the media data. The estimator models how those
//! tables grow from the per-stream counters the scheduler keeps, so observers
//! can reserve room for the trailer without asking the muxer. Every constant
//! is a fixed byte cost of a known box or table entry; the result is
//! approximate and may drift from what the library actually writes.

use super::codec::CodecId;
use muxkit_core::types::MediaKind;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// Table entry sizes.
const VIDEO_STTS_ENTRY: u64 = 8;
const VIDEO_STSS_ENTRY: u64 = 4;
const VIDEO_STSZ_ENTRY: u64 = 4;
const VIDEO_STCO_ENTRY: u64 = 4;
const AUDIO_STTS_ENTRY: u64 = 8;
const AUDIO_STSZ_ENTRY: u64 = 4;
const AUDIO_STCO_ENTRY: u64 = 4;

// Simple family: ftyp + free + moov + mvhd + udta, then one trak per stream.
const SIMPLE_HEADER_AUDIO_ONLY: u64 = 248;
const SIMPLE_HEADER_VIDEO: u64 = 240;
const SIMPLE_HEADER_VIDEO_H263: u64 = 236;
const SIMPLE_VIDEO_TRAK: u64 = 489;
const SIMPLE_VIDEO_TRAK_H263: u64 = 470;
const SIMPLE_AUDIO_TRAK: u64 = 432;
const SIMPLE_AUDIO_TRAK_AMR: u64 = 410;

// Extended family.
const EXT_HEADER_MP4: u64 = 378;
const EXT_HEADER_3GP: u64 = 290;
const EXT_LOCATION_INFO: u64 = 106;
const EXT_VIDEO_TRAK: u64 = 305;
const EXT_VIDEO_STSD_H263: u64 = 102;
const EXT_VIDEO_STSD_MPEG4: u64 = 146;
const EXT_VIDEO_LEGACY: u64 = SIMPLE_HEADER_VIDEO + SIMPLE_VIDEO_TRAK;
const EXT_VIDEO_SAMPLE_TABLES: u64 = 84;
const EXT_AUDIO_TRAK: u64 = 253;
const EXT_AUDIO_STSD_AMR: u64 = 69;
const EXT_AUDIO_STSD_AAC: u64 = 106;
const EXT_AUDIO_SAMPLE_TABLES: u64 = 68;
const EXT_STSC: u64 = 12;
const ADTS_HEADER: u64 = 8;
const ADTS_FRAME: u64 = 7;
const AMR_HEADER: u64 = 6;

/// Output profile within the extended family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ExtendedProfile {
    #[default]
    Mp4,
    #[serde(rename = "3gp")]
    ThreeGp,
    Adts,
    Amr,
}

/// Which container model to apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TrailerFamily {
    /// Codec-agnostic model with a shared header and one trak per stream.
    #[default]
    Simple,
    /// Model with per-codec sample description sizes.
    Extended { profile: ExtendedProfile },
}

/// Per-stream inputs to the estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamCounters {
    pub kind: MediaKind,
    pub codec: CodecId,
    pub frames: u64,
    pub keyframes: u64,
    pub duration_changes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrailerEstimate {
    pub expected_trailer_size: u64,
    pub video_frames: u64,
    pub audio_frames: u64,
}

/// Computes the trailer estimate for `streams` under `family`.
pub fn estimate(family: TrailerFamily, streams: &[StreamCounters]) -> TrailerEstimate {
    let video: Vec<&StreamCounters> =
        streams.iter().filter(|s| s.kind == MediaKind::Video).collect();
    let audio: Vec<&StreamCounters> =
        streams.iter().filter(|s| s.kind == MediaKind::Audio).collect();

    let size = match family {
        TrailerFamily::Simple => simple_size(&video, &audio),
        TrailerFamily::Extended { profile } => extended_size(profile, &video, &audio),
    };

    TrailerEstimate {
        expected_trailer_size: size,
        video_frames: video.iter().map(|s| s.frames).sum(),
        audio_frames: audio.iter().map(|s| s.frames).sum(),
    }
}

fn simple_size(video: &[&StreamCounters], audio: &[&StreamCounters]) -> u64 {
    let mut size = if video.is_empty() {
        SIMPLE_HEADER_AUDIO_ONLY
    } else if video.iter().all(|s| s.codec == CodecId::H263) {
        SIMPLE_HEADER_VIDEO_H263
    } else {
        SIMPLE_HEADER_VIDEO
    };

    for s in video {
        let trak =
            if s.codec == CodecId::H263 { SIMPLE_VIDEO_TRAK_H263 } else { SIMPLE_VIDEO_TRAK };
        size = size
            .saturating_add(trak)
            .saturating_add(VIDEO_STTS_ENTRY.saturating_mul(s.duration_changes))
            .saturating_add(VIDEO_STSS_ENTRY.saturating_mul(s.keyframes))
            .saturating_add((VIDEO_STSZ_ENTRY + VIDEO_STCO_ENTRY).saturating_mul(s.frames));
    }

    for s in audio {
        // AMR frames are fixed-size, so stsz has no per-sample entries.
        let (trak, per_frame) = if s.codec == CodecId::AmrNb {
            (SIMPLE_AUDIO_TRAK_AMR, AUDIO_STCO_ENTRY)
        } else {
            (SIMPLE_AUDIO_TRAK, AUDIO_STSZ_ENTRY + AUDIO_STCO_ENTRY)
        };
        size = size.saturating_add(trak).saturating_add(per_frame.saturating_mul(s.frames));
    }

    size
}

fn extended_size(
    profile: ExtendedProfile,
    video: &[&StreamCounters],
    audio: &[&StreamCounters],
) -> u64 {
    if profile == ExtendedProfile::Amr && !audio.is_empty() {
        return AMR_HEADER;
    }

    // Amr without audio keeps the 3gp box layout.
    let mut size = match profile {
        ExtendedProfile::Mp4 => EXT_HEADER_MP4,
        ExtendedProfile::ThreeGp | ExtendedProfile::Amr => EXT_HEADER_3GP,
        ExtendedProfile::Adts => 0,
    };

    for s in video {
        let fixed = match s.codec {
            CodecId::H263 | CodecId::H263p => EXT_VIDEO_TRAK + EXT_VIDEO_STSD_H263,
            CodecId::Mpeg4 => EXT_VIDEO_TRAK + EXT_VIDEO_STSD_MPEG4,
            _ => EXT_VIDEO_LEGACY,
        };
        size = size
            .saturating_add(fixed)
            .saturating_add(EXT_VIDEO_SAMPLE_TABLES)
            .saturating_add(VIDEO_STTS_ENTRY.saturating_mul(s.duration_changes))
            .saturating_add(VIDEO_STSS_ENTRY.saturating_mul(s.keyframes))
            .saturating_add(EXT_STSC)
            .saturating_add((VIDEO_STSZ_ENTRY + VIDEO_STCO_ENTRY).saturating_mul(s.frames));
    }

    if audio.is_empty() {
        return size;
    }

    if profile == ExtendedProfile::Adts {
        let frames: u64 = audio.iter().map(|s| s.frames).sum();
        return size.saturating_add(ADTS_HEADER).saturating_add(ADTS_FRAME.saturating_mul(frames));
    }

    // Audio-only files carry no location box.
    if video.is_empty() {
        size = size.saturating_sub(EXT_LOCATION_INFO);
    }

    for s in audio {
        let (stsd, per_frame) = if s.codec == CodecId::AmrNb {
            (EXT_AUDIO_STSD_AMR, AUDIO_STCO_ENTRY)
        } else {
            (EXT_AUDIO_STSD_AAC, AUDIO_STSZ_ENTRY + AUDIO_STCO_ENTRY)
        };
        size = size
            .saturating_add(EXT_AUDIO_TRAK + stsd)
            .saturating_add(EXT_AUDIO_SAMPLE_TABLES)
            .saturating_add(AUDIO_STTS_ENTRY.saturating_mul(s.duration_changes))
            .saturating_add(EXT_STSC)
            .saturating_add(per_frame.saturating_mul(s.frames));
    }

    size
}

/// Caches the most recent estimate for one session.
#[derive(Debug, Clone, Default)]
pub struct TrailerSizeEstimator {
    family: TrailerFamily,
    last: TrailerEstimate,
}

impl TrailerSizeEstimator {
    pub fn new(family: TrailerFamily) -> Self {
        Self { family, last: TrailerEstimate::default() }
    }

    pub const fn family(&self) -> TrailerFamily {
        self.family
    }

    /// Recomputes the estimate and returns the expected trailer size.
    pub fn update(&mut self, streams: &[StreamCounters]) -> u64 {
        self.last = estimate(self.family, streams);
        self.last.expected_trailer_size
    }

    pub const fn last(&self) -> TrailerEstimate {
        self.last
    }

    pub fn clear(&mut self) {
        self.last = TrailerEstimate::default();
    }
}
