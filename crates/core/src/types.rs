// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Core data types that flow through muxing pipelines.
//!
//! - [`Packet`]: What travels over a pin (caps, encoded media, tags, container bytes)
//! - [`Caps`]: Structured encoding description used during negotiation
//! - [`MediaBuffer`]: One timestamped unit of encoded media
//! - [`TagList`]: Global metadata forwarded to the container
//! - [`PacketType`]: Type system for pre-flight pipeline validation

use bytes::Bytes;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::sync::Arc;
use ts_rs::TS;

/// Nanoseconds per second, the unit of [`MediaBuffer`] timestamps.
pub const SECOND_NS: u64 = 1_000_000_000;

/// The two kinds of elementary stream a muxer input can carry.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, TS,
)]
#[ts(export)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Audio,
}

impl MediaKind {
    /// Prefix used for default pin names (`video_0`, `audio_3`, ...).
    pub const fn pin_prefix(self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Audio => "audio",
        }
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.pin_prefix())
    }
}

/// A rational number (frame rates, aspect ratios).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, TS)]
#[ts(export)]
pub struct Fraction {
    pub num: u32,
    pub den: u32,
}

impl Fraction {
    pub const fn new(num: u32, den: u32) -> Self {
        Self { num, den }
    }
}

impl Default for Fraction {
    fn default() -> Self {
        Self { num: 1, den: 1 }
    }
}

/// Structured description of a stream's encoding, sent in-band ahead of its data.
///
/// `media_type` follows the `video/x-vp8`, `audio/x-opus`, `audio/x-raw` naming;
/// the remaining fields are filled in when they apply to the encoding.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Caps {
    pub media_type: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub framerate: Option<Fraction>,
    pub pixel_aspect_ratio: Option<Fraction>,
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
    /// Raw sample or pixel layout, e.g. `S16LE` or `RGB`.
    pub format: Option<String>,
    pub mpeg_version: Option<u8>,
    /// Out-of-band codec setup (OpusHead, Vorbis headers, ...).
    pub codec_data: Option<Bytes>,
}

impl Caps {
    pub fn video(media_type: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            media_type: media_type.into(),
            width: Some(width),
            height: Some(height),
            ..Default::default()
        }
    }

    pub fn audio(media_type: impl Into<String>, sample_rate: u32, channels: u16) -> Self {
        Self {
            media_type: media_type.into(),
            sample_rate: Some(sample_rate),
            channels: Some(channels),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }

    #[must_use]
    pub const fn with_framerate(mut self, num: u32, den: u32) -> Self {
        self.framerate = Some(Fraction::new(num, den));
        self
    }

    #[must_use]
    pub const fn with_pixel_aspect_ratio(mut self, num: u32, den: u32) -> Self {
        self.pixel_aspect_ratio = Some(Fraction::new(num, den));
        self
    }

    #[must_use]
    pub const fn with_mpeg_version(mut self, version: u8) -> Self {
        self.mpeg_version = Some(version);
        self
    }

    #[must_use]
    pub fn with_codec_data(mut self, data: impl Into<Bytes>) -> Self {
        self.codec_data = Some(data.into());
        self
    }

    /// Stream kind implied by the media type prefix.
    pub fn kind(&self) -> Option<MediaKind> {
        if self.media_type.starts_with("video/") {
            Some(MediaKind::Video)
        } else if self.media_type.starts_with("audio/") {
            Some(MediaKind::Audio)
        } else {
            None
        }
    }
}

/// One unit of encoded media moving through an input pin.
#[derive(Debug, Clone, Default)]
pub struct MediaBuffer {
    pub data: Bytes,
    /// Presentation time in nanoseconds; `None` for untimed data.
    pub pts: Option<u64>,
    /// Duration in nanoseconds, when known.
    pub duration: Option<u64>,
    /// Set when the buffer depends on a predecessor (not a sync point).
    pub delta_unit: bool,
}

impl MediaBuffer {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into(), ..Default::default() }
    }

    #[must_use]
    pub const fn with_pts(mut self, pts_ns: u64) -> Self {
        self.pts = Some(pts_ns);
        self
    }

    #[must_use]
    pub const fn with_duration(mut self, duration_ns: u64) -> Self {
        self.duration = Some(duration_ns);
        self
    }

    #[must_use]
    pub const fn delta(mut self, delta_unit: bool) -> Self {
        self.delta_unit = delta_unit;
        self
    }

    pub const fn is_keyframe(&self) -> bool {
        !self.delta_unit
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Global metadata copied into the container header.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema, TS)]
#[ts(export)]
#[serde(default)]
pub struct TagList {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub copyright: Option<String>,
    pub comment: Option<String>,
    pub album: Option<String>,
    pub genre: Option<String>,
    pub track_number: Option<u32>,
}

impl TagList {
    /// Overwrites every field that is set in `other`.
    pub fn merge(&mut self, other: &Self) {
        fn take(dst: &mut Option<String>, src: Option<&String>) {
            if let Some(v) = src {
                *dst = Some(v.clone());
            }
        }
        take(&mut self.title, other.title.as_ref());
        take(&mut self.artist, other.artist.as_ref());
        take(&mut self.copyright, other.copyright.as_ref());
        take(&mut self.comment, other.comment.as_ref());
        take(&mut self.album, other.album.as_ref());
        take(&mut self.genre, other.genre.as_ref());
        if other.track_number.is_some() {
            self.track_number = other.track_number;
        }
    }

    pub const fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.artist.is_none()
            && self.copyright.is_none()
            && self.comment.is_none()
            && self.album.is_none()
            && self.genre.is_none()
            && self.track_number.is_none()
    }

    /// `(key, value)` pairs in the order containers usually store them.
    pub fn entries(&self) -> Vec<(&'static str, String)> {
        let mut out = Vec::new();
        let text = [
            ("title", &self.title),
            ("artist", &self.artist),
            ("copyright", &self.copyright),
            ("comment", &self.comment),
            ("album", &self.album),
            ("genre", &self.genre),
        ];
        for (key, value) in text {
            if let Some(v) = value {
                out.push((key, v.clone()));
            }
        }
        if let Some(track) = self.track_number {
            out.push(("track", track.to_string()));
        }
        out
    }
}

/// Optional timing and sequencing metadata attached to container bytes.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, TS)]
#[ts(export)]
pub struct PacketMetadata {
    /// Absolute timestamp in microseconds (presentation time)
    pub timestamp_us: Option<u64>,
    /// Duration of this packet in microseconds
    pub duration_us: Option<u64>,
    /// Sequence number for ordering and detecting loss
    pub sequence: Option<u64>,
    /// Marks container header bytes that a late-joining consumer needs first.
    #[serde(default)]
    pub stream_header: bool,
}

/// Describes the *type* of data, used for pre-flight pipeline validation.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize, JsonSchema, TS)]
#[ts(export)]
pub enum PacketType {
    /// Encoded elementary stream of the given kind, preceded by its caps.
    Media(MediaKind),
    /// Generic binary data (serialized container bytes).
    Binary,
    /// A special type for nodes that can accept any format.
    Any,
}

/// A generic container for any type of data that can flow through a pipeline.
#[derive(Debug, Clone)]
pub enum Packet {
    /// Encoding description for the stream on this pin (Arc-backed for cheap fan-out).
    Caps(Arc<Caps>),
    /// Encoded media.
    Media(MediaBuffer),
    /// Metadata for the whole output.
    Tags(Arc<TagList>),
    /// Binary data with optional content-type and timing metadata.
    ///
    /// `content_type` uses `Cow<'static, str>` so static MIME strings don't allocate.
    Binary { data: Bytes, content_type: Option<Cow<'static, str>>, metadata: Option<PacketMetadata> },
}
