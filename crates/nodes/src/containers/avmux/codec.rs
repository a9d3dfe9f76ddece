// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Codec identifiers and the caps-to-codec mapping table.

use super::backend::BackendError;
use bytes::Bytes;
use muxkit_core::types::{Caps, Fraction, MediaKind};

/// Codec identifiers understood by the muxer backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodecId {
    Vp8,
    Vp9,
    Av1,
    H264,
    H263,
    H263p,
    Mpeg4,
    /// Packed 8-bit RGB frames, used by image-sequence containers.
    RawRgb24,
    Opus,
    Vorbis,
    Aac,
    Mp3,
    AmrNb,
    PcmS16le,
    PcmS16be,
    PcmU16le,
    PcmU16be,
    PcmS8,
    PcmU8,
}

impl CodecId {
    pub const fn kind(self) -> MediaKind {
        match self {
            Self::Vp8
            | Self::Vp9
            | Self::Av1
            | Self::H264
            | Self::H263
            | Self::H263p
            | Self::Mpeg4
            | Self::RawRgb24 => MediaKind::Video,
            _ => MediaKind::Audio,
        }
    }

    /// Uncompressed PCM has no encoder-defined frame grouping.
    pub const fn is_pcm(self) -> bool {
        matches!(
            self,
            Self::PcmS16le
                | Self::PcmS16be
                | Self::PcmU16le
                | Self::PcmU16be
                | Self::PcmS8
                | Self::PcmU8
        )
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Vp8 => "vp8",
            Self::Vp9 => "vp9",
            Self::Av1 => "av1",
            Self::H264 => "h264",
            Self::H263 => "h263",
            Self::H263p => "h263p",
            Self::Mpeg4 => "mpeg4",
            Self::RawRgb24 => "rawvideo",
            Self::Opus => "opus",
            Self::Vorbis => "vorbis",
            Self::Aac => "aac",
            Self::Mp3 => "mp3",
            Self::AmrNb => "amr_nb",
            Self::PcmS16le => "pcm_s16le",
            Self::PcmS16be => "pcm_s16be",
            Self::PcmU16le => "pcm_u16le",
            Self::PcmU16be => "pcm_u16be",
            Self::PcmS8 => "pcm_s8",
            Self::PcmU8 => "pcm_u8",
        }
    }
}

impl std::fmt::Display for CodecId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Everything the muxer needs to describe one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecParameters {
    pub codec: CodecId,
    pub width: u32,
    pub height: u32,
    pub framerate: Option<Fraction>,
    pub sample_aspect_ratio: Fraction,
    pub sample_rate: u32,
    pub channels: u16,
    /// Codec setup data (OpusHead, Vorbis headers, avcC, ...).
    pub extradata: Option<Bytes>,
}

impl CodecParameters {
    pub const fn video(codec: CodecId, width: u32, height: u32) -> Self {
        Self {
            codec,
            width,
            height,
            framerate: None,
            sample_aspect_ratio: Fraction::new(1, 1),
            sample_rate: 0,
            channels: 0,
            extradata: None,
        }
    }

    pub const fn audio(codec: CodecId, sample_rate: u32, channels: u16) -> Self {
        Self {
            codec,
            width: 0,
            height: 0,
            framerate: None,
            sample_aspect_ratio: Fraction::new(1, 1),
            sample_rate,
            channels,
            extradata: None,
        }
    }

    pub const fn kind(&self) -> MediaKind {
        self.codec.kind()
    }
}

/// Translates a negotiated encoding description into muxer codec parameters.
pub trait CodecMapper: Send + Sync {
    /// Returns `None` when the description has no muxer counterpart.
    fn map(&self, caps: &Caps) -> Option<CodecParameters>;
}

/// Table-driven [`CodecMapper`] over the common media type names.
#[derive(Debug, Default, Clone, Copy)]
pub struct CapsCodecMapper;

impl CapsCodecMapper {
    fn video_codec(caps: &Caps) -> Option<CodecId> {
        match caps.media_type.as_str() {
            "video/x-vp8" => Some(CodecId::Vp8),
            "video/x-vp9" => Some(CodecId::Vp9),
            "video/x-av1" => Some(CodecId::Av1),
            "video/x-h264" => Some(CodecId::H264),
            "video/x-h263" => match caps.format.as_deref() {
                Some("h263p") => Some(CodecId::H263p),
                _ => Some(CodecId::H263),
            },
            "video/mpeg" if caps.mpeg_version == Some(4) => Some(CodecId::Mpeg4),
            "video/x-raw" if caps.format.as_deref() == Some("RGB") => Some(CodecId::RawRgb24),
            _ => None,
        }
    }

    fn audio_codec(caps: &Caps) -> Option<CodecId> {
        match caps.media_type.as_str() {
            "audio/x-opus" => Some(CodecId::Opus),
            "audio/x-vorbis" => Some(CodecId::Vorbis),
            "audio/mpeg" => match caps.mpeg_version {
                Some(1) => Some(CodecId::Mp3),
                Some(2 | 4) => Some(CodecId::Aac),
                _ => None,
            },
            "audio/AMR" => Some(CodecId::AmrNb),
            "audio/x-raw" => match caps.format.as_deref()? {
                "S16LE" => Some(CodecId::PcmS16le),
                "S16BE" => Some(CodecId::PcmS16be),
                "U16LE" => Some(CodecId::PcmU16le),
                "U16BE" => Some(CodecId::PcmU16be),
                "S8" => Some(CodecId::PcmS8),
                "U8" => Some(CodecId::PcmU8),
                _ => None,
            },
            _ => None,
        }
    }
}

impl CodecMapper for CapsCodecMapper {
    fn map(&self, caps: &Caps) -> Option<CodecParameters> {
        let mut params = match caps.kind()? {
            MediaKind::Video => {
                let codec = Self::video_codec(caps)?;
                let mut p = CodecParameters::video(codec, caps.width?, caps.height?);
                p.framerate = caps.framerate;
                if let Some(par) = caps.pixel_aspect_ratio {
                    p.sample_aspect_ratio = par;
                }
                p
            },
            MediaKind::Audio => {
                let codec = Self::audio_codec(caps)?;
                CodecParameters::audio(codec, caps.sample_rate?, caps.channels?)
            },
        };
        params.extradata.clone_from(&caps.codec_data);
        Some(params)
    }
}

/// Opus encoder lookahead at 48kHz, written as OpusHead `pre_skip`.
pub const OPUS_PRESKIP_SAMPLES: u16 = 312;

/// Builds an OpusHead (RFC 7845 §5.1) for channel mapping family 0.
pub fn opus_head(
    sample_rate: u32,
    channels: u16,
    pre_skip: u16,
) -> Result<[u8; 19], BackendError> {
    let channels = u8::try_from(channels)
        .ok()
        .filter(|c| *c == 1 || *c == 2)
        .ok_or_else(|| {
            BackendError::Unsupported(format!(
                "OpusHead mapping family 0 needs 1 or 2 channels, got {channels}"
            ))
        })?;

    let mut head = [0u8; 19];
    head[0..8].copy_from_slice(b"OpusHead");
    head[8] = 1; // version
    head[9] = channels;
    head[10..12].copy_from_slice(&pre_skip.to_le_bytes());
    head[12..16].copy_from_slice(&sample_rate.to_le_bytes());
    head[16..18].copy_from_slice(&0i16.to_le_bytes()); // output gain
    head[18] = 0;
    Ok(head)
}
