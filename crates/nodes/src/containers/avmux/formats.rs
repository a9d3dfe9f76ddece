// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Output formats the muxer node can be instantiated for.

use super::backend::MuxerBackend;
use super::codec::CodecId;
use super::estimator::TrailerFamily;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Builds a fresh backend for one node instance.
pub type BackendFactory = Arc<dyn Fn() -> Box<dyn MuxerBackend> + Send + Sync>;

/// How buffer timestamps are expressed on the way into the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimestampMode {
    /// Rescaled into the backend's per-stream time base.
    #[default]
    TimeBase,
    /// Video timestamps are passed in milliseconds, audio uses the time base.
    VideoMilliseconds,
}

/// Format-specific restrictions applied before codec mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapsOverrides {
    /// Audio sample rates the format can signal. Empty means any.
    pub audio_rates: Vec<u32>,
    /// The format stores exactly this `(rate, channels)` pair.
    pub fixed_audio: Option<(u32, u16)>,
    /// Video must be packed RGB.
    pub raw_rgb_video: bool,
}

/// Capability record for one output format.
#[derive(Clone)]
pub struct FormatDescriptor {
    pub id: &'static str,
    pub long_name: &'static str,
    pub content_type: &'static str,
    pub video_codecs: Vec<CodecId>,
    pub audio_codecs: Vec<CodecId>,
    pub overrides: CapsOverrides,
    pub stream_header: bool,
    /// Strip row padding from RGB frames before handing them over.
    pub repack_rgb24: bool,
    pub timestamp_mode: TimestampMode,
    pub trailer_family: TrailerFamily,
    pub backend: BackendFactory,
}

impl FormatDescriptor {
    pub fn accepts(&self, codec: CodecId) -> bool {
        self.video_codecs.contains(&codec) || self.audio_codecs.contains(&codec)
    }

    pub fn create_backend(&self) -> Box<dyn MuxerBackend> {
        (self.backend)()
    }

    /// Content type with a `codecs` parameter listing what this run carries.
    pub fn content_type_for(&self, codecs: &[CodecId]) -> String {
        if codecs.is_empty() {
            return self.content_type.to_string();
        }
        let names: Vec<&str> = codecs.iter().map(|c| c.name()).collect();
        format!("{}; codecs=\"{}\"", self.content_type, names.join(","))
    }
}

impl std::fmt::Debug for FormatDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FormatDescriptor")
            .field("id", &self.id)
            .field("content_type", &self.content_type)
            .field("video_codecs", &self.video_codecs)
            .field("audio_codecs", &self.audio_codecs)
            .field("overrides", &self.overrides)
            .field("stream_header", &self.stream_header)
            .finish_non_exhaustive()
    }
}

/// Format id to descriptor lookup, resolved once per node.
#[derive(Debug, Clone, Default)]
pub struct FormatTable {
    formats: BTreeMap<&'static str, Arc<FormatDescriptor>>,
}

impl FormatTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The formats backed by the libraries compiled into this crate.
    pub fn builtin() -> Self {
        #[allow(unused_mut)]
        let mut table = Self::new();

        #[cfg(feature = "webm")]
        table.register(FormatDescriptor {
            id: "webm",
            long_name: "WebM",
            content_type: "video/webm",
            video_codecs: vec![CodecId::Vp8, CodecId::Vp9, CodecId::Av1],
            audio_codecs: vec![CodecId::Opus, CodecId::Vorbis],
            overrides: CapsOverrides::default(),
            // libwebm holds the EBML header back until the first frame.
            stream_header: false,
            repack_rgb24: false,
            timestamp_mode: TimestampMode::TimeBase,
            trailer_family: TrailerFamily::Simple,
            backend: Arc::new(|| Box::new(super::webm::WebmBackend::new()) as Box<dyn MuxerBackend>),
        });

        #[cfg(feature = "ogg")]
        table.register(FormatDescriptor {
            id: "ogg",
            long_name: "Ogg",
            content_type: "audio/ogg",
            video_codecs: Vec::new(),
            audio_codecs: vec![CodecId::Opus],
            overrides: CapsOverrides {
                audio_rates: vec![8_000, 12_000, 16_000, 24_000, 48_000],
                ..CapsOverrides::default()
            },
            stream_header: true,
            repack_rgb24: false,
            timestamp_mode: TimestampMode::TimeBase,
            trailer_family: TrailerFamily::Simple,
            backend: Arc::new(|| Box::new(super::ogg::OggBackend::new()) as Box<dyn MuxerBackend>),
        });

        table
    }

    /// Adds or replaces a format.
    pub fn register(&mut self, descriptor: FormatDescriptor) {
        tracing::debug!(format = descriptor.id, "Registered muxer format");
        self.formats.insert(descriptor.id, Arc::new(descriptor));
    }

    pub fn get(&self, id: &str) -> Option<Arc<FormatDescriptor>> {
        self.formats.get(id).cloned()
    }

    pub fn ids(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.formats.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<FormatDescriptor>> {
        self.formats.values()
    }
}
