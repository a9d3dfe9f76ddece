// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Per-port encoding negotiation.

use super::codec::CodecMapper;
use super::error::MuxError;
use super::formats::{CapsOverrides, FormatDescriptor};
use super::port::PortId;
use super::streams::StreamRegistry;
use muxkit_core::types::{Caps, MediaKind};
use std::sync::Arc;

/// Decides whether an input's encoding can be carried by the output format.
#[derive(Clone)]
pub struct NegotiationGate {
    mapper: Arc<dyn CodecMapper>,
    format: Arc<FormatDescriptor>,
}

impl NegotiationGate {
    pub fn new(mapper: Arc<dyn CodecMapper>, format: Arc<FormatDescriptor>) -> Self {
        Self { mapper, format }
    }

    pub fn format(&self) -> &Arc<FormatDescriptor> {
        &self.format
    }

    /// Negotiates `caps` on port `id`, storing the mapped codec on success.
    ///
    /// # Errors
    ///
    /// [`MuxError::UnknownPort`] for stale ids, [`MuxError::NegotiationRejected`]
    /// when the encoding cannot be muxed into this format.
    pub fn negotiate(
        &self,
        streams: &mut StreamRegistry,
        id: PortId,
        caps: &Caps,
    ) -> Result<(), MuxError> {
        let port = streams.get_mut(id).ok_or(MuxError::UnknownPort(id))?;
        let reject = |reason: String| MuxError::NegotiationRejected {
            port: port.name().to_string(),
            reason,
        };

        let kind = caps.kind();
        if kind != Some(port.kind()) {
            return Err(reject(format!(
                "'{}' does not describe {} data",
                caps.media_type,
                port.kind()
            )));
        }
        if let Some(reason) = check_overrides(&self.format.overrides, caps) {
            return Err(reject(reason));
        }

        let Some(mut params) = self.mapper.map(caps) else {
            return Err(reject(format!("no muxer codec for '{}'", caps.media_type)));
        };
        let allowed = match port.kind() {
            MediaKind::Video => &self.format.video_codecs,
            MediaKind::Audio => &self.format.audio_codecs,
        };
        if !allowed.contains(&params.codec) {
            return Err(reject(format!("{} cannot carry {}", self.format.long_name, params.codec)));
        }

        if let Some(existing) = port.codec() {
            if existing.codec != params.codec {
                return Err(reject(format!(
                    "already negotiated {}, refusing {}",
                    existing.codec, params.codec
                )));
            }
            tracing::debug!(port = port.name(), codec = %params.codec, "Caps repeated, keeping codec");
            return Ok(());
        }

        if let Some((rate, channels)) = self.format.overrides.fixed_audio {
            params.sample_rate = rate;
            params.channels = channels;
        }
        if params.codec.is_pcm() {
            port.frame_size_hint = 1;
        }

        tracing::info!(
            port = port.name(),
            codec = %params.codec,
            width = params.width,
            height = params.height,
            sample_rate = params.sample_rate,
            channels = params.channels,
            "Negotiated input"
        );
        port.set_codec(params);
        Ok(())
    }

    /// True when every registered port has a codec.
    pub fn all_negotiated(streams: &StreamRegistry) -> bool {
        streams.iter().all(super::port::StreamPort::is_negotiated)
    }
}

fn check_overrides(overrides: &CapsOverrides, caps: &Caps) -> Option<String> {
    match caps.kind()? {
        MediaKind::Audio => {
            let rate = caps.sample_rate.unwrap_or(0);
            if let Some((fixed_rate, fixed_channels)) = overrides.fixed_audio {
                if caps.sample_rate != Some(fixed_rate) || caps.channels != Some(fixed_channels) {
                    return Some(format!(
                        "format requires {fixed_rate} Hz with {fixed_channels} channel(s)"
                    ));
                }
            }
            if !overrides.audio_rates.is_empty() && !overrides.audio_rates.contains(&rate) {
                return Some(format!("sample rate {rate} Hz is not supported"));
            }
            None
        },
        MediaKind::Video => {
            if overrides.raw_rgb_video
                && (caps.media_type != "video/x-raw" || caps.format.as_deref() != Some("RGB"))
            {
                return Some("format only stores packed RGB video".to_string());
            }
            None
        },
    }
}
