// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! WebM output through libwebm.
//!
//! The segment is always written with a non-seek writer in live mode so that
//! bytes can be streamed downstream as soon as they are produced. libwebm
//! emits the EBML header and track info together with the first frame.

use super::backend::{BackendError, MuxOptions, MuxPacket, MuxSink, MuxerBackend, OpenFlags};
use super::codec::{opus_head, CodecId, CodecParameters, OPUS_PRESKIP_SAMPLES};
use webm::mux::{
    AudioCodecId, AudioTrack, Segment, SegmentBuilder, SegmentMode, VideoCodecId, VideoTrack,
    Writer,
};

#[derive(Clone, Copy)]
enum WebmTrack {
    Video(VideoTrack),
    Audio(AudioTrack),
}

struct WebmStream {
    codec: CodecParameters,
    track: Option<WebmTrack>,
    last_ts: u64,
}

#[derive(Default)]
pub struct WebmBackend {
    sink: Option<MuxSink>,
    streams: Vec<WebmStream>,
    segment: Option<Segment<MuxSink>>,
}

impl WebmBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn library_error(what: &str, e: impl std::fmt::Display) -> BackendError {
        BackendError::Library(format!("{what}: {e}"))
    }

    fn add_track(
        builder: SegmentBuilder<MuxSink>,
        params: &CodecParameters,
    ) -> Result<(SegmentBuilder<MuxSink>, WebmTrack), BackendError> {
        match params.codec {
            CodecId::Vp8 | CodecId::Vp9 | CodecId::Av1 => {
                let codec_id = match params.codec {
                    CodecId::Vp8 => VideoCodecId::VP8,
                    CodecId::Vp9 => VideoCodecId::VP9,
                    _ => VideoCodecId::AV1,
                };
                let (builder, track) = builder
                    .add_video_track(params.width, params.height, codec_id, None)
                    .map_err(|e| Self::library_error("failed to add video track", e))?;
                let builder = match params.extradata.as_deref() {
                    Some(private) if !private.is_empty() => builder
                        .set_codec_private(track, private)
                        .map_err(|e| Self::library_error("failed to set codec private", e))?,
                    _ => builder,
                };
                Ok((builder, WebmTrack::Video(track)))
            },
            CodecId::Opus => {
                let (builder, track) = builder
                    .add_audio_track(
                        params.sample_rate,
                        u32::from(params.channels),
                        AudioCodecId::Opus,
                        None,
                    )
                    .map_err(|e| Self::library_error("failed to add audio track", e))?;
                let generated;
                let private = match params.extradata.as_deref() {
                    Some(private) if private.starts_with(b"OpusHead") => private,
                    _ => {
                        generated = opus_head(
                            params.sample_rate,
                            params.channels,
                            OPUS_PRESKIP_SAMPLES,
                        )?;
                        &generated[..]
                    },
                };
                let builder = builder
                    .set_codec_private(track, private)
                    .map_err(|e| Self::library_error("failed to set OpusHead", e))?;
                Ok((builder, WebmTrack::Audio(track)))
            },
            CodecId::Vorbis => {
                let private = params
                    .extradata
                    .as_deref()
                    .filter(|p| !p.is_empty())
                    .ok_or_else(|| {
                        BackendError::Unsupported("vorbis needs its setup headers".to_string())
                    })?;
                let (builder, track) = builder
                    .add_audio_track(
                        params.sample_rate,
                        u32::from(params.channels),
                        AudioCodecId::Vorbis,
                        None,
                    )
                    .map_err(|e| Self::library_error("failed to add audio track", e))?;
                let builder = builder
                    .set_codec_private(track, private)
                    .map_err(|e| Self::library_error("failed to set vorbis headers", e))?;
                Ok((builder, WebmTrack::Audio(track)))
            },
            other => Err(BackendError::Unsupported(format!("webm cannot carry {other}"))),
        }
    }
}

impl MuxerBackend for WebmBackend {
    fn open(&mut self, sink: MuxSink, _flags: OpenFlags) -> Result<(), BackendError> {
        self.sink = Some(sink);
        Ok(())
    }

    fn set_parameters(&mut self, options: &MuxOptions) -> Result<(), BackendError> {
        if options.streams.is_empty() {
            return Err(BackendError::Unsupported("no streams".to_string()));
        }
        if !options.tags.is_empty() {
            tracing::debug!("WebM output does not carry tags, ignoring");
        }
        self.streams = options
            .streams
            .iter()
            .map(|s| WebmStream { codec: s.codec.clone(), track: None, last_ts: 0 })
            .collect();
        Ok(())
    }

    fn write_header(&mut self) -> Result<(), BackendError> {
        let sink = self.sink.clone().ok_or(BackendError::NotOpen)?;
        let mut builder = SegmentBuilder::new(Writer::new_non_seek(sink))
            .map_err(|e| Self::library_error("failed to create segment", e))?
            .set_mode(SegmentMode::Live)
            .map_err(|e| Self::library_error("failed to set live mode", e))?;

        for stream in &mut self.streams {
            let (next, track) = Self::add_track(builder, &stream.codec)?;
            builder = next;
            stream.track = Some(track);
        }
        self.segment = Some(builder.build());
        tracing::debug!(tracks = self.streams.len(), "WebM segment built");
        Ok(())
    }

    fn write_packet(&mut self, packet: &MuxPacket) -> Result<(), BackendError> {
        let segment = self.segment.as_mut().ok_or(BackendError::NotOpen)?;
        let stream = self.streams.get_mut(packet.stream_index).ok_or_else(|| {
            BackendError::Unsupported(format!("no stream {}", packet.stream_index))
        })?;
        let track = stream.track.ok_or(BackendError::NotOpen)?;

        // Untimed packets reuse the previous timestamp.
        let ts = packet.pts.map_or(stream.last_ts, |pts| u64::try_from(pts).unwrap_or(0));
        stream.last_ts = ts;

        let result = match track {
            WebmTrack::Video(t) => segment.add_frame(t, &packet.data, ts, packet.keyframe),
            WebmTrack::Audio(t) => segment.add_frame(t, &packet.data, ts, packet.keyframe),
        };
        result.map_err(|e| Self::library_error("failed to add frame", e))
    }

    fn write_trailer(&mut self) -> Result<(), BackendError> {
        let segment = self.segment.take().ok_or(BackendError::NotOpen)?;
        segment
            .finalize(None)
            .map(drop)
            .map_err(|_| BackendError::Library("failed to finalize WebM segment".to_string()))
    }

    fn flush(&mut self) -> Result<(), BackendError> {
        Ok(())
    }

    fn close(&mut self) {
        self.segment = None;
        self.sink = None;
        self.streams.clear();
    }
}
