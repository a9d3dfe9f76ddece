// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Ogg output for Opus streams (RFC 7845).

use super::backend::{BackendError, MuxOptions, MuxPacket, MuxSink, MuxerBackend, OpenFlags};
use super::codec::{opus_head, CodecId};
use muxkit_core::types::{Fraction, TagList};
use ogg::{PacketWriteEndInfo, PacketWriter};

/// Opus granule positions always count 48kHz samples.
const OPUS_GRANULE_RATE: u32 = 48_000;
/// Granule advance for untimed packets (20ms).
const DEFAULT_PACKET_SAMPLES: u64 = 960;
const VENDOR: &str = "muxkit";

struct OggStream {
    serial: u32,
    head: Vec<u8>,
    granule: u64,
}

#[derive(Default)]
pub struct OggBackend {
    writer: Option<PacketWriter<'static, MuxSink>>,
    streams: Vec<OggStream>,
    tags: TagList,
}

impl OggBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// OpusTags comment header with `tags` as `KEY=value` comments.
    fn opus_tags(tags: &TagList) -> Vec<u8> {
        let comments: Vec<String> = tags
            .entries()
            .into_iter()
            .map(|(key, value)| format!("{}={value}", key.to_ascii_uppercase()))
            .collect();

        let mut out = Vec::new();
        out.extend_from_slice(b"OpusTags");
        push_len_prefixed(&mut out, VENDOR.as_bytes());
        push_u32(&mut out, comments.len());
        for comment in &comments {
            push_len_prefixed(&mut out, comment.as_bytes());
        }
        out
    }

    fn write(
        writer: &mut PacketWriter<'static, MuxSink>,
        data: Vec<u8>,
        serial: u32,
        info: PacketWriteEndInfo,
        granule: u64,
    ) -> Result<(), BackendError> {
        writer.write_packet(data, serial, info, granule).map_err(BackendError::Io)
    }
}

fn push_u32(out: &mut Vec<u8>, n: usize) {
    out.extend_from_slice(&u32::try_from(n).unwrap_or(u32::MAX).to_le_bytes());
}

fn push_len_prefixed(out: &mut Vec<u8>, bytes: &[u8]) {
    push_u32(out, bytes.len());
    out.extend_from_slice(bytes);
}

impl MuxerBackend for OggBackend {
    fn open(&mut self, sink: MuxSink, _flags: OpenFlags) -> Result<(), BackendError> {
        self.writer = Some(PacketWriter::new(sink));
        Ok(())
    }

    fn set_parameters(&mut self, options: &MuxOptions) -> Result<(), BackendError> {
        let mut streams = Vec::with_capacity(options.streams.len());
        for s in &options.streams {
            if s.codec.codec != CodecId::Opus {
                return Err(BackendError::Unsupported(format!("ogg cannot carry {}", s.codec.codec)));
            }
            let head = match s.codec.extradata.as_deref() {
                Some(h) if h.starts_with(b"OpusHead") => h.to_vec(),
                _ => opus_head(s.codec.sample_rate, s.codec.channels, 0)?.to_vec(),
            };
            let serial = u32::try_from(s.index + 1)
                .map_err(|_| BackendError::Unsupported("too many streams".to_string()))?;
            streams.push(OggStream { serial, head, granule: 0 });
        }
        if streams.is_empty() {
            return Err(BackendError::Unsupported("no streams".to_string()));
        }
        self.streams = streams;
        self.tags = options.tags.clone();
        Ok(())
    }

    fn write_header(&mut self) -> Result<(), BackendError> {
        let writer = self.writer.as_mut().ok_or(BackendError::NotOpen)?;
        // Every beginning-of-stream page comes before any secondary header.
        for s in &self.streams {
            Self::write(writer, s.head.clone(), s.serial, PacketWriteEndInfo::EndPage, 0)?;
        }
        let tags = Self::opus_tags(&self.tags);
        for s in &self.streams {
            Self::write(writer, tags.clone(), s.serial, PacketWriteEndInfo::EndPage, 0)?;
        }
        tracing::debug!(streams = self.streams.len(), "Ogg headers written");
        Ok(())
    }

    fn write_packet(&mut self, packet: &MuxPacket) -> Result<(), BackendError> {
        let writer = self.writer.as_mut().ok_or(BackendError::NotOpen)?;
        let stream = self.streams.get_mut(packet.stream_index).ok_or_else(|| {
            BackendError::Unsupported(format!("no stream {}", packet.stream_index))
        })?;

        // The granule position marks the end of the last sample in the page.
        let advance = packet.duration.and_then(|d| u64::try_from(d).ok());
        stream.granule = match packet.pts.and_then(|p| u64::try_from(p).ok()) {
            Some(pts) => pts + advance.unwrap_or(0),
            None => stream.granule + advance.unwrap_or(DEFAULT_PACKET_SAMPLES),
        };
        Self::write(
            writer,
            packet.data.to_vec(),
            stream.serial,
            PacketWriteEndInfo::EndPage,
            stream.granule,
        )
    }

    fn write_trailer(&mut self) -> Result<(), BackendError> {
        let writer = self.writer.as_mut().ok_or(BackendError::NotOpen)?;
        for s in &self.streams {
            Self::write(writer, Vec::new(), s.serial, PacketWriteEndInfo::EndStream, s.granule)?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), BackendError> {
        Ok(())
    }

    fn close(&mut self) {
        self.writer = None;
        self.streams.clear();
    }

    fn time_base(&self, _stream_index: usize) -> Fraction {
        Fraction::new(1, OPUS_GRANULE_RATE)
    }
}
