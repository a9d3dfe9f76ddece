// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The seam between the muxing session and a container library.

use super::codec::CodecParameters;
use bytes::Bytes;
use muxkit_core::types::{Fraction, MediaKind, TagList, SECOND_NS};
use std::io::{Cursor, Seek, SeekFrom, Write};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("muxer is not open")]
    NotOpen,

    #[error("unsupported stream: {0}")]
    Unsupported(String),

    #[error("container library error: {0}")]
    Library(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Options passed to [`MuxerBackend::open`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenFlags {
    /// The format emits a stream header that downstream must receive first.
    pub stream_header: bool,
}

/// Description of one output stream, in stream-table order.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamParameters {
    pub index: usize,
    pub kind: MediaKind,
    pub name: String,
    pub codec: CodecParameters,
    pub bitrate: u32,
    pub frame_size: u32,
}

/// Everything a backend learns before writing its header.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MuxOptions {
    pub preload_us: u64,
    pub max_delay_us: u64,
    pub tags: TagList,
    pub streams: Vec<StreamParameters>,
}

/// One compressed unit, timestamps already in the stream's time base.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxPacket {
    pub stream_index: usize,
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    pub duration: Option<i64>,
    pub keyframe: bool,
    pub data: Bytes,
}

/// A container muxing library.
///
/// Calls arrive in the order `open`, `set_parameters`, `write_header`, any
/// number of `write_packet`, then `write_trailer`, `flush` and `close`. A
/// forced shutdown skips straight to `close`.
pub trait MuxerBackend: Send {
    fn open(&mut self, sink: MuxSink, flags: OpenFlags) -> Result<(), BackendError>;

    fn set_parameters(&mut self, options: &MuxOptions) -> Result<(), BackendError>;

    fn write_header(&mut self) -> Result<(), BackendError>;

    fn write_packet(&mut self, packet: &MuxPacket) -> Result<(), BackendError>;

    fn write_trailer(&mut self) -> Result<(), BackendError>;

    fn flush(&mut self) -> Result<(), BackendError>;

    /// Releases library state. Must be safe to call more than once.
    fn close(&mut self);

    /// Time base of `stream_index`, valid after `set_parameters`.
    fn time_base(&self, _stream_index: usize) -> Fraction {
        Fraction::new(1, 1_000_000_000)
    }
}

/// Rescales a nanosecond timestamp into `tb` units, rounding down.
pub fn rescale_ns(ns: u64, tb: Fraction) -> i64 {
    if tb.num == 0 || tb.den == 0 {
        return 0;
    }
    let scaled = u128::from(ns) * u128::from(tb.den) / (u128::from(tb.num) * u128::from(SECOND_NS));
    i64::try_from(scaled).unwrap_or(i64::MAX)
}

#[derive(Debug, Default)]
struct SinkInner {
    cursor: Cursor<Vec<u8>>,
    /// Bytes already drained by `take_data`.
    base_offset: u64,
}

/// In-memory byte sink shared between the session and its backend.
///
/// The backend writes (and, for seekable writers, seeks within the
/// not-yet-drained window); the session drains whatever was produced after
/// each call.
#[derive(Debug, Clone, Default)]
pub struct MuxSink {
    inner: Arc<Mutex<SinkInner>>,
}

impl MuxSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SinkInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Moves out every byte written since the last call.
    pub fn take_data(&self) -> Option<Bytes> {
        let mut inner = self.lock();
        let written = inner.cursor.get_ref().len();
        if written == 0 {
            return None;
        }
        let data = std::mem::take(inner.cursor.get_mut());
        inner.cursor.set_position(0);
        inner.base_offset += written as u64;
        drop(inner);
        Some(Bytes::from(data))
    }

    /// Bytes waiting to be drained.
    pub fn pending(&self) -> usize {
        self.lock().cursor.get_ref().len()
    }

    /// Total bytes ever written and drained.
    pub fn drained(&self) -> u64 {
        self.lock().base_offset
    }
}

impl Write for MuxSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.lock().cursor.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Seek for MuxSink {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let mut inner = self.lock();
        let base = inner.base_offset;
        let adjusted = match pos {
            SeekFrom::Start(offset) if offset >= base => SeekFrom::Start(offset - base),
            SeekFrom::Start(offset) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("seek to {offset} before drained offset {base}"),
                ));
            },
            other => other,
        };
        let pos = inner.cursor.seek(adjusted)?;
        drop(inner);
        Ok(pos + base)
    }
}
