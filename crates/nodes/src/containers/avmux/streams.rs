// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The dynamic set of muxer inputs.

use super::error::MuxError;
use super::port::{PortId, StreamPort};
use muxkit_core::types::MediaKind;

/// Which structural changes the registry currently accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PortGuard {
    /// Before the muxer opens: add and remove.
    Open,
    /// Muxer open or closing: nothing.
    Frozen,
    /// Run finished: remove only.
    Drained,
}

/// Owns every [`StreamPort`] of one muxer, in creation order.
pub struct StreamRegistry {
    ports: Vec<StreamPort>,
    next_id: u32,
    video_count: u32,
    audio_count: u32,
    guard: PortGuard,
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamRegistry {
    pub const fn new() -> Self {
        Self { ports: Vec::new(), next_id: 0, video_count: 0, audio_count: 0, guard: PortGuard::Open }
    }

    pub(crate) const fn set_guard(&mut self, guard: PortGuard) {
        self.guard = guard;
    }

    const fn counter(&mut self, kind: MediaKind) -> &mut u32 {
        match kind {
            MediaKind::Video => &mut self.video_count,
            MediaKind::Audio => &mut self.audio_count,
        }
    }

    /// Number of live ports of `kind`, which also seeds default names.
    pub const fn count(&self, kind: MediaKind) -> u32 {
        match kind {
            MediaKind::Video => self.video_count,
            MediaKind::Audio => self.audio_count,
        }
    }

    /// Next free default name for `kind` (`video_0`, `audio_1`, ...).
    pub fn default_name(&self, kind: MediaKind) -> String {
        let mut n = self.count(kind);
        loop {
            let name = format!("{}_{n}", kind.pin_prefix());
            if self.find(&name).is_none() {
                return name;
            }
            n += 1;
        }
    }

    /// Adds a port with a generated name.
    ///
    /// # Errors
    ///
    /// [`MuxError::AlreadyOpen`] once muxing has started.
    pub fn add_port(&mut self, kind: MediaKind) -> Result<PortId, MuxError> {
        let name = self.default_name(kind);
        self.add_named_port(kind, name)
    }

    /// Adds a port under a caller-chosen name (usually the pin name).
    ///
    /// # Errors
    ///
    /// [`MuxError::AlreadyOpen`] once muxing has started, [`MuxError::DuplicatePort`]
    /// if the name is taken.
    pub fn add_named_port(
        &mut self,
        kind: MediaKind,
        name: impl Into<String>,
    ) -> Result<PortId, MuxError> {
        if self.guard != PortGuard::Open {
            return Err(MuxError::AlreadyOpen);
        }
        let name = name.into();
        if self.find(&name).is_some() {
            return Err(MuxError::DuplicatePort(name));
        }

        let id = PortId(self.next_id);
        self.next_id += 1;
        *self.counter(kind) += 1;
        tracing::debug!(port = %id, %name, %kind, "Added muxer input");
        self.ports.push(StreamPort::new(id, kind, name));
        Ok(id)
    }

    /// Removes a port, dropping its codec slot and queued data immediately.
    ///
    /// # Errors
    ///
    /// [`MuxError::UnknownPort`] for stale ids, [`MuxError::AlreadyOpen`] while
    /// the muxer is running.
    pub fn remove_port(&mut self, id: PortId) -> Result<(), MuxError> {
        let pos =
            self.ports.iter().position(|p| p.id() == id).ok_or(MuxError::UnknownPort(id))?;
        if self.guard == PortGuard::Frozen {
            return Err(MuxError::AlreadyOpen);
        }
        let mut port = self.ports.remove(pos);
        let dropped = port.release();
        let counter = self.counter(port.kind());
        *counter = counter.saturating_sub(1);
        tracing::debug!(port = %id, name = port.name(), dropped, "Removed muxer input");
        Ok(())
    }

    /// Port ids in creation order, stable for a run.
    pub fn ports(&self) -> impl Iterator<Item = PortId> + '_ {
        self.ports.iter().map(StreamPort::id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &StreamPort> {
        self.ports.iter()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut StreamPort> {
        self.ports.iter_mut()
    }

    pub fn get(&self, id: PortId) -> Option<&StreamPort> {
        self.ports.iter().find(|p| p.id() == id)
    }

    pub(crate) fn get_mut(&mut self, id: PortId) -> Option<&mut StreamPort> {
        self.ports.iter_mut().find(|p| p.id() == id)
    }

    /// Looks a port up by name.
    pub fn find(&self, name: &str) -> Option<PortId> {
        self.ports.iter().find(|p| p.name() == name).map(StreamPort::id)
    }

    pub(crate) fn by_position_mut(&mut self, pos: usize) -> Option<&mut StreamPort> {
        self.ports.get_mut(pos)
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    pub fn has_kind(&self, kind: MediaKind) -> bool {
        self.ports.iter().any(|p| p.kind() == kind)
    }
}
