// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Node lifecycle states and helpers for reporting them.
//!
//! ```text
//!     Initializing
//!          ↓
//!       Running ←──┐
//!          ↓       │
//!       Degraded ──┘
//!          ↓
//!       Failed
//!          ↓
//!       Stopped
//! ```
//!
//! `Degraded` is used while a node is blocked on something it cannot resolve
//! itself, e.g. an input whose encoding was rejected. It returns to `Running`
//! once the condition clears.

use serde::de::Deserializer;
use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use ts_rs::TS;

/// Why a node entered the `Stopped` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Expected end of a finite stream.
    Completed,
    /// Every input closed before any output could be produced.
    InputClosed,
    /// Downstream closed, cannot deliver outputs.
    OutputClosed,
    /// Shutdown was requested (user action or coordinated cancellation).
    Shutdown,
    /// A reason not recognized by this client/version.
    Unknown,
}

impl<'de> Deserialize<'de> for StopReason {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        Ok(Self::from(value.as_str()))
    }
}

impl From<&str> for StopReason {
    fn from(value: &str) -> Self {
        match value {
            "completed" => Self::Completed,
            "input_closed" => Self::InputClosed,
            "output_closed" => Self::OutputClosed,
            "shutdown" | "shutdown_requested" => Self::Shutdown,
            _ => Self::Unknown,
        }
    }
}

/// Runtime state of a node.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub enum NodeState {
    /// Validating configuration and allocating resources.
    Initializing,

    /// Operating normally.
    Running,

    /// Operational but blocked or impaired. `details` carries node-specific
    /// structured context (e.g. which pin is stuck).
    Degraded {
        reason: String,
        #[ts(type = "JsonValue")]
        details: Option<serde_json::Value>,
    },

    /// Fatal error, processing stopped.
    Failed { reason: String },

    /// Processing finished.
    Stopped { reason: StopReason },
}

/// A state update message sent by a node.
#[derive(Debug, Clone)]
pub struct NodeStateUpdate {
    pub node_id: String,
    pub state: NodeState,
    pub timestamp: SystemTime,
}

impl NodeStateUpdate {
    #[inline]
    pub fn new(node_id: String, state: NodeState) -> Self {
        Self { node_id, state, timestamp: SystemTime::now() }
    }
}

/// Helpers for emitting node state updates.
///
/// Sends use `try_send` and ignore failures: state tracking is best-effort and
/// must never stall a node.
pub mod state_helpers {
    use super::{NodeState, NodeStateUpdate, StopReason};
    use tokio::sync::mpsc;

    #[inline]
    pub fn emit_state(state_tx: &mpsc::Sender<NodeStateUpdate>, node_id: &str, state: NodeState) {
        let _ = state_tx.try_send(NodeStateUpdate::new(node_id.to_string(), state));
    }

    #[inline]
    pub fn emit_initializing(state_tx: &mpsc::Sender<NodeStateUpdate>, node_id: &str) {
        emit_state(state_tx, node_id, NodeState::Initializing);
    }

    #[inline]
    pub fn emit_running(state_tx: &mpsc::Sender<NodeStateUpdate>, node_id: &str) {
        emit_state(state_tx, node_id, NodeState::Running);
    }

    #[inline]
    pub fn emit_stopped(
        state_tx: &mpsc::Sender<NodeStateUpdate>,
        node_id: &str,
        reason: impl Into<StopReason>,
    ) {
        emit_state(state_tx, node_id, NodeState::Stopped { reason: reason.into() });
    }

    #[inline]
    pub fn emit_failed(
        state_tx: &mpsc::Sender<NodeStateUpdate>,
        node_id: &str,
        error: impl Into<String>,
    ) {
        emit_state(state_tx, node_id, NodeState::Failed { reason: error.into() });
    }

    #[inline]
    pub fn emit_degraded(
        state_tx: &mpsc::Sender<NodeStateUpdate>,
        node_id: &str,
        reason: impl Into<String>,
        details: Option<serde_json::Value>,
    ) {
        emit_state(state_tx, node_id, NodeState::Degraded { reason: reason.into(), details });
    }
}
