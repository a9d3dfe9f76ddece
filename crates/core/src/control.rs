// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Control messages sent to running nodes.

use serde::{Deserialize, Serialize};
use ts_rs::TS;

/// A message sent to a specific, running node to tune its parameters or control its lifecycle.
#[derive(Debug, Deserialize, Serialize, TS)]
#[ts(export)]
pub enum NodeControlMessage {
    UpdateParams(#[ts(type = "JsonValue")] serde_json::Value),
    /// Return the node to its initial state so the pipeline can be reused.
    ///
    /// Muxers force-close any open output without a trailer and clear per-run
    /// counters; negotiated encodings are kept.
    Reset,
    /// Shutdown signal for graceful termination.
    /// Nodes should clean up resources and exit their run loop when receiving this.
    Shutdown,
}
