// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Pin declarations and runtime pin management.
//!
//! - [`InputPin`] / [`OutputPin`]: What a node accepts and produces
//! - [`PinCardinality`]: Connection multiplicity, including on-demand pin families
//! - [`PinManagementMessage`]: Requests from the host to grow or shrink a node's inputs

use crate::error::MuxKitError;
use crate::types::{Packet, PacketType};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use ts_rs::TS;

/// Describes the connection cardinality of a pin.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, TS, PartialEq, Eq)]
#[ts(export)]
pub enum PinCardinality {
    /// Exactly one connection allowed.
    One,

    /// Multiple connections allowed; each packet is cloned to every destination.
    /// Only valid for output pins.
    Broadcast,

    /// Pin family created on demand. Names are `{prefix}_{n}`.
    Dynamic { prefix: String },
}

/// Describes an input pin and the packet types it can accept.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, TS)]
#[ts(export)]
pub struct InputPin {
    pub name: String,
    pub accepts_types: Vec<PacketType>,
    pub cardinality: PinCardinality,
}

/// Describes an output pin and the single packet type it produces.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, TS)]
#[ts(export)]
pub struct OutputPin {
    pub name: String,
    pub produces_type: PacketType,
    pub cardinality: PinCardinality,
}

/// Runtime pin management, sent by the host to nodes that support dynamic pins.
#[derive(Debug)]
pub enum PinManagementMessage {
    /// Ask the node for a new input pin. The node answers with the pin
    /// definition, or an error if it cannot take more inputs.
    RequestAddInputPin {
        suggested_name: Option<String>,
        response_tx: oneshot::Sender<Result<InputPin, MuxKitError>>,
    },

    /// The host created the pin's channel; the node should start receiving.
    AddedInputPin { pin: InputPin, channel: mpsc::Receiver<Packet> },

    /// The connection feeding this pin was deleted.
    RemoveInputPin { pin_name: String },
}
