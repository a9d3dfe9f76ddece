// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Core node abstractions and ProcessorNode trait.
//!
//! - [`ProcessorNode`]: The actor interface every node implements
//! - [`NodeContext`]: Channels handed to a node when it is spawned
//! - [`OutputSender`]: Handle for sending packets to downstream nodes

use crate::control::NodeControlMessage;
use crate::error::MuxKitError;
use crate::pins::{InputPin, OutputPin, PinManagementMessage};
use crate::state::NodeStateUpdate;
use crate::stats::NodeStatsUpdate;
use crate::types::Packet;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

/// Message type for routed packet delivery: `(node, pin, packet)`.
/// Names are `Arc<str>` so a send never allocates.
pub type RoutedPacketMessage = (Arc<str>, Arc<str>, Packet);

/// The two ways a node's output can be routed.
#[derive(Clone)]
pub enum OutputRouting {
    /// Packets go straight into the input channels of downstream nodes, keyed by output pin.
    Direct(HashMap<String, mpsc::Sender<Packet>>),
    /// Packets go to a central router that knows the graph.
    Routed(mpsc::Sender<RoutedPacketMessage>),
}

/// A handle given to a node to send its output packets.
#[derive(Clone)]
pub struct OutputSender {
    node_name: Arc<str>,
    routing: OutputRouting,
    pin_name_cache: HashMap<String, Arc<str>>,
}

/// Error returned by [`OutputSender::send`] when a packet cannot be delivered.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OutputSendError {
    /// The requested output pin does not exist on this node.
    #[error("unknown output pin '{pin_name}' on node '{node_name}'")]
    PinNotFound { node_name: String, pin_name: String },

    /// The downstream channel (direct) or router channel (routed) is closed.
    #[error("output channel closed for pin '{pin_name}' on node '{node_name}'")]
    ChannelClosed { node_name: String, pin_name: String },
}

impl OutputSender {
    pub fn new(node_name: String, routing: OutputRouting) -> Self {
        Self { node_name: Arc::from(node_name), routing, pin_name_cache: HashMap::new() }
    }

    #[must_use]
    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    fn cached_pin_name(&mut self, pin_name: &str) -> Arc<str> {
        if let Some(cached) = self.pin_name_cache.get(pin_name) {
            return cached.clone();
        }
        let name: Arc<str> = Arc::from(pin_name);
        self.pin_name_cache.insert(pin_name.to_string(), name.clone());
        name
    }

    fn closed(&self, pin_name: &str) -> OutputSendError {
        OutputSendError::ChannelClosed {
            node_name: self.node_name.to_string(),
            pin_name: pin_name.to_string(),
        }
    }

    /// Sends a packet from one of this node's output pins.
    ///
    /// Tries a non-blocking send first and only awaits when the channel is full,
    /// so downstream backpressure propagates to the caller.
    ///
    /// # Errors
    ///
    /// Returns [`OutputSendError::PinNotFound`] if the pin doesn't exist, or
    /// [`OutputSendError::ChannelClosed`] if the receiving side is gone. Nodes should
    /// stop processing on either.
    pub async fn send(&mut self, pin_name: &str, packet: Packet) -> Result<(), OutputSendError> {
        match &self.routing {
            OutputRouting::Direct(senders) => {
                let Some(sender) = senders.get(pin_name) else {
                    tracing::warn!(
                        node = %self.node_name,
                        pin = pin_name,
                        available = ?senders.keys().collect::<Vec<_>>(),
                        "send() on unknown output pin, packet dropped"
                    );
                    return Err(OutputSendError::PinNotFound {
                        node_name: self.node_name.to_string(),
                        pin_name: pin_name.to_string(),
                    });
                };
                let delivered = match sender.try_send(packet) {
                    Ok(()) => true,
                    Err(TrySendError::Full(packet)) => sender.send(packet).await.is_ok(),
                    Err(TrySendError::Closed(_)) => false,
                };
                if !delivered {
                    // Expected during shutdown.
                    tracing::debug!(pin = pin_name, "downstream channel closed");
                    return Err(self.closed(pin_name));
                }
            },
            OutputRouting::Routed(router_tx) => {
                let router_tx = router_tx.clone();
                let pin = self.cached_pin_name(pin_name);
                let message = (self.node_name.clone(), pin, packet);
                let delivered = match router_tx.try_send(message) {
                    Ok(()) => true,
                    Err(TrySendError::Full(message)) => router_tx.send(message).await.is_ok(),
                    Err(TrySendError::Closed(_)) => false,
                };
                if !delivered {
                    tracing::warn!("Router channel is closed. Cannot send packet.");
                    return Err(self.closed(pin_name));
                }
            },
        }
        Ok(())
    }
}

/// The context handed to a node when it is run.
pub struct NodeContext {
    pub inputs: HashMap<String, mpsc::Receiver<Packet>>,
    pub control_rx: mpsc::Receiver<NodeControlMessage>,
    pub output_sender: OutputSender,
    /// State transitions, best-effort.
    pub state_tx: mpsc::Sender<NodeStateUpdate>,
    /// Throttled statistics, best-effort.
    pub stats_tx: Option<mpsc::Sender<NodeStatsUpdate>>,
    /// Cancelled when the pipeline tears down; nodes should exit promptly.
    pub cancellation_token: Option<CancellationToken>,
    /// Only provided for nodes that support dynamic pins.
    pub pin_management_rx: Option<mpsc::Receiver<PinManagementMessage>>,
}

impl NodeContext {
    /// Removes and returns the receiver for an input pin.
    ///
    /// # Errors
    ///
    /// Returns `MuxKitError::Runtime` if the host did not provide the pin.
    pub fn take_input(&mut self, pin_name: &str) -> Result<mpsc::Receiver<Packet>, MuxKitError> {
        self.inputs.remove(pin_name).ok_or_else(|| {
            MuxKitError::Runtime(format!("Host did not provide '{pin_name}' pin receiver"))
        })
    }

    /// Resolves when the cancellation token fires; never resolves without one.
    pub async fn cancelled(&self) {
        match &self.cancellation_token {
            Some(token) => token.cancelled().await,
            None => std::future::pending().await,
        }
    }
}

/// The fundamental trait for any processing node, designed as an actor.
#[async_trait]
pub trait ProcessorNode: Send + Sync {
    fn input_pins(&self) -> Vec<InputPin>;

    fn output_pins(&self) -> Vec<OutputPin>;

    /// MIME type of the self-contained stream this node produces, if any.
    fn content_type(&self) -> Option<String> {
        None
    }

    /// Whether the node handles [`PinManagementMessage`]s while running.
    fn supports_dynamic_pins(&self) -> bool {
        false
    }

    /// The main actor loop. The host spawns this as a task.
    async fn run(self: Box<Self>, context: NodeContext) -> Result<(), MuxKitError>;
}

/// Creates a node instance from optional JSON configuration.
pub type NodeFactory = Arc<
    dyn Fn(Option<&serde_json::Value>) -> Result<Box<dyn ProcessorNode>, MuxKitError>
        + Send
        + Sync,
>;
