// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! MuxKit Core - node framework for multi-stream muxing pipelines.
//!
//! ## Core Modules
//!
//! - [`types`]: Packets, caps, media buffers, tags
//! - [`node`]: ProcessorNode trait and execution context
//! - [`registry`]: Node factory and discovery
//! - [`pins`]: Pin declarations and runtime pin management
//! - [`state`]: Node lifecycle states
//! - [`stats`]: Throttled node statistics
//! - [`control`]: Control messages for running nodes
//! - [`error`]: Error types
//! - [`helpers`]: Configuration parsing helpers
//!
//! ## Quick Start
//!
//! ```ignore
//! use muxkit_core::{async_trait, NodeContext, ProcessorNode, NodeRegistry};
//!
//! struct CountingNode;
//!
//! #[async_trait]
//! impl ProcessorNode for CountingNode {
//!     fn input_pins(&self) -> Vec<InputPin> { /* ... */ }
//!     fn output_pins(&self) -> Vec<OutputPin> { /* ... */ }
//!     async fn run(self: Box<Self>, ctx: NodeContext) -> Result<(), MuxKitError> { /* ... */ }
//! }
//!
//! let mut registry = NodeRegistry::new();
//! registry.register_dynamic_with_description(/* ... */);
//! ```

// Re-export async_trait for use in node implementations
pub use async_trait::async_trait;

pub mod control;
pub mod error;
pub mod helpers;
pub mod node;
pub mod pins;
pub mod registry;
pub mod state;
pub mod stats;
pub mod types;

pub use error::MuxKitError;

pub use node::{NodeContext, OutputSendError, OutputSender, ProcessorNode, RoutedPacketMessage};

pub use registry::{NodeDefinition, NodeRegistry};

pub use state::{NodeState, NodeStateUpdate, StopReason};

pub use stats::{NodeStats, NodeStatsUpdate};

pub use pins::{InputPin, OutputPin, PinCardinality};

pub use helpers::config_helpers;
pub use state::state_helpers;
