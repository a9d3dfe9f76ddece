// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Multi-stream container muxer.
//!
//! Any number of encoded video and audio inputs are collected, negotiated
//! against the output format and interleaved by timestamp into a muxing
//! library. One node kind is registered per output format.

pub mod backend;
pub mod codec;
pub mod error;
pub mod estimator;
pub mod formats;
pub mod negotiation;
pub mod node;
pub mod port;
pub mod scheduler;
pub mod streams;

#[cfg(feature = "ogg")]
pub mod ogg;
#[cfg(feature = "webm")]
pub mod webm;

#[cfg(test)]
mod tests;

pub use error::MuxError;
pub use formats::{FormatDescriptor, FormatTable};
pub use node::{AvMuxerConfig, AvMuxerNode, MuxMetrics};
pub use scheduler::{CollectOutcome, MuxSession, SessionState};

use muxkit_core::{config_helpers, NodeRegistry, ProcessorNode};
use schemars::schema_for;
use std::sync::Arc;

/// Registers `containers::avmux::<format>` for every built-in format.
///
/// # Panics
///
/// Panics if the config schema cannot be serialized to JSON (should never happen).
#[allow(clippy::expect_used)] // Schema serialization should never fail for valid types
pub fn register_avmux_nodes(registry: &mut NodeRegistry) {
    let schema = serde_json::to_value(schema_for!(AvMuxerConfig))
        .expect("AvMuxerConfig schema should serialize to JSON");

    for format in FormatTable::builtin().iter() {
        register_format(registry, format.clone(), schema.clone());
    }
}

/// Registers one node kind for `format`.
pub fn register_format(
    registry: &mut NodeRegistry,
    format: Arc<FormatDescriptor>,
    schema: serde_json::Value,
) {
    let kind = format!("containers::avmux::{}", format.id);
    let description = format!(
        "Muxes encoded video and audio inputs into a {} stream. \
         Inputs are interleaved by timestamp; pins can be requested until muxing starts.",
        format.long_name
    );
    let categories = vec!["containers".to_string(), format.id.to_string()];
    registry.register_dynamic_with_description(
        &kind,
        move |params| {
            let config: AvMuxerConfig = config_helpers::parse_config_optional(params)?;
            Ok(Box::new(AvMuxerNode::new(format.clone(), config)?) as Box<dyn ProcessorNode>)
        },
        schema,
        categories,
        description,
    );
}
