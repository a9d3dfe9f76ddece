// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Node factory registry and discovery.
//!
//! - [`NodeRegistry`]: Every node kind the host can construct, keyed by name
//! - [`NodeDefinition`]: Serializable node metadata for API exposure

use crate::error::MuxKitError;
use crate::node::{NodeFactory, ProcessorNode};
use crate::pins::{InputPin, OutputPin};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use ts_rs::TS;

/// A serializable representation of a node's definition for API exposure.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, TS)]
#[ts(export)]
pub struct NodeDefinition {
    pub kind: String,
    /// What the node does, separate from the config schema's own description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub param_schema: serde_json::Value,
    pub inputs: Vec<InputPin>,
    pub outputs: Vec<OutputPin>,
    /// Hierarchical categories for UI grouping (e.g., `["containers", "webm"]`)
    pub categories: Vec<String>,
}

#[derive(Clone)]
struct NodeInfo {
    factory: NodeFactory,
    param_schema: serde_json::Value,
    categories: Vec<String>,
    description: Option<String>,
}

/// Holds all node kinds the host can construct.
#[derive(Clone, Default)]
pub struct NodeRegistry {
    info: HashMap<String, NodeInfo>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a node whose pin layout is decided by its configuration.
    ///
    /// The factory MUST be able to produce a default instance when `params` is `None`;
    /// [`definitions`](Self::definitions) uses it to discover the pins.
    pub fn register_dynamic_with_description<F>(
        &mut self,
        name: &str,
        factory: F,
        param_schema: serde_json::Value,
        categories: Vec<String>,
        description: impl Into<String>,
    ) where
        F: Fn(Option<&serde_json::Value>) -> Result<Box<dyn ProcessorNode>, MuxKitError>
            + Send
            + Sync
            + 'static,
    {
        self.insert(name, Arc::new(factory), param_schema, categories, description);
    }

    fn insert(
        &mut self,
        name: &str,
        factory: NodeFactory,
        param_schema: serde_json::Value,
        categories: Vec<String>,
        description: impl Into<String>,
    ) {
        if self.info.contains_key(name) {
            tracing::warn!(kind = name, "Replacing existing node registration");
        }
        self.info.insert(
            name.to_string(),
            NodeInfo {
                factory,
                param_schema,
                categories,
                description: Some(description.into()),
            },
        );
    }

    /// Creates an instance of a node by its registered name.
    ///
    /// # Errors
    ///
    /// Returns `MuxKitError::Runtime` if the kind is unknown, or whatever the
    /// node's factory returns for invalid configuration.
    pub fn create_node(
        &self,
        name: &str,
        params: Option<&serde_json::Value>,
    ) -> Result<Box<dyn ProcessorNode>, MuxKitError> {
        self.info.get(name).map_or_else(
            || Err(MuxKitError::Runtime(format!("Node type '{name}' not found in registry"))),
            |info| (info.factory)(params),
        )
    }

    /// Returns definitions for all registered nodes, sorted by kind.
    pub fn definitions(&self) -> Vec<NodeDefinition> {
        let mut defs = Vec::with_capacity(self.info.len());
        for (kind, info) in &self.info {
            // Pins depend on configuration, so probe a default instance.
            let (inputs, outputs) = match (info.factory)(None) {
                Ok(node) => (node.input_pins(), node.output_pins()),
                Err(e) => {
                    tracing::error!(kind = %kind, error = %e, "Failed to create temporary node instance for node definition");
                    continue;
                },
            };

            defs.push(NodeDefinition {
                kind: kind.clone(),
                description: info.description.clone(),
                param_schema: info.param_schema.clone(),
                inputs,
                outputs,
                categories: info.categories.clone(),
            });
        }
        defs.sort_by(|a, b| a.kind.cmp(&b.kind));
        defs
    }

    pub fn contains(&self, name: &str) -> bool {
        self.info.contains_key(name)
    }
}
