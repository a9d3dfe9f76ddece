// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

use muxkit_core::NodeRegistry;

pub mod containers;

#[cfg(test)]
pub mod test_utils;

/// A single function to register all built-in nodes.
pub fn register_nodes(registry: &mut NodeRegistry) {
    containers::register_container_nodes(registry);

    tracing::info!("Finished registering built-in nodes.");
}
