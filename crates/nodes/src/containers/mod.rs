// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! This module contains all built-in container format (muxer) nodes.

use muxkit_core::NodeRegistry;

pub mod avmux;

/// Registers all available container nodes with the engine's registry.
pub fn register_container_nodes(registry: &mut NodeRegistry) {
    avmux::register_avmux_nodes(registry);
}
