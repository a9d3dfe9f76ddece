// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Helpers for parsing node configuration from JSON values.

/// Helper functions for parsing node configuration.
pub mod config_helpers {
    use crate::error::MuxKitError;
    use serde::Deserialize;

    /// Parses configuration, falling back to `T::default()` when absent.
    ///
    /// # Errors
    ///
    /// Returns `MuxKitError::Configuration` if `params` is present but malformed.
    /// A misspelled field should not silently produce a default muxer.
    pub fn parse_config_optional<T>(params: Option<&serde_json::Value>) -> Result<T, MuxKitError>
    where
        T: for<'de> Deserialize<'de> + Default,
    {
        match params {
            None | Some(serde_json::Value::Null) => Ok(T::default()),
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|e| MuxKitError::Configuration(format!("Failed to parse config: {e}"))),
        }
    }

    /// Parses configuration with the node kind in the error message.
    ///
    /// # Errors
    ///
    /// Returns `MuxKitError::Configuration` if `params` is `None` or if deserialization fails.
    pub fn parse_config_with_context<T>(
        params: Option<&serde_json::Value>,
        context: &str,
    ) -> Result<T, MuxKitError>
    where
        T: for<'de> Deserialize<'de>,
    {
        params.map_or_else(
            || Err(MuxKitError::Configuration(format!("{context} configuration required"))),
            |p| {
                serde_json::from_value(p.clone()).map_err(|e| {
                    MuxKitError::Configuration(format!("Failed to parse {context}: {e}"))
                })
            },
        )
    }

}
