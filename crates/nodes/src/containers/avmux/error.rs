// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

use super::port::PortId;
use muxkit_core::MuxKitError;
use thiserror::Error;

/// Errors raised by the muxing session and its port bookkeeping.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MuxError {
    /// Ports cannot be added or removed while a session is running.
    #[error("muxing already started, ports are frozen")]
    AlreadyOpen,

    #[error("unknown port {0}")]
    UnknownPort(PortId),

    #[error("a port named '{0}' already exists")]
    DuplicatePort(String),

    /// The encoding cannot be carried by this container. Recoverable: upstream
    /// may offer a different one.
    #[error("negotiation rejected on '{port}': {reason}")]
    NegotiationRejected { port: String, reason: String },

    /// Every input ended but some never agreed on an encoding.
    #[error("inputs ended without negotiating: {}", .0.join(", "))]
    NotNegotiated(Vec<String>),

    #[error("failed to open muxer output: {0}")]
    OpenFailed(String),

    #[error("muxer rejected stream parameters: {0}")]
    InitFailed(String),

    #[error("failed to write container header: {0}")]
    HeaderWriteFailed(String),
}

impl MuxError {
    /// Fatal errors end the run; the others are reported to the caller and the
    /// session keeps going.
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::NotNegotiated(_) | Self::OpenFailed(_) | Self::InitFailed(_) | Self::HeaderWriteFailed(_)
        )
    }
}

impl From<MuxError> for MuxKitError {
    fn from(err: MuxError) -> Self {
        match err {
            MuxError::AlreadyOpen | MuxError::UnknownPort(_) | MuxError::DuplicatePort(_) => {
                Self::Runtime(err.to_string())
            },
            MuxError::NegotiationRejected { .. } | MuxError::NotNegotiated(_) => {
                Self::Negotiation(err.to_string())
            },
            MuxError::OpenFailed(_) | MuxError::InitFailed(_) | MuxError::HeaderWriteFailed(_) => {
                Self::Codec(err.to_string())
            },
        }
    }
}
