// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types for the receiver lifecycle and the tokenizer.

use crate::config::Protocol;

/// Errors surfaced by [`Receiver`](crate::receiver::Receiver) lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum ReceiverError {
    #[error("Unknown protocol '{0}', expected one of: tcp, udp4, udp6")]
    UnknownProtocol(String),

    #[error("Invalid listen address: {0}")]
    InvalidAddress(String),

    #[error("Failed to bind {protocol} socket on {address}: {source}")]
    Bind {
        protocol: Protocol,
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{0} socket closed before becoming ready")]
    ClosedBeforeReady(Protocol),

    #[error("Receiver already started")]
    AlreadyStarted,

    #[error("Session service is not running")]
    ServiceUnavailable,
}

/// Errors produced while turning a chunk into messages for one sender.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenizeError {
    #[error("Chunk is not valid UTF-8 (invalid byte at offset {offset})")]
    InvalidUtf8 {
        /// Position of the first offending byte within the rejected chunk
        offset: usize,
    },
}
