// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Receives newline-delimited message streams over TCP and UDP.
//!
//! Bytes from each sender are reassembled into complete messages, honoring single and double
//! quoted sections so a quoted newline does not split a message. See [`receiver::Receiver`]
//! for the entry point.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod buffer_guard;
pub mod clock;
pub mod config;
pub mod errors;
pub mod listener;
pub mod publisher;
pub mod receiver;
pub mod session;
pub mod session_service;
pub mod tokenizer;

pub use config::{BufferPolicy, ListenerConfig, Protocol};
pub use errors::{ReceiverError, TokenizeError};
pub use publisher::{MessageBatch, RawDataEnvelope, ReceiverEvent};
pub use receiver::{Receiver, ReceiverState};
pub use session::SenderKey;
