// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Delivery of parsed messages and raw chunk diagnostics to the downstream pipeline.
//!
//! Every event goes through one unbounded channel, so for a given sender the raw envelope of a
//! chunk is always observed before the messages that chunk produced.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use tokio::sync::mpsc;
use tracing::{error, trace};

use crate::config::Protocol;
use crate::session::SenderKey;

/// Messages produced by one append-and-scan cycle (or one forced flush) of a sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageBatch {
    pub sender: SenderKey,
    pub messages: Vec<String>,
}

/// A chunk exactly as it came off the socket, before tokenization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDataEnvelope {
    pub data: Vec<u8>,
    pub protocol: Protocol,
    pub sender_key: SenderKey,
    /// Wall-clock receive time
    pub timestamp: SystemTime,
    /// Monotonic receive time
    pub monotonic_time: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiverEvent {
    Messages(MessageBatch),
    RawData(RawDataEnvelope),
}

/// Cloneable sending side shared by the socket tasks and the session service.
#[derive(Debug, Clone)]
pub struct Publisher {
    tx: mpsc::UnboundedSender<ReceiverEvent>,
    raw_forwarding: Arc<AtomicBool>,
}

impl Publisher {
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ReceiverEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let publisher = Self {
            tx,
            raw_forwarding: Arc::new(AtomicBool::new(false)),
        };
        (publisher, rx)
    }

    pub fn enable_raw_data_forwarding(&self) {
        self.raw_forwarding.store(true, Ordering::Release);
    }

    pub fn disable_raw_data_forwarding(&self) {
        self.raw_forwarding.store(false, Ordering::Release);
    }

    #[must_use]
    pub fn raw_data_forwarding(&self) -> bool {
        self.raw_forwarding.load(Ordering::Acquire)
    }

    pub fn publish_messages(&self, sender: SenderKey, messages: Vec<String>) {
        trace!("Publishing {} messages from {}", messages.len(), sender);
        if let Err(e) = self
            .tx
            .send(ReceiverEvent::Messages(MessageBatch { sender, messages }))
        {
            error!("Failed to publish messages from {}: {}", sender, e);
        }
    }

    /// Publishes the raw chunk when forwarding is enabled at the time of the call.
    pub fn publish_raw(
        &self,
        sender: SenderKey,
        data: &[u8],
        timestamp: SystemTime,
        monotonic_time: Instant,
    ) {
        if !self.raw_data_forwarding() {
            return;
        }
        let envelope = RawDataEnvelope {
            data: data.to_vec(),
            protocol: sender.protocol(),
            sender_key: sender,
            timestamp,
            monotonic_time,
        };
        if let Err(e) = self.tx.send(ReceiverEvent::RawData(envelope)) {
            error!("Failed to publish raw data from {}: {}", sender, e);
        }
    }
}
