// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Actor that owns the session store.
//!
//! Socket tasks and the buffer guard never touch sessions directly, they send commands through
//! a [`SessionHandle`]. The single [`SessionService`] task applies them one at a time, which
//! keeps every sender's chunks in arrival order without any locking.
//!
//! ```text
//!   tcp / udp4 / udp6 tasks ──┐
//!                             ├── SessionCommand ──> SessionService ──> Publisher
//!   buffer guard timer ───────┘                      (owns SessionStore)
//! ```

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, trace};

use crate::buffer_guard;
use crate::clock::Clock;
use crate::config::BufferPolicy;
use crate::publisher::Publisher;
use crate::session::{SenderKey, SessionStore};

#[derive(Debug)]
pub enum SessionCommand {
    /// Bytes received from a sender, in arrival order.
    Chunk { sender: SenderKey, data: Vec<u8> },
    /// A stream sender closed its connection.
    Close(SenderKey),
    /// Run one buffer guard pass.
    Sweep,
    SessionCount(oneshot::Sender<usize>),
    /// Flush and discard every session, then stop. Replies with the number of sessions dropped.
    Shutdown(oneshot::Sender<usize>),
}

#[derive(Clone, Debug)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<SessionCommand>,
}

impl SessionHandle {
    pub fn chunk(
        &self,
        sender: SenderKey,
        data: Vec<u8>,
    ) -> Result<(), mpsc::error::SendError<SessionCommand>> {
        self.tx.send(SessionCommand::Chunk { sender, data })
    }

    pub fn close(&self, sender: SenderKey) -> Result<(), mpsc::error::SendError<SessionCommand>> {
        self.tx.send(SessionCommand::Close(sender))
    }

    pub fn sweep(&self) -> Result<(), mpsc::error::SendError<SessionCommand>> {
        self.tx.send(SessionCommand::Sweep)
    }

    pub async fn session_count(&self) -> Result<usize, String> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(SessionCommand::SessionCount(response_tx))
            .map_err(|e| format!("Failed to send session count command: {}", e))?;

        response_rx
            .await
            .map_err(|e| format!("Failed to receive session count response: {}", e))
    }

    pub async fn shutdown(&self) -> Result<usize, String> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(SessionCommand::Shutdown(response_tx))
            .map_err(|e| format!("Failed to send shutdown command: {}", e))?;

        response_rx
            .await
            .map_err(|e| format!("Failed to receive shutdown response: {}", e))
    }
}

pub struct SessionService {
    store: SessionStore,
    policy: BufferPolicy,
    clock: Arc<dyn Clock>,
    publisher: Publisher,
    rx: mpsc::UnboundedReceiver<SessionCommand>,
}

impl SessionService {
    #[must_use]
    pub fn new(
        policy: BufferPolicy,
        clock: Arc<dyn Clock>,
        publisher: Publisher,
    ) -> (Self, SessionHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let service = Self {
            store: SessionStore::new(),
            policy,
            clock,
            publisher,
            rx,
        };
        (service, SessionHandle { tx })
    }

    pub async fn run(mut self) {
        debug!("Session service started");

        while let Some(command) = self.rx.recv().await {
            match command {
                SessionCommand::Chunk { sender, data } => self.handle_chunk(sender, &data),
                SessionCommand::Close(sender) => self.handle_close(sender),
                SessionCommand::Sweep => self.handle_sweep(),
                SessionCommand::SessionCount(response_tx) => {
                    if response_tx.send(self.store.len()).is_err() {
                        error!("Failed to send session count response - receiver dropped");
                    }
                }
                SessionCommand::Shutdown(response_tx) => {
                    let dropped = self.flush_all();
                    debug!("Session service shutting down, flushed {} sessions", dropped);
                    if response_tx.send(dropped).is_err() {
                        error!("Failed to send shutdown response - receiver dropped");
                    }
                    return;
                }
            }
        }

        // every handle is gone, nothing else can arrive
        self.flush_all();
        debug!("Session service stopped");
    }

    fn handle_chunk(&mut self, sender: SenderKey, data: &[u8]) {
        if data.is_empty() {
            return;
        }

        let now = self.clock.now();
        let session = self.store.get_or_create(sender, now);
        match session.append(data, now, self.policy.max_buffer_size) {
            Ok(messages) => {
                trace!(
                    "Chunk of {} bytes from {} produced {} messages",
                    data.len(),
                    sender,
                    messages.len()
                );
                self.publisher.publish_messages(sender, messages);
            }
            // the failing chunk was rolled back, the session and every other sender carry on
            Err(e) => error!(
                "Dropping chunk of {} bytes from {}: {}",
                data.len(),
                sender,
                e
            ),
        }
    }

    fn handle_close(&mut self, sender: SenderKey) {
        if let Some(mut session) = self.store.evict(&sender) {
            let messages = session.flush();
            if !messages.is_empty() {
                self.publisher.publish_messages(sender, messages);
            }
        }
    }

    fn handle_sweep(&mut self) {
        let outcome = buffer_guard::sweep(
            &mut self.store,
            self.clock.now(),
            self.policy.max_buffer_timeout,
        );
        for (sender, messages) in outcome.flushed {
            self.publisher.publish_messages(sender, messages);
        }
    }

    fn flush_all(&mut self) -> usize {
        let mut flushed = Vec::new();
        for mut session in self.store.drain() {
            flushed.push((session.key(), session.flush()));
        }
        let count = flushed.len();
        for (sender, messages) in flushed {
            if !messages.is_empty() {
                self.publisher.publish_messages(sender, messages);
            }
        }
        count
    }
}
