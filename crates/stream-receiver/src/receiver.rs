// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Message stream receiver lifecycle.
//!
//! A [`Receiver`] owns one *generation* at a time: the sockets for every enabled protocol, the
//! session service and the buffer guard timer, all tied to one cancellation token. `start`
//! creates a generation, `stop` tears it down, `restart` does both.
//!
//! ```rust,ignore
//! let (receiver, mut events) = Receiver::new(ListenerConfig::new(5140));
//! receiver.start().await?;
//! while let Some(event) = events.recv().await {
//!     if let ReceiverEvent::Messages(batch) = event {
//!         for message in batch.messages { /* hand over to the pipeline */ }
//!     }
//! }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::buffer_guard;
use crate::clock::{Clock, SystemClock};
use crate::config::{BufferPolicy, ListenerConfig, Protocol};
use crate::errors::ReceiverError;
use crate::listener::{self, BoundSocket, ListenerContext};
use crate::publisher::{Publisher, ReceiverEvent};
use crate::session_service::{SessionHandle, SessionService};

/// Lifecycle state of the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

struct Generation {
    cancel_token: CancellationToken,
    sockets: Vec<BoundSocket>,
    // not spawned when a start attempt fails
    guard: Option<JoinHandle<()>>,
    sessions: SessionHandle,
    service: JoinHandle<()>,
}

impl Generation {
    async fn shutdown(self) {
        self.cancel_token.cancel();
        for socket in self.sockets {
            socket.closed().await;
        }
        if let Some(guard) = self.guard {
            if let Err(e) = guard.await {
                error!("Buffer guard task failed: {}", e);
            }
        }
        // sockets are closed, so the final flush sees every chunk that was received
        match self.sessions.shutdown().await {
            Ok(count) => debug!("Discarded {} sessions", count),
            Err(e) => error!("Failed to shut down session service: {}", e),
        }
        if let Err(e) = self.service.await {
            error!("Session service task failed: {}", e);
        }
    }
}

pub struct Receiver {
    config: ListenerConfig,
    policy: BufferPolicy,
    clock: Arc<dyn Clock>,
    publisher: Publisher,
    state: RwLock<ReceiverState>,
    status_tx: broadcast::Sender<ReceiverState>,
    generation: Mutex<Option<Generation>>,
}

impl Receiver {
    /// Creates a stopped receiver with the default buffering policy and the system clock.
    ///
    /// Parsed messages (and raw chunks, once enabled) arrive on the returned channel.
    #[must_use]
    pub fn new(config: ListenerConfig) -> (Self, mpsc::UnboundedReceiver<ReceiverEvent>) {
        Self::with_policy(config, BufferPolicy::default(), Arc::new(SystemClock))
    }

    #[must_use]
    pub fn with_policy(
        config: ListenerConfig,
        policy: BufferPolicy,
        clock: Arc<dyn Clock>,
    ) -> (Self, mpsc::UnboundedReceiver<ReceiverEvent>) {
        let (publisher, events) = Publisher::new();
        let (status_tx, _status_rx) = broadcast::channel(16);
        let receiver = Self {
            config,
            policy,
            clock,
            publisher,
            state: RwLock::new(ReceiverState::Stopped),
            status_tx,
            generation: Mutex::new(None),
        };
        (receiver, events)
    }

    /// Opens a socket for every configured protocol.
    ///
    /// Protocol names and addresses are validated before anything is opened. If any socket
    /// fails to become ready, the sockets opened so far are closed again and the receiver stays
    /// stopped.
    pub async fn start(&self) -> Result<(), ReceiverError> {
        let mut generation = self.generation.lock().await;
        if generation.is_some() {
            return Err(ReceiverError::AlreadyStarted);
        }

        let protocols = self.config.parsed_protocols()?;
        let addresses = protocols
            .into_iter()
            .map(|protocol| Ok((protocol, self.config.bind_address(protocol)?)))
            .collect::<Result<Vec<_>, ReceiverError>>()?;

        self.set_state(ReceiverState::Starting).await;

        let cancel_token = CancellationToken::new();
        let (service, sessions) =
            SessionService::new(self.policy, Arc::clone(&self.clock), self.publisher.clone());
        let service = tokio::spawn(service.run());

        let ctx = ListenerContext {
            sessions: sessions.clone(),
            publisher: self.publisher.clone(),
            clock: Arc::clone(&self.clock),
            cancel_token: cancel_token.clone(),
        };

        let mut sockets = Vec::with_capacity(addresses.len());
        for (protocol, address) in addresses {
            match listener::open(protocol, address, ctx.clone()).await {
                Ok(socket) => sockets.push(socket),
                Err(e) => {
                    error!("Failed to start receiver: {}", e);
                    let failed = Generation {
                        cancel_token,
                        sockets,
                        guard: None,
                        sessions,
                        service,
                    };
                    failed.shutdown().await;
                    self.set_state(ReceiverState::Stopped).await;
                    return Err(e);
                }
            }
        }

        let guard = buffer_guard::spawn(
            sessions.clone(),
            self.policy.sweep_interval,
            cancel_token.clone(),
        );

        *generation = Some(Generation {
            cancel_token,
            sockets,
            guard: Some(guard),
            sessions,
            service,
        });
        self.set_state(ReceiverState::Running).await;
        info!("Receiver started");
        Ok(())
    }

    /// Closes every socket, flushes and discards every session and cancels the buffer guard.
    ///
    /// Does nothing when the receiver is not running.
    pub async fn stop(&self) {
        let mut generation = self.generation.lock().await;
        let Some(current) = generation.take() else {
            return;
        };

        self.set_state(ReceiverState::Stopping).await;
        current.shutdown().await;
        self.set_state(ReceiverState::Stopped).await;
        info!("Receiver stopped");
    }

    /// Stops the current generation, then starts a fresh one.
    pub async fn restart(&self) -> Result<(), ReceiverError> {
        self.stop().await;
        self.start().await
    }

    pub async fn is_running(&self) -> bool {
        matches!(*self.state.read().await, ReceiverState::Running)
    }

    pub async fn state(&self) -> ReceiverState {
        *self.state.read().await
    }

    /// Get a receiver for state transitions.
    pub fn status_receiver(&self) -> broadcast::Receiver<ReceiverState> {
        self.status_tx.subscribe()
    }

    /// Address a protocol's socket is bound to, when it is running.
    pub async fn local_addr(&self, protocol: Protocol) -> Option<SocketAddr> {
        self.generation.lock().await.as_ref().and_then(|generation| {
            generation
                .sockets
                .iter()
                .find(|socket| socket.protocol() == protocol)
                .map(BoundSocket::local_addr)
        })
    }

    /// Number of open sockets in the current generation.
    pub async fn socket_count(&self) -> usize {
        self.generation
            .lock()
            .await
            .as_ref()
            .map_or(0, |generation| generation.sockets.len())
    }

    /// Number of senders currently tracked.
    pub async fn session_count(&self) -> Result<usize, ReceiverError> {
        let sessions = self
            .generation
            .lock()
            .await
            .as_ref()
            .map(|generation| generation.sessions.clone())
            .ok_or(ReceiverError::ServiceUnavailable)?;
        sessions.session_count().await.map_err(|e| {
            debug!("{}", e);
            ReceiverError::ServiceUnavailable
        })
    }

    /// Forward every subsequently received chunk as a [`ReceiverEvent::RawData`] envelope.
    pub fn enable_raw_data_forwarding(&self) {
        self.publisher.enable_raw_data_forwarding();
    }

    pub fn disable_raw_data_forwarding(&self) {
        self.publisher.disable_raw_data_forwarding();
    }

    async fn set_state(&self, state: ReceiverState) {
        *self.state.write().await = state;
        let _ = self.status_tx.send(state);
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        // without a stop() the tasks would outlive their owner
        if let Some(generation) = self.generation.get_mut().take() {
            generation.cancel_token.cancel();
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn loopback(protocols: &[&str]) -> ListenerConfig {
        ListenerConfig::new(0)
            .with_address("127.0.0.1")
            .with_protocols(protocols.iter().copied())
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let (receiver, _events) = Receiver::new(loopback(&["tcp", "udp4"]));
        let mut status = receiver.status_receiver();
        assert_eq!(receiver.state().await, ReceiverState::Stopped);

        receiver.start().await.unwrap();
        assert!(receiver.is_running().await);
        assert_eq!(receiver.socket_count().await, 2);
        assert!(receiver.local_addr(Protocol::Tcp).await.is_some());
        assert!(receiver.local_addr(Protocol::Udp6).await.is_none());
        assert_eq!(receiver.session_count().await.unwrap(), 0);

        receiver.stop().await;
        assert!(!receiver.is_running().await);
        assert_eq!(receiver.socket_count().await, 0);
        assert!(matches!(
            receiver.session_count().await,
            Err(ReceiverError::ServiceUnavailable)
        ));

        let mut transitions = Vec::new();
        while let Ok(state) = status.try_recv() {
            transitions.push(state);
        }
        assert_eq!(
            transitions,
            vec![
                ReceiverState::Starting,
                ReceiverState::Running,
                ReceiverState::Stopping,
                ReceiverState::Stopped,
            ]
        );
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (receiver, _events) = Receiver::new(loopback(&["udp4"]));
        receiver.stop().await;
        receiver.start().await.unwrap();
        receiver.stop().await;
        receiver.stop().await;
        assert_eq!(receiver.state().await, ReceiverState::Stopped);
    }

    #[tokio::test]
    async fn test_unknown_protocol_fails_before_opening_sockets() {
        let (receiver, _events) = Receiver::new(loopback(&["tcp", "sctp"]));
        let mut status = receiver.status_receiver();

        let err = receiver.start().await.unwrap_err();
        assert!(matches!(err, ReceiverError::UnknownProtocol(ref p) if p == "sctp"));
        assert_eq!(receiver.socket_count().await, 0);
        assert_eq!(receiver.state().await, ReceiverState::Stopped);
        // never even moved to Starting
        assert!(status.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_failed_start_tears_down_partial_generation() {
        let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = occupied.local_addr().unwrap().port();
        let config = ListenerConfig::new(port)
            .with_address("127.0.0.1")
            .with_protocols(["udp4", "tcp"]);
        let (receiver, _events) = Receiver::new(config);
        let mut status = receiver.status_receiver();

        assert!(matches!(
            receiver.start().await,
            Err(ReceiverError::Bind {
                protocol: Protocol::Tcp,
                ..
            })
        ));
        assert_eq!(receiver.socket_count().await, 0);
        assert_eq!(status.try_recv().unwrap(), ReceiverState::Starting);
        assert_eq!(status.try_recv().unwrap(), ReceiverState::Stopped);
        assert!(status.try_recv().is_err());

        // nothing left behind, so a stop afterwards has nothing to do
        receiver.stop().await;
        assert!(status.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let (receiver, _events) = Receiver::new(loopback(&["udp4"]));
        receiver.start().await.unwrap();
        assert!(matches!(
            receiver.start().await,
            Err(ReceiverError::AlreadyStarted)
        ));
        assert_eq!(receiver.socket_count().await, 1);
        receiver.stop().await;
    }

    #[tokio::test]
    async fn test_restart_replaces_sockets() {
        let (receiver, _events) = Receiver::new(loopback(&["tcp", "udp4"]));
        receiver.start().await.unwrap();
        assert_eq!(receiver.socket_count().await, 2);

        receiver.restart().await.unwrap();
        assert!(receiver.is_running().await);
        assert_eq!(receiver.socket_count().await, 2);

        receiver.restart().await.unwrap();
        assert_eq!(receiver.socket_count().await, 2);
        receiver.stop().await;
    }

    #[tokio::test]
    async fn test_raw_forwarding_toggle_while_stopped() {
        let (receiver, _events) = Receiver::new(loopback(&["udp4"]));
        receiver.enable_raw_data_forwarding();
        assert!(receiver.publisher.raw_data_forwarding());
        receiver.disable_raw_data_forwarding();
        assert!(!receiver.publisher.raw_data_forwarding());
    }
}
