// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-sender reassembly state.
//!
//! A [`Session`] is created lazily on the first chunk from a sender and lives in the
//! [`SessionStore`] until its connection closes (TCP), it is evicted after being idle (UDP) or
//! the receiver stops. Sessions never share buffers.

use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use fnv::FnvBuildHasher;
use hashbrown::HashMap;
use tracing::debug;

use crate::config::Protocol;
use crate::errors::TokenizeError;
use crate::tokenizer::LineBuffer;

/// Identity of an independent stream.
///
/// Datagram senders are identified by protocol family and remote endpoint. Stream senders also
/// carry the sequence number of their connection so a reconnect from the same remote port never
/// resumes a previous connection's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SenderKey {
    protocol: Protocol,
    peer: SocketAddr,
    connection: Option<u64>,
}

impl SenderKey {
    #[must_use]
    pub fn datagram(protocol: Protocol, peer: SocketAddr) -> Self {
        Self {
            protocol,
            peer,
            connection: None,
        }
    }

    #[must_use]
    pub fn stream(peer: SocketAddr, connection: u64) -> Self {
        Self {
            protocol: Protocol::Tcp,
            peer,
            connection: Some(connection),
        }
    }

    #[must_use]
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    #[must_use]
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

impl fmt::Display for SenderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.connection {
            Some(id) => write!(f, "{}://{}#{}", self.protocol, self.peer, id),
            None => write!(f, "{}://{}", self.protocol, self.peer),
        }
    }
}

#[derive(Debug)]
pub struct Session {
    key: SenderKey,
    buffer: LineBuffer,
    last_activity: Instant,
    chunks_received: u64,
    bytes_received: u64,
}

impl Session {
    #[must_use]
    pub fn new(key: SenderKey, now: Instant) -> Self {
        Self {
            key,
            buffer: LineBuffer::new(),
            last_activity: now,
            chunks_received: 0,
            bytes_received: 0,
        }
    }

    #[must_use]
    pub fn key(&self) -> SenderKey {
        self.key
    }

    #[must_use]
    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }

    #[must_use]
    pub fn chunks_received(&self) -> u64 {
        self.chunks_received
    }

    #[must_use]
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    /// Time since the last chunk was appended.
    #[must_use]
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    /// Appends a chunk and returns the messages it completed.
    ///
    /// Only accepted chunks count as activity, a rejected one leaves the session untouched.
    pub fn append(
        &mut self,
        chunk: &[u8],
        now: Instant,
        max_buffer_size: usize,
    ) -> Result<Vec<String>, TokenizeError> {
        if chunk.is_empty() {
            return Ok(Vec::new());
        }
        let messages = self.buffer.push(chunk, max_buffer_size)?;
        self.last_activity = now;
        self.chunks_received += 1;
        self.bytes_received += chunk.len() as u64;
        Ok(messages)
    }

    /// Emits whatever is pending, terminated or not.
    pub fn flush(&mut self) -> Vec<String> {
        self.buffer.flush()
    }
}

/// Keyed arena of live sessions.
#[derive(Debug)]
pub struct SessionStore {
    sessions: HashMap<SenderKey, Session, FnvBuildHasher>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            sessions: HashMap::with_hasher(FnvBuildHasher::default()),
        }
    }

    /// Returns the sender's session, creating it on first contact.
    pub fn get_or_create(&mut self, key: SenderKey, now: Instant) -> &mut Session {
        self.sessions.entry(key).or_insert_with(|| {
            debug!("Creating session for {}", key);
            Session::new(key, now)
        })
    }

    #[must_use]
    pub fn get(&self, key: &SenderKey) -> Option<&Session> {
        self.sessions.get(key)
    }

    /// Removes a session, handing it back so the caller can flush it.
    pub fn evict(&mut self, key: &SenderKey) -> Option<Session> {
        let session = self.sessions.remove(key);
        if let Some(session) = &session {
            debug!(
                "Evicting session for {} after {} chunks ({} bytes)",
                key,
                session.chunks_received(),
                session.bytes_received()
            );
        }
        session
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Session> {
        self.sessions.values_mut()
    }

    /// Removes every session.
    pub fn drain(&mut self) -> impl Iterator<Item = Session> + '_ {
        self.sessions.drain().map(|(_, session)| session)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const MAX: usize = 1024;

    fn peer(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_sender_key_identity() {
        let udp = SenderKey::datagram(Protocol::Udp4, peer(4000));
        assert_eq!(udp, SenderKey::datagram(Protocol::Udp4, peer(4000)));
        assert_ne!(udp, SenderKey::datagram(Protocol::Udp4, peer(4001)));
        assert_ne!(udp, SenderKey::datagram(Protocol::Udp6, peer(4000)));
        assert_ne!(SenderKey::stream(peer(4000), 1), SenderKey::stream(peer(4000), 2));
    }

    #[test]
    fn test_sender_key_display() {
        assert_eq!(
            SenderKey::datagram(Protocol::Udp4, peer(4000)).to_string(),
            "udp4://127.0.0.1:4000"
        );
        assert_eq!(
            SenderKey::stream(peer(4000), 7).to_string(),
            "tcp://127.0.0.1:4000#7"
        );
    }

    #[test]
    fn test_sessions_do_not_share_buffers() {
        let now = Instant::now();
        let mut store = SessionStore::new();
        let a = SenderKey::datagram(Protocol::Udp4, peer(1));
        let b = SenderKey::datagram(Protocol::Udp4, peer(2));

        assert!(store
            .get_or_create(a, now)
            .append(b"from-a ", now, MAX)
            .unwrap()
            .is_empty());
        assert_eq!(
            store.get_or_create(b, now).append(b"from-b\n", now, MAX).unwrap(),
            vec!["from-b"]
        );
        assert_eq!(
            store.get_or_create(a, now).append(b"done\n", now, MAX).unwrap(),
            vec!["from-a done"]
        );
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_append_tracks_activity() {
        let start = Instant::now();
        let mut session = Session::new(SenderKey::stream(peer(9), 1), start);
        let later = start + Duration::from_secs(3);

        session.append(b"abc", later, MAX).unwrap();
        assert_eq!(session.last_activity(), later);
        assert_eq!(session.pending_len(), 3);
        assert_eq!(session.chunks_received(), 1);
        assert_eq!(session.bytes_received(), 3);
        assert_eq!(
            session.idle_for(later + Duration::from_secs(1)),
            Duration::from_secs(1)
        );
        // a clock behind the last activity never underflows
        assert_eq!(session.idle_for(start), Duration::ZERO);
    }

    #[test]
    fn test_empty_chunk_does_not_touch_activity() {
        let start = Instant::now();
        let mut session = Session::new(SenderKey::stream(peer(9), 1), start);
        session
            .append(b"", start + Duration::from_secs(5), MAX)
            .unwrap();
        assert_eq!(session.last_activity(), start);
        assert_eq!(session.chunks_received(), 0);
    }

    #[test]
    fn test_rejected_chunk_is_not_activity() {
        let start = Instant::now();
        let mut session = Session::new(SenderKey::datagram(Protocol::Udp4, peer(9)), start);
        session.append(b"ok", start, MAX).unwrap();

        let later = start + Duration::from_secs(5);
        assert!(session.append(&[0xFF, b'\n'], later, MAX).is_err());
        assert_eq!(session.last_activity(), start);
        assert_eq!(session.chunks_received(), 1);
        assert_eq!(session.bytes_received(), 2);
        assert_eq!(session.idle_for(later), Duration::from_secs(5));
        assert_eq!(session.pending_len(), 2);
    }

    #[test]
    fn test_evict_and_drain() {
        let now = Instant::now();
        let mut store = SessionStore::new();
        let a = SenderKey::stream(peer(1), 1);
        let b = SenderKey::stream(peer(2), 2);
        store.get_or_create(a, now).append(b"tail", now, MAX).unwrap();
        store.get_or_create(b, now);

        let mut evicted = store.evict(&a).unwrap();
        assert_eq!(evicted.flush(), vec!["tail"]);
        assert!(store.evict(&a).is_none());
        assert!(store.get(&b).is_some());

        assert_eq!(store.drain().count(), 1);
        assert!(store.is_empty());
    }
}
