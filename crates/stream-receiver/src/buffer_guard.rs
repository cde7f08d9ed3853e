// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Time bound on unflushed sender data.
//!
//! The guard is a timer that asks the session service to [`sweep`] the store at a fixed
//! cadence. A session is stale once `max_buffer_timeout` has passed since its last appended
//! chunk. A stale session with pending bytes is flushed, and a stale datagram session is
//! evicted as well since UDP has no close signal to end it. Stream sessions stay until their
//! connection closes.
//!
//! The eviction trigger is time since the last chunk, checked only when the timer fires, so a
//! UDP sender can linger for up to `max_buffer_timeout + sweep_interval` before it is dropped.

use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::session::{SenderKey, SessionStore};
use crate::session_service::SessionHandle;

#[derive(Debug, Default)]
pub struct SweepOutcome {
    /// Forced flushes, one entry per stale session that had pending data
    pub flushed: Vec<(SenderKey, Vec<String>)>,
    /// Datagram sessions removed from the store
    pub evicted: Vec<SenderKey>,
}

/// Flushes stale sessions and evicts stale datagram sessions.
pub fn sweep(store: &mut SessionStore, now: Instant, max_buffer_timeout: Duration) -> SweepOutcome {
    let mut outcome = SweepOutcome::default();

    for session in store.iter_mut() {
        if session.idle_for(now) < max_buffer_timeout {
            continue;
        }
        if session.pending_len() > 0 {
            outcome.flushed.push((session.key(), session.flush()));
        }
        if session.key().protocol().is_datagram() {
            outcome.evicted.push(session.key());
        }
    }

    for key in &outcome.evicted {
        store.evict(key);
    }

    if !outcome.flushed.is_empty() || !outcome.evicted.is_empty() {
        debug!(
            "Buffer guard flushed {} sessions and evicted {}",
            outcome.flushed.len(),
            outcome.evicted.len()
        );
    }

    outcome
}

/// Starts the sweep timer. It stops when `cancel_token` fires or the service goes away.
pub fn spawn(
    handle: SessionHandle,
    sweep_interval: Duration,
    cancel_token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // discard first tick, which is instantaneous

        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => break,
                _ = ticker.tick() => {
                    if handle.sweep().is_err() {
                        break;
                    }
                }
            }
        }
        debug!("Buffer guard stopped");
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::Protocol;
    use std::net::SocketAddr;

    const MAX: usize = 1024;
    const TIMEOUT: Duration = Duration::from_millis(500);

    fn udp(port: u16) -> SenderKey {
        SenderKey::datagram(Protocol::Udp4, SocketAddr::from(([127, 0, 0, 1], port)))
    }

    fn tcp(port: u16) -> SenderKey {
        SenderKey::stream(SocketAddr::from(([127, 0, 0, 1], port)), u64::from(port))
    }

    #[test]
    fn test_fresh_sessions_are_left_alone() {
        let start = Instant::now();
        let mut store = SessionStore::new();
        store.get_or_create(udp(1), start).append(b"partial", start, MAX).unwrap();

        let outcome = sweep(&mut store, start + TIMEOUT / 2, TIMEOUT);
        assert!(outcome.flushed.is_empty());
        assert!(outcome.evicted.is_empty());
        assert_eq!(store.get(&udp(1)).unwrap().pending_len(), 7);
    }

    #[test]
    fn test_stale_datagram_session_is_flushed_and_evicted() {
        let start = Instant::now();
        let mut store = SessionStore::new();
        store.get_or_create(udp(1), start).append(b"no terminator", start, MAX).unwrap();

        let outcome = sweep(&mut store, start + TIMEOUT, TIMEOUT);
        assert_eq!(
            outcome.flushed,
            vec![(udp(1), vec!["no terminator".to_string()])]
        );
        assert_eq!(outcome.evicted, vec![udp(1)]);
        assert!(store.is_empty());
    }

    #[test]
    fn test_stale_stream_session_is_flushed_but_kept() {
        let start = Instant::now();
        let mut store = SessionStore::new();
        store.get_or_create(tcp(2), start).append(b"\"open quote", start, MAX).unwrap();

        let outcome = sweep(&mut store, start + TIMEOUT * 2, TIMEOUT);
        assert_eq!(outcome.flushed, vec![(tcp(2), vec!["\"open quote".to_string()])]);
        assert!(outcome.evicted.is_empty());

        let session = store.get(&tcp(2)).unwrap();
        assert_eq!(session.pending_len(), 0);
    }

    #[test]
    fn test_idle_empty_datagram_session_is_evicted_without_flush() {
        let start = Instant::now();
        let mut store = SessionStore::new();
        store.get_or_create(udp(3), start).append(b"complete\n", start, MAX).unwrap();

        let outcome = sweep(&mut store, start + TIMEOUT, TIMEOUT);
        assert!(outcome.flushed.is_empty());
        assert_eq!(outcome.evicted, vec![udp(3)]);
    }

    #[test]
    fn test_only_stale_sessions_are_touched() {
        let start = Instant::now();
        let later = start + TIMEOUT;
        let mut store = SessionStore::new();
        store.get_or_create(udp(1), start).append(b"old", start, MAX).unwrap();
        store.get_or_create(udp(2), later).append(b"new", later, MAX).unwrap();

        let outcome = sweep(&mut store, later + TIMEOUT / 2, TIMEOUT);
        assert_eq!(outcome.flushed, vec![(udp(1), vec!["old".to_string()])]);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&udp(2)).unwrap().pending_len(), 3);
    }
}
