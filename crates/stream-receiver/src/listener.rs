// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Socket tasks for each enabled protocol.
//!
//! Every socket is bound inside its own task, which reports back once it is ready to receive.
//! A task that dies before that report counts as a socket that closed before becoming ready.
//! Inbound bytes are stamped, optionally forwarded raw, and handed to the session service.
//! Every task stops when the generation's cancellation token fires.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use socket2::{Domain, Socket, Type};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::Protocol;
use crate::errors::ReceiverError;
use crate::publisher::Publisher;
use crate::session::SenderKey;
use crate::session_service::SessionHandle;

// Read size for stream connections, chunks of any size are reassembled downstream.
const STREAM_READ_SIZE: usize = 8192;

// Largest payload a UDP datagram can carry, so datagrams are never truncated.
const MAX_DATAGRAM_SIZE: usize = 65_535;

/// Everything a socket task needs to deliver data.
#[derive(Clone)]
pub struct ListenerContext {
    pub sessions: SessionHandle,
    pub publisher: Publisher,
    pub clock: Arc<dyn Clock>,
    pub cancel_token: CancellationToken,
}

impl ListenerContext {
    fn deliver(&self, sender: SenderKey, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.publisher
            .publish_raw(sender, data, self.clock.wall_time(), self.clock.now());
        if let Err(e) = self.sessions.chunk(sender, data.to_vec()) {
            error!("Failed to hand chunk from {} to session service: {}", sender, e);
        }
    }
}

/// A socket that confirmed it is ready.
#[derive(Debug)]
pub struct BoundSocket {
    protocol: Protocol,
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl BoundSocket {
    #[must_use]
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Waits for the socket task to finish. The caller cancels the token first.
    pub async fn closed(self) {
        if let Err(e) = self.task.await {
            error!("{} socket task on {} failed: {}", self.protocol, self.local_addr, e);
        } else {
            debug!("{} socket on {} closed", self.protocol, self.local_addr);
        }
    }
}

/// Opens one socket and waits for its ready confirmation.
pub async fn open(
    protocol: Protocol,
    address: SocketAddr,
    ctx: ListenerContext,
) -> Result<BoundSocket, ReceiverError> {
    let (ready_tx, ready_rx) = oneshot::channel();
    let task = tokio::spawn(run_socket(protocol, address, ctx, ready_tx));

    match ready_rx.await {
        Ok(Ok(local_addr)) => {
            info!("{}: listening on {}", protocol, local_addr);
            Ok(BoundSocket {
                protocol,
                local_addr,
                task,
            })
        }
        Ok(Err(source)) => {
            let _ = task.await;
            Err(ReceiverError::Bind {
                protocol,
                address: address.to_string(),
                source,
            })
        }
        Err(_) => {
            let _ = task.await;
            Err(ReceiverError::ClosedBeforeReady(protocol))
        }
    }
}

async fn run_socket(
    protocol: Protocol,
    address: SocketAddr,
    ctx: ListenerContext,
    ready_tx: oneshot::Sender<io::Result<SocketAddr>>,
) {
    match protocol {
        Protocol::Tcp => match TcpListener::bind(address).await {
            Ok(listener) => {
                if report_ready(ready_tx, listener.local_addr()) {
                    serve_stream(listener, ctx).await;
                }
            }
            Err(e) => {
                let _ = ready_tx.send(Err(e));
            }
        },
        Protocol::Udp4 | Protocol::Udp6 => match bind_datagram(protocol, address) {
            Ok(socket) => {
                if report_ready(ready_tx, socket.local_addr()) {
                    serve_datagrams(socket, protocol, ctx).await;
                }
            }
            Err(e) => {
                let _ = ready_tx.send(Err(e));
            }
        },
    }
}

fn report_ready(
    ready_tx: oneshot::Sender<io::Result<SocketAddr>>,
    local_addr: io::Result<SocketAddr>,
) -> bool {
    let ok = local_addr.is_ok();
    // the opener is gone when the send fails, nobody would ever stop this socket
    ready_tx.send(local_addr).is_ok() && ok
}

fn bind_datagram(protocol: Protocol, address: SocketAddr) -> io::Result<UdpSocket> {
    let domain = match protocol {
        Protocol::Udp6 => Domain::IPV6,
        _ => Domain::IPV4,
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(socket2::Protocol::UDP))?;
    if protocol == Protocol::Udp6 {
        // share the port with the udp4 socket instead of claiming it dual-stack
        socket.set_only_v6(true)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&address.into())?;
    UdpSocket::from_std(socket.into())
}

async fn serve_stream(listener: TcpListener, ctx: ListenerContext) {
    let mut connections = JoinSet::new();
    let mut next_connection: u64 = 0;

    loop {
        tokio::select! {
            _ = ctx.cancel_token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    next_connection += 1;
                    let sender = SenderKey::stream(peer, next_connection);
                    connections.spawn(read_stream(stream, sender, ctx.clone()));
                }
                Err(e) => warn!("Failed to accept TCP connection: {}", e),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    drop(listener);
    // connection readers watch the same token
    while connections.join_next().await.is_some() {}
}

async fn read_stream(mut stream: TcpStream, sender: SenderKey, ctx: ListenerContext) {
    debug!("Accepted connection {}", sender);
    let mut buf = vec![0u8; STREAM_READ_SIZE];

    loop {
        let read = tokio::select! {
            _ = ctx.cancel_token.cancelled() => break,
            read = stream.read(&mut buf) => read,
        };
        match read {
            Ok(0) => break,
            Ok(amt) => ctx.deliver(sender, &buf[..amt]),
            Err(e) => {
                warn!("Error reading from {}: {}", sender, e);
                break;
            }
        }
    }

    debug!("Connection {} closed", sender);
    if let Err(e) = ctx.sessions.close(sender) {
        error!("Failed to close session {}: {}", sender, e);
    }
}

async fn serve_datagrams(socket: UdpSocket, protocol: Protocol, ctx: ListenerContext) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    loop {
        tokio::select! {
            _ = ctx.cancel_token.cancelled() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok((amt, peer)) => {
                    ctx.deliver(SenderKey::datagram(protocol, peer), &buf[..amt]);
                }
                Err(e) => warn!("Error receiving on {} socket: {}", protocol, e),
            },
        }
    }
}
