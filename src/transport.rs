// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Non-blocking socket seam between replication handlers and the network.
//!
//! Handlers never block: they open a socket through a [`Connector`], then
//! poll it once per controller tick. The production [`TcpConnector`] is
//! backed by tokio; tests substitute scripted in-memory sockets.
//!
//! # Connect Status
//!
//! A pending connect may surface as an OS error rather than a status,
//! depending on the socket implementation. [`classify_connect_error`] maps
//! those errnos the same way for every implementation:
//!
//! | errno | Meaning |
//! |-------|---------|
//! | `EISCONN` | Connected |
//! | `EINPROGRESS`, `EALREADY`, `EWOULDBLOCK` | Still connecting |
//! | anything else | Failed |

use crate::config::MasterEndpoint;
use bytes::{BufMut, BytesMut};
use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use tokio::net::TcpStream;

static NEXT_SOCKET_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique socket identifier, stable across handoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(u64);

impl SocketId {
    pub fn next() -> Self {
        Self(NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStatus {
    Connected,
    InProgress,
}

/// How a connect error should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectErrorClass {
    AlreadyConnected,
    InProgress,
    Failed,
}

/// Classify an error returned while polling a non-blocking connect.
pub fn classify_connect_error(err: &io::Error) -> ConnectErrorClass {
    #[cfg(unix)]
    if let Some(errno) = err.raw_os_error() {
        if errno == libc::EISCONN {
            return ConnectErrorClass::AlreadyConnected;
        }
        if errno == libc::EINPROGRESS || errno == libc::EALREADY || errno == libc::EWOULDBLOCK {
            return ConnectErrorClass::InProgress;
        }
    }
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => ConnectErrorClass::InProgress,
        _ => ConnectErrorClass::Failed,
    }
}

/// A non-blocking connection to one master.
///
/// Dropping the socket closes it.
pub trait ReplicationSocket: Send + fmt::Debug {
    fn id(&self) -> SocketId;

    /// Advance a pending connect without blocking.
    fn poll_connect(&mut self) -> io::Result<ConnectStatus>;

    fn set_nodelay(&mut self, nodelay: bool) -> io::Result<()>;

    /// Append at most `max` readable bytes to `buf`. `Ok(0)` means the peer
    /// closed the connection; `WouldBlock` means nothing is available.
    fn try_read(&mut self, buf: &mut BytesMut, max: usize) -> io::Result<usize>;

    fn try_write(&mut self, data: &[u8]) -> io::Result<usize>;

    /// Give up the underlying tokio stream, for multiplexers that drive
    /// the connection themselves.
    fn into_tcp_stream(self: Box<Self>) -> Option<TcpStream> {
        None
    }
}

pub type BoxedSocket = Box<dyn ReplicationSocket>;

/// Opens sockets to master endpoints.
pub trait Connector: Send + Sync {
    /// Start a non-blocking connect. Must not wait for it to complete.
    fn open(&self, endpoint: &MasterEndpoint) -> io::Result<BoxedSocket>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// tokio-backed TCP
// ═══════════════════════════════════════════════════════════════════════════════

type ConnectFuture = Pin<Box<dyn Future<Output = io::Result<TcpStream>> + Send>>;

enum TcpState {
    Connecting(ConnectFuture),
    Connected(TcpStream),
    Failed,
}

/// TCP socket driven by polling tokio's connect future with a no-op waker.
///
/// Readiness is recorded by the tokio reactor, so it must be polled from a
/// thread inside a tokio runtime.
pub struct TcpSocket {
    id: SocketId,
    peer: SocketAddr,
    state: TcpState,
}

impl fmt::Debug for TcpSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state {
            TcpState::Connecting(_) => "connecting",
            TcpState::Connected(_) => "connected",
            TcpState::Failed => "failed",
        };
        f.debug_struct("TcpSocket")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("state", &state)
            .finish()
    }
}

impl TcpSocket {
    fn stream(&mut self) -> io::Result<&mut TcpStream> {
        match &mut self.state {
            TcpState::Connected(stream) => Ok(stream),
            _ => Err(io::Error::from(io::ErrorKind::NotConnected)),
        }
    }
}

impl ReplicationSocket for TcpSocket {
    fn id(&self) -> SocketId {
        self.id
    }

    fn poll_connect(&mut self) -> io::Result<ConnectStatus> {
        let fut = match &mut self.state {
            TcpState::Connected(_) => return Ok(ConnectStatus::Connected),
            TcpState::Failed => return Err(io::Error::from(io::ErrorKind::NotConnected)),
            TcpState::Connecting(fut) => fut,
        };
        let mut cx = Context::from_waker(futures::task::noop_waker_ref());
        let polled = fut.as_mut().poll(&mut cx);
        match polled {
            Poll::Pending => Ok(ConnectStatus::InProgress),
            Poll::Ready(Ok(stream)) => {
                self.state = TcpState::Connected(stream);
                Ok(ConnectStatus::Connected)
            }
            Poll::Ready(Err(e)) => {
                self.state = TcpState::Failed;
                Err(e)
            }
        }
    }

    fn set_nodelay(&mut self, nodelay: bool) -> io::Result<()> {
        self.stream()?.set_nodelay(nodelay)
    }

    fn try_read(&mut self, buf: &mut BytesMut, max: usize) -> io::Result<usize> {
        let stream = self.stream()?;
        buf.reserve(max);
        let mut limited = (&mut *buf).limit(max);
        stream.try_read_buf(&mut limited)
    }

    fn try_write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.stream()?.try_write(data)
    }

    fn into_tcp_stream(self: Box<Self>) -> Option<TcpStream> {
        match self.state {
            TcpState::Connected(stream) => Some(stream),
            _ => None,
        }
    }
}

/// [`Connector`] producing [`TcpSocket`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    fn open(&self, endpoint: &MasterEndpoint) -> io::Result<BoxedSocket> {
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "TcpConnector requires a tokio runtime",
            ));
        }
        let peer = endpoint
            .socket_addr()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
        Ok(Box::new(TcpSocket {
            id: SocketId::next(),
            peer,
            state: TcpState::Connecting(Box::pin(TcpStream::connect(peer))),
        }))
    }
}
