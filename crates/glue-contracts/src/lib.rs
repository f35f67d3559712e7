//! Boundary contracts (component C8).
//!
//! These traits describe the external collaborators the library is built
//! against but does not implement: HTTP connection I/O, TLS session
//! handling, and raw socket polling. Real implementations live outside this
//! crate (an HTTP server framework, a TLS stack, the OS socket API); here we
//! only pin down the narrow surface the transport and bridge layers need.
//!
//! Composition over inheritance: an `HttpConnection` implementation is
//! expected to hold a `Connection`, which holds a `Socket` (see DESIGN.md,
//! §9 of SPEC_FULL.md). Shared read/write/shutdown behavior is expressed as
//! small capability traits rather than a class hierarchy.

use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io;

/// Minimal byte-oriented read capability, independent of the concrete carrier.
#[async_trait]
pub trait ReadFramed {
    /// Reads the next chunk of bytes, or `None` on orderly EOF.
    async fn read_chunk(&mut self) -> io::Result<Option<Bytes>>;
}

/// Minimal byte-oriented write capability.
#[async_trait]
pub trait WriteFramed {
    async fn write_chunk(&mut self, bytes: Bytes) -> io::Result<()>;
    async fn flush(&mut self) -> io::Result<()>;
}

/// Half-close capability, independent of full socket shutdown semantics.
#[async_trait]
pub trait Shutdown {
    async fn shutdown(&mut self) -> io::Result<()>;
}

/// HTTP request/response boundary used by the long-polling transport (C4).
///
/// Implementations parse headers/chunked or keep-alive framing elsewhere;
/// this crate only needs the narrow request-body / response-write surface.
#[async_trait]
pub trait HttpConnection: ReadFramed + WriteFramed + Shutdown + Send {
    /// Reads the full request body, honoring `Content-Length` if present.
    async fn read_body(&mut self) -> io::Result<Bytes>;

    /// Writes response status + headers. Must be called before any body bytes.
    async fn write_response_head(&mut self, status: u16, headers: &[(&str, &str)]) -> io::Result<()>;

    /// Whether the underlying connection should be kept alive after this exchange.
    fn keep_alive(&self) -> bool;

    /// The path component of the request currently being served, if any.
    fn current_path(&self) -> Option<&str>;

    /// The `Host` header of the request currently being served, if any.
    fn current_host(&self) -> Option<&str>;
}

/// TLS session boundary (handshake + record I/O), used opaquely by the
/// transport layer: once "ready", a `TlsSession` behaves as an opaque
/// `ReadFramed + WriteFramed` carrier.
pub trait TlsSession: Send {
    /// Feeds plaintext bytes to be encrypted and queued for the peer.
    fn feed_plaintext(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Feeds raw ciphertext bytes received from the peer.
    fn feed_ciphertext(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Advances the handshake state machine by one step.
    fn handshake_step(&mut self) -> io::Result<TlsHandshakeStatus>;

    fn status(&self) -> TlsSessionStatus;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsHandshakeStatus {
    NeedMoreCiphertext,
    NeedToFlushCiphertext,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsSessionStatus {
    Handshaking,
    /// Credentials are immutable from this point on (one-shot transition, §5 of SPEC_FULL.md).
    Ready,
    Closed,
}

/// Raw socket boundary (bind/listen/accept/connect/send/recv/close).
#[async_trait]
pub trait Socket: Send {
    async fn connect(addr: SocketAddr) -> io::Result<Self>
    where
        Self: Sized;

    async fn send(&mut self, bytes: &[u8]) -> io::Result<usize>;
    async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    async fn close(&mut self) -> io::Result<()>;

    fn peer_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
pub trait Listener: Send {
    type Accepted: Socket;

    async fn bind(addr: SocketAddr) -> io::Result<Self>
    where
        Self: Sized;

    async fn accept(&mut self) -> io::Result<(Self::Accepted, SocketAddr)>;
}
