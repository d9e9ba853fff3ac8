//! The transport seam between the session manager and the wire.
//!
//! The session never talks to a socket directly: it asks a
//! [`TransportFactory`] for an already-connected full-duplex frame channel
//! and drives it through the [`Transport`] trait. The default factory wraps
//! `tokio-tungstenite`; tests plug in in-process fakes.

#![expect(
    clippy::module_name_repetitions,
    reason = "Transport types expose their domain in the name for clarity"
)]

pub mod tungstenite;

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::Result;
use crate::message::CloseCode;

pub use tungstenite::{TungsteniteFactory, TungsteniteTransport};

/// Connection state of a transport, mirroring the RFC 6455 close handshake.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// No connection attempt has been made
    None,
    /// Handshake in progress
    Connecting,
    /// Connected, frames flow in both directions
    Open,
    /// We sent a close frame and await the peer's acknowledgment
    CloseSent,
    /// The peer sent a close frame
    CloseReceived,
    /// Close handshake complete
    Closed,
    /// Torn down without a handshake
    Aborted,
}

impl TransportState {
    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(self, Self::Open)
    }
}

/// Kind of a WebSocket data frame.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Text,
    Binary,
    Close,
}

/// Metadata of one received frame. The payload itself is written into the
/// caller-supplied buffer; `count` bytes of it are valid.
#[non_exhaustive]
#[derive(Debug, Clone, Copy)]
pub struct FrameInfo {
    /// Frame kind
    pub kind: FrameKind,
    /// Number of valid payload bytes in the read buffer
    pub count: usize,
    /// Whether this frame terminates a message
    pub end_of_message: bool,
    /// Close status, present on close frames
    pub close_code: Option<CloseCode>,
}

/// A connected full-duplex WebSocket frame channel.
///
/// All blocking operations observe the supplied cancellation token and
/// resolve to [`SessionError::Cancelled`] when it trips.
///
/// [`SessionError::Cancelled`]: crate::error::SessionError::Cancelled
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Write one frame. `end_of_message` marks the final frame of a message.
    async fn send(
        &self,
        payload: &[u8],
        kind: FrameKind,
        end_of_message: bool,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Read the next frame into `buffer` and describe it.
    async fn receive(&self, buffer: &mut [u8], cancel: &CancellationToken) -> Result<FrameInfo>;

    /// Perform the full close handshake.
    async fn close(&self, code: CloseCode, reason: &str, cancel: &CancellationToken) -> Result<()>;

    /// Send a close frame without awaiting the peer's acknowledgment, used
    /// to acknowledge a server-initiated close.
    async fn close_output(
        &self,
        code: CloseCode,
        reason: &str,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Tear the connection down immediately, waking pending operations.
    fn abort(&self);

    /// Current connection state.
    fn state(&self) -> TransportState;

    /// Escape hatch for downcasting to the concrete transport type.
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Factory yielding connected transports, invoked on every (re)connect.
#[async_trait]
pub trait TransportFactory: Send + Sync + 'static {
    /// Establish a new connection to `url`.
    async fn connect(&self, url: &Url, cancel: &CancellationToken) -> Result<Arc<dyn Transport>>;
}
