#![expect(
    clippy::module_name_repetitions,
    reason = "Error types include the module name to indicate their scope"
)]

use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// The client has been disposed; no further operations are accepted
    Disposed,
    /// Invalid input supplied by the caller (empty URL, malformed URL, empty message)
    Validation,
    /// Establishing the WebSocket connection failed
    Connect,
    /// Writing an outbound frame failed
    Send,
    /// The close handshake failed
    Close,
    /// The current transport is not the requested concrete type
    Cast,
    /// Error on an established WebSocket connection
    WebSocket,
    /// Internal error from dependencies
    Internal,
}

#[derive(Debug)]
pub struct Error {
    kind: Kind,
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
    backtrace: Backtrace,
}

impl Error {
    pub fn with_source<S: StdError + Send + Sync + 'static>(kind: Kind, source: S) -> Self {
        Self {
            kind,
            source: Some(Box::new(source)),
            backtrace: Backtrace::capture(),
        }
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    pub fn inner(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.source.as_deref()
    }

    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        let e = self.source.as_deref()?;
        e.downcast_ref::<E>()
    }

    pub fn disposed() -> Self {
        Disposed.into()
    }

    pub fn validation<S: Into<String>>(message: S) -> Self {
        Validation {
            reason: message.into(),
        }
        .into()
    }

    pub fn cast(expected: &'static str) -> Self {
        Cast { expected }.into()
    }

    pub fn connect<S: Into<String>>(url: S, source: Arc<Error>) -> Self {
        ConnectFailed {
            url: url.into(),
            source,
        }
        .into()
    }

    /// Whether this error originates from scope cancellation rather than a
    /// genuine failure. Cancellation is treated as clean termination.
    #[must_use]
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self.downcast_ref::<SessionError>(),
            Some(SessionError::Cancelled)
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(src) => write!(f, "{:?}: {}", self.kind, src),
            None => write!(f, "{:?}", self.kind),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn StdError + 'static))
    }
}

/// Errors raised on an established session.
#[non_exhaustive]
#[derive(Debug)]
pub enum SessionError {
    /// Error connecting to or communicating with the WebSocket server
    Connection(tokio_tungstenite::tungstenite::Error),
    /// The WebSocket connection was closed
    ConnectionClosed,
    /// No transport is currently connected
    NotConnected,
    /// Received an invalid or unexpected frame
    InvalidFrame(String),
    /// The operation was interrupted by scope cancellation
    Cancelled,
    /// A subscriber stream lagged and missed messages
    Lagged {
        /// Number of messages that were missed
        count: u64,
    },
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection(e) => write!(f, "WebSocket connection error: {e}"),
            Self::ConnectionClosed => write!(f, "WebSocket connection closed"),
            Self::NotConnected => write!(f, "no WebSocket connection is established"),
            Self::InvalidFrame(msg) => write!(f, "invalid WebSocket frame: {msg}"),
            Self::Cancelled => write!(f, "operation cancelled"),
            Self::Lagged { count } => write!(f, "subscriber lagged, missed {count} messages"),
        }
    }
}

impl StdError for SessionError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Connection(e) => Some(e),
            _ => None,
        }
    }
}

impl From<SessionError> for Error {
    fn from(e: SessionError) -> Self {
        Error::with_source(Kind::WebSocket, e)
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::with_source(Kind::WebSocket, SessionError::Connection(e))
    }
}

#[non_exhaustive]
#[derive(Debug, Clone, Copy)]
pub struct Disposed;

impl fmt::Display for Disposed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client already disposed, no further operations accepted")
    }
}

impl StdError for Disposed {}

impl From<Disposed> for Error {
    fn from(err: Disposed) -> Self {
        Error::with_source(Kind::Disposed, err)
    }
}

#[non_exhaustive]
#[derive(Debug)]
pub struct Validation {
    pub reason: String,
}

impl fmt::Display for Validation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid: {}", self.reason)
    }
}

impl StdError for Validation {}

impl From<Validation> for Error {
    fn from(err: Validation) -> Self {
        Error::with_source(Kind::Validation, err)
    }
}

/// Error indicating a failed connection attempt, carrying the shared cause
/// that was also delivered to disconnection subscribers.
#[non_exhaustive]
#[derive(Debug)]
pub struct ConnectFailed {
    /// Target URL of the failed attempt
    pub url: String,
    source: Arc<Error>,
}

impl ConnectFailed {
    /// The underlying connection error.
    #[must_use]
    pub fn cause(&self) -> &Error {
        &self.source
    }
}

impl fmt::Display for ConnectFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to connect to {}: {}", self.url, self.source)
    }
}

impl StdError for ConnectFailed {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.source.as_ref() as &(dyn StdError + 'static))
    }
}

impl From<ConnectFailed> for Error {
    fn from(err: ConnectFailed) -> Self {
        Error::with_source(Kind::Connect, err)
    }
}

#[non_exhaustive]
#[derive(Debug, Clone, Copy)]
pub struct Cast {
    /// Name of the concrete transport type the caller asked for
    pub expected: &'static str,
}

impl fmt::Display for Cast {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "current transport is not a {}", self.expected)
    }
}

impl StdError for Cast {}

impl From<Cast> for Error {
    fn from(err: Cast) -> Self {
        Error::with_source(Kind::Cast, err)
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Error::with_source(Kind::Validation, e)
    }
}
