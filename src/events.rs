use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::Error;
use crate::message::CloseCode;

/// Cause of a (re)connection being established.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectionKind {
    /// First connection after `start`
    Initial,
    /// Reconnection after the stream was lost unexpectedly
    Lost,
    /// Reconnection fired by the no-message watchdog
    NoMessageReceived,
    /// Reconnection after a failed connection attempt
    Error,
    /// Reconnection requested by the user
    ByUser,
}

/// Event published on every established connection.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reconnection {
    /// What triggered this connection
    pub kind: ReconnectionKind,
}

impl Reconnection {
    pub(crate) fn new(kind: ReconnectionKind) -> Self {
        Self { kind }
    }
}

/// Cause of a disconnection.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectionKind {
    /// The client was disposed while running
    Exit,
    /// The no-message watchdog fired
    NoMessageReceived,
    /// A connection attempt failed
    Error,
    /// The stream was lost unexpectedly
    Lost,
    /// The server sent a close frame
    ByServer,
    /// The user called `stop`
    ByUser,
}

/// Event describing a disconnection.
///
/// Hooks registered with `on_disconnection` receive the event *before* the
/// controller acts on it and may set the cancel flags to intercept the
/// default behavior. The flags are shared between clones, so the copy
/// delivered on the broadcast stream observes the final values, but writes
/// from broadcast subscribers arrive too late to influence the controller.
#[derive(Debug, Clone)]
pub struct Disconnection {
    kind: DisconnectionKind,
    close_code: Option<CloseCode>,
    close_reason: Option<String>,
    error: Option<Arc<Error>>,
    cancel_reconnection: Arc<AtomicBool>,
    cancel_closing: Arc<AtomicBool>,
}

impl Disconnection {
    fn new(kind: DisconnectionKind) -> Self {
        Self {
            kind,
            close_code: None,
            close_reason: None,
            error: None,
            cancel_reconnection: Arc::new(AtomicBool::new(false)),
            cancel_closing: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn exit() -> Self {
        Self::new(DisconnectionKind::Exit)
    }

    pub(crate) fn of_kind(kind: DisconnectionKind, error: Option<Arc<Error>>) -> Self {
        let mut info = Self::new(kind);
        info.error = error;
        info
    }

    pub(crate) fn by_user(code: CloseCode, reason: impl Into<String>) -> Self {
        let mut info = Self::new(DisconnectionKind::ByUser);
        info.close_code = Some(code);
        info.close_reason = Some(reason.into());
        info
    }

    pub(crate) fn by_server(code: Option<CloseCode>, reason: Option<String>) -> Self {
        let mut info = Self::new(DisconnectionKind::ByServer);
        info.close_code = code;
        info.close_reason = reason;
        info
    }

    pub(crate) fn error_disconnection(cause: Arc<Error>) -> Self {
        let mut info = Self::new(DisconnectionKind::Error);
        info.error = Some(cause);
        info
    }

    #[must_use]
    pub fn kind(&self) -> DisconnectionKind {
        self.kind
    }

    /// Close status code, present for server- and user-initiated closes.
    #[must_use]
    pub fn close_code(&self) -> Option<CloseCode> {
        self.close_code
    }

    #[must_use]
    pub fn close_reason(&self) -> Option<&str> {
        self.close_reason.as_deref()
    }

    /// The error that caused this disconnection, if any.
    #[must_use]
    pub fn error(&self) -> Option<&Error> {
        self.error.as_deref()
    }

    /// Request that the pending automatic reconnection is skipped.
    ///
    /// Only honored when set from a hook during delivery.
    pub fn set_cancel_reconnection(&self, cancel: bool) {
        self.cancel_reconnection.store(cancel, Ordering::SeqCst);
    }

    #[must_use]
    pub fn cancel_reconnection(&self) -> bool {
        self.cancel_reconnection.load(Ordering::SeqCst)
    }

    /// Request that the close handshake with the server is skipped in favor
    /// of an immediate reconnect. Only meaningful for `ByServer` events.
    pub fn set_cancel_closing(&self, cancel: bool) {
        self.cancel_closing.store(cancel, Ordering::SeqCst);
    }

    #[must_use]
    pub fn cancel_closing(&self) -> bool {
        self.cancel_closing.load(Ordering::SeqCst)
    }
}

impl fmt::Display for Disconnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.error, &self.close_code) {
            (Some(e), _) => write!(f, "disconnected ({:?}): {e}", self.kind),
            (None, Some(code)) => write!(f, "disconnected ({:?}), close code {code}", self.kind),
            (None, None) => write!(f, "disconnected ({:?})", self.kind),
        }
    }
}

/// Synchronous hook invoked inline on every disconnection, before the
/// controller acts on the event.
pub type DisconnectHook = Arc<dyn Fn(&Disconnection) + Send + Sync>;
