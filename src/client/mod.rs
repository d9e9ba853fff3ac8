//! The session manager: lifecycle controller and public facade.
//!
//! # Architecture
//!
//! [`WebsocketClient`] is a cheap-to-clone handle over the shared session
//! state. User calls, the two send workers, the receive loop, the inbound
//! dispatcher and the watchdog all observe that state concurrently; every
//! lifecycle transition goes through the controller operations in
//! `lifecycle.rs`, never through the worker tasks directly.

#![expect(
    clippy::module_name_repetitions,
    reason = "The client type carries its domain in the name for clarity"
)]

mod dispatch;
mod lifecycle;
mod receive;
mod watchdog;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Instant;

use async_stream::try_stream;
use futures::Stream;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::ClientConfig;
use crate::error::{Error, SessionError};
use crate::events::{DisconnectHook, Disconnection, Reconnection};
use crate::message::{CloseCode, Message};
use crate::queue::WorkQueue;
use crate::transport::{FrameKind, Transport, TransportFactory, TungsteniteFactory};
use crate::Result;

pub(crate) use receive::ReceivedFrame;

/// Capacity of the broadcast event streams.
const EVENT_CAPACITY: usize = 1024;

/// A resilient WebSocket session.
///
/// Maintains one logical connection to the configured URL, reconnecting
/// automatically on loss, connection errors and inbound silence. Outbound
/// messages are serialized through bounded queues; inbound messages fan out
/// to broadcast subscribers.
///
/// Clones share the same session. Call [`dispose`](Self::dispose) for an
/// orderly teardown; dropping the last clone cancels all background work as
/// a safety net.
///
/// # Examples
///
/// ```rust, no_run
/// use futures::StreamExt;
/// use websocket_session::WebsocketClient;
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let client = WebsocketClient::new("wss://echo.websocket.org")?;
///     let stream = client.message_stream()?;
///     let mut stream = Box::pin(stream);
///
///     client.start().await?;
///     client.send_text("hello")?;
///
///     while let Some(msg) = stream.next().await {
///         println!("Received: {:?}", msg?);
///     }
///
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct WebsocketClient {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for WebsocketClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebsocketClient").finish_non_exhaustive()
    }
}

pub(crate) struct Inner {
    url: RwLock<Url>,
    config: RwLock<ClientConfig>,
    factory: Arc<dyn TransportFactory>,

    /// Current transport handle. Replaced only inside the reconnection
    /// guard; readers capture the handle they started with and compare
    /// identity before acting.
    transport: RwLock<Option<Arc<dyn Transport>>>,

    is_started: AtomicBool,
    is_running: AtomicBool,
    is_disposed: AtomicBool,
    is_reconnecting: AtomicBool,
    is_stopping: AtomicBool,

    /// Cancelled only on dispose.
    total_cancel: CancellationToken,
    /// Child of the total scope, rotated on every stop/reconnect boundary.
    session_cancel: RwLock<CancellationToken>,

    last_received: RwLock<Instant>,

    /// Serializes outbound frame writes across both send workers and
    /// `send_instant`.
    send_lock: Mutex<()>,
    /// Single-flight guard for reconnection bodies.
    reconnect_lock: Mutex<()>,

    text_queue: WorkQueue<String>,
    binary_queue: WorkQueue<Vec<u8>>,
    receive_queue: WorkQueue<ReceivedFrame>,

    watchdog: RwLock<Option<JoinHandle<()>>>,
    receive_task: RwLock<Option<JoinHandle<()>>>,

    message_tx: RwLock<Option<broadcast::Sender<Message>>>,
    reconnection_tx: RwLock<Option<broadcast::Sender<Reconnection>>>,
    disconnection_tx: RwLock<Option<broadcast::Sender<Disconnection>>>,
    disconnect_hooks: RwLock<Vec<DisconnectHook>>,
}

impl WebsocketClient {
    /// Create a client for `url` with [`ClientConfig::default`] and the
    /// default `tokio-tungstenite` transport.
    ///
    /// No connection is made until [`start`](Self::start).
    ///
    /// # Errors
    ///
    /// Returns a `Validation` error when the URL is empty or malformed.
    pub fn new(url: &str) -> Result<Self> {
        Self::with_config(url, ClientConfig::default())
    }

    /// Create a client with an explicit configuration.
    pub fn with_config(url: &str, config: ClientConfig) -> Result<Self> {
        Self::with_factory(url, config, TungsteniteFactory)
    }

    /// Create a client with an explicit configuration and transport factory.
    ///
    /// The factory is invoked on every (re)connect and must yield an
    /// already-connected transport.
    pub fn with_factory<F: TransportFactory>(
        url: &str,
        config: ClientConfig,
        factory: F,
    ) -> Result<Self> {
        if url.trim().is_empty() {
            return Err(Error::validation("url must not be empty"));
        }
        let url = Url::parse(url)?;

        let (message_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let (reconnection_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let (disconnection_tx, _) = broadcast::channel(EVENT_CAPACITY);

        let total_cancel = CancellationToken::new();
        let session_cancel = total_cancel.child_token();

        Ok(Self {
            inner: Arc::new(Inner {
                url: RwLock::new(url),
                config: RwLock::new(config),
                factory: Arc::new(factory),
                transport: RwLock::new(None),
                is_started: AtomicBool::new(false),
                is_running: AtomicBool::new(false),
                is_disposed: AtomicBool::new(false),
                is_reconnecting: AtomicBool::new(false),
                is_stopping: AtomicBool::new(false),
                total_cancel,
                session_cancel: RwLock::new(session_cancel),
                last_received: RwLock::new(Instant::now()),
                send_lock: Mutex::new(()),
                reconnect_lock: Mutex::new(()),
                text_queue: WorkQueue::new("send-text"),
                binary_queue: WorkQueue::new("send-binary"),
                receive_queue: WorkQueue::new("receive"),
                watchdog: RwLock::new(None),
                receive_task: RwLock::new(None),
                message_tx: RwLock::new(Some(message_tx)),
                reconnection_tx: RwLock::new(Some(reconnection_tx)),
                disconnection_tx: RwLock::new(Some(disconnection_tx)),
                disconnect_hooks: RwLock::new(Vec::new()),
            }),
        })
    }

    /// Start the session: connect and begin processing queues.
    ///
    /// Network failures never surface here — they are published as
    /// `Error` disconnections and retried per `error_reconnect_timeout`.
    /// A second call while started is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error only on misuse (disposed client).
    pub async fn start(&self) -> Result<()> {
        self.inner.start_internal(false).await
    }

    /// Start the session, raising when the initial connection fails.
    ///
    /// # Errors
    ///
    /// Returns a `Connect` error when the first connection attempt fails,
    /// or `Disposed` on misuse.
    pub async fn start_or_fail(&self) -> Result<()> {
        self.inner.start_internal(true).await
    }

    /// Close the connection and stop the session.
    ///
    /// Returns whether the close handshake ran; `false` when the session
    /// was not running or the handshake failed. Never raises for network
    /// reasons.
    ///
    /// # Errors
    ///
    /// Returns `Disposed` on misuse.
    pub async fn stop(&self, code: CloseCode, reason: &str) -> Result<bool> {
        self.inner.stop(code, reason, false).await
    }

    /// Close the connection, propagating close-handshake failures.
    ///
    /// # Errors
    ///
    /// Returns a `Close` error when the handshake fails, or `Disposed` on
    /// misuse.
    pub async fn stop_or_fail(&self, code: CloseCode, reason: &str) -> Result<bool> {
        self.inner.stop(code, reason, true).await
    }

    /// Force a reconnection of the live session, publishing a `ByUser`
    /// disconnection followed by a `ByUser` reconnection. A no-op when the
    /// session is not started.
    ///
    /// # Errors
    ///
    /// Returns `Disposed` on misuse.
    pub async fn reconnect(&self) -> Result<()> {
        self.inner.reconnect_user(false).await
    }

    /// Force a reconnection, raising when the new connection fails.
    ///
    /// # Errors
    ///
    /// Returns a `Connect` error when the connection attempt fails, or
    /// `Disposed` on misuse.
    pub async fn reconnect_or_fail(&self) -> Result<()> {
        self.inner.reconnect_user(true).await
    }

    /// Tear the session down permanently. Idempotent; every subsequent
    /// operation fails with `Disposed` and no further events are published.
    pub async fn dispose(&self) {
        self.inner.dispose().await;
    }

    /// Enqueue a text message. Non-blocking; the message is dropped when the
    /// queue is full or the session is disposed mid-flight.
    ///
    /// # Errors
    ///
    /// Returns `Disposed` on misuse.
    pub fn send_text(&self, text: impl Into<String>) -> Result<()> {
        if self.inner.is_disposed() {
            return Err(Error::disposed());
        }
        self.inner.text_queue.add(text.into());
        Ok(())
    }

    /// Enqueue a binary message. Non-blocking, like [`send_text`](Self::send_text).
    ///
    /// # Errors
    ///
    /// Returns `Disposed` on misuse.
    pub fn send_binary(&self, payload: impl Into<Vec<u8>>) -> Result<()> {
        if self.inner.is_disposed() {
            return Err(Error::disposed());
        }
        self.inner.binary_queue.add(payload.into());
        Ok(())
    }

    /// Write a text message directly, bypassing the queue but still holding
    /// the send lock.
    ///
    /// # Errors
    ///
    /// Returns a `Send` error when no connection is established or the write
    /// fails.
    pub async fn send_instant_text(&self, text: impl Into<String>) -> Result<()> {
        self.inner
            .send_instant(text.into().into_bytes(), FrameKind::Text)
            .await
    }

    /// Write a binary message directly, bypassing the queue but still
    /// holding the send lock.
    ///
    /// # Errors
    ///
    /// Returns a `Send` error when no connection is established or the write
    /// fails.
    pub async fn send_instant_binary(&self, payload: impl Into<Vec<u8>>) -> Result<()> {
        self.inner
            .send_instant(payload.into(), FrameKind::Binary)
            .await
    }

    /// Publish a message to subscribers as if it had been received from the
    /// server. Test hook.
    ///
    /// # Errors
    ///
    /// Returns `Disposed` on misuse.
    pub fn stream_fake_message(&self, message: Message) -> Result<()> {
        if self.inner.is_disposed() {
            return Err(Error::disposed());
        }
        self.inner.publish_message(message);
        Ok(())
    }

    /// Subscribe to inbound messages.
    ///
    /// Each call returns an independent receiver; slow subscribers overflow
    /// to a lagged state and miss messages rather than blocking the session.
    ///
    /// # Errors
    ///
    /// Returns `Disposed` on misuse.
    pub fn subscribe_messages(&self) -> Result<broadcast::Receiver<Message>> {
        self.inner
            .message_tx
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(broadcast::Sender::subscribe)
            .ok_or_else(Error::disposed)
    }

    /// Subscribe to inbound messages as a `Stream`.
    ///
    /// Lag from slow consumption surfaces as a `Lagged` error item; the
    /// stream ends when the client is disposed.
    ///
    /// # Errors
    ///
    /// Returns `Disposed` on misuse.
    pub fn message_stream(&self) -> Result<impl Stream<Item = Result<Message>>> {
        let mut rx = self.subscribe_messages()?;

        Ok(try_stream! {
            loop {
                match rx.recv().await {
                    Ok(msg) => yield msg,
                    Err(RecvError::Lagged(n)) => {
                        #[cfg(feature = "tracing")]
                        tracing::warn!("Message subscriber lagged, missed {n} messages");
                        Err(Error::from(SessionError::Lagged { count: n }))?;
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    /// Subscribe to connection-established events.
    ///
    /// # Errors
    ///
    /// Returns `Disposed` on misuse.
    pub fn subscribe_reconnections(&self) -> Result<broadcast::Receiver<Reconnection>> {
        self.inner
            .reconnection_tx
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(broadcast::Sender::subscribe)
            .ok_or_else(Error::disposed)
    }

    /// Subscribe to disconnection events for passive observation.
    ///
    /// To intercept a disconnection (cancel the pending reconnect or the
    /// close handshake) register a hook with
    /// [`on_disconnection`](Self::on_disconnection) instead — broadcast
    /// delivery is too late to influence the controller.
    ///
    /// # Errors
    ///
    /// Returns `Disposed` on misuse.
    pub fn subscribe_disconnections(&self) -> Result<broadcast::Receiver<Disconnection>> {
        self.inner
            .disconnection_tx
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(broadcast::Sender::subscribe)
            .ok_or_else(Error::disposed)
    }

    /// Register a synchronous hook invoked inline on every disconnection,
    /// before the controller acts on it. Hooks must not block.
    pub fn on_disconnection<F>(&self, hook: F)
    where
        F: Fn(&Disconnection) + Send + Sync + 'static,
    {
        self.inner
            .disconnect_hooks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(hook));
    }

    /// Whether `start` has been called without a matching stop.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.inner.is_started()
    }

    /// Whether a live connection is currently established.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.is_running()
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }

    /// When the last inbound frame was observed.
    #[must_use]
    pub fn last_received_at(&self) -> Instant {
        self.inner.last_received_at()
    }

    /// Current target URL.
    #[must_use]
    pub fn url(&self) -> Url {
        self.inner
            .url
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Change the target URL. Takes effect on the next (re)connect; the live
    /// connection is untouched.
    ///
    /// # Errors
    ///
    /// Returns a `Validation` error when the URL is empty or malformed.
    pub fn set_url(&self, url: &str) -> Result<()> {
        if url.trim().is_empty() {
            return Err(Error::validation("url must not be empty"));
        }
        let url = Url::parse(url)?;
        *self
            .inner
            .url
            .write()
            .unwrap_or_else(PoisonError::into_inner) = url;
        Ok(())
    }

    /// Configured name used to tag log output.
    #[must_use]
    pub fn name(&self) -> Option<String> {
        self.inner
            .config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .name
            .clone()
    }

    /// Flip automatic reconnection. While running this arms or disarms the
    /// no-message watchdog immediately.
    pub fn set_reconnection_enabled(&self, enabled: bool) {
        {
            let mut config = self
                .inner
                .config
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            config.is_reconnection_enabled = enabled;
        }

        if !self.inner.is_running() {
            return;
        }
        if enabled {
            if let Some(transport) = self.inner.current_transport() {
                self.inner.activate_watchdog(&transport);
            }
        } else {
            self.inner.deactivate_watchdog();
        }
    }

    /// Downcast the current transport to its concrete type.
    ///
    /// # Errors
    ///
    /// Returns a `WebSocket` error when no connection is established, or a
    /// `Cast` error when the transport is not a `T`.
    pub fn transport_as<T: Transport>(&self) -> Result<Arc<T>> {
        let transport = self
            .inner
            .current_transport()
            .ok_or_else(|| Error::from(SessionError::NotConnected))?;

        transport
            .as_any()
            .downcast::<T>()
            .map_err(|_| Error::cast(std::any::type_name::<T>()))
    }
}

impl Inner {
    pub(crate) fn is_started(&self) -> bool {
        self.is_started.load(Ordering::SeqCst)
    }

    pub(crate) fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.is_disposed.load(Ordering::SeqCst)
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.is_stopping.load(Ordering::SeqCst)
    }

    pub(crate) fn is_reconnecting(&self) -> bool {
        self.is_reconnecting.load(Ordering::SeqCst)
    }

    pub(crate) fn reconnection_enabled(&self) -> bool {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_reconnection_enabled
    }

    pub(crate) fn session_token(&self) -> CancellationToken {
        self.session_cancel
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Cancel the current session scope and mint a fresh child of the total
    /// scope for the next connection.
    pub(crate) fn rotate_session_scope(&self) {
        let fresh = self.total_cancel.child_token();
        let old = std::mem::replace(
            &mut *self
                .session_cancel
                .write()
                .unwrap_or_else(PoisonError::into_inner),
            fresh,
        );
        old.cancel();
    }

    pub(crate) fn current_transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn is_current_transport(&self, client: &Arc<dyn Transport>) -> bool {
        self.transport
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|t| Arc::ptr_eq(t, client))
    }

    /// Whether a live, open connection exists right now.
    pub(crate) fn is_client_connected(&self) -> bool {
        self.current_transport()
            .is_some_and(|t| t.state().is_open())
    }

    /// Gate for every reconnection trigger: stale handles, concurrent
    /// reconnects/stops and disposal must not fire duplicate reconnections.
    pub(crate) fn should_ignore_reconnection(&self, client: &Arc<dyn Transport>) -> bool {
        self.is_disposed()
            || self.is_reconnecting()
            || self.is_stopping()
            || !self.is_current_transport(client)
    }

    pub(crate) fn last_received_at(&self) -> Instant {
        *self
            .last_received
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn stamp_last_received(&self) {
        *self
            .last_received
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    pub(crate) fn log_name(&self) -> String {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .name
            .clone()
            .unwrap_or_else(|| "websocket-client".to_owned())
    }

    /// Launch the send workers and the inbound dispatcher. Safe to call on
    /// every start; only the first call has an effect.
    pub(crate) fn launch_workers(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.text_queue.start(move |text: String| {
            let weak = Weak::clone(&weak);
            async move {
                if let Some(inner) = weak.upgrade() {
                    inner.send_from_queue(text.into_bytes(), FrameKind::Text).await?;
                }
                Ok(())
            }
        });

        let weak = Arc::downgrade(self);
        self.binary_queue.start(move |payload: Vec<u8>| {
            let weak = Weak::clone(&weak);
            async move {
                if let Some(inner) = weak.upgrade() {
                    inner.send_from_queue(payload, FrameKind::Binary).await?;
                }
                Ok(())
            }
        });

        let weak = Arc::downgrade(self);
        self.receive_queue.start(move |frame: ReceivedFrame| {
            let weak = Weak::clone(&weak);
            async move {
                if let Some(inner) = weak.upgrade() {
                    inner.dispatch(frame).await;
                }
                Ok(())
            }
        });
    }

    /// Queue worker body: one frame write under the send lock. Items for a
    /// dead connection are dropped, not re-enqueued.
    async fn send_from_queue(&self, payload: Vec<u8>, kind: FrameKind) -> Result<()> {
        let _guard = self.send_lock.lock().await;

        let Some(transport) = self.current_transport().filter(|t| t.state().is_open()) else {
            #[cfg(feature = "tracing")]
            tracing::debug!(
                client = %self.log_name(),
                "Not connected, dropping {} byte outbound message",
                payload.len()
            );
            return Ok(());
        };

        let token = self.session_token();
        transport
            .send(&payload, kind, true, &token)
            .await
            .map_err(|e| Error::with_source(crate::error::Kind::Send, e))
    }

    /// Direct write under the send lock, bypassing the queues.
    pub(crate) async fn send_instant(&self, payload: Vec<u8>, kind: FrameKind) -> Result<()> {
        if self.is_disposed() {
            return Err(Error::disposed());
        }

        let _guard = self.send_lock.lock().await;

        let Some(transport) = self.current_transport().filter(|t| t.state().is_open()) else {
            return Err(Error::with_source(
                crate::error::Kind::Send,
                SessionError::NotConnected,
            ));
        };

        let token = self.session_token();
        transport
            .send(&payload, kind, true, &token)
            .await
            .map_err(|e| Error::with_source(crate::error::Kind::Send, e))
    }

    pub(crate) fn publish_message(&self, message: Message) {
        if let Some(tx) = self
            .message_tx
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            drop(tx.send(message));
        }
    }

    pub(crate) fn publish_reconnection(&self, event: Reconnection) {
        #[cfg(feature = "tracing")]
        tracing::info!(client = %self.log_name(), "Connected ({:?})", event.kind);

        if let Some(tx) = self
            .reconnection_tx
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            drop(tx.send(event));
        }
    }

    /// Deliver a disconnection: hooks first (inline, so cancel-flag writes
    /// are visible before the controller acts), broadcast second.
    pub(crate) fn publish_disconnection(&self, info: &Disconnection) {
        #[cfg(feature = "tracing")]
        tracing::info!(client = %self.log_name(), "{info}");

        let hooks: Vec<DisconnectHook> = self
            .disconnect_hooks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for hook in &hooks {
            hook(info);
        }

        if let Some(tx) = self
            .disconnection_tx
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            drop(tx.send(info.clone()));
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.total_cancel.cancel();
        if let Some(handle) = self
            .watchdog
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
        if let Some(handle) = self
            .receive_task
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}
