//! Lifecycle controller: the single place where session state transitions.
//!
//! Worker tasks never mutate lifecycle state themselves; they call into
//! these operations. Reconnection is single-flight: the synchronized entry
//! point holds the reconnect lock, while the retry path inside
//! `start_client` re-enters the unsynchronized body directly to avoid
//! deadlocking on its own guard.

use std::sync::atomic::Ordering;
use std::sync::{Arc, PoisonError};

use futures::FutureExt as _;
use futures::future::BoxFuture;

use super::Inner;
use crate::error::{Error, Kind};
use crate::events::{Disconnection, DisconnectionKind, Reconnection, ReconnectionKind};
use crate::message::CloseCode;
use crate::transport::Transport;
use crate::Result;

fn translate_disconnection(kind: ReconnectionKind) -> DisconnectionKind {
    match kind {
        ReconnectionKind::Lost => DisconnectionKind::Lost,
        ReconnectionKind::NoMessageReceived => DisconnectionKind::NoMessageReceived,
        ReconnectionKind::Error => DisconnectionKind::Error,
        ReconnectionKind::ByUser => DisconnectionKind::ByUser,
        ReconnectionKind::Initial => DisconnectionKind::Exit,
    }
}

impl Inner {
    pub(crate) async fn start_internal(self: &Arc<Self>, fail_fast: bool) -> Result<()> {
        if self.is_disposed() {
            return Err(Error::disposed());
        }
        if self.is_started.swap(true, Ordering::SeqCst) {
            #[cfg(feature = "tracing")]
            tracing::debug!(client = %self.log_name(), "Already started, ignoring");
            return Ok(());
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(client = %self.log_name(), "Starting");

        self.rotate_session_scope();
        self.launch_workers();
        self.start_client(ReconnectionKind::Initial, fail_fast).await
    }

    /// Connect via the factory and wire the new transport up. On failure,
    /// runs the error-retry policy.
    pub(crate) async fn start_client(
        self: &Arc<Self>,
        kind: ReconnectionKind,
        fail_fast: bool,
    ) -> Result<()> {
        self.deactivate_watchdog();

        let token = self.session_token();
        let url = self
            .url
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        match self.factory.connect(&url, &token).await {
            Ok(transport) => {
                if self.is_disposed() {
                    transport.abort();
                    return Ok(());
                }

                let previous = self
                    .transport
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .replace(Arc::clone(&transport));
                if let Some(previous) = previous {
                    previous.abort();
                }

                self.spawn_receive_loop(Arc::clone(&transport), token);
                self.is_running.store(true, Ordering::SeqCst);
                self.publish_reconnection(Reconnection::new(kind));
                self.stamp_last_received();
                self.activate_watchdog(&transport);
                Ok(())
            }
            Err(e) => {
                let cause = Arc::new(e);

                #[cfg(feature = "tracing")]
                tracing::error!(
                    client = %self.log_name(),
                    "Failed to connect to {url}: {cause}"
                );

                let info = Disconnection::error_disconnection(Arc::clone(&cause));
                self.publish_disconnection(&info);

                if info.cancel_reconnection() {
                    #[cfg(feature = "tracing")]
                    tracing::info!(client = %self.log_name(), "Reconnection cancelled by subscriber");
                    return Ok(());
                }
                if fail_fast {
                    return Err(Error::connect(url.to_string(), cause));
                }

                let delay = self
                    .config
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .error_reconnect_timeout;
                let Some(delay) = delay else {
                    #[cfg(feature = "tracing")]
                    tracing::info!(
                        client = %self.log_name(),
                        "Connect retries are disabled, session stands down"
                    );
                    return Ok(());
                };

                tokio::select! {
                    () = token.cancelled() => return Ok(()),
                    () = tokio::time::sleep(delay) => {}
                }
                if self.is_disposed() || !self.is_started() {
                    return Ok(());
                }

                self.reconnect_body(ReconnectionKind::Error, false, Some(cause))
                    .await
            }
        }
    }

    /// User-requested reconnection. Ignored when the session is not started.
    pub(crate) async fn reconnect_user(self: &Arc<Self>, fail_fast: bool) -> Result<()> {
        if self.is_disposed() {
            return Err(Error::disposed());
        }
        if !self.is_started() {
            #[cfg(feature = "tracing")]
            tracing::debug!(
                client = %self.log_name(),
                "Not started, ignoring reconnection request"
            );
            return Ok(());
        }

        self.reconnect_synchronized(ReconnectionKind::ByUser, fail_fast, None)
            .await
    }

    /// Single-flight reconnection entry point.
    pub(crate) async fn reconnect_synchronized(
        self: &Arc<Self>,
        kind: ReconnectionKind,
        fail_fast: bool,
        cause: Option<Arc<Error>>,
    ) -> Result<()> {
        let _guard = self.reconnect_lock.lock().await;
        self.reconnect_body(kind, fail_fast, cause).await
    }

    /// Reconnection body. Boxed so the retry path inside `start_client` can
    /// recurse into it.
    pub(crate) fn reconnect_body(
        self: &Arc<Self>,
        kind: ReconnectionKind,
        fail_fast: bool,
        cause: Option<Arc<Error>>,
    ) -> BoxFuture<'_, Result<()>> {
        async move {
            if self.is_disposed() || !self.is_started() {
                return Ok(());
            }

            self.is_reconnecting.store(true, Ordering::SeqCst);
            let result = self.reconnect_steps(kind, fail_fast, cause).await;
            self.is_reconnecting.store(false, Ordering::SeqCst);
            result
        }
        .boxed()
    }

    async fn reconnect_steps(
        self: &Arc<Self>,
        kind: ReconnectionKind,
        fail_fast: bool,
        cause: Option<Arc<Error>>,
    ) -> Result<()> {
        // The Error kind already published its disconnection in start_client.
        let mut cancel_requested = false;
        if kind != ReconnectionKind::Error {
            let info = Disconnection::of_kind(translate_disconnection(kind), cause);
            self.publish_disconnection(&info);
            cancel_requested = info.cancel_reconnection();
        }

        self.deactivate_watchdog();
        self.rotate_session_scope();

        let previous = self
            .transport
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(previous) = previous {
            previous.abort();
        }
        self.is_running.store(false, Ordering::SeqCst);

        if cancel_requested || !self.reconnection_enabled() {
            #[cfg(feature = "tracing")]
            tracing::info!(
                client = %self.log_name(),
                "Reconnection skipped, session stands down"
            );
            self.is_started.store(false, Ordering::SeqCst);
            self.session_token().cancel();
            return Ok(());
        }

        #[cfg(feature = "tracing")]
        tracing::info!(client = %self.log_name(), "Reconnecting ({kind:?})");

        self.start_client(kind, fail_fast).await
    }

    /// Close the connection. Returns whether the close handshake ran
    /// successfully; `false` when the session was not running.
    pub(crate) async fn stop_internal(
        &self,
        client: Option<Arc<dyn Transport>>,
        code: CloseCode,
        reason: &str,
        fail_fast: bool,
        by_server: bool,
    ) -> Result<bool> {
        if self.is_disposed() {
            return Err(Error::disposed());
        }

        self.deactivate_watchdog();

        let Some(client) = client else {
            self.is_started.store(false, Ordering::SeqCst);
            self.is_running.store(false, Ordering::SeqCst);
            return Ok(false);
        };

        if !self.is_running() {
            #[cfg(feature = "tracing")]
            tracing::debug!(client = %self.log_name(), "Not running, nothing to stop");
            return Ok(false);
        }

        self.is_stopping.store(true, Ordering::SeqCst);

        let token = self.session_token();
        let closed = if by_server {
            client.close_output(code, reason, &token).await
        } else {
            client.close(code, reason, &token).await
        };

        let result = match closed {
            Ok(()) => Ok(true),
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::error!(client = %self.log_name(), "Close handshake failed: {e}");
                if fail_fast {
                    Err(Error::with_source(Kind::Close, e))
                } else {
                    Ok(false)
                }
            }
        };

        self.is_running.store(false, Ordering::SeqCst);
        self.is_stopping.store(false, Ordering::SeqCst);
        if !by_server || !self.reconnection_enabled() {
            self.is_started.store(false, Ordering::SeqCst);
        }
        self.session_token().cancel();

        result
    }

    pub(crate) async fn stop(&self, code: CloseCode, reason: &str, fail_fast: bool) -> Result<bool> {
        let current = self.current_transport();
        let was_running = self.is_running() && current.is_some();

        let result = self
            .stop_internal(current, code, reason, fail_fast, false)
            .await?;

        if was_running {
            self.publish_disconnection(&Disconnection::by_user(code, reason));
        }
        Ok(result)
    }

    /// Permanent teardown. Idempotent.
    pub(crate) async fn dispose(&self) {
        if self.is_disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(client = %self.log_name(), "Disposing");

        let was_running = self.is_running();

        self.deactivate_watchdog();
        self.session_token().cancel();
        self.total_cancel.cancel();

        self.text_queue.dispose().await;
        self.binary_queue.dispose().await;
        self.receive_queue.dispose().await;

        let transport = self
            .transport
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(transport) = transport {
            transport.abort();
        }
        let receive = self
            .receive_task
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(receive) = receive {
            receive.abort();
        }

        if was_running {
            self.publish_disconnection(&Disconnection::exit());
        }

        self.is_running.store(false, Ordering::SeqCst);
        self.is_started.store(false, Ordering::SeqCst);

        // Completing the streams: dropped senders end every subscriber.
        self.message_tx
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.reconnection_tx
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.disconnection_tx
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.disconnect_hooks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
