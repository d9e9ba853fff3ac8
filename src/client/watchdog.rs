//! No-message watchdog: reconnects when inbound traffic goes silent.

use std::sync::{Arc, PoisonError, Weak};

use tokio::time::MissedTickBehavior;

use super::Inner;
use crate::events::ReconnectionKind;
use crate::transport::Transport;

impl Inner {
    /// Arm the watchdog for the given transport. Re-armed on every connect;
    /// a no-op when reconnection is disabled or no window is configured.
    pub(crate) fn activate_watchdog(self: &Arc<Self>, transport: &Arc<dyn Transport>) {
        self.deactivate_watchdog();

        let window = {
            let config = self.config.read().unwrap_or_else(PoisonError::into_inner);
            if !config.is_reconnection_enabled {
                return;
            }
            config.reconnect_timeout
        };
        let Some(window) = window else { return };

        let weak = Arc::downgrade(self);
        let client = Arc::clone(transport);
        let token = self.session_token();

        let handle = tokio::spawn(async move {
            let mut timer = tokio::time::interval(window);
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick resolves immediately.
            timer.tick().await;

            loop {
                tokio::select! {
                    () = token.cancelled() => return,
                    _ = timer.tick() => {}
                }

                let Some(inner) = weak.upgrade() else { return };
                if inner.last_received_at().elapsed() <= window {
                    continue;
                }
                if !inner.reconnection_enabled() || inner.should_ignore_reconnection(&client) {
                    continue;
                }

                #[cfg(feature = "tracing")]
                tracing::warn!(
                    client = %inner.log_name(),
                    "No message received in {window:?}, reconnecting"
                );
                drop(inner);

                // Detached: the reconnect disarms this watchdog, which must
                // not cancel the reconnect itself.
                let weak = Weak::clone(&weak);
                tokio::spawn(async move {
                    let Some(inner) = weak.upgrade() else { return };
                    if let Err(e) = inner
                        .reconnect_synchronized(ReconnectionKind::NoMessageReceived, false, None)
                        .await
                    {
                        #[cfg(feature = "tracing")]
                        tracing::error!(client = %inner.log_name(), "Watchdog reconnect failed: {e}");
                        #[cfg(not(feature = "tracing"))]
                        let _ = (&inner, &e);
                    }
                });
                return;
            }
        });

        *self
            .watchdog
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    pub(crate) fn deactivate_watchdog(&self) {
        let handle = self
            .watchdog
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}
