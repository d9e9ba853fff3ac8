//! The receive loop: reads frames from one transport into the inbound queue.

use std::sync::{Arc, PoisonError, Weak};

use tokio_util::sync::CancellationToken;

use super::Inner;
use crate::error::Error;
use crate::events::ReconnectionKind;
use crate::transport::{FrameInfo, Transport};

/// Size of the reusable read buffer, bounding the largest acceptable frame.
const RECEIVE_BUFFER_SIZE: usize = 50 * 1024 * 1024;

/// One inbound frame: metadata plus an owned copy of exactly `info.count`
/// payload bytes. Created by the receive loop, consumed once by the
/// dispatcher.
pub(crate) struct ReceivedFrame {
    pub(crate) info: FrameInfo,
    pub(crate) payload: Vec<u8>,
}

impl Inner {
    /// Bind a receive loop to the freshly installed transport.
    pub(crate) fn spawn_receive_loop(
        self: &Arc<Self>,
        transport: Arc<dyn Transport>,
        cancel: CancellationToken,
    ) {
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(receive_loop(weak, transport, cancel));

        let previous = self
            .receive_task
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }
}

async fn receive_loop(weak: Weak<Inner>, transport: Arc<dyn Transport>, cancel: CancellationToken) {
    let mut buffer = vec![0u8; RECEIVE_BUFFER_SIZE];
    let mut cause: Option<Arc<Error>> = None;
    let mut lost = false;

    loop {
        // Close handshakes and aborts end the loop silently; their follow-up
        // (stop, reconnect) is owned by the dispatcher and the abort sites.
        if cancel.is_cancelled() || !transport.state().is_open() {
            break;
        }

        match transport.receive(&mut buffer, &cancel).await {
            Ok(frame) => {
                let Some(inner) = weak.upgrade() else { return };
                let payload = buffer[..frame.count].to_vec();
                inner.stamp_last_received();
                inner.receive_queue.add(ReceivedFrame {
                    info: frame,
                    payload,
                });
            }
            Err(e) => {
                let Some(inner) = weak.upgrade() else { return };
                if e.is_cancellation() || cancel.is_cancelled() || inner.is_disposed() {
                    return;
                }
                // An error on a transport that still claims to be open is an
                // unexpected stream loss.
                if transport.state().is_open() {
                    #[cfg(feature = "tracing")]
                    tracing::error!(client = %inner.log_name(), "Receive failed: {e}");
                    cause = Some(Arc::new(e));
                    lost = true;
                }
                break;
            }
        }
    }

    if !lost {
        return;
    }
    let Some(inner) = weak.upgrade() else { return };
    if inner.should_ignore_reconnection(&transport) || !inner.is_started() {
        return;
    }

    let delay = inner
        .config
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .lost_reconnect_timeout;
    drop(inner);
    if let Some(delay) = delay {
        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(delay) => {}
        }
    }

    let Some(inner) = weak.upgrade() else { return };
    if inner.should_ignore_reconnection(&transport) || !inner.is_started() {
        return;
    }

    #[cfg(feature = "tracing")]
    tracing::warn!(client = %inner.log_name(), "Stream lost, reconnecting");
    drop(inner);

    // Detached: a reconnect replaces (and may abort) this receive task, which
    // must not take the reconnect down with it.
    let weak = Weak::clone(&weak);
    tokio::spawn(async move {
        let Some(inner) = weak.upgrade() else { return };
        if let Err(e) = inner
            .reconnect_synchronized(ReconnectionKind::Lost, false, cause)
            .await
        {
            #[cfg(feature = "tracing")]
            tracing::error!(client = %inner.log_name(), "Lost-reconnect failed: {e}");
            #[cfg(not(feature = "tracing"))]
            let _ = (&inner, &e);
        }
    });
}
