//! Inbound dispatcher: interprets frames popped off the receive queue.
//!
//! Assembly policy is single-chunk: every frame read from the transport is
//! treated as one complete, independent message.

use std::sync::{Arc, PoisonError};

use super::{Inner, ReceivedFrame};
use crate::config::MessageEncoding;
use crate::events::{Disconnection, ReconnectionKind};
use crate::message::{CloseCode, Message};
use crate::transport::{FrameKind, Transport};

impl Inner {
    pub(crate) async fn dispatch(self: &Arc<Self>, frame: ReceivedFrame) {
        match frame.info.kind {
            FrameKind::Close => self.handle_close(frame).await,
            FrameKind::Text | FrameKind::Binary => self.handle_data(frame),
        }
    }

    /// Server-initiated close: emit `ByServer`, then either abort for a
    /// reconnect (when a hook cancelled the closing) or acknowledge the
    /// handshake and reconnect if enabled.
    async fn handle_close(self: &Arc<Self>, frame: ReceivedFrame) {
        if !self.is_started() || self.is_stopping() {
            return;
        }
        let Some(current) = self.current_transport() else {
            return;
        };

        let reason = (!frame.payload.is_empty())
            .then(|| String::from_utf8_lossy(&frame.payload).into_owned());
        let info = Disconnection::by_server(frame.info.close_code, reason);
        self.publish_disconnection(&info);

        let reconnection_enabled = self.reconnection_enabled();
        if info.cancel_closing() && reconnection_enabled {
            #[cfg(feature = "tracing")]
            tracing::info!(
                client = %self.log_name(),
                "Closing cancelled by subscriber, aborting transport to reconnect"
            );
            current.abort();
            self.lost_reconnect_after_abort(&current).await;
            return;
        }

        if let Err(e) = self
            .stop_internal(
                Some(Arc::clone(&current)),
                CloseCode::NORMAL_CLOSURE,
                "Closing",
                false,
                true,
            )
            .await
        {
            #[cfg(feature = "tracing")]
            tracing::debug!(client = %self.log_name(), "Stop after server close failed: {e}");
            #[cfg(not(feature = "tracing"))]
            let _ = &e;
        }

        if reconnection_enabled && self.is_current_transport(&current) {
            if let Err(e) = self
                .reconnect_synchronized(ReconnectionKind::Lost, false, None)
                .await
            {
                #[cfg(feature = "tracing")]
                tracing::error!(client = %self.log_name(), "Reconnect after server close failed: {e}");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
            }
        }
    }

    /// Reconnect after a skipped close handshake, honoring the
    /// lost-reconnect delay.
    async fn lost_reconnect_after_abort(self: &Arc<Self>, aborted: &Arc<dyn Transport>) {
        let delay = self
            .config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .lost_reconnect_timeout;
        if let Some(delay) = delay {
            let token = self.session_token();
            tokio::select! {
                () = token.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }
        }

        if self.should_ignore_reconnection(aborted) || !self.is_started() {
            return;
        }
        if let Err(e) = self
            .reconnect_synchronized(ReconnectionKind::Lost, false, None)
            .await
        {
            #[cfg(feature = "tracing")]
            tracing::error!(client = %self.log_name(), "Lost-reconnect failed: {e}");
            #[cfg(not(feature = "tracing"))]
            let _ = &e;
        }
    }

    /// Data frame: publish to subscribers. Zero-length frames are dropped.
    fn handle_data(&self, frame: ReceivedFrame) {
        if !self.is_running() || frame.payload.is_empty() {
            return;
        }

        let (conversion_enabled, encoding) = {
            let config = self.config.read().unwrap_or_else(PoisonError::into_inner);
            (
                config.is_text_message_conversion_enabled,
                config.message_encoding,
            )
        };

        let message = match frame.info.kind {
            FrameKind::Text if conversion_enabled => match encoding {
                MessageEncoding::Utf8 => {
                    Message::Text(String::from_utf8_lossy(&frame.payload).into_owned())
                }
                MessageEncoding::Utf8Strict => match String::from_utf8(frame.payload) {
                    Ok(text) => Message::Text(text),
                    Err(e) => {
                        #[cfg(feature = "tracing")]
                        tracing::warn!(
                            client = %self.log_name(),
                            "Dropping text frame with invalid UTF-8: {e}"
                        );
                        #[cfg(not(feature = "tracing"))]
                        let _ = &e;
                        return;
                    }
                },
            },
            _ => Message::Binary(frame.payload),
        };

        self.publish_message(message);
    }
}
