#![expect(
    clippy::module_name_repetitions,
    reason = "Configuration types intentionally mirror the module name for clarity"
)]

use std::time::Duration;

const DEFAULT_RECONNECT_TIMEOUT_DURATION: Duration = Duration::from_secs(60);
const DEFAULT_ERROR_RECONNECT_TIMEOUT_DURATION: Duration = Duration::from_secs(60);

/// Configuration for session behavior.
///
/// Every field can be changed through the client's setters while the session
/// is live; timeout and URL changes take effect on the next (re)connect.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Optional name used to tag log output, useful when multiple clients run
    /// in one process
    pub name: Option<String>,
    /// Master switch for automatic reconnection. When disabled the session
    /// stays down after any disconnect until `start` is called again.
    pub is_reconnection_enabled: bool,
    /// No-message watchdog window. When no inbound frame arrives within this
    /// window the session reconnects. `None` disables the watchdog.
    pub reconnect_timeout: Option<Duration>,
    /// Delay before retrying after a failed connection attempt.
    /// `None` disables retries.
    pub error_reconnect_timeout: Option<Duration>,
    /// Delay before reconnecting after the stream is lost unexpectedly.
    /// `None` reconnects immediately.
    pub lost_reconnect_timeout: Option<Duration>,
    /// Whether frames of text kind are decoded into [`Message::Text`].
    /// When disabled they are delivered as [`Message::Binary`].
    ///
    /// [`Message::Text`]: crate::message::Message::Text
    /// [`Message::Binary`]: crate::message::Message::Binary
    pub is_text_message_conversion_enabled: bool,
    /// Codec applied to inbound text frames
    pub message_encoding: MessageEncoding,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            name: None,
            is_reconnection_enabled: true,
            reconnect_timeout: Some(DEFAULT_RECONNECT_TIMEOUT_DURATION),
            error_reconnect_timeout: Some(DEFAULT_ERROR_RECONNECT_TIMEOUT_DURATION),
            lost_reconnect_timeout: None,
            is_text_message_conversion_enabled: true,
            message_encoding: MessageEncoding::default(),
        }
    }
}

/// Text decoding policy for inbound frames.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MessageEncoding {
    /// UTF-8 with invalid sequences replaced by U+FFFD, matching the tolerant
    /// decoding most servers expect
    #[default]
    Utf8,
    /// Strict UTF-8; frames with invalid sequences are dropped with a warning
    Utf8Strict,
}
