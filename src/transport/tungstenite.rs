//! Default transport backed by `tokio-tungstenite`.

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt as _, StreamExt as _};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message as WireMessage;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{FrameInfo, FrameKind, Transport, TransportFactory, TransportState};
use crate::error::{Error, SessionError};
use crate::message::CloseCode;
use crate::Result;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const STATE_OPEN: u8 = 0;
const STATE_CLOSE_SENT: u8 = 1;
const STATE_CLOSE_RECEIVED: u8 = 2;
const STATE_CLOSED: u8 = 3;
const STATE_ABORTED: u8 = 4;

fn state_from_u8(raw: u8) -> TransportState {
    match raw {
        STATE_CLOSE_SENT => TransportState::CloseSent,
        STATE_CLOSE_RECEIVED => TransportState::CloseReceived,
        STATE_CLOSED => TransportState::Closed,
        STATE_ABORTED => TransportState::Aborted,
        _ => TransportState::Open,
    }
}

fn is_closed_error(e: &tokio_tungstenite::tungstenite::Error) -> bool {
    use tokio_tungstenite::tungstenite::Error as WsError;
    matches!(e, WsError::ConnectionClosed | WsError::AlreadyClosed)
}

/// [`Transport`] over a `tokio-tungstenite` WebSocket stream.
///
/// The stream is split; the sink is shared behind an async mutex (writes are
/// already serialized upstream by the send lock) while the read half is only
/// ever polled by the session's receive loop. Ping/pong frames are handled by
/// the library and never surface.
#[derive(Debug)]
pub struct TungsteniteTransport {
    sink: Mutex<SplitSink<WsStream, WireMessage>>,
    stream: Mutex<SplitStream<WsStream>>,
    state: AtomicU8,
    abort: CancellationToken,
}

impl TungsteniteTransport {
    /// Wrap an already-connected WebSocket stream.
    #[must_use]
    pub fn new(ws: WsStream) -> Self {
        let (sink, stream) = ws.split();
        Self {
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
            state: AtomicU8::new(STATE_OPEN),
            abort: CancellationToken::new(),
        }
    }

    fn set_state(&self, raw: u8) {
        self.state.store(raw, Ordering::SeqCst);
    }

    fn close_frame(code: CloseCode, reason: &str) -> WireMessage {
        WireMessage::Close(Some(CloseFrame {
            code: coding::CloseCode::from(code.0),
            reason: reason.to_owned().into(),
        }))
    }

    async fn send_frame(&self, msg: WireMessage, cancel: &CancellationToken) -> Result<()> {
        tokio::select! {
            () = cancel.cancelled() => Err(SessionError::Cancelled.into()),
            () = self.abort.cancelled() => Err(SessionError::ConnectionClosed.into()),
            result = async {
                let mut sink = self.sink.lock().await;
                sink.send(msg).await
            } => result.map_err(|e| {
                if is_closed_error(&e) {
                    self.set_state(STATE_CLOSED);
                }
                Error::from(e)
            }),
        }
    }
}

#[async_trait]
impl Transport for TungsteniteTransport {
    async fn send(
        &self,
        payload: &[u8],
        kind: FrameKind,
        end_of_message: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if !end_of_message {
            return Err(Error::validation(
                "fragmented sends are not supported by this transport",
            ));
        }

        let msg = match kind {
            FrameKind::Text => {
                let text = std::str::from_utf8(payload)
                    .map_err(|e| Error::validation(format!("text payload is not UTF-8: {e}")))?;
                WireMessage::text(text)
            }
            FrameKind::Binary => WireMessage::binary(payload.to_vec()),
            FrameKind::Close => {
                return Err(Error::validation(
                    "close frames must go through close or close_output",
                ));
            }
        };

        self.send_frame(msg, cancel).await
    }

    async fn receive(&self, buffer: &mut [u8], cancel: &CancellationToken) -> Result<FrameInfo> {
        loop {
            let next = tokio::select! {
                () = cancel.cancelled() => return Err(SessionError::Cancelled.into()),
                () = self.abort.cancelled() => return Err(SessionError::ConnectionClosed.into()),
                next = async { self.stream.lock().await.next().await } => next,
            };

            match next {
                None => {
                    self.set_state(STATE_CLOSED);
                    return Err(SessionError::ConnectionClosed.into());
                }
                Some(Err(e)) => {
                    if is_closed_error(&e) {
                        self.set_state(STATE_CLOSED);
                    }
                    return Err(e.into());
                }
                Some(Ok(WireMessage::Text(text))) => {
                    copy_payload(buffer, text.as_bytes())?;
                    return Ok(FrameInfo {
                        kind: FrameKind::Text,
                        count: text.len(),
                        end_of_message: true,
                        close_code: None,
                    });
                }
                Some(Ok(WireMessage::Binary(bytes))) => {
                    copy_payload(buffer, &bytes)?;
                    return Ok(FrameInfo {
                        kind: FrameKind::Binary,
                        count: bytes.len(),
                        end_of_message: true,
                        close_code: None,
                    });
                }
                Some(Ok(WireMessage::Close(frame))) => {
                    self.set_state(STATE_CLOSE_RECEIVED);
                    let (code, reason) = match &frame {
                        Some(f) => (
                            Some(CloseCode(u16::from(f.code))),
                            f.reason.as_bytes().to_vec(),
                        ),
                        None => (None, Vec::new()),
                    };
                    copy_payload(buffer, &reason)?;
                    return Ok(FrameInfo {
                        kind: FrameKind::Close,
                        count: reason.len(),
                        end_of_message: true,
                        close_code: code,
                    });
                }
                // Ping/pong are answered by the library.
                Some(Ok(_)) => {}
            }
        }
    }

    async fn close(&self, code: CloseCode, reason: &str, cancel: &CancellationToken) -> Result<()> {
        let result = self.send_frame(Self::close_frame(code, reason), cancel).await;
        if result.is_ok() {
            self.set_state(STATE_CLOSED);
        }
        result
    }

    async fn close_output(
        &self,
        code: CloseCode,
        reason: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let acknowledging = self.state.load(Ordering::SeqCst) == STATE_CLOSE_RECEIVED;
        let result = self.send_frame(Self::close_frame(code, reason), cancel).await;
        if result.is_ok() {
            self.set_state(if acknowledging {
                STATE_CLOSED
            } else {
                STATE_CLOSE_SENT
            });
        }
        result
    }

    fn abort(&self) {
        self.set_state(STATE_ABORTED);
        self.abort.cancel();
    }

    fn state(&self) -> TransportState {
        state_from_u8(self.state.load(Ordering::SeqCst))
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

fn copy_payload(buffer: &mut [u8], payload: &[u8]) -> Result<()> {
    if payload.len() > buffer.len() {
        return Err(SessionError::InvalidFrame(format!(
            "frame of {} bytes exceeds the {} byte receive buffer",
            payload.len(),
            buffer.len()
        ))
        .into());
    }
    buffer[..payload.len()].copy_from_slice(payload);
    Ok(())
}

/// Default [`TransportFactory`] connecting via [`connect_async`].
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default)]
pub struct TungsteniteFactory;

#[async_trait]
impl TransportFactory for TungsteniteFactory {
    async fn connect(&self, url: &Url, cancel: &CancellationToken) -> Result<Arc<dyn Transport>> {
        tokio::select! {
            () = cancel.cancelled() => Err(SessionError::Cancelled.into()),
            result = connect_async(url.as_str()) => {
                let (ws, _) = result?;
                Ok(Arc::new(TungsteniteTransport::new(ws)) as Arc<dyn Transport>)
            }
        }
    }
}
