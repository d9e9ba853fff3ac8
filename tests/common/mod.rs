#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests"
)]
#![allow(
    unused,
    reason = "Not every test file exercises every helper"
)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt as _, StreamExt as _};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WireCloseCode;
use tokio_util::sync::CancellationToken;
use url::Url;
use websocket_session::Result;
use websocket_session::error::Error;
use websocket_session::message::CloseCode;
use websocket_session::transport::{
    FrameInfo, FrameKind, Transport, TransportFactory, TransportState, TungsteniteFactory,
};

/// Mock WebSocket server.
pub struct MockWsServer {
    pub addr: SocketAddr,
    /// Broadcast messages to ALL connected clients
    message_tx: broadcast::Sender<Message>,
    /// Receives messages sent by clients
    client_rx: mpsc::UnboundedReceiver<Message>,
    disconnect_signal: Arc<AtomicBool>,
    connections: Arc<AtomicUsize>,
}

impl MockWsServer {
    /// Start a mock WebSocket server on a random port.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (message_tx, _) = broadcast::channel::<Message>(100);
        let (client_tx, client_rx) = mpsc::unbounded_channel::<Message>();
        let disconnect_signal = Arc::new(AtomicBool::new(false));
        let connections = Arc::new(AtomicUsize::new(0));

        let broadcast_tx = message_tx.clone();
        let disconnect = Arc::clone(&disconnect_signal);
        let conn_count = Arc::clone(&connections);

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };

                let Ok(ws_stream) = tokio_tungstenite::accept_async(stream).await else {
                    continue;
                };

                conn_count.fetch_add(1, Ordering::SeqCst);
                let (mut write, mut read) = ws_stream.split();
                let client_tx = client_tx.clone();
                let mut msg_rx = broadcast_tx.subscribe();
                let disconnect = Arc::clone(&disconnect);

                // Handle this connection until it ends or the disconnect
                // signal drops it without a close handshake.
                tokio::spawn(async move {
                    loop {
                        if disconnect.load(Ordering::SeqCst) {
                            break;
                        }

                        tokio::select! {
                            msg = read.next() => {
                                match msg {
                                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                                    Some(Ok(msg)) => {
                                        drop(client_tx.send(msg));
                                    }
                                    _ => break,
                                }
                            }
                            msg = msg_rx.recv() => {
                                match msg {
                                    Ok(msg) => {
                                        if write.send(msg).await.is_err() {
                                            break;
                                        }
                                    }
                                    Err(_) => break,
                                }
                            }
                            () = tokio::time::sleep(Duration::from_millis(50)) => {
                                if disconnect.load(Ordering::SeqCst) {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });

        Self {
            addr,
            message_tx,
            client_rx,
            disconnect_signal,
            connections,
        }
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Send a text message to all connected clients.
    pub fn send_text(&self, text: &str) {
        drop(self.message_tx.send(Message::text(text)));
    }

    /// Send a binary message to all connected clients.
    pub fn send_binary(&self, payload: &[u8]) {
        drop(self.message_tx.send(Message::binary(payload.to_vec())));
    }

    /// Send a close frame to all connected clients.
    pub fn send_close(&self, code: u16, reason: &str) {
        drop(self.message_tx.send(Message::Close(Some(CloseFrame {
            code: WireCloseCode::from(code),
            reason: reason.to_owned().into(),
        }))));
    }

    /// Receive the next message a client sent to the server.
    pub async fn recv_message(&mut self) -> Option<Message> {
        timeout(Duration::from_secs(2), self.client_rx.recv())
            .await
            .ok()
            .flatten()
    }

    /// Drop every connection without a close handshake and refuse service to
    /// new ones until [`allow_reconnect`](Self::allow_reconnect).
    pub fn disconnect_all(&self) {
        self.disconnect_signal.store(true, Ordering::SeqCst);
    }

    pub fn allow_reconnect(&self) {
        self.disconnect_signal.store(false, Ordering::SeqCst);
    }

    /// Total number of WebSocket handshakes this server completed.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

/// Factory that fails a fixed number of connection attempts before
/// delegating to the real transport.
pub struct FlakyFactory {
    inner: TungsteniteFactory,
    failures_remaining: AtomicUsize,
}

impl FlakyFactory {
    #[must_use]
    pub fn failing(times: usize) -> Self {
        Self {
            inner: TungsteniteFactory::default(),
            failures_remaining: AtomicUsize::new(times),
        }
    }
}

#[async_trait]
impl TransportFactory for FlakyFactory {
    async fn connect(&self, url: &Url, cancel: &CancellationToken) -> Result<Arc<dyn Transport>> {
        let remaining = self.failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_remaining
                .store(remaining - 1, Ordering::SeqCst);
            return Err(Error::validation("simulated connect failure"));
        }
        self.inner.connect(url, cancel).await
    }
}

/// Factory whose transports fail the close handshake.
pub struct CloseFailFactory {
    inner: TungsteniteFactory,
}

impl CloseFailFactory {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: TungsteniteFactory::default(),
        }
    }
}

#[async_trait]
impl TransportFactory for CloseFailFactory {
    async fn connect(&self, url: &Url, cancel: &CancellationToken) -> Result<Arc<dyn Transport>> {
        let inner = self.inner.connect(url, cancel).await?;
        Ok(Arc::new(CloseFailTransport { inner }))
    }
}

struct CloseFailTransport {
    inner: Arc<dyn Transport>,
}

#[async_trait]
impl Transport for CloseFailTransport {
    async fn send(
        &self,
        payload: &[u8],
        kind: FrameKind,
        end_of_message: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.inner.send(payload, kind, end_of_message, cancel).await
    }

    async fn receive(&self, buffer: &mut [u8], cancel: &CancellationToken) -> Result<FrameInfo> {
        self.inner.receive(buffer, cancel).await
    }

    async fn close(
        &self,
        _code: CloseCode,
        _reason: &str,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        Err(Error::validation("simulated close failure"))
    }

    async fn close_output(
        &self,
        code: CloseCode,
        reason: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.inner.close_output(code, reason, cancel).await
    }

    fn abort(&self) {
        self.inner.abort();
    }

    fn state(&self) -> TransportState {
        self.inner.state()
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
        self
    }
}
