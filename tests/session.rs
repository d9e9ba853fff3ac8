#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests"
)]

mod common;

use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message as WireMessage;
use websocket_session::error::Kind;
use websocket_session::{
    ClientConfig, CloseCode, DisconnectionKind, Message, Reconnection, ReconnectionKind,
    WebsocketClient,
};

use crate::common::{CloseFailFactory, FlakyFactory, MockWsServer};

/// Wait until a reconnection of the given kind is observed.
async fn wait_for_reconnection(
    rx: &mut broadcast::Receiver<Reconnection>,
    kind: ReconnectionKind,
) -> bool {
    timeout(Duration::from_secs(3), async {
        loop {
            match rx.recv().await {
                Ok(info) if info.kind == kind => return true,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return false,
            }
        }
    })
    .await
    .unwrap_or(false)
}

/// Wait until a disconnection of the given kind is observed.
async fn wait_for_disconnection(
    rx: &mut broadcast::Receiver<websocket_session::Disconnection>,
    kind: DisconnectionKind,
) -> bool {
    timeout(Duration::from_secs(3), async {
        loop {
            match rx.recv().await {
                Ok(info) if info.kind() == kind => return true,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return false,
            }
        }
    })
    .await
    .unwrap_or(false)
}

mod happy_path {
    use super::*;

    #[tokio::test]
    async fn receives_binary_frame_and_sends_text() {
        let mut server = MockWsServer::start().await;
        let client = WebsocketClient::new(&server.ws_url()).unwrap();
        let mut messages = client.subscribe_messages().unwrap();

        client.start().await.unwrap();
        assert!(client.is_started());
        assert!(client.is_running());

        server.send_binary(&[0x01, 0x02, 0x03]);
        let msg = timeout(Duration::from_secs(2), messages.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg, Message::binary(vec![0x01, 0x02, 0x03]));

        client.send_text("hi").unwrap();
        let received = server.recv_message().await.unwrap();
        assert!(matches!(received, WireMessage::Text(text) if text == "hi"));

        client.dispose().await;
    }

    #[tokio::test]
    async fn send_preserves_fifo_order() {
        let mut server = MockWsServer::start().await;
        let client = WebsocketClient::new(&server.ws_url()).unwrap();

        client.start().await.unwrap();

        client.send_text("first").unwrap();
        client.send_text("second").unwrap();
        client.send_text("third").unwrap();

        for expected in ["first", "second", "third"] {
            let received = server.recv_message().await.unwrap();
            assert!(matches!(received, WireMessage::Text(text) if text == expected));
        }

        client.dispose().await;
    }

    #[tokio::test]
    async fn send_instant_writes_directly() {
        let mut server = MockWsServer::start().await;
        let client = WebsocketClient::new(&server.ws_url()).unwrap();

        client.start().await.unwrap();

        client.send_instant_binary(vec![9, 8, 7]).await.unwrap();
        let received = server.recv_message().await.unwrap();
        assert!(matches!(received, WireMessage::Binary(b) if b.as_ref() == [9, 8, 7]));

        client.dispose().await;
    }

    #[tokio::test]
    async fn send_instant_fails_when_not_connected() {
        let server = MockWsServer::start().await;
        let client = WebsocketClient::new(&server.ws_url()).unwrap();

        let err = client.send_instant_text("hi").await.unwrap_err();
        assert_eq!(err.kind(), Kind::Send);
    }

    #[tokio::test]
    async fn text_frames_decode_to_text() {
        let server = MockWsServer::start().await;
        let client = WebsocketClient::new(&server.ws_url()).unwrap();
        let mut messages = client.subscribe_messages().unwrap();

        client.start().await.unwrap();

        server.send_text("hello");
        let msg = timeout(Duration::from_secs(2), messages.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg, Message::text("hello"));

        client.dispose().await;
    }

    #[tokio::test]
    async fn text_conversion_disabled_delivers_binary() {
        let server = MockWsServer::start().await;
        let mut config = ClientConfig::default();
        config.is_text_message_conversion_enabled = false;

        let client = WebsocketClient::with_config(&server.ws_url(), config).unwrap();
        let mut messages = client.subscribe_messages().unwrap();

        client.start().await.unwrap();

        server.send_text("abc");
        let msg = timeout(Duration::from_secs(2), messages.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg, Message::binary(b"abc".to_vec()));

        client.dispose().await;
    }

    #[tokio::test]
    async fn empty_binary_frame_is_dropped() {
        let server = MockWsServer::start().await;
        let client = WebsocketClient::new(&server.ws_url()).unwrap();
        let mut messages = client.subscribe_messages().unwrap();

        client.start().await.unwrap();

        server.send_binary(&[]);
        server.send_binary(&[7]);

        // The empty frame is skipped; the first published message is [7].
        let msg = timeout(Duration::from_secs(2), messages.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg, Message::binary(vec![7]));

        client.dispose().await;
    }

    #[tokio::test]
    async fn stream_fake_message_reaches_subscribers() {
        let server = MockWsServer::start().await;
        let client = WebsocketClient::new(&server.ws_url()).unwrap();
        let mut messages = client.subscribe_messages().unwrap();

        client
            .stream_fake_message(Message::text("injected"))
            .unwrap();

        let msg = timeout(Duration::from_secs(2), messages.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg, Message::text("injected"));
    }

    #[tokio::test]
    async fn message_stream_yields_messages() {
        use futures_util::StreamExt as _;

        let server = MockWsServer::start().await;
        let client = WebsocketClient::new(&server.ws_url()).unwrap();
        let stream = client.message_stream().unwrap();
        let mut stream = Box::pin(stream);

        client.start().await.unwrap();

        server.send_text("streamed");
        let msg = timeout(Duration::from_secs(2), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(msg, Message::text("streamed"));

        client.dispose().await;
    }
}

mod lifecycle {
    use super::*;

    #[tokio::test]
    async fn start_twice_is_noop() {
        let server = MockWsServer::start().await;
        let client = WebsocketClient::new(&server.ws_url()).unwrap();
        let mut reconnections = client.subscribe_reconnections().unwrap();

        client.start().await.unwrap();
        client.start().await.unwrap();

        let first = timeout(Duration::from_secs(2), reconnections.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.kind, ReconnectionKind::Initial);

        sleep(Duration::from_millis(100)).await;
        assert!(matches!(
            reconnections.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
        assert_eq!(server.connection_count(), 1);

        client.dispose().await;
    }

    #[tokio::test]
    async fn stop_before_start_returns_false() {
        let server = MockWsServer::start().await;
        let client = WebsocketClient::new(&server.ws_url()).unwrap();
        let mut disconnections = client.subscribe_disconnections().unwrap();

        let stopped = client
            .stop(CloseCode::NORMAL_CLOSURE, "bye")
            .await
            .unwrap();

        assert!(!stopped);
        assert!(matches!(
            disconnections.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn stop_emits_by_user_once() {
        let server = MockWsServer::start().await;
        let client = WebsocketClient::new(&server.ws_url()).unwrap();
        let mut disconnections = client.subscribe_disconnections().unwrap();

        client.start().await.unwrap();

        let stopped = client
            .stop(CloseCode::NORMAL_CLOSURE, "bye")
            .await
            .unwrap();
        assert!(stopped);
        assert!(!client.is_running());
        assert!(!client.is_started());

        let info = timeout(Duration::from_secs(2), disconnections.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(info.kind(), DisconnectionKind::ByUser);
        assert_eq!(info.close_code(), Some(CloseCode::NORMAL_CLOSURE));

        // A second stop is a no-op and publishes nothing.
        let stopped = client
            .stop(CloseCode::NORMAL_CLOSURE, "bye")
            .await
            .unwrap();
        assert!(!stopped);
        sleep(Duration::from_millis(100)).await;
        assert!(matches!(
            disconnections.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn user_reconnect_cycles_the_connection() {
        let server = MockWsServer::start().await;
        let client = WebsocketClient::new(&server.ws_url()).unwrap();
        let mut reconnections = client.subscribe_reconnections().unwrap();
        let mut disconnections = client.subscribe_disconnections().unwrap();

        client.start().await.unwrap();
        assert!(wait_for_reconnection(&mut reconnections, ReconnectionKind::Initial).await);

        client.reconnect().await.unwrap();

        assert!(wait_for_disconnection(&mut disconnections, DisconnectionKind::ByUser).await);
        assert!(wait_for_reconnection(&mut reconnections, ReconnectionKind::ByUser).await);
        assert!(client.is_running());
        assert_eq!(server.connection_count(), 2);

        client.dispose().await;
    }

    #[tokio::test]
    async fn reconnect_when_not_started_is_noop() {
        let server = MockWsServer::start().await;
        let client = WebsocketClient::new(&server.ws_url()).unwrap();
        let mut reconnections = client.subscribe_reconnections().unwrap();

        client.reconnect().await.unwrap();

        sleep(Duration::from_millis(100)).await;
        assert!(!client.is_started());
        assert!(matches!(
            reconnections.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn restart_after_stop_establishes_new_connection() {
        let mut server = MockWsServer::start().await;
        let client = WebsocketClient::new(&server.ws_url()).unwrap();
        let mut reconnections = client.subscribe_reconnections().unwrap();

        client.start().await.unwrap();
        assert!(wait_for_reconnection(&mut reconnections, ReconnectionKind::Initial).await);

        client
            .stop(CloseCode::NORMAL_CLOSURE, "restarting")
            .await
            .unwrap();
        assert!(!client.is_started());

        client.start().await.unwrap();
        assert!(wait_for_reconnection(&mut reconnections, ReconnectionKind::Initial).await);
        assert!(client.is_running());

        client.send_text("after restart").unwrap();
        let received = server.recv_message().await.unwrap();
        assert!(matches!(received, WireMessage::Text(text) if text == "after restart"));

        client.dispose().await;
    }
}

mod reconnection {
    use super::*;

    fn quick_reconnect_config() -> ClientConfig {
        let mut config = ClientConfig::default();
        config.lost_reconnect_timeout = Some(Duration::from_millis(50));
        config.error_reconnect_timeout = Some(Duration::from_millis(50));
        config
    }

    #[tokio::test]
    async fn reconnects_after_lost_stream() {
        let mut server = MockWsServer::start().await;
        let client =
            WebsocketClient::with_config(&server.ws_url(), quick_reconnect_config()).unwrap();
        let mut reconnections = client.subscribe_reconnections().unwrap();
        let mut disconnections = client.subscribe_disconnections().unwrap();

        client.start().await.unwrap();
        assert!(wait_for_reconnection(&mut reconnections, ReconnectionKind::Initial).await);

        server.disconnect_all();
        sleep(Duration::from_millis(150)).await;
        server.allow_reconnect();

        assert!(wait_for_disconnection(&mut disconnections, DisconnectionKind::Lost).await);
        assert!(wait_for_reconnection(&mut reconnections, ReconnectionKind::Lost).await);

        // The session is live again end to end. The connection may still be
        // flapping right after the allow flag flips, and messages queued
        // while disconnected are dropped by design, so retry the send.
        let mut delivered = false;
        for _ in 0..10 {
            client.send_text("back").unwrap();
            if let Some(WireMessage::Text(text)) = server.recv_message().await {
                assert_eq!(text, "back");
                delivered = true;
                break;
            }
        }
        assert!(delivered);

        client.dispose().await;
    }

    #[tokio::test]
    async fn connect_failure_retries_after_delay() {
        let server = MockWsServer::start().await;
        let client = WebsocketClient::with_factory(
            &server.ws_url(),
            quick_reconnect_config(),
            FlakyFactory::failing(1),
        )
        .unwrap();
        let mut reconnections = client.subscribe_reconnections().unwrap();
        let mut disconnections = client.subscribe_disconnections().unwrap();

        client.start().await.unwrap();

        assert!(wait_for_disconnection(&mut disconnections, DisconnectionKind::Error).await);
        assert!(wait_for_reconnection(&mut reconnections, ReconnectionKind::Error).await);
        assert!(client.is_running());

        client.dispose().await;
    }

    #[tokio::test]
    async fn start_or_fail_raises_on_connect_failure() {
        // Reserve a port with no listener behind it.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = WebsocketClient::new(&format!("ws://{addr}")).unwrap();
        let err = client.start_or_fail().await.unwrap_err();

        assert_eq!(err.kind(), Kind::Connect);
        assert!(!client.is_running());
    }

    #[tokio::test]
    async fn cancel_reconnection_prevents_retry() {
        let server = MockWsServer::start().await;
        let client = WebsocketClient::with_factory(
            &server.ws_url(),
            quick_reconnect_config(),
            FlakyFactory::failing(1),
        )
        .unwrap();
        let mut reconnections = client.subscribe_reconnections().unwrap();

        client.on_disconnection(|info| {
            if info.kind() == DisconnectionKind::Error {
                info.set_cancel_reconnection(true);
            }
        });

        client.start().await.unwrap();
        sleep(Duration::from_millis(300)).await;

        assert!(!client.is_running());
        assert_eq!(server.connection_count(), 0);
        assert!(matches!(
            reconnections.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));

        client.dispose().await;
    }

    #[tokio::test]
    async fn watchdog_reconnects_on_silence() {
        let server = MockWsServer::start().await;
        let mut config = ClientConfig::default();
        config.reconnect_timeout = Some(Duration::from_millis(100));

        let client = WebsocketClient::with_config(&server.ws_url(), config).unwrap();
        let mut reconnections = client.subscribe_reconnections().unwrap();
        let mut disconnections = client.subscribe_disconnections().unwrap();

        client.start().await.unwrap();

        assert!(
            wait_for_disconnection(&mut disconnections, DisconnectionKind::NoMessageReceived)
                .await
        );
        assert!(
            wait_for_reconnection(&mut reconnections, ReconnectionKind::NoMessageReceived).await
        );

        client.dispose().await;
    }

    #[tokio::test]
    async fn reconnection_disabled_stays_down() {
        let server = MockWsServer::start().await;
        let mut config = ClientConfig::default();
        config.is_reconnection_enabled = false;

        let client = WebsocketClient::with_config(&server.ws_url(), config).unwrap();
        let mut reconnections = client.subscribe_reconnections().unwrap();
        let mut disconnections = client.subscribe_disconnections().unwrap();

        client.start().await.unwrap();
        assert!(wait_for_reconnection(&mut reconnections, ReconnectionKind::Initial).await);

        server.disconnect_all();

        assert!(wait_for_disconnection(&mut disconnections, DisconnectionKind::Lost).await);
        sleep(Duration::from_millis(200)).await;

        assert!(!client.is_started());
        assert!(!client.is_running());
        assert!(matches!(
            reconnections.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));

        client.dispose().await;
    }
}

mod server_close {
    use super::*;

    #[tokio::test]
    async fn server_close_triggers_lost_reconnect() {
        let server = MockWsServer::start().await;
        let client = WebsocketClient::new(&server.ws_url()).unwrap();
        let mut reconnections = client.subscribe_reconnections().unwrap();
        let mut disconnections = client.subscribe_disconnections().unwrap();

        client.start().await.unwrap();
        assert!(wait_for_reconnection(&mut reconnections, ReconnectionKind::Initial).await);

        server.send_close(1000, "server going away");

        assert!(wait_for_disconnection(&mut disconnections, DisconnectionKind::ByServer).await);
        assert!(wait_for_reconnection(&mut reconnections, ReconnectionKind::Lost).await);
        assert!(client.is_running());

        client.dispose().await;
    }

    #[tokio::test]
    async fn by_server_event_carries_close_status() {
        let server = MockWsServer::start().await;
        let client = WebsocketClient::new(&server.ws_url()).unwrap();
        let mut disconnections = client.subscribe_disconnections().unwrap();

        client.start().await.unwrap();
        server.send_close(1001, "maintenance");

        let info = timeout(Duration::from_secs(3), async {
            loop {
                let info = disconnections.recv().await.unwrap();
                if info.kind() == DisconnectionKind::ByServer {
                    return info;
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(info.close_code(), Some(CloseCode::GOING_AWAY));
        assert_eq!(info.close_reason(), Some("maintenance"));

        client.dispose().await;
    }

    #[tokio::test]
    async fn cancel_closing_skips_close_handshake() {
        let mut server = MockWsServer::start().await;
        let mut config = ClientConfig::default();
        config.lost_reconnect_timeout = Some(Duration::from_millis(50));

        let client = WebsocketClient::with_config(&server.ws_url(), config).unwrap();
        let mut reconnections = client.subscribe_reconnections().unwrap();

        client.on_disconnection(|info| {
            if info.kind() == DisconnectionKind::ByServer {
                info.set_cancel_closing(true);
            }
        });

        client.start().await.unwrap();
        assert!(wait_for_reconnection(&mut reconnections, ReconnectionKind::Initial).await);

        server.send_close(1000, "server going away");

        // The session skips its close handshake and comes straight back.
        assert!(wait_for_reconnection(&mut reconnections, ReconnectionKind::Lost).await);
        assert!(client.is_running());
        assert!(client.is_started());

        client.dispose().await;
    }

    #[tokio::test]
    async fn cancel_closing_with_reconnection_disabled_stays_stopped() {
        let server = MockWsServer::start().await;
        let mut config = ClientConfig::default();
        config.is_reconnection_enabled = false;

        let client = WebsocketClient::with_config(&server.ws_url(), config).unwrap();
        let mut reconnections = client.subscribe_reconnections().unwrap();
        let mut disconnections = client.subscribe_disconnections().unwrap();

        client.on_disconnection(|info| info.set_cancel_closing(true));

        client.start().await.unwrap();
        assert!(wait_for_reconnection(&mut reconnections, ReconnectionKind::Initial).await);

        server.send_close(1000, "server going away");

        assert!(wait_for_disconnection(&mut disconnections, DisconnectionKind::ByServer).await);
        sleep(Duration::from_millis(200)).await;

        assert!(!client.is_started());
        assert!(!client.is_running());
        assert!(matches!(
            reconnections.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));

        client.dispose().await;
    }
}

mod fail_fast {
    use super::*;

    #[tokio::test]
    async fn stop_or_fail_propagates_close_failure() {
        let server = MockWsServer::start().await;
        let client = WebsocketClient::with_factory(
            &server.ws_url(),
            ClientConfig::default(),
            CloseFailFactory::new(),
        )
        .unwrap();

        client.start().await.unwrap();
        assert!(client.is_running());

        let err = client
            .stop_or_fail(CloseCode::NORMAL_CLOSURE, "bye")
            .await
            .unwrap_err();

        assert_eq!(err.kind(), Kind::Close);
        assert!(!client.is_running());
        assert!(!client.is_started());

        client.dispose().await;
    }
}

mod disposal {
    use super::*;

    #[tokio::test]
    async fn dispose_is_idempotent() {
        let server = MockWsServer::start().await;
        let client = WebsocketClient::new(&server.ws_url()).unwrap();

        client.start().await.unwrap();
        client.dispose().await;
        client.dispose().await;

        assert!(client.is_disposed());
    }

    #[tokio::test]
    async fn operations_after_dispose_fail() {
        let server = MockWsServer::start().await;
        let client = WebsocketClient::new(&server.ws_url()).unwrap();

        client.dispose().await;

        assert_eq!(client.start().await.unwrap_err().kind(), Kind::Disposed);
        assert_eq!(client.send_text("x").unwrap_err().kind(), Kind::Disposed);
        assert_eq!(
            client
                .stop(CloseCode::NORMAL_CLOSURE, "bye")
                .await
                .unwrap_err()
                .kind(),
            Kind::Disposed
        );
        assert_eq!(
            client.subscribe_messages().unwrap_err().kind(),
            Kind::Disposed
        );
        assert_eq!(
            client
                .stream_fake_message(Message::text("x"))
                .unwrap_err()
                .kind(),
            Kind::Disposed
        );
    }

    #[tokio::test]
    async fn dispose_emits_exit_then_completes_streams() {
        let server = MockWsServer::start().await;
        let client = WebsocketClient::new(&server.ws_url()).unwrap();
        let mut disconnections = client.subscribe_disconnections().unwrap();
        let mut messages = client.subscribe_messages().unwrap();

        client.start().await.unwrap();
        client.dispose().await;

        let info = timeout(Duration::from_secs(2), disconnections.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(info.kind(), DisconnectionKind::Exit);

        // Streams complete; no further events arrive.
        assert!(matches!(
            timeout(Duration::from_secs(2), disconnections.recv())
                .await
                .unwrap(),
            Err(broadcast::error::RecvError::Closed)
        ));
        assert!(matches!(
            timeout(Duration::from_secs(2), messages.recv()).await.unwrap(),
            Err(broadcast::error::RecvError::Closed)
        ));
    }

    #[tokio::test]
    async fn rapid_dispose_during_send_does_not_panic() {
        let server = MockWsServer::start().await;
        let client = WebsocketClient::new(&server.ws_url()).unwrap();

        client.start().await.unwrap();
        for i in 0..20_u8 {
            client.send_binary(vec![i]).unwrap();
        }
        client.dispose().await;

        assert!(client.is_disposed());
    }
}
