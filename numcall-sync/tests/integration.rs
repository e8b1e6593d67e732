//! End-to-end tests against a real server.
//!
//! Each test binds a server on a free port and talks to it with raw
//! WebSocket clients, so every frame crosses the wire codec.

use futures_util::{SinkExt, StreamExt};
use numcall_sync::broadcast::Hub;
use numcall_sync::category::Category;
use numcall_sync::config::{OriginPolicy, ServerConfig};
use numcall_sync::protocol::{Added, ClientMessage, Frame, Removed, ServerMessage, WireFormat};
use numcall_sync::server::SyncServer;
use numcall_sync::store::EntryId;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Start a server on a free port; returns the port and its hub.
async fn start_test_server(config: ServerConfig) -> (u16, Arc<Mutex<Hub>>) {
    let server = SyncServer::new(ServerConfig {
        bind_addr: "127.0.0.1:0".into(),
        ..config
    });
    let listener = server.bind().await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let hub = server.hub();
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    (port, hub)
}

async fn connect(port: u16, query: &str) -> Ws {
    let url = format!("ws://127.0.0.1:{port}/?{query}");
    let (ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    ws
}

async fn recv(ws: &mut Ws) -> ServerMessage {
    loop {
        let msg = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("websocket error");
        match msg {
            Message::Binary(data) => return ServerMessage::decode_binary(&data).unwrap(),
            Message::Text(text) => return ServerMessage::decode_text(text.as_str()).unwrap(),
            _ => continue,
        }
    }
}

async fn send(ws: &mut Ws, msg: &ClientMessage) {
    let frame = match msg.encode(WireFormat::Binary).unwrap() {
        Frame::Binary(bytes) => Message::Binary(bytes.into()),
        Frame::Text(text) => Message::Text(text.into()),
    };
    ws.send(frame).await.unwrap();
}

fn add(category: Category, value: &str) -> ClientMessage {
    ClientMessage::NumberAdded {
        category,
        value: value.into(),
        announce_text: None,
    }
}

/// Poll the hub until `check` holds.
async fn wait_for(hub: &Arc<Mutex<Hub>>, check: impl Fn(&Hub) -> bool) {
    timeout(Duration::from_secs(2), async {
        while !check(&*hub.lock().await) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("hub never reached the expected state");
}

#[tokio::test]
async fn test_new_connection_gets_initial_state() {
    let (port, _hub) = start_test_server(ServerConfig::default()).await;
    let mut ws = connect(port, "").await;

    match recv(&mut ws).await {
        ServerMessage::InitialState { seq, state, .. } => {
            assert_eq!(seq, 0);
            assert!(state.is_empty());
        }
        other => panic!("expected initial-state, got {other:?}"),
    }
}

#[tokio::test]
async fn test_add_reaches_every_client() {
    let (port, _hub) = start_test_server(ServerConfig::default()).await;
    let mut a = connect(port, "").await;
    let mut b = connect(port, "").await;
    let mut c = connect(port, "").await;
    for ws in [&mut a, &mut b, &mut c] {
        assert!(matches!(recv(ws).await, ServerMessage::InitialState { .. }));
    }

    send(&mut a, &add(Category::Drs, "7")).await;

    let expected = ServerMessage::NumberUpdate(Added {
        seq: 1,
        category: Category::Drs,
        value: "7".into(),
        id: EntryId(1),
        position: 0,
        announce_text: "DRS 7".into(),
    });
    for ws in [&mut a, &mut b, &mut c] {
        assert_eq!(recv(ws).await, expected);
    }
}

#[tokio::test]
async fn test_late_joiner_sees_snapshot() {
    let (port, hub) = start_test_server(ServerConfig::default()).await;
    let mut a = connect(port, "").await;
    recv(&mut a).await;
    send(&mut a, &add(Category::Override, "3")).await;
    send(&mut a, &add(Category::CheckDate, "15")).await;
    wait_for(&hub, |h| h.seq() == 2).await;

    let mut late = connect(port, "").await;
    match recv(&mut late).await {
        ServerMessage::InitialState { seq, state, .. } => {
            assert_eq!(seq, 2);
            assert_eq!(state.values(Category::Override), vec!["3"]);
            assert_eq!(state.values(Category::CheckDate), vec!["15"]);
            assert!(state.values(Category::Drs).is_empty());
        }
        other => panic!("expected initial-state, got {other:?}"),
    }
}

#[tokio::test]
async fn test_stale_position_delete_is_rejected() {
    let (port, hub) = start_test_server(ServerConfig::default()).await;
    let mut a = connect(port, "").await;
    let mut b = connect(port, "").await;
    recv(&mut a).await;
    recv(&mut b).await;

    send(&mut a, &add(Category::Drs, "7")).await;
    send(&mut a, &add(Category::Drs, "9")).await;
    for _ in 0..2 {
        recv(&mut a).await;
        recv(&mut b).await;
    }

    // A deletes "7"; B still sees ["7", "9"] and deletes "9" at position 1.
    send(
        &mut a,
        &ClientMessage::NumberDeleted {
            category: Category::Drs,
            position: 0,
        },
    )
    .await;
    let expected = ServerMessage::NumberDeleted(Removed {
        seq: 3,
        category: Category::Drs,
        position: 0,
        id: EntryId(1),
    });
    assert_eq!(recv(&mut a).await, expected);

    send(
        &mut b,
        &ClientMessage::NumberDeleted {
            category: Category::Drs,
            position: 1,
        },
    )
    .await;
    wait_for(&hub, |h| h.stats().intents_rejected == 1).await;
    assert_eq!(hub.lock().await.snapshot().values(Category::Drs), vec!["9"]);

    // The rejected delete produced no event; the next one is seq 4.
    assert_eq!(recv(&mut b).await, expected);
    send(&mut a, &add(Category::Drs, "8")).await;
    match recv(&mut b).await {
        ServerMessage::NumberUpdate(added) => assert_eq!(added.seq, 4),
        other => panic!("expected number-update, got {other:?}"),
    }
}

#[tokio::test]
async fn test_identifier_delete_has_no_race() {
    let (port, hub) = start_test_server(ServerConfig::default()).await;
    let mut a = connect(port, "").await;
    let mut b = connect(port, "").await;
    recv(&mut a).await;
    recv(&mut b).await;

    send(&mut a, &add(Category::Drs, "7")).await;
    send(&mut a, &add(Category::Drs, "9")).await;
    wait_for(&hub, |h| h.seq() == 2).await;

    send(
        &mut a,
        &ClientMessage::EntryRemoved {
            category: Category::Drs,
            id: EntryId(1),
        },
    )
    .await;
    send(
        &mut b,
        &ClientMessage::EntryRemoved {
            category: Category::Drs,
            id: EntryId(2),
        },
    )
    .await;

    wait_for(&hub, |h| h.seq() == 4).await;
    let hub = hub.lock().await;
    assert!(hub.snapshot().is_empty());
    assert_eq!(hub.stats().intents_rejected, 0);
}

#[tokio::test]
async fn test_invalid_intents_keep_connection_open() {
    let (port, hub) = start_test_server(ServerConfig::default()).await;
    let mut a = connect(port, "").await;
    recv(&mut a).await;

    send(&mut a, &add(Category::Drs, "7a")).await;
    a.send(Message::Text(r#"{"number-added":{"category":"Bogus","value":"1"}}"#.into()))
        .await
        .unwrap();
    a.send(Message::Binary(vec![0xff, 0xfe].into())).await.unwrap();
    send(&mut a, &add(Category::Drs, "4")).await;

    match recv(&mut a).await {
        ServerMessage::NumberUpdate(added) => {
            assert_eq!(added.seq, 1);
            assert_eq!(added.value, "4");
        }
        other => panic!("expected number-update, got {other:?}"),
    }
    assert_eq!(hub.lock().await.stats().intents_rejected, 1);
}

#[tokio::test]
async fn test_json_clients_use_text_frames() {
    let (port, _hub) = start_test_server(ServerConfig::default()).await;
    let mut ws = connect(port, "format=json").await;

    let greeting = timeout(Duration::from_secs(2), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(greeting.is_text(), "expected a text frame, got {greeting:?}");

    ws.send(Message::Text(
        r#"{"number-added":{"category":"Check Date","number":"21","announceText":"Check Date 21"}}"#
            .into(),
    ))
    .await
    .unwrap();

    match recv(&mut ws).await {
        ServerMessage::NumberUpdate(added) => {
            assert_eq!(added.category, Category::CheckDate);
            assert_eq!(added.value, "21");
            assert_eq!(added.announce_text, "Check Date 21");
        }
        other => panic!("expected number-update, got {other:?}"),
    }
}

#[tokio::test]
async fn test_disallowed_origin_is_refused() {
    let config = ServerConfig {
        origin_policy: OriginPolicy::AllowList(vec!["http://localhost:3000".into()]),
        ..ServerConfig::default()
    };
    let (port, _hub) = start_test_server(config).await;
    let url = format!("ws://127.0.0.1:{port}/");

    let mut request = url.as_str().into_client_request().unwrap();
    request
        .headers_mut()
        .insert("Origin", HeaderValue::from_static("http://evil.example"));
    match tokio_tungstenite::connect_async(request).await {
        Err(WsError::Http(response)) => assert_eq!(response.status(), StatusCode::FORBIDDEN),
        Err(other) => panic!("expected HTTP 403, got {other}"),
        Ok(_) => panic!("upgrade should have been refused"),
    }

    let mut request = url.as_str().into_client_request().unwrap();
    request
        .headers_mut()
        .insert("Origin", HeaderValue::from_static("http://localhost:3000"));
    assert!(tokio_tungstenite::connect_async(request).await.is_ok());
}

#[tokio::test]
async fn test_ping_is_answered() {
    let (port, _hub) = start_test_server(ServerConfig::default()).await;
    let mut ws = connect(port, "").await;
    recv(&mut ws).await;

    ws.send(Message::Ping(vec![1, 2, 3].into())).await.unwrap();
    let pong = timeout(Duration::from_secs(2), async {
        loop {
            if let Some(Ok(Message::Pong(data))) = ws.next().await {
                return data;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(&pong[..], &[1, 2, 3]);
}
