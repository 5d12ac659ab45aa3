//! End-to-end tests over real WebSockets.
//!
//! Each test starts a relay server on a free port. Participants are either
//! full `SessionClient`s or raw tungstenite sockets when the test needs to
//! look at individual frames.

use codesync_collab::client::{ConnectionState, SessionClient, SessionEvent, Transport};
use codesync_collab::editor::{LocalChange, DEFAULT_CODE};
use codesync_collab::protocol::{ClientMessage, ServerMessage};
use codesync_collab::server::{CollabServer, ServerConfig};

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type RawSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(3);

/// Start a server on a free port, return its URL and a handle to it.
async fn start_test_server() -> (String, CollabServer) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let server = CollabServer::new(ServerConfig {
        bind_addr: url.trim_start_matches("ws://").to_string(),
        ..ServerConfig::default()
    });
    tokio::spawn(server.clone().serve(listener));
    (url, server)
}

async fn raw_connect(url: &str) -> RawSocket {
    let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    ws
}

async fn send_binary(ws: &mut RawSocket, message: ClientMessage) {
    ws.send(Message::Binary(message.encode().unwrap().into()))
        .await
        .unwrap();
}

/// Next protocol message, skipping control frames.
async fn next_message(ws: &mut RawSocket) -> ServerMessage {
    timeout(WAIT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Binary(data))) => return ServerMessage::decode(&data).unwrap(),
                Some(Ok(Message::Text(text))) => {
                    return ServerMessage::from_json(text.as_str()).unwrap()
                }
                Some(Ok(_)) => continue,
                other => panic!("socket ended: {other:?}"),
            }
        }
    })
    .await
    .expect("no message within timeout")
}

async fn wait_for_joins(server: &CollabServer, joins: u64) {
    timeout(WAIT, async {
        while server.relay().stats().await.unwrap().joins < joins {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("joins not observed");
}

async fn wait_for_snapshot(server: &CollabServer, room: &str, expected: &str) {
    timeout(WAIT, async {
        while server.relay().snapshot(room).await.unwrap().as_deref() != Some(expected) {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("room {room} never reached {expected:?}"));
}

async fn next_event(rx: &mut mpsc::Receiver<SessionEvent>) -> SessionEvent {
    timeout(WAIT, rx.recv())
        .await
        .expect("no event within timeout")
        .expect("event channel closed")
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let (url, _server) = start_test_server().await;
    assert!(tokio_tungstenite::connect_async(&url).await.is_ok());
}

#[tokio::test]
async fn test_bootstrap_then_edit_reaches_peer() {
    let (url, server) = start_test_server().await;

    // A opens an empty room and keeps the default text.
    let mut a = SessionClient::connect(&url, "R1").await.unwrap();
    let mut a_events = a.take_event_rx().unwrap();
    wait_for_joins(&server, 1).await;
    assert_eq!(a.content().await, DEFAULT_CODE);
    assert_eq!(server.relay().snapshot("R1").await.unwrap(), None);

    // B joins; the relay asks A, A answers, B gets A's buffer.
    let mut b = raw_connect(&url).await;
    send_binary(&mut b, ClientMessage::join_room("R1")).await;
    assert_eq!(next_message(&mut b).await, ServerMessage::send_code(DEFAULT_CODE));
    assert_eq!(next_event(&mut a_events).await, SessionEvent::SnapshotProvided);
    wait_for_snapshot(&server, "R1", DEFAULT_CODE).await;

    // A types; after the debounce window B sees it and the registry holds it.
    assert_eq!(a.local_change("x=1").await, LocalChange::Broadcast);
    assert_eq!(next_message(&mut b).await, ServerMessage::code_sync("x=1"));
    wait_for_snapshot(&server, "R1", "x=1").await;
}

#[tokio::test]
async fn test_cached_snapshot_served_without_peer_round_trip() {
    let (url, server) = start_test_server().await;

    let mut a = SessionClient::connect(&url, "R1").await.unwrap();
    let mut a_events = a.take_event_rx().unwrap();
    wait_for_joins(&server, 1).await;
    a.local_change("cached").await;
    wait_for_snapshot(&server, "R1", "cached").await;

    let mut c = SessionClient::connect(&url, "R1").await.unwrap();
    let mut c_events = c.take_event_rx().unwrap();

    assert_eq!(
        next_event(&mut c_events).await,
        SessionEvent::RemoteUpdate("cached".into())
    );
    assert_eq!(c.content().await, "cached");

    // A was never asked for its buffer.
    sleep(Duration::from_millis(100)).await;
    assert!(a_events.try_recv().is_err());
    assert_eq!(server.relay().stats().await.unwrap().snapshots_served, 1);
}

#[tokio::test]
async fn test_last_writer_wins() {
    let (url, server) = start_test_server().await;

    let mut a = raw_connect(&url).await;
    let mut b = raw_connect(&url).await;
    let mut c = raw_connect(&url).await;
    send_binary(&mut a, ClientMessage::join_room("R1")).await;
    wait_for_joins(&server, 1).await;
    send_binary(&mut b, ClientMessage::join_room("R1")).await;
    wait_for_joins(&server, 2).await;
    send_binary(&mut c, ClientMessage::join_room("R1")).await;
    wait_for_joins(&server, 3).await;

    send_binary(&mut a, ClientMessage::code_change("R1", "from a")).await;
    wait_for_snapshot(&server, "R1", "from a").await;
    send_binary(&mut b, ClientMessage::code_change("R1", "from b")).await;
    wait_for_snapshot(&server, "R1", "from b").await;

    let mut last = None;
    while last != Some(ServerMessage::code_sync("from b")) {
        last = Some(next_message(&mut c).await);
    }

    // B never hears its own edit back; the last thing it saw is A's.
    let mut seen_by_b = Vec::new();
    while let Ok(msg) = timeout(Duration::from_millis(100), next_message(&mut b)).await {
        seen_by_b.push(msg);
    }
    assert!(!seen_by_b.contains(&ServerMessage::code_sync("from b")));
    assert!(seen_by_b.contains(&ServerMessage::code_sync("from a")));
}

#[tokio::test]
async fn test_remote_update_is_not_echoed() {
    let (url, server) = start_test_server().await;

    let mut a = SessionClient::connect(&url, "R1").await.unwrap();
    let mut a_events = a.take_event_rx().unwrap();
    wait_for_joins(&server, 1).await;

    let mut b = raw_connect(&url).await;
    send_binary(&mut b, ClientMessage::join_room("R1")).await;
    next_message(&mut b).await; // bootstrap
    assert_eq!(next_event(&mut a_events).await, SessionEvent::SnapshotProvided);

    send_binary(&mut b, ClientMessage::code_change("R1", "from b")).await;
    assert_eq!(
        next_event(&mut a_events).await,
        SessionEvent::RemoteUpdate("from b".into())
    );

    // A's widget reports the programmatic update.
    assert_eq!(a.local_change("from b").await, LocalChange::Suppressed);
    sleep(Duration::from_millis(400)).await;

    assert!(timeout(Duration::from_millis(100), next_message(&mut b)).await.is_err());
    assert_eq!(server.relay().stats().await.unwrap().edits_applied, 1);
}

#[tokio::test]
async fn test_rooms_are_isolated() {
    let (url, server) = start_test_server().await;

    let mut a = raw_connect(&url).await;
    let mut b = raw_connect(&url).await;
    send_binary(&mut a, ClientMessage::join_room("R1")).await;
    send_binary(&mut b, ClientMessage::join_room("R2")).await;
    wait_for_joins(&server, 2).await;

    send_binary(&mut a, ClientMessage::code_change("R1", "only r1")).await;
    wait_for_snapshot(&server, "R1", "only r1").await;

    assert!(timeout(Duration::from_millis(100), next_message(&mut b)).await.is_err());
    assert_eq!(server.relay().snapshot("R2").await.unwrap(), None);
}

#[tokio::test]
async fn test_json_client_gets_json_replies() {
    let (url, server) = start_test_server().await;

    let mut browser = raw_connect(&url).await;
    browser
        .send(Message::Text(r#"{"join-room":{"room_id":"R1"}}"#.into()))
        .await
        .unwrap();
    wait_for_joins(&server, 1).await;

    let mut native = raw_connect(&url).await;
    send_binary(&mut native, ClientMessage::join_room("R1")).await;

    let frame = timeout(WAIT, browser.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(frame, Message::Text(r#""request-latest-code""#.into()));

    browser
        .send(Message::Text(
            r#"{"provide-code":{"room_id":"R1","code":"print(1)"}}"#.into(),
        ))
        .await
        .unwrap();

    // The binary peer keeps getting binary frames.
    match timeout(WAIT, native.next()).await.unwrap().unwrap().unwrap() {
        Message::Binary(data) => {
            assert_eq!(ServerMessage::decode(&data).unwrap(), ServerMessage::send_code("print(1)"))
        }
        other => panic!("expected binary frame, got {other:?}"),
    }
}

#[tokio::test]
async fn test_malformed_frame_is_dropped() {
    let (url, server) = start_test_server().await;

    let mut ws = raw_connect(&url).await;
    ws.send(Message::Binary(vec![0xFF, 0xFE, 0xFD].into())).await.unwrap();
    ws.send(Message::Text("not json".into())).await.unwrap();
    // code-change whose code length prefix claims 1 TiB
    let mut oversized = vec![2, 2, b'R', b'1', 0xFD];
    oversized.extend_from_slice(&(1u64 << 40).to_le_bytes());
    ws.send(Message::Binary(oversized.into())).await.unwrap();
    send_binary(&mut ws, ClientMessage::join_room("R1")).await;
    send_binary(&mut ws, ClientMessage::code_change("R1", "still here")).await;

    wait_for_snapshot(&server, "R1", "still here").await;
    let stats = server.stats().await;
    assert_eq!(stats.malformed_frames, 3);
    assert_eq!(stats.active_connections, 1);
}

#[tokio::test]
async fn test_snapshot_outlives_members() {
    let (url, server) = start_test_server().await;

    let mut a = SessionClient::connect(&url, "R1").await.unwrap();
    wait_for_joins(&server, 1).await;
    a.local_change("persisted in memory").await;
    wait_for_snapshot(&server, "R1", "persisted in memory").await;

    assert!(a.leave().await);
    assert!(!a.leave().await);
    assert_eq!(a.connection_state().await, ConnectionState::Disconnected);
    timeout(WAIT, async {
        while server.relay().stats().await.unwrap().active_connections > 0 {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let mut b = raw_connect(&url).await;
    send_binary(&mut b, ClientMessage::join_room("R1")).await;
    assert_eq!(
        next_message(&mut b).await,
        ServerMessage::send_code("persisted in memory")
    );
}

#[tokio::test]
async fn test_ping_pong() {
    let (url, _server) = start_test_server().await;
    let mut ws = raw_connect(&url).await;

    ws.send(Message::Ping(b"hi".to_vec().into())).await.unwrap();

    let frame = timeout(WAIT, ws.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(frame, Message::Pong(b"hi".to_vec().into()));
}

#[tokio::test]
async fn test_in_process_clients_share_room() {
    let (_url, server) = start_test_server().await;

    let transport = Transport::in_process(server.relay(), 64).await.unwrap();
    let mut a = SessionClient::join(transport, "R1", Duration::from_millis(20))
        .await
        .unwrap();
    wait_for_joins(&server, 1).await;

    let transport = Transport::in_process(server.relay(), 64).await.unwrap();
    let mut b = SessionClient::join(transport, "R1", Duration::from_millis(20))
        .await
        .unwrap();
    let mut b_events = b.take_event_rx().unwrap();
    wait_for_snapshot(&server, "R1", DEFAULT_CODE).await;

    a.local_change("fn main() {}").await;
    assert_eq!(
        next_event(&mut b_events).await,
        SessionEvent::RemoteUpdate("fn main() {}".into())
    );
    assert_eq!(b.content().await, "fn main() {}");

    a.leave().await;
    timeout(WAIT, async {
        while server.relay().stats().await.unwrap().active_connections > 1 {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("in-process client was not disconnected");
}
