use super::*;
use std::{collections::HashMap, time::Duration};

use axum::{
    extract::{
        ws::{CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use serde_json::json;
use tokio::net::TcpListener;

#[derive(Clone, Default)]
struct ServerState {
    tokens: Arc<Mutex<Vec<String>>>,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<ServerState>,
) -> impl IntoResponse {
    if let Some(token) = params.get("token") {
        state.tokens.lock().await.push(token.clone());
    }
    ws.on_upgrade(serve_socket)
}

async fn reply(socket: &mut WebSocket, frame: WireFrame) -> bool {
    let text = serde_json::to_string(&frame).expect("encode frame");
    socket.send(WsMessage::Text(text)).await.is_ok()
}

async fn serve_socket(mut socket: WebSocket) {
    while let Some(Ok(message)) = socket.recv().await {
        let WsMessage::Text(text) = message else {
            continue;
        };
        let frame: WireFrame = serde_json::from_str(&text).expect("client frame");
        let ack = frame.ack;
        let ok = match (frame.event.as_deref(), ack) {
            (Some("send_message"), Some(id)) => {
                reply(&mut socket, WireFrame::ack(id, json!({ "ok": true, "echo": frame.data }))).await
            }
            (Some("mark_messages_read"), Some(id)) => {
                reply(&mut socket, WireFrame::ack(id, json!({ "error": "forbidden" }))).await
            }
            (Some("join_conversation"), None) => {
                reply(
                    &mut socket,
                    WireFrame::event("user:online", json!({ "userId": "u2" }), None),
                )
                .await
            }
            (Some("kick"), None) => {
                let _ = socket
                    .send(WsMessage::Close(Some(CloseFrame {
                        code: 1000,
                        reason: "io server disconnect".into(),
                    })))
                    .await;
                false
            }
            _ => true,
        };
        if !ok {
            break;
        }
    }
}

async fn close_on_upgrade(ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(|mut socket| async move {
        let _ = socket
            .send(WsMessage::Close(Some(CloseFrame {
                code: 1000,
                reason: "io server disconnect".into(),
            })))
            .await;
    })
}

async fn start_server() -> (Url, ServerState) {
    let state = ServerState::default();
    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/closing", get(close_on_upgrade))
        .with_state(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    let url = Url::parse(&format!("ws://{addr}/ws")).expect("url");
    (url, state)
}

async fn next_event(rx: &mut broadcast::Receiver<TransportEvent>) -> TransportEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("event in time")
        .expect("event channel open")
}

#[tokio::test]
async fn connects_with_token_and_resolves_acks() {
    let (url, server) = start_server().await;
    let transport = WebSocketTransport::new(url);
    let mut events = transport.subscribe();

    transport.connect("secret-token").await;
    assert_eq!(next_event(&mut events).await, TransportEvent::Connected);
    assert!(transport.is_connected());
    assert_eq!(*server.tokens.lock().await, vec!["secret-token".to_string()]);

    let ack = transport
        .emit("send_message", json!({ "content": "hello" }))
        .await
        .expect("ack");
    assert_eq!(ack, json!({ "ok": true, "echo": { "content": "hello" } }));
}

#[tokio::test]
async fn rejected_ack_surfaces_reason() {
    let (url, _server) = start_server().await;
    let transport = WebSocketTransport::new(url);
    let mut events = transport.subscribe();
    transport.connect("t").await;
    next_event(&mut events).await;

    let err = transport
        .emit("mark_messages_read", json!({ "conversationId": "c1" }))
        .await
        .expect_err("rejected");
    assert_eq!(
        err,
        TransportError::Rejected {
            event: "mark_messages_read".into(),
            reason: "forbidden".into(),
        }
    );
}

#[tokio::test]
async fn inbound_events_are_broadcast() {
    let (url, _server) = start_server().await;
    let transport = WebSocketTransport::new(url);
    let mut events = transport.subscribe();
    transport.connect("t").await;
    next_event(&mut events).await;

    transport
        .send("join_conversation", json!({ "conversationId": "c1" }))
        .await
        .expect("send");

    assert_eq!(
        next_event(&mut events).await,
        TransportEvent::Inbound {
            event: "user:online".into(),
            data: json!({ "userId": "u2" }),
        }
    );
}

#[tokio::test]
async fn server_close_reason_is_reported() {
    let (url, _server) = start_server().await;
    let transport = WebSocketTransport::new(url);
    let mut events = transport.subscribe();
    transport.connect("t").await;
    next_event(&mut events).await;

    transport.send("kick", Value::Null).await.expect("send");

    assert_eq!(
        next_event(&mut events).await,
        TransportEvent::Disconnected {
            reason: "io server disconnect".into(),
        }
    );
    assert!(!transport.is_connected());
    assert_eq!(
        transport.emit("send_message", Value::Null).await,
        Err(TransportError::NotConnected)
    );
}

#[tokio::test]
async fn client_disconnect_reports_client_reason() {
    let (url, _server) = start_server().await;
    let transport = WebSocketTransport::new(url);
    let mut events = transport.subscribe();
    transport.connect("t").await;
    next_event(&mut events).await;

    transport.disconnect().await;

    assert_eq!(
        next_event(&mut events).await,
        TransportEvent::Disconnected {
            reason: CLIENT_DISCONNECT_REASON.into(),
        }
    );
}

#[tokio::test]
async fn unreachable_server_reports_connect_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let transport = WebSocketTransport::new(Url::parse(&format!("ws://{addr}/ws")).expect("url"));
    let mut events = transport.subscribe();
    transport.connect("t").await;

    assert!(matches!(
        next_event(&mut events).await,
        TransportEvent::ConnectError(_)
    ));
    assert!(!transport.is_connected());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn immediate_server_close_is_reported_after_connected() {
    let (url, _server) = start_server().await;
    let transport = WebSocketTransport::new(url.join("/closing").expect("url"));
    let mut events = transport.subscribe();

    for _ in 0..100 {
        transport.connect("t").await;
        assert_eq!(next_event(&mut events).await, TransportEvent::Connected);
        assert_eq!(
            next_event(&mut events).await,
            TransportEvent::Disconnected {
                reason: "io server disconnect".into(),
            }
        );
        assert!(!transport.is_connected());
    }
}

#[tokio::test]
async fn replaced_session_does_not_report_its_close() {
    let (url, _server) = start_server().await;
    let transport = WebSocketTransport::new(url);
    let mut events = transport.subscribe();
    transport.connect("t").await;
    next_event(&mut events).await;

    transport.disconnect().await;
    assert_eq!(
        next_event(&mut events).await,
        TransportEvent::Disconnected {
            reason: CLIENT_DISCONNECT_REASON.into(),
        }
    );
    transport.connect("t").await;
    assert_eq!(next_event(&mut events).await, TransportEvent::Connected);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(transport.is_connected());
    assert!(events.try_recv().is_err());
}
