//! End-to-end tests against an in-process axum chat server.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode, header::AUTHORIZATION};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{Value, json};
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use chat_client::{RestHistoryClient, TransportConfig, WsChannel, WsChannelFactory};
use chat_sync::{
    ClientEvent, ConnectionState, EventChannel, EventKind, FetchError, HistoryFetcher, Inbound,
    LoadStatus, ServerEvent, Session, Subscription, SyncClient, SyncConfig,
};

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

// --- Fake server ---

#[derive(Clone, Debug)]
enum Push {
    /// Event payload; wrapped in an envelope per socket
    Event(Value),
    /// Sent verbatim
    Raw(String),
    /// Close every socket
    Kick,
}

struct ServerState {
    auth_headers: Mutex<Vec<Option<String>>>,
    received: mpsc::UnboundedSender<Value>,
    push: broadcast::Sender<Push>,
    /// Sockets that have started listening for pushes
    opened: watch::Sender<usize>,
    online: Vec<String>,
}

impl ServerState {
    fn replies_for(&self, event: &Value) -> Vec<Value> {
        match event["type"].as_str() {
            Some("join_room") => vec![json!({
                "type": "room_joined",
                "chat_id": event["chat_id"],
                "request_id": event["request_id"],
            })],
            Some("send_message") => vec![json!({
                "type": "new_message",
                "id": format!("srv-{}", event["client_ref"].as_str().unwrap_or("x")),
                "chat_id": event["chat_id"],
                "sender_id": "u1",
                "sender_display_name": "Alice",
                "text_content": event["text_content"],
                "image_data_url": event["image_data_url"],
                "created_at": "2025-01-02T03:05:00Z",
            })],
            Some("check_online_status") => {
                let asked: Vec<&str> = event["user_ids"]
                    .as_array()
                    .map(|ids| ids.iter().filter_map(Value::as_str).collect())
                    .unwrap_or_default();
                let online: Vec<&str> = asked
                    .into_iter()
                    .filter(|id| self.online.iter().any(|o| o == id))
                    .collect();
                vec![json!({"type": "online_users", "user_ids": online})]
            }
            _ => Vec::new(),
        }
    }
}

struct FakeServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
    received: mpsc::UnboundedReceiver<Value>,
    _shutdown: oneshot::Sender<()>,
}

impl FakeServer {
    async fn start() -> Self {
        let (received_tx, received) = mpsc::unbounded_channel();
        let (push, _) = broadcast::channel(64);
        let state = Arc::new(ServerState {
            auth_headers: Mutex::new(Vec::new()),
            received: received_tx,
            push,
            opened: watch::Sender::new(0),
            online: vec!["u2".to_string()],
        });

        let app = Router::new()
            .route("/ws", get(ws_handler))
            .route("/chats", get(list_chats))
            .route("/chats/{id}", get(chat_details))
            .route("/chats/{id}/messages", get(chat_messages))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = rx.await;
                })
                .await
                .unwrap();
        });

        Self {
            addr,
            state,
            received,
            _shutdown: tx,
        }
    }

    fn transport(&self) -> TransportConfig {
        TransportConfig {
            ws_url: format!("ws://{}/ws", self.addr),
            api_url: format!("http://{}", self.addr),
            reconnect_initial: Duration::from_millis(20),
            reconnect_max: Duration::from_millis(100),
            ..TransportConfig::default()
        }
    }

    /// The client sees the upgrade before the server subscribes to pushes.
    async fn wait_for_sockets(&self, count: usize) {
        let mut opened = self.state.opened.subscribe();
        tokio::time::timeout(TEST_TIMEOUT, opened.wait_for(|n| *n >= count))
            .await
            .expect("timed out waiting for the socket")
            .unwrap();
    }

    fn push(&self, push: Push) {
        let _ = self.state.push.send(push);
    }

    /// Next client event of the given type, skipping others.
    async fn expect(&mut self, event_type: &str) -> Value {
        tokio::time::timeout(TEST_TIMEOUT, async {
            loop {
                let event = self.received.recv().await.expect("server stopped");
                if event["type"] == event_type {
                    return event;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {event_type}"))
    }

    fn auth_headers(&self) -> Vec<Option<String>> {
        self.state.auth_headers.lock().unwrap().clone()
    }
}

async fn ws_handler(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let auth = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    state.auth_headers.lock().unwrap().push(auth);
    ws.on_upgrade(move |socket| serve_socket(socket, state))
}

async fn serve_socket(mut socket: WebSocket, state: Arc<ServerState>) {
    let mut pushes = state.push.subscribe();
    state.opened.send_modify(|n| *n += 1);
    let mut seq = 0u64;

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                let Some(Ok(WsMessage::Text(text))) = incoming else {
                    break;
                };
                let Ok(envelope) = serde_json::from_str::<Value>(text.as_str()) else {
                    continue;
                };
                let event = envelope["data"].clone();
                for reply in state.replies_for(&event) {
                    let _ = state.push.send(Push::Event(reply));
                }
                let _ = state.received.send(event);
            }

            push = pushes.recv() => {
                let frame = match push {
                    Ok(Push::Event(data)) => {
                        let frame = json!({
                            "v": 1,
                            "seq": seq,
                            "type": data["type"],
                            "data": data,
                        });
                        seq += 1;
                        frame.to_string()
                    }
                    Ok(Push::Raw(text)) => text,
                    Ok(Push::Kick) | Err(_) => break,
                };
                if socket.send(WsMessage::Text(frame.into())).await.is_err() {
                    break;
                }
            }
        }
    }
}

fn backlog_message(id: &str, chat: &str, text: &str) -> Value {
    json!({
        "id": id,
        "chat_id": chat,
        "sender_id": "u2",
        "sender_username": "bob",
        "sender_display_name": "Bob",
        "text_content": text,
        "image_data_url": null,
        "created_at": "2025-01-02T03:04:05Z",
    })
}

fn not_found(id: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "success": false,
            "error": {"message": format!("Chat {id} not found"), "status_code": 404, "code": "CHAT_NOT_FOUND"},
        })),
    )
        .into_response()
}

async fn list_chats() -> Json<Value> {
    Json(json!({
        "status": "success",
        "data": {"chats": [{
            "id": "c1",
            "type": "direct",
            "group_name": null,
            "other_member_id": "u2",
            "other_member_display_name": "Bob",
            "last_message_content": "second",
            "last_message_at": "2025-01-02T03:04:05Z",
            "unread_count": "2",
        }]},
    }))
}

async fn chat_details(Path(id): Path<String>) -> Response {
    if id != "c1" {
        return not_found(&id);
    }
    Json(json!({
        "status": "success",
        "data": {"chat": {
            "id": "c1",
            "type": "direct",
            "members": [
                {"id": "u1", "display_name": "Alice"},
                {"id": "u2", "display_name": "Bob"},
            ],
        }},
    }))
    .into_response()
}

async fn chat_messages(Path(id): Path<String>) -> Response {
    if id != "c1" {
        return not_found(&id);
    }
    Json(json!({
        "status": "success",
        "results": 2,
        "data": {"messages": [
            backlog_message("m1", "c1", "first"),
            backlog_message("m2", "c1", "second"),
        ]},
    }))
    .into_response()
}

// --- Helpers ---

fn alice() -> Session {
    Session::new("u1", "Alice").with_token("t-alice")
}

async fn next_inbound(sub: &mut Subscription) -> Inbound {
    tokio::time::timeout(TEST_TIMEOUT, sub.recv())
        .await
        .expect("timed out waiting for inbound event")
        .expect("subscription closed")
}

// --- Websocket channel ---

#[tokio::test]
async fn ws_channel_connects_with_bearer_and_exchanges_events() {
    let mut server = FakeServer::start().await;
    let channel = WsChannel::new(server.transport(), alice());
    let mut sub = channel.subscribe(EventKind::ALL);

    assert_eq!(
        channel.emit(ClientEvent::StartTyping {
            conversation_id: "c1".into()
        }),
        Err(chat_sync::ChannelError::NotConnected)
    );

    channel.connect();
    assert_eq!(next_inbound(&mut sub).await, Inbound::Connected);
    assert_eq!(server.auth_headers(), vec![Some("Bearer t-alice".to_string())]);

    channel
        .emit(ClientEvent::JoinRoom {
            conversation_id: "c1".into(),
            request_id: 7,
        })
        .unwrap();
    let join = server.expect("join_room").await;
    assert_eq!(join["chat_id"], "c1");

    assert_eq!(
        next_inbound(&mut sub).await,
        Inbound::Event(ServerEvent::RoomJoined {
            conversation_id: "c1".into(),
            request_id: 7,
        })
    );

    channel.disconnect();
}

#[tokio::test]
async fn ws_channel_skips_frames_it_does_not_understand() {
    let server = FakeServer::start().await;
    let channel = WsChannel::new(server.transport(), alice());
    let mut sub = channel.subscribe(&[EventKind::Connected, EventKind::Error]);
    channel.connect();
    assert_eq!(next_inbound(&mut sub).await, Inbound::Connected);
    server.wait_for_sockets(1).await;

    server.push(Push::Raw("definitely not json".to_string()));
    server.push(Push::Raw(
        json!({"v": 9, "seq": 0, "type": "error", "data": {"type": "error", "message": "future"}})
            .to_string(),
    ));
    server.push(Push::Event(json!({"type": "reaction_added", "emoji": "+1"})));
    server.push(Push::Event(json!({"type": "error", "message": "Chat not found"})));

    assert_eq!(
        next_inbound(&mut sub).await,
        Inbound::Event(ServerEvent::Error {
            message: "Chat not found".into()
        })
    );
    channel.disconnect();
}

#[tokio::test]
async fn ws_channel_reconnects_after_server_drops_it() {
    let server = FakeServer::start().await;
    let channel = WsChannel::new(server.transport(), alice());
    let mut sub = channel.subscribe(&[EventKind::Connected, EventKind::Disconnected]);
    channel.connect();
    assert_eq!(next_inbound(&mut sub).await, Inbound::Connected);
    server.wait_for_sockets(1).await;

    server.push(Push::Kick);
    assert!(matches!(
        next_inbound(&mut sub).await,
        Inbound::Disconnected { .. }
    ));
    assert_eq!(next_inbound(&mut sub).await, Inbound::Connected);
    assert_eq!(server.auth_headers().len(), 2);

    channel.disconnect();
    assert!(!channel.is_open());
}

#[tokio::test]
async fn ws_channel_reports_unreachable_server_once() {
    let transport = TransportConfig {
        ws_url: "ws://127.0.0.1:1/ws".to_string(),
        reconnect_initial: Duration::from_millis(10),
        reconnect_max: Duration::from_millis(20),
        ..TransportConfig::default()
    };
    let channel = WsChannel::new(transport, alice());
    let mut sub = channel.subscribe(EventKind::ALL);
    channel.connect();

    assert!(matches!(
        next_inbound(&mut sub).await,
        Inbound::Disconnected { .. }
    ));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(sub.try_recv(), None);
    channel.disconnect();
}

// --- REST history ---

#[tokio::test]
async fn rest_client_unwraps_success_envelopes() {
    let server = FakeServer::start().await;
    let client = RestHistoryClient::new(&server.transport()).unwrap();

    let backlog = client.fetch_backlog(&"c1".into()).await.unwrap();
    let ids: Vec<&str> = backlog.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["m1", "m2"]);

    let roster = client.fetch_roster(&"c1".into()).await.unwrap();
    assert_eq!(roster.len(), 2);
    assert_eq!(roster[1].display_name, "Bob");

    let conversations = client.fetch_conversations().await.unwrap();
    assert_eq!(conversations.len(), 1);
    assert_eq!(conversations[0].unread_count, 2);
    assert_eq!(conversations[0].title(), "Bob");
}

#[tokio::test]
async fn rest_client_maps_error_envelope() {
    let server = FakeServer::start().await;
    let client = RestHistoryClient::new(&server.transport()).unwrap();

    let err = client.fetch_backlog(&"nope".into()).await.unwrap_err();
    assert_eq!(
        err,
        FetchError::Api {
            status: 404,
            message: "Chat nope not found".into(),
            code: Some("CHAT_NOT_FOUND".into()),
        }
    );
}

#[tokio::test]
async fn rest_client_sends_reserved_characters_inside_the_id() {
    let server = FakeServer::start().await;
    let client = RestHistoryClient::new(&server.transport()).unwrap();

    // The server sees the whole id in one path segment.
    let err = client.fetch_roster(&"team/ops?x#y".into()).await.unwrap_err();
    assert_eq!(
        err,
        FetchError::Api {
            status: 404,
            message: "Chat team/ops?x#y not found".into(),
            code: Some("CHAT_NOT_FOUND".into()),
        }
    );
}

#[tokio::test]
async fn rest_client_reports_transport_failures() {
    let transport = TransportConfig {
        api_url: "http://127.0.0.1:1".to_string(),
        ..TransportConfig::default()
    };
    let client = RestHistoryClient::new(&transport).unwrap();
    let err = client.fetch_conversations().await.unwrap_err();
    assert!(matches!(err, FetchError::Transport(_)), "got {err:?}");
}

// --- Full client ---

#[tokio::test]
async fn sync_client_over_real_transports() {
    let mut server = FakeServer::start().await;
    let transport = server.transport();
    let (_session_tx, sessions) = watch::channel(Some(alice()));
    let history =
        Arc::new(RestHistoryClient::new(&transport).unwrap().with_sessions(sessions.clone()));
    let factory = Arc::new(WsChannelFactory::new(transport));
    let (handle, task) = SyncClient::spawn(SyncConfig::default(), factory, history, sessions);

    handle.activate(Some("c1".into())).await.unwrap();
    let mut views = handle.subscribe_view();

    let view = tokio::time::timeout(
        TEST_TIMEOUT,
        views.wait_for(|v| {
            v.connection == ConnectionState::Connected
                && v.status == LoadStatus::Ready
                && v.messages.len() == 2
                && v.online
                && v.joined
        }),
    )
    .await
    .expect("timed out waiting for the conversation to load")
    .unwrap()
    .clone();
    assert_eq!(view.conversation_id.as_ref().map(|c| c.as_str()), Some("c1"));
    assert_eq!(view.conversations.len(), 1);

    let join = server.expect("join_room").await;
    assert_eq!(join["chat_id"], "c1");
    let query = server.expect("check_online_status").await;
    assert_eq!(query["user_ids"], json!(["u2"]));

    handle.start_input().await.unwrap();
    let receipt = handle.send_text("  hello  ").await.unwrap();
    assert!(receipt.emitted);

    server.expect("start_typing").await;
    server.expect("stop_typing").await;
    let sent = server.expect("send_message").await;
    assert_eq!(sent["text_content"], "hello");

    let view = tokio::time::timeout(TEST_TIMEOUT, views.wait_for(|v| v.messages.len() == 3))
        .await
        .expect("timed out waiting for the echo")
        .unwrap()
        .clone();
    assert_eq!(view.messages[2].text_content.as_deref(), Some("hello"));

    handle.shutdown().await.unwrap();
    tokio::time::timeout(TEST_TIMEOUT, task)
        .await
        .expect("sync task did not stop")
        .unwrap();
}
