use std::time::Duration;

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::Uri,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use shared::{domain::MessageId, protocol::ClientFrame};
use tokio::net::TcpListener;

use super::*;
use crate::test_support::{
    message, next_remote, stamp, summary, ApiCall, FakeChatApi, FakeConnector, FakeRemote,
    PEER_ID, SELF_ID,
};

fn options() -> ClientOptions {
    ClientOptions {
        api_base_url: "http://chat.test/api".into(),
        push_base_url: "ws://chat.test/ws".into(),
        auth_token: "tok".into(),
        self_id: UserId::from(SELF_ID),
        page_limit: DEFAULT_PAGE_LIMIT,
    }
}

struct Harness {
    client: Arc<ChatClient>,
    api: Arc<FakeChatApi>,
    connector: Arc<FakeConnector>,
    remotes: mpsc::UnboundedReceiver<FakeRemote>,
    events: broadcast::Receiver<ClientEvent>,
}

fn harness() -> Harness {
    let api = FakeChatApi::new();
    let (connector, remotes) = FakeConnector::new();
    let client = ChatClient::new_with_dependencies(options(), api.clone(), connector.clone());
    let events = client.subscribe_events();
    Harness {
        client,
        api,
        connector,
        remotes,
        events,
    }
}

async fn wait_for(
    events: &mut broadcast::Receiver<ClientEvent>,
    mut predicate: impl FnMut(&ClientEvent) -> bool,
) -> ClientEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("event stream open");
            if predicate(&event) {
                return event;
            }
        }
    })
    .await
    .expect("expected event in time")
}

fn c1() -> ConversationId {
    ConversationId::from("c1")
}

fn new_message_frame(id: &str, sender: &str, seconds: i64) -> String {
    serde_json::to_string(&shared::protocol::ServerFrame::MessageNew {
        message: message(id, "c1", sender, seconds),
    })
    .expect("encode frame")
}

#[tokio::test]
async fn opening_loads_history_acknowledges_and_connects() {
    let mut h = harness();
    h.api.set_page(
        "c1",
        None,
        vec![message("m2", "c1", PEER_ID, 2), message("m1", "c1", PEER_ID, 1)],
        Some("cur-1"),
    );

    let messages = h.client.open_conversation(&c1()).await.expect("open");

    assert_eq!(messages.len(), 2);
    assert_eq!(h.api.mark_read_calls(), vec![MessageId::from("m2")]);
    let remote = next_remote(&mut h.remotes).await;
    assert_eq!(remote.url, "ws://chat.test/ws/chat/c1/?token=tok");
    wait_for(&mut h.events, |e| {
        matches!(e, ClientEvent::ChannelOpened { conversation_id } if conversation_id == &c1())
    })
    .await;
    assert_eq!(h.client.active_conversation().await, Some(c1()));
    assert_eq!(h.client.channel_state().await, Some(ConnectionState::Open));
    let conversation = h.client.conversation(&c1()).await.expect("conversation");
    assert_eq!(conversation.unread_count, 0);
    assert_eq!(
        h.client
            .read_state(&c1())
            .await
            .map(|s| s.last_read_message_id),
        Some(MessageId::from("m2"))
    );
}

#[tokio::test]
async fn push_to_viewed_conversation_is_read_immediately() {
    let mut h = harness();
    h.api
        .set_page("c1", None, vec![message("m1", "c1", PEER_ID, 1)], None);
    h.client.open_conversation(&c1()).await.expect("open");
    let mut remote = next_remote(&mut h.remotes).await;
    wait_for(&mut h.events, |e| matches!(e, ClientEvent::ChannelOpened { .. })).await;

    remote.push(&new_message_frame("m99", PEER_ID, 99));

    let event = wait_for(&mut h.events, |e| matches!(e, ClientEvent::MessageReceived { .. })).await;
    let ClientEvent::MessageReceived { message, .. } = event else {
        unreachable!()
    };
    assert_eq!(message.id, MessageId::from("m99"));

    let frame: ClientFrame =
        serde_json::from_str(&remote.next_outbound().await.expect("read frame")).expect("frame");
    assert_eq!(
        frame,
        ClientFrame::ReadUpdate {
            message_id: MessageId::from("m99")
        }
    );
    assert_eq!(
        h.api.mark_read_calls(),
        vec![MessageId::from("m1"), MessageId::from("m99")]
    );
    let conversation = h.client.conversation(&c1()).await.expect("conversation");
    assert_eq!(conversation.unread_count, 0);
    assert_eq!(
        conversation.last_message.and_then(|m| m.id),
        Some(MessageId::from("m99"))
    );
}

#[tokio::test]
async fn own_send_and_its_echo_collapse_into_one_message() {
    let mut h = harness();
    h.api
        .set_page("c1", None, vec![message("m1", "c1", PEER_ID, 1)], None);
    h.api.queue_sent(message("m2", "c1", SELF_ID, 2));
    h.client.open_conversation(&c1()).await.expect("open");
    let mut remote = next_remote(&mut h.remotes).await;
    wait_for(&mut h.events, |e| matches!(e, ClientEvent::ChannelOpened { .. })).await;

    let sent = h.client.send(&c1(), "hi").await.expect("send");
    assert!(sent.client_id.is_some());
    let frame: Value =
        serde_json::from_str(&remote.next_outbound().await.expect("send frame")).expect("json");
    assert_eq!(frame["type"], "message.send");
    assert_eq!(frame["text"], "hi");

    let mut after_echo = h.client.subscribe_events();
    remote.push(&new_message_frame("m2", SELF_ID, 2));
    wait_for(&mut after_echo, |e| {
        matches!(e, ClientEvent::ConversationUpdated(c) if c.last_message.as_ref().and_then(|m| m.id.clone()) == Some(MessageId::from("m2")))
    })
    .await;

    let messages = h.client.messages(&c1()).await;
    let ids: Vec<&str> = messages.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, ["m2", "m1"]);
    assert_eq!(h.client.conversation(&c1()).await.map(|c| c.unread_count), Some(0));
}

#[tokio::test]
async fn switching_conversations_moves_the_single_channel() {
    let mut h = harness();
    h.api
        .set_page("c1", None, vec![message("m1", "c1", PEER_ID, 1)], None);
    h.api
        .set_page("c2", None, vec![message("n1", "c2", PEER_ID, 1)], None);

    h.client.open_conversation(&c1()).await.expect("open c1");
    let mut first = next_remote(&mut h.remotes).await;
    h.client
        .open_conversation(&ConversationId::from("c2"))
        .await
        .expect("open c2");
    let second = next_remote(&mut h.remotes).await;

    assert_eq!(first.next_outbound().await, None);
    assert!(second.url.contains("/chat/c2/"));
    assert_eq!(
        h.client.active_conversation().await,
        Some(ConversationId::from("c2"))
    );
    assert_eq!(h.connector.attempts().len(), 2);

    h.client.close_conversation().await;
    assert_eq!(h.client.active_conversation().await, None);
    assert_eq!(h.client.channel_state().await, None);
}

#[tokio::test]
async fn peer_receipts_are_recorded_and_forwarded() {
    let mut h = harness();
    h.api
        .set_page("c1", None, vec![message("m5", "c1", SELF_ID, 5)], None);
    h.client.open_conversation(&c1()).await.expect("open");
    let remote = next_remote(&mut h.remotes).await;

    remote.push(r#"{"type":"read.broadcast","conversation":"c1","message_id":"m5","user_id":"456"}"#);

    wait_for(&mut h.events, |e| matches!(e, ClientEvent::ReadReceipt { .. })).await;
    assert_eq!(
        h.client
            .peer_read_state(&c1())
            .await
            .map(|s| s.last_read_message_id),
        Some(MessageId::from("m5"))
    );
}

#[tokio::test]
async fn refresh_emits_sorted_list_and_reports_failures() {
    let mut h = harness();
    h.api.set_conversations(vec![
        summary("a", None, 0),
        summary("b", Some(5), 1),
        summary("c", Some(9), 2),
    ]);

    let list = h.client.refresh_conversations().await.expect("refresh");
    let ids: Vec<&str> = list.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, ["c", "b", "a"]);
    wait_for(&mut h.events, |e| matches!(e, ClientEvent::ConversationsRefreshed(l) if l.len() == 3)).await;

    h.api.clear_conversations();
    assert!(h.client.refresh_conversations().await.is_err());
    wait_for(&mut h.events, |e| matches!(e, ClientEvent::Error(_))).await;
    assert_eq!(h.client.conversations().await.len(), 3);
    assert!(h.api.calls().iter().all(|c| c == &ApiCall::ListConversations));
}

#[tokio::test]
async fn older_history_of_viewed_conversation_stays_read() {
    let mut h = harness();
    h.api
        .set_page("c1", None, vec![message("m3", "c1", PEER_ID, 3)], Some("cur-1"));
    h.api.set_page(
        "c1",
        Some("cur-1"),
        vec![message("m2", "c1", PEER_ID, 2), message("m1", "c1", PEER_ID, 1)],
        None,
    );
    h.client.open_conversation(&c1()).await.expect("open");
    let _remote = next_remote(&mut h.remotes).await;

    let outcome = h.client.load_older(&c1()).await.expect("older");

    assert_eq!(
        outcome,
        LoadOlderOutcome::Merged {
            added: 2,
            exhausted: true
        }
    );
    assert_eq!(h.client.messages(&c1()).await.len(), 3);
    assert_eq!(h.client.conversation(&c1()).await.map(|c| c.unread_count), Some(0));
    assert_eq!(
        h.client.load_older(&c1()).await.expect("again"),
        LoadOlderOutcome::Skipped
    );
}

#[tokio::test(start_paused = true)]
async fn reconnect_pulls_messages_missed_while_down() {
    let mut h = harness();
    h.api
        .set_page("c1", None, vec![message("m1", "c1", PEER_ID, 1)], None);
    h.client.open_conversation(&c1()).await.expect("open");
    let remote = next_remote(&mut h.remotes).await;
    wait_for(&mut h.events, |e| matches!(e, ClientEvent::ChannelOpened { .. })).await;

    h.api.set_page_after(
        "c1",
        1,
        vec![message("m2", "c1", PEER_ID, 2), message("m3", "c1", SELF_ID, 3)],
    );
    drop(remote);
    wait_for(&mut h.events, |e| matches!(e, ClientEvent::ChannelClosed { .. })).await;
    let _again = next_remote(&mut h.remotes).await;

    let mut received = Vec::new();
    while received.len() < 2 {
        if let ClientEvent::MessageReceived { message, .. } =
            wait_for(&mut h.events, |e| matches!(e, ClientEvent::MessageReceived { .. })).await
        {
            received.push(message.id);
        }
    }
    assert_eq!(received, [MessageId::from("m2"), MessageId::from("m3")]);

    let ids: Vec<String> = h
        .client
        .messages(&c1())
        .await
        .iter()
        .map(|m| m.id.to_string())
        .collect();
    assert_eq!(ids, ["m3", "m2", "m1"]);
    assert!(h.api.calls().contains(&ApiCall::GetMessages {
        conversation_id: c1(),
        before: None,
        after: Some(stamp(1)),
    }));
    assert_eq!(
        h.api.mark_read_calls(),
        vec![MessageId::from("m1"), MessageId::from("m2")]
    );
    assert_eq!(h.client.conversation(&c1()).await.map(|c| c.unread_count), Some(0));

    h.client.close_conversation().await;
}

#[tokio::test]
async fn switching_away_lets_an_in_flight_acknowledgment_finish() {
    let mut h = harness();
    h.api
        .set_page("c1", None, vec![message("m1", "c1", PEER_ID, 1)], None);
    h.api
        .set_page("c2", None, vec![message("n1", "c2", SELF_ID, 1)], None);
    h.client.open_conversation(&c1()).await.expect("open c1");
    let remote = next_remote(&mut h.remotes).await;
    wait_for(&mut h.events, |e| matches!(e, ClientEvent::ChannelOpened { .. })).await;

    let gate = h.api.hold_reads();
    remote.push(&new_message_frame("m99", PEER_ID, 99));
    tokio::time::timeout(Duration::from_secs(5), async {
        while !h.api.mark_read_calls().contains(&MessageId::from("m99")) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("acknowledgment started");

    h.client
        .open_conversation(&ConversationId::from("c2"))
        .await
        .expect("open c2");
    gate.add_permits(16);

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let marker = h.client.read_state(&c1()).await.map(|s| s.last_read_message_id);
            if marker == Some(MessageId::from("m99")) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("acknowledgment of m99 completed after switching");
    assert_eq!(
        h.client.active_conversation().await,
        Some(ConversationId::from("c2"))
    );
}

#[tokio::test]
async fn starting_a_direct_chat_adds_it_to_the_list() {
    let mut h = harness();
    h.api.set_conversations(vec![summary("c1", Some(5), 0)]);
    h.client.refresh_conversations().await.expect("refresh");
    h.api.set_direct(PEER_ID, summary("c9", None, 0));

    let conversation = h
        .client
        .start_conversation(&UserId::from(PEER_ID))
        .await
        .expect("start");

    assert_eq!(conversation.id, ConversationId::from("c9"));
    wait_for(&mut h.events, |e| {
        matches!(e, ClientEvent::ConversationUpdated(c) if c.id.as_str() == "c9")
    })
    .await;
    let ids: Vec<String> = h
        .client
        .conversations()
        .await
        .iter()
        .map(|c| c.id.to_string())
        .collect();
    assert_eq!(ids, ["c1", "c9"]);
    assert!(h.api.calls().contains(&ApiCall::StartDirect {
        peer_id: UserId::from(PEER_ID)
    }));
}

#[tokio::test]
async fn starting_a_chat_with_yourself_or_an_unknown_peer_fails() {
    let mut h = harness();

    let err = h
        .client
        .start_conversation(&UserId::from(SELF_ID))
        .await
        .expect_err("self chat");
    assert!(matches!(err, error::ChatError::Validation(_)));
    assert!(h.api.calls().is_empty());

    let err = h
        .client
        .start_conversation(&UserId::from("999"))
        .await
        .expect_err("unknown peer");
    assert!(err.is_recoverable());
    wait_for(&mut h.events, |e| matches!(e, ClientEvent::Error(_))).await;
    assert!(h.client.conversations().await.is_empty());
}

#[derive(Clone)]
struct BackendState {
    reads: mpsc::UnboundedSender<String>,
    first_read: Arc<tokio::sync::Notify>,
}

async fn backend_messages(Path(id): Path<String>) -> Json<Value> {
    Json(json!({
        "results": [{"id": 42, "conversation": id, "sender": 456, "text": "hello", "created_at": "2023-11-14T22:13:20Z"}],
        "next_before": null
    }))
}

async fn backend_read(
    State(state): State<BackendState>,
    uri: Uri,
    Json(body): Json<Value>,
) -> Json<Value> {
    let _ = state.reads.send(format!("{} {}", uri.path(), body["message_id"]));
    state.first_read.notify_one();
    Json(json!({"ok": true, "last_read_message": body["message_id"]}))
}

async fn backend_socket(
    ws: WebSocketUpgrade,
    Path(id): Path<String>,
    State(state): State<BackendState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| backend_socket_session(socket, id, state))
}

async fn backend_socket_session(mut socket: WebSocket, id: String, state: BackendState) {
    // Push only once the opening acknowledgment has landed.
    state.first_read.notified().await;
    let frame = json!({
        "type": "message.new",
        "message": {"id": 44, "conversation": id, "sender": 456, "text": "are you there?", "created_at": "2023-11-14T22:14:00Z"}
    });
    if socket.send(WsMessage::Text(frame.to_string())).await.is_err() {
        return;
    }
    while let Some(Ok(msg)) = socket.recv().await {
        if let WsMessage::Text(text) = msg {
            let _ = state.reads.send(format!("ws {text}"));
        }
    }
}

#[tokio::test]
async fn syncs_against_http_and_websocket_backend() {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let (reads_tx, mut reads) = mpsc::unbounded_channel();
    let app = Router::new()
        .route("/api/chat/conversations/:id/messages/", get(backend_messages))
        .route("/api/chat/conversations/:id/read/", post(backend_read))
        .route("/ws/chat/:id/", get(backend_socket))
        .with_state(BackendState {
            reads: reads_tx,
            first_read: Arc::new(tokio::sync::Notify::new()),
        });
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    let client = ChatClient::new(ClientOptions {
        api_base_url: format!("http://{addr}/api"),
        push_base_url: format!("ws://{addr}/ws"),
        ..options()
    });
    let mut events = client.subscribe_events();
    let c7 = ConversationId::from("7");

    let messages = client.open_conversation(&c7).await.expect("open");
    assert!(messages.iter().any(|m| m.id.as_str() == "42"));

    wait_for(&mut events, |e| {
        matches!(e, ClientEvent::MessageReceived { message, .. } if message.id.as_str() == "44")
    })
    .await;

    let mut seen = Vec::new();
    while seen.len() < 3 {
        let next = tokio::time::timeout(Duration::from_secs(5), reads.recv())
            .await
            .expect("backend activity in time")
            .expect("backend alive");
        seen.push(next);
    }
    seen.sort();
    assert_eq!(
        seen,
        [
            r#"/api/chat/conversations/7/read/ "42""#.to_string(),
            r#"/api/chat/conversations/7/read/ "44""#.to_string(),
            r#"ws {"type":"read.update","messageId":"44"}"#.to_string(),
        ]
    );
    assert_eq!(client.messages(&c7).await.len(), 2);

    client.close_conversation().await;
}
