use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use shared::{
    domain::{ConversationId, MessageId, UserId},
    error::ApiError,
    protocol::{ConversationSummary, MessagePage, MessagePayload},
};
use tokio::{
    sync::{mpsc, Semaphore},
    time::Instant,
};

use crate::{
    connection::{ChannelEvent, InboundFrame, PushConnector, PushLink},
    error::{ChannelError, TransportError},
    transport::ChatApi,
    types::PageRequest,
};

pub const SELF_ID: &str = "123";
pub const PEER_ID: &str = "456";

pub fn at(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + seconds, 0)
        .single()
        .expect("timestamp")
}

/// Wire form of `at(seconds)` as sent in an `after` query.
pub fn stamp(seconds: i64) -> String {
    PageRequest::after(1, at(seconds))
        .after
        .expect("after stamp")
}

pub fn message(id: &str, conversation: &str, sender: &str, seconds: i64) -> MessagePayload {
    MessagePayload {
        id: MessageId::from(id),
        conversation_id: ConversationId::from(conversation),
        sender_id: UserId::from(sender),
        content: format!("body of {id}"),
        created_at: at(seconds),
        client_id: None,
    }
}

pub fn summary(id: &str, last_message_at: Option<i64>, unread_count: u32) -> ConversationSummary {
    ConversationSummary {
        id: ConversationId::from(id),
        last_message_at: last_message_at.map(at),
        last_message: None,
        unread_count,
        other_participant: None,
        listing_id: None,
        listing_title: None,
    }
}

pub fn ids(messages: &[MessagePayload]) -> Vec<&str> {
    messages.iter().map(|m| m.id.as_str()).collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiCall {
    ListConversations,
    GetMessages {
        conversation_id: ConversationId,
        before: Option<String>,
        after: Option<String>,
    },
    SendMessage {
        conversation_id: ConversationId,
        text: String,
    },
    MarkRead {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
    StartDirect {
        peer_id: UserId,
    },
}

type PageKey = (ConversationId, Option<String>, Option<String>);

/// Scripted in-memory backend.
#[derive(Default)]
pub struct FakeChatApi {
    calls: Mutex<Vec<ApiCall>>,
    conversations: Mutex<Option<Vec<ConversationSummary>>>,
    pages: Mutex<HashMap<PageKey, MessagePage>>,
    sent: Mutex<VecDeque<MessagePayload>>,
    directs: Mutex<HashMap<UserId, ConversationSummary>>,
    fail_reads: AtomicBool,
    read_gate: Mutex<Option<Arc<Semaphore>>>,
}

impl FakeChatApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_conversations(&self, conversations: Vec<ConversationSummary>) {
        *self.conversations.lock().expect("lock") = Some(conversations);
    }

    pub fn clear_conversations(&self) {
        *self.conversations.lock().expect("lock") = None;
    }

    pub fn set_page(
        &self,
        conversation: &str,
        before: Option<&str>,
        results: Vec<MessagePayload>,
        next: Option<&str>,
    ) {
        self.pages.lock().expect("lock").insert(
            (
                ConversationId::from(conversation),
                before.map(str::to_string),
                None,
            ),
            MessagePage {
                results,
                next_before: next.map(str::to_string),
            },
        );
    }

    /// Messages strictly newer than `at(after_seconds)`, oldest first. An
    /// unscripted `after` query answers with an empty page.
    pub fn set_page_after(&self, conversation: &str, after_seconds: i64, results: Vec<MessagePayload>) {
        let next_before = results.last().map(|m| {
            m.created_at
                .to_rfc3339_opts(chrono::SecondsFormat::AutoSi, true)
        });
        self.pages.lock().expect("lock").insert(
            (
                ConversationId::from(conversation),
                None,
                Some(stamp(after_seconds)),
            ),
            MessagePage {
                results,
                next_before,
            },
        );
    }

    pub fn remove_page(&self, conversation: &str, before: Option<&str>) {
        self.pages.lock().expect("lock").remove(&(
            ConversationId::from(conversation),
            before.map(str::to_string),
            None,
        ));
    }

    pub fn set_direct(&self, peer: &str, summary: ConversationSummary) {
        self.directs
            .lock()
            .expect("lock")
            .insert(UserId::from(peer), summary);
    }

    /// Holds every later `mark_read` call until the returned semaphore gets
    /// permits.
    pub fn hold_reads(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.read_gate.lock().expect("lock") = Some(Arc::clone(&gate));
        gate
    }

    pub fn queue_sent(&self, message: MessagePayload) {
        self.sent.lock().expect("lock").push_back(message);
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<ApiCall> {
        self.calls.lock().expect("lock").clone()
    }

    pub fn mark_read_calls(&self) -> Vec<MessageId> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                ApiCall::MarkRead { message_id, .. } => Some(message_id),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: ApiCall) {
        self.calls.lock().expect("lock").push(call);
    }
}

fn not_found(what: &str) -> TransportError {
    TransportError::Status(ApiError::new(404, format!("{what} not found")))
}

#[async_trait]
impl ChatApi for FakeChatApi {
    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, TransportError> {
        self.record(ApiCall::ListConversations);
        tokio::task::yield_now().await;
        self.conversations
            .lock()
            .expect("lock")
            .clone()
            .ok_or_else(|| not_found("conversations"))
    }

    async fn get_messages(
        &self,
        conversation_id: &ConversationId,
        page: PageRequest,
    ) -> Result<MessagePage, TransportError> {
        self.record(ApiCall::GetMessages {
            conversation_id: conversation_id.clone(),
            before: page.before.clone(),
            after: page.after.clone(),
        });
        tokio::task::yield_now().await;
        let forward = page.after.is_some();
        let scripted = self
            .pages
            .lock()
            .expect("lock")
            .get(&(conversation_id.clone(), page.before, page.after))
            .cloned();
        match scripted {
            Some(page) => Ok(page),
            None if forward => Ok(MessagePage {
                results: Vec::new(),
                next_before: None,
            }),
            None => Err(not_found("page")),
        }
    }

    async fn send_message(
        &self,
        conversation_id: &ConversationId,
        text: &str,
    ) -> Result<MessagePayload, TransportError> {
        self.record(ApiCall::SendMessage {
            conversation_id: conversation_id.clone(),
            text: text.to_string(),
        });
        tokio::task::yield_now().await;
        self.sent
            .lock()
            .expect("lock")
            .pop_front()
            .ok_or_else(|| TransportError::Status(ApiError::new(500, "send failed")))
    }

    async fn mark_read(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
    ) -> Result<(), TransportError> {
        self.record(ApiCall::MarkRead {
            conversation_id: conversation_id.clone(),
            message_id: message_id.clone(),
        });
        tokio::task::yield_now().await;
        let gate = self.read_gate.lock().expect("lock").clone();
        if let Some(gate) = gate {
            let _ = gate.acquire().await;
        }
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(TransportError::Status(ApiError::new(500, "read failed")));
        }
        Ok(())
    }

    async fn start_direct(&self, peer_id: &UserId) -> Result<ConversationSummary, TransportError> {
        self.record(ApiCall::StartDirect {
            peer_id: peer_id.clone(),
        });
        tokio::task::yield_now().await;
        self.directs
            .lock()
            .expect("lock")
            .get(peer_id)
            .cloned()
            .ok_or_else(|| not_found("peer"))
    }
}

/// Server side of one fake push connection.
pub struct FakeRemote {
    pub url: String,
    pub to_client: mpsc::UnboundedSender<InboundFrame>,
    pub from_client: mpsc::UnboundedReceiver<String>,
}

impl FakeRemote {
    pub fn push(&self, frame: &str) {
        self.to_client
            .send(InboundFrame::Text(frame.to_string()))
            .expect("client listening");
    }

    pub async fn next_outbound(&mut self) -> Option<String> {
        tokio::time::timeout(Duration::from_secs(30), self.from_client.recv())
            .await
            .expect("outbound frame in time")
    }
}

/// Connector that refuses a scripted number of attempts, then hands every
/// accepted link to the test.
pub struct FakeConnector {
    attempts: Mutex<Vec<(String, Instant)>>,
    refusals: Mutex<usize>,
    remotes: mpsc::UnboundedSender<FakeRemote>,
}

impl FakeConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<FakeRemote>) {
        let (remotes, remotes_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                attempts: Mutex::new(Vec::new()),
                refusals: Mutex::new(0),
                remotes,
            }),
            remotes_rx,
        )
    }

    pub fn refuse_next(&self, count: usize) {
        *self.refusals.lock().expect("lock") = count;
    }

    pub fn attempts(&self) -> Vec<(String, Instant)> {
        self.attempts.lock().expect("lock").clone()
    }
}

#[async_trait]
impl PushConnector for FakeConnector {
    async fn connect(&self, url: &str) -> Result<PushLink, ChannelError> {
        self.attempts
            .lock()
            .expect("lock")
            .push((url.to_string(), Instant::now()));
        {
            let mut refusals = self.refusals.lock().expect("lock");
            if *refusals > 0 {
                *refusals -= 1;
                return Err(ChannelError::Connect {
                    url: url.to_string(),
                    reason: "connection refused".to_string(),
                });
            }
        }
        let (to_client, inbound) = mpsc::unbounded_channel();
        let (outbound, from_client) = mpsc::unbounded_channel();
        let _ = self.remotes.send(FakeRemote {
            url: url.to_string(),
            to_client,
            from_client,
        });
        Ok(PushLink { outbound, inbound })
    }
}

pub async fn next_remote(remotes: &mut mpsc::UnboundedReceiver<FakeRemote>) -> FakeRemote {
    tokio::time::timeout(Duration::from_secs(30), remotes.recv())
        .await
        .expect("connection attempt in time")
        .expect("connector alive")
}

pub async fn next_channel_event(events: &mut mpsc::UnboundedReceiver<ChannelEvent>) -> ChannelEvent {
    tokio::time::timeout(Duration::from_secs(30), events.recv())
        .await
        .expect("channel event in time")
        .expect("channel alive")
}
