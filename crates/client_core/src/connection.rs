use std::{
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use shared::{
    domain::{ClientId, ConversationId, MessageId},
    protocol::{describe_close_code, ClientFrame, MessagePayload, ReadReceipt, ServerFrame},
};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::error::ChannelError;

const RECONNECT_STEP_MS: u64 = 1_000;
const RECONNECT_MAX_MS: u64 = 8_000;

/// Delay before reconnect attempt `retry_count + 1`: grows by one second
/// per consecutive failure and is capped at eight seconds.
pub fn reconnect_delay(retry_count: u32) -> Duration {
    let millis = RECONNECT_STEP_MS.saturating_mul(u64::from(retry_count) + 1);
    Duration::from_millis(millis.min(RECONNECT_MAX_MS))
}

/// `{base}/chat/{conversation_id}/?token={token}`
pub fn push_channel_url(base_url: &str, conversation_id: &ConversationId, token: &str) -> String {
    let token: String = url::form_urlencoded::byte_serialize(token.as_bytes()).collect();
    format!(
        "{}/chat/{conversation_id}/?token={token}",
        base_url.trim_end_matches('/')
    )
}

fn redact_token(url: &str) -> String {
    match url.split_once("?token=") {
        Some((head, _)) => format!("{head}?token=<redacted>"),
        None => url.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closing,
    /// Torn down intentionally; no further reconnects.
    Closed,
    /// Link lost; waiting out the backoff before the next connect.
    Reconnecting,
}

/// Notifications from a live channel to whoever opened it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// `reconnected` is set when the channel had been open before, so
    /// messages may have been missed while it was down.
    Opened {
        conversation_id: ConversationId,
        reconnected: bool,
    },
    Message {
        conversation_id: ConversationId,
        message: MessagePayload,
    },
    Read {
        conversation_id: ConversationId,
        receipt: ReadReceipt,
    },
    Closed {
        conversation_id: ConversationId,
        code: Option<u16>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Text(String),
    Closed(Option<u16>),
}

/// One physical push connection. Dropping `outbound` closes it.
#[derive(Debug)]
pub struct PushLink {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<InboundFrame>,
}

#[async_trait]
pub trait PushConnector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<PushLink, ChannelError>;
}

/// `PushConnector` over a tungstenite WebSocket.
pub struct WebSocketConnector;

#[async_trait]
impl PushConnector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<PushLink, ChannelError> {
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|err| ChannelError::Connect {
                url: redact_token(url),
                reason: err.to_string(),
            })?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if let Err(err) = ws_writer.send(Message::Text(text)).await {
                    warn!("push channel send failed: {err}");
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        tokio::spawn(async move {
            let mut close_code = None;
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if inbound_tx.send(InboundFrame::Text(text)).is_err() {
                            return;
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        close_code = frame.map(|frame| u16::from(frame.code));
                        break;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!("push channel receive failed: {err}");
                        break;
                    }
                }
            }
            let _ = inbound_tx.send(InboundFrame::Closed(close_code));
        });

        Ok(PushLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

struct LinkSlot {
    state: ConnectionState,
    outbound: Option<mpsc::UnboundedSender<String>>,
}

struct ChannelShared {
    conversation_id: ConversationId,
    link: Mutex<LinkSlot>,
    intentionally_closed: AtomicBool,
    retry_count: AtomicU32,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ChannelShared {
    fn is_closed(&self) -> bool {
        self.intentionally_closed.load(Ordering::SeqCst)
    }

    async fn set_state(&self, state: ConnectionState) {
        let mut link = self.link.lock().await;
        if !self.is_closed() {
            link.state = state;
        }
    }

    /// Installs a freshly connected link unless the channel was closed
    /// while connecting.
    async fn mark_open(&self, outbound: mpsc::UnboundedSender<String>) -> bool {
        let mut link = self.link.lock().await;
        if self.is_closed() {
            return false;
        }
        link.state = ConnectionState::Open;
        link.outbound = Some(outbound);
        self.retry_count.store(0, Ordering::SeqCst);
        true
    }

    /// Drops the lost link. Only `shutdown` moves the state to `Closed`.
    async fn clear_link(&self) {
        let mut link = self.link.lock().await;
        link.outbound = None;
        if !self.is_closed() {
            link.state = ConnectionState::Reconnecting;
        }
    }

    fn emit(&self, events: &mpsc::UnboundedSender<ChannelEvent>, event: ChannelEvent) {
        if !self.is_closed() {
            let _ = events.send(event);
        }
    }
}

/// Handle to the connection bound to one conversation.
#[derive(Clone)]
pub struct ChannelHandle {
    shared: Arc<ChannelShared>,
}

impl ChannelHandle {
    fn spawn(
        connector: Arc<dyn PushConnector>,
        url: String,
        conversation_id: ConversationId,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> Self {
        let shared = Arc::new(ChannelShared {
            conversation_id,
            link: Mutex::new(LinkSlot {
                state: ConnectionState::Idle,
                outbound: None,
            }),
            intentionally_closed: AtomicBool::new(false),
            retry_count: AtomicU32::new(0),
            task: Mutex::new(None),
        });
        let task = tokio::spawn(run_channel(Arc::clone(&shared), connector, url, events));
        if let Ok(mut slot) = shared.task.try_lock() {
            *slot = Some(task);
        }
        Self { shared }
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.shared.conversation_id
    }

    pub async fn state(&self) -> ConnectionState {
        self.shared.link.lock().await.state
    }

    pub fn retry_count(&self) -> u32 {
        self.shared.retry_count.load(Ordering::SeqCst)
    }

    pub fn same_channel(&self, other: &ChannelHandle) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Sends `message.send`. Returns the correlation id, or `None` when the
    /// channel is not open and the frame was dropped.
    pub async fn send_text(&self, content: &str) -> Option<ClientId> {
        let client_id = ClientId::generate();
        let frame = ClientFrame::MessageSend {
            client_id: client_id.clone(),
            text: content.to_string(),
        };
        self.send_frame(&frame).await.then_some(client_id)
    }

    /// Sends `read.update`. Dropped when the channel is not open.
    pub async fn send_read(&self, message_id: &MessageId) -> bool {
        self.send_frame(&ClientFrame::ReadUpdate {
            message_id: message_id.clone(),
        })
        .await
    }

    async fn send_frame(&self, frame: &ClientFrame) -> bool {
        let link = self.shared.link.lock().await;
        let (ConnectionState::Open, Some(outbound)) = (link.state, link.outbound.as_ref()) else {
            debug!(
                conversation_id = %self.shared.conversation_id,
                state = ?link.state,
                "push channel not open; dropping outbound frame"
            );
            return false;
        };
        match serde_json::to_string(frame) {
            Ok(text) => outbound.send(text).is_ok(),
            Err(err) => {
                warn!("failed to encode outbound frame: {err}");
                false
            }
        }
    }

    /// Stops the channel task without waiting on any lock.
    fn abandon(&self) {
        self.shared
            .intentionally_closed
            .store(true, Ordering::SeqCst);
        if let Ok(mut task) = self.shared.task.try_lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
    }

    /// Tears the channel down for good and cancels any pending reconnect.
    async fn shutdown(&self) {
        self.shared
            .intentionally_closed
            .store(true, Ordering::SeqCst);
        {
            let mut link = self.shared.link.lock().await;
            link.state = ConnectionState::Closing;
            link.outbound = None;
        }
        if let Some(task) = self.shared.task.lock().await.take() {
            task.abort();
        }
        self.shared.link.lock().await.state = ConnectionState::Closed;
        info!(conversation_id = %self.shared.conversation_id, "push channel closed");
    }
}

async fn run_channel(
    shared: Arc<ChannelShared>,
    connector: Arc<dyn PushConnector>,
    url: String,
    events: mpsc::UnboundedSender<ChannelEvent>,
) {
    let conversation_id = shared.conversation_id.clone();
    let mut opened_before = false;
    while !shared.is_closed() {
        shared.set_state(ConnectionState::Connecting).await;
        match connector.connect(&url).await {
            Ok(PushLink {
                outbound,
                mut inbound,
            }) => {
                if !shared.mark_open(outbound).await {
                    break;
                }
                info!(conversation_id = %conversation_id, reconnected = opened_before, "push channel open");
                shared.emit(
                    &events,
                    ChannelEvent::Opened {
                        conversation_id: conversation_id.clone(),
                        reconnected: opened_before,
                    },
                );
                opened_before = true;

                let code = pump_frames(&shared, &mut inbound, &events).await;
                shared.clear_link().await;
                if shared.is_closed() {
                    break;
                }
                warn!(
                    conversation_id = %conversation_id,
                    code = ?code,
                    reason = code.map_or("connection lost", describe_close_code),
                    error = %ChannelError::Closed,
                    "reconnecting"
                );
                shared.emit(
                    &events,
                    ChannelEvent::Closed {
                        conversation_id: conversation_id.clone(),
                        code,
                    },
                );
            }
            Err(err) => {
                if shared.is_closed() {
                    break;
                }
                warn!(conversation_id = %conversation_id, error = %err, "push channel connect failed");
                shared.emit(
                    &events,
                    ChannelEvent::Closed {
                        conversation_id: conversation_id.clone(),
                        code: None,
                    },
                );
            }
        }

        if shared.is_closed() {
            break;
        }
        let retry_count = shared.retry_count.load(Ordering::SeqCst);
        let delay = reconnect_delay(retry_count);
        shared.set_state(ConnectionState::Reconnecting).await;
        info!(
            conversation_id = %conversation_id,
            retry_count,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "scheduling push channel reconnect"
        );
        tokio::time::sleep(delay).await;
        shared.retry_count.fetch_add(1, Ordering::SeqCst);
    }
    shared.link.lock().await.state = ConnectionState::Closed;
}

/// Dispatches frames until the link closes; returns the close code if any.
async fn pump_frames(
    shared: &ChannelShared,
    inbound: &mut mpsc::UnboundedReceiver<InboundFrame>,
    events: &mpsc::UnboundedSender<ChannelEvent>,
) -> Option<u16> {
    while let Some(frame) = inbound.recv().await {
        let text = match frame {
            InboundFrame::Text(text) => text,
            InboundFrame::Closed(code) => return code,
        };
        match serde_json::from_str::<ServerFrame>(&text) {
            Ok(ServerFrame::MessageNew { message }) => shared.emit(
                events,
                ChannelEvent::Message {
                    conversation_id: shared.conversation_id.clone(),
                    message,
                },
            ),
            Ok(ServerFrame::ReadBroadcast(receipt)) => shared.emit(
                events,
                ChannelEvent::Read {
                    conversation_id: shared.conversation_id.clone(),
                    receipt,
                },
            ),
            Err(err) => {
                warn!(
                    conversation_id = %shared.conversation_id,
                    error = %ChannelError::MalformedFrame(err),
                    "dropping push frame"
                );
            }
        }
    }
    None
}

/// Owns the single live push connection of the engine.
pub struct ConnectionManager {
    connector: Arc<dyn PushConnector>,
    base_url: String,
    token: String,
    active: Mutex<Option<ChannelHandle>>,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn PushConnector>,
        base_url: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            connector,
            base_url: base_url.into(),
            token: token.into(),
            active: Mutex::new(None),
        }
    }

    /// Opens a connection bound to `conversation_id`. Any previously open
    /// connection is closed first, including its pending reconnect.
    pub async fn open(
        &self,
        conversation_id: ConversationId,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> ChannelHandle {
        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            previous.shutdown().await;
        }
        let url = push_channel_url(&self.base_url, &conversation_id, &self.token);
        debug!(url = %redact_token(&url), "opening push channel");
        let handle = ChannelHandle::spawn(Arc::clone(&self.connector), url, conversation_id, events);
        *active = Some(handle.clone());
        handle
    }

    pub async fn close(&self, handle: &ChannelHandle) {
        handle.shutdown().await;
        let mut active = self.active.lock().await;
        if active
            .as_ref()
            .is_some_and(|current| current.same_channel(handle))
        {
            *active = None;
        }
    }

    pub async fn active(&self) -> Option<ChannelHandle> {
        self.active.lock().await.clone()
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(handle) = self.active.get_mut().take() {
            handle.abandon();
        }
    }
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
