use std::sync::{Arc, Weak};

use shared::{
    domain::{ConversationId, UserId},
    protocol::{MessagePayload, ReadReceipt},
};
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info};

pub mod connection;
pub mod conversations;
pub mod cursor;
pub mod error;
pub mod reconciler;
pub mod read_tracker;
pub mod store;
pub mod transport;
pub mod types;

use connection::{
    ChannelEvent, ChannelHandle, ConnectionManager, ConnectionState, PushConnector,
    WebSocketConnector,
};
use conversations::ConversationList;
use cursor::{LoadOlderOutcome, PaginationCursors};
use error::{ChatError, Result};
use read_tracker::ReadTracker;
use reconciler::MessageReconciler;
use store::{ChatStore, SharedStore};
use transport::{ChatApi, HttpChatApi};
use types::{Conversation, ReadState};

pub const DEFAULT_PAGE_LIMIT: u32 = 50;

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub api_base_url: String,
    pub push_base_url: String,
    pub auth_token: String,
    pub self_id: UserId,
    pub page_limit: u32,
}

#[derive(Debug, Clone)]
pub enum ClientEvent {
    ConversationsRefreshed(Vec<Conversation>),
    ConversationUpdated(Conversation),
    MessageReceived {
        conversation_id: ConversationId,
        message: MessagePayload,
    },
    MessageSent {
        conversation_id: ConversationId,
        message: MessagePayload,
    },
    ReadReceipt {
        conversation_id: ConversationId,
        receipt: ReadReceipt,
    },
    ChannelOpened {
        conversation_id: ConversationId,
    },
    ChannelClosed {
        conversation_id: ConversationId,
        code: Option<u16>,
    },
    Error(String),
}

struct ActiveConversation {
    conversation_id: ConversationId,
    channel: ChannelHandle,
    pump: JoinHandle<()>,
}

impl ActiveConversation {
    /// Detaches the event pump. Its sender goes away with the channel task,
    /// so the pump finishes the events already queued (including an
    /// acknowledgment in flight) and then stops.
    fn release(self) {
        if !self.pump.is_finished() {
            debug!(conversation_id = %self.conversation_id, "draining previous channel events");
        }
    }
}

/// Chat synchronization engine: one conversation list, one live push
/// channel for the conversation being viewed, and the reconciled history of
/// every conversation loaded this session.
pub struct ChatClient {
    store: SharedStore,
    connections: ConnectionManager,
    conversations: ConversationList,
    cursors: PaginationCursors,
    reconciler: MessageReconciler,
    read_tracker: ReadTracker,
    active: Mutex<Option<ActiveConversation>>,
    events: broadcast::Sender<ClientEvent>,
}

impl ChatClient {
    pub fn new(options: ClientOptions) -> Arc<Self> {
        let api = Arc::new(HttpChatApi::new(
            options.api_base_url.clone(),
            options.auth_token.clone(),
        ));
        Self::new_with_dependencies(options, api, Arc::new(WebSocketConnector))
    }

    pub fn new_with_dependencies(
        options: ClientOptions,
        api: Arc<dyn ChatApi>,
        connector: Arc<dyn PushConnector>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        let store = ChatStore::shared(options.self_id);
        let reconciler = MessageReconciler::new(Arc::clone(&api), Arc::clone(&store));
        Arc::new(Self {
            connections: ConnectionManager::new(
                connector,
                options.push_base_url,
                options.auth_token,
            ),
            conversations: ConversationList::new(Arc::clone(&api), Arc::clone(&store)),
            cursors: PaginationCursors::new(
                Arc::clone(&api),
                Arc::clone(&store),
                reconciler.clone(),
                options.page_limit,
            ),
            read_tracker: ReadTracker::new(api, Arc::clone(&store)),
            reconciler,
            store,
            active: Mutex::new(None),
            events,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    fn emit_error(&self, err: &error::ChatError) {
        let _ = self.events.send(ClientEvent::Error(err.to_string()));
    }

    async fn emit_conversation_updated(&self, conversation_id: &ConversationId) {
        let snapshot = self.store.lock().await.conversation(conversation_id).cloned();
        if let Some(conversation) = snapshot {
            let _ = self
                .events
                .send(ClientEvent::ConversationUpdated(conversation));
        }
    }

    pub async fn refresh_conversations(&self) -> Result<Vec<Conversation>> {
        match self.conversations.refresh().await {
            Ok(list) => {
                let _ = self
                    .events
                    .send(ClientEvent::ConversationsRefreshed(list.clone()));
                Ok(list)
            }
            Err(err) => {
                self.emit_error(&err);
                Err(err)
            }
        }
    }

    pub async fn conversations(&self) -> Vec<Conversation> {
        self.store.lock().await.conversations()
    }

    pub async fn conversation(&self, conversation_id: &ConversationId) -> Option<Conversation> {
        self.store.lock().await.conversation(conversation_id).cloned()
    }

    pub async fn messages(&self, conversation_id: &ConversationId) -> Vec<MessagePayload> {
        self.store.lock().await.messages(conversation_id).to_vec()
    }

    pub async fn read_state(&self, conversation_id: &ConversationId) -> Option<ReadState> {
        self.store.lock().await.read_state(conversation_id).cloned()
    }

    pub async fn peer_read_state(&self, conversation_id: &ConversationId) -> Option<ReadState> {
        self.store
            .lock()
            .await
            .peer_read_state(conversation_id)
            .cloned()
    }

    pub async fn active_conversation(&self) -> Option<ConversationId> {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|active| active.conversation_id.clone())
    }

    pub async fn channel_state(&self) -> Option<ConnectionState> {
        let channel = self.connections.active().await?;
        Some(channel.state().await)
    }

    async fn active_channel_for(&self, conversation_id: &ConversationId) -> Option<ChannelHandle> {
        self.active
            .lock()
            .await
            .as_ref()
            .filter(|active| &active.conversation_id == conversation_id)
            .map(|active| active.channel.clone())
    }

    /// Makes `conversation_id` the viewed conversation: switches the push
    /// channel, loads the newest history page and acknowledges it as read.
    /// A failed history load leaves the channel open and local state as it
    /// was.
    pub async fn open_conversation(
        self: &Arc<Self>,
        conversation_id: &ConversationId,
    ) -> Result<Vec<MessagePayload>> {
        {
            let mut active = self.active.lock().await;
            if let Some(previous) = active.take() {
                previous.release();
            }
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            let channel = self
                .connections
                .open(conversation_id.clone(), events_tx)
                .await;
            let pump = self.spawn_channel_pump(events_rx);
            *active = Some(ActiveConversation {
                conversation_id: conversation_id.clone(),
                channel,
                pump,
            });
        }
        info!(conversation_id = %conversation_id, "opened conversation");

        if let Err(err) = self.cursors.load_latest(conversation_id).await {
            self.emit_error(&err);
            return Err(err);
        }
        self.read_tracker
            .on_history_merged(conversation_id, false)
            .await;
        self.read_tracker
            .on_conversation_opened(conversation_id)
            .await;
        self.emit_conversation_updated(conversation_id).await;
        Ok(self.messages(conversation_id).await)
    }

    /// Leaves the viewed conversation and tears its push channel down.
    pub async fn close_conversation(&self) {
        let Some(active) = self.active.lock().await.take() else {
            return;
        };
        self.connections.close(&active.channel).await;
        info!(conversation_id = %active.conversation_id, "closed conversation");
        active.release();
    }

    /// Starts (or finds) the one-to-one conversation with `peer_id` and adds
    /// it to the conversation list. Call `open_conversation` to view it.
    pub async fn start_conversation(&self, peer_id: &UserId) -> Result<Conversation> {
        if peer_id == self.store.lock().await.self_id() {
            let err = ChatError::Validation("cannot start a chat with yourself".to_string());
            self.emit_error(&err);
            return Err(err);
        }
        let conversation = match self.conversations.start_direct(peer_id).await {
            Ok(conversation) => conversation,
            Err(err) => {
                self.emit_error(&err);
                return Err(err);
            }
        };
        let _ = self
            .events
            .send(ClientEvent::ConversationUpdated(conversation.clone()));
        Ok(conversation)
    }

    pub async fn load_older(&self, conversation_id: &ConversationId) -> Result<LoadOlderOutcome> {
        let outcome = match self.cursors.load_older(conversation_id).await {
            Ok(outcome) => outcome,
            Err(err) => {
                self.emit_error(&err);
                return Err(err);
            }
        };
        if let LoadOlderOutcome::Merged { .. } = outcome {
            let is_active = self.active_channel_for(conversation_id).await.is_some();
            self.read_tracker
                .on_history_merged(conversation_id, is_active)
                .await;
            self.emit_conversation_updated(conversation_id).await;
        }
        Ok(outcome)
    }

    pub async fn send(
        &self,
        conversation_id: &ConversationId,
        content: &str,
    ) -> Result<MessagePayload> {
        let channel = self.active_channel_for(conversation_id).await;
        let message = match self
            .reconciler
            .send(conversation_id, content, channel.as_ref())
            .await
        {
            Ok(message) => message,
            Err(err) => {
                self.emit_error(&err);
                return Err(err);
            }
        };
        let _ = self.events.send(ClientEvent::MessageSent {
            conversation_id: conversation_id.clone(),
            message: message.clone(),
        });
        self.emit_conversation_updated(conversation_id).await;
        Ok(message)
    }

    fn spawn_channel_pump(
        self: &Arc<Self>,
        mut events_rx: mpsc::UnboundedReceiver<ChannelEvent>,
    ) -> JoinHandle<()> {
        let client: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                let Some(client) = client.upgrade() else {
                    break;
                };
                client.handle_channel_event(event).await;
            }
        })
    }

    async fn handle_channel_event(&self, event: ChannelEvent) {
        match event {
            ChannelEvent::Opened {
                conversation_id,
                reconnected,
            } => {
                let _ = self.events.send(ClientEvent::ChannelOpened {
                    conversation_id: conversation_id.clone(),
                });
                if reconnected {
                    self.resync(&conversation_id).await;
                }
            }
            ChannelEvent::Closed {
                conversation_id,
                code,
            } => {
                let _ = self.events.send(ClientEvent::ChannelClosed {
                    conversation_id,
                    code,
                });
            }
            ChannelEvent::Message { message, .. } => self.on_push_message(message).await,
            ChannelEvent::Read {
                conversation_id,
                receipt,
            } => {
                let recorded = self
                    .store
                    .lock()
                    .await
                    .record_peer_read(&conversation_id, &receipt);
                debug!(conversation_id = %conversation_id, recorded, "peer read receipt");
                let _ = self.events.send(ClientEvent::ReadReceipt {
                    conversation_id,
                    receipt,
                });
            }
        }
    }

    /// Pulls whatever was posted while the channel was down, surfaces it as
    /// received and acknowledges it when the conversation is being viewed.
    async fn resync(&self, conversation_id: &ConversationId) {
        let loaded = self
            .store
            .lock()
            .await
            .conversation(conversation_id)
            .is_some_and(|c| c.loaded);
        let fresh = if loaded {
            self.cursors.catch_up(conversation_id).await
        } else {
            self.cursors.load_latest(conversation_id).await.map(|_| Vec::new())
        };
        let fresh = match fresh {
            Ok(fresh) => fresh,
            Err(err) => {
                self.emit_error(&err);
                return;
            }
        };

        let is_active = self.active_channel_for(conversation_id).await.is_some();
        let missed_inbound = {
            let store = self.store.lock().await;
            fresh.iter().any(|m| &m.sender_id != store.self_id())
        };
        self.read_tracker
            .on_history_merged(conversation_id, is_active)
            .await;
        if is_active && (!loaded || missed_inbound) {
            self.read_tracker
                .on_conversation_opened(conversation_id)
                .await;
        }
        for message in fresh {
            let _ = self.events.send(ClientEvent::MessageReceived {
                conversation_id: conversation_id.clone(),
                message,
            });
        }
        self.emit_conversation_updated(conversation_id).await;
    }

    async fn on_push_message(&self, message: MessagePayload) {
        let conversation_id = message.conversation_id.clone();
        let inserted = self.reconciler.apply_push(message.clone()).await;
        let is_own = &message.sender_id == self.store.lock().await.self_id();
        if inserted || is_own {
            let channel = self.active_channel_for(&conversation_id).await;
            self.read_tracker
                .on_inbound_message(&message, channel.is_some(), channel.as_ref())
                .await;
        }
        if inserted {
            let _ = self.events.send(ClientEvent::MessageReceived {
                conversation_id: conversation_id.clone(),
                message,
            });
        }
        self.emit_conversation_updated(&conversation_id).await;
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
