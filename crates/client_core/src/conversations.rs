use std::sync::Arc;

use shared::domain::UserId;
use tracing::{info, warn};

use crate::{error::Result, store::SharedStore, transport::ChatApi, types::Conversation};

/// Orders conversations by most recent activity. Conversations without any
/// timestamp keep their relative order at the end.
pub fn sort_by_activity(conversations: &mut [Conversation]) {
    conversations.sort_by(|a, b| b.activity_at().cmp(&a.activity_at()));
}

/// Fetches the conversation list and seeds the store from it.
#[derive(Clone)]
pub struct ConversationList {
    api: Arc<dyn ChatApi>,
    store: SharedStore,
}

impl ConversationList {
    pub fn new(api: Arc<dyn ChatApi>, store: SharedStore) -> Self {
        Self { api, store }
    }

    /// Replaces the local conversation set. On failure the previous set is
    /// left untouched.
    pub async fn refresh(&self) -> Result<Vec<Conversation>> {
        let summaries = self.api.list_conversations().await.map_err(|err| {
            warn!(error = %err, "conversation list refresh failed; keeping previous list");
            err
        })?;
        let mut store = self.store.lock().await;
        store.replace_conversations(summaries);
        let conversations = store.conversations();
        info!(count = conversations.len(), "conversation list refreshed");
        Ok(conversations)
    }

    /// Creates or finds the direct conversation with `peer_id` and merges it
    /// into the local set without dropping anything else.
    pub async fn start_direct(&self, peer_id: &UserId) -> Result<Conversation> {
        let summary = self.api.start_direct(peer_id).await.map_err(|err| {
            warn!(peer_id = %peer_id, error = %err, "failed to start direct conversation");
            err
        })?;
        let conversation = self.store.lock().await.upsert_conversation(summary);
        info!(conversation_id = %conversation.id, peer_id = %peer_id, "direct conversation ready");
        Ok(conversation)
    }
}

#[cfg(test)]
#[path = "tests/conversations_tests.rs"]
mod tests;
