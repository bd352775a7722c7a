use std::sync::Arc;

use shared::{domain::ConversationId, protocol::MessagePayload};
use tracing::{debug, warn};

use crate::{
    connection::ChannelHandle,
    error::{ChatError, Result},
    store::SharedStore,
    transport::ChatApi,
};

/// Merges history pages, push events and send confirmations into the
/// per-conversation message sequences.
#[derive(Clone)]
pub struct MessageReconciler {
    api: Arc<dyn ChatApi>,
    store: SharedStore,
}

impl MessageReconciler {
    pub fn new(api: Arc<dyn ChatApi>, store: SharedStore) -> Self {
        Self { api, store }
    }

    pub async fn apply_page(
        &self,
        conversation_id: &ConversationId,
        messages: Vec<MessagePayload>,
        is_initial: bool,
    ) -> usize {
        let received = messages.len();
        let added = self
            .store
            .lock()
            .await
            .apply_page(conversation_id, messages, is_initial);
        debug!(
            conversation_id = %conversation_id,
            received,
            added,
            is_initial,
            "merged message page"
        );
        added
    }

    /// Returns false when a message with the same id is already stored.
    pub async fn apply_push(&self, message: MessagePayload) -> bool {
        let message_id = message.id.clone();
        let inserted = self.store.lock().await.insert_message(message);
        if !inserted {
            debug!(message_id = %message_id, "ignoring duplicate push message");
        }
        inserted
    }

    /// Sends over the live channel as a low-latency hint, then confirms over
    /// the durable call. Only the confirmed message is stored; a push echo
    /// carrying the same id collapses into it.
    pub async fn send(
        &self,
        conversation_id: &ConversationId,
        content: &str,
        channel: Option<&ChannelHandle>,
    ) -> Result<MessagePayload> {
        let text = content.trim();
        if text.is_empty() {
            return Err(ChatError::Validation(
                "message text cannot be empty".to_string(),
            ));
        }

        let client_id = match channel {
            Some(channel) => channel.send_text(text).await,
            None => None,
        };

        let mut message = self
            .api
            .send_message(conversation_id, text)
            .await
            .map_err(|err| {
                warn!(conversation_id = %conversation_id, error = %err, "send failed");
                err
            })?;
        message.client_id = client_id;

        let mut store = self.store.lock().await;
        if !store.insert_message(message.clone()) {
            debug!(message_id = %message.id, "send confirmation already delivered by push");
        }
        store.set_unread(&message.conversation_id, 0);
        if &message.conversation_id != conversation_id {
            store.set_unread(conversation_id, 0);
        }
        Ok(message)
    }
}

#[cfg(test)]
#[path = "tests/reconciler_tests.rs"]
mod tests;
