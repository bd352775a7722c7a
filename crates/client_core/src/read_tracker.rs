use std::sync::Arc;

use shared::{
    domain::{ConversationId, MessageId},
    protocol::MessagePayload,
};
use tracing::{debug, warn};

use crate::{connection::ChannelHandle, store::SharedStore, transport::ChatApi};

/// Maintains unread counts and the local read marker.
///
/// Read acknowledgments are optimistic: the local count drops to zero before
/// the durable call and is not restored if that call fails.
#[derive(Clone)]
pub struct ReadTracker {
    api: Arc<dyn ChatApi>,
    store: SharedStore,
}

impl ReadTracker {
    pub fn new(api: Arc<dyn ChatApi>, store: SharedStore) -> Self {
        Self { api, store }
    }

    /// Re-derives the unread count after history was merged.
    pub async fn on_history_merged(&self, conversation_id: &ConversationId, is_active: bool) {
        let mut store = self.store.lock().await;
        if is_active {
            store.set_unread(conversation_id, 0);
        } else {
            store.recompute_unread(conversation_id);
        }
    }

    /// Acknowledges the newest inbound message of a conversation that was
    /// just opened. Returns the acknowledged id on success.
    pub async fn on_conversation_opened(
        &self,
        conversation_id: &ConversationId,
    ) -> Option<MessageId> {
        let target = {
            let mut store = self.store.lock().await;
            store.set_unread(conversation_id, 0);
            store.latest_inbound(conversation_id)
        }?;
        self.acknowledge(conversation_id, &target)
            .await
            .then_some(target.id)
    }

    pub async fn on_inbound_message(
        &self,
        message: &MessagePayload,
        is_active: bool,
        channel: Option<&ChannelHandle>,
    ) {
        let conversation_id = &message.conversation_id;
        {
            let mut store = self.store.lock().await;
            if &message.sender_id == store.self_id() {
                store.set_unread(conversation_id, 0);
                return;
            }
            if !is_active {
                if store.count_inbound(conversation_id, message) {
                    debug!(
                        conversation_id = %conversation_id,
                        unread = store.unread_count(conversation_id),
                        "counted unread message"
                    );
                }
                return;
            }
            store.set_unread(conversation_id, 0);
        }

        if let Some(channel) = channel {
            channel.send_read(&message.id).await;
        }
        self.acknowledge(conversation_id, message).await;
    }

    async fn acknowledge(&self, conversation_id: &ConversationId, message: &MessagePayload) -> bool {
        match self.api.mark_read(conversation_id, &message.id).await {
            Ok(()) => {
                let mut store = self.store.lock().await;
                store.record_read(conversation_id, message);
                store.set_unread(conversation_id, 0);
                true
            }
            Err(err) => {
                warn!(
                    conversation_id = %conversation_id,
                    message_id = %message.id,
                    error = %err,
                    "read acknowledgment failed; keeping local unread count at zero"
                );
                false
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/read_tracker_tests.rs"]
mod tests;
