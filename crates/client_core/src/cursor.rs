use std::sync::Arc;

use chrono::{DateTime, Utc};
use shared::{domain::ConversationId, protocol::MessagePayload};
use tracing::{debug, warn};

use crate::{
    error::Result,
    reconciler::MessageReconciler,
    store::{newest_first, SharedStore},
    transport::ChatApi,
    types::{Cursor, PageRequest},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOlderOutcome {
    Merged { added: usize, exhausted: bool },
    /// Cursor unset or exhausted, or a fetch for the conversation is already
    /// running.
    Skipped,
}

/// Tracks the per-conversation history cursor and drives page fetches.
#[derive(Clone)]
pub struct PaginationCursors {
    api: Arc<dyn ChatApi>,
    store: SharedStore,
    reconciler: MessageReconciler,
    page_limit: u32,
}

impl PaginationCursors {
    pub fn new(
        api: Arc<dyn ChatApi>,
        store: SharedStore,
        reconciler: MessageReconciler,
        page_limit: u32,
    ) -> Self {
        Self {
            api,
            store,
            reconciler,
            page_limit: page_limit.clamp(1, 100),
        }
    }

    /// Fetches the newest page. The first load of a conversation replaces
    /// its sequence and seeds the cursor; a loaded conversation is caught up
    /// forward instead, so nothing between its newest message and the
    /// server's newest is skipped.
    pub async fn load_latest(&self, conversation_id: &ConversationId) -> Result<usize> {
        let loaded = self
            .store
            .lock()
            .await
            .conversation(conversation_id)
            .is_some_and(|c| c.loaded);
        if loaded {
            return Ok(self.catch_up(conversation_id).await?.len());
        }

        let page = self
            .api
            .get_messages(conversation_id, PageRequest::latest(self.page_limit))
            .await
            .map_err(|err| {
                warn!(conversation_id = %conversation_id, error = %err, "failed to load latest messages");
                err
            })?;

        let added = self
            .reconciler
            .apply_page(conversation_id, page.results, true)
            .await;
        self.store
            .lock()
            .await
            .set_cursor(conversation_id, Cursor::from_next(page.next_before));
        Ok(added)
    }

    /// Pages forward from the newest stored message until the server has
    /// nothing newer. The older-history cursor is left alone. Returns the
    /// messages that were not stored before, oldest first.
    pub async fn catch_up(&self, conversation_id: &ConversationId) -> Result<Vec<MessagePayload>> {
        let mut since = self
            .store
            .lock()
            .await
            .newest_timestamp(conversation_id)
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        let mut fresh = Vec::new();

        loop {
            let page = self
                .api
                .get_messages(conversation_id, PageRequest::after(self.page_limit, since))
                .await
                .map_err(|err| {
                    warn!(conversation_id = %conversation_id, error = %err, "failed to catch up messages");
                    err
                })?;
            let full = page.results.len() >= self.page_limit as usize;
            let newest = page.results.iter().map(|m| m.created_at).max();

            {
                let store = self.store.lock().await;
                fresh.extend(
                    page.results
                        .iter()
                        .filter(|m| !store.contains_message(conversation_id, &m.id))
                        .cloned(),
                );
            }
            self.reconciler
                .apply_page(conversation_id, page.results, false)
                .await;

            match newest {
                Some(newest) if full && newest > since => since = newest,
                _ => break,
            }
        }

        fresh.sort_by(|a, b| newest_first(b, a));
        fresh.dedup_by(|a, b| a.id == b.id);
        if !fresh.is_empty() {
            debug!(conversation_id = %conversation_id, added = fresh.len(), "caught up missed messages");
        }
        Ok(fresh)
    }

    pub async fn load_older(&self, conversation_id: &ConversationId) -> Result<LoadOlderOutcome> {
        let Some(before) = self.store.lock().await.begin_older_load(conversation_id) else {
            debug!(conversation_id = %conversation_id, "no older history to load");
            return Ok(LoadOlderOutcome::Skipped);
        };

        let result = self
            .api
            .get_messages(
                conversation_id,
                PageRequest::before(self.page_limit, before),
            )
            .await;
        let page = match result {
            Ok(page) => page,
            Err(err) => {
                self.store.lock().await.finish_older_load(conversation_id);
                warn!(conversation_id = %conversation_id, error = %err, "failed to load older messages");
                return Err(err.into());
            }
        };

        let added = self
            .reconciler
            .apply_page(conversation_id, page.results, false)
            .await;

        let mut store = self.store.lock().await;
        store.set_cursor(conversation_id, Cursor::from_next(page.next_before));
        store.finish_older_load(conversation_id);
        let exhausted = store.cursor(conversation_id).is_exhausted();
        if exhausted {
            debug!(conversation_id = %conversation_id, "history exhausted");
        }
        Ok(LoadOlderOutcome::Merged { added, exhausted })
    }
}

#[cfg(test)]
#[path = "tests/cursor_tests.rs"]
mod tests;
