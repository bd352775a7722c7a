use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use shared::{
    domain::{ConversationId, MessageId, UserId},
    error::ApiError,
    protocol::{
        ConversationSummary, DirectConversationRequest, MarkReadRequest, MarkReadResponse,
        MessagePage, MessagePayload, SendMessageRequest,
    },
};
use tracing::debug;

use crate::{error::TransportError, types::PageRequest};

/// Request/response side of the chat backend. Timeouts and token refresh
/// belong to the implementation, not to the engine.
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, TransportError>;
    async fn get_messages(
        &self,
        conversation_id: &ConversationId,
        page: PageRequest,
    ) -> Result<MessagePage, TransportError>;
    async fn send_message(
        &self,
        conversation_id: &ConversationId,
        text: &str,
    ) -> Result<MessagePayload, TransportError>;
    async fn mark_read(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
    ) -> Result<(), TransportError>;
    /// Creates the one-to-one conversation with `peer_id`, or returns the
    /// existing one.
    async fn start_direct(&self, peer_id: &UserId) -> Result<ConversationSummary, TransportError>;
}

#[derive(Serialize)]
struct ListMessagesQuery<'a> {
    limit: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    before: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    after: Option<&'a str>,
}

/// `ChatApi` over the backend's REST routes under `{base}/chat/conversations/`.
pub struct HttpChatApi {
    http: Client,
    base_url: String,
    token: String,
}

impl HttpChatApi {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url, token)
    }

    pub fn with_client(http: Client, base_url: impl Into<String>, token: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            http,
            base_url,
            token: token.into(),
        }
    }

    fn conversations_url(&self) -> String {
        format!("{}/chat/conversations/", self.base_url)
    }

    fn conversation_action_url(&self, conversation_id: &ConversationId, action: &str) -> String {
        format!(
            "{}/chat/conversations/{conversation_id}/{action}/",
            self.base_url
        )
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, TransportError> {
    let status = response.status();
    if status == StatusCode::UNAUTHORIZED {
        return Err(TransportError::AuthExpired);
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(TransportError::Status(ApiError::from_body(
            status.as_u16(),
            &body,
        )));
    }
    Ok(response.json().await?)
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, TransportError> {
        let response = self
            .http
            .get(self.conversations_url())
            .bearer_auth(&self.token)
            .send()
            .await?;
        decode(response).await
    }

    async fn get_messages(
        &self,
        conversation_id: &ConversationId,
        page: PageRequest,
    ) -> Result<MessagePage, TransportError> {
        debug!(
            conversation_id = %conversation_id,
            limit = page.limit,
            before = page.before.as_deref().unwrap_or("-"),
            after = page.after.as_deref().unwrap_or("-"),
            "fetching message page"
        );
        let response = self
            .http
            .get(self.conversation_action_url(conversation_id, "messages"))
            .bearer_auth(&self.token)
            .query(&ListMessagesQuery {
                limit: page.limit,
                before: page.before.as_deref(),
                after: page.after.as_deref(),
            })
            .send()
            .await?;
        decode(response).await
    }

    async fn send_message(
        &self,
        conversation_id: &ConversationId,
        text: &str,
    ) -> Result<MessagePayload, TransportError> {
        let response = self
            .http
            .post(self.conversation_action_url(conversation_id, "send"))
            .bearer_auth(&self.token)
            .json(&SendMessageRequest {
                text: text.to_string(),
            })
            .send()
            .await?;
        decode(response).await
    }

    async fn mark_read(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
    ) -> Result<(), TransportError> {
        let response = self
            .http
            .post(self.conversation_action_url(conversation_id, "read"))
            .bearer_auth(&self.token)
            .json(&MarkReadRequest {
                message_id: message_id.clone(),
            })
            .send()
            .await?;
        let _: MarkReadResponse = decode(response).await?;
        Ok(())
    }

    async fn start_direct(&self, peer_id: &UserId) -> Result<ConversationSummary, TransportError> {
        debug!(peer_id = %peer_id, "starting direct conversation");
        let response = self
            .http
            .post(format!("{}direct/", self.conversations_url()))
            .bearer_auth(&self.token)
            .json(&DirectConversationRequest {
                peer_id: peer_id.clone(),
            })
            .send()
            .await?;
        decode(response).await
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
