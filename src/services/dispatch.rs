//! HTTP dispatch client: hands the user's text to the response generator.
//!
//! Fire-and-forget. A 2xx only means the message was accepted; the generated
//! reply arrives later through the completion watcher. The correlation id is sent
//! as `client_msg_id` so the generator can drop retried duplicates.

use crate::conversation::collaborators::{DispatchRequest, Dispatcher};
use crate::error::TurnError;
use crate::services::{authorize, describe_failure};
use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

pub struct HttpDispatcher {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl HttpDispatcher {
    pub fn new(client: reqwest::Client, url: String, api_key: Option<String>) -> Self {
        Self { client, url, api_key }
    }
}

#[async_trait]
impl Dispatcher for HttpDispatcher {
    async fn dispatch(&self, request: DispatchRequest) -> Result<(), TurnError> {
        let body = json!({
            "chat_id": request.conversation_id,
            "text": request.text,
            "client_msg_id": request.correlation_id.to_string(),
            "mode": request.mode.as_str(),
            "sessionId": request.session_token.to_string(),
        });

        let response = authorize(self.client.post(&self.url), self.api_key.as_deref())
            .json(&body)
            .send()
            .await
            .map_err(|e| TurnError::Dispatch(e.to_string()))?;

        if !response.status().is_success() {
            return Err(TurnError::Dispatch(describe_failure(response).await));
        }

        debug!(
            conversation_id = %request.conversation_id,
            correlation_id = %request.correlation_id,
            "Message dispatched"
        );
        Ok(())
    }
}
