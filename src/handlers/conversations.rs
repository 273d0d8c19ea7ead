use crate::{
    conversation::state::ReplyEvent,
    error::{AppError, AppResult},
    state::AppState,
};
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

/// A message row as the response generator posts it.
#[derive(Debug, Deserialize)]
pub struct ReplyPayload {
    /// String or numeric message id
    pub id: serde_json::Value,
    pub role: String,
    #[serde(default)]
    pub text: Option<String>,
}

impl ReplyPayload {
    fn reply_id(&self) -> Option<String> {
        match &self.id {
            serde_json::Value::String(id) if !id.is_empty() => Some(id.clone()),
            serde_json::Value::Number(id) => Some(id.to_string()),
            _ => None,
        }
    }
}

pub async fn list_conversations(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let conversations = state.conversations.summaries();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "count": conversations.len(),
        "conversations": conversations
    })))
}

pub async fn close_conversation(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let conversation_id = path.into_inner();
    state.conversations.close(&conversation_id)?;
    info!(%conversation_id, "Conversation force-closed over HTTP");

    Ok(HttpResponse::Ok().json(json!({
        "status": "closed",
        "conversation_id": conversation_id,
        "timestamp": chrono::Utc::now().to_rfc3339()
    })))
}

/// Webhook from the response generator: a new message was written to the
/// conversation. Only assistant messages are replies; everything else is
/// acknowledged and dropped.
pub async fn deliver_reply(
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<ReplyPayload>,
) -> AppResult<HttpResponse> {
    let conversation_id = path.into_inner();
    let payload = body.into_inner();

    let reply_id = payload
        .reply_id()
        .ok_or_else(|| AppError::BadRequest("reply id must be a non-empty string or number".to_string()))?;

    let text = payload.text.unwrap_or_default();
    if payload.role != "assistant" || text.trim().is_empty() {
        debug!(%conversation_id, role = %payload.role, "Ignoring non-reply message");
        return Ok(HttpResponse::Accepted().json(json!({
            "status": "ignored",
            "delivered": 0
        })));
    }

    let delivered = state
        .reply_hub
        .publish(&conversation_id, ReplyEvent::new(reply_id.clone(), text));
    debug!(%conversation_id, %reply_id, delivered, "Reply delivered");

    Ok(HttpResponse::Accepted().json(json!({
        "status": "accepted",
        "reply_id": reply_id,
        "delivered": delivered
    })))
}

pub async fn microphone_status(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let lease = state.arbitrator.current_lease();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "held": lease.is_some(),
        "holder": lease.as_ref().map(|l| l.owner()),
        "lease": lease
    })))
}
