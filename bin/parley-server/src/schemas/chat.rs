use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use validator::Validate;

use crate::entities::{Chat, ChatMessage, Role, format_ts};
use crate::services::turn::TurnResult;

/// Request body for `POST /chats`.
#[derive(Debug, Clone, Deserialize, ToSchema, Validate)]
pub struct CreateChatRequest {
    #[validate(length(min = 1, message = "user_id must not be empty"))]
    pub user_id: String,
    /// Catalog name of the model, e.g. `"llama3.1:latest"`.
    #[validate(length(min = 1, message = "model_id must not be empty"))]
    pub model_id: String,
    #[validate(length(max = 200))]
    pub title: Option<String>,
    /// First user message of the chat.
    pub initial_message: String,
}

/// Request body for `POST /chats/{id}/messages`.
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct SendMessageRequest {
    pub message: String,
    /// Use another catalog model for this turn only.
    pub model: Option<String>,
    /// Stream the reply as server-sent events.  Defaults to the server setting.
    pub stream: Option<bool>,
}

#[derive(Debug, Deserialize, IntoParams, ToSchema)]
#[into_params(parameter_in = Query)]
pub struct ListChatsQuery {
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ChatResponse {
    pub id: String,
    pub user_id: String,
    pub model_id: String,
    pub title: String,
    pub message_count: i64,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct MessageResponse {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub created_at: String,
}

/// Result of a completed, non-streamed turn.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TurnResponse {
    pub chat: ChatResponse,
    pub user_message: MessageResponse,
    /// The stored assistant reply.
    pub response: MessageResponse,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ChatDetailResponse {
    pub chat: ChatResponse,
    pub messages: Vec<MessageResponse>,
}

impl Chat {
    pub fn to_response(&self) -> ChatResponse {
        ChatResponse {
            id: self.id.clone(),
            user_id: self.user_id.clone(),
            model_id: self.model_name.clone(),
            title: self.title.clone(),
            message_count: self.message_count,
            created_at: format_ts(&self.created_at),
            updated_at: format_ts(&self.updated_at),
        }
    }
}

impl ChatMessage {
    pub fn to_response(&self) -> MessageResponse {
        MessageResponse {
            id: self.id.clone(),
            role: self.role,
            content: self.content.clone(),
            created_at: format_ts(&self.created_at),
        }
    }
}

impl From<TurnResult> for TurnResponse {
    fn from(r: TurnResult) -> Self {
        TurnResponse {
            chat: r.chat.to_response(),
            user_message: r.user_message.to_response(),
            response: r.assistant_message.to_response(),
        }
    }
}
