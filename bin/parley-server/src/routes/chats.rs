//! Chat routes: create, list, read, send, delete.
//!
//! Sending a message runs one turn through the [`TurnCoordinator`].  With
//! streaming on, the reply is relayed as server-sent events:
//!
//! ```text
//! data: {"chunk":"Hel"}
//! data: {"chunk":"lo"}
//! data: {"done":true}
//! ```
//!
//! A failed turn ends with `data: {"error":"..."}` instead of `done`.
//!
//! [`TurnCoordinator`]: crate::services::turn::TurnCoordinator

use std::sync::Arc;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tracing::debug;
use utoipa::OpenApi;
use validator::Validate;

use crate::entities::{ChatStore, MessageStore};
use crate::error::ServerError;
use crate::schemas::chat::{
    ChatDetailResponse, ChatResponse, CreateChatRequest, ListChatsQuery, MessageResponse,
    SendMessageRequest, TurnResponse,
};
use crate::services::relay;
use crate::services::turn::TurnRequest;
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(
    paths(create_chat, list_chats, get_chat, list_messages, send_message, delete_chat),
    components(schemas(
        CreateChatRequest,
        SendMessageRequest,
        ChatResponse,
        MessageResponse,
        TurnResponse,
        ChatDetailResponse
    ))
)]
pub struct ChatsApi;

/// Register chat routes.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/chats", post(create_chat).get(list_chats))
        .route("/chats/{id}", get(get_chat).delete(delete_chat))
        .route("/chats/{id}/messages", get(list_messages).post(send_message))
}

/// Create a chat and run its first turn.
#[utoipa::path(
    post,
    path = "/chats",
    tag = "chats",
    request_body = CreateChatRequest,
    responses(
        (status = 201, description = "Chat created and first turn completed", body = TurnResponse),
        (status = 400, description = "Missing or invalid fields"),
        (status = 404, description = "Unknown user or model"),
        (status = 502, description = "Inference backend error; no chat is created"),
        (status = 500, description = "Internal error"),
    )
)]
pub async fn create_chat(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<CreateChatRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<TurnResponse>), ServerError> {
    let Json(req) = payload?;
    req.validate()?;

    let result = state
        .turns
        .run_turn(TurnRequest {
            chat_id: None,
            user_id: Some(req.user_id),
            model: Some(req.model_id),
            content: req.initial_message,
            title: req.title,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(result.into())))
}

/// Chats of one user, most recently updated first.
#[utoipa::path(
    get,
    path = "/chats",
    tag = "chats",
    params(ListChatsQuery),
    responses(
        (status = 200, description = "Chats of the user", body = Vec<ChatResponse>),
        (status = 400, description = "Missing user_id"),
    )
)]
pub async fn list_chats(
    State(state): State<Arc<AppState>>,
    query: Result<Query<ListChatsQuery>, QueryRejection>,
) -> Result<Json<Vec<ChatResponse>>, ServerError> {
    let Query(query) = query?;
    let chats = state.store.list_chats(&query.user_id).await?;
    Ok(Json(chats.iter().map(|c| c.to_response()).collect()))
}

#[utoipa::path(
    get,
    path = "/chats/{id}",
    tag = "chats",
    params(("id" = String, Path, description = "Chat id")),
    responses(
        (status = 200, description = "Chat with its messages", body = ChatDetailResponse),
        (status = 404, description = "Chat not found"),
    )
)]
pub async fn get_chat(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ChatDetailResponse>, ServerError> {
    let chat = state
        .store
        .get_chat(&id)
        .await?
        .ok_or_else(|| ServerError::NotFound(format!("chat {id} not found")))?;
    let messages = state.store.list_messages(&id).await?;
    Ok(Json(ChatDetailResponse {
        chat: chat.to_response(),
        messages: messages.iter().map(|m| m.to_response()).collect(),
    }))
}

/// Messages of a chat in creation order.
#[utoipa::path(
    get,
    path = "/chats/{id}/messages",
    tag = "chats",
    params(("id" = String, Path, description = "Chat id")),
    responses(
        (status = 200, description = "Ordered messages", body = Vec<MessageResponse>),
        (status = 404, description = "Chat not found"),
    )
)]
pub async fn list_messages(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<MessageResponse>>, ServerError> {
    if state.store.get_chat(&id).await?.is_none() {
        return Err(ServerError::NotFound(format!("chat {id} not found")));
    }
    let messages = state.store.list_messages(&id).await?;
    Ok(Json(messages.iter().map(|m| m.to_response()).collect()))
}

/// Send a message and get the model's reply, streamed or whole.
#[utoipa::path(
    post,
    path = "/chats/{id}/messages",
    tag = "chats",
    params(("id" = String, Path, description = "Chat id")),
    request_body = SendMessageRequest,
    responses(
        (status = 200, description = "Reply streamed as server-sent events", body = String, content_type = "text/event-stream"),
        (status = 201, description = "Turn completed", body = TurnResponse),
        (status = 400, description = "Missing or empty message"),
        (status = 404, description = "Chat or model not found"),
        (status = 502, description = "Inference backend error"),
    )
)]
pub async fn send_message(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    payload: Result<Json<SendMessageRequest>, JsonRejection>,
) -> Result<Response, ServerError> {
    let Json(req) = payload?;
    let stream = req.stream.unwrap_or(state.config.stream_by_default);
    debug!(chat_id = %id, stream, "send message");

    let turn = TurnRequest {
        chat_id: Some(id),
        user_id: None,
        model: req.model,
        content: req.message,
        title: None,
    };

    if stream {
        let handle = state.turns.begin_turn(turn).await?;
        // The turn finishes on its own; dropping the outcome handle detaches it.
        return Ok(relay::sse_response(handle.events).into_response());
    }

    let result = state.turns.run_turn(turn).await?;
    Ok((StatusCode::CREATED, Json(TurnResponse::from(result))).into_response())
}

/// Delete a chat and all of its messages.
#[utoipa::path(
    delete,
    path = "/chats/{id}",
    tag = "chats",
    params(("id" = String, Path, description = "Chat id")),
    responses(
        (status = 204, description = "Chat deleted"),
        (status = 404, description = "Chat not found"),
    )
)]
pub async fn delete_chat(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ServerError> {
    if state.turns.delete_chat(&id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ServerError::NotFound(format!("chat {id} not found")))
    }
}
