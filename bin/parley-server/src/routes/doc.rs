use crate::routes::{admin, auth, chats, health, models, search};
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(info(
    title = "parley-server",
    description = "Chat turns over an Ollama-compatible backend, with streamed replies and message search",
    version = "0.1.0"
))]
pub struct ApiDoc;

pub fn get_docs() -> utoipa::openapi::OpenApi {
    let mut root = ApiDoc::openapi();
    root.merge(health::HealthApi::openapi());
    root.merge(chats::ChatsApi::openapi());
    root.merge(models::ModelsApi::openapi());
    root.merge(search::SearchApi::openapi());
    root.merge(auth::AuthApi::openapi());
    root.merge(admin::api_docs());
    root
}
