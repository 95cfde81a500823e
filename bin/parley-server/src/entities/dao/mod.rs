pub mod chat;
pub mod message;
pub mod model;
pub mod user;

pub use chat::Chat;
pub use message::{ChatMessage, Role};
pub use model::ModelDescriptor;
pub use user::UserRecord;
