//! Turn orchestration and the collaborators it drives.

pub mod cache;
pub mod chat_locks;
pub mod fanout;
pub mod inference;
pub mod registry;
pub mod relay;
pub mod search;
pub mod turn;
