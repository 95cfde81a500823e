pub mod models;
pub mod users;
