//! SQLite persistence for helm sessions, turns, chat messages and history
//! cursors.

pub mod chat_messages;
pub mod cursors;
pub mod database;
pub mod error;
pub mod gateway;
pub mod row_helpers;
pub mod schema;
pub mod sessions;
pub mod turns;

pub use database::Database;
pub use error::StoreError;
pub use gateway::SqlitePersistence;
