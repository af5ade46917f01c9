pub mod chat_history;
pub mod schema_migrations;
