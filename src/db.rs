/// Agent registry, task queue and agent logs, stored in PostgreSQL.
pub mod conn;
pub mod models;
pub mod schema;
