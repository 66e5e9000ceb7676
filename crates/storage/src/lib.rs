//! Durable state: the relational schema and its repositories.
//!
//! SQLite (via sqlx) is the source of truth for every entity in the system.
//! Repositories are thin: one struct per aggregate, holding the shared pool.
//! Counters that multiple tasks race on (unread counts, prekey consumption)
//! are always DB-side increments or claim-one UPDATEs, never read-modify-
//! write in application memory.

use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};

pub mod attachments;
pub mod calls;
pub mod conversations;
pub mod devices;
pub mod error;
pub mod keys;
pub mod messages;
pub mod notifications;
pub mod schema;
pub mod security;
pub mod tokens;
pub mod types;
pub mod users;

pub use error::{Result, StoreError};

/// Open (or create) the database and apply the schema.
pub async fn connect(db_path: &str) -> Result<SqlitePool> {
    // An in-memory database exists per connection, so the pool must stay at
    // a single connection for tests to see one schema.
    let (options, max_connections) = if db_path == ":memory:" {
        (SqliteConnectOptions::new().in_memory(true), 1)
    } else {
        (
            SqliteConnectOptions::new()
                .filename(db_path)
                .create_if_missing(true)
                .foreign_keys(true),
            8,
        )
    };

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;
    schema::init(&pool).await?;
    Ok(pool)
}

/// In-memory pool with schema applied, for tests.
pub async fn test_pool() -> SqlitePool {
    match connect(":memory:").await {
        Ok(pool) => pool,
        Err(e) => panic!("in-memory pool: {e}"),
    }
}
