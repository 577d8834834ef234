//! SQLite persistence for users, chats and messages.
//!
//! The [`SqlitePool`] doubles as the session provider: each call below borrows
//! a connection for its own duration only.

use std::str::FromStr;

use chrono::{NaiveDateTime, Utc};
use serde::Serialize;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    FromRow, SqlitePool,
};

use crate::include_res;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct User {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct Chat {
    pub id: i64,
}

/// A persisted chat message, exactly as it is sent to subscribers and
/// returned by the history query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct Message {
    pub id: i64,
    pub chat_id: i64,
    pub sender_id: i64,
    pub receiver_id: i64,
    pub text: String,
    pub timestamp: NaiveDateTime,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub chat_id: i64,
    pub sender_id: i64,
    pub receiver_id: i64,
    pub text: String,
}

/// Already validated pagination window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub limit: i64,
    pub offset: i64,
}

pub async fn connect(url: &str, max_connections: u32) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(url)?
        .create_if_missing(true)
        .foreign_keys(true);

    // in-memory databases vanish with their last connection
    SqlitePoolOptions::new()
        .max_connections(max_connections)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await
}

pub async fn init_schema(db_pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(include_res!(str, "/schema.sql"))
        .execute(db_pool)
        .await?;
    Ok(())
}

pub async fn create_user(db_pool: &SqlitePool, name: &str) -> Result<User, sqlx::Error> {
    sqlx::query_as("INSERT INTO users (name) VALUES (?) RETURNING id,name")
        .bind(name)
        .fetch_one(db_pool)
        .await
}

pub async fn create_chat(db_pool: &SqlitePool) -> Result<Chat, sqlx::Error> {
    sqlx::query_as("INSERT INTO chats DEFAULT VALUES RETURNING id")
        .fetch_one(db_pool)
        .await
}

pub async fn find_user(db_pool: &SqlitePool, id: i64) -> Result<Option<User>, sqlx::Error> {
    sqlx::query_as("SELECT id,name FROM users WHERE id=?")
        .bind(id)
        .fetch_optional(db_pool)
        .await
}

pub async fn find_chat(db_pool: &SqlitePool, id: i64) -> Result<Option<Chat>, sqlx::Error> {
    sqlx::query_as("SELECT id FROM chats WHERE id=?")
        .bind(id)
        .fetch_optional(db_pool)
        .await
}

/// Picks the other party of a two-person chat: the lowest-id user that is not
/// `user_id`. There is no membership table, so this only holds while the
/// whole system has two users.
pub async fn find_counterpart(db_pool: &SqlitePool, user_id: i64) -> Result<Option<User>, sqlx::Error> {
    sqlx::query_as("SELECT id,name FROM users WHERE id<>? ORDER BY id LIMIT 1")
        .bind(user_id)
        .fetch_optional(db_pool)
        .await
}

/// Inserts the message and commits before returning the stored row, so a
/// caller only ever fans out durable messages.
pub async fn insert_message(db_pool: &SqlitePool, new: NewMessage) -> Result<Message, sqlx::Error> {
    let NewMessage { chat_id, sender_id, receiver_id, text } = new;

    let mut tx = db_pool.begin().await?;
    let message: Message = sqlx::query_as(
        "INSERT INTO messages (chat_id,sender_id,receiver_id,text,timestamp) VALUES (?,?,?,?,?) \
         RETURNING id,chat_id,sender_id,receiver_id,text,timestamp",
    )
        .bind(chat_id)
        .bind(sender_id)
        .bind(receiver_id)
        .bind(&text)
        .bind(Utc::now().naive_utc())
        .fetch_one(&mut *tx)
        .await?;
    tx.commit().await?;

    Ok(message)
}

pub async fn chat_history(db_pool: &SqlitePool, chat_id: i64, page: Page) -> Result<Vec<Message>, sqlx::Error> {
    sqlx::query_as(
        "SELECT id,chat_id,sender_id,receiver_id,text,timestamp FROM messages WHERE chat_id=? \
         ORDER BY timestamp,id LIMIT ? OFFSET ?",
    )
        .bind(chat_id)
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(db_pool)
        .await
}
