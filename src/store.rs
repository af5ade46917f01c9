use crate::entity::chat_history;
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use sea_orm::*;
use std::path::Path;
use thiserror::Error;
use tracing::info;

mod migrations;

/// Fixed-width UTC layout, so lexical order of `created_at` is chronological order.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f%:z";

/// `user_id` recorded for replies written by the relay itself.
pub const SYSTEM_USER_ID: u64 = 0;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] DbErr),
    #[error("Failed to parse timestamp '{value}': {source}")]
    Timestamp {
        value: String,
        source: chrono::ParseError,
    },
    #[error("Migration {version} ({name}) failed: {source}")]
    Migration {
        version: i64,
        name: &'static str,
        source: DbErr,
    },
    #[error("User id {0} cannot be stored")]
    UserId(u64),
    #[error("Storage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Author {
    Human,
    Assistant,
}

impl Author {
    pub fn next(self) -> Self {
        match self {
            Author::Human => Author::Assistant,
            Author::Assistant => Author::Human,
        }
    }

    fn of(user_id: u64) -> Self {
        if user_id == SYSTEM_USER_ID {
            Author::Assistant
        } else {
            Author::Human
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub id: i64,
    pub author: Author,
    pub user_id: u64,
    pub username: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<chat_history::Model> for ChatMessage {
    type Error = StoreError;

    fn try_from(r: chat_history::Model) -> Result<Self, Self::Error> {
        let created_at = parse_timestamp(&r.created_at)?;
        let user_id = r.user_id as u64;
        Ok(Self {
            id: r.id,
            author: Author::of(user_id),
            user_id,
            username: r.username,
            text: r.message,
            created_at,
        })
    }
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub user_id: u64,
    pub username: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

impl NewMessage {
    pub fn human(user_id: u64, username: &str, text: &str) -> Self {
        Self {
            user_id,
            username: username.to_string(),
            text: text.to_string(),
            created_at: Utc::now(),
        }
    }

    pub fn assistant(text: &str) -> Self {
        Self {
            user_id: SYSTEM_USER_ID,
            username: String::new(),
            text: text.to_string(),
            created_at: Utc::now(),
        }
    }
}

pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_str(value, TIMESTAMP_FORMAT)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|source| StoreError::Timestamp {
            value: value.to_string(),
            source,
        })
}

/// Durable, ordered log of conversation turns.
#[async_trait]
pub trait TranscriptStore: Send + Sync {
    /// Deletes the oldest rows so that at most `ceiling` remain. Returns the
    /// number of rows removed.
    async fn prune(&self, ceiling: u64) -> Result<u64, StoreError>;

    /// Every retained message, oldest first.
    async fn read_all(&self) -> Result<Vec<ChatMessage>, StoreError>;

    async fn append(&self, message: NewMessage) -> Result<ChatMessage, StoreError>;
}

pub struct SqliteTranscript {
    db_url: String,
}

impl SqliteTranscript {
    /// Opens (creating if needed) the database file and brings its schema up
    /// to date.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await?;
        }
        let db_url = format!("sqlite:{}?mode=rwc", path.display());

        let applied = tokio::task::spawn_blocking({
            let db_url = db_url.clone();
            move || -> Result<Vec<i64>, StoreError> {
                let db = Database::connect(&db_url)?;
                migrations::run(&db)
            }
        })
        .await??;

        if applied.is_empty() {
            info!("Database schema is up to date");
        } else {
            info!("Applied {} migration(s): {:?}", applied.len(), applied);
        }
        info!("Transcript store ready at {}", path.display());

        Ok(Self { db_url })
    }
}

#[async_trait]
impl TranscriptStore for SqliteTranscript {
    async fn prune(&self, ceiling: u64) -> Result<u64, StoreError> {
        let db_url = self.db_url.clone();

        tokio::task::spawn_blocking(move || -> Result<u64, StoreError> {
            let db = Database::connect(&db_url)?;
            let count = chat_history::Entity::find().count(&db)?;
            if count <= ceiling {
                return Ok(0);
            }

            // Newest row that falls outside the retained window.
            let Some(boundary) = chat_history::Entity::find()
                .order_by_desc(chat_history::Column::CreatedAt)
                .order_by_desc(chat_history::Column::Id)
                .offset(ceiling)
                .one(&db)?
            else {
                return Ok(0);
            };

            let result = chat_history::Entity::delete_many()
                .filter(
                    Condition::any()
                        .add(chat_history::Column::CreatedAt.lt(boundary.created_at.clone()))
                        .add(
                            Condition::all()
                                .add(chat_history::Column::CreatedAt.eq(boundary.created_at))
                                .add(chat_history::Column::Id.lte(boundary.id)),
                        ),
                )
                .exec(&db)?;

            Ok(result.rows_affected)
        })
        .await?
    }

    async fn read_all(&self) -> Result<Vec<ChatMessage>, StoreError> {
        let db_url = self.db_url.clone();

        tokio::task::spawn_blocking(move || -> Result<Vec<ChatMessage>, StoreError> {
            let db = Database::connect(&db_url)?;
            let rows = chat_history::Entity::find()
                .order_by_asc(chat_history::Column::CreatedAt)
                .order_by_asc(chat_history::Column::Id)
                .all(&db)?;

            rows.into_iter().map(ChatMessage::try_from).collect()
        })
        .await?
    }

    async fn append(&self, message: NewMessage) -> Result<ChatMessage, StoreError> {
        let user_id =
            i64::try_from(message.user_id).map_err(|_| StoreError::UserId(message.user_id))?;
        let db_url = self.db_url.clone();

        tokio::task::spawn_blocking(move || -> Result<ChatMessage, StoreError> {
            let db = Database::connect(&db_url)?;

            let mut created_at = message.created_at;
            if let Some(latest) = chat_history::Entity::find()
                .order_by_desc(chat_history::Column::CreatedAt)
                .order_by_desc(chat_history::Column::Id)
                .one(&db)?
            {
                let latest = parse_timestamp(&latest.created_at)?;
                if created_at <= latest {
                    created_at = latest + TimeDelta::nanoseconds(1);
                }
            }

            let record = chat_history::ActiveModel {
                id: NotSet,
                user_id: Set(user_id),
                username: Set(message.username.clone()),
                message: Set(message.text.clone()),
                created_at: Set(format_timestamp(created_at)),
            };
            let result = chat_history::Entity::insert(record).exec(&db)?;

            Ok(ChatMessage {
                id: result.last_insert_id,
                author: Author::of(message.user_id),
                user_id: message.user_id,
                username: message.username,
                text: message.text,
                created_at,
            })
        })
        .await?
    }
}
