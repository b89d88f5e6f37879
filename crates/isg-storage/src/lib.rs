use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::Path;
use thiserror::Error;
use uuid::Uuid;

mod handle;

pub use handle::{SharedStore, StoreHandle};

pub const IDENTITY_SCHEMA_VERSION: i64 = 1;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
    #[error("external id already bound to another user: {0}")]
    ExternalIdTaken(String),
    #[error("identity store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub id: String,
    pub external_id: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelLink {
    pub id: i64,
    pub user_id: String,
    pub channel: String,
    pub peer_id: String,
    pub linked_at: DateTime<Utc>,
}

/// A channel link joined with its owning user, the unit returned by
/// identity lookups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkedUser {
    pub user: UserRecord,
    pub link: ChannelLink,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }

    pub fn parse(value: &str) -> Option<MessageRole> {
        match value {
            "user" => Some(MessageRole::User),
            "assistant" => Some(MessageRole::Assistant),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationRecord {
    pub id: i64,
    pub channel: String,
    pub session_key: String,
    pub started_at: DateTime<Utc>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub message_count: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageRecord {
    pub id: i64,
    pub conversation_id: i64,
    pub role: MessageRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub metadata: Option<Value>,
}

#[derive(Debug)]
pub struct IdentityStore {
    conn: Connection,
}

impl IdentityStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON")?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON")?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let current = self.schema_version()?;
        if current > IDENTITY_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: IDENTITY_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let sql = include_str!("../migrations/0001_identity_schema.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 1", [])
                .map(|_| ())?;
        }

        Ok(())
    }

    pub fn create_user(
        &self,
        first_name: Option<&str>,
        last_name: Option<&str>,
        external_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<UserRecord, StorageError> {
        let id = format!("usr_{}", Uuid::new_v4());
        self.conn
            .execute(
                "
                INSERT INTO users (id, external_id, first_name, last_name, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                ",
                params![id, external_id, first_name, last_name, now.to_rfc3339()],
            )
            .map_err(|err| map_external_id_conflict(external_id, err))?;

        Ok(UserRecord {
            id,
            external_id: external_id.map(str::to_string),
            first_name: first_name.map(str::to_string),
            last_name: last_name.map(str::to_string),
            created_at: now,
            updated_at: now,
        })
    }

    pub fn user_by_id(&self, user_id: &str) -> Result<Option<UserRecord>, StorageError> {
        let user = self
            .conn
            .query_row(
                "
                SELECT id, external_id, first_name, last_name, created_at, updated_at
                FROM users
                WHERE id = ?1
                ",
                [user_id],
                user_from_row,
            )
            .optional()?;
        Ok(user)
    }

    pub fn user_by_external_id(&self, external_id: &str) -> Result<Option<UserRecord>, StorageError> {
        let user = self
            .conn
            .query_row(
                "
                SELECT id, external_id, first_name, last_name, created_at, updated_at
                FROM users
                WHERE external_id = ?1
                ",
                [external_id],
                user_from_row,
            )
            .optional()?;
        Ok(user)
    }

    pub fn update_user_names(
        &self,
        user_id: &str,
        first_name: Option<&str>,
        last_name: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        self.conn.execute(
            "
            UPDATE users
            SET first_name = ?2, last_name = ?3, updated_at = ?4
            WHERE id = ?1
            ",
            params![user_id, first_name, last_name, now.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn set_external_id(
        &self,
        user_id: &str,
        external_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        self.conn
            .execute(
                "
                UPDATE users
                SET external_id = ?2, updated_at = ?3
                WHERE id = ?1
                ",
                params![user_id, external_id, now.to_rfc3339()],
            )
            .map_err(|err| map_external_id_conflict(Some(external_id), err))?;
        Ok(())
    }

    /// Link (channel, peer) to the given user. Re-linking an existing pair
    /// reassigns the owner rather than creating a duplicate row.
    pub fn upsert_link(
        &self,
        user_id: &str,
        channel: &str,
        peer_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        self.conn.execute(
            "
            INSERT INTO channel_links (user_id, channel, peer_id, linked_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(channel, peer_id) DO UPDATE SET
                user_id=excluded.user_id,
                linked_at=excluded.linked_at
            ",
            params![user_id, channel, peer_id, now.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn linked_user(
        &self,
        channel: &str,
        peer_id: &str,
    ) -> Result<Option<LinkedUser>, StorageError> {
        let row = self
            .conn
            .query_row(
                "
                SELECT u.id, u.external_id, u.first_name, u.last_name, u.created_at, u.updated_at,
                       l.id, l.user_id, l.channel, l.peer_id, l.linked_at
                FROM channel_links l
                JOIN users u ON u.id = l.user_id
                WHERE l.channel = ?1 AND l.peer_id = ?2
                ",
                params![channel, peer_id],
                |row| {
                    let user = user_from_row(row)?;
                    let linked_at = parse_sql_timestamp(row.get::<_, String>(10)?, 10)?;
                    Ok(LinkedUser {
                        user,
                        link: ChannelLink {
                            id: row.get(6)?,
                            user_id: row.get(7)?,
                            channel: row.get(8)?,
                            peer_id: row.get(9)?,
                            linked_at,
                        },
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Ensure a conversation row exists for the session key. Creation and
    /// lookup never touch `message_count`; only an actual message insert
    /// does (see [`IdentityStore::record_message`]).
    pub fn ensure_conversation(
        &self,
        session_key: &str,
        channel: &str,
        now: DateTime<Utc>,
    ) -> Result<ConversationRecord, StorageError> {
        self.conn.execute(
            "
            INSERT OR IGNORE INTO conversations (channel, session_key, started_at)
            VALUES (?1, ?2, ?3)
            ",
            params![channel, session_key, now.to_rfc3339()],
        )?;
        self.conversation(session_key)?.ok_or_else(|| {
            StorageError::Unavailable(format!("conversation row missing for {session_key}"))
        })
    }

    /// Record one logical message: ensure the conversation row, insert
    /// exactly one message row, and bump the conversation counters in the
    /// same transaction as that insert.
    ///
    /// Callers are responsible for invoking this at most once per logical
    /// message; repeated calls with identical content insert again.
    pub fn record_message(
        &mut self,
        session_key: &str,
        channel: &str,
        role: MessageRole,
        content: &str,
        metadata: Option<&Value>,
        now: DateTime<Utc>,
    ) -> Result<MessageRecord, StorageError> {
        let metadata_json = metadata
            .map(serde_json::to_string)
            .transpose()
            .map_err(|err| StorageError::Serialization(err.to_string()))?;

        let tx = self.conn.transaction()?;
        tx.execute(
            "
            INSERT OR IGNORE INTO conversations (channel, session_key, started_at)
            VALUES (?1, ?2, ?3)
            ",
            params![channel, session_key, now.to_rfc3339()],
        )?;
        let conversation_id: i64 = tx.query_row(
            "SELECT id FROM conversations WHERE session_key = ?1",
            [session_key],
            |row| row.get(0),
        )?;
        tx.execute(
            "
            INSERT INTO messages (conversation_id, role, content, created_at, metadata_json)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ",
            params![
                conversation_id,
                role.as_str(),
                content,
                now.to_rfc3339(),
                metadata_json,
            ],
        )?;
        let message_id = tx.last_insert_rowid();
        // The single statement in this crate that touches message_count.
        tx.execute(
            "
            UPDATE conversations
            SET message_count = message_count + 1, last_message_at = ?2
            WHERE id = ?1
            ",
            params![conversation_id, now.to_rfc3339()],
        )?;
        tx.commit()?;

        Ok(MessageRecord {
            id: message_id,
            conversation_id,
            role,
            content: content.to_string(),
            created_at: now,
            metadata: metadata.cloned(),
        })
    }

    pub fn conversation(
        &self,
        session_key: &str,
    ) -> Result<Option<ConversationRecord>, StorageError> {
        let row = self
            .conn
            .query_row(
                "
                SELECT id, channel, session_key, started_at, last_message_at, message_count
                FROM conversations
                WHERE session_key = ?1
                ",
                [session_key],
                conversation_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn conversations(&self) -> Result<Vec<ConversationRecord>, StorageError> {
        let mut statement = self.conn.prepare(
            "
            SELECT id, channel, session_key, started_at, last_message_at, message_count
            FROM conversations
            ORDER BY started_at ASC, id ASC
            ",
        )?;
        let rows = statement.query_map([], conversation_from_row)?;
        let mut conversations = Vec::new();
        for row in rows {
            conversations.push(row?);
        }
        Ok(conversations)
    }

    pub fn messages(&self, session_key: &str) -> Result<Vec<MessageRecord>, StorageError> {
        let mut statement = self.conn.prepare(
            "
            SELECT m.id, m.conversation_id, m.role, m.content, m.created_at, m.metadata_json
            FROM messages m
            JOIN conversations c ON c.id = m.conversation_id
            WHERE c.session_key = ?1
            ORDER BY m.id ASC
            ",
        )?;
        let rows = statement.query_map([session_key], |row| {
            let role: String = row.get(2)?;
            let role = MessageRole::parse(&role).ok_or_else(|| {
                rusqlite::Error::FromSqlConversionFailure(
                    2,
                    rusqlite::types::Type::Text,
                    format!("unknown message role: {role}").into(),
                )
            })?;
            let created_at = parse_sql_timestamp(row.get::<_, String>(4)?, 4)?;
            let metadata_json: Option<String> = row.get(5)?;
            let metadata = metadata_json
                .map(|json| serde_json::from_str(&json))
                .transpose()
                .map_err(|err| {
                    rusqlite::Error::FromSqlConversionFailure(
                        5,
                        rusqlite::types::Type::Text,
                        Box::new(err),
                    )
                })?;
            Ok(MessageRecord {
                id: row.get(0)?,
                conversation_id: row.get(1)?,
                role,
                content: row.get(3)?,
                created_at,
                metadata,
            })
        })?;
        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    pub fn user_count(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?)
    }

    pub fn link_count(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM channel_links", [], |row| row.get(0))?)
    }

    pub fn table_exists(&self, table_name: &str) -> Result<bool, StorageError> {
        let exists = self
            .conn
            .query_row(
                "
                SELECT 1
                FROM sqlite_master
                WHERE type='table' AND name = ?1
                LIMIT 1
                ",
                [table_name],
                |_| Ok(()),
            )
            .optional()?;
        Ok(exists.is_some())
    }
}

fn user_from_row(row: &rusqlite::Row<'_>) -> Result<UserRecord, rusqlite::Error> {
    let created_at = parse_sql_timestamp(row.get::<_, String>(4)?, 4)?;
    let updated_at = parse_sql_timestamp(row.get::<_, String>(5)?, 5)?;
    Ok(UserRecord {
        id: row.get(0)?,
        external_id: row.get(1)?,
        first_name: row.get(2)?,
        last_name: row.get(3)?,
        created_at,
        updated_at,
    })
}

fn conversation_from_row(row: &rusqlite::Row<'_>) -> Result<ConversationRecord, rusqlite::Error> {
    let started_at = parse_sql_timestamp(row.get::<_, String>(3)?, 3)?;
    let last_message_at = row
        .get::<_, Option<String>>(4)?
        .map(|value| parse_sql_timestamp(value, 4))
        .transpose()?;
    Ok(ConversationRecord {
        id: row.get(0)?,
        channel: row.get(1)?,
        session_key: row.get(2)?,
        started_at,
        last_message_at,
        message_count: row.get(5)?,
    })
}

fn parse_sql_timestamp(value: String, column: usize) -> Result<DateTime<Utc>, rusqlite::Error> {
    DateTime::parse_from_rfc3339(&value)
        .map(|timestamp| timestamp.with_timezone(&Utc))
        .map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(
                column,
                rusqlite::types::Type::Text,
                Box::new(err),
            )
        })
}

fn map_external_id_conflict(external_id: Option<&str>, err: rusqlite::Error) -> StorageError {
    if let Some(external_id) = external_id {
        if let rusqlite::Error::SqliteFailure(failure, Some(message)) = &err {
            if failure.code == rusqlite::ErrorCode::ConstraintViolation
                && message.contains("users.external_id")
            {
                return StorageError::ExternalIdTaken(external_id.to_string());
            }
        }
    }
    StorageError::Sqlite(err)
}
