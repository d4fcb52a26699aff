//! SQLite-backed `CorrelationStore` with durable persistence.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use crate::{require_token, CorrelationStore, StoreError, StoreResult};

/// Persistent correlation store. Every operation opens its own connection on
/// the blocking pool so lock waits never stall the async workers.
#[derive(Debug)]
pub struct SqliteCorrelationStore {
    db_path: PathBuf,
}

#[derive(Debug, Clone, Copy)]
enum TokenTable {
    Groups,
    Senders,
}

impl TokenTable {
    fn name(self) -> &'static str {
        match self {
            Self::Groups => "group_tokens",
            Self::Senders => "sender_tokens",
        }
    }

    fn kind(self) -> &'static str {
        match self {
            Self::Groups => "group",
            Self::Senders => "sender",
        }
    }
}

impl SqliteCorrelationStore {
    /// Opens (or creates) the database at `path` and ensures the schema exists.
    pub fn new(path: impl AsRef<Path>) -> StoreResult<Self> {
        let db_path = path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let connection = open_connection(&db_path)?;
        connection.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS group_tokens (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                vendor_token TEXT NOT NULL UNIQUE,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sender_tokens (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                vendor_token TEXT NOT NULL UNIQUE,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS message_tokens (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                vendor_token TEXT NOT NULL UNIQUE,
                group_id INTEGER NOT NULL,
                sender_id INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_message_tokens_pair
                ON message_tokens (group_id, sender_id, id);
            "#,
        )?;
        Ok(Self { db_path })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    async fn run_blocking<T, F>(&self, operation: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
    {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut connection = open_connection(&db_path)?;
            operation(&mut connection)
        })
        .await?
    }

    async fn get_or_create(&self, table: TokenTable, vendor_token: &str) -> StoreResult<i64> {
        let token = require_token(table.kind(), vendor_token)?.to_string();
        self.run_blocking(move |connection| get_or_create_token(connection, table, &token))
            .await
    }

    async fn lookup(&self, table: TokenTable, local_id: i64) -> StoreResult<Option<String>> {
        self.run_blocking(move |connection| lookup_token(connection, table, local_id))
            .await
    }
}

fn open_connection(db_path: &Path) -> StoreResult<Connection> {
    let connection = Connection::open(db_path)?;
    connection.busy_timeout(Duration::from_secs(5))?;
    connection.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        "#,
    )?;
    Ok(connection)
}

/// Select-or-insert under an immediate transaction; the UNIQUE constraint
/// backs it up if another process shares the file.
fn get_or_create_token(
    connection: &mut Connection,
    table: TokenTable,
    token: &str,
) -> StoreResult<i64> {
    let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let select = format!("SELECT id FROM {} WHERE vendor_token = ?1", table.name());
    let existing = transaction
        .query_row(&select, params![token], |row| row.get::<_, i64>(0))
        .optional()?;
    let id = match existing {
        Some(id) => id,
        None => {
            transaction.execute(
                &format!(
                    "INSERT INTO {} (vendor_token, created_at) VALUES (?1, ?2)",
                    table.name()
                ),
                params![token, qbridge_core::current_unix_timestamp()],
            )?;
            transaction.last_insert_rowid()
        }
    };
    transaction.commit()?;
    Ok(id)
}

fn lookup_token(
    connection: &Connection,
    table: TokenTable,
    local_id: i64,
) -> StoreResult<Option<String>> {
    let select = format!("SELECT vendor_token FROM {} WHERE id = ?1", table.name());
    Ok(connection
        .query_row(&select, params![local_id], |row| row.get::<_, String>(0))
        .optional()?)
}

fn insert_message(
    connection: &mut Connection,
    token: &str,
    group_local_id: i32,
    sender_local_id: i64,
) -> StoreResult<i64> {
    let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let existing = transaction
        .query_row(
            "SELECT id FROM message_tokens WHERE vendor_token = ?1",
            params![token],
            |row| row.get::<_, i64>(0),
        )
        .optional()?;
    let id = match existing {
        Some(id) => id,
        None => {
            transaction.execute(
                r#"
                INSERT INTO message_tokens (vendor_token, group_id, sender_id, created_at)
                VALUES (?1, ?2, ?3, ?4)
                "#,
                params![
                    token,
                    group_local_id,
                    sender_local_id,
                    qbridge_core::current_unix_timestamp()
                ],
            )?;
            transaction.last_insert_rowid()
        }
    };
    transaction.commit()?;
    Ok(id)
}

fn latest_message_token(
    connection: &Connection,
    group_local_id: i32,
    sender_local_id: i64,
) -> StoreResult<Option<String>> {
    Ok(connection
        .query_row(
            r#"
            SELECT vendor_token FROM message_tokens
            WHERE group_id = ?1 AND sender_id = ?2
            ORDER BY id DESC
            LIMIT 1
            "#,
            params![group_local_id, sender_local_id],
            |row| row.get::<_, String>(0),
        )
        .optional()?)
}

fn narrow_id(field: &'static str, value: i64) -> StoreResult<i32> {
    i32::try_from(value).map_err(|_| StoreError::InvalidPersistedValue {
        field,
        value: value.to_string(),
    })
}

#[async_trait]
impl CorrelationStore for SqliteCorrelationStore {
    async fn get_or_create_group(&self, vendor_token: &str) -> StoreResult<i32> {
        let id = self.get_or_create(TokenTable::Groups, vendor_token).await?;
        narrow_id("group_tokens.id", id)
    }

    async fn get_or_create_sender(&self, vendor_token: &str) -> StoreResult<i64> {
        self.get_or_create(TokenTable::Senders, vendor_token).await
    }

    async fn record_message(
        &self,
        vendor_message_token: &str,
        group_local_id: i32,
        sender_local_id: i64,
    ) -> StoreResult<i32> {
        let token = require_token("message", vendor_message_token)?.to_string();
        let id = self
            .run_blocking(move |connection| {
                insert_message(connection, &token, group_local_id, sender_local_id)
            })
            .await?;
        narrow_id("message_tokens.id", id)
    }

    async fn latest_vendor_message_token(
        &self,
        group_local_id: i32,
        sender_local_id: i64,
    ) -> StoreResult<String> {
        self.run_blocking(move |connection| {
            latest_message_token(connection, group_local_id, sender_local_id)
        })
        .await?
        .ok_or(StoreError::MessageNotFound {
            group_local_id,
            sender_local_id,
        })
    }

    async fn vendor_group_token(&self, group_local_id: i32) -> StoreResult<String> {
        self.lookup(TokenTable::Groups, i64::from(group_local_id))
            .await?
            .ok_or(StoreError::GroupNotFound(group_local_id))
    }

    async fn vendor_sender_token(&self, sender_local_id: i64) -> StoreResult<String> {
        self.lookup(TokenTable::Senders, sender_local_id)
            .await?
            .ok_or(StoreError::SenderNotFound(sender_local_id))
    }
}
