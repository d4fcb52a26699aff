//! Identity correlation store.
//!
//! Maps the vendor's opaque group, sender and message tokens to the small
//! stable integers OneBot requires. Every mapping is get-or-create and
//! append-only: ids are assigned once, never reused and never deleted.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

mod sqlite;

pub use sqlite::SqliteCorrelationStore;

/// Local id used for direct (non-group) conversations.
pub const DIRECT_CONVERSATION_GROUP_ID: i32 = 0;

/// Result type for correlation store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors returned by store implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("vendor {0} token cannot be empty")]
    EmptyToken(&'static str),
    #[error("no group recorded for local id {0}")]
    GroupNotFound(i32),
    #[error("no sender recorded for local id {0}")]
    SenderNotFound(i64),
    #[error("no message recorded for group {group_local_id} and sender {sender_local_id}")]
    MessageNotFound {
        group_local_id: i32,
        sender_local_id: i64,
    },
    #[error("invalid persisted value for '{field}': {value}")]
    InvalidPersistedValue { field: &'static str, value: String },
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("store task failed to complete: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// One row of the message correlation log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub local_id: i32,
    pub group_local_id: i32,
    pub sender_local_id: i64,
    pub vendor_message_token: String,
    pub created_at: i64,
}

/// Async contract shared by the translator and outbound delivery.
#[async_trait]
pub trait CorrelationStore: Send + Sync {
    async fn get_or_create_group(&self, vendor_token: &str) -> StoreResult<i32>;
    async fn get_or_create_sender(&self, vendor_token: &str) -> StoreResult<i64>;
    /// Appends a message correlation; recording a known token returns its existing id.
    async fn record_message(
        &self,
        vendor_message_token: &str,
        group_local_id: i32,
        sender_local_id: i64,
    ) -> StoreResult<i32>;
    /// Token of the most recently recorded message for the pair.
    async fn latest_vendor_message_token(
        &self,
        group_local_id: i32,
        sender_local_id: i64,
    ) -> StoreResult<String>;
    async fn vendor_group_token(&self, group_local_id: i32) -> StoreResult<String>;
    async fn vendor_sender_token(&self, sender_local_id: i64) -> StoreResult<String>;
}

pub(crate) fn require_token<'a>(kind: &'static str, token: &'a str) -> StoreResult<&'a str> {
    let trimmed = token.trim();
    if trimmed.is_empty() {
        return Err(StoreError::EmptyToken(kind));
    }
    Ok(trimmed)
}

#[derive(Debug, Default)]
struct MemoryState {
    groups: HashMap<String, i32>,
    group_tokens: Vec<String>,
    senders: HashMap<String, i64>,
    sender_tokens: Vec<String>,
    message_ids: HashMap<String, i32>,
    messages: Vec<MessageRecord>,
}

/// Non-durable store for tests and throwaway runs.
#[derive(Debug, Default)]
pub struct InMemoryCorrelationStore {
    state: RwLock<MemoryState>,
}

impl InMemoryCorrelationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CorrelationStore for InMemoryCorrelationStore {
    async fn get_or_create_group(&self, vendor_token: &str) -> StoreResult<i32> {
        let token = require_token("group", vendor_token)?;
        let mut state = self.state.write().await;
        if let Some(id) = state.groups.get(token) {
            return Ok(*id);
        }
        state.group_tokens.push(token.to_string());
        let id = local_id_i32("group_tokens.id", state.group_tokens.len())?;
        state.groups.insert(token.to_string(), id);
        Ok(id)
    }

    async fn get_or_create_sender(&self, vendor_token: &str) -> StoreResult<i64> {
        let token = require_token("sender", vendor_token)?;
        let mut state = self.state.write().await;
        if let Some(id) = state.senders.get(token) {
            return Ok(*id);
        }
        state.sender_tokens.push(token.to_string());
        let id = i64::try_from(state.sender_tokens.len()).map_err(|_| {
            StoreError::InvalidPersistedValue {
                field: "sender_tokens.id",
                value: state.sender_tokens.len().to_string(),
            }
        })?;
        state.senders.insert(token.to_string(), id);
        Ok(id)
    }

    async fn record_message(
        &self,
        vendor_message_token: &str,
        group_local_id: i32,
        sender_local_id: i64,
    ) -> StoreResult<i32> {
        let token = require_token("message", vendor_message_token)?;
        let mut state = self.state.write().await;
        if let Some(id) = state.message_ids.get(token) {
            return Ok(*id);
        }
        let local_id = local_id_i32("message_tokens.id", state.messages.len() + 1)?;
        state.messages.push(MessageRecord {
            local_id,
            group_local_id,
            sender_local_id,
            vendor_message_token: token.to_string(),
            created_at: qbridge_core::current_unix_timestamp(),
        });
        state.message_ids.insert(token.to_string(), local_id);
        Ok(local_id)
    }

    async fn latest_vendor_message_token(
        &self,
        group_local_id: i32,
        sender_local_id: i64,
    ) -> StoreResult<String> {
        let state = self.state.read().await;
        state
            .messages
            .iter()
            .rev()
            .find(|record| {
                record.group_local_id == group_local_id && record.sender_local_id == sender_local_id
            })
            .map(|record| record.vendor_message_token.clone())
            .ok_or(StoreError::MessageNotFound {
                group_local_id,
                sender_local_id,
            })
    }

    async fn vendor_group_token(&self, group_local_id: i32) -> StoreResult<String> {
        let state = self.state.read().await;
        usize::try_from(group_local_id)
            .ok()
            .and_then(|id| id.checked_sub(1))
            .and_then(|index| state.group_tokens.get(index))
            .cloned()
            .ok_or(StoreError::GroupNotFound(group_local_id))
    }

    async fn vendor_sender_token(&self, sender_local_id: i64) -> StoreResult<String> {
        let state = self.state.read().await;
        usize::try_from(sender_local_id)
            .ok()
            .and_then(|id| id.checked_sub(1))
            .and_then(|index| state.sender_tokens.get(index))
            .cloned()
            .ok_or(StoreError::SenderNotFound(sender_local_id))
    }
}

fn local_id_i32(field: &'static str, value: usize) -> StoreResult<i32> {
    i32::try_from(value).map_err(|_| StoreError::InvalidPersistedValue {
        field,
        value: value.to_string(),
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use super::{CorrelationStore, InMemoryCorrelationStore, StoreError};

    pub(crate) async fn assert_store_contract(store: &dyn CorrelationStore) {
        let group = store.get_or_create_group("GROUP_A").await.expect("group");
        assert_eq!(
            store.get_or_create_group("GROUP_A").await.expect("group"),
            group
        );
        let other_group = store.get_or_create_group("GROUP_B").await.expect("group");
        assert_ne!(group, other_group);

        let sender = store.get_or_create_sender("MEMBER_A").await.expect("sender");
        assert_eq!(
            store.get_or_create_sender("MEMBER_A").await.expect("sender"),
            sender
        );

        let first = store
            .record_message("msg-1", group, sender)
            .await
            .expect("record");
        assert_eq!(
            store
                .latest_vendor_message_token(group, sender)
                .await
                .expect("latest"),
            "msg-1"
        );
        let second = store
            .record_message("msg-2", group, sender)
            .await
            .expect("record");
        assert!(second > first);
        assert_eq!(
            store
                .latest_vendor_message_token(group, sender)
                .await
                .expect("latest"),
            "msg-2"
        );
        assert_eq!(
            store
                .record_message("msg-1", group, sender)
                .await
                .expect("re-record"),
            first
        );

        assert_eq!(
            store.vendor_group_token(group).await.expect("group token"),
            "GROUP_A"
        );
        assert_eq!(
            store.vendor_sender_token(sender).await.expect("sender token"),
            "MEMBER_A"
        );
        assert!(matches!(
            store.latest_vendor_message_token(other_group, sender).await,
            Err(StoreError::MessageNotFound { .. })
        ));
        assert!(matches!(
            store.vendor_group_token(9_999).await,
            Err(StoreError::GroupNotFound(9_999))
        ));
        assert!(matches!(
            store.get_or_create_group("  ").await,
            Err(StoreError::EmptyToken("group"))
        ));
    }

    pub(crate) async fn assert_concurrent_get_or_create(store: Arc<dyn CorrelationStore>) {
        let mut handles = Vec::new();
        for index in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let shared = store
                    .get_or_create_group("SHARED")
                    .await
                    .expect("shared group");
                let distinct = store
                    .get_or_create_group(&format!("GROUP_{index}"))
                    .await
                    .expect("distinct group");
                (shared, distinct)
            }));
        }
        let mut shared_ids = HashSet::new();
        let mut distinct_ids = HashSet::new();
        for handle in handles {
            let (shared, distinct) = handle.await.expect("join");
            shared_ids.insert(shared);
            distinct_ids.insert(distinct);
        }
        assert_eq!(shared_ids.len(), 1);
        assert_eq!(distinct_ids.len(), 16);
        let shared = shared_ids.into_iter().next().expect("shared id");
        assert!(!distinct_ids.contains(&shared));
    }

    #[tokio::test]
    async fn functional_in_memory_store_honors_contract() {
        let store = InMemoryCorrelationStore::new();
        assert_store_contract(&store).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn integration_in_memory_get_or_create_is_race_free() {
        assert_concurrent_get_or_create(Arc::new(InMemoryCorrelationStore::new())).await;
    }
}
