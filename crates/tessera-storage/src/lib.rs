//! Tessera Storage: the column/transaction facade
//!
//! The log-structured engine itself is an external collaborator. This
//! crate fixes the shape the evaluator writes through: named columns
//! keyed by bytes, and a `Transaction` that aggregates deltas and commits
//! atomically. `MemoryStorageEngine` implements the same trait for tests,
//! including injected commit failures for abort-path coverage.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use tracing::trace;

/// Column names the evaluator commits through.
pub mod columns {
    /// Full event JSON by event id.
    pub const EVENT_JSON: &str = "event_json";
    /// Event id by big-endian sequence number.
    pub const EVENT_SEQ: &str = "event_seq";
    /// Room timeline index: `room_id + depth + event_id`.
    pub const ROOM_EVENTS: &str = "room_events";
    /// Current state: `room_id + type + state_key` to event id.
    pub const ROOM_STATE: &str = "room_state";
    /// Origin set per room: `room_id + server_name`.
    pub const ROOM_ORIGINS: &str = "room_origins";
}

/// One mutation inside a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    Set,
    Delete,
}

/// A single column write or delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    pub op: Op,
    pub column: String,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl Delta {
    /// A `Set` delta.
    pub fn set(
        column: impl Into<String>,
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            op: Op::Set,
            column: column.into(),
            key: key.into(),
            value: value.into(),
        }
    }

    /// A `Delete` delta.
    pub fn delete(column: impl Into<String>, key: impl Into<Vec<u8>>) -> Self {
        Self {
            op: Op::Delete,
            column: column.into(),
            key: key.into(),
            value: Vec::new(),
        }
    }
}

/// An ordered batch of deltas committed atomically.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    deltas: Vec<Delta>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one delta.
    pub fn append(&mut self, delta: Delta) {
        self.deltas.push(delta);
    }

    pub fn len(&self) -> usize {
        self.deltas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    pub fn deltas(&self) -> &[Delta] {
        &self.deltas
    }
}

/// Storage operation failures.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
pub enum StorageError {
    /// The engine refused or aborted the commit.
    #[error("Commit failed: {reason}")]
    CommitFailed {
        /// What the engine reported
        reason: String,
    },
    /// A read failed.
    #[error("Read failed: {reason}")]
    ReadFailed {
        /// What the engine reported
        reason: String,
    },
}

impl From<StorageError> for tessera_core::Error {
    fn from(err: StorageError) -> Self {
        tessera_core::Error::storage(err.to_string())
    }
}

/// The seam the on-disk engine implements.
#[async_trait]
pub trait StorageEngine: Send + Sync {
    /// Commit a transaction atomically: all deltas or none.
    async fn commit(&self, txn: Transaction) -> Result<(), StorageError>;

    /// Read one value.
    async fn get(&self, column: &str, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError>;

    /// Existence check.
    async fn has(&self, column: &str, key: &[u8]) -> Result<bool, StorageError> {
        Ok(self.get(column, key).await?.is_some())
    }

    /// All `(key, value)` pairs under a key prefix, in key order.
    async fn scan_prefix(
        &self,
        column: &str,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError>;
}

/// In-memory engine for tests and simulation.
#[derive(Debug, Default)]
pub struct MemoryStorageEngine {
    cells: RwLock<HashMap<String, BTreeMap<Vec<u8>, Vec<u8>>>>,
    fail_next_commit: AtomicBool,
}

impl MemoryStorageEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next commit fail, for abort-path tests.
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }

    /// Number of keys in a column.
    pub async fn column_len(&self, column: &str) -> usize {
        self.cells
            .read()
            .await
            .get(column)
            .map(BTreeMap::len)
            .unwrap_or(0)
    }
}

#[async_trait]
impl StorageEngine for MemoryStorageEngine {
    async fn commit(&self, txn: Transaction) -> Result<(), StorageError> {
        if self.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(StorageError::CommitFailed {
                reason: "injected failure".into(),
            });
        }

        let mut cells = self.cells.write().await;
        trace!(deltas = txn.len(), "committing transaction");
        for delta in txn.deltas {
            let column = cells.entry(delta.column).or_default();
            match delta.op {
                Op::Set => {
                    column.insert(delta.key, delta.value);
                }
                Op::Delete => {
                    column.remove(&delta.key);
                }
            }
        }
        Ok(())
    }

    async fn get(&self, column: &str, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self
            .cells
            .read()
            .await
            .get(column)
            .and_then(|cells| cells.get(key).cloned()))
    }

    async fn scan_prefix(
        &self,
        column: &str,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        let cells = self.cells.read().await;
        let Some(column) = cells.get(column) else {
            return Ok(Vec::new());
        };

        Ok(column
            .range(prefix.to_vec()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn commit_applies_all_deltas() {
        let engine = MemoryStorageEngine::new();

        let mut txn = Transaction::new();
        txn.append(Delta::set(columns::EVENT_JSON, b"$a".to_vec(), b"{}".to_vec()));
        txn.append(Delta::set(columns::EVENT_SEQ, 1u64.to_be_bytes(), b"$a".to_vec()));
        engine.commit(txn).await.unwrap();

        assert!(engine.has(columns::EVENT_JSON, b"$a").await.unwrap());
        assert_eq!(
            engine
                .get(columns::EVENT_SEQ, &1u64.to_be_bytes())
                .await
                .unwrap(),
            Some(b"$a".to_vec())
        );
    }

    #[tokio::test]
    async fn injected_failure_leaves_state_untouched() {
        let engine = MemoryStorageEngine::new();
        engine.fail_next_commit();

        let mut txn = Transaction::new();
        txn.append(Delta::set(columns::EVENT_JSON, b"$a".to_vec(), b"{}".to_vec()));
        assert!(engine.commit(txn).await.is_err());
        assert!(!engine.has(columns::EVENT_JSON, b"$a").await.unwrap());

        // Failure injection is one-shot.
        let mut txn = Transaction::new();
        txn.append(Delta::set(columns::EVENT_JSON, b"$a".to_vec(), b"{}".to_vec()));
        assert!(engine.commit(txn).await.is_ok());
    }

    #[tokio::test]
    async fn delete_and_scan_prefix() {
        let engine = MemoryStorageEngine::new();

        let mut txn = Transaction::new();
        txn.append(Delta::set(columns::ROOM_ORIGINS, b"!r:x\0s1".to_vec(), Vec::new()));
        txn.append(Delta::set(columns::ROOM_ORIGINS, b"!r:x\0s2".to_vec(), Vec::new()));
        txn.append(Delta::set(columns::ROOM_ORIGINS, b"!q:x\0s3".to_vec(), Vec::new()));
        engine.commit(txn).await.unwrap();

        let origins = engine
            .scan_prefix(columns::ROOM_ORIGINS, b"!r:x\0")
            .await
            .unwrap();
        assert_eq!(origins.len(), 2);

        let mut txn = Transaction::new();
        txn.append(Delta::delete(columns::ROOM_ORIGINS, b"!r:x\0s1".to_vec()));
        engine.commit(txn).await.unwrap();
        assert_eq!(
            engine
                .scan_prefix(columns::ROOM_ORIGINS, b"!r:x\0")
                .await
                .unwrap()
                .len(),
            1
        );
    }
}
