//! Database persistence layer for chaincore
//!
//! Storage is a column-family key-value store. Every block commit is one
//! [`WriteBatch`] applied atomically by the backend.

use crate::error::{ChainError, Result};
use parking_lot::{Mutex, RwLock};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Column {
    Entry,
    Block,
    Coin,
    Undo,
    Tip,
    Deployment,
    Meta,
}

impl Column {
    pub fn as_str(self) -> &'static str {
        match self {
            Column::Entry => "entry",
            Column::Block => "block",
            Column::Coin => "coin",
            Column::Undo => "undo",
            Column::Tip => "tip",
            Column::Deployment => "deployment",
            Column::Meta => "meta",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Put {
        column: Column,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        column: Column,
        key: Vec<u8>,
    },
}

/// Ordered list of writes applied all-or-nothing.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, column: Column, key: impl Into<Vec<u8>>, value: Vec<u8>) {
        self.ops.push(WriteOp::Put {
            column,
            key: key.into(),
            value,
        });
    }

    pub fn delete(&mut self, column: Column, key: impl Into<Vec<u8>>) {
        self.ops.push(WriteOp::Delete {
            column,
            key: key.into(),
        });
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &WriteOp> {
        self.ops.iter()
    }
}

/// Abstraction for persistence backends. Implementations must apply a
/// batch atomically: after a failed `write_batch` none of its operations
/// are visible.
pub trait Persistence: Send + Sync {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>>;
    /// All pairs of a column in key order.
    fn scan(&self, column: Column) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;
    fn write_batch(&self, batch: &WriteBatch) -> Result<()>;
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// SQLite backend: one `kv` table keyed by (column, key).
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| ChainError::Database(format!("Failed to open database: {}", e)))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS kv (
                col TEXT NOT NULL,
                key BLOB NOT NULL,
                value BLOB NOT NULL,
                PRIMARY KEY (col, key)
            ) WITHOUT ROWID",
            [],
        )
        .map_err(|e| ChainError::Database(format!("Failed to create kv table: {}", e)))?;

        Ok(Database {
            conn: Mutex::new(conn),
        })
    }
}

impl Persistence for Database {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT value FROM kv WHERE col = ?1 AND key = ?2",
            params![column.as_str(), key],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| ChainError::Database(format!("Failed to read {}: {}", column.as_str(), e)))
    }

    fn scan(&self, column: Column) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT key, value FROM kv WHERE col = ?1 ORDER BY key")
            .map_err(|e| ChainError::Database(format!("Failed to prepare scan: {}", e)))?;
        let rows = stmt
            .query_map(params![column.as_str()], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(|e| ChainError::Database(format!("Failed to scan {}: {}", column.as_str(), e)))?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(|e| ChainError::Database(format!("Failed to read row: {}", e)))?);
        }
        Ok(out)
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<()> {
        let conn = self.conn.lock();
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| ChainError::Database(format!("Failed to start transaction: {}", e)))?;

        for op in batch.iter() {
            let applied = match op {
                WriteOp::Put { column, key, value } => tx.execute(
                    "INSERT OR REPLACE INTO kv (col, key, value) VALUES (?1, ?2, ?3)",
                    params![column.as_str(), key, value],
                ),
                WriteOp::Delete { column, key } => tx.execute(
                    "DELETE FROM kv WHERE col = ?1 AND key = ?2",
                    params![column.as_str(), key],
                ),
            };
            applied.map_err(|e| ChainError::Database(format!("Failed to apply batch: {}", e)))?;
        }

        tx.commit()
            .map_err(|e| ChainError::Database(format!("Failed to commit transaction: {}", e)))
    }
}

/// In-memory backend, used by tests and throwaway nodes.
#[derive(Default)]
pub struct InMemoryPersistence {
    columns: RwLock<HashMap<Column, BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Persistence for InMemoryPersistence {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self
            .columns
            .read()
            .get(&column)
            .and_then(|col| col.get(key))
            .cloned())
    }

    fn scan(&self, column: Column) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        Ok(self
            .columns
            .read()
            .get(&column)
            .map(|col| col.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<()> {
        let mut columns = self.columns.write();
        for op in batch.iter() {
            match op {
                WriteOp::Put { column, key, value } => {
                    columns
                        .entry(*column)
                        .or_default()
                        .insert(key.clone(), value.clone());
                }
                WriteOp::Delete { column, key } => {
                    if let Some(col) = columns.get_mut(column) {
                        col.remove(key);
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(store: &dyn Persistence) {
        let mut batch = WriteBatch::new();
        batch.put(Column::Coin, vec![2u8], vec![20]);
        batch.put(Column::Coin, vec![1u8], vec![10]);
        batch.put(Column::Meta, b"best".to_vec(), vec![0xaa]);
        store.write_batch(&batch).unwrap();

        assert_eq!(store.get(Column::Coin, &[1]).unwrap(), Some(vec![10]));
        assert_eq!(store.get(Column::Entry, &[1]).unwrap(), None);
        let scanned = store.scan(Column::Coin).unwrap();
        assert_eq!(scanned, vec![(vec![1], vec![10]), (vec![2], vec![20])]);

        let mut batch = WriteBatch::new();
        batch.delete(Column::Coin, vec![1u8]);
        batch.put(Column::Coin, vec![2u8], vec![21]);
        store.write_batch(&batch).unwrap();
        assert_eq!(store.scan(Column::Coin).unwrap(), vec![(vec![2], vec![21])]);
    }

    #[test]
    fn in_memory_backend() {
        exercise(&InMemoryPersistence::new());
    }

    #[test]
    fn sqlite_backend() {
        let db = Database::open(":memory:").unwrap();
        exercise(&db);
        db.flush().unwrap();
    }
}
