//! Transactional key-value store with named buckets, backed by SQLite.
//!
//! All buckets share one `entries (bucket, key, value)` table. A bucket exists
//! as long as it holds an entry. Read transactions see a consistent snapshot.
//! Update transactions run inside a single SQL transaction that is committed
//! only when the closure returns `Ok`, so a failed transaction leaves no
//! trace.
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::{path::Path, sync::Mutex};
use thiserror::Error;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS entries (
    bucket TEXT NOT NULL,
    key    BLOB NOT NULL,
    value  BLOB NOT NULL,
    PRIMARY KEY (bucket, key)
) WITHOUT ROWID;";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Sql(#[from] rusqlite::Error),
    #[error("Stored value could not be decoded: {0}")]
    Codec(String),
    #[error("The store lock was poisoned.")]
    Poisoned,
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self { Self::Codec(e.to_string()) }
}

/// Read access shared by both kinds of transaction.
pub trait BucketRead {
    #[doc(hidden)]
    fn connection(&self) -> &Connection;

    fn get(&self, bucket: &str, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let value = self
            .connection()
            .prepare_cached("SELECT value FROM entries WHERE bucket = ?1 AND key = ?2")?
            .query_row(params![bucket, key], |row| row.get(0))
            .optional()?;
        Ok(value)
    }

    fn has_bucket(&self, bucket: &str) -> Result<bool, StoreError> {
        let found = self
            .connection()
            .prepare_cached("SELECT 1 FROM entries WHERE bucket = ?1 LIMIT 1")?
            .exists(params![bucket])?;
        Ok(found)
    }

    /// Names of all non-empty buckets, in order.
    fn bucket_names(&self) -> Result<Vec<String>, StoreError> {
        let mut stmt = self
            .connection()
            .prepare_cached("SELECT DISTINCT bucket FROM entries ORDER BY bucket")?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(names)
    }

    /// All entries of a bucket in key order. A missing bucket is empty.
    fn entries(&self, bucket: &str) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let mut stmt = self
            .connection()
            .prepare_cached("SELECT key, value FROM entries WHERE bucket = ?1 ORDER BY key")?;
        let entries = stmt
            .query_map(params![bucket], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<(Vec<u8>, Vec<u8>)>, _>>()?;
        Ok(entries)
    }

    /// The value stored under `key` in every bucket that has one, by bucket
    /// name.
    fn find(&self, key: &[u8]) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let mut stmt = self
            .connection()
            .prepare_cached("SELECT bucket, value FROM entries WHERE key = ?1 ORDER BY bucket")?;
        let found = stmt
            .query_map(params![key], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<(String, Vec<u8>)>, _>>()?;
        Ok(found)
    }
}

pub struct ReadTransaction<'a> {
    conn: &'a Connection,
}

impl BucketRead for ReadTransaction<'_> {
    fn connection(&self) -> &Connection { self.conn }
}

pub struct Transaction<'a> {
    conn: &'a Connection,
}

impl BucketRead for Transaction<'_> {
    fn connection(&self) -> &Connection { self.conn }
}

impl Transaction<'_> {
    /// Insert or replace a value, creating the bucket if needed.
    pub fn put(&mut self, bucket: &str, key: &[u8], value: Vec<u8>) -> Result<(), StoreError> {
        self.conn
            .prepare_cached("INSERT OR REPLACE INTO entries (bucket, key, value) VALUES (?1, ?2, ?3)")?
            .execute(params![bucket, key, value])?;
        Ok(())
    }

    /// Remove a value, returning it if it was present.
    pub fn delete(&mut self, bucket: &str, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let old = self.get(bucket, key)?;
        if old.is_some() {
            self.conn
                .prepare_cached("DELETE FROM entries WHERE bucket = ?1 AND key = ?2")?
                .execute(params![bucket, key])?;
        }
        Ok(old)
    }
}

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// A database that lives only as long as the process.
    pub fn in_memory() -> Result<Self, StoreError> { Self::init(Connection::open_in_memory()?) }

    /// Open, or create, a database persisted at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let db = Self::init(Connection::open(path)?)?;
        tracing::debug!(target: "gpchain_store", "Opened store at {}.", path.display());
        Ok(db)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn view<R, E: From<StoreError>>(
        &self,
        f: impl FnOnce(&ReadTransaction<'_>) -> Result<R, E>,
    ) -> Result<R, E> {
        let mut conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        // Dropping the transaction rolls it back, there is nothing to keep.
        let tx = conn.transaction().map_err(StoreError::from)?;
        let result = f(&ReadTransaction { conn: &tx });
        result
    }

    /// Run `f` in an exclusive read-write transaction. All of its writes are
    /// committed together, or none are if it fails.
    pub fn update<R, E: From<StoreError>>(
        &self,
        f: impl FnOnce(&mut Transaction<'_>) -> Result<R, E>,
    ) -> Result<R, E> {
        let mut conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StoreError::from)?;
        let result = f(&mut Transaction { conn: &tx })?;
        tx.commit().map_err(StoreError::from)?;
        Ok(result)
    }

    /// Release the database, flushing it if persistent.
    pub fn close(self) -> Result<(), StoreError> {
        let conn = self.conn.into_inner().map_err(|_| StoreError::Poisoned)?;
        conn.close().map_err(|(_, e)| e.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_update_leaves_no_trace() {
        let db = Database::in_memory().expect("Store.");
        db.update(|tx| tx.put("alice", b"k1", b"v1".to_vec())).expect("Commit.");
        let res = db.update(|tx| {
            tx.put("alice", b"k1", b"changed".to_vec())?;
            tx.put("bob", b"k2", b"v2".to_vec())?;
            Err::<(), _>(StoreError::Codec("abort".into()))
        });
        assert!(res.is_err());
        db.view(|tx| {
            assert_eq!(tx.get("alice", b"k1")?, Some(b"v1".to_vec()));
            assert!(!tx.has_bucket("bob")?);
            Ok::<_, StoreError>(())
        })
        .expect("View.");
    }

    #[test]
    fn entries_and_deletes() {
        let db = Database::in_memory().expect("Store.");
        db.update(|tx| {
            tx.put("b", b"2", b"two".to_vec())?;
            tx.put("b", b"1", b"one".to_vec())?;
            tx.put("c", b"1", b"other".to_vec())?;
            assert_eq!(tx.delete("missing", b"1")?, None);
            Ok::<_, StoreError>(())
        })
        .expect("Commit.");
        db.view(|tx| {
            let keys: Vec<_> = tx.entries("b")?.into_iter().map(|(k, _)| k).collect();
            assert_eq!(keys, vec![b"1".to_vec(), b"2".to_vec()]);
            assert!(tx.entries("nothing")?.is_empty());
            assert_eq!(tx.bucket_names()?, vec!["b", "c"]);
            assert_eq!(tx.find(b"1")?, vec![
                ("b".to_string(), b"one".to_vec()),
                ("c".to_string(), b"other".to_vec())
            ]);
            Ok::<_, StoreError>(())
        })
        .expect("View.");
        assert_eq!(db.update(|tx| tx.delete("b", b"1")).expect("Delete."), Some(b"one".to_vec()));
        assert_eq!(db.view(|tx| Ok::<_, StoreError>(tx.entries("b")?.len())).expect("View."), 1);
    }

    #[test]
    fn data_survives_reopen() {
        let dir = tempfile::tempdir().expect("Temporary directory.");
        let path = dir.path().join("store.sqlite");
        {
            let db = Database::open(&path).expect("Open.");
            db.update(|tx| tx.put("alice", &[0, 1, 2], vec![255, 0])).expect("Commit.");
            // Rolled back, never reaches the file.
            let _ = db.update(|tx| {
                tx.put("bob", &[1], vec![1])?;
                Err::<(), _>(StoreError::Codec("abort".into()))
            });
            db.close().expect("Close.");
        }
        let db = Database::open(&path).expect("Reopen.");
        db.view(|tx| {
            assert_eq!(tx.get("alice", &[0, 1, 2])?, Some(vec![255u8, 0]));
            assert_eq!(tx.bucket_names()?, vec!["alice"]);
            Ok::<_, StoreError>(())
        })
        .expect("View.");
    }
}
