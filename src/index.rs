use std::fs;
use std::io;
use std::path::Path;

use chrono::Utc;
use log::debug;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

use crate::core::hash::Fingerprint;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("fingerprint already maps to {existing}")]
    DuplicateKey { existing: String },
}

/// Durable mapping of content fingerprints to archive-relative paths.
///
/// Entries are append-only within a run: re-inserting the same mapping is
/// a no-op, a key that already maps elsewhere is a conflict and is never
/// overwritten.
pub struct IndexStore {
    conn: Connection,
}

impl IndexStore {
    /// Opens the store, creating the schema if needed. A failure here is
    /// fatal for the run.
    pub fn open(db_path: &Path) -> Result<Self, IndexError> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        conn.query_row("PRAGMA journal_mode=WAL;", [], |_| Ok(()))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS hash_lib (
                md5 TEXT NOT NULL,
                size INTEGER NOT NULL,
                method TEXT NOT NULL,
                rel_path TEXT NOT NULL,
                added_at INTEGER NOT NULL,
                PRIMARY KEY (md5, size, method)
            );
            CREATE INDEX IF NOT EXISTS idx_hash_lib_rel_path ON hash_lib(rel_path);",
        )?;
        Ok(Self { conn })
    }

    pub fn lookup(&self, fp: &Fingerprint) -> Result<Option<String>, IndexError> {
        let found = self
            .conn
            .query_row(
                "SELECT rel_path FROM hash_lib WHERE md5=?1 AND size=?2 AND method=?3",
                params![fp.digest, fp.size as i64, fp.method.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found)
    }

    pub fn insert(&self, fp: &Fingerprint, rel_path: &str) -> Result<(), IndexError> {
        if let Some(existing) = self.lookup(fp)? {
            if existing == rel_path {
                return Ok(());
            }
            return Err(IndexError::DuplicateKey { existing });
        }
        self.conn.execute(
            "INSERT INTO hash_lib (md5, size, method, rel_path, added_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                fp.digest,
                fp.size as i64,
                fp.method.as_str(),
                rel_path,
                Utc::now().timestamp()
            ],
        )?;
        Ok(())
    }

    pub fn remove(&self, fp: &Fingerprint) -> Result<(), IndexError> {
        self.conn.execute(
            "DELETE FROM hash_lib WHERE md5=?1 AND size=?2 AND method=?3",
            params![fp.digest, fp.size as i64, fp.method.as_str()],
        )?;
        Ok(())
    }

    /// Drops entries whose archived file no longer exists under `dest`.
    /// Returns the number of rows purged.
    pub fn purge_stale(&self, dest: &Path) -> Result<usize, IndexError> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT rel_path FROM hash_lib")?;
        let rel_paths = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);

        let mut purged = 0;
        for rel in rel_paths {
            if !dest.join(&rel).exists() {
                purged += self
                    .conn
                    .execute("DELETE FROM hash_lib WHERE rel_path=?1", params![rel])?;
                debug!("purged stale index entry {rel}");
            }
        }
        Ok(purged)
    }

    pub fn len(&self) -> Result<u64, IndexError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM hash_lib", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn is_empty(&self) -> Result<bool, IndexError> {
        Ok(self.len()? == 0)
    }
}
