//! Spool read positions persisted next to the monitor state
//!
//! A checkpoint names the byte offset of the first line that may not have
//! been processed yet, plus the inode of the file it belongs to. Resuming
//! from it can re-read a few lines; findings are idempotent, so that only
//! costs duplicate upserts.

use crate::fusion_core::db::{to_millis, Database};
use crate::fusion_core::error::StoreError;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpoolCheckpoint {
    pub inode: Option<u64>,
    pub offset: u64,
}

#[derive(Clone)]
pub struct SpoolCheckpointStore {
    db: Database,
}

impl SpoolCheckpointStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn load(&self, path: &Path) -> Result<Option<SpoolCheckpoint>, StoreError> {
        let key = path.to_string_lossy().to_string();
        self.db.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT inode, byte_offset FROM spool_offsets WHERE path = ?1",
                    [&key],
                    |row| Ok((row.get::<_, Option<i64>>(0)?, row.get::<_, i64>(1)?)),
                )
                .optional()?;
            // Inodes are stored bit-for-bit in a signed column
            Ok(row.map(|(inode, offset)| SpoolCheckpoint {
                inode: inode.map(|i| i as u64),
                offset: u64::try_from(offset).unwrap_or(0),
            }))
        })
    }

    pub fn save(&self, path: &Path, checkpoint: SpoolCheckpoint, now: DateTime<Utc>) -> Result<(), StoreError> {
        let key = path.to_string_lossy().to_string();
        let offset = i64::try_from(checkpoint.offset)
            .map_err(|_| StoreError::Corrupt(format!("spool offset out of range: {}", checkpoint.offset)))?;
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO spool_offsets (path, inode, byte_offset, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(path) DO UPDATE SET
                    inode = excluded.inode,
                    byte_offset = excluded.byte_offset,
                    updated_at = excluded.updated_at",
                params![key, checkpoint.inode.map(|i| i as i64), offset, to_millis(now)],
            )?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_and_load() {
        let store = SpoolCheckpointStore::new(Database::open_in_memory().unwrap());
        let path = Path::new("spool/findings.jsonl");
        assert_eq!(store.load(path).unwrap(), None);

        let first = SpoolCheckpoint {
            inode: Some(42),
            offset: 128,
        };
        store.save(path, first, Utc::now()).unwrap();
        assert_eq!(store.load(path).unwrap(), Some(first));

        let moved = SpoolCheckpoint {
            inode: Some(u64::MAX),
            offset: 7,
        };
        store.save(path, moved, Utc::now()).unwrap();
        assert_eq!(store.load(path).unwrap(), Some(moved));
        assert_eq!(store.load(Path::new("other.jsonl")).unwrap(), None);
    }
}
