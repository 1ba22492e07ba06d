use std::io::Cursor;
use std::sync::Arc;

use parking_lot::ReentrantMutex;
use rusqlite::{params, Connection, OptionalExtension};

use super::{BlobRead, BlobStore};
use crate::error::{BundleError, Result};

/// Blob store backed by the `<prefix>BINVAL` table on the engine's shared
/// connection. Statement access is serialized by the engine lock, which is
/// reentrant so writes issued mid-transaction land in that transaction.
pub struct DbBlobStore {
    conn: Arc<ReentrantMutex<Connection>>,
    insert: String,
    update: String,
    select: String,
    exists: String,
    delete: String,
}

impl DbBlobStore {
    pub fn new(conn: Arc<ReentrantMutex<Connection>>, prefix: &str) -> Self {
        Self {
            conn,
            insert: format!(
                "insert into {prefix}BINVAL (BINVAL_DATA, BINVAL_ID) values (?1, ?2)"
            ),
            update: format!("update {prefix}BINVAL set BINVAL_DATA = ?1 where BINVAL_ID = ?2"),
            select: format!("select BINVAL_DATA from {prefix}BINVAL where BINVAL_ID = ?1"),
            exists: format!("select 1 from {prefix}BINVAL where BINVAL_ID = ?1"),
            delete: format!("delete from {prefix}BINVAL where BINVAL_ID = ?1"),
        }
    }
}

impl BlobStore for DbBlobStore {
    fn put(&self, blob_id: &str, data: &[u8]) -> Result<()> {
        let conn = self.conn.lock();
        let exists = conn
            .prepare_cached(&self.exists)?
            .query_row(params![blob_id], |_| Ok(()))
            .optional()?
            .is_some();
        let sql = if exists { &self.update } else { &self.insert };
        conn.prepare_cached(sql)?.execute(params![data, blob_id])?;
        Ok(())
    }

    fn get(&self, blob_id: &str) -> Result<BlobRead> {
        let conn = self.conn.lock();
        // The row is buffered so the cursor is released before the reader is
        // handed out; some backends treat a zero-length value as NULL, which
        // comes back as an empty reader.
        let data: Option<Vec<u8>> = conn
            .prepare_cached(&self.select)?
            .query_row(params![blob_id], |row| row.get::<_, Option<Vec<u8>>>(0))
            .optional()?
            .ok_or_else(|| BundleError::Blob(format!("no such blob: {blob_id}")))?;
        Ok(BlobRead::Buffered(Cursor::new(data.unwrap_or_default())))
    }

    fn remove(&self, blob_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let removed = conn.prepare_cached(&self.delete)?.execute(params![blob_id])?;
        Ok(removed == 1)
    }
}
