use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::ReentrantMutex;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};
use tracing::{debug, error, info};

use super::config::Config;
use super::schema;
use super::sql::StatementSet;
use crate::blob::{BlobStore, DbBlobStore, FsBlobStore};
use crate::codec::{BundleCodec, FileStringIndex, StringIndex};
use crate::error::{BundleError, Result};
use crate::model::{ChangeLog, NodeId, NodePropBundle, NodeReferences};

/// Bundle persistence engine over a single database connection.
///
/// All database access is serialized through one engine-wide lock. The lock
/// is reentrant so the database-resident blob store, which shares the
/// connection, can be driven from inside an open change-log transaction.
pub struct BundleDb {
    pub(crate) conn: Arc<ReentrantMutex<Connection>>,
    pub(crate) sql: StatementSet,
    pub(crate) codec: BundleCodec,
    blobs: Arc<dyn BlobStore>,
    ns_index: Arc<dyn StringIndex>,
    name_index: Arc<dyn StringIndex>,
    pub(crate) name: String,
    lock_path: PathBuf,
}

impl BundleDb {
    /// Opens the engine: connects, sanitizes the prefix, bootstraps the
    /// schema, opens the string indexes and blob store, and optionally runs
    /// the consistency check.
    pub fn init(config: Config) -> Result<Self> {
        fs::create_dir_all(&config.home)?;
        let lock_path = config.home.join(".lock");
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
        {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(BundleError::AlreadyInitialized);
            }
            Err(e) => return Err(e.into()),
        }
        match Self::open(config, lock_path.clone()) {
            Ok(engine) => Ok(engine),
            Err(e) => {
                let _ = fs::remove_file(&lock_path);
                Err(e)
            }
        }
    }

    fn open(config: Config, lock_path: PathBuf) -> Result<Self> {
        let name = config
            .home
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "bundledb".to_string());
        info!(
            name = %name,
            driver = %config.driver,
            url = %config.url,
            "initializing bundle persistence engine"
        );

        let conn = Connection::open(&config.url).map_err(|e| {
            BundleError::Connection(format!("failed to open '{}': {e}", config.url))
        })?;

        let prefix = schema::sanitize_prefix(&config.schema_object_prefix);
        schema::bootstrap(&conn, &config.schema, &prefix, !config.external_blobs)?;

        let ns_index: Arc<dyn StringIndex> =
            Arc::new(FileStringIndex::open(config.home.join("ns.idx"))?);
        let name_index: Arc<dyn StringIndex> =
            Arc::new(FileStringIndex::open(config.home.join("names.idx"))?);

        let conn = Arc::new(ReentrantMutex::new(conn));
        let blobs: Arc<dyn BlobStore> = if config.external_blobs {
            Arc::new(FsBlobStore::open(config.home.join("blobs"))?)
        } else {
            Arc::new(DbBlobStore::new(conn.clone(), &prefix))
        };

        let codec = BundleCodec::new(
            blobs.clone(),
            ns_index.clone(),
            name_index.clone(),
            config.min_blob_size,
            config.error_handling,
        );

        let engine = Self {
            conn,
            sql: StatementSet::new(&prefix, config.storage_model),
            codec,
            blobs,
            ns_index,
            name_index,
            name,
            lock_path,
        };

        if config.consistency_check {
            let report = engine.check_consistency(config.consistency_fix)?;
            if !report.findings.is_empty() {
                error!(
                    name = %engine.name,
                    findings = report.findings.len(),
                    fixed = report.fixed,
                    "consistency check found problems"
                );
            }
        }
        Ok(engine)
    }

    /// Flushes and releases everything the engine holds: statements, blob
    /// store, string indexes, connection, in that order.
    pub fn close(self) -> Result<()> {
        info!(name = %self.name, "closing bundle persistence engine");
        Ok(())
    }

    pub fn blob_store(&self) -> &Arc<dyn BlobStore> {
        &self.blobs
    }

    pub fn ns_index(&self) -> &Arc<dyn StringIndex> {
        &self.ns_index
    }

    pub fn name_index(&self) -> &Arc<dyn StringIndex> {
        &self.name_index
    }

    /// Applies a change log as one database transaction: bundle deletions,
    /// reference-set deletions, bundle upserts, reference-set upserts. The
    /// log is applied atomically or not at all.
    pub fn store(&self, log: &ChangeLog) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch("begin immediate")
            .map_err(BundleError::Store)?;
        match self.apply(&conn, log) {
            Ok(()) => {
                conn.execute_batch("commit").map_err(BundleError::Store)?;
                Ok(())
            }
            Err(e) => {
                if let Err(rollback) = conn.execute_batch("rollback") {
                    error!(name = %self.name, error = %rollback, "rollback of change log failed");
                }
                Err(e)
            }
        }
    }

    fn apply(&self, conn: &Connection, log: &ChangeLog) -> Result<()> {
        for bundle in &log.deleted {
            self.destroy_bundle_in(conn, bundle)?;
        }
        for refs in &log.modified_refs {
            if refs.is_empty() {
                self.destroy_references_in(conn, refs.target)?;
            }
        }
        for bundle in &log.added {
            self.write_bundle(conn, bundle, true)?;
        }
        for bundle in &log.modified {
            self.write_bundle(conn, bundle, false)?;
        }
        for refs in &log.modified_refs {
            if !refs.is_empty() {
                self.store_references_in(conn, refs)?;
            }
        }
        Ok(())
    }

    pub fn load_bundle(&self, id: NodeId) -> Result<Option<NodePropBundle>> {
        let conn = self.conn.lock();
        self.load_bundle_in(&conn, id)
    }

    pub(crate) fn load_bundle_in(
        &self,
        conn: &Connection,
        id: NodeId,
    ) -> Result<Option<NodePropBundle>> {
        let mut stmt = conn.prepare_cached(&self.sql.bundle_select)?;
        let mut rows = stmt.query(params_from_iter(self.sql.key_values(id)))?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        // Pre-buffer the whole payload so the cursor is released before
        // decoding starts.
        let payload: Vec<u8> = row.get(0)?;
        drop(rows);
        let mut bundle = self.codec.decode(&payload, id).map_err(|e| {
            error!(name = %self.name, bundle = %id, error = %e, "failed to read bundle");
            e
        })?;
        bundle.size_hint = payload.len() as u64;
        Ok(Some(bundle))
    }

    pub fn exists_bundle(&self, id: NodeId) -> Result<bool> {
        let conn = self.conn.lock();
        self.exists_bundle_in(&conn, id)
    }

    pub(crate) fn exists_bundle_in(&self, conn: &Connection, id: NodeId) -> Result<bool> {
        let mut stmt = conn.prepare_cached(&self.sql.bundle_select)?;
        let mut rows = stmt.query(params_from_iter(self.sql.key_values(id)))?;
        Ok(rows.next()?.is_some())
    }

    /// Stores one bundle outside a change log; insert vs update follows the
    /// bundle's `is_new` flag.
    pub fn store_bundle(&self, bundle: &NodePropBundle) -> Result<()> {
        let conn = self.conn.lock();
        self.write_bundle(&conn, bundle, bundle.is_new)
    }

    pub(crate) fn write_bundle(
        &self,
        conn: &Connection,
        bundle: &NodePropBundle,
        is_new: bool,
    ) -> Result<()> {
        let payload = self.codec.encode(bundle).map_err(|e| {
            error!(name = %self.name, bundle = %bundle.id, error = %e, "failed to write bundle");
            e
        })?;
        let sql = if is_new {
            &self.sql.bundle_insert
        } else {
            &self.sql.bundle_update
        };
        let mut params = vec![Value::Blob(payload)];
        params.extend(self.sql.key_values(bundle.id));
        let changed = conn.prepare_cached(sql)?.execute(params_from_iter(params))?;
        if !is_new && changed == 0 {
            return Err(BundleError::NoSuchItem(format!("bundle {}", bundle.id)));
        }
        Ok(())
    }

    /// Deletes a bundle row and removes every blob its binary properties
    /// externalized.
    pub fn destroy_bundle(&self, bundle: &NodePropBundle) -> Result<()> {
        let conn = self.conn.lock();
        self.destroy_bundle_in(&conn, bundle)
    }

    pub(crate) fn destroy_bundle_in(
        &self,
        conn: &Connection,
        bundle: &NodePropBundle,
    ) -> Result<()> {
        conn.prepare_cached(&self.sql.bundle_delete)?
            .execute(params_from_iter(self.sql.key_values(bundle.id)))?;
        for blob_id in self.codec.blob_ids(bundle) {
            if !self.blobs.remove(&blob_id)? {
                debug!(name = %self.name, blob_id = %blob_id, "blob already gone on bundle destroy");
            }
        }
        Ok(())
    }

    pub fn load_references(&self, target: NodeId) -> Result<NodeReferences> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&self.sql.refs_select)?;
        let mut rows = stmt.query(params_from_iter(self.sql.key_values(target)))?;
        let Some(row) = rows.next()? else {
            return Err(BundleError::NoSuchItem(format!("references to {target}")));
        };
        let payload: Vec<u8> = row.get(0)?;
        drop(rows);
        decode_references(&payload, target)
    }

    pub fn exists_references(&self, target: NodeId) -> Result<bool> {
        let conn = self.conn.lock();
        self.exists_references_in(&conn, target)
    }

    fn exists_references_in(&self, conn: &Connection, target: NodeId) -> Result<bool> {
        let mut stmt = conn.prepare_cached(&self.sql.refs_select)?;
        let mut rows = stmt.query(params_from_iter(self.sql.key_values(target)))?;
        Ok(rows.next()?.is_some())
    }

    pub fn store_references(&self, refs: &NodeReferences) -> Result<()> {
        let conn = self.conn.lock();
        self.store_references_in(&conn, refs)
    }

    fn store_references_in(&self, conn: &Connection, refs: &NodeReferences) -> Result<()> {
        let sql = if self.exists_references_in(conn, refs.target)? {
            &self.sql.refs_update
        } else {
            &self.sql.refs_insert
        };
        let mut params = vec![Value::Blob(encode_references(refs))];
        params.extend(self.sql.key_values(refs.target));
        conn.prepare_cached(sql)?.execute(params_from_iter(params))?;
        Ok(())
    }

    pub fn destroy_references(&self, target: NodeId) -> Result<()> {
        let conn = self.conn.lock();
        self.destroy_references_in(&conn, target)
    }

    fn destroy_references_in(&self, conn: &Connection, target: NodeId) -> Result<()> {
        conn.prepare_cached(&self.sql.refs_delete)?
            .execute(params_from_iter(self.sql.key_values(target)))?;
        Ok(())
    }
}

impl Drop for BundleDb {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.lock_path);
    }
}

fn encode_references(refs: &NodeReferences) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64);
    buf.extend_from_slice(&(refs.references.len() as u32).to_be_bytes());
    for property_id in &refs.references {
        buf.extend_from_slice(&(property_id.len() as u32).to_be_bytes());
        buf.extend_from_slice(property_id.as_bytes());
    }
    buf
}

fn decode_references(bytes: &[u8], target: NodeId) -> Result<NodeReferences> {
    let too_short =
        || BundleError::Decoding(format!("truncated references payload for {target}"));
    let mut refs = NodeReferences::new(target);
    let count_bytes: [u8; 4] = bytes
        .get(..4)
        .ok_or_else(too_short)?
        .try_into()
        .expect("slice has exactly 4 bytes");
    let count = u32::from_be_bytes(count_bytes) as usize;
    let mut pos = 4;
    for _ in 0..count {
        let len_bytes: [u8; 4] = bytes
            .get(pos..pos + 4)
            .ok_or_else(too_short)?
            .try_into()
            .expect("slice has exactly 4 bytes");
        let len = u32::from_be_bytes(len_bytes) as usize;
        pos += 4;
        let raw = bytes.get(pos..pos + len).ok_or_else(too_short)?;
        pos += len;
        let property_id = std::str::from_utf8(raw).map_err(|_| {
            BundleError::Decoding(format!("references payload for {target} is not valid UTF-8"))
        })?;
        refs.references.push(property_id.to_string());
    }
    if pos != bytes.len() {
        return Err(BundleError::Decoding(format!(
            "trailing bytes in references payload for {target}"
        )));
    }
    Ok(refs)
}
