use rusqlite::Connection;
use serde::Serialize;
use tracing::{error, info, warn};

use super::config::StorageModel;
use super::engine::BundleDb;
use crate::error::{BundleError, Result};
use crate::model::{BinaryValue, NodeId, NodePropBundle, PropertyValue};

#[derive(Clone, Copy, Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    /// A child entry points at an id with no bundle row.
    MissingChild,
    /// A loaded child's parent pointer does not point back.
    WrongParent,
    /// A non-root bundle's parent has no bundle row.
    MissingParent,
    /// A binary value references a blob id the blob store cannot resolve.
    MissingBlob,
    /// The bundle payload could not be decoded.
    Undecodable,
}

#[derive(Clone, Debug, Serialize)]
pub struct Finding {
    pub kind: FindingKind,
    pub bundle: String,
    pub message: String,
}

/// Result of a full consistency scan.
#[derive(Clone, Debug, Default, Serialize)]
pub struct ConsistencyReport {
    pub checked: u64,
    pub total: u64,
    pub fixed: u64,
    pub findings: Vec<Finding>,
}

impl BundleDb {
    /// Scans every bundle and verifies parent/child integrity. With `fix`,
    /// child entries pointing at missing bundles are removed and each
    /// repaired bundle is rewritten in its own transaction, so one failed
    /// repair cannot take the others down with it.
    pub fn check_consistency(&self, fix: bool) -> Result<ConsistencyReport> {
        let conn = self.conn.lock();
        let mut report = ConsistencyReport::default();
        let mut repairs: Vec<NodePropBundle> = Vec::new();

        info!(name = %self.name, "checking workspace consistency...");
        {
            let mut stmt = conn.prepare_cached(&self.sql.bundle_scan)?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let (id, payload) = match self.sql.model() {
                    StorageModel::BinaryKeys => {
                        let raw: Vec<u8> = row.get(0)?;
                        let bytes: [u8; 16] = raw.try_into().map_err(|_| {
                            BundleError::Decoding("bundle key is not 16 bytes".into())
                        })?;
                        (NodeId::from_bytes(bytes), row.get::<_, Vec<u8>>(1)?)
                    }
                    StorageModel::SplitLong => {
                        let hi: i64 = row.get(0)?;
                        let lo: i64 = row.get(1)?;
                        (
                            NodeId::from_halves(hi as u64, lo as u64),
                            row.get::<_, Vec<u8>>(2)?,
                        )
                    }
                };

                match self.codec.decode(&payload, id) {
                    Ok(bundle) => {
                        self.check_bundle(&conn, &bundle, fix, &mut report, &mut repairs)?;
                    }
                    Err(e) => {
                        error!(name = %self.name, bundle = %id, error = %e, "error in bundle");
                        let message = match self.codec.check(&payload) {
                            Err(failure) => {
                                error!(
                                    name = %self.name,
                                    bundle = %id,
                                    offset = failure.offset,
                                    reason = %failure.reason,
                                    "bundle payload is malformed"
                                );
                                failure.to_string()
                            }
                            Ok(()) => e.to_string(),
                        };
                        report.findings.push(Finding {
                            kind: FindingKind::Undecodable,
                            bundle: id.to_string(),
                            message,
                        });
                    }
                }

                report.checked += 1;
                if report.checked % 1000 == 0 {
                    info!(
                        name = %self.name,
                        "checked {}/{} bundles...",
                        report.checked,
                        report.total
                    );
                }
            }
        }

        if fix && !repairs.is_empty() {
            info!(
                name = %self.name,
                "fixing {} inconsistent bundle(s)...",
                repairs.len()
            );
            for mut bundle in repairs {
                info!(name = %self.name, bundle = %bundle.id, "fixing bundle");
                bundle.mark_old();
                match self.repair_bundle(&conn, &bundle) {
                    Ok(()) => report.fixed += 1,
                    Err(e) => {
                        error!(
                            name = %self.name,
                            bundle = %bundle.id,
                            error = %e,
                            "error storing fixed bundle"
                        );
                    }
                }
            }
        }

        info!(
            name = %self.name,
            "checked {}/{} bundles.",
            report.checked,
            report.total
        );
        Ok(report)
    }

    fn check_bundle(
        &self,
        conn: &Connection,
        bundle: &NodePropBundle,
        fix: bool,
        report: &mut ConsistencyReport,
        repairs: &mut Vec<NodePropBundle>,
    ) -> Result<()> {
        let id = bundle.id;
        let mut missing: Vec<usize> = Vec::new();

        if !id.is_sentinel() {
            for (pos, child) in bundle.child_entries.iter().enumerate() {
                if child.id.is_sentinel() {
                    continue;
                }
                match self.load_bundle_in(conn, child.id) {
                    Ok(None) => {
                        error!(
                            name = %self.name,
                            bundle = %id,
                            child = %child.id,
                            "bundle references inexistent child"
                        );
                        report.findings.push(Finding {
                            kind: FindingKind::MissingChild,
                            bundle: id.to_string(),
                            message: format!("missing child {}", child.id),
                        });
                        missing.push(pos);
                    }
                    Ok(Some(loaded)) => match loaded.parent_id {
                        Some(parent) if parent == id => {}
                        Some(parent) => {
                            error!(
                                name = %self.name,
                                child = %child.id,
                                parent = %parent,
                                expected = %id,
                                "child has wrong parent"
                            );
                            report.findings.push(Finding {
                                kind: FindingKind::WrongParent,
                                bundle: id.to_string(),
                                message: format!(
                                    "child {} has parent {} (instead of {})",
                                    child.id, parent, id
                                ),
                            });
                        }
                        None => {
                            error!(
                                name = %self.name,
                                child = %child.id,
                                "child has no parent pointer"
                            );
                            report.findings.push(Finding {
                                kind: FindingKind::WrongParent,
                                bundle: id.to_string(),
                                message: format!("child {} has no parent pointer", child.id),
                            });
                        }
                    },
                    Err(e) => {
                        error!(
                            name = %self.name,
                            child = %child.id,
                            error = %e,
                            "error while loading child node"
                        );
                    }
                }
            }
        }

        if fix && !missing.is_empty() {
            let mut repaired = bundle.clone();
            for &pos in missing.iter().rev() {
                repaired.child_entries.remove(pos);
            }
            repairs.push(repaired);
        }

        for entry in &bundle.properties {
            for value in &entry.values {
                let PropertyValue::Binary(BinaryValue::External(blob_id)) = value else {
                    continue;
                };
                if self.blob_store().get(blob_id).is_ok() {
                    continue;
                }
                if self.codec.error_handling().ignore_missing_blobs() {
                    warn!(
                        name = %self.name,
                        bundle = %id,
                        blob_id = %blob_id,
                        "tolerating unresolvable blob id"
                    );
                } else {
                    error!(
                        name = %self.name,
                        bundle = %id,
                        blob_id = %blob_id,
                        "binary value references unresolvable blob id"
                    );
                    report.findings.push(Finding {
                        kind: FindingKind::MissingBlob,
                        bundle: id.to_string(),
                        message: format!("missing blob {blob_id}"),
                    });
                }
            }
        }

        if let Some(parent) = bundle.parent_id {
            if !self.exists_bundle_in(conn, parent)? {
                error!(
                    name = %self.name,
                    bundle = %id,
                    parent = %parent,
                    "bundle references inexistent parent"
                );
                report.findings.push(Finding {
                    kind: FindingKind::MissingParent,
                    bundle: id.to_string(),
                    message: format!("missing parent {parent}"),
                });
            }
        }
        Ok(())
    }

    fn repair_bundle(&self, conn: &Connection, bundle: &NodePropBundle) -> Result<()> {
        conn.execute_batch("begin immediate")
            .map_err(BundleError::Store)?;
        match self.write_bundle(conn, bundle, false) {
            Ok(()) => conn.execute_batch("commit").map_err(BundleError::Store),
            Err(e) => {
                let _ = conn.execute_batch("rollback");
                Err(e)
            }
        }
    }
}
