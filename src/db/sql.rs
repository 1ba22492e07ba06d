use rusqlite::types::Value;

use super::config::StorageModel;
use crate::model::NodeId;

/// The statement texts for the bundle and references tables, built once at
/// init from the sanitized prefix and storage model. Execution goes through
/// the connection's statement cache, so each text maps to one prepared
/// statement for the engine's lifetime.
pub(crate) struct StatementSet {
    pub bundle_insert: String,
    pub bundle_update: String,
    pub bundle_select: String,
    pub bundle_delete: String,
    pub refs_insert: String,
    pub refs_update: String,
    pub refs_select: String,
    pub refs_delete: String,
    pub bundle_scan: String,
    model: StorageModel,
}

impl StatementSet {
    pub fn new(prefix: &str, model: StorageModel) -> Self {
        match model {
            StorageModel::BinaryKeys => Self {
                bundle_insert: format!(
                    "insert into {prefix}BUNDLE (BUNDLE_DATA, NODE_ID) values (?1, ?2)"
                ),
                bundle_update: format!(
                    "update {prefix}BUNDLE set BUNDLE_DATA = ?1 where NODE_ID = ?2"
                ),
                bundle_select: format!("select BUNDLE_DATA from {prefix}BUNDLE where NODE_ID = ?1"),
                bundle_delete: format!("delete from {prefix}BUNDLE where NODE_ID = ?1"),
                refs_insert: format!(
                    "insert into {prefix}REFS (REFS_DATA, NODE_ID) values (?1, ?2)"
                ),
                refs_update: format!("update {prefix}REFS set REFS_DATA = ?1 where NODE_ID = ?2"),
                refs_select: format!("select REFS_DATA from {prefix}REFS where NODE_ID = ?1"),
                refs_delete: format!("delete from {prefix}REFS where NODE_ID = ?1"),
                bundle_scan: format!("select NODE_ID, BUNDLE_DATA from {prefix}BUNDLE"),
                model,
            },
            StorageModel::SplitLong => Self {
                bundle_insert: format!(
                    "insert into {prefix}BUNDLE (BUNDLE_DATA, NODE_ID_HI, NODE_ID_LO) values (?1, ?2, ?3)"
                ),
                bundle_update: format!(
                    "update {prefix}BUNDLE set BUNDLE_DATA = ?1 where NODE_ID_HI = ?2 and NODE_ID_LO = ?3"
                ),
                bundle_select: format!(
                    "select BUNDLE_DATA from {prefix}BUNDLE where NODE_ID_HI = ?1 and NODE_ID_LO = ?2"
                ),
                bundle_delete: format!(
                    "delete from {prefix}BUNDLE where NODE_ID_HI = ?1 and NODE_ID_LO = ?2"
                ),
                refs_insert: format!(
                    "insert into {prefix}REFS (REFS_DATA, NODE_ID_HI, NODE_ID_LO) values (?1, ?2, ?3)"
                ),
                refs_update: format!(
                    "update {prefix}REFS set REFS_DATA = ?1 where NODE_ID_HI = ?2 and NODE_ID_LO = ?3"
                ),
                refs_select: format!(
                    "select REFS_DATA from {prefix}REFS where NODE_ID_HI = ?1 and NODE_ID_LO = ?2"
                ),
                refs_delete: format!(
                    "delete from {prefix}REFS where NODE_ID_HI = ?1 and NODE_ID_LO = ?2"
                ),
                bundle_scan: format!(
                    "select NODE_ID_HI, NODE_ID_LO, BUNDLE_DATA from {prefix}BUNDLE"
                ),
                model,
            },
        }
    }

    /// Key parameters for `id` in the shape the storage model binds.
    pub fn key_values(&self, id: NodeId) -> Vec<Value> {
        match self.model {
            StorageModel::BinaryKeys => vec![Value::Blob(id.as_bytes().to_vec())],
            StorageModel::SplitLong => {
                let (hi, lo) = id.halves();
                vec![Value::Integer(hi as i64), Value::Integer(lo as i64)]
            }
        }
    }

    pub fn model(&self) -> StorageModel {
        self.model
    }
}
