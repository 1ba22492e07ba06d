pub mod blob;
pub mod codec;
pub mod db;
pub mod error;
pub mod model;

pub use crate::blob::{BlobRead, BlobStore, DbBlobStore, FsBlobStore};
pub use crate::codec::{BundleCodec, ErrorHandling, FileStringIndex, StringIndex};
pub use crate::db::{BundleDb, Config, ConsistencyReport, Finding, FindingKind, StorageModel};
pub use crate::error::{BundleError, Result};
pub use crate::model::{
    BinaryValue, ChangeLog, ChildEntry, Name, NodeId, NodePropBundle, NodeReferences,
    PropertyEntry, PropertyId, PropertyType, PropertyValue,
};
