mod config;
mod consistency;
mod engine;
mod schema;
mod sql;

pub use config::{Config, StorageModel};
pub use consistency::{ConsistencyReport, Finding, FindingKind};
pub use engine::BundleDb;
pub use schema::SCHEMA_OBJECT_PREFIX_VARIABLE;
