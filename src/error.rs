use std::io;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::error;

pub type Result<T> = std::result::Result<T, BundleError>;

#[derive(Debug, Error)]
pub enum BundleError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("engine not initialized")]
    NotInitialized,
    #[error("engine already initialized")]
    AlreadyInitialized,
    #[error("schema error: {0}")]
    Schema(String),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),
    #[error("encoding failed: {0}")]
    Encoding(String),
    #[error("decoding failed: {0}")]
    Decoding(String),
    #[error("{0} not found")]
    NoSuchItem(String),
    #[error("blob store error: {0}")]
    Blob(String),
}

pub fn acquire_lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex.lock().map_err(|_| {
        error!("index lock poisoned - fatal error");
        BundleError::Io(io::Error::new(io::ErrorKind::Other, "index lock poisoned"))
    })
}
