//! Object fetching
//!
//! The pipeline only needs to tell "this object will never exist" apart
//! from "try again later".

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("Object {container}/{key} not found")]
    NotFound { container: String, key: String },

    #[error("Transient I/O error fetching object: {0}")]
    TransientIo(String),
}

impl FetchError {
    pub fn not_found(container: &str, key: &str) -> Self {
        FetchError::NotFound {
            container: container.to_string(),
            key: key.to_string(),
        }
    }
}

/// Resolves a (container, key) reference to the stored bytes
#[async_trait]
pub trait ObjectFetcher: Send + Sync {
    async fn fetch(&self, container: &str, key: &str) -> Result<Vec<u8>, FetchError>;
}

/// In-process object store, for tests and embedding. A poisoned lock is
/// recovered: the map holds no invariant a panicking writer could break.
#[derive(Default)]
pub struct MemoryFetcher {
    objects: RwLock<HashMap<(String, String), Vec<u8>>>,
}

impl MemoryFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, container: &str, key: &str, bytes: Vec<u8>) {
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((container.to_string(), key.to_string()), bytes);
    }
}

#[async_trait]
impl ObjectFetcher for MemoryFetcher {
    async fn fetch(&self, container: &str, key: &str) -> Result<Vec<u8>, FetchError> {
        let objects = self.objects.read().unwrap_or_else(PoisonError::into_inner);

        objects
            .get(&(container.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| FetchError::not_found(container, key))
    }
}
