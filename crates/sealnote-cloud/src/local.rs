//! Objects from a local directory tree
//!
//! `{root}/{container}/{key}`. Useful with a mounted bucket or when
//! replaying notifications against files on disk.

use async_trait::async_trait;
use sealnote_core::{FetchError, ObjectFetcher};
use std::io;
use std::path::{Component, Path, PathBuf};

pub struct LocalFetcher {
    root: PathBuf,
}

impl LocalFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `None` if either part would escape the root.
    fn resolve(&self, container: &str, key: &str) -> Option<PathBuf> {
        let plain = |part: &str| {
            !part.is_empty()
                && Path::new(part)
                    .components()
                    .all(|c| matches!(c, Component::Normal(_)))
        };
        (plain(container) && plain(key)).then(|| self.root.join(container).join(key))
    }
}

#[async_trait]
impl ObjectFetcher for LocalFetcher {
    async fn fetch(&self, container: &str, key: &str) -> Result<Vec<u8>, FetchError> {
        let Some(path) = self.resolve(container, key) else {
            tracing::warn!(container, key, "refusing object path outside the storage root");
            return Err(FetchError::not_found(container, key));
        };

        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(FetchError::not_found(container, key))
            }
            Err(e) => Err(FetchError::TransientIo(format!("{}: {e}", path.display()))),
        }
    }
}
