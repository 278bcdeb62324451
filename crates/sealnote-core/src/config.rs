//! Receiver configuration
//!
//! Built by the binary from flags and environment. Validation happens once
//! at startup; any error here means the process does not start.

use sealnote_crypto::{KeyError, ReceiverKey};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Private key not found at {}", .0.display())]
    MissingPrivateKey(PathBuf),

    #[error("Subscription must not be empty")]
    EmptySubscription,

    #[error("max_concurrency must be at least 1")]
    ZeroConcurrency,

    #[error("{0} must be greater than zero")]
    ZeroTimeout(&'static str),

    #[error(transparent)]
    Key(#[from] KeyError),
}

/// Knobs for the listener loop and its stages
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSettings {
    /// Notifications processed at once
    pub max_concurrency: usize,
    pub fetch_timeout: Duration,
    pub dispatch_timeout: Duration,
    /// Pause after a failed receive before asking the transport again
    pub poll_backoff: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            fetch_timeout: Duration::from_secs(30),
            dispatch_timeout: Duration::from_secs(10),
            poll_backoff: Duration::from_secs(2),
        }
    }
}

impl PipelineSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        if self.fetch_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout("fetch_timeout"));
        }
        if self.dispatch_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout("dispatch_timeout"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    pub private_key_path: PathBuf,
    /// Subscription delivering object notifications
    pub subscription: String,
    pub output_dir: PathBuf,
    pub settings: PipelineSettings,
}

impl ReceiverConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.private_key_path.is_file() {
            return Err(ConfigError::MissingPrivateKey(self.private_key_path.clone()));
        }
        if self.subscription.trim().is_empty() {
            return Err(ConfigError::EmptySubscription);
        }
        self.settings.validate()
    }

    /// Load the private key once, for sharing across every worker.
    pub fn load_key(&self) -> Result<Arc<ReceiverKey>, ConfigError> {
        Ok(Arc::new(ReceiverKey::load(&self.private_key_path)?))
    }
}
