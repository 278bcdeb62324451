//! SealNote Cloud - storage and transport adapters
//!
//! - `gcs`: Cloud Storage JSON API object fetcher
//! - `pubsub`: Pub/Sub REST pull subscriber
//! - `local`: objects read from a directory tree (mounted buckets, tests)

pub mod gcs;
pub mod local;
pub mod pubsub;

pub use gcs::GcsFetcher;
pub use local::LocalFetcher;
pub use pubsub::{subscription_path, PubSubConfig, PubSubSource};

/// Public Cloud Storage endpoint
pub const DEFAULT_STORAGE_ENDPOINT: &str = "https://storage.googleapis.com";
/// Public Pub/Sub endpoint
pub const DEFAULT_PUBSUB_ENDPOINT: &str = "https://pubsub.googleapis.com";
