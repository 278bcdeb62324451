//! SealNote Core - the receive, fetch, decrypt, dispatch pipeline
//!
//! Transports and storage backends plug in through `NotificationSource`
//! and `ObjectFetcher`; everything between them lives here.

pub mod config;
pub mod dispatch;
pub mod envelope;
pub mod error;
pub mod fetch;
pub mod notification;
pub mod pipeline;
pub mod policy;
pub mod transport;

pub use config::{ConfigError, PipelineSettings, ReceiverConfig};
pub use dispatch::{ArtifactRef, DispatchError, OutputSink};
pub use envelope::{NoteKind, NoteWrapper, ParseError};
pub use error::{PipelineError, Stage};
pub use fetch::{FetchError, ObjectFetcher};
pub use notification::NotificationRef;
pub use pipeline::{Outcome, Pipeline, RunSummary};
pub use policy::{Disposition, ErrorClass};
pub use transport::{AckHandle, Delivery, NotificationSource, TransportError};
