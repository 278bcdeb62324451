//! Per-notification pipeline errors

use sealnote_crypto::DecryptError;
use std::time::Duration;
use thiserror::Error;

use crate::dispatch::DispatchError;
use crate::envelope::ParseError;
use crate::fetch::FetchError;
use crate::notification::NotificationError;
use crate::policy::ErrorClass;

/// Furthest state a notification reached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    Fetched,
    Parsed,
    Decrypted,
    Dispatched,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Received => "received",
            Stage::Fetched => "fetched",
            Stage::Parsed => "parsed",
            Stage::Decrypted => "decrypted",
            Stage::Dispatched => "dispatched",
        }
    }
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Notification(#[from] NotificationError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("Fetch timed out after {0:?}")]
    FetchTimedOut(Duration),

    #[error("Invalid stored object: {0}")]
    Parse(#[from] ParseError),

    #[error("Sealed data is {0} bytes, shorter than the authentication tag")]
    TruncatedCiphertext(usize),

    /// Display is deliberately the same for every crypto failure
    #[error("Envelope could not be opened")]
    Crypto(DecryptError),

    #[error(transparent)]
    Dispatch(DispatchError),

    #[error("Dispatch timed out after {0:?}")]
    DispatchTimedOut(Duration),
}

impl From<DecryptError> for PipelineError {
    fn from(err: DecryptError) -> Self {
        match err {
            DecryptError::TruncatedCiphertext(len) => PipelineError::TruncatedCiphertext(len),
            other => PipelineError::Crypto(other),
        }
    }
}

impl From<DispatchError> for PipelineError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::TimedOut(limit) => PipelineError::DispatchTimedOut(limit),
            other => PipelineError::Dispatch(other),
        }
    }
}

impl PipelineError {
    pub fn class(&self) -> ErrorClass {
        match self {
            PipelineError::Notification(_) => ErrorClass::MalformedPayload,
            PipelineError::Fetch(FetchError::NotFound { .. }) => ErrorClass::MalformedPayload,
            PipelineError::Fetch(FetchError::TransientIo(_)) => ErrorClass::TransientInfra,
            PipelineError::FetchTimedOut(_) => ErrorClass::TransientInfra,
            PipelineError::Parse(_) => ErrorClass::MalformedPayload,
            PipelineError::TruncatedCiphertext(_) => ErrorClass::MalformedPayload,
            PipelineError::Crypto(_) => ErrorClass::Crypto,
            PipelineError::Dispatch(DispatchError::InvalidTextEncoding(_)) => {
                ErrorClass::ContentEncoding
            }
            PipelineError::Dispatch(DispatchError::InvalidAudioEncoding(_)) => {
                ErrorClass::ContentEncoding
            }
            PipelineError::Dispatch(DispatchError::Io { .. })
            | PipelineError::Dispatch(DispatchError::TimedOut(_)) => ErrorClass::TransientInfra,
            PipelineError::DispatchTimedOut(_) => ErrorClass::TransientInfra,
        }
    }

    /// The last state the notification got to before this error
    pub fn stage(&self) -> Stage {
        match self {
            PipelineError::Notification(_)
            | PipelineError::Fetch(_)
            | PipelineError::FetchTimedOut(_) => Stage::Received,
            PipelineError::Parse(_) => Stage::Fetched,
            PipelineError::TruncatedCiphertext(_) | PipelineError::Crypto(_) => Stage::Parsed,
            PipelineError::Dispatch(_) | PipelineError::DispatchTimedOut(_) => Stage::Decrypted,
        }
    }
}
