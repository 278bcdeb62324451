//! Acknowledgment policy
//!
//! Redelivery is only useful when the failure could plausibly go away on
//! its own. Everything about the message itself (its shape, its crypto,
//! its content) will fail the same way every time, so those are
//! acknowledged and dropped.
//!
//! This table is the whole policy. There is no fallback arm.

/// Failure taxonomy for one notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Fetch I/O, local disk I/O, stage timeouts
    TransientInfra,
    /// Bad notification, missing object, bad JSON/base64/fields, truncated ciphertext
    MalformedPayload,
    /// Key unwrap or tag verification failed
    Crypto,
    /// Decrypted bytes are not the text/base64 the note type promises
    ContentEncoding,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::TransientInfra => "transient_infra",
            ErrorClass::MalformedPayload => "malformed_payload",
            ErrorClass::Crypto => "crypto",
            ErrorClass::ContentEncoding => "content_encoding",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to tell the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Ack: the message is done, successfully or not
    Acknowledge,
    /// Nack: hand it back for another attempt
    Redeliver,
}

pub fn disposition(class: ErrorClass) -> Disposition {
    match class {
        ErrorClass::TransientInfra => Disposition::Redeliver,
        ErrorClass::MalformedPayload => Disposition::Acknowledge,
        ErrorClass::Crypto => Disposition::Acknowledge,
        ErrorClass::ContentEncoding => Disposition::Acknowledge,
    }
}
