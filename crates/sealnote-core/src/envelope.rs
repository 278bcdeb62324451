//! Stored note documents
//!
//! Outer wrapper: `{"type": "text" | "audio", "payload": {...}}`
//! Inner envelope: `{"encryptedKey": b64, "iv": b64, "data": b64}`
//!
//! Parsing is pure. Nothing here touches keys or the filesystem.

use base64::{engine::general_purpose::STANDARD, Engine};
use sealnote_crypto::cipher::NONCE_SIZE;
use sealnote_crypto::EncryptedEnvelope;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Declared content type of a note
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoteKind {
    Text,
    Audio,
}

impl NoteKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NoteKind::Text => "text",
            NoteKind::Audio => "audio",
        }
    }

    /// File extension of the persisted artifact
    pub fn extension(&self) -> &'static str {
        match self {
            NoteKind::Text => "txt",
            NoteKind::Audio => "m4a",
        }
    }
}

impl fmt::Display for NoteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NoteKind {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(NoteKind::Text),
            "audio" => Ok(NoteKind::Audio),
            other => Err(ParseError::UnknownKind(other.to_string())),
        }
    }
}

/// The document stored in the bucket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoteWrapper {
    pub kind: NoteKind,
    pub envelope: EncryptedEnvelope,
}

/// What the local decrypt driver accepts: a full wrapper, or a bare envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalDocument {
    pub kind: Option<NoteKind>,
    pub envelope: EncryptedEnvelope,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Malformed JSON: {0}")]
    MalformedJson(String),

    #[error("Missing field: {0}")]
    MissingField(&'static str),

    #[error("Field {field} must be a JSON {expected}")]
    UnexpectedType {
        field: &'static str,
        expected: &'static str,
    },

    #[error("Field {field} is not valid base64: {reason}")]
    InvalidEncoding { field: &'static str, reason: String },

    #[error("IV must be {NONCE_SIZE} bytes, got {0}")]
    InvalidNonceLength(usize),

    #[error("Unknown note type: {0}")]
    UnknownKind(String),
}

#[derive(Serialize)]
struct WireEnvelope {
    #[serde(rename = "encryptedKey")]
    encrypted_key: String,
    iv: String,
    data: String,
}

#[derive(Serialize)]
struct WireWrapper {
    #[serde(rename = "type")]
    kind: NoteKind,
    payload: WireEnvelope,
}

/// Parse the outer storage object.
///
/// Both `type` and `payload` must be present before the envelope is even
/// looked at. `payload` may be the envelope object itself or a JSON
/// string holding it.
pub fn parse_wrapper(bytes: &[u8]) -> Result<NoteWrapper, ParseError> {
    let document = parse_object(bytes)?;

    let kind = required(&document, "type")?;
    let payload = required(&document, "payload")?;

    let kind: NoteKind = kind
        .as_str()
        .ok_or(ParseError::UnexpectedType {
            field: "type",
            expected: "string",
        })?
        .parse()?;

    let envelope = parse_payload(payload)?;
    Ok(NoteWrapper { kind, envelope })
}

/// Parse the inner encrypted envelope.
pub fn parse_envelope(value: &Value) -> Result<EncryptedEnvelope, ParseError> {
    let object = value.as_object().ok_or(ParseError::UnexpectedType {
        field: "payload",
        expected: "object",
    })?;

    let wrapped_key = base64_field(object, "encryptedKey")?;
    let iv = base64_field(object, "iv")?;
    let sealed_data = base64_field(object, "data")?;

    let iv: [u8; NONCE_SIZE] = iv
        .as_slice()
        .try_into()
        .map_err(|_| ParseError::InvalidNonceLength(iv.len()))?;

    Ok(EncryptedEnvelope {
        wrapped_key,
        iv,
        sealed_data,
    })
}

/// Parse a file handed to the local driver.
///
/// A document with a non-null `payload` is treated as a wrapper (its
/// `type` is optional here); anything else must be a bare envelope.
pub fn parse_document(bytes: &[u8]) -> Result<LocalDocument, ParseError> {
    let document = parse_object(bytes)?;

    if document.get("payload").map_or(true, Value::is_null) {
        return Ok(LocalDocument {
            kind: None,
            envelope: parse_envelope(&Value::Object(document))?,
        });
    }
    let payload = required(&document, "payload")?;

    let kind = match document.get("type").and_then(Value::as_str) {
        Some(kind) => Some(kind.parse()?),
        None => None,
    };

    Ok(LocalDocument {
        kind,
        envelope: parse_payload(payload)?,
    })
}

/// Serialize a wrapper the way the mobile client uploads it.
pub fn encode_wrapper(wrapper: &NoteWrapper) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(&WireWrapper {
        kind: wrapper.kind,
        payload: wire_envelope(&wrapper.envelope),
    })
}

fn wire_envelope(envelope: &EncryptedEnvelope) -> WireEnvelope {
    WireEnvelope {
        encrypted_key: STANDARD.encode(&envelope.wrapped_key),
        iv: STANDARD.encode(envelope.iv),
        data: STANDARD.encode(&envelope.sealed_data),
    }
}

fn parse_object(bytes: &[u8]) -> Result<Map<String, Value>, ParseError> {
    match serde_json::from_slice(bytes) {
        Ok(Value::Object(object)) => Ok(object),
        Ok(_) => Err(ParseError::MalformedJson(
            "top-level value is not an object".to_string(),
        )),
        Err(e) => Err(ParseError::MalformedJson(e.to_string())),
    }
}

fn parse_payload(payload: &Value) -> Result<EncryptedEnvelope, ParseError> {
    match payload {
        Value::String(encoded) => {
            let inner: Value = serde_json::from_str(encoded)
                .map_err(|e| ParseError::MalformedJson(e.to_string()))?;
            parse_envelope(&inner)
        }
        other => parse_envelope(other),
    }
}

/// Null counts as absent.
fn required<'a>(object: &'a Map<String, Value>, field: &'static str) -> Result<&'a Value, ParseError> {
    object
        .get(field)
        .filter(|v| !v.is_null())
        .ok_or(ParseError::MissingField(field))
}

fn base64_field(object: &Map<String, Value>, field: &'static str) -> Result<Vec<u8>, ParseError> {
    let encoded = required(object, field)?
        .as_str()
        .ok_or(ParseError::UnexpectedType {
            field,
            expected: "string",
        })?;

    STANDARD
        .decode(encoded)
        .map_err(|e| ParseError::InvalidEncoding {
            field,
            reason: e.to_string(),
        })
}
