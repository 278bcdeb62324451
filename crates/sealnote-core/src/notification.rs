//! Object-created notifications
//!
//! Cloud Storage publishes the object resource as the message body; only
//! `bucket` and `name` matter here. The event kind travels as a message
//! attribute.

use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Message attribute carrying the storage event kind
pub const EVENT_TYPE_ATTRIBUTE: &str = "eventType";
/// The only event kind that announces a new note
pub const OBJECT_FINALIZE: &str = "OBJECT_FINALIZE";

/// A stored object named by a notification
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NotificationRef {
    pub container: String,
    pub key: String,
}

impl fmt::Display for NotificationRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gs://{}/{}", self.container, self.key)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NotificationError {
    #[error("Notification is not a JSON object: {0}")]
    Malformed(String),

    #[error("Notification is missing {0}")]
    MissingField(&'static str),
}

#[derive(Deserialize)]
struct ObjectResource {
    bucket: Option<String>,
    name: Option<String>,
}

/// Extract the object reference from a notification body.
pub fn parse_notification(data: &[u8]) -> Result<NotificationRef, NotificationError> {
    let resource: ObjectResource =
        serde_json::from_slice(data).map_err(|e| NotificationError::Malformed(e.to_string()))?;

    let container = resource
        .bucket
        .filter(|b| !b.is_empty())
        .ok_or(NotificationError::MissingField("bucket"))?;
    let key = resource
        .name
        .filter(|n| !n.is_empty())
        .ok_or(NotificationError::MissingField("name"))?;

    Ok(NotificationRef { container, key })
}

/// True unless the transport says this is some other kind of event.
///
/// Transports that carry no attributes at all are assumed to only publish
/// object creation.
pub fn is_object_created(attributes: &HashMap<String, String>) -> bool {
    attributes
        .get(EVENT_TYPE_ATTRIBUTE)
        .map_or(true, |event| event == OBJECT_FINALIZE)
}
