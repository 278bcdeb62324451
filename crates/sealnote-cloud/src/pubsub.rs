//! Pub/Sub pull subscriber (REST)
//!
//! Pulls small batches, hands them out one at a time, and settles each
//! message individually: `acknowledge` for ack, a zero ack deadline for
//! nack so the message comes back right away instead of after the
//! subscription's deadline.
//!
//! Buffered messages are not lease-extended. Anything still queued when
//! the ack deadline passes is redelivered, so keep `max_messages` at or
//! below the number of workers; delivery stays at-least-once either way.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use sealnote_core::transport::Acknowledge;
use sealnote_core::{AckHandle, Delivery, NotificationSource, TransportError};
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// Pause between pulls that came back empty
const IDLE_PAUSE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct PubSubConfig {
    pub endpoint: String,
    /// `projects/{project}/subscriptions/{id}`
    pub subscription: String,
    pub access_token: Option<String>,
    /// Messages per pull; more than the listener can start at once just
    /// waits out its lease in the buffer
    pub max_messages: u32,
}

/// Expand a bare subscription id with the project; full paths pass through.
pub fn subscription_path(project: Option<&str>, subscription: &str) -> Result<String, TransportError> {
    let subscription = subscription.trim();
    if subscription.starts_with("projects/") {
        return Ok(subscription.to_string());
    }
    match project.map(str::trim).filter(|p| !p.is_empty()) {
        Some(project) => Ok(format!("projects/{project}/subscriptions/{subscription}")),
        None => Err(TransportError::Request(format!(
            "subscription '{subscription}' needs a project to form a full path"
        ))),
    }
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct PullResponse {
    #[serde(default)]
    received_messages: Vec<ReceivedMessage>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct ReceivedMessage {
    ack_id: String,
    message: PubsubMessage,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct PubsubMessage {
    #[serde(default)]
    data: String,
    #[serde(default)]
    attributes: HashMap<String, String>,
    #[serde(default)]
    message_id: String,
}

struct SubscriptionClient {
    http: reqwest::Client,
    config: PubSubConfig,
}

impl SubscriptionClient {
    fn url(&self, method: &str) -> String {
        format!(
            "{}/v1/{}:{}",
            self.config.endpoint.trim_end_matches('/'),
            self.config.subscription,
            method
        )
    }

    async fn post(&self, method: &str, body: serde_json::Value) -> Result<reqwest::Response, TransportError> {
        let mut request = self.http.post(self.url(method)).json(&body);
        if let Some(token) = &self.config.access_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(TransportError::Request(format!("{method} returned HTTP {status}: {detail}")));
        }
        Ok(response)
    }

    async fn pull(&self) -> Result<PullResponse, TransportError> {
        self.post("pull", serde_json::json!({ "maxMessages": self.config.max_messages }))
            .await?
            .json()
            .await
            .map_err(|e| TransportError::Protocol(e.to_string()))
    }

    async fn acknowledge(&self, ack_id: &str) -> Result<(), TransportError> {
        self.post("acknowledge", serde_json::json!({ "ackIds": [ack_id] }))
            .await
            .map(|_| ())
    }

    async fn modify_ack_deadline(&self, ack_id: &str, seconds: u32) -> Result<(), TransportError> {
        self.post(
            "modifyAckDeadline",
            serde_json::json!({ "ackIds": [ack_id], "ackDeadlineSeconds": seconds }),
        )
        .await
        .map(|_| ())
    }
}

struct PubSubAck {
    client: Arc<SubscriptionClient>,
    ack_id: String,
}

#[async_trait]
impl Acknowledge for PubSubAck {
    async fn ack(&self) -> Result<(), TransportError> {
        self.client.acknowledge(&self.ack_id).await
    }

    async fn nack(&self) -> Result<(), TransportError> {
        self.client.modify_ack_deadline(&self.ack_id, 0).await
    }
}

pub struct PubSubSource {
    client: Arc<SubscriptionClient>,
    buffered: VecDeque<Delivery>,
}

impl PubSubSource {
    pub fn new(config: PubSubConfig) -> Self {
        Self::with_client(reqwest::Client::new(), config)
    }

    pub fn with_client(http: reqwest::Client, config: PubSubConfig) -> Self {
        Self {
            client: Arc::new(SubscriptionClient { http, config }),
            buffered: VecDeque::new(),
        }
    }

    fn into_delivery(&self, received: ReceivedMessage) -> Delivery {
        let ReceivedMessage { ack_id, message } = received;
        Delivery {
            id: message.message_id,
            data: decode_data(&message.data),
            attributes: message.attributes,
            ack: AckHandle::new(PubSubAck {
                client: Arc::clone(&self.client),
                ack_id,
            }),
        }
    }
}

/// Message data is base64 on the wire. Undecodable data is passed through
/// as-is and left for notification parsing to reject.
fn decode_data(data: &str) -> Vec<u8> {
    match STANDARD.decode(data) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(error = %e, "message data is not base64, passing through raw");
            data.as_bytes().to_vec()
        }
    }
}

#[async_trait]
impl NotificationSource for PubSubSource {
    async fn recv(&mut self) -> Result<Option<Delivery>, TransportError> {
        loop {
            if let Some(delivery) = self.buffered.pop_front() {
                return Ok(Some(delivery));
            }

            let response = self.client.pull().await?;
            if response.received_messages.is_empty() {
                tokio::time::sleep(IDLE_PAUSE).await;
                continue;
            }

            tracing::debug!(count = response.received_messages.len(), "pulled messages");
            for received in response.received_messages {
                let delivery = self.into_delivery(received);
                self.buffered.push_back(delivery);
            }
        }
    }

    /// Hand back anything pulled but never started.
    async fn close(&mut self) {
        while let Some(delivery) = self.buffered.pop_front() {
            if let Err(e) = delivery.ack.nack().await {
                tracing::warn!(id = %delivery.id, error = %e, "failed to return buffered message");
            }
        }
    }
}
