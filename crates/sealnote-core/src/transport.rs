//! Notification transport seam
//!
//! A `NotificationSource` yields deliveries; each delivery carries an
//! `AckHandle` that must be settled exactly once. `ack` and `nack` consume
//! the handle, so settling twice doesn't compile. A handle that is dropped
//! unsettled is left to the transport's own redelivery timer.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Transport request failed: {0}")]
    Request(String),

    #[error("Unexpected transport response: {0}")]
    Protocol(String),
}

/// Transport-specific settlement of one delivery
#[async_trait]
pub trait Acknowledge: Send + Sync {
    async fn ack(&self) -> Result<(), TransportError>;

    /// Ask for prompt redelivery
    async fn nack(&self) -> Result<(), TransportError>;
}

pub struct AckHandle(Box<dyn Acknowledge>);

impl AckHandle {
    pub fn new(inner: impl Acknowledge + 'static) -> Self {
        Self(Box::new(inner))
    }

    pub async fn ack(self) -> Result<(), TransportError> {
        self.0.ack().await
    }

    pub async fn nack(self) -> Result<(), TransportError> {
        self.0.nack().await
    }
}

impl std::fmt::Debug for AckHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AckHandle")
    }
}

/// One received notification
#[derive(Debug)]
pub struct Delivery {
    /// Transport message id, for logs
    pub id: String,
    pub data: Vec<u8>,
    pub attributes: HashMap<String, String>,
    pub ack: AckHandle,
}

#[async_trait]
pub trait NotificationSource: Send {
    /// Wait for the next delivery. `Ok(None)` means the source is finished.
    async fn recv(&mut self) -> Result<Option<Delivery>, TransportError>;

    /// Called once after the listener stops receiving.
    async fn close(&mut self) {}
}

// ============================================================================
// In-process channel transport
// ============================================================================

/// How a delivery was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckDecision {
    Acked,
    Nacked,
}

struct ReceiptAck {
    tx: Mutex<Option<oneshot::Sender<AckDecision>>>,
}

impl ReceiptAck {
    fn settle(&self, decision: AckDecision) -> Result<(), TransportError> {
        let tx = self
            .tx
            .lock()
            .map_err(|e| TransportError::Request(e.to_string()))?
            .take()
            .ok_or_else(|| TransportError::Protocol("delivery already settled".to_string()))?;
        // The receipt may have been dropped; nobody is listening then.
        let _ = tx.send(decision);
        Ok(())
    }
}

#[async_trait]
impl Acknowledge for ReceiptAck {
    async fn ack(&self) -> Result<(), TransportError> {
        self.settle(AckDecision::Acked)
    }

    async fn nack(&self) -> Result<(), TransportError> {
        self.settle(AckDecision::Nacked)
    }
}

/// Observes the settlement of a delivery created with [`Delivery::with_receipt`]
#[derive(Debug)]
pub struct AckReceipt {
    rx: oneshot::Receiver<AckDecision>,
}

impl AckReceipt {
    /// `None` if the delivery was dropped without being settled.
    pub async fn decision(self) -> Option<AckDecision> {
        self.rx.await.ok()
    }
}

impl Delivery {
    /// A delivery whose settlement is reported through the returned receipt.
    pub fn with_receipt(
        id: impl Into<String>,
        data: Vec<u8>,
        attributes: HashMap<String, String>,
    ) -> (Self, AckReceipt) {
        let (tx, rx) = oneshot::channel();
        let delivery = Delivery {
            id: id.into(),
            data,
            attributes,
            ack: AckHandle::new(ReceiptAck {
                tx: Mutex::new(Some(tx)),
            }),
        };
        (delivery, AckReceipt { rx })
    }
}

/// Create a bounded in-process transport.
pub fn channel(capacity: usize) -> (ChannelSender, ChannelSource) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        ChannelSender {
            tx,
            next_id: AtomicU64::new(1),
        },
        ChannelSource { rx },
    )
}

pub struct ChannelSender {
    tx: mpsc::Sender<Delivery>,
    next_id: AtomicU64,
}

impl ChannelSender {
    pub async fn send(
        &self,
        data: Vec<u8>,
        attributes: HashMap<String, String>,
    ) -> Result<AckReceipt, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed).to_string();
        let (delivery, receipt) = Delivery::with_receipt(id, data, attributes);
        self.tx
            .send(delivery)
            .await
            .map_err(|_| TransportError::Request("channel source closed".to_string()))?;
        Ok(receipt)
    }
}

/// Finishes once every [`ChannelSender`] is dropped and the queue drains.
pub struct ChannelSource {
    rx: mpsc::Receiver<Delivery>,
}

#[async_trait]
impl NotificationSource for ChannelSource {
    async fn recv(&mut self) -> Result<Option<Delivery>, TransportError> {
        Ok(self.rx.recv().await)
    }

    async fn close(&mut self) {
        self.rx.close();
    }
}
