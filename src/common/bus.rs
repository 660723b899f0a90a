//! Message bus interface
//!
//! The transport itself is external; the pipeline consumes publish/subscribe
//! semantics through the [`Bus`] trait. Subscriptions deliver into bounded
//! channels drained by a single owning task, so segment parsing never runs
//! on the transport's callback threads.
//!
//! An [`InMemoryBus`] implementation backs the pipeline tests, including the
//! request/reply acknowledgement flow the segmented protocol depends on.

use crate::common::error::{ReplayError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

/// Default ack wait before the sender declares the segment lost.
pub const ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Subject names derived from a job subject `S`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subjects {
    job: String,
}

impl Subjects {
    pub fn new(job: impl Into<String>) -> Self {
        Self { job: job.into() }
    }

    pub fn job(&self) -> &str {
        &self.job
    }

    /// Segmented bulk-load entry batches.
    pub fn full(&self) -> String {
        format!("{}_full", self.job)
    }

    /// End-of-bulk-load marker carrying the starting coordinates.
    pub fn full_complete(&self) -> String {
        format!("{}_full_complete", self.job)
    }

    /// Segmented incremental change events (heterogeneous sources share the
    /// decoder).
    pub fn incr(&self) -> String {
        format!("{}_incr_hete", self.job)
    }

    /// Fatal errors published by the applier.
    pub fn control2(&self) -> String {
        format!("{}_control2", self.job)
    }

    /// Optional applier-to-extractor progress pushes.
    pub fn progress(&self) -> String {
        format!("{}_progress", self.job)
    }
}

/// Control message types on the `_control2` subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlMsgType {
    Error,
}

/// Framed control message published by the applier on fatal errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlMsg {
    #[serde(rename = "type")]
    pub msg_type: ControlMsgType,
    pub msg: String,
}

impl ControlMsg {
    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            msg_type: ControlMsgType::Error,
            msg: msg.into(),
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// One delivered bus message.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub subject: String,
    /// Reply subject for per-segment acknowledgement, when the sender wants
    /// one.
    pub reply: Option<String>,
    pub payload: Bytes,
}

/// Publish/subscribe surface of the external message bus.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Publish a payload. Failing is fatal for the job.
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()>;

    /// Publish with a reply subject attached.
    async fn publish_request(&self, subject: &str, reply: &str, payload: Bytes) -> Result<()>;

    /// Subscribe; messages drain through the returned bounded channel.
    async fn subscribe(&self, subject: &str) -> Result<mpsc::Receiver<BusMessage>>;

    /// Close the connection, unblocking all subscriptions.
    async fn close(&self);
}

/// Shared bus handle.
pub type SharedBus = Arc<dyn Bus>;

// ============================================================================
// In-memory bus
// ============================================================================

/// In-process bus used by the pipeline tests.
///
/// Delivery to a subscription awaits channel capacity, so a slow consumer
/// stalls the publisher exactly like a transport-level flow-control window.
pub struct InMemoryBus {
    subs: Mutex<HashMap<String, Vec<mpsc::Sender<BusMessage>>>>,
    closed: AtomicBool,
    inbox_seq: AtomicU64,
    capacity: usize,
}

impl InMemoryBus {
    pub fn new() -> Arc<Self> {
        Self::with_capacity(64)
    }

    /// Subscription channel capacity; small values exercise backpressure.
    pub fn with_capacity(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            subs: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            inbox_seq: AtomicU64::new(0),
            capacity,
        })
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ReplayError::publish_failed("bus closed"));
        }
        Ok(())
    }

    async fn deliver(&self, msg: BusMessage) -> Result<()> {
        let targets: Vec<mpsc::Sender<BusMessage>> = {
            let subs = self.subs.lock().await;
            subs.get(&msg.subject).cloned().unwrap_or_default()
        };
        for tx in targets {
            // ignore receivers that went away; the bus is fire-and-forget
            // towards dead subscriptions
            let _ = tx.send(msg.clone()).await;
        }
        Ok(())
    }

    /// Publish and wait for the empty acknowledgement on a fresh reply
    /// subject. This is the sender half of the segment flow-control
    /// protocol; times out with [`ReplayError::AckTimeout`].
    pub async fn request(
        self: &Arc<Self>,
        subject: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Bytes> {
        let inbox = format!(
            "_INBOX.{}",
            self.inbox_seq.fetch_add(1, Ordering::SeqCst)
        );
        let mut reply_rx = self.subscribe(&inbox).await?;
        self.publish_request(subject, &inbox, payload).await?;
        match tokio::time::timeout(timeout, reply_rx.recv()).await {
            Ok(Some(msg)) => Ok(msg.payload),
            Ok(None) => Err(ReplayError::publish_failed("reply subscription closed")),
            Err(_) => Err(ReplayError::AckTimeout(format!(
                "no ack on {subject} within {timeout:?}"
            ))),
        }
    }
}

#[async_trait]
impl Bus for InMemoryBus {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()> {
        self.check_open()?;
        self.deliver(BusMessage {
            subject: subject.to_string(),
            reply: None,
            payload,
        })
        .await
    }

    async fn publish_request(&self, subject: &str, reply: &str, payload: Bytes) -> Result<()> {
        self.check_open()?;
        self.deliver(BusMessage {
            subject: subject.to_string(),
            reply: Some(reply.to_string()),
            payload,
        })
        .await
    }

    async fn subscribe(&self, subject: &str) -> Result<mpsc::Receiver<BusMessage>> {
        self.check_open()?;
        let (tx, rx) = mpsc::channel(self.capacity);
        let mut subs = self.subs.lock().await;
        subs.entry(subject.to_string()).or_default().push(tx);
        debug!(subject, "bus subscription added");
        Ok(rx)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        // dropping the senders unblocks every subscription drain loop
        self.subs.lock().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_scheme() {
        let s = Subjects::new("job42");
        assert_eq!(s.full(), "job42_full");
        assert_eq!(s.full_complete(), "job42_full_complete");
        assert_eq!(s.incr(), "job42_incr_hete");
        assert_eq!(s.control2(), "job42_control2");
        assert_eq!(s.progress(), "job42_progress");
    }

    #[test]
    fn test_control_msg_roundtrip() {
        let msg = ControlMsg::error("worker 2 died");
        let bytes = msg.encode().unwrap();
        let decoded = ControlMsg::decode(&bytes).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.msg_type, ControlMsgType::Error);
    }

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = InMemoryBus::new();
        let mut rx = bus.subscribe("t").await.unwrap();
        bus.publish("t", Bytes::from_static(b"hi")).await.unwrap();

        let msg = rx.recv().await.unwrap();
        assert_eq!(&msg.payload[..], b"hi");
        assert!(msg.reply.is_none());
    }

    #[tokio::test]
    async fn test_request_acked() {
        let bus = InMemoryBus::new();
        let mut rx = bus.subscribe("t").await.unwrap();

        let responder_bus = bus.clone();
        tokio::spawn(async move {
            let msg = rx.recv().await.unwrap();
            let reply = msg.reply.unwrap();
            responder_bus.publish(&reply, Bytes::new()).await.unwrap();
        });

        let ack = bus
            .request("t", Bytes::from_static(b"seg"), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(ack.is_empty());
    }

    #[tokio::test]
    async fn test_request_times_out_without_ack() {
        let bus = InMemoryBus::new();
        let _rx = bus.subscribe("t").await.unwrap();

        let err = bus
            .request("t", Bytes::from_static(b"seg"), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, ReplayError::AckTimeout(_)));
    }

    #[tokio::test]
    async fn test_closed_bus_rejects_publish() {
        let bus = InMemoryBus::new();
        bus.close().await;
        let err = bus.publish("t", Bytes::new()).await.unwrap_err();
        assert!(matches!(err, ReplayError::PublishFailed(_)));
    }
}
