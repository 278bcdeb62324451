//! Pipeline controller
//!
//! One notification moves Received → Fetched → Parsed → Decrypted →
//! Dispatched, strictly in order, then gets acked. Any stage failure is
//! classified and settled through the policy table: ack-and-drop for
//! anything that will fail again, nack for anything that might not.
//!
//! The listener loop runs each notification on its own task, bounded by a
//! semaphore. Nothing that happens inside a task can stop the loop.

use sealnote_crypto::{decrypt, ReceiverKey};
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio::time::timeout;
use tracing::Instrument;

use crate::config::PipelineSettings;
use crate::dispatch::{ArtifactRef, OutputSink};
use crate::envelope;
use crate::error::PipelineError;
use crate::fetch::ObjectFetcher;
use crate::notification::{self, NotificationRef};
use crate::policy::{self, Disposition, ErrorClass};
use crate::transport::{AckHandle, Delivery, NotificationSource};

/// How a single notification ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Written and acked
    Dispatched(ArtifactRef),
    /// Not an object-created event; acked without work
    Skipped,
    /// Acked without output
    Dropped(ErrorClass),
    /// Nacked for another attempt
    Redelivered(ErrorClass),
}

/// Totals for one run of the listener loop
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub dispatched: usize,
    pub skipped: usize,
    pub dropped: usize,
    pub redelivered: usize,
    /// Worker tasks that panicked
    pub panicked: usize,
}

impl RunSummary {
    fn record(&mut self, joined: Result<Outcome, JoinError>) {
        match joined {
            Ok(Outcome::Dispatched(_)) => self.dispatched += 1,
            Ok(Outcome::Skipped) => self.skipped += 1,
            Ok(Outcome::Dropped(_)) => self.dropped += 1,
            Ok(Outcome::Redelivered(_)) => self.redelivered += 1,
            Err(e) => {
                tracing::error!(error = %e, "notification worker panicked");
                self.panicked += 1;
            }
        }
    }
}

pub struct Pipeline {
    fetcher: Arc<dyn ObjectFetcher>,
    key: Arc<ReceiverKey>,
    sink: OutputSink,
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(
        fetcher: Arc<dyn ObjectFetcher>,
        key: Arc<ReceiverKey>,
        sink: OutputSink,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            fetcher,
            key,
            sink,
            settings,
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Run every stage for one notification body.
    pub async fn process(&self, data: &[u8]) -> Result<ArtifactRef, PipelineError> {
        let object_ref = notification::parse_notification(data)?;
        tracing::info!(bucket = %object_ref.container, object = %object_ref.key, "processing object");

        let object = self.fetch(&object_ref).await?;
        tracing::debug!(stage = "fetched", bytes = object.len());

        let wrapper = envelope::parse_wrapper(&object)?;
        tracing::debug!(stage = "parsed", kind = %wrapper.kind);

        let plaintext = decrypt(&wrapper.envelope, &self.key)?;
        tracing::debug!(stage = "decrypted", bytes = plaintext.len());

        let artifact = self
            .sink
            .dispatch_within(wrapper.kind, plaintext, self.settings.dispatch_timeout)
            .await?;

        Ok(artifact)
    }

    async fn fetch(&self, object_ref: &NotificationRef) -> Result<Vec<u8>, PipelineError> {
        let object = timeout(
            self.settings.fetch_timeout,
            self.fetcher.fetch(&object_ref.container, &object_ref.key),
        )
        .await
        .map_err(|_| PipelineError::FetchTimedOut(self.settings.fetch_timeout))??;
        Ok(object)
    }

    /// Process one delivery and settle it. Never fails.
    pub async fn handle(&self, delivery: Delivery) -> Outcome {
        let Delivery {
            id,
            data,
            attributes,
            ack,
        } = delivery;
        let span = tracing::info_span!("notification", id = %id);

        async move {
            if !notification::is_object_created(&attributes) {
                tracing::debug!(
                    event = attributes.get(notification::EVENT_TYPE_ATTRIBUTE).map(String::as_str),
                    "ignoring non-create event"
                );
                settle(ack, Disposition::Acknowledge).await;
                return Outcome::Skipped;
            }

            match self.process(&data).await {
                Ok(artifact) => {
                    tracing::info!(
                        kind = %artifact.kind,
                        path = %artifact.path.display(),
                        bytes = artifact.bytes_written,
                        "note saved"
                    );
                    settle(ack, Disposition::Acknowledge).await;
                    Outcome::Dispatched(artifact)
                }
                Err(err) => {
                    let class = err.class();
                    let disposition = policy::disposition(class);
                    match disposition {
                        Disposition::Acknowledge => tracing::error!(
                            stage = err.stage().as_str(),
                            class = %class,
                            error = %err,
                            "dropping notification"
                        ),
                        Disposition::Redeliver => tracing::warn!(
                            stage = err.stage().as_str(),
                            class = %class,
                            error = %err,
                            "returning notification for redelivery"
                        ),
                    }
                    settle(ack, disposition).await;
                    match disposition {
                        Disposition::Acknowledge => Outcome::Dropped(class),
                        Disposition::Redeliver => Outcome::Redelivered(class),
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Listener loop: receive, fan out to bounded workers, drain on shutdown.
    ///
    /// Returns when `shutdown` turns true or the source finishes. In-flight
    /// notifications are always allowed to complete.
    pub async fn run<S>(self: Arc<Self>, mut source: S, mut shutdown: watch::Receiver<bool>) -> RunSummary
    where
        S: NotificationSource,
    {
        let permits = Arc::new(Semaphore::new(self.settings.max_concurrency));
        let mut workers = JoinSet::new();
        let mut summary = RunSummary::default();

        tracing::info!(
            max_concurrency = self.settings.max_concurrency,
            "listening for notifications"
        );

        loop {
            let permit = tokio::select! {
                _ = shutdown_requested(&mut shutdown) => break,
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let received = tokio::select! {
                _ = shutdown_requested(&mut shutdown) => break,
                received = source.recv() => received,
            };

            match received {
                Ok(Some(delivery)) => {
                    let pipeline = Arc::clone(&self);
                    workers.spawn(async move {
                        let outcome = pipeline.handle(delivery).await;
                        drop(permit);
                        outcome
                    });
                }
                Ok(None) => {
                    tracing::info!("notification source finished");
                    break;
                }
                Err(e) => {
                    drop(permit);
                    tracing::warn!(
                        error = %e,
                        backoff = ?self.settings.poll_backoff,
                        "receiving notifications failed"
                    );
                    tokio::select! {
                        _ = shutdown_requested(&mut shutdown) => break,
                        _ = tokio::time::sleep(self.settings.poll_backoff) => {}
                    }
                }
            }

            while let Some(joined) = workers.try_join_next() {
                summary.record(joined);
            }
        }

        if !workers.is_empty() {
            tracing::info!(in_flight = workers.len(), "waiting for in-flight notifications");
        }
        while let Some(joined) = workers.join_next().await {
            summary.record(joined);
        }
        source.close().await;

        tracing::info!(
            dispatched = summary.dispatched,
            skipped = summary.skipped,
            dropped = summary.dropped,
            redelivered = summary.redelivered,
            "listener stopped"
        );
        summary
    }
}

async fn settle(ack: AckHandle, disposition: Disposition) {
    let result = match disposition {
        Disposition::Acknowledge => ack.ack().await,
        Disposition::Redeliver => ack.nack().await,
    };
    // The transport redelivers anything it never heard back about
    if let Err(e) = result {
        tracing::warn!(error = %e, ?disposition, "failed to settle notification");
    }
}

/// Resolves once the flag is true. A dropped sender never resolves.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{encode_wrapper, NoteKind, NoteWrapper};
    use crate::fetch::{FetchError, MemoryFetcher};
    use crate::transport::{self, AckDecision, AckReceipt, TransportError};
    use async_trait::async_trait;
    use base64::{engine::general_purpose::STANDARD, Engine};
    use rsa::rand_core::OsRng;
    use rsa::RsaPrivateKey;
    use std::collections::{HashMap, HashSet};
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::OnceLock;
    use std::time::Duration;

    const BUCKET: &str = "private-notes";

    fn receiver_key() -> Arc<ReceiverKey> {
        static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
        let key = KEY.get_or_init(|| RsaPrivateKey::new(&mut OsRng, 1024).unwrap());
        Arc::new(ReceiverKey::from(key.clone()))
    }

    fn stranger_key() -> Arc<ReceiverKey> {
        static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
        let key = KEY.get_or_init(|| RsaPrivateKey::new(&mut OsRng, 1024).unwrap());
        Arc::new(ReceiverKey::from(key.clone()))
    }

    fn stored_note(kind: NoteKind, plaintext: &[u8], key: &ReceiverKey) -> Vec<u8> {
        let envelope = sealnote_crypto::seal(plaintext, &key.public_key()).unwrap();
        encode_wrapper(&NoteWrapper { kind, envelope }).unwrap()
    }

    fn notification(name: &str) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({"bucket": BUCKET, "name": name})).unwrap()
    }

    fn delivery(data: Vec<u8>) -> (Delivery, AckReceipt) {
        Delivery::with_receipt("test", data, HashMap::new())
    }

    fn pipeline(fetcher: Arc<dyn ObjectFetcher>, out: &Path) -> Pipeline {
        Pipeline::new(
            fetcher,
            receiver_key(),
            OutputSink::new(out),
            PipelineSettings::default(),
        )
    }

    fn files_in(dir: &Path) -> Vec<std::path::PathBuf> {
        match std::fs::read_dir(dir) {
            Ok(entries) => entries.map(|e| e.unwrap().path()).collect(),
            Err(_) => Vec::new(),
        }
    }

    struct FlakyFetcher;

    #[async_trait]
    impl ObjectFetcher for FlakyFetcher {
        async fn fetch(&self, _container: &str, _key: &str) -> Result<Vec<u8>, FetchError> {
            Err(FetchError::TransientIo("connection reset by peer".to_string()))
        }
    }

    struct StalledFetcher;

    #[async_trait]
    impl ObjectFetcher for StalledFetcher {
        async fn fetch(&self, _container: &str, _key: &str) -> Result<Vec<u8>, FetchError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Vec::new())
        }
    }

    #[derive(Default)]
    struct CountingFetcher {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ObjectFetcher for CountingFetcher {
        async fn fetch(&self, container: &str, key: &str) -> Result<Vec<u8>, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(FetchError::not_found(container, key))
        }
    }

    #[tokio::test]
    async fn test_text_note_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(MemoryFetcher::new());
        fetcher.insert(BUCKET, "a.json", stored_note(NoteKind::Text, b"hello", &receiver_key()));

        let (delivery, receipt) = delivery(notification("a.json"));
        let outcome = pipeline(fetcher, dir.path()).handle(delivery).await;

        let Outcome::Dispatched(artifact) = outcome else {
            panic!("expected dispatch, got {outcome:?}");
        };
        assert_eq!(std::fs::read(&artifact.path).unwrap(), b"hello");
        assert_eq!(files_in(dir.path()).len(), 1);
        assert_eq!(receipt.decision().await, Some(AckDecision::Acked));
    }

    #[tokio::test]
    async fn test_audio_note_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let raw = b"RIFF\x10\x00\x00\x00WAVEfmt \xff\x00\x01".to_vec();
        let fetcher = Arc::new(MemoryFetcher::new());
        fetcher.insert(
            BUCKET,
            "voice.json",
            stored_note(NoteKind::Audio, STANDARD.encode(&raw).as_bytes(), &receiver_key()),
        );

        let (delivery, receipt) = delivery(notification("voice.json"));
        let outcome = pipeline(fetcher, dir.path()).handle(delivery).await;

        let Outcome::Dispatched(artifact) = outcome else {
            panic!("expected dispatch, got {outcome:?}");
        };
        assert_eq!(artifact.kind, NoteKind::Audio);
        assert_eq!(std::fs::read(&artifact.path).unwrap(), raw);
        assert_eq!(receipt.decision().await, Some(AckDecision::Acked));
    }

    #[tokio::test]
    async fn test_missing_object_is_acked_and_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let (delivery, receipt) = delivery(notification("gone.json"));

        let outcome = pipeline(Arc::new(MemoryFetcher::new()), dir.path())
            .handle(delivery)
            .await;

        assert_eq!(outcome, Outcome::Dropped(ErrorClass::MalformedPayload));
        assert_eq!(receipt.decision().await, Some(AckDecision::Acked));
        assert!(files_in(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_wrong_key_is_acked_and_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(MemoryFetcher::new());
        fetcher.insert(BUCKET, "a.json", stored_note(NoteKind::Text, b"hello", &stranger_key()));

        let pipeline = pipeline(fetcher, dir.path());
        let err = pipeline.process(&notification("a.json")).await.unwrap_err();
        assert!(matches!(err, PipelineError::Crypto(_)));

        let (delivery, receipt) = delivery(notification("a.json"));
        assert_eq!(
            pipeline.handle(delivery).await,
            Outcome::Dropped(ErrorClass::Crypto)
        );
        assert_eq!(receipt.decision().await, Some(AckDecision::Acked));
        assert!(files_in(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_malformed_wrapper_drops_the_same_way_twice() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(MemoryFetcher::new());
        fetcher.insert(BUCKET, "bad.json", br#"{"type": "text"}"#.to_vec());
        let pipeline = pipeline(fetcher, dir.path());

        for _ in 0..2 {
            let (delivery, receipt) = delivery(notification("bad.json"));
            assert_eq!(
                pipeline.handle(delivery).await,
                Outcome::Dropped(ErrorClass::MalformedPayload)
            );
            assert_eq!(receipt.decision().await, Some(AckDecision::Acked));
            assert!(files_in(dir.path()).is_empty());
        }
    }

    #[tokio::test]
    async fn test_notification_without_name_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let (delivery, receipt) = delivery(br#"{"bucket": "private-notes"}"#.to_vec());

        let outcome = pipeline(Arc::new(MemoryFetcher::new()), dir.path())
            .handle(delivery)
            .await;

        assert_eq!(outcome, Outcome::Dropped(ErrorClass::MalformedPayload));
        assert_eq!(receipt.decision().await, Some(AckDecision::Acked));
    }

    #[tokio::test]
    async fn test_undecodable_text_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(MemoryFetcher::new());
        fetcher.insert(BUCKET, "a.json", stored_note(NoteKind::Text, &[0xc3, 0x28], &receiver_key()));

        let (delivery, receipt) = delivery(notification("a.json"));
        let outcome = pipeline(fetcher, dir.path()).handle(delivery).await;

        assert_eq!(outcome, Outcome::Dropped(ErrorClass::ContentEncoding));
        assert_eq!(receipt.decision().await, Some(AckDecision::Acked));
        assert!(files_in(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_transient_fetch_failure_is_redelivered() {
        let dir = tempfile::tempdir().unwrap();
        let (delivery, receipt) = delivery(notification("a.json"));

        let outcome = pipeline(Arc::new(FlakyFetcher), dir.path()).handle(delivery).await;

        assert_eq!(outcome, Outcome::Redelivered(ErrorClass::TransientInfra));
        assert_eq!(receipt.decision().await, Some(AckDecision::Nacked));
    }

    #[tokio::test]
    async fn test_fetch_timeout_is_redelivered() {
        let dir = tempfile::tempdir().unwrap();
        let settings = PipelineSettings {
            fetch_timeout: Duration::from_millis(50),
            ..PipelineSettings::default()
        };
        let pipeline = Pipeline::new(
            Arc::new(StalledFetcher),
            receiver_key(),
            OutputSink::new(dir.path()),
            settings,
        );

        let err = pipeline.process(&notification("a.json")).await.unwrap_err();
        assert!(matches!(err, PipelineError::FetchTimedOut(_)));

        let (delivery, receipt) = delivery(notification("a.json"));
        assert_eq!(
            pipeline.handle(delivery).await,
            Outcome::Redelivered(ErrorClass::TransientInfra)
        );
        assert_eq!(receipt.decision().await, Some(AckDecision::Nacked));
    }

    #[tokio::test]
    async fn test_dispatch_timeout_is_redelivered_without_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("output");
        let fetcher = Arc::new(MemoryFetcher::new());
        let large = vec![b'n'; 64 << 20];
        fetcher.insert(BUCKET, "big.json", stored_note(NoteKind::Text, &large, &receiver_key()));

        let settings = PipelineSettings {
            dispatch_timeout: Duration::from_millis(1),
            ..PipelineSettings::default()
        };
        let pipeline = Pipeline::new(fetcher, receiver_key(), OutputSink::new(&out), settings);

        let err = pipeline.process(&notification("big.json")).await.unwrap_err();
        assert!(matches!(err, PipelineError::DispatchTimedOut(_)));
        assert!(files_in(&out).is_empty(), "left behind: {:?}", files_in(&out));

        let (delivery, receipt) = delivery(notification("big.json"));
        assert_eq!(
            pipeline.handle(delivery).await,
            Outcome::Redelivered(ErrorClass::TransientInfra)
        );
        assert_eq!(receipt.decision().await, Some(AckDecision::Nacked));
        assert!(files_in(&out).is_empty(), "left behind: {:?}", files_in(&out));
    }

    #[tokio::test]
    async fn test_disk_failure_is_redelivered() {
        let dir = tempfile::tempdir().unwrap();
        let blocked = dir.path().join("output");
        std::fs::write(&blocked, b"not a directory").unwrap();

        let fetcher = Arc::new(MemoryFetcher::new());
        fetcher.insert(BUCKET, "a.json", stored_note(NoteKind::Text, b"hello", &receiver_key()));

        let (delivery, receipt) = delivery(notification("a.json"));
        let outcome = pipeline(fetcher, &blocked).handle(delivery).await;

        assert_eq!(outcome, Outcome::Redelivered(ErrorClass::TransientInfra));
        assert_eq!(receipt.decision().await, Some(AckDecision::Nacked));
    }

    #[tokio::test]
    async fn test_non_create_event_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(CountingFetcher::default());
        let attributes = HashMap::from([(
            notification::EVENT_TYPE_ATTRIBUTE.to_string(),
            "OBJECT_DELETE".to_string(),
        )]);
        let (delivery, receipt) = Delivery::with_receipt("1", notification("a.json"), attributes);

        let outcome = pipeline(fetcher.clone(), dir.path()).handle(delivery).await;

        assert_eq!(outcome, Outcome::Skipped);
        assert_eq!(receipt.decision().await, Some(AckDecision::Acked));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_notifications_produce_distinct_artifacts() {
        const NOTES: usize = 12;

        let dir = tempfile::tempdir().unwrap();
        let key = receiver_key();
        let fetcher = Arc::new(MemoryFetcher::new());
        for i in 0..NOTES {
            let body = format!("note number {i}");
            fetcher.insert(BUCKET, &format!("{i}.json"), stored_note(NoteKind::Text, body.as_bytes(), &key));
        }

        let settings = PipelineSettings {
            max_concurrency: 3,
            ..PipelineSettings::default()
        };
        let pipeline = Arc::new(Pipeline::new(fetcher, key, OutputSink::new(dir.path()), settings));

        let (sender, source) = transport::channel(NOTES);
        let mut receipts = Vec::new();
        for i in 0..NOTES {
            receipts.push(
                sender
                    .send(notification(&format!("{i}.json")), HashMap::new())
                    .await
                    .unwrap(),
            );
        }
        drop(sender);

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let summary = pipeline.run(source, shutdown_rx).await;

        assert_eq!(summary.dispatched, NOTES);
        for receipt in receipts {
            assert_eq!(receipt.decision().await, Some(AckDecision::Acked));
        }

        let files = files_in(dir.path());
        assert_eq!(files.len(), NOTES);
        let contents: HashSet<String> = files
            .iter()
            .map(|p| std::fs::read_to_string(p).unwrap())
            .collect();
        assert_eq!(contents.len(), NOTES);
    }

    struct BrokenThenIdleSource {
        failures_left: usize,
    }

    #[async_trait]
    impl NotificationSource for BrokenThenIdleSource {
        async fn recv(&mut self) -> Result<Option<Delivery>, TransportError> {
            if self.failures_left > 0 {
                self.failures_left -= 1;
                return Err(TransportError::Request("503 Service Unavailable".to_string()));
            }
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_shutdown_stops_an_idle_listener() {
        let dir = tempfile::tempdir().unwrap();
        let settings = PipelineSettings {
            poll_backoff: Duration::from_millis(10),
            ..PipelineSettings::default()
        };
        let pipeline = Arc::new(Pipeline::new(
            Arc::new(MemoryFetcher::new()),
            receiver_key(),
            OutputSink::new(dir.path()),
            settings,
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let listener = tokio::spawn(pipeline.run(BrokenThenIdleSource { failures_left: 2 }, shutdown_rx));

        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown_tx.send(true).unwrap();

        let summary = tokio::time::timeout(Duration::from_secs(5), listener)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(summary, RunSummary::default());
    }
}
