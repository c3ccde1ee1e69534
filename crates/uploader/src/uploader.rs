//! Reliable, batched event upload.
//!
//! Envelopes enter through a bounded queue. An intake task serializes them
//! and feeds an [`EventBatcher`]; sealed batches go through a second bounded
//! channel to a delivery task that ships one batch at a time, so partition
//! order is preserved end to end. A batch is sent as one request per
//! partition group and counts as delivered only when every group succeeded;
//! otherwise the whole batch is retried according to the [`RetryPolicy`].

use crate::batcher::{Batch, BatchLimits, EventBatcher};
use crate::observer::{BatchSummary, FailureKind, UploadFailure, UploadObserver, UploadStats};
use crate::transport::EventTransport;
use crate::wire::{encode_batch_body, WireCodec, WireEvent};
use bytes::Bytes;
use decision_core::config::{BatchingConfig, DroppingConfig};
use decision_core::error::{DecisionError, DecisionResult};
use decision_core::observer::invoke_guarded;
use decision_core::retry::RetryPolicy;
use decision_core::types::{EventEnvelope, EventKind};
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Default)]
struct StatsCounters {
    batches_delivered: AtomicU64,
    batches_failed: AtomicU64,
    events_delivered: AtomicU64,
    events_failed: AtomicU64,
    events_dropped: AtomicU64,
    retries: AtomicU64,
}

impl StatsCounters {
    fn snapshot(&self) -> UploadStats {
        UploadStats {
            batches_delivered: self.batches_delivered.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
            events_delivered: self.events_delivered.load(Ordering::Relaxed),
            events_failed: self.events_failed.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
        }
    }
}

struct PipelineTasks {
    intake: JoinHandle<()>,
    delivery: JoinHandle<()>,
}

pub struct ReliableUploader {
    sender: mpsc::Sender<EventEnvelope>,
    capacity: usize,
    dropping: DroppingConfig,
    stats: Arc<StatsCounters>,
    closing: CancellationToken,
    cancel: CancellationToken,
    tasks: Mutex<Option<PipelineTasks>>,
}

impl ReliableUploader {
    /// Validate `config` and spawn the pipeline tasks on the current runtime.
    pub fn new(
        config: &BatchingConfig,
        codec: WireCodec,
        transport: Arc<dyn EventTransport>,
        observer: Arc<dyn UploadObserver>,
    ) -> DecisionResult<Self> {
        config.validate()?;

        let (sender, receiver) = mpsc::channel(config.max_upload_queue_capacity);
        let (batch_tx, batch_rx) = mpsc::channel(config.max_pending_batches);
        let stats = Arc::new(StatsCounters::default());
        let closing = CancellationToken::new();
        let cancel = CancellationToken::new();

        let intake = Intake {
            codec,
            batcher: EventBatcher::new(BatchLimits::from(config), WireEvent::byte_size),
            observer: Arc::clone(&observer),
            stats: Arc::clone(&stats),
        };
        let delivery = Delivery {
            transport,
            observer,
            stats: Arc::clone(&stats),
            policy: config.retry.to_policy(),
            experimental_unit_secs: config.experimental_unit_duration_secs,
        };

        let intake = tokio::spawn(intake.run(receiver, batch_tx, closing.clone()));
        let delivery = tokio::spawn(delivery.run(batch_rx, cancel.clone()));

        info!(
            queue_capacity = config.max_upload_queue_capacity,
            max_event_count = config.max_event_count,
            max_buffer_size_bytes = config.max_buffer_size_bytes,
            max_duration_ms = config.max_duration_ms,
            "Reliable uploader started"
        );

        Ok(Self {
            sender,
            capacity: config.max_upload_queue_capacity,
            dropping: config.dropping.clone(),
            stats,
            closing,
            cancel,
            tasks: Mutex::new(Some(PipelineTasks { intake, delivery })),
        })
    }

    /// Enqueue without waiting. Returns false when the queue is full or the
    /// uploader is shutting down. An event discarded by the dropping policy
    /// counts as accepted.
    pub fn try_upload(&self, envelope: EventEnvelope) -> bool {
        if self.closing.is_cancelled() {
            return false;
        }
        let Some(envelope) = self.admit(envelope) else {
            return true;
        };
        match self.sender.try_send(envelope) {
            Ok(()) => {
                metrics::counter!("uploader.queued").increment(1);
                true
            }
            Err(TrySendError::Full(envelope)) => {
                metrics::counter!("uploader.rejected").increment(1);
                warn!(key = envelope.key(), "Upload queue full, event rejected");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Enqueue, waiting for queue capacity.
    pub async fn upload(&self, envelope: EventEnvelope) -> DecisionResult<()> {
        if self.closing.is_cancelled() {
            return Err(DecisionError::BatcherClosed);
        }
        let Some(envelope) = self.admit(envelope) else {
            return Ok(());
        };
        self.sender
            .send(envelope)
            .await
            .map_err(|_| DecisionError::BatcherClosed)?;
        metrics::counter!("uploader.queued").increment(1);
        Ok(())
    }

    /// Enqueue from a thread outside the async runtime, blocking it until
    /// there is capacity. Panics if called from within an async context.
    pub fn upload_blocking(&self, envelope: EventEnvelope) -> DecisionResult<()> {
        if self.closing.is_cancelled() {
            return Err(DecisionError::BatcherClosed);
        }
        let Some(envelope) = self.admit(envelope) else {
            return Ok(());
        };
        self.sender
            .blocking_send(envelope)
            .map_err(|_| DecisionError::BatcherClosed)?;
        metrics::counter!("uploader.queued").increment(1);
        Ok(())
    }

    /// Fraction of the upload queue currently occupied.
    pub fn queue_level(&self) -> f32 {
        let used = self.capacity.saturating_sub(self.sender.capacity());
        used as f32 / self.capacity as f32
    }

    pub fn stats(&self) -> UploadStats {
        self.stats.snapshot()
    }

    /// Stop accepting events, deliver what is queued within `grace`, then
    /// cancel whatever is still retrying. Completes after `on_complete` has
    /// fired. Later calls return the final stats immediately.
    pub async fn shutdown(&self, grace: Duration) -> UploadStats {
        let mut guard = self.tasks.lock().await;
        let Some(tasks) = guard.take() else {
            return self.stats.snapshot();
        };

        info!(grace_ms = grace.as_millis() as u64, "Shutting down uploader");
        self.closing.cancel();

        // A handle is awaited at most once: it is cleared as soon as it resolves.
        let mut intake = Some(tasks.intake);
        let mut delivery = Some(tasks.delivery);
        let drained = tokio::time::timeout(grace, async {
            if let Some(handle) = intake.as_mut() {
                log_task_exit("intake", handle.await);
                intake = None;
            }
            if let Some(handle) = delivery.as_mut() {
                log_task_exit("delivery", handle.await);
                delivery = None;
            }
        })
        .await;

        if drained.is_err() {
            warn!("Upload drain exceeded grace period, cancelling remaining deliveries");
            self.cancel.cancel();
            if let Some(handle) = intake {
                log_task_exit("intake", handle.await);
            }
            if let Some(handle) = delivery {
                log_task_exit("delivery", handle.await);
            }
        }

        let stats = self.stats.snapshot();
        info!(
            delivered = stats.events_delivered,
            failed = stats.events_failed,
            dropped = stats.events_dropped,
            "Uploader stopped"
        );
        stats
    }

    /// Apply the dropping policy. `None` means the event was discarded.
    fn admit(&self, mut envelope: EventEnvelope) -> Option<EventEnvelope> {
        let policy = &self.dropping;
        if envelope.kind != EventKind::Interaction || policy.probability_of_drop <= 0.0 {
            return Some(envelope);
        }
        if self.queue_level() < policy.max_queue_level_before_drop {
            return Some(envelope);
        }

        envelope.probability_of_drop = Some(policy.probability_of_drop);
        if rand::thread_rng().gen::<f32>() >= policy.probability_of_drop {
            return Some(envelope);
        }

        self.stats.events_dropped.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("uploader.dropped").increment(1);
        debug!(key = envelope.key(), "Interaction dropped under load");
        policy
            .emit_drop_notice
            .then(|| EventEnvelope::drop_notice(envelope.key(), policy.probability_of_drop))
    }
}

fn log_task_exit(task: &'static str, result: Result<(), JoinError>) {
    if let Err(e) = result {
        error!(task, error = %e, "Uploader task failed");
    }
}

/// Serializes queued envelopes and cuts them into batches.
struct Intake {
    codec: WireCodec,
    batcher: EventBatcher<WireEvent>,
    observer: Arc<dyn UploadObserver>,
    stats: Arc<StatsCounters>,
}

impl Intake {
    async fn run(
        mut self,
        mut receiver: mpsc::Receiver<EventEnvelope>,
        batches: mpsc::Sender<Batch<WireEvent>>,
        closing: CancellationToken,
    ) {
        loop {
            let deadline = self.batcher.deadline();
            tokio::select! {
                biased;
                _ = closing.cancelled() => {
                    receiver.close();
                    while let Some(envelope) = receiver.recv().await {
                        self.accept(envelope, &batches).await;
                    }
                    break;
                }
                maybe = receiver.recv() => match maybe {
                    Some(envelope) => self.accept(envelope, &batches).await,
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    if let Some(batch) = self.batcher.take_expired(Instant::now()) {
                        self.forward(batch, &batches).await;
                    }
                }
            }
        }

        if let Some(batch) = self.batcher.close() {
            self.forward(batch, &batches).await;
        }
        debug!("Upload intake finished");
    }

    async fn accept(&mut self, envelope: EventEnvelope, batches: &mpsc::Sender<Batch<WireEvent>>) {
        let wire = match self.codec.transform_event(&envelope) {
            Ok(wire) => wire,
            Err(e) => {
                error!(key = envelope.key(), error = %e, "Event could not be serialized");
                self.stats.events_failed.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("uploader.serialization_errors").increment(1);
                let failure = UploadFailure {
                    batch_id: None,
                    event_count: 1,
                    attempts: 0,
                    kind: FailureKind::Serialization,
                    error: Arc::new(e),
                    events: Arc::from(Vec::new()),
                    envelope: Some(Arc::new(envelope)),
                };
                invoke_guarded("on_error", || self.observer.on_error(&failure));
                return;
            }
        };

        match self.batcher.append(wire) {
            Ok(sealed) => {
                for batch in sealed {
                    self.forward(batch, batches).await;
                }
            }
            Err(e) => warn!(error = %e, "Event arrived after batcher closed"),
        }
    }

    async fn forward(&self, batch: Batch<WireEvent>, batches: &mpsc::Sender<Batch<WireEvent>>) {
        debug!(batch_id = %batch.id, count = batch.len(), bytes = batch.byte_size, "Batch sealed");
        if let Err(mpsc::error::SendError(batch)) = batches.send(batch).await {
            error!(batch_id = %batch.id, "Delivery task gone, batch lost");
            self.stats
                .events_failed
                .fetch_add(batch.len() as u64, Ordering::Relaxed);
        }
    }
}

/// Ships sealed batches one at a time.
struct Delivery {
    transport: Arc<dyn EventTransport>,
    observer: Arc<dyn UploadObserver>,
    stats: Arc<StatsCounters>,
    policy: RetryPolicy,
    experimental_unit_secs: Option<u64>,
}

impl Delivery {
    async fn run(self, mut batches: mpsc::Receiver<Batch<WireEvent>>, cancel: CancellationToken) {
        while let Some(batch) = batches.recv().await {
            if cancel.is_cancelled() {
                self.fail(batch, 0, FailureKind::Cancelled, DecisionError::UploadCancelled);
                continue;
            }
            self.deliver(batch, &cancel).await;
        }

        let stats = self.stats.snapshot();
        invoke_guarded("on_complete", || self.observer.on_complete(&stats));
        debug!("Upload delivery finished");
    }

    async fn deliver(&self, batch: Batch<WireEvent>, cancel: &CancellationToken) {
        let groups = self.group(&batch);
        let mut failures = 0u32;

        loop {
            let attempt = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = self.send_groups(&groups) => Some(result),
            };

            let err = match attempt {
                None => {
                    let attempts = failures + 1;
                    let err = DecisionError::UploadCancelled;
                    return self.fail(batch, attempts, FailureKind::Cancelled, err);
                }
                Some(Ok(())) => return self.succeed(&batch, groups.len(), failures + 1),
                Some(Err(e)) => e,
            };
            failures += 1;

            if !err.is_transient() {
                return self.fail(batch, failures, FailureKind::Fatal, err);
            }

            let Some(delay) = self.policy.next_delay(failures) else {
                let exhausted = DecisionError::RetriesExhausted {
                    attempts: failures,
                    last_error: err.to_string(),
                };
                return self.fail(batch, failures, FailureKind::RetriesExhausted, exhausted);
            };

            self.stats.retries.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("uploader.retries").increment(1);
            warn!(
                batch_id = %batch.id,
                attempt = failures,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Transient upload failure, retrying batch"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    let err = DecisionError::UploadCancelled;
                    return self.fail(batch, failures, FailureKind::Cancelled, err);
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// One body per partition, in order of first appearance.
    fn group(&self, batch: &Batch<WireEvent>) -> Vec<(String, Bytes)> {
        let mut groups: Vec<(&str, Vec<&WireEvent>)> = Vec::new();
        let mut index: HashMap<&str, usize> = HashMap::new();
        for event in &batch.items {
            let key = event.partition_key.as_str();
            match index.get(key) {
                Some(&i) => groups[i].1.push(event),
                None => {
                    index.insert(key, groups.len());
                    groups.push((key, vec![event]));
                }
            }
        }
        groups
            .into_iter()
            .map(|(key, events)| {
                (
                    key.to_string(),
                    encode_batch_body(batch.id, events, self.experimental_unit_secs),
                )
            })
            .collect()
    }

    /// Send every group concurrently. A fatal failure wins over a transient one.
    async fn send_groups(&self, groups: &[(String, Bytes)]) -> DecisionResult<()> {
        let mut set = JoinSet::new();
        for (key, body) in groups {
            let transport = Arc::clone(&self.transport);
            let key = key.clone();
            let body = body.clone();
            set.spawn(async move { transport.send(&key, body).await });
        }

        let mut transient = None;
        while let Some(joined) = set.join_next().await {
            let result = joined
                .map_err(|e| DecisionError::FatalUpload(format!("send task failed: {e}")))
                .and_then(|r| r);
            match result {
                Ok(()) => {}
                Err(e) if e.is_transient() => {
                    transient.get_or_insert(e);
                }
                Err(e) => return Err(e),
            }
        }
        transient.map_or(Ok(()), Err)
    }

    fn succeed(&self, batch: &Batch<WireEvent>, partitions: usize, attempts: u32) {
        self.stats.batches_delivered.fetch_add(1, Ordering::Relaxed);
        self.stats
            .events_delivered
            .fetch_add(batch.len() as u64, Ordering::Relaxed);
        metrics::counter!("uploader.batches_delivered").increment(1);
        metrics::counter!("uploader.events_delivered").increment(batch.len() as u64);
        metrics::histogram!("uploader.batch_bytes").record(batch.byte_size as f64);
        debug!(batch_id = %batch.id, count = batch.len(), attempts, "Batch delivered");

        let summary = BatchSummary {
            batch_id: batch.id,
            event_count: batch.len(),
            byte_size: batch.byte_size,
            partitions,
            attempts,
        };
        invoke_guarded("on_success", || self.observer.on_success(&summary));
    }

    fn fail(&self, batch: Batch<WireEvent>, attempts: u32, kind: FailureKind, err: DecisionError) {
        self.stats.batches_failed.fetch_add(1, Ordering::Relaxed);
        self.stats
            .events_failed
            .fetch_add(batch.len() as u64, Ordering::Relaxed);
        metrics::counter!("uploader.batches_failed").increment(1);
        error!(
            batch_id = %batch.id,
            count = batch.len(),
            attempts,
            kind = ?kind,
            error = %err,
            "Batch upload abandoned"
        );

        let failure = UploadFailure {
            batch_id: Some(batch.id),
            event_count: batch.len(),
            attempts,
            kind,
            error: Arc::new(err),
            events: Arc::from(batch.items),
            envelope: None,
        };
        invoke_guarded("on_error", || self.observer.on_error(&failure));
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::observer::CaptureObserver;
    use crate::transport::{MemoryTransport, ScriptedOutcome};
    use decision_core::config::{RetryConfig, RetryKind};
    use serde_json::{json, Value};

    fn config(adjust: impl FnOnce(&mut BatchingConfig)) -> BatchingConfig {
        let mut config = BatchingConfig {
            max_event_count: 100,
            retry: RetryConfig {
                policy: RetryKind::Exponential,
                base_delay_ms: 1_000,
                max_backoff_ms: 4_000,
                max_retries: 3,
                jitter: false,
            },
            ..Default::default()
        };
        adjust(&mut config);
        config
    }

    fn uploader(
        config: &BatchingConfig,
        transport: &Arc<MemoryTransport>,
    ) -> (ReliableUploader, Arc<CaptureObserver>) {
        let observer = Arc::new(CaptureObserver::new());
        let uploader = ReliableUploader::new(
            config,
            WireCodec::default(),
            Arc::clone(transport) as Arc<dyn EventTransport>,
            Arc::clone(&observer) as Arc<dyn UploadObserver>,
        )
        .unwrap();
        (uploader, observer)
    }

    fn events_in(body: &Bytes) -> Vec<Value> {
        let v: Value = serde_json::from_slice(body).unwrap();
        v["j"].as_array().unwrap().clone()
    }

    fn observation(key: &str, n: i64) -> EventEnvelope {
        EventEnvelope::observation(key, json!(n))
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_report_once() {
        let transport = Arc::new(MemoryTransport::with_script([ScriptedOutcome::Transient; 4]));
        let (uploader, observer) = uploader(&config(|_| {}), &transport);

        uploader.upload(observation("k1", 1)).await.unwrap();
        uploader.upload(observation("k1", 2)).await.unwrap();
        let stats = uploader.shutdown(Duration::from_secs(60)).await;

        assert_eq!(transport.attempts(), 4);
        assert!(transport.sent().is_empty());
        assert!(observer.successes().is_empty());
        let failures = observer.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].kind, FailureKind::RetriesExhausted);
        assert_eq!(failures[0].attempts, 4);
        assert_eq!(failures[0].event_count, 2);
        assert!(matches!(
            *failures[0].error,
            DecisionError::RetriesExhausted { attempts: 4, .. }
        ));
        assert!(failures[0].envelope.is_none());
        let lost: Vec<_> = failures[0]
            .events
            .iter()
            .map(|e| {
                let v: Value = serde_json::from_slice(&e.body).unwrap();
                (e.key.clone(), v["a"].clone())
            })
            .collect();
        assert_eq!(
            lost,
            vec![("k1".to_string(), json!(1)), ("k1".to_string(), json!(2))]
        );
        assert_eq!(stats.retries, 3);
        assert_eq!(stats.events_failed, 2);
        assert_eq!(observer.completions().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_then_success() {
        let transport = Arc::new(MemoryTransport::with_script([ScriptedOutcome::Transient]));
        let (uploader, observer) = uploader(&config(|_| {}), &transport);

        uploader.upload(observation("k1", 1)).await.unwrap();
        let stats = uploader.shutdown(Duration::from_secs(60)).await;

        assert_eq!(observer.successes()[0].attempts, 2);
        assert!(observer.failures().is_empty());
        assert_eq!(stats.events_delivered, 1);
        assert_eq!(stats.retries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_failure_is_not_retried() {
        let transport = Arc::new(MemoryTransport::with_script([ScriptedOutcome::Fatal]));
        let (uploader, observer) = uploader(&config(|_| {}), &transport);

        uploader.upload(observation("k1", 1)).await.unwrap();
        uploader.shutdown(Duration::from_secs(60)).await;

        assert_eq!(transport.attempts(), 1);
        let failures = observer.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].kind, FailureKind::Fatal);
    }

    #[tokio::test]
    async fn test_groups_by_partition_in_order() {
        let transport = Arc::new(MemoryTransport::new());
        let cfg = config(|c| c.experimental_unit_duration_secs = Some(600));
        let (uploader, observer) = uploader(&cfg, &transport);

        for (key, n) in [("a", 1), ("b", 2), ("a", 3)] {
            uploader.upload(observation(key, n)).await.unwrap();
        }
        uploader.shutdown(Duration::from_secs(5)).await;

        let sent = transport.sent();
        assert_eq!(sent.len(), 2);
        let a = sent.iter().find(|(k, _)| k == "a").unwrap();
        let events = events_in(&a.1);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["a"], 1);
        assert_eq!(events[1]["a"], 3);
        let body: Value = serde_json::from_slice(&a.1).unwrap();
        assert_eq!(body["d"], 600);
        assert_eq!(observer.successes()[0].partitions, 2);
    }

    #[tokio::test]
    async fn test_try_upload_full_queue_returns_false() {
        let transport = Arc::new(MemoryTransport::new());
        let (uploader, _) = uploader(&config(|c| c.max_upload_queue_capacity = 1), &transport);

        // The intake task cannot run until this task yields.
        assert!(uploader.try_upload(observation("k", 1)));
        assert!(!uploader.try_upload(observation("k", 2)));
        assert_eq!(uploader.queue_level(), 1.0);

        // `upload` waits for the intake task to make room.
        uploader.upload(observation("k", 3)).await.unwrap();
        uploader.shutdown(Duration::from_secs(5)).await;

        let values: Vec<Value> = transport
            .sent()
            .iter()
            .flat_map(|(_, body)| events_in(body))
            .map(|e| e["a"].clone())
            .collect();
        assert_eq!(values, vec![json!(1), json!(3)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_trigger_ships_partial_batch() {
        let transport = Arc::new(MemoryTransport::new());
        let (uploader, _) = uploader(&config(|c| c.max_duration_ms = 5_000), &transport);

        uploader.upload(observation("k", 1)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(transport.sent().len(), 1);

        uploader.shutdown(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_dropping_policy() {
        let transport = Arc::new(MemoryTransport::new());
        let cfg = config(|c| {
            c.dropping.max_queue_level_before_drop = 0.0;
            c.dropping.probability_of_drop = 1.0;
        });
        let (uploader, _) = uploader(&cfg, &transport);

        let interaction = EventEnvelope::new("i1", EventKind::Interaction);
        assert!(uploader.try_upload(interaction));
        assert!(uploader.try_upload(observation("o1", 1)));
        let stats = uploader.shutdown(Duration::from_secs(5)).await;

        assert_eq!(stats.events_dropped, 1);
        assert_eq!(stats.events_delivered, 1);
    }

    #[tokio::test]
    async fn test_drop_notice_replaces_interaction() {
        let transport = Arc::new(MemoryTransport::new());
        let cfg = config(|c| {
            c.dropping.max_queue_level_before_drop = 0.0;
            c.dropping.probability_of_drop = 1.0;
            c.dropping.emit_drop_notice = true;
        });
        let (uploader, _) = uploader(&cfg, &transport);

        uploader
            .upload(EventEnvelope::new("i1", EventKind::Interaction))
            .await
            .unwrap();
        uploader.shutdown(Duration::from_secs(5)).await;

        let events = events_in(&transport.sent()[0].1);
        assert_eq!(events[0]["EventId"], "i1");
        assert_eq!(events[0]["pdrop"], 1.0);
    }

    #[tokio::test]
    async fn test_serialization_failure_does_not_block_others() {
        let transport = Arc::new(MemoryTransport::new());
        let (uploader, observer) = uploader(&config(|_| {}), &transport);

        let mut bad = EventEnvelope::new("bad", EventKind::Interaction);
        bad.context = Some(decision_core::types::ContextPayload::Serialized("{oops".into()));
        uploader.upload(bad).await.unwrap();
        uploader.upload(observation("good", 1)).await.unwrap();
        let stats = uploader.shutdown(Duration::from_secs(5)).await;

        let failures = observer.failures();
        assert_eq!(failures[0].kind, FailureKind::Serialization);
        assert!(failures[0].events.is_empty());
        assert_eq!(failures[0].envelope.as_ref().unwrap().key(), "bad");
        assert_eq!(stats.events_delivered, 1);
        assert_eq!(stats.events_failed, 1);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent_and_closes_queue() {
        let transport = Arc::new(MemoryTransport::new());
        let (uploader, observer) = uploader(&config(|_| {}), &transport);

        uploader.upload(observation("k", 1)).await.unwrap();
        let first = uploader.shutdown(Duration::from_secs(5)).await;
        let second = uploader.shutdown(Duration::from_secs(5)).await;

        assert_eq!(first, second);
        assert_eq!(observer.completions().len(), 1);
        assert!(!uploader.try_upload(observation("k", 2)));
        assert!(matches!(
            uploader.upload(observation("k", 3)).await,
            Err(DecisionError::BatcherClosed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_stuck_retries() {
        let transport = Arc::new(MemoryTransport::with_script([ScriptedOutcome::Transient; 10]));
        let cfg = config(|c| {
            c.retry.max_retries = 10;
            c.retry.base_delay_ms = 10_000;
            c.retry.max_backoff_ms = 60_000;
        });
        let (uploader, observer) = uploader(&cfg, &transport);

        uploader.upload(observation("k", 1)).await.unwrap();
        uploader.shutdown(Duration::from_secs(1)).await;

        let failures = observer.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].kind, FailureKind::Cancelled);
        assert_eq!(failures[0].events.len(), 1);
        assert_eq!(observer.completions().len(), 1);
        assert_eq!(uploader.stats().events_failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_after_drained_tasks_within_grace() {
        let transport = Arc::new(MemoryTransport::new());
        let (uploader, observer) = uploader(&config(|_| {}), &transport);

        uploader.upload(observation("k", 1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let stats = uploader.shutdown(Duration::from_secs(5)).await;

        assert_eq!(stats.events_delivered, 1);
        assert_eq!(observer.completions().len(), 1);
    }

    /// Holds every send until the gate is opened.
    struct GatedTransport {
        open: tokio::sync::Semaphore,
        inner: MemoryTransport,
    }

    #[async_trait::async_trait]
    impl EventTransport for GatedTransport {
        async fn send(&self, partition_key: &str, body: Bytes) -> DecisionResult<()> {
            let _permit = self.open.acquire().await.unwrap();
            self.inner.send(partition_key, body).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_upload_waits_while_pipeline_is_full() {
        let transport = Arc::new(GatedTransport {
            open: tokio::sync::Semaphore::new(0),
            inner: MemoryTransport::new(),
        });
        let cfg = config(|c| {
            c.max_upload_queue_capacity = 1;
            c.max_event_count = 1;
            c.max_pending_batches = 1;
        });
        let uploader = Arc::new(
            ReliableUploader::new(
                &cfg,
                WireCodec::default(),
                Arc::clone(&transport) as Arc<dyn EventTransport>,
                Arc::new(crate::observer::NoOpObserver),
            )
            .unwrap(),
        );

        // Fill the delivery slot, the pending batch, the batcher and the queue.
        let mut queued = 0;
        loop {
            let send = uploader.upload(observation("k", queued));
            match tokio::time::timeout(Duration::from_millis(100), send).await {
                Ok(result) => {
                    result.unwrap();
                    queued += 1;
                }
                Err(_) => break,
            }
            assert!(queued < 10, "queue never filled");
        }
        assert_eq!(uploader.queue_level(), 1.0);

        let waiting = tokio::spawn({
            let uploader = Arc::clone(&uploader);
            async move { uploader.upload(observation("k", 99)).await }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!waiting.is_finished());

        transport.open.add_permits(1);
        waiting.await.unwrap().unwrap();
        let stats = uploader.shutdown(Duration::from_secs(5)).await;

        assert_eq!(stats.events_delivered, queued as u64 + 1);
        let values: Vec<Value> = transport
            .inner
            .sent()
            .iter()
            .flat_map(|(_, body)| events_in(body))
            .map(|e| e["a"].clone())
            .collect();
        assert_eq!(values.last(), Some(&json!(99)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_upload_blocking_from_plain_thread() {
        let transport = Arc::new(MemoryTransport::new());
        let (uploader, _) = uploader(&config(|_| {}), &transport);
        let uploader = Arc::new(uploader);

        let blocking = Arc::clone(&uploader);
        tokio::task::spawn_blocking(move || {
            for n in 0..3 {
                blocking.upload_blocking(observation("k", n)).unwrap();
            }
        })
        .await
        .unwrap();
        let stats = uploader.shutdown(Duration::from_secs(5)).await;
        assert_eq!(stats.events_delivered, 3);

        let closed = Arc::clone(&uploader);
        let result = tokio::task::spawn_blocking(move || closed.upload_blocking(observation("k", 4)))
            .await
            .unwrap();
        assert!(matches!(result, Err(DecisionError::BatcherClosed)));
    }

    struct PanickingObserver;

    impl UploadObserver for PanickingObserver {
        fn on_success(&self, _summary: &BatchSummary) {
            panic!("observer bug");
        }
    }

    #[tokio::test]
    async fn test_observer_panic_is_contained() {
        let transport = Arc::new(MemoryTransport::new());
        let uploader = ReliableUploader::new(
            &config(|c| c.max_event_count = 1),
            WireCodec::default(),
            Arc::clone(&transport) as Arc<dyn EventTransport>,
            Arc::new(PanickingObserver),
        )
        .unwrap();

        uploader.upload(observation("k", 1)).await.unwrap();
        uploader.upload(observation("k", 2)).await.unwrap();
        let stats = uploader.shutdown(Duration::from_secs(5)).await;
        assert_eq!(stats.events_delivered, 2);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let result = ReliableUploader::new(
                &config(|c| c.max_event_count = 0),
                WireCodec::default(),
                Arc::new(MemoryTransport::new()),
                Arc::new(crate::observer::NoOpObserver),
            );
            assert!(matches!(result, Err(DecisionError::Config(_))));
        });
    }
}
