//! Media worker pool: drains ProcessingTasks from an unbounded queue.
//!
//! Per task: validate → decide → transcode or copy → requeue on failure.
//! Failed tasks wait out their backoff off the workers, in a tracked delay
//! task, so one failing file never stalls the queue behind it.
//! A copy through ZeroCopyTransfer is the universal fallback, so a bad
//! transcode never loses the media; only a failed copy fails the attempt.

use crate::domain::{
    CopyReason, DomainError, MediaKind, ProcessingTask, ProcessingThresholds, TaskOutcome,
    TaskState, needs_processing,
};
use crate::ports::TranscoderPort;
use crate::shared::retry::{RetryConfig, RetryPolicy};
use crate::shared::zero_copy::ZeroCopyTransfer;
use parking_lot::Mutex;
use serde::Serialize;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// RetryPolicy bucket for media task attempts.
pub const MEDIA_OPERATION: &str = "media-transform";

#[derive(Debug, Clone)]
pub struct MediaPoolConfig {
    pub workers: usize,
    /// How long an idle worker waits on the queue before re-checking for shutdown.
    pub dequeue_timeout: Duration,
    pub thresholds: ProcessingThresholds,
    /// Backoff between attempts of a failed task.
    pub retry: RetryConfig,
    /// Transcoded output below this fraction of the source is rejected.
    pub min_output_ratio: f64,
    pub verify_copies: bool,
}

impl Default for MediaPoolConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            dequeue_timeout: Duration::from_millis(500),
            thresholds: ProcessingThresholds::default(),
            retry: RetryConfig::default().with_delays(500, 10_000),
            min_output_ratio: 0.01,
            verify_copies: true,
        }
    }
}

/// A task that exhausted its attempts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedTask {
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub kind: MediaKind,
    pub attempts: u32,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MediaPoolStats {
    pub enqueued: u64,
    pub transformed: u64,
    pub copied_not_needed: u64,
    pub copied_after_transform_failure: u64,
    pub invalid_outputs: u64,
    pub requeued: u64,
    pub permanently_failed: u64,
    pub unfinished: u64,
}

#[derive(Debug, Default)]
struct PoolCounters {
    enqueued: AtomicU64,
    transformed: AtomicU64,
    copied_not_needed: AtomicU64,
    copied_after_transform_failure: AtomicU64,
    invalid_outputs: AtomicU64,
    requeued: AtomicU64,
    permanently_failed: AtomicU64,
    unfinished: AtomicU64,
}

/// What `shutdown` could not complete.
#[derive(Debug, Clone, Default)]
pub struct ShutdownReport {
    pub unfinished: Vec<PathBuf>,
    pub aborted_workers: usize,
}

struct QueuedTask {
    task: ProcessingTask,
    reply: Option<oneshot::Sender<TaskOutcome>>,
}

/// Received tasks not yet taken by a worker: highest priority first, FIFO
/// within a priority.
#[derive(Default)]
struct ReadyQueue {
    heap: BinaryHeap<Ranked>,
    seq: u64,
}

struct Ranked {
    priority: u8,
    seq: u64,
    queued: QueuedTask,
}

impl Ord for Ranked {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Ranked {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Ranked {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for Ranked {}

impl ReadyQueue {
    fn push(&mut self, queued: QueuedTask) {
        self.seq += 1;
        self.heap.push(Ranked {
            priority: queued.task.priority,
            seq: self.seq,
            queued,
        });
    }

    fn pop(&mut self) -> Option<QueuedTask> {
        self.heap.pop().map(|r| r.queued)
    }
}

/// Await the final outcome of an enqueued task.
pub struct TaskHandle {
    rx: oneshot::Receiver<TaskOutcome>,
}

impl TaskHandle {
    pub async fn outcome(self) -> TaskOutcome {
        self.rx.await.unwrap_or(TaskOutcome::Unfinished)
    }
}

struct PoolShared {
    tx: mpsc::UnboundedSender<QueuedTask>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<QueuedTask>>,
    /// Only touched while `rx` is locked.
    ready: Mutex<ReadyQueue>,
    transcoder: Arc<dyn TranscoderPort>,
    transfer: Arc<ZeroCopyTransfer>,
    retry: Arc<RetryPolicy>,
    config: MediaPoolConfig,
    /// Enqueued and not yet terminal (queued, waiting to retry, or in flight).
    pending: AtomicUsize,
    idle: Notify,
    counters: PoolCounters,
    failed: Mutex<Vec<FailedTask>>,
    /// worker index -> input currently being processed
    in_flight: Mutex<HashMap<usize, PathBuf>>,
    /// Failed tasks waiting out their retry delay, by wait id.
    waiting: Mutex<HashMap<u64, QueuedTask>>,
    next_wait_id: AtomicU64,
    delays: Mutex<JoinSet<()>>,
    cancel: CancellationToken,
}

pub struct MediaWorkerPool {
    shared: Arc<PoolShared>,
    workers: Mutex<Option<JoinSet<()>>>,
}

impl MediaWorkerPool {
    /// Create the pool and spawn its workers. Must be called inside a Tokio runtime.
    pub fn start(
        config: MediaPoolConfig,
        transcoder: Arc<dyn TranscoderPort>,
        transfer: Arc<ZeroCopyTransfer>,
        retry: Arc<RetryPolicy>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker_count = config.workers.max(1);
        let shared = Arc::new(PoolShared {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            ready: Mutex::new(ReadyQueue::default()),
            transcoder,
            transfer,
            retry,
            config,
            pending: AtomicUsize::new(0),
            idle: Notify::new(),
            counters: PoolCounters::default(),
            failed: Mutex::new(Vec::new()),
            in_flight: Mutex::new(HashMap::new()),
            waiting: Mutex::new(HashMap::new()),
            next_wait_id: AtomicU64::new(0),
            delays: Mutex::new(JoinSet::new()),
            cancel: CancellationToken::new(),
        });

        let mut join_set = JoinSet::new();
        for i in 0..worker_count {
            let shared = Arc::clone(&shared);
            join_set.spawn(shared.run_worker(i));
        }
        info!(workers = worker_count, "media worker pool started");
        Self {
            shared,
            workers: Mutex::new(Some(join_set)),
        }
    }

    /// Queue a task. Never blocks; fails only once shutdown has begun.
    pub fn enqueue(&self, mut task: ProcessingTask) -> Result<TaskHandle, DomainError> {
        if self.shared.cancel.is_cancelled() {
            return Err(DomainError::Shutdown("media pool is shutting down".into()));
        }
        task.state = TaskState::Pending;
        let (reply, rx) = oneshot::channel();
        self.shared.pending.fetch_add(1, Ordering::SeqCst);
        let queued = QueuedTask {
            task,
            reply: Some(reply),
        };
        if self.shared.tx.send(queued).is_err() {
            self.shared.release_pending();
            return Err(DomainError::Shutdown("media queue closed".into()));
        }
        self.shared.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        Ok(TaskHandle { rx })
    }

    pub fn is_idle(&self) -> bool {
        self.shared.pending.load(Ordering::SeqCst) == 0
    }

    pub fn pending(&self) -> usize {
        self.shared.pending.load(Ordering::SeqCst)
    }

    /// Wait until queue and in-flight work are drained. Returns false on timeout.
    pub async fn wait_until_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_idle() {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.is_idle();
            }
        }
    }

    /// Stop handing out work, let running tasks finish within `grace`, then
    /// abort stragglers. Everything not completed is reported.
    pub async fn shutdown(&self, grace: Duration) -> ShutdownReport {
        info!(pending = self.pending(), "stopping media worker pool");
        self.shared.cancel.cancel();
        let mut report = ShutdownReport::default();

        let join_set = self.workers.lock().take();
        if let Some(mut join_set) = join_set {
            let drained = tokio::time::timeout(grace, async {
                while join_set.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                report.aborted_workers = join_set.len();
                warn!(
                    aborted = report.aborted_workers,
                    "grace period elapsed, aborting media workers"
                );
                join_set.abort_all();
                while join_set.join_next().await.is_some() {}
            }
        }

        let mut delays = std::mem::take(&mut *self.shared.delays.lock());
        delays.abort_all();
        while delays.join_next().await.is_some() {}

        let stranded: Vec<PathBuf> = self.shared.in_flight.lock().drain().map(|(_, p)| p).collect();
        for path in stranded {
            self.shared.counters.unfinished.fetch_add(1, Ordering::Relaxed);
            self.shared.release_pending();
            report.unfinished.push(path);
        }

        let parked: Vec<QueuedTask> = self.shared.waiting.lock().drain().map(|(_, q)| q).collect();
        for queued in parked {
            report.unfinished.push(queued.task.input_path.clone());
            self.shared.counters.unfinished.fetch_add(1, Ordering::Relaxed);
            self.shared.finish(queued.reply, TaskOutcome::Unfinished);
        }

        let mut rx = self.shared.rx.lock().await;
        let mut left = Vec::new();
        while let Some(queued) = self.shared.ready.lock().pop() {
            left.push(queued);
        }
        while let Ok(queued) = rx.try_recv() {
            left.push(queued);
        }
        for queued in left {
            report.unfinished.push(queued.task.input_path.clone());
            self.shared.counters.unfinished.fetch_add(1, Ordering::Relaxed);
            self.shared.finish(queued.reply, TaskOutcome::Unfinished);
        }
        info!(unfinished = report.unfinished.len(), "media worker pool stopped");
        report
    }

    pub fn stats(&self) -> MediaPoolStats {
        let c = &self.shared.counters;
        MediaPoolStats {
            enqueued: c.enqueued.load(Ordering::Relaxed),
            transformed: c.transformed.load(Ordering::Relaxed),
            copied_not_needed: c.copied_not_needed.load(Ordering::Relaxed),
            copied_after_transform_failure: c.copied_after_transform_failure.load(Ordering::Relaxed),
            invalid_outputs: c.invalid_outputs.load(Ordering::Relaxed),
            requeued: c.requeued.load(Ordering::Relaxed),
            permanently_failed: c.permanently_failed.load(Ordering::Relaxed),
            unfinished: c.unfinished.load(Ordering::Relaxed),
        }
    }

    pub fn failed_tasks(&self) -> Vec<FailedTask> {
        self.shared.failed.lock().clone()
    }
}

impl PoolShared {
    async fn run_worker(self: Arc<Self>, index: usize) {
        debug!(worker = index, "media worker started");
        loop {
            let queued = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                next = self.dequeue() => next,
            };
            let Some(queued) = queued else {
                continue;
            };

            self.in_flight
                .lock()
                .insert(index, queued.task.input_path.clone());
            self.handle(queued).await;
            self.in_flight.lock().remove(&index);
        }
        debug!(worker = index, "media worker stopped");
    }

    /// Highest-priority task received so far, waiting up to `dequeue_timeout`
    /// when none is ready.
    async fn dequeue(&self) -> Option<QueuedTask> {
        let mut rx = self.rx.lock().await;
        while let Ok(queued) = rx.try_recv() {
            self.ready.lock().push(queued);
        }
        let next = self.ready.lock().pop();
        if next.is_some() {
            return next;
        }
        tokio::time::timeout(self.config.dequeue_timeout, rx.recv())
            .await
            .ok()
            .flatten()
    }

    async fn handle(self: &Arc<Self>, mut queued: QueuedTask) {
        let started = Instant::now();
        let result = self.run_attempt(&mut queued.task).await;
        self.retry
            .record(MEDIA_OPERATION, result.is_ok(), started.elapsed());

        let task = &mut queued.task;
        match result {
            Ok(outcome) => {
                task.state = TaskState::Succeeded;
                self.finish(queued.reply, outcome);
            }
            Err(e) => {
                task.attempts += 1;
                task.state = TaskState::Failed;
                if task.can_retry() {
                    let delay =
                        self.retry
                            .compute_delay(task.attempts, MEDIA_OPERATION, &self.config.retry);
                    warn!(
                        input = %task.input_path.display(),
                        attempts = task.attempts,
                        max_attempts = task.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "media task failed, requeueing"
                    );
                    task.state = TaskState::Pending;
                    self.counters.requeued.fetch_add(1, Ordering::Relaxed);
                    self.schedule_retry(queued, delay);
                } else {
                    task.state = TaskState::PermanentlyFailed;
                    error!(
                        input = %task.input_path.display(),
                        attempts = task.attempts,
                        error = %e,
                        "media task permanently failed"
                    );
                    self.failed.lock().push(FailedTask {
                        input_path: task.input_path.clone(),
                        output_path: task.output_path.clone(),
                        kind: task.media_kind,
                        attempts: task.attempts,
                        error: e.to_string(),
                    });
                    self.counters
                        .permanently_failed
                        .fetch_add(1, Ordering::Relaxed);
                    let outcome = TaskOutcome::PermanentlyFailed {
                        error: e.to_string(),
                        attempts: task.attempts,
                    };
                    self.finish(queued.reply, outcome);
                }
            }
        }
    }

    /// Park a failed task until `delay` elapses, then put it back on the queue.
    /// Parked tasks stay visible to `shutdown` through `waiting`.
    fn schedule_retry(self: &Arc<Self>, queued: QueuedTask, delay: Duration) {
        let id = self.next_wait_id.fetch_add(1, Ordering::Relaxed);
        self.waiting.lock().insert(id, queued);
        let shared = Arc::clone(self);
        let mut delays = self.delays.lock();
        while delays.try_join_next().is_some() {}
        delays.spawn(async move {
            tokio::select! {
                biased;
                _ = shared.cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => shared.release_waiting(id),
            }
        });
    }

    fn release_waiting(&self, id: u64) {
        let mut waiting = self.waiting.lock();
        // after cancel the shutdown sweep owns everything still parked
        if self.cancel.is_cancelled() {
            return;
        }
        if let Some(queued) = waiting.remove(&id) {
            if let Err(mpsc::error::SendError(lost)) = self.tx.send(queued) {
                self.finish(lost.reply, TaskOutcome::Unfinished);
            }
        }
    }

    /// One pass through the task state machine. `Err` means the attempt failed
    /// even after the copy fallback.
    async fn run_attempt(&self, task: &mut ProcessingTask) -> Result<TaskOutcome, DomainError> {
        task.state = TaskState::Validating;
        let source_size = validate_input(&task.input_path).await?;
        let thresholds = &self.config.thresholds;

        if task.metadata.is_none() && thresholds.enabled && task.media_kind.handler().transformable {
            match self.transcoder.probe(&task.input_path).await {
                Ok(meta) => task.metadata = meta,
                Err(e) => debug!(input = %task.input_path.display(), error = %e, "probe failed"),
            }
        }
        if let Some(meta) = task.metadata.as_mut() {
            meta.size_bytes.get_or_insert(source_size);
        }

        let needed = needs_processing(
            task.media_kind,
            task.metadata.as_ref(),
            &task.settings,
            thresholds,
        );
        if !needed {
            task.state = TaskState::Skipped;
            let bytes = self.copy(task).await?;
            self.counters
                .copied_not_needed
                .fetch_add(1, Ordering::Relaxed);
            return Ok(TaskOutcome::Copied {
                output: task.output_path.clone(),
                bytes,
                reason: CopyReason::NotNeeded,
            });
        }

        task.state = TaskState::Transforming;
        if let Some(parent) = task.output_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DomainError::Media(format!("create {}: {}", parent.display(), e)))?;
        }
        let transformed = self
            .transcoder
            .transcode(
                &task.input_path,
                &task.output_path,
                task.media_kind,
                &task.settings,
            )
            .await;
        let reason = match transformed {
            Ok(()) => {
                let produced = output_size(&task.output_path).await;
                let floor = source_size as f64 * self.config.min_output_ratio;
                match produced {
                    Some(n) if n > 0 && n as f64 >= floor => {
                        self.counters.transformed.fetch_add(1, Ordering::Relaxed);
                        debug!(input = %task.input_path.display(), source_size, output_size = n, "transform ok");
                        return Ok(TaskOutcome::Transformed {
                            output: task.output_path.clone(),
                            bytes: n,
                        });
                    }
                    other => {
                        warn!(
                            input = %task.input_path.display(),
                            source_size,
                            output_size = other.unwrap_or(0),
                            "transform claimed success but output is unusable, copying original"
                        );
                        self.counters.invalid_outputs.fetch_add(1, Ordering::Relaxed);
                        CopyReason::InvalidOutput
                    }
                }
            }
            Err(e) => {
                warn!(input = %task.input_path.display(), error = %e, "transform failed, copying original");
                CopyReason::TransformFailed
            }
        };

        let bytes = self.copy(task).await?;
        self.counters
            .copied_after_transform_failure
            .fetch_add(1, Ordering::Relaxed);
        Ok(TaskOutcome::Copied {
            output: task.output_path.clone(),
            bytes,
            reason,
        })
    }

    async fn copy(&self, task: &ProcessingTask) -> Result<u64, DomainError> {
        self.transfer
            .copy(&task.input_path, &task.output_path, self.config.verify_copies)
            .await
    }

    fn finish(&self, reply: Option<oneshot::Sender<TaskOutcome>>, outcome: TaskOutcome) {
        if let Some(reply) = reply {
            let _ = reply.send(outcome);
        }
        self.release_pending();
    }

    fn release_pending(&self) {
        let before = self
            .pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        if before <= 1 {
            self.idle.notify_waiters();
        }
    }
}

async fn validate_input(path: &Path) -> Result<u64, DomainError> {
    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|e| DomainError::Media(format!("input {}: {}", path.display(), e)))?;
    if !meta.is_file() {
        return Err(DomainError::Media(format!("input {} is not a file", path.display())));
    }
    if meta.len() == 0 {
        return Err(DomainError::Media(format!("input {} is empty", path.display())));
    }
    Ok(meta.len())
}

async fn output_size(path: &Path) -> Option<u64> {
    tokio::fs::metadata(path).await.ok().map(|m| m.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{MediaMetadata, MediaSettings};
    use async_trait::async_trait;
    use tempfile::TempDir;

    #[derive(Clone, Copy)]
    enum Behavior {
        /// Writes `n` bytes and reports success.
        Write(usize),
        Fail,
        Slow(Duration),
    }

    struct FakeTranscoder {
        behavior: Behavior,
        calls: AtomicUsize,
    }

    impl FakeTranscoder {
        fn new(behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                behavior,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl TranscoderPort for FakeTranscoder {
        async fn probe(&self, _input: &Path) -> Result<Option<MediaMetadata>, DomainError> {
            Ok(None)
        }

        async fn transcode(
            &self,
            _input: &Path,
            output: &Path,
            _kind: MediaKind,
            _settings: &MediaSettings,
        ) -> Result<(), DomainError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.behavior {
                Behavior::Write(n) => {
                    tokio::fs::write(output, vec![1u8; n]).await.unwrap();
                    Ok(())
                }
                Behavior::Fail => Err(DomainError::Transform("unsupported codec".into())),
                Behavior::Slow(d) => {
                    tokio::time::sleep(d).await;
                    tokio::fs::write(output, vec![1u8; 4096]).await.unwrap();
                    Ok(())
                }
            }
        }
    }

    fn config(workers: usize) -> MediaPoolConfig {
        MediaPoolConfig {
            workers,
            dequeue_timeout: Duration::from_millis(20),
            retry: RetryConfig::default().with_delays(1, 5).without_jitter(),
            ..Default::default()
        }
    }

    fn pool(transcoder: Arc<FakeTranscoder>, workers: usize) -> MediaWorkerPool {
        MediaWorkerPool::start(
            config(workers),
            transcoder,
            Arc::new(ZeroCopyTransfer::default()),
            Arc::new(RetryPolicy::new()),
        )
    }

    fn source(dir: &TempDir, name: &str, size: usize) -> PathBuf {
        let p = dir.path().join(name);
        std::fs::write(&p, vec![9u8; size]).unwrap();
        p
    }

    #[tokio::test]
    async fn documents_are_copied_without_transcoding() {
        let dir = TempDir::new().unwrap();
        let fake = FakeTranscoder::new(Behavior::Fail);
        let pool = pool(fake.clone(), 2);
        let input = source(&dir, "doc.pdf", 5000);
        let output = dir.path().join("out/doc.pdf");
        let outcome = pool
            .enqueue(ProcessingTask::new(input, output.clone(), MediaKind::Document))
            .unwrap()
            .outcome()
            .await;
        assert_eq!(
            outcome,
            TaskOutcome::Copied {
                output: output.clone(),
                bytes: 5000,
                reason: CopyReason::NotNeeded
            }
        );
        assert_eq!(fake.calls.load(Ordering::SeqCst), 0);
        assert_eq!(pool.stats().copied_not_needed, 1);
        pool.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn empty_transform_output_falls_back_to_verified_copy() {
        let dir = TempDir::new().unwrap();
        let pool = pool(FakeTranscoder::new(Behavior::Write(0)), 1);
        let input = source(&dir, "clip.mp4", 20_000);
        let output = dir.path().join("clip.out.mp4");
        let outcome = pool
            .enqueue(ProcessingTask::new(input, output.clone(), MediaKind::Video))
            .unwrap()
            .outcome()
            .await;
        assert!(matches!(
            outcome,
            TaskOutcome::Copied {
                reason: CopyReason::InvalidOutput,
                ..
            }
        ));
        assert_eq!(std::fs::metadata(&output).unwrap().len(), 20_000);
        assert_eq!(pool.stats().invalid_outputs, 1);
        pool.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn near_empty_output_is_rejected_but_small_valid_output_is_kept() {
        let dir = TempDir::new().unwrap();
        // 99 bytes < 1% of 10_000
        let pool_bad = pool(FakeTranscoder::new(Behavior::Write(99)), 1);
        let input = source(&dir, "a.jpg", 10_000);
        let out = dir.path().join("a.out.jpg");
        let outcome = pool_bad
            .enqueue(ProcessingTask::new(input.clone(), out.clone(), MediaKind::Image))
            .unwrap()
            .outcome()
            .await;
        assert!(matches!(outcome, TaskOutcome::Copied { reason: CopyReason::InvalidOutput, .. }));
        assert_eq!(std::fs::metadata(&out).unwrap().len(), 10_000);
        pool_bad.shutdown(Duration::from_secs(1)).await;

        let pool_ok = pool(FakeTranscoder::new(Behavior::Write(100)), 1);
        let out = dir.path().join("b.out.jpg");
        let outcome = pool_ok
            .enqueue(ProcessingTask::new(input, out.clone(), MediaKind::Image))
            .unwrap()
            .outcome()
            .await;
        assert_eq!(outcome, TaskOutcome::Transformed { output: out, bytes: 100 });
        pool_ok.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn transform_error_copies_original() {
        let dir = TempDir::new().unwrap();
        let pool = pool(FakeTranscoder::new(Behavior::Fail), 1);
        let input = source(&dir, "v.mkv", 3000);
        let out = dir.path().join("v.out.mkv");
        let outcome = pool
            .enqueue(ProcessingTask::new(input, out.clone(), MediaKind::Video))
            .unwrap()
            .outcome()
            .await;
        assert!(matches!(outcome, TaskOutcome::Copied { reason: CopyReason::TransformFailed, .. }));
        assert_eq!(std::fs::read(&out).unwrap(), vec![9u8; 3000]);
        assert_eq!(pool.stats().copied_after_transform_failure, 1);
        pool.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn missing_input_fails_permanently_and_pool_keeps_working() {
        let dir = TempDir::new().unwrap();
        let pool = pool(FakeTranscoder::new(Behavior::Write(4096)), 2);
        let missing = ProcessingTask::new(
            dir.path().join("gone.mp4"),
            dir.path().join("gone.out.mp4"),
            MediaKind::Video,
        )
        .with_max_attempts(3);
        let outcome = pool.enqueue(missing).unwrap().outcome().await;
        assert!(matches!(outcome, TaskOutcome::PermanentlyFailed { attempts: 3, .. }));

        let input = source(&dir, "ok.mp4", 8000);
        let outcome = pool
            .enqueue(ProcessingTask::new(input, dir.path().join("ok.out.mp4"), MediaKind::Video))
            .unwrap()
            .outcome()
            .await;
        assert!(outcome.is_success());

        let stats = pool.stats();
        assert_eq!(stats.requeued, 2);
        assert_eq!(stats.permanently_failed, 1);
        let failed = pool.failed_tasks();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].attempts, 3);
        assert!(pool.wait_until_idle(Duration::from_secs(1)).await);
        pool.shutdown(Duration::from_secs(1)).await;
    }

    fn slow_retry_pool(transcoder: Arc<FakeTranscoder>) -> MediaWorkerPool {
        MediaWorkerPool::start(
            MediaPoolConfig {
                retry: RetryConfig::default()
                    .with_delays(10_000, 20_000)
                    .without_jitter(),
                ..config(1)
            },
            transcoder,
            Arc::new(ZeroCopyTransfer::default()),
            Arc::new(RetryPolicy::new()),
        )
    }

    #[tokio::test]
    async fn task_waiting_to_retry_is_reported_at_shutdown() {
        let dir = TempDir::new().unwrap();
        let pool = slow_retry_pool(FakeTranscoder::new(Behavior::Write(4096)));
        let input = dir.path().join("late.mp4");
        let handle = pool
            .enqueue(ProcessingTask::new(input.clone(), dir.path().join("late.out.mp4"), MediaKind::Video))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(pool.stats().requeued, 1);
        assert_eq!(pool.pending(), 1);

        let report = tokio::time::timeout(Duration::from_secs(2), pool.shutdown(Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(report.unfinished, vec![input]);
        assert_eq!(report.aborted_workers, 0);
        assert_eq!(handle.outcome().await, TaskOutcome::Unfinished);
        assert_eq!(pool.stats().unfinished, 1);
        assert!(pool.is_idle());
    }

    #[tokio::test]
    async fn retry_backoff_does_not_block_the_queue() {
        let dir = TempDir::new().unwrap();
        let pool = slow_retry_pool(FakeTranscoder::new(Behavior::Write(4096)));
        let failing = pool
            .enqueue(ProcessingTask::new(
                dir.path().join("missing.mp4"),
                dir.path().join("missing.out.mp4"),
                MediaKind::Video,
            ))
            .unwrap();
        let input = source(&dir, "next.mp4", 8000);
        let next = pool
            .enqueue(ProcessingTask::new(input, dir.path().join("next.out.mp4"), MediaKind::Video))
            .unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(2), next.outcome())
            .await
            .unwrap();
        assert!(outcome.is_success());

        let report = pool.shutdown(Duration::from_secs(1)).await;
        assert_eq!(report.unfinished.len(), 1);
        assert_eq!(failing.outcome().await, TaskOutcome::Unfinished);
    }

    #[tokio::test]
    async fn higher_priority_tasks_are_taken_first() {
        let dir = TempDir::new().unwrap();
        let pool = pool(FakeTranscoder::new(Behavior::Slow(Duration::from_millis(100))), 1);
        // occupies the only worker while the rest queue up
        let first = source(&dir, "first.mp4", 1000);
        let blocker = pool
            .enqueue(ProcessingTask::new(first, dir.path().join("first.out.mp4"), MediaKind::Video))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut waits = JoinSet::new();
        for (name, priority) in [("low", 0u8), ("high", 9), ("mid", 5), ("low2", 0)] {
            let input = source(&dir, &format!("{name}.mp4"), 1000);
            let task = ProcessingTask::new(input, dir.path().join(format!("{name}.out.mp4")), MediaKind::Video)
                .with_priority(priority);
            let handle = pool.enqueue(task).unwrap();
            let order = Arc::clone(&order);
            waits.spawn(async move {
                assert!(handle.outcome().await.is_success());
                order.lock().push(name);
            });
        }
        assert!(blocker.outcome().await.is_success());
        while let Some(r) = waits.join_next().await {
            r.unwrap();
        }
        assert_eq!(*order.lock(), vec!["high", "mid", "low", "low2"]);
        pool.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn shutdown_reports_work_left_behind() {
        let dir = TempDir::new().unwrap();
        let pool = pool(FakeTranscoder::new(Behavior::Slow(Duration::from_secs(30))), 1);
        let mut handles = Vec::new();
        for i in 0..3 {
            let input = source(&dir, &format!("{i}.mp4"), 1000);
            let task = ProcessingTask::new(input, dir.path().join(format!("{i}.out.mp4")), MediaKind::Video);
            handles.push(pool.enqueue(task).unwrap());
        }
        assert!(!pool.wait_until_idle(Duration::from_millis(100)).await);

        let report = pool.shutdown(Duration::from_millis(100)).await;
        assert_eq!(report.aborted_workers, 1);
        assert_eq!(report.unfinished.len(), 3);
        for h in handles {
            assert_eq!(h.outcome().await, TaskOutcome::Unfinished);
        }
        assert!(pool.is_idle());
        let late = ProcessingTask::new(dir.path().join("x"), dir.path().join("y"), MediaKind::Video);
        assert!(matches!(pool.enqueue(late), Err(DomainError::Shutdown(_))));
    }
}
