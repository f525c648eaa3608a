//! Double-buffered message prefetch.
//!
//! One producer task pages through the source and pushes batches into a
//! bounded channel while consumers work on earlier batches. A `None` item is
//! the end-of-stream sentinel.

use crate::domain::{DomainError, Message};
use crate::ports::MessageSource;
use crate::shared::retry::{RetryConfig, RetryPolicy};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// RetryPolicy bucket for page fetches.
pub const FETCH_OPERATION: &str = "fetch";

type Slot = Option<Vec<Message>>;

#[derive(Debug, Clone)]
pub struct PrefetchConfig {
    pub batch_size: usize,
    /// Batches buffered ahead of the consumers.
    pub queue_size: usize,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            queue_size: 2,
        }
    }
}

/// Ascending, deduplicated walk over one chat's history.
pub struct MessageCursor {
    source: Arc<dyn MessageSource>,
    retry: Arc<RetryPolicy>,
    retry_config: RetryConfig,
    chat_id: i64,
    after_id: i32,
    page_size: usize,
    exhausted: bool,
}

impl MessageCursor {
    pub fn new(source: Arc<dyn MessageSource>, chat_id: i64, after_id: i32, page_size: usize) -> Self {
        Self {
            source,
            retry: Arc::new(RetryPolicy::new()),
            retry_config: RetryConfig::default(),
            chat_id,
            after_id,
            page_size: page_size.max(1),
            exhausted: false,
        }
    }

    pub fn with_retry(mut self, retry: Arc<RetryPolicy>, config: RetryConfig) -> Self {
        self.retry = retry;
        self.retry_config = config;
        self
    }

    /// Highest id handed out so far (or the starting point).
    pub fn position(&self) -> i32 {
        self.after_id
    }

    /// Next non-empty page, or `None` once the history is exhausted.
    pub async fn next_page(&mut self) -> Result<Option<Vec<Message>>, DomainError> {
        if self.exhausted {
            return Ok(None);
        }
        let (chat_id, after_id, limit) = (self.chat_id, self.after_id, self.page_size);
        let source = &self.source;
        let mut page = self
            .retry
            .retry(FETCH_OPERATION, &self.retry_config, || {
                source.fetch_after(chat_id, after_id, limit)
            })
            .await?;

        // Sources may return the boundary message or overlap pages.
        page.retain(|m| m.id > after_id);
        page.sort_by_key(|m| m.id);
        page.dedup_by_key(|m| m.id);

        match page.last() {
            Some(last) => {
                self.after_id = last.id;
                Ok(Some(page))
            }
            None => {
                self.exhausted = true;
                Ok(None)
            }
        }
    }
}

/// Point-in-time copy of the queue counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PrefetchMetrics {
    pub batches_fetched: u64,
    pub batches_consumed: u64,
    pub messages_fetched: u64,
    pub messages_skipped: u64,
    /// Pushes that found the channel full.
    pub producer_blocks: u64,
    pub producer_blocked: Duration,
    pub consumer_wait: Duration,
    pub peak_queued: usize,
}

#[derive(Debug, Default)]
struct MetricsInner {
    batches_fetched: AtomicU64,
    batches_consumed: AtomicU64,
    messages_fetched: AtomicU64,
    messages_skipped: AtomicU64,
    producer_blocks: AtomicU64,
    producer_blocked_ns: AtomicU64,
    consumer_wait_ns: AtomicU64,
    peak_queued: AtomicUsize,
}

impl MetricsInner {
    fn add_duration(counter: &AtomicU64, d: Duration) {
        counter.fetch_add(d.as_nanos() as u64, Ordering::Relaxed);
    }

    fn snapshot(&self) -> PrefetchMetrics {
        PrefetchMetrics {
            batches_fetched: self.batches_fetched.load(Ordering::Relaxed),
            batches_consumed: self.batches_consumed.load(Ordering::Relaxed),
            messages_fetched: self.messages_fetched.load(Ordering::Relaxed),
            messages_skipped: self.messages_skipped.load(Ordering::Relaxed),
            producer_blocks: self.producer_blocks.load(Ordering::Relaxed),
            producer_blocked: Duration::from_nanos(self.producer_blocked_ns.load(Ordering::Relaxed)),
            consumer_wait: Duration::from_nanos(self.consumer_wait_ns.load(Ordering::Relaxed)),
            peak_queued: self.peak_queued.load(Ordering::Relaxed),
        }
    }
}

pub struct PrefetchQueue {
    config: PrefetchConfig,
    tx: Mutex<Option<mpsc::Sender<Slot>>>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Slot>>,
    /// Set once any consumer has seen the sentinel.
    done: AtomicBool,
    cancel: CancellationToken,
    producer: Mutex<Option<JoinHandle<Result<(), DomainError>>>>,
    metrics: Arc<MetricsInner>,
}

impl PrefetchQueue {
    pub fn new(config: PrefetchConfig) -> Self {
        let config = PrefetchConfig {
            batch_size: config.batch_size.max(1),
            queue_size: config.queue_size.max(1),
        };
        let (tx, rx) = mpsc::channel(config.queue_size);
        Self {
            config,
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
            done: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            producer: Mutex::new(None),
            metrics: Arc::new(MetricsInner::default()),
        }
    }

    /// Spawn the single producer. Messages for which `skip` returns true are
    /// dropped before batching. Fails if a producer was already started.
    pub fn start_producer<F>(&self, mut cursor: MessageCursor, skip: F) -> Result<(), DomainError>
    where
        F: Fn(&Message) -> bool + Send + 'static,
    {
        let tx = self
            .tx
            .lock()
            .take()
            .ok_or_else(|| DomainError::Config("prefetch producer already started".into()))?;
        let metrics = Arc::clone(&self.metrics);
        let cancel = self.cancel.clone();
        let batch_size = self.config.batch_size;

        let handle = tokio::spawn(async move {
            let pusher = Pusher { tx, metrics: Arc::clone(&metrics), cancel: cancel.clone() };
            let mut batch: Vec<Message> = Vec::with_capacity(batch_size);
            let mut open = true;

            let result = loop {
                if cancel.is_cancelled() {
                    open = false;
                    break Ok(());
                }
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        open = false;
                        break Ok(());
                    }
                    next = cursor.next_page() => next,
                };
                let page = match next {
                    Ok(Some(page)) => page,
                    Ok(None) => break Ok(()),
                    Err(e) => {
                        error!(position = cursor.position(), error = %e, "prefetch producer failed");
                        break Err(e);
                    }
                };
                metrics
                    .messages_fetched
                    .fetch_add(page.len() as u64, Ordering::Relaxed);
                for message in page {
                    if skip(&message) {
                        metrics.messages_skipped.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                    batch.push(message);
                    if batch.len() >= batch_size {
                        let full = std::mem::replace(&mut batch, Vec::with_capacity(batch_size));
                        if !pusher.push(Some(full)).await {
                            open = false;
                            break;
                        }
                    }
                }
                if !open {
                    break Ok(());
                }
            };

            if open {
                if !batch.is_empty() {
                    open = pusher.push(Some(batch)).await;
                }
                if open {
                    pusher.push(None).await;
                }
            }
            debug!(position = cursor.position(), "prefetch producer finished");
            result
        });
        *self.producer.lock() = Some(handle);
        Ok(())
    }

    /// Next batch, waiting if the producer is behind. `None` after the
    /// sentinel, and for every later call from any consumer.
    pub async fn next_batch(&self) -> Option<Vec<Message>> {
        if self.done.load(Ordering::Acquire) {
            return None;
        }
        let started = Instant::now();
        let received = tokio::select! {
            _ = self.cancel.cancelled() => None,
            item = async {
                let mut rx = self.rx.lock().await;
                if self.done.load(Ordering::Acquire) {
                    return None;
                }
                rx.recv().await
            } => item,
        };
        MetricsInner::add_duration(&self.metrics.consumer_wait_ns, started.elapsed());

        match received {
            Some(Some(batch)) => {
                self.metrics.batches_consumed.fetch_add(1, Ordering::Relaxed);
                Some(batch)
            }
            _ => {
                self.done.store(true, Ordering::Release);
                None
            }
        }
    }

    /// Stop early: the producer stops pushing and consumers see end-of-stream.
    pub fn close(&self) {
        self.done.store(true, Ordering::Release);
        self.cancel.cancel();
    }

    /// Wait for the producer and surface its error, if any.
    pub async fn join_producer(&self) -> Result<(), DomainError> {
        let handle = self.producer.lock().take();
        match handle {
            Some(handle) => handle
                .await
                .map_err(|e| DomainError::Source(format!("prefetch producer panicked: {}", e)))?,
            None => Ok(()),
        }
    }

    pub fn metrics(&self) -> PrefetchMetrics {
        self.metrics.snapshot()
    }

    pub fn log_metrics(&self, entity_id: i64) {
        let m = self.metrics();
        info!(
            entity_id,
            batches = m.batches_fetched,
            fetched = m.messages_fetched,
            skipped = m.messages_skipped,
            producer_blocks = m.producer_blocks,
            producer_blocked_ms = m.producer_blocked.as_millis() as u64,
            consumer_wait_ms = m.consumer_wait.as_millis() as u64,
            peak_queued = m.peak_queued,
            "prefetch metrics"
        );
    }
}

struct Pusher {
    tx: mpsc::Sender<Slot>,
    metrics: Arc<MetricsInner>,
    cancel: CancellationToken,
}

impl Pusher {
    /// Returns false when nobody will read the item (closed or cancelled).
    async fn push(&self, item: Slot) -> bool {
        let is_batch = item.is_some();
        let item = match self.tx.try_send(item) {
            Ok(()) => None,
            Err(TrySendError::Closed(_)) => return false,
            Err(TrySendError::Full(item)) => Some(item),
        };
        if let Some(item) = item {
            self.metrics.producer_blocks.fetch_add(1, Ordering::Relaxed);
            let started = Instant::now();
            let sent = tokio::select! {
                _ = self.cancel.cancelled() => false,
                r = self.tx.send(item) => r.is_ok(),
            };
            MetricsInner::add_duration(&self.metrics.producer_blocked_ns, started.elapsed());
            if !sent {
                return false;
            }
        }
        if is_batch {
            self.metrics.batches_fetched.fetch_add(1, Ordering::Relaxed);
            let depth = self.tx.max_capacity() - self.tx.capacity();
            self.metrics.peak_queued.fetch_max(depth, Ordering::Relaxed);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Chat, ChatType, MediaReference};
    use async_trait::async_trait;
    use std::path::Path;

    struct VecSource {
        messages: Vec<Message>,
        /// Fail with Auth once asked for ids after this one.
        fail_after: Option<i32>,
        page_delay: Option<Duration>,
    }

    impl VecSource {
        fn new(n: i32) -> Self {
            Self {
                messages: (1..=n).map(msg).collect(),
                fail_after: None,
                page_delay: None,
            }
        }
    }

    fn msg(id: i32) -> Message {
        Message {
            id,
            chat_id: 1,
            date: 1_700_000_000 + id as i64,
            text: format!("m{id}"),
            media: None,
            from_user_id: None,
            reply_to_msg_id: None,
        }
    }

    #[async_trait]
    impl MessageSource for VecSource {
        async fn get_chat(&self, chat_id: i64) -> Result<Chat, DomainError> {
            Ok(Chat {
                id: chat_id,
                title: "t".into(),
                username: None,
                kind: ChatType::Group,
            })
        }

        async fn fetch_after(
            &self,
            _chat_id: i64,
            after_id: i32,
            limit: usize,
        ) -> Result<Vec<Message>, DomainError> {
            if let Some(delay) = self.page_delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail_after.is_some_and(|f| after_id >= f) {
                return Err(DomainError::Auth("session revoked".into()));
            }
            // include the boundary message to exercise the cursor filter
            Ok(self
                .messages
                .iter()
                .filter(|m| m.id >= after_id)
                .take(limit)
                .cloned()
                .collect())
        }

        async fn download_media(&self, _m: &MediaReference, _dest: &Path) -> Result<(), DomainError> {
            Ok(())
        }
    }

    fn cursor(source: VecSource, page: usize) -> MessageCursor {
        MessageCursor::new(Arc::new(source), 1, 0, page)
    }

    async fn drain(queue: Arc<PrefetchQueue>, consumers: usize) -> Vec<Vec<i32>> {
        let mut set = tokio::task::JoinSet::new();
        for _ in 0..consumers {
            let q = Arc::clone(&queue);
            set.spawn(async move {
                let mut seen = Vec::new();
                while let Some(batch) = q.next_batch().await {
                    let ids: Vec<i32> = batch.iter().map(|m| m.id).collect();
                    assert!(ids.windows(2).all(|w| w[0] < w[1]));
                    seen.push(ids);
                    tokio::task::yield_now().await;
                }
                seen
            });
        }
        let mut all = Vec::new();
        while let Some(r) = set.join_next().await {
            all.extend(r.unwrap());
        }
        all
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn every_message_reaches_exactly_one_consumer() {
        for consumers in [1, 3, 8] {
            let queue = Arc::new(PrefetchQueue::new(PrefetchConfig {
                batch_size: 7,
                queue_size: 2,
            }));
            queue.start_producer(cursor(VecSource::new(250), 40), |_| false).unwrap();
            let batches = drain(Arc::clone(&queue), consumers).await;
            queue.join_producer().await.unwrap();

            let mut ids: Vec<i32> = batches.into_iter().flatten().collect();
            ids.sort();
            assert_eq!(ids, (1..=250).collect::<Vec<_>>(), "consumers = {consumers}");
            let m = queue.metrics();
            // 35 full batches of 7 plus a trailing 5
            assert_eq!(m.batches_fetched, 36);
            assert_eq!(m.batches_consumed, 36);
            assert_eq!(m.messages_fetched, 250);
        }
    }

    #[tokio::test]
    async fn single_consumer_sees_batches_in_order() {
        let queue = Arc::new(PrefetchQueue::new(PrefetchConfig {
            batch_size: 10,
            queue_size: 2,
        }));
        queue.start_producer(cursor(VecSource::new(35), 8), |_| false).unwrap();
        let batches = drain(Arc::clone(&queue), 1).await;
        let firsts: Vec<i32> = batches.iter().map(|b| b[0]).collect();
        assert_eq!(firsts, vec![1, 11, 21, 31]);
        assert_eq!(batches[3].len(), 5);
        assert!(queue.next_batch().await.is_none());
    }

    #[tokio::test]
    async fn slow_consumer_applies_backpressure() {
        let queue = Arc::new(PrefetchQueue::new(PrefetchConfig {
            batch_size: 5,
            queue_size: 2,
        }));
        queue.start_producer(cursor(VecSource::new(60), 20), |_| false).unwrap();
        let mut total = 0;
        while let Some(batch) = queue.next_batch().await {
            total += batch.len();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        queue.join_producer().await.unwrap();
        assert_eq!(total, 60);
        let m = queue.metrics();
        assert!(m.producer_blocks > 0);
        assert!(m.producer_blocked > Duration::ZERO);
        assert!(m.peak_queued >= 1 && m.peak_queued <= 2, "peak {}", m.peak_queued);
    }

    #[tokio::test]
    async fn skip_predicate_drops_messages_before_batching() {
        let queue = Arc::new(PrefetchQueue::new(PrefetchConfig {
            batch_size: 4,
            queue_size: 2,
        }));
        queue
            .start_producer(cursor(VecSource::new(20), 6), |m| m.id % 2 == 0)
            .unwrap();
        let ids: Vec<i32> = drain(Arc::clone(&queue), 2).await.into_iter().flatten().collect();
        let mut ids = ids;
        ids.sort();
        assert_eq!(ids, vec![1, 3, 5, 7, 9, 11, 13, 15, 17, 19]);
        assert_eq!(queue.metrics().messages_skipped, 10);
    }

    #[tokio::test]
    async fn producer_error_ends_stream_and_is_returned() {
        let mut source = VecSource::new(50);
        source.fail_after = Some(10);
        let queue = Arc::new(PrefetchQueue::new(PrefetchConfig {
            batch_size: 4,
            queue_size: 2,
        }));
        queue.start_producer(cursor(source, 10), |_| false).unwrap();
        let ids: Vec<i32> = drain(Arc::clone(&queue), 2).await.into_iter().flatten().collect();
        // first page (1..=10) is delivered, including the partial batch
        assert_eq!(ids.len(), 10);
        assert!(matches!(queue.join_producer().await, Err(DomainError::Auth(_))));
    }

    #[tokio::test]
    async fn close_releases_a_blocked_producer() {
        let queue = Arc::new(PrefetchQueue::new(PrefetchConfig {
            batch_size: 1,
            queue_size: 1,
        }));
        queue.start_producer(cursor(VecSource::new(100), 50), |_| false).unwrap();
        assert!(queue.next_batch().await.is_some());
        queue.close();
        assert!(queue.next_batch().await.is_none());
        tokio::time::timeout(Duration::from_secs(1), queue.join_producer())
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn close_interrupts_a_slow_page_fetch() {
        let mut source = VecSource::new(10);
        source.page_delay = Some(Duration::from_secs(60));
        let queue = Arc::new(PrefetchQueue::new(PrefetchConfig::default()));
        queue.start_producer(cursor(source, 10), |_| false).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();
        tokio::time::timeout(Duration::from_secs(1), queue.join_producer())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(queue.metrics().messages_fetched, 0);
    }

    #[tokio::test]
    async fn second_producer_is_rejected() {
        let queue = PrefetchQueue::new(PrefetchConfig::default());
        queue.start_producer(cursor(VecSource::new(1), 10), |_| false).unwrap();
        assert!(queue.start_producer(cursor(VecSource::new(1), 10), |_| false).is_err());
        queue.join_producer().await.unwrap();
    }
}
