//! Bounded read-ahead over a sequence of confirmed blocks.
//!
//! A producer task walks `head` forward, waiting for each sequence to be confirmed and then
//! starting its download, while the consumer takes results in order with
//! [`PrefetchQueue::shift`]. Two semaphores enforce the limits: buffer slots (at most
//! `max_buffered` sequences started but not yet consumed) and fetch permits (at most
//! `max_parallel` downloads in flight).
//!
//! A failed download destroys the whole queue: every later result depends on the failed one
//! being delivered first.

use std::sync::{
    Arc,
    atomic::{AtomicU64, AtomicUsize, Ordering},
};

use parking_lot::Mutex;
use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore, mpsc},
    task::JoinHandle,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::TailError;

/// Default number of sequences that may be started ahead of the consumer.
pub const DEFAULT_MAX_BUFFERED: usize = 512;
/// Default number of concurrent downloads.
pub const DEFAULT_MAX_PARALLEL: usize = 16;

/// Source of the queue's items.
pub trait SequenceLoader: Send + Sync + 'static {
    type Output: Send + 'static;

    /// Resolves once `sequence` may be downloaded.
    fn confirmed(&self, sequence: u64) -> impl Future<Output = Result<(), TailError>> + Send;

    /// Download `sequence`.
    fn load(&self, sequence: u64) -> impl Future<Output = Result<Self::Output, TailError>> + Send;
}

/// Snapshot of a queue's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    /// Next sequence to start downloading.
    pub head: u64,
    /// Next sequence the consumer will receive.
    pub tail: u64,
    /// Buffer slots in use.
    pub buffered: usize,
    /// Downloads in flight.
    pub active: usize,
}

struct Entry<T> {
    sequence: u64,
    download: JoinHandle<Result<T, TailError>>,
    _slot: OwnedSemaphorePermit,
}

struct Shared {
    cancel: CancellationToken,
    tracker: TaskTracker,
    failure: Mutex<Option<TailError>>,
    head: AtomicU64,
    tail: AtomicU64,
    active: AtomicUsize,
    slots: Arc<Semaphore>,
    fetches: Arc<Semaphore>,
    max_buffered: usize,
}

impl Shared {
    fn fail(&self, err: TailError) {
        if self.cancel.is_cancelled() {
            return;
        }
        warn!(error = %err, "Prefetch failed, destroying queue");
        self.failure.lock().get_or_insert(err);
        self.cancel.cancel();
    }

    fn terminal_error(&self) -> TailError {
        self.failure.lock().clone().unwrap_or(TailError::QueueDestroyed)
    }
}

/// Handle for observing and destroying a [`PrefetchQueue`] from other tasks.
#[derive(Clone)]
pub struct QueueControl {
    shared: Arc<Shared>,
}

impl QueueControl {
    /// Destroy the queue and wait until the producer and every download have settled.
    ///
    /// Idempotent; later calls wait for the same shutdown.
    pub async fn destroy(&self) {
        self.shared.cancel.cancel();
        self.shared.tracker.close();
        self.shared.tracker.wait().await;
    }

    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// The error that destroyed the queue, if a download failed.
    #[must_use]
    pub fn failure(&self) -> Option<TailError> {
        self.shared.failure.lock().clone()
    }

    #[must_use]
    pub fn stats(&self) -> QueueStats {
        let shared = &self.shared;
        QueueStats {
            head: shared.head.load(Ordering::Acquire),
            tail: shared.tail.load(Ordering::Acquire),
            buffered: shared.max_buffered - shared.slots.available_permits(),
            active: shared.active.load(Ordering::Acquire),
        }
    }
}

/// Ordered consumer side of the read-ahead queue.
pub struct PrefetchQueue<T> {
    entries: mpsc::Receiver<Entry<T>>,
    control: QueueControl,
}

impl<T: Send + 'static> PrefetchQueue<T> {
    /// Start prefetching from `since`.
    ///
    /// The queue is destroyed when `parent` is cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`TailError::InvalidMaxBuffered`] or [`TailError::InvalidMaxParallel`] for zero
    /// limits.
    pub fn start<L>(
        loader: Arc<L>,
        since: u64,
        max_buffered: usize,
        max_parallel: usize,
        parent: &CancellationToken,
    ) -> Result<Self, TailError>
    where
        L: SequenceLoader<Output = T>,
    {
        if max_buffered == 0 {
            return Err(TailError::InvalidMaxBuffered);
        }
        if max_parallel == 0 {
            return Err(TailError::InvalidMaxParallel);
        }

        let shared = Arc::new(Shared {
            cancel: parent.child_token(),
            tracker: TaskTracker::new(),
            failure: Mutex::new(None),
            head: AtomicU64::new(since),
            tail: AtomicU64::new(since),
            active: AtomicUsize::new(0),
            slots: Arc::new(Semaphore::new(max_buffered)),
            fetches: Arc::new(Semaphore::new(max_parallel)),
            max_buffered,
        });
        let (sender, entries) = mpsc::channel(max_buffered);

        debug!(
            since = since,
            max_buffered = max_buffered,
            max_parallel = max_parallel,
            "Starting prefetch"
        );
        shared.tracker.spawn(produce(loader, Arc::clone(&shared), sender));

        Ok(Self { entries, control: QueueControl { shared } })
    }

    #[must_use]
    pub fn control(&self) -> QueueControl {
        self.control.clone()
    }

    /// Take the result for the current `tail` sequence, waiting for it if needed.
    ///
    /// # Errors
    ///
    /// * The download error that destroyed the queue.
    /// * [`TailError::QueueDestroyed`] if the queue was destroyed otherwise.
    pub async fn shift(&mut self) -> Result<T, TailError> {
        let shared = Arc::clone(&self.control.shared);
        if shared.cancel.is_cancelled() {
            return Err(shared.terminal_error());
        }

        let mut entry = tokio::select! {
            biased;
            () = shared.cancel.cancelled() => return Err(shared.terminal_error()),
            entry = self.entries.recv() => entry.ok_or_else(|| shared.terminal_error())?,
        };

        let result = tokio::select! {
            biased;
            () = shared.cancel.cancelled() => return Err(shared.terminal_error()),
            joined = &mut entry.download => {
                joined.map_err(|err| TailError::TaskFailed(err.to_string().into()))?
            }
        };

        let value = result?;
        shared.tail.store(entry.sequence + 1, Ordering::Release);
        trace!(sequence = entry.sequence, "Shifted prefetched block");
        Ok(value)
    }
}

async fn produce<L: SequenceLoader>(
    loader: Arc<L>,
    shared: Arc<Shared>,
    sender: mpsc::Sender<Entry<L::Output>>,
) {
    loop {
        let slot = tokio::select! {
            () = shared.cancel.cancelled() => break,
            slot = Arc::clone(&shared.slots).acquire_owned() => match slot {
                Ok(slot) => slot,
                Err(_) => break,
            },
        };
        let fetch = tokio::select! {
            () = shared.cancel.cancelled() => break,
            fetch = Arc::clone(&shared.fetches).acquire_owned() => match fetch {
                Ok(fetch) => fetch,
                Err(_) => break,
            },
        };

        let sequence = shared.head.load(Ordering::Acquire);
        tokio::select! {
            () = shared.cancel.cancelled() => break,
            confirmed = loader.confirmed(sequence) => {
                if let Err(err) = confirmed {
                    shared.fail(err);
                    break;
                }
            }
        }
        shared.head.store(sequence + 1, Ordering::Release);

        let download =
            shared.tracker.spawn(download(Arc::clone(&loader), Arc::clone(&shared), sequence, fetch));
        if sender.send(Entry { sequence, download, _slot: slot }).await.is_err() {
            trace!("Prefetch consumer dropped");
            break;
        }
    }
    trace!(head = shared.head.load(Ordering::Acquire), "Prefetch producer stopped");
}

async fn download<L: SequenceLoader>(
    loader: Arc<L>,
    shared: Arc<Shared>,
    sequence: u64,
    fetch: OwnedSemaphorePermit,
) -> Result<L::Output, TailError> {
    shared.active.fetch_add(1, Ordering::AcqRel);
    let result = tokio::select! {
        () = shared.cancel.cancelled() => Err(TailError::QueueDestroyed),
        result = loader.load(sequence) => result,
    };
    shared.active.fetch_sub(1, Ordering::AcqRel);
    drop(fetch);

    if let Err(err) = &result {
        if !shared.cancel.is_cancelled() {
            error!(sequence = sequence, error = %err, "Block download failed");
        }
        shared.fail(err.clone());
    }
    result
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    /// Loader that records concurrency and how far ahead of the consumer it was asked to go.
    #[derive(Default)]
    struct CountingLoader {
        consumed: AtomicU64,
        active: AtomicUsize,
        max_active: AtomicUsize,
        max_ahead: AtomicU64,
        fail_at: Option<u64>,
        delay: Duration,
    }

    impl SequenceLoader for CountingLoader {
        type Output = u64;

        async fn confirmed(&self, _: u64) -> Result<(), TailError> {
            Ok(())
        }

        async fn load(&self, sequence: u64) -> Result<u64, TailError> {
            let ahead = sequence - self.consumed.load(Ordering::SeqCst);
            self.max_ahead.fetch_max(ahead, Ordering::SeqCst);
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);

            tokio::time::sleep(self.delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);

            if self.fail_at == Some(sequence) {
                return Err(TailError::EmptyResponse("eth_getBlockByNumber"));
            }
            Ok(sequence * 10)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn respects_buffer_and_parallel_limits() -> anyhow::Result<()> {
        let loader = Arc::new(CountingLoader {
            consumed: AtomicU64::new(100),
            delay: Duration::from_millis(50),
            ..CountingLoader::default()
        });
        let mut queue =
            PrefetchQueue::start(Arc::clone(&loader), 100, 2, 1, &CancellationToken::new())?;

        for expected in 100..103 {
            tokio::time::sleep(Duration::from_millis(200)).await;
            let stats = queue.control().stats();
            assert!(stats.buffered <= 2);
            assert!(stats.active <= 1);

            assert_eq!(queue.shift().await?, expected * 10);
            loader.consumed.store(expected + 1, Ordering::SeqCst);
        }

        assert_eq!(loader.max_active.load(Ordering::SeqCst), 1);
        assert!(loader.max_ahead.load(Ordering::SeqCst) < 2);
        queue.control().destroy().await;
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn delivers_in_order_with_parallel_downloads() -> anyhow::Result<()> {
        let loader =
            Arc::new(CountingLoader { delay: Duration::from_millis(10), ..CountingLoader::default() });
        let mut queue =
            PrefetchQueue::start(Arc::clone(&loader), 0, 8, 4, &CancellationToken::new())?;

        for expected in 0..20 {
            assert_eq!(queue.shift().await?, expected * 10);
            loader.consumed.store(expected + 1, Ordering::SeqCst);
        }

        assert!(loader.max_active.load(Ordering::SeqCst) <= 4);
        assert!(loader.max_ahead.load(Ordering::SeqCst) < 8);
        let stats = queue.control().stats();
        assert_eq!(stats.tail, 20);
        queue.control().destroy().await;
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn failed_download_destroys_the_queue() -> anyhow::Result<()> {
        let loader = Arc::new(CountingLoader { fail_at: Some(3), ..CountingLoader::default() });
        let mut queue = PrefetchQueue::start(loader, 0, 16, 4, &CancellationToken::new())?;
        let control = queue.control();

        let mut delivered = vec![];
        let err = loop {
            match queue.shift().await {
                Ok(value) => delivered.push(value),
                Err(err) => break err,
            }
        };

        assert!(delivered.len() <= 3);
        assert!(matches!(err, TailError::EmptyResponse(_)));
        assert!(control.is_destroyed());
        assert!(matches!(queue.shift().await, Err(TailError::EmptyResponse(_))));
        control.destroy().await;
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn destroy_is_idempotent_and_releases_waiters() -> anyhow::Result<()> {
        struct Never;
        impl SequenceLoader for Never {
            type Output = ();
            async fn confirmed(&self, _: u64) -> Result<(), TailError> {
                std::future::pending().await
            }
            async fn load(&self, _: u64) -> Result<(), TailError> {
                Ok(())
            }
        }

        let mut queue = PrefetchQueue::start(Arc::new(Never), 0, 4, 2, &CancellationToken::new())?;
        let control = queue.control();

        let waiter = tokio::spawn(async move { queue.shift().await });
        tokio::time::sleep(Duration::from_secs(1)).await;

        control.destroy().await;
        control.destroy().await;
        assert!(matches!(waiter.await?, Err(TailError::QueueDestroyed)));
        assert!(control.failure().is_none());
        Ok(())
    }

    #[test]
    fn zero_limits_are_rejected() {
        let token = CancellationToken::new();
        let loader = Arc::new(CountingLoader::default());
        assert!(matches!(
            PrefetchQueue::start(Arc::clone(&loader), 0, 0, 1, &token),
            Err(TailError::InvalidMaxBuffered)
        ));
        assert!(matches!(
            PrefetchQueue::start(loader, 0, 1, 0, &token),
            Err(TailError::InvalidMaxParallel)
        ));
    }
}
