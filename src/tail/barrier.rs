use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};

/// Boundary between blocks.
///
/// The dispatch loop holds the barrier for the whole of a block's dispatch. Tasks queued with
/// [`run_between`](Self::run_between) acquire it in FIFO order, so they run after the block in
/// progress has been checkpointed and before the next one starts.
#[derive(Debug, Clone, Default)]
pub(crate) struct BlockBarrier {
    lock: Arc<Mutex<()>>,
}

impl BlockBarrier {
    pub(crate) async fn enter(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().await
    }

    pub(crate) async fn run_between<F, Fut, T>(&self, task: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _guard = self.lock.lock().await;
        task().await
    }
}
