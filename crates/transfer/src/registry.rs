use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::batch::TransferBatch;
use crate::observer::BatchProgress;
use crate::transfer::Transfer;
use crate::types::TransferState;
use crate::{TransferError, lock};

/// Default progress notification interval.
const DEFAULT_INTERVAL: Duration = Duration::from_millis(500);

/// Callback invoked with batch progress.
pub type ProgressCallback = Box<dyn Fn(BatchProgress) + Send + Sync>;

/// Batches currently in flight for a device, by id.
///
/// Notifies progress callbacks periodically once [`start`](Self::start)ed.
pub struct TransferRegistry {
    inner: Arc<Mutex<RegistryInner>>,
    stop: Mutex<Option<tokio::sync::oneshot::Sender<()>>>,
}

struct RegistryInner {
    callbacks: Vec<Arc<dyn Fn(BatchProgress) + Send + Sync>>,
    batches: HashMap<String, TransferBatch>,
    interval: Duration,
}

/// Snapshots the callbacks and calls them with the lock released, so a
/// callback may use the registry again.
fn notify(inner: &Mutex<RegistryInner>, batches: &[TransferBatch]) {
    let callbacks = lock(inner).callbacks.clone();
    if callbacks.is_empty() {
        return;
    }
    for batch in batches {
        let progress = batch.batch().progress();
        for cb in &callbacks {
            cb(progress.clone());
        }
    }
}

impl Default for TransferRegistry {
    fn default() -> Self {
        Self::new(None)
    }
}

impl TransferRegistry {
    /// Creates a registry with the given notification interval.
    ///
    /// If `interval` is `None`, defaults to 500 ms.
    pub fn new(interval: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RegistryInner {
                callbacks: Vec::new(),
                batches: HashMap::new(),
                interval: interval.unwrap_or(DEFAULT_INTERVAL),
            })),
            stop: Mutex::new(None),
        }
    }

    pub fn on_progress(&self, callback: ProgressCallback) {
        lock(&self.inner).callbacks.push(Arc::from(callback));
    }

    pub fn track(&self, batch: TransferBatch) {
        let id = batch.id().to_owned();
        lock(&self.inner).batches.insert(id, batch);
    }

    pub fn untrack(&self, id: &str) -> Option<TransferBatch> {
        lock(&self.inner).batches.remove(id)
    }

    pub fn get(&self, id: &str) -> Option<TransferBatch> {
        lock(&self.inner).batches.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tracks `batch` and executes it in a background task.
    ///
    /// The batch is untracked once it finishes, whatever the outcome.
    pub fn spawn(
        &self,
        batch: TransferBatch,
        cancel: CancellationToken,
    ) -> JoinHandle<Result<(), TransferError>> {
        self.track(batch.clone());
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let result = batch.execute(cancel).await;
            notify(&inner, std::slice::from_ref(&batch));
            lock(&inner).batches.remove(batch.id());
            debug!(batch = %batch.id(), state = %batch.state(), "batch untracked");
            result
        })
    }

    /// Cancels the batch with `id`. Returns `false` if it is not tracked.
    pub fn cancel(&self, id: &str) -> bool {
        let batch = self.get(id);
        match batch {
            Some(batch) => {
                batch.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        let batches: Vec<TransferBatch> = lock(&self.inner).batches.values().cloned().collect();
        for batch in batches {
            batch.cancel();
        }
    }

    /// Sends a one-time progress notification for a batch.
    pub fn notify_progress(&self, id: &str) {
        if let Some(batch) = self.get(id) {
            notify(&self.inner, &[batch]);
        }
    }

    /// Starts periodic progress notifications for active batches.
    ///
    /// Call [`stop`](Self::stop) to cancel.
    pub fn start(&self) {
        let (tx, mut rx) = tokio::sync::oneshot::channel();
        {
            let mut stop = lock(&self.stop);
            drop(stop.take());
            *stop = Some(tx);
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let interval = lock(&inner).interval;
            let mut ticker = tokio::time::interval(interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let active: Vec<TransferBatch> = lock(&inner)
                            .batches
                            .values()
                            .filter(|batch| batch.state() == TransferState::Active)
                            .cloned()
                            .collect();
                        notify(&inner, &active);
                    }
                    _ = &mut rx => break,
                }
            }
        });
    }

    /// Stops the periodic notification task.
    pub fn stop(&self) {
        // Dropping the sender signals the task to exit.
        drop(lock(&self.stop).take());
    }
}
