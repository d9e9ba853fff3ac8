use std::future::Future;
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::Result;

/// Capacity of each work queue.
const QUEUE_CAPACITY: usize = 1024;

/// Upper bound on draining a queue during dispose.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Bounded FIFO queue drained by a single worker task.
///
/// `add` never blocks; items are dropped when the queue is full or closed.
/// Handler errors are logged and swallowed so one bad item never stalls the
/// queue. Ordering within one queue is strict FIFO; there is no ordering
/// guarantee across queues.
pub(crate) struct WorkQueue<T> {
    label: &'static str,
    tx: RwLock<Option<mpsc::Sender<T>>>,
    rx: Mutex<Option<mpsc::Receiver<T>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + 'static> WorkQueue<T> {
    pub(crate) fn new(label: &'static str) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        Self {
            label,
            tx: RwLock::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
            worker: Mutex::new(None),
        }
    }

    /// Enqueue an item without blocking. Returns whether the item was
    /// accepted; full or closed queues drop the item.
    pub(crate) fn add(&self, item: T) -> bool {
        let tx = self
            .tx
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        match tx {
            Some(tx) => match tx.try_send(item) {
                Ok(()) => true,
                Err(e) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(queue = self.label, "Queue full or closed, dropping item: {e}");
                    #[cfg(not(feature = "tracing"))]
                    let _ = &e;
                    false
                }
            },
            None => {
                #[cfg(feature = "tracing")]
                tracing::debug!(queue = self.label, "Queue disposed, dropping item");
                false
            }
        }
    }

    /// Launch the single consumer task. A second call is a no-op.
    pub(crate) fn start<F, Fut>(&self, handler: F)
    where
        F: Fn(T) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send,
    {
        let Some(mut rx) = self
            .rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };

        let label = self.label;
        let handle = tokio::spawn(async move {
            while let Some(item) = rx.recv().await {
                if let Err(e) = handler(item).await {
                    #[cfg(feature = "tracing")]
                    tracing::error!(queue = label, "Queue handler failed: {e}");
                    #[cfg(not(feature = "tracing"))]
                    let _ = (&label, &e);
                }
            }
        });

        *self.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    /// Close the queue and await worker exit with a bounded drain.
    pub(crate) async fn dispose(&self) {
        drop(
            self.tx
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );

        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(mut handle) = handle {
            if timeout(DRAIN_TIMEOUT, &mut handle).await.is_err() {
                #[cfg(feature = "tracing")]
                tracing::warn!(queue = self.label, "Queue drain timed out, aborting worker");
                handle.abort();
            }
        }
    }
}
