//! Bounded worker pools consuming operation ids.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::EngineError;

/// Something a queue worker can drive: the operation manager or the
/// orchestration supervisor.
///
/// `Ok(None)` means the executor is done with the id; `Ok(Some(delay))` asks
/// for the id to be re-enqueued after at least `delay`. Errors are logged by
/// the worker and the id is dropped (it returns via the recovery loader or a
/// later enqueue).
#[async_trait]
pub trait Executor: Send + Sync + 'static {
    async fn execute(&self, id: Uuid) -> Result<Option<Duration>, EngineError>;
}

struct QueueInner {
    name: String,
    tx: mpsc::UnboundedSender<Uuid>,
    enqueued: parking_lot::Mutex<HashSet<Uuid>>,
    accepting: AtomicBool,
}

impl QueueInner {
    fn add(&self, id: Uuid) -> bool {
        if !self.accepting.load(Ordering::SeqCst) {
            debug!(queue = %self.name, %id, "queue is shut down; rejecting id");
            return false;
        }
        let mut enqueued = self.enqueued.lock();
        if !enqueued.insert(id) {
            // Already enqueued; adding again is a no-op.
            return false;
        }
        if self.tx.send(id).is_err() {
            enqueued.remove(&id);
            return false;
        }
        true
    }
}

/// A fixed pool of workers consuming ids from an in-memory FIFO.
///
/// `add` is non-blocking and deduplicating: while an id sits in the queue,
/// re-adding it is a no-op; once a worker dequeues it, it may be added again.
/// Rescheduled ids join the tail after their delay elapses, on a detached
/// timer, so the worker that requested the delay immediately serves other
/// ids.
pub struct ProcessingQueue {
    inner: Arc<QueueInner>,
    shutdown_tx: watch::Sender<bool>,
    workers: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl ProcessingQueue {
    /// Create the queue and spawn `worker_count` workers. Must be called
    /// from within a tokio runtime.
    pub fn new(name: impl Into<String>, executor: Arc<dyn Executor>, worker_count: usize) -> Self {
        let name = name.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let rx = Arc::new(AsyncMutex::new(rx));
        let (shutdown_tx, _) = watch::channel(false);

        let inner = Arc::new(QueueInner {
            name,
            tx,
            enqueued: parking_lot::Mutex::new(HashSet::new()),
            accepting: AtomicBool::new(true),
        });

        let workers = (0..worker_count.max(1))
            .map(|index| {
                tokio::spawn(worker_loop(
                    index,
                    Arc::clone(&inner),
                    Arc::clone(&rx),
                    Arc::clone(&executor),
                    shutdown_tx.subscribe(),
                ))
            })
            .collect();

        Self {
            inner,
            shutdown_tx,
            workers: parking_lot::Mutex::new(workers),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Enqueue an id. Returns false when the id was already enqueued or the
    /// queue is shut down.
    pub fn add(&self, id: Uuid) -> bool {
        self.inner.add(id)
    }

    /// Whether the id currently sits in the queue (not yet dequeued).
    pub fn is_enqueued(&self, id: Uuid) -> bool {
        self.inner.enqueued.lock().contains(&id)
    }

    /// Stop intake, let in-flight executions finish, and join the workers.
    /// Ids still waiting in the FIFO are dropped.
    pub async fn shutdown(&self) {
        self.inner.accepting.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(true);

        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for worker in workers {
            let _ = worker.await;
        }
        debug!(queue = %self.inner.name, "queue shut down");
    }
}

async fn worker_loop(
    index: usize,
    inner: Arc<QueueInner>,
    rx: Arc<AsyncMutex<mpsc::UnboundedReceiver<Uuid>>>,
    executor: Arc<dyn Executor>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        let id = tokio::select! {
            _ = shutdown_rx.changed() => break,
            received = async { rx.lock().await.recv().await } => match received {
                Some(id) => id,
                None => break,
            },
        };

        // The id may be re-added from here on.
        inner.enqueued.lock().remove(&id);

        match executor.execute(id).await {
            Ok(None) => {}
            Ok(Some(delay)) => {
                debug!(queue = %inner.name, %id, ?delay, "rescheduling");
                let inner = Arc::clone(&inner);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    inner.add(id);
                });
            }
            Err(error) => {
                warn!(queue = %inner.name, %id, %error, "executor failed; dropping id");
            }
        }
    }
    debug!(queue = %inner.name, worker = index, "worker exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use parking_lot::Mutex;

    struct RecordingExecutor {
        executed: Arc<Mutex<Vec<Uuid>>>,
        delay_once: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Executor for RecordingExecutor {
        async fn execute(&self, id: Uuid) -> Result<Option<Duration>, EngineError> {
            self.executed.lock().push(id);
            if self.delay_once.swap(false, Ordering::SeqCst) {
                return Ok(Some(Duration::from_millis(20)));
            }
            Ok(None)
        }
    }

    fn queue_with_recorder(
        delay_once: bool,
    ) -> (ProcessingQueue, Arc<Mutex<Vec<Uuid>>>) {
        let executed = Arc::new(Mutex::new(Vec::new()));
        let executor = Arc::new(RecordingExecutor {
            executed: Arc::clone(&executed),
            delay_once: Arc::new(AtomicBool::new(delay_once)),
        });
        (ProcessingQueue::new("test", executor, 2), executed)
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met within 2s");
    }

    #[tokio::test]
    async fn test_executes_added_ids() {
        let (queue, executed) = queue_with_recorder(false);
        let id = Uuid::now_v7();

        assert!(queue.add(id));
        wait_for(|| executed.lock().len() == 1).await;
        assert_eq!(executed.lock()[0], id);
    }

    #[tokio::test]
    async fn test_adding_twice_before_dequeue_executes_once() {
        let executed = Arc::new(Mutex::new(Vec::new()));
        let slow = Arc::new(AtomicUsize::new(0));

        struct SlowExecutor {
            executed: Arc<Mutex<Vec<Uuid>>>,
            started: Arc<AtomicUsize>,
        }

        #[async_trait]
        impl Executor for SlowExecutor {
            async fn execute(&self, id: Uuid) -> Result<Option<Duration>, EngineError> {
                self.started.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                self.executed.lock().push(id);
                Ok(None)
            }
        }

        // One worker so the first id blocks the pool while we re-add.
        let queue = ProcessingQueue::new(
            "dedup",
            Arc::new(SlowExecutor {
                executed: Arc::clone(&executed),
                started: Arc::clone(&slow),
            }),
            1,
        );

        let blocker = Uuid::now_v7();
        let id = Uuid::now_v7();
        queue.add(blocker);
        wait_for(|| slow.load(Ordering::SeqCst) == 1).await;

        assert!(queue.add(id));
        assert!(!queue.add(id), "second add while enqueued must be a no-op");
        assert!(queue.is_enqueued(id));

        wait_for(|| executed.lock().len() == 2).await;
        let executions: Vec<Uuid> = executed.lock().clone();
        assert_eq!(executions.iter().filter(|e| **e == id).count(), 1);
    }

    #[tokio::test]
    async fn test_delayed_requeue_executes_again() {
        let (queue, executed) = queue_with_recorder(true);
        let id = Uuid::now_v7();

        queue.add(id);
        wait_for(|| executed.lock().len() == 2).await;
        assert_eq!(*executed.lock(), vec![id, id]);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_ids() {
        let (queue, executed) = queue_with_recorder(false);
        queue.shutdown().await;

        assert!(!queue.add(Uuid::now_v7()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(executed.lock().is_empty());
    }
}
