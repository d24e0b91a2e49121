//! FIFO task queues between stages.
//!
//! A queue is created as a `(QueueSender, QueueSource)` pair. Senders are
//! cloned into every producer; the source is shared by competing consumers,
//! each item going to exactly one of them. When every sender has been dropped
//! and the buffer is drained, the source reports end-of-stream.
//!
//! Bounded queues are the only backpressure mechanism: `send` suspends the
//! producer while the queue is full.
//!
//! Every sent item counts as unfinished until a consumer acknowledges it;
//! [`QueueProbe::wait_drained`] waits for that count to reach zero.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify, mpsc};

use crate::source::{Fetched, SourceError, TaskSource};

/// Queue capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueCapacity {
    /// Never blocks producers; memory grows with the backlog
    #[default]
    Unbounded,
    /// Producers suspend once this many items are buffered
    Bounded(usize),
}

impl QueueCapacity {
    /// Bounded capacity of at least one item
    #[must_use]
    pub fn bounded(limit: usize) -> Self {
        Self::Bounded(limit.max(1))
    }

    /// Maximum buffered items, if bounded
    #[must_use]
    pub const fn limit(&self) -> Option<usize> {
        match self {
            Self::Unbounded => None,
            Self::Bounded(limit) => Some(*limit),
        }
    }

    /// Buffer fill ratio (0.0 - 1.0); always 0.0 when unbounded
    #[must_use]
    pub fn fill_ratio(&self, depth: usize) -> f64 {
        match self.limit() {
            None | Some(0) => 0.0,
            Some(limit) => (depth as f64 / limit as f64).min(1.0),
        }
    }
}

impl fmt::Display for QueueCapacity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unbounded => write!(f, "unbounded"),
            Self::Bounded(limit) => write!(f, "bounded({})", limit),
        }
    }
}

/// Queue error
pub enum QueueError<T> {
    /// Every consumer is gone; the rejected item is handed back
    Closed(T),
}

impl<T> QueueError<T> {
    /// Recover the item that could not be sent
    pub fn into_inner(self) -> T {
        match self {
            Self::Closed(item) => item,
        }
    }
}

impl<T> fmt::Debug for QueueError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed(_) => write!(f, "Closed(..)"),
        }
    }
}

impl<T> fmt::Display for QueueError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed(_) => write!(f, "Queue closed"),
        }
    }
}

impl<T> std::error::Error for QueueError<T> {}

#[derive(Default)]
struct QueueState {
    /// Items sent and not yet fetched
    depth: AtomicUsize,
    /// Items sent and not yet acknowledged
    unfinished: AtomicUsize,
    drained: Notify,
}

impl QueueState {
    fn finish_one(&self) {
        let previous = self
            .unfinished
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if previous == Ok(1) {
            self.drained.notify_waiters();
        }
    }
}

enum Tx<T> {
    Bounded(mpsc::Sender<T>),
    Unbounded(mpsc::UnboundedSender<T>),
}

enum Rx<T> {
    Bounded(mpsc::Receiver<T>),
    Unbounded(mpsc::UnboundedReceiver<T>),
}

impl<T> Rx<T> {
    async fn recv(&mut self) -> Option<T> {
        match self {
            Self::Bounded(rx) => rx.recv().await,
            Self::Unbounded(rx) => rx.recv().await,
        }
    }
}

/// Create a queue
pub fn task_queue<T: Send + 'static>(capacity: QueueCapacity) -> (QueueSender<T>, QueueSource<T>) {
    let (tx, rx) = match capacity {
        QueueCapacity::Unbounded => {
            let (tx, rx) = mpsc::unbounded_channel();
            (Tx::Unbounded(tx), Rx::Unbounded(rx))
        }
        QueueCapacity::Bounded(limit) => {
            let (tx, rx) = mpsc::channel(limit.max(1));
            (Tx::Bounded(tx), Rx::Bounded(rx))
        }
    };

    let probe = QueueProbe {
        state: Arc::new(QueueState::default()),
        capacity,
    };

    (
        QueueSender {
            tx,
            probe: probe.clone(),
        },
        QueueSource {
            rx: Arc::new(Mutex::new(rx)),
            probe,
        },
    )
}

/// Producer half of a queue
pub struct QueueSender<T> {
    tx: Tx<T>,
    probe: QueueProbe,
}

impl<T> Clone for QueueSender<T> {
    fn clone(&self) -> Self {
        let tx = match &self.tx {
            Tx::Bounded(tx) => Tx::Bounded(tx.clone()),
            Tx::Unbounded(tx) => Tx::Unbounded(tx.clone()),
        };
        Self {
            tx,
            probe: self.probe.clone(),
        }
    }
}

impl<T: Send + 'static> QueueSender<T> {
    /// Enqueue an item, suspending while a bounded queue is full
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Closed`] with the item if the consumer side is gone
    pub async fn send(&self, item: T) -> Result<(), QueueError<T>> {
        let state = &self.probe.state;

        // Counters move only at the synchronous hand-off so a cancelled send
        // leaves them untouched.
        match &self.tx {
            Tx::Bounded(tx) => {
                let Ok(permit) = tx.reserve().await else {
                    return Err(QueueError::Closed(item));
                };
                state.unfinished.fetch_add(1, Ordering::SeqCst);
                state.depth.fetch_add(1, Ordering::SeqCst);
                permit.send(item);
                Ok(())
            }
            Tx::Unbounded(tx) => {
                state.unfinished.fetch_add(1, Ordering::SeqCst);
                state.depth.fetch_add(1, Ordering::SeqCst);
                tx.send(item).map_err(|err| {
                    state.depth.fetch_sub(1, Ordering::SeqCst);
                    state.finish_one();
                    QueueError::Closed(err.0)
                })
            }
        }
    }

    /// Observer for depth and completion
    #[must_use]
    pub fn probe(&self) -> QueueProbe {
        self.probe.clone()
    }
}

/// Consumer half of a queue
///
/// Cloning shares the same underlying receiver, so clones compete for items.
pub struct QueueSource<T> {
    rx: Arc<Mutex<Rx<T>>>,
    probe: QueueProbe,
}

impl<T> Clone for QueueSource<T> {
    fn clone(&self) -> Self {
        Self {
            rx: Arc::clone(&self.rx),
            probe: self.probe.clone(),
        }
    }
}

impl<T> QueueSource<T> {
    /// Observer for depth and completion
    #[must_use]
    pub fn probe(&self) -> QueueProbe {
        self.probe.clone()
    }
}

#[async_trait]
impl<T: Send + 'static> TaskSource<T> for QueueSource<T> {
    async fn fetch(&self) -> Result<Fetched<T>, SourceError> {
        let mut rx = self.rx.lock().await;
        Ok(match rx.recv().await {
            Some(item) => {
                self.probe.state.depth.fetch_sub(1, Ordering::SeqCst);
                Fetched::Task(item)
            }
            None => Fetched::EndOfStream,
        })
    }

    /// Extra acknowledgements beyond the number of sent items are ignored.
    fn acknowledge(&self) {
        self.probe.state.finish_one();
    }
}

/// Type-erased view of a queue's counters
#[derive(Clone)]
pub struct QueueProbe {
    state: Arc<QueueState>,
    capacity: QueueCapacity,
}

impl QueueProbe {
    /// Items buffered and not yet fetched
    #[must_use]
    pub fn depth(&self) -> usize {
        self.state.depth.load(Ordering::SeqCst)
    }

    /// Items sent and not yet acknowledged
    #[must_use]
    pub fn unfinished(&self) -> usize {
        self.state.unfinished.load(Ordering::SeqCst)
    }

    /// Configured capacity
    #[must_use]
    pub const fn capacity(&self) -> QueueCapacity {
        self.capacity
    }

    /// Buffer fill ratio (0.0 - 1.0)
    #[must_use]
    pub fn fill_ratio(&self) -> f64 {
        self.capacity.fill_ratio(self.depth())
    }

    /// Wait until every sent item has been acknowledged
    pub async fn wait_drained(&self) {
        loop {
            let notified = self.state.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.unfinished() == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl fmt::Debug for QueueProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueProbe")
            .field("capacity", &self.capacity)
            .field("depth", &self.depth())
            .field("unfinished", &self.unfinished())
            .finish()
    }
}
