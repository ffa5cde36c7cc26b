use super::options::LiveStreamOptions;
use super::types::{StreamEvent, StreamNotification};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct BufferInner {
    capacity: usize,
    flush_interval: Duration,
    pending: Mutex<Vec<StreamEvent>>,
    visible: Mutex<VecDeque<StreamEvent>>,
    filter: Mutex<String>,
    flush_scheduled: AtomicBool,
    subscribers: Mutex<Vec<flume::Sender<Vec<StreamEvent>>>>,
}

impl BufferInner {
    fn flush(&self) -> usize {
        let batch = std::mem::take(&mut *lock(&self.pending));
        if batch.is_empty() {
            return 0;
        }

        {
            let mut visible = lock(&self.visible);
            visible.extend(batch.iter().cloned());
            let overflow = visible.len().saturating_sub(self.capacity);
            visible.drain(..overflow);
        }

        let count = batch.len();
        lock(&self.subscribers).retain(|subscriber| subscriber.send(batch.clone()).is_ok());
        count
    }

    /// Clears the scheduled flag after a flush. Returns `true` when events
    /// pushed during the flush are still pending and this flusher took the
    /// flag back to handle them.
    fn release_flush(&self) -> bool {
        self.flush_scheduled.store(false, Ordering::Release);
        if lock(&self.pending).is_empty() {
            return false;
        }
        self.flush_scheduled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Batches stream events for display.
///
/// Pushed events wait in a pending list until the next flush, which runs at
/// most once per flush interval. Flushed events join a visible window holding
/// the newest `capacity` events; older ones are evicted first. Cloning gives
/// another handle to the same buffer.
#[derive(Clone)]
pub struct StreamBuffer {
    inner: Arc<BufferInner>,
}

impl std::fmt::Debug for StreamBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamBuffer")
            .field("capacity", &self.inner.capacity)
            .field("visible", &self.len())
            .field("pending", &lock(&self.inner.pending).len())
            .finish()
    }
}

impl StreamBuffer {
    pub fn new(capacity: usize, flush_interval: Duration) -> Self {
        Self {
            inner: Arc::new(BufferInner {
                capacity: capacity.max(1),
                flush_interval,
                pending: Mutex::new(Vec::new()),
                visible: Mutex::new(VecDeque::with_capacity(capacity)),
                filter: Mutex::new(String::new()),
                flush_scheduled: AtomicBool::new(false),
                subscribers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn from_options(options: &LiveStreamOptions) -> Self {
        Self::new(options.buffer_capacity(), options.flush_interval())
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Queues `event` and makes sure a flush is scheduled.
    ///
    /// Outside a Tokio runtime the event is flushed right away.
    pub fn push(&self, event: StreamEvent) {
        lock(&self.inner.pending).push(event);
        self.schedule_flush();
    }

    fn schedule_flush(&self) {
        if self
            .inner
            .flush_scheduled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let Ok(handle) = Handle::try_current() else {
            self.inner.flush();
            self.inner.flush_scheduled.store(false, Ordering::Release);
            return;
        };

        let inner = self.inner.clone();
        handle.spawn(async move {
            loop {
                tokio::time::sleep(inner.flush_interval).await;
                inner.flush();

                // Events pushed while flushing would otherwise wait for the next push
                if !inner.release_flush() {
                    break;
                }
            }
        });
    }

    /// Moves pending events into the visible window now. Returns how many moved.
    pub fn flush(&self) -> usize {
        self.inner.flush()
    }

    /// Receives each flushed batch, oldest event first.
    pub fn subscribe_batches(&self) -> flume::Receiver<Vec<StreamEvent>> {
        let (sender, receiver) = flume::unbounded();
        lock(&self.inner.subscribers).push(sender);
        receiver
    }

    /// Visible events, oldest first.
    pub fn snapshot(&self) -> Vec<StreamEvent> {
        lock(&self.inner.visible).iter().cloned().collect()
    }

    /// Visible events matching the current filter.
    pub fn filtered(&self) -> Vec<StreamEvent> {
        let filter = self.filter();
        lock(&self.inner.visible)
            .iter()
            .filter(|event| event.matches(&filter))
            .cloned()
            .collect()
    }

    pub fn set_filter(&self, filter: impl Into<String>) {
        *lock(&self.inner.filter) = filter.into();
    }

    pub fn filter(&self) -> String {
        lock(&self.inner.filter).clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.inner.visible).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops visible and pending events.
    pub fn clear(&self) {
        lock(&self.inner.pending).clear();
        lock(&self.inner.visible).clear();
    }

    /// Feeds message notifications from an engine subscription into the
    /// buffer until `cancel` fires or the engine goes away.
    pub fn attach(
        &self,
        notifications: flume::Receiver<StreamNotification>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let buffer = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    notification = notifications.recv_async() => match notification {
                        Ok(StreamNotification::Message(event)) => buffer.push(event),
                        Ok(StreamNotification::Error(message)) => {
                            log::debug!("Stream reported an error: {message}");
                        }
                        Ok(StreamNotification::StatusChanged(_)) => {}
                        Err(_) => break,
                    },
                }
            }
            buffer.flush();
        })
    }
}
