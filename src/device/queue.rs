//! Bounded output queue between the device streaming thread and frame consumers

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::utils::CachePadded;
use flume::{Receiver, SendTimeoutError, Sender, TrySendError};
use tracing::{debug, info, warn};

use crate::device::frame::Message;
use crate::error::Result;

/// How long the delivery thread waits before rechecking for close
const DELIVERY_POLL: Duration = Duration::from_millis(100);

type Callback = Box<dyn Fn(&Message) + Send + Sync>;

#[derive(Default)]
struct Stats {
    pushed: AtomicU64,
    dropped: AtomicU64,
    delivered: AtomicU64,
}

/// Snapshot of queue counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pushed: u64,
    pub dropped: u64,
    pub delivered: u64,
}

/// Create a named queue holding at most `size` messages.
///
/// With `blocking` the producer waits for room; otherwise the oldest
/// queued message is discarded.
pub fn output_queue(name: &str, size: usize, blocking: bool) -> (QueueSender, OutputQueue) {
    let (tx, rx) = flume::bounded(size.max(1));
    let stats = Arc::new(CachePadded::new(Stats::default()));
    let closed = Arc::new(AtomicBool::new(false));

    let sender = QueueSender {
        name: Arc::from(name),
        tx,
        drain: rx.clone(),
        blocking,
        closed: closed.clone(),
        stats: stats.clone(),
    };
    let queue = OutputQueue {
        name: name.to_string(),
        rx,
        callbacks: Arc::new(Mutex::new(Vec::new())),
        delivery: Mutex::new(None),
        closed,
        stats,
    };
    (sender, queue)
}

/// Producer half, owned by the device streaming callbacks
#[derive(Clone)]
pub struct QueueSender {
    name: Arc<str>,
    tx: Sender<Message>,
    drain: Receiver<Message>,
    blocking: bool,
    closed: Arc<AtomicBool>,
    stats: Arc<CachePadded<Stats>>,
}

impl QueueSender {
    /// Enqueue a message. Returns `false` once the queue is closed.
    pub fn push(&self, msg: Message) -> bool {
        if self.blocking {
            self.push_blocking(msg)
        } else {
            self.push_overwrite(msg)
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn push_blocking(&self, mut msg: Message) -> bool {
        loop {
            if self.is_closed() {
                return false;
            }
            match self.tx.send_timeout(msg, DELIVERY_POLL) {
                Ok(()) => {
                    self.stats.pushed.fetch_add(1, Ordering::Relaxed);
                    return true;
                }
                Err(SendTimeoutError::Timeout(back)) => msg = back,
                Err(SendTimeoutError::Disconnected(_)) => return false,
            }
        }
    }

    fn push_overwrite(&self, mut msg: Message) -> bool {
        loop {
            if self.is_closed() {
                return false;
            }
            match self.tx.try_send(msg) {
                Ok(()) => {
                    self.stats.pushed.fetch_add(1, Ordering::Relaxed);
                    return true;
                }
                Err(TrySendError::Full(back)) => {
                    if self.drain.try_recv().is_ok() {
                        self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                        metrics::counter!("depthlink_queue_dropped_total").increment(1);
                        debug!(queue = %self.name, "Queue full, dropped oldest message");
                    }
                    msg = back;
                }
                Err(TrySendError::Disconnected(_)) => return false,
            }
        }
    }
}

/// Consumer half: pull messages directly or register callbacks
pub struct OutputQueue {
    name: String,
    rx: Receiver<Message>,
    callbacks: Arc<Mutex<Vec<Callback>>>,
    delivery: Mutex<Option<JoinHandle<()>>>,
    closed: Arc<AtomicBool>,
    stats: Arc<CachePadded<Stats>>,
}

impl OutputQueue {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a callback invoked for every message, in arrival order.
    ///
    /// The first registration starts the delivery thread; from then on
    /// messages are consumed by callbacks and `get` should not be used.
    pub fn add_callback<F>(&self, callback: F) -> Result<()>
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(callback));

        let mut delivery = self.delivery.lock().unwrap_or_else(PoisonError::into_inner);
        if delivery.is_none() {
            let rx = self.rx.clone();
            let callbacks = self.callbacks.clone();
            let closed = self.closed.clone();
            let stats = self.stats.clone();
            let name = self.name.clone();

            let handle = std::thread::Builder::new()
                .name(format!("queue-{}", self.name))
                .spawn(move || deliver(&name, rx, callbacks, closed, stats))?;
            *delivery = Some(handle);
        }
        Ok(())
    }

    /// Pull the next message, waiting at most `timeout`
    pub fn get(&self, timeout: Duration) -> Option<Message> {
        let msg = self.rx.recv_timeout(timeout).ok()?;
        self.stats.delivered.fetch_add(1, Ordering::Relaxed);
        Some(msg)
    }

    /// Messages currently waiting in the queue
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            pushed: self.stats.pushed.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
            delivered: self.stats.delivered.load(Ordering::Relaxed),
        }
    }

    /// Refuse further pushes. A producer blocked on a full queue gives up
    /// within one poll interval.
    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Stop delivery and join the delivery thread
    pub fn close(&self) {
        self.mark_closed();
        let handle = self
            .delivery
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!(queue = %self.name, "Delivery thread panicked");
            }
        }
    }
}

impl Drop for OutputQueue {
    fn drop(&mut self) {
        self.close();
    }
}

fn deliver(
    name: &str,
    rx: Receiver<Message>,
    callbacks: Arc<Mutex<Vec<Callback>>>,
    closed: Arc<AtomicBool>,
    stats: Arc<CachePadded<Stats>>,
) {
    debug!(queue = name, "Delivery thread started");

    while !closed.load(Ordering::Acquire) {
        let msg = match rx.recv_timeout(DELIVERY_POLL) {
            Ok(msg) => msg,
            Err(flume::RecvTimeoutError::Timeout) => continue,
            Err(flume::RecvTimeoutError::Disconnected) => break,
        };

        stats.delivered.fetch_add(1, Ordering::Relaxed);
        let callbacks = callbacks.lock().unwrap_or_else(PoisonError::into_inner);
        for callback in callbacks.iter() {
            callback(&msg);
        }
    }

    info!(queue = name, "Delivery thread stopped");
}
