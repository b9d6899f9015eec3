//! Mirror queue: coalescing work queue and dispatcher.
//!
//! A key is pending at most once, runs on at most one worker at a time, and a key that
//! is re-added while running is queued again once its current pass finishes.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// FIFO of pending keys with per-key dedup and in-flight tracking.
pub struct WorkQueue<K> {
    order: VecDeque<K>,
    queued: FxHashSet<K>,
    active: FxHashSet<K>,
    dirty: FxHashSet<K>,
}

impl<K: Clone + Eq + Hash> Default for WorkQueue<K> {
    fn default() -> Self {
        Self {
            order: VecDeque::new(),
            queued: FxHashSet::default(),
            active: FxHashSet::default(),
            dirty: FxHashSet::default(),
        }
    }
}

impl<K: Clone + Eq + Hash> WorkQueue<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pending keys (not counting in-flight ones).
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn in_flight(&self) -> usize {
        self.active.len()
    }

    /// Returns `true` if the key became pending now.
    pub fn push(&mut self, key: K) -> bool {
        if self.active.contains(&key) {
            self.dirty.insert(key);
            return false;
        }
        if !self.queued.insert(key.clone()) {
            return false;
        }
        self.order.push_back(key);
        true
    }

    /// Take the oldest pending key and mark it in flight.
    pub fn pop(&mut self) -> Option<K> {
        let key = self.order.pop_front()?;
        self.queued.remove(&key);
        self.active.insert(key.clone());
        Some(key)
    }

    /// Finish an in-flight key; re-queues it if it was pushed while running.
    pub fn done(&mut self, key: &K) {
        self.active.remove(key);
        if self.dirty.remove(key) {
            self.push(key.clone());
        }
    }
}

/// Exponential retry schedule: `base * 2^(failures-1)`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self { base: Duration::from_secs(5), max: Duration::from_secs(300) }
    }
}

impl Backoff {
    pub fn delay(&self, failures: u32) -> Duration {
        let shift = failures.saturating_sub(1).min(20);
        self.base.saturating_mul(1u32 << shift).min(self.max)
    }
}

/// What the dispatcher should do with a key after a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Succeeded; run again after the delay.
    Requeue(Duration),
    /// Succeeded; wait for the next external trigger.
    Done,
    /// Failed; retry with backoff based on consecutive failures.
    Failed(Backoff),
}

#[async_trait::async_trait]
pub trait Worker<K>: Send + Sync + 'static {
    async fn run(&self, key: K) -> Outcome;
}

#[derive(Debug, Clone, Copy)]
pub struct DispatchConfig {
    pub workers: usize,
    /// Deadline for one pass; an expired pass counts as a failure.
    pub pass_timeout: Duration,
    pub channel_cap: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self { workers: 4, pass_timeout: Duration::from_secs(60), channel_cap: 1024 }
    }
}

/// Spawn the dispatch loop. Returns the request sender and the loop handle; the loop
/// exits once every sender is dropped and in-flight passes have finished.
pub fn spawn<K, W>(cfg: DispatchConfig, worker: Arc<W>) -> (mpsc::Sender<K>, JoinHandle<()>)
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    W: Worker<K>,
{
    let (tx, rx) = mpsc::channel::<K>(cfg.channel_cap.max(1));
    let handle = tokio::spawn(dispatch_loop(cfg, worker, rx));
    (tx, handle)
}

async fn dispatch_loop<K, W>(cfg: DispatchConfig, worker: Arc<W>, mut rx: mpsc::Receiver<K>)
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    W: Worker<K>,
{
    let workers = cfg.workers.max(1);
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<(K, Outcome)>();
    let mut queue: WorkQueue<K> = WorkQueue::new();
    let mut failures: FxHashMap<K, u32> = FxHashMap::default();
    // at most one pending re-add per key; a pass started by any trigger clears it
    let mut deadlines: FxHashMap<K, Instant> = FxHashMap::default();
    let mut closing = false;

    info!(workers, "dispatcher started");
    loop {
        while !closing && queue.in_flight() < workers {
            let Some(key) = queue.pop() else { break };
            deadlines.remove(&key);
            start_pass(key, Arc::clone(&worker), cfg.pass_timeout, done_tx.clone());
        }
        gauge!("mirror_queue_depth", queue.len() as f64);
        gauge!("mirror_queue_scheduled", deadlines.len() as f64);
        if closing && queue.in_flight() == 0 {
            break;
        }

        let next = deadlines.values().min().copied();
        tokio::select! {
            maybe = rx.recv(), if !closing => match maybe {
                Some(key) => { queue.push(key); }
                None => {
                    debug!(in_flight = queue.in_flight(), "request channel closed; draining");
                    closing = true;
                    deadlines.clear();
                }
            },
            _ = tokio::time::sleep_until(next.unwrap_or_else(Instant::now)), if next.is_some() && !closing => {
                let now = Instant::now();
                let due: Vec<K> = deadlines.iter().filter(|(_, at)| **at <= now).map(|(k, _)| k.clone()).collect();
                for key in due {
                    deadlines.remove(&key);
                    queue.push(key);
                }
            }
            Some((key, outcome)) = done_rx.recv() => {
                queue.done(&key);
                let delay = match outcome {
                    Outcome::Requeue(d) => { failures.remove(&key); Some(d) }
                    Outcome::Done => { failures.remove(&key); None }
                    Outcome::Failed(backoff) => {
                        let n = failures.entry(key.clone()).or_insert(0);
                        *n += 1;
                        counter!("mirror_queue_retries_total", 1u64);
                        Some(backoff.delay(*n))
                    }
                };
                match delay {
                    Some(d) if !closing => { deadlines.insert(key, Instant::now() + d); }
                    _ => { deadlines.remove(&key); }
                }
            }
        }
    }
    info!("dispatcher stopped");
}

fn start_pass<K, W>(key: K, worker: Arc<W>, timeout: Duration, done: mpsc::UnboundedSender<(K, Outcome)>)
where
    K: Clone + Debug + Send + Sync + 'static,
    W: Worker<K>,
{
    tokio::spawn(async move {
        let k = key.clone();
        let pass = tokio::spawn(async move { tokio::time::timeout(timeout, worker.run(k)).await });
        let outcome = match pass.await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => {
                warn!(key = ?key, timeout_secs = timeout.as_secs(), "pass timed out");
                Outcome::Failed(Backoff::default())
            }
            Err(e) => {
                warn!(key = ?key, error = %e, "pass aborted");
                Outcome::Failed(Backoff::default())
            }
        };
        let _ = done.send((key, outcome));
    });
}
