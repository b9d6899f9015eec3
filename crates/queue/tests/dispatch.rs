#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mirror_queue::{spawn, Backoff, DispatchConfig, Outcome, Worker};
use tokio::time::{sleep, Instant};

fn cfg(workers: usize) -> DispatchConfig {
    DispatchConfig { workers, pass_timeout: Duration::from_secs(60), channel_cap: 64 }
}

#[derive(Default)]
struct Tracking {
    state: Mutex<TrackState>,
}

#[derive(Default)]
struct TrackState {
    running: HashMap<&'static str, u32>,
    total_running: u32,
    max_same_key: u32,
    max_total: u32,
    runs: HashMap<&'static str, u32>,
}

#[async_trait::async_trait]
impl Worker<&'static str> for Tracking {
    async fn run(&self, key: &'static str) -> Outcome {
        {
            let mut s = self.state.lock().unwrap();
            let n = s.running.entry(key).or_insert(0);
            *n += 1;
            let n = *n;
            s.total_running += 1;
            s.max_same_key = s.max_same_key.max(n);
            s.max_total = s.max_total.max(s.total_running);
        }
        sleep(Duration::from_millis(10)).await;
        let mut s = self.state.lock().unwrap();
        *s.running.get_mut(key).unwrap() -= 1;
        s.total_running -= 1;
        *s.runs.entry(key).or_insert(0) += 1;
        Outcome::Done
    }
}

#[tokio::test(start_paused = true)]
async fn one_pass_per_key_and_bounded_workers() {
    let worker = Arc::new(Tracking::default());
    let (tx, handle) = spawn(cfg(2), Arc::clone(&worker));
    for k in ["a", "a", "a", "a", "a", "b", "c"] {
        tx.send(k).await.unwrap();
    }
    sleep(Duration::from_secs(1)).await;
    drop(tx);
    handle.await.unwrap();

    let s = worker.state.lock().unwrap();
    assert_eq!(s.max_same_key, 1);
    assert!(s.max_total <= 2, "max_total={}", s.max_total);
    // repeated pushes while "a" ran coalesce into a single follow-up pass
    assert_eq!(s.runs["a"], 2);
    assert_eq!(s.runs["b"], 1);
    assert_eq!(s.runs["c"], 1);
}

struct Scripted {
    outcome: Outcome,
    work: Duration,
    starts: Mutex<Vec<Instant>>,
}

impl Scripted {
    fn new(outcome: Outcome, work: Duration) -> Arc<Self> {
        Arc::new(Self { outcome, work, starts: Mutex::new(Vec::new()) })
    }

    fn offsets(&self) -> Vec<u64> {
        let starts = self.starts.lock().unwrap();
        starts.iter().map(|t| (*t - starts[0]).as_secs()).collect()
    }

    fn gaps(&self) -> Vec<Duration> {
        let starts = self.starts.lock().unwrap();
        starts.windows(2).map(|w| w[1] - w[0]).collect()
    }
}

#[async_trait::async_trait]
impl Worker<&'static str> for Scripted {
    async fn run(&self, _key: &'static str) -> Outcome {
        self.starts.lock().unwrap().push(Instant::now());
        if !self.work.is_zero() {
            sleep(self.work).await;
        }
        self.outcome
    }
}

#[tokio::test(start_paused = true)]
async fn requeue_after_reschedules_periodically() {
    let worker = Scripted::new(Outcome::Requeue(Duration::from_secs(30)), Duration::ZERO);
    let (tx, handle) = spawn(cfg(1), Arc::clone(&worker));
    tx.send("m").await.unwrap();
    sleep(Duration::from_secs(65)).await;
    drop(tx);
    handle.await.unwrap();
    assert_eq!(worker.gaps(), vec![Duration::from_secs(30), Duration::from_secs(30)]);
}

#[tokio::test(start_paused = true)]
async fn external_triggers_replace_the_pending_resync() {
    let worker = Scripted::new(Outcome::Requeue(Duration::from_secs(30)), Duration::ZERO);
    let (tx, handle) = spawn(cfg(1), Arc::clone(&worker));
    tx.send("m").await.unwrap();
    sleep(Duration::from_secs(10)).await;
    tx.send("m").await.unwrap();
    sleep(Duration::from_secs(10)).await;
    tx.send("m").await.unwrap();
    sleep(Duration::from_secs(75)).await;
    drop(tx);
    handle.await.unwrap();
    // one resync chain, restarted by each triggered pass
    assert_eq!(worker.offsets(), vec![0, 10, 20, 50, 80]);
}

#[tokio::test(start_paused = true)]
async fn failures_back_off_exponentially_up_to_cap() {
    let backoff = Backoff { base: Duration::from_secs(1), max: Duration::from_secs(4) };
    let worker = Scripted::new(Outcome::Failed(backoff), Duration::ZERO);
    let (tx, handle) = spawn(cfg(1), Arc::clone(&worker));
    tx.send("m").await.unwrap();
    sleep(Duration::from_millis(12_500)).await;
    drop(tx);
    handle.await.unwrap();
    let secs: Vec<u64> = worker.gaps().into_iter().map(|d| d.as_secs()).collect();
    assert_eq!(secs, vec![1, 2, 4, 4]);
}

#[tokio::test(start_paused = true)]
async fn timed_out_pass_counts_as_failure() {
    let worker = Scripted::new(Outcome::Done, Duration::from_secs(10));
    let cfg = DispatchConfig { workers: 1, pass_timeout: Duration::from_secs(1), channel_cap: 8 };
    let (tx, handle) = spawn(cfg, Arc::clone(&worker));
    tx.send("m").await.unwrap();
    // timeout at 1s, default backoff 5s => second start at 6s
    sleep(Duration::from_millis(6_500)).await;
    drop(tx);
    handle.await.unwrap();
    assert_eq!(worker.gaps(), vec![Duration::from_secs(6)]);
}

#[tokio::test]
async fn dispatcher_exits_when_senders_drop() {
    let worker = Scripted::new(Outcome::Done, Duration::ZERO);
    let (tx, handle) = spawn(cfg(1), Arc::clone(&worker));
    drop(tx);
    tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
}
