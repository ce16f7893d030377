//! Serialization of UI work: single-flight admission and the FIFO job queue.
//!
//! The queue is the ordering point for everything that touches the UI; the
//! single-flight slot sits above it for completions, coalescing byte-identical
//! concurrent retries onto one UI transaction and fast-rejecting mismatches.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use chatgpt_driver::{AskOutcome, BridgeError, BridgeErrorKind};
use tokio::sync::{Mutex, Notify, oneshot, watch};

pub const QUEUE_FULL_RETRY_AFTER_SEC: u64 = 10;

pub type AskResult = Result<AskOutcome, BridgeError>;
type SharedAskResult = Arc<AskResult>;
type OutcomeReceiver = watch::Receiver<Option<SharedAskResult>>;

#[derive(Default)]
struct WaiterBook {
    active: AtomicUsize,
    timed_out: AtomicUsize,
}

impl WaiterBook {
    fn all_timed_out(&self) -> bool {
        self.active.load(Ordering::SeqCst) == 0 && self.timed_out.load(Ordering::SeqCst) > 0
    }
}

struct InFlightEntry {
    fingerprint: String,
    rx: OutcomeReceiver,
    waiters: Arc<WaiterBook>,
}

/// A claim on the in-flight task's eventual result.
pub struct OutcomeHandle {
    rx: OutcomeReceiver,
    waiters: Arc<WaiterBook>,
}

impl OutcomeHandle {
    /// Waits for the task to settle. On timeout the caller is rejected but
    /// the task keeps draining the UI; its settlement is logged as a late
    /// outcome once every waiter has given up.
    pub async fn wait(mut self, timeout: Duration) -> AskResult {
        match tokio::time::timeout(timeout, self.rx.wait_for(Option::is_some)).await {
            Ok(Ok(value_ref)) => {
                let shared = (*value_ref).clone();
                drop(value_ref);
                self.waiters.active.fetch_sub(1, Ordering::SeqCst);
                match shared {
                    Some(result) => (*result).clone(),
                    None => Err(BridgeError::new(
                        BridgeErrorKind::Unknown,
                        "ui task settled without a result",
                    )),
                }
            }
            Ok(Err(_closed)) => {
                self.waiters.active.fetch_sub(1, Ordering::SeqCst);
                Err(BridgeError::new(
                    BridgeErrorKind::Unknown,
                    "ui task dropped before settling",
                ))
            }
            Err(_elapsed) => {
                self.waiters.active.fetch_sub(1, Ordering::SeqCst);
                self.waiters.timed_out.fetch_add(1, Ordering::SeqCst);
                Err(BridgeError::timeout(
                    "ui task did not settle before the caller deadline",
                ))
            }
        }
    }
}

pub enum Admission {
    Admitted(OutcomeHandle),
    Joined(OutcomeHandle),
    Busy,
}

/// At most one completion transaction in flight, keyed by fingerprint.
#[derive(Clone, Default)]
pub struct SingleFlight {
    slot: Arc<Mutex<Option<InFlightEntry>>>,
}

impl SingleFlight {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Admits `task` if the slot is free, joins an identical in-flight
    /// request, or reports busy for a mismatched one. The admitted task is
    /// spawned so it outlives caller timeouts; the slot clears itself on
    /// settlement.
    pub async fn try_admit<F>(&self, fingerprint: &str, task: F) -> Admission
    where
        F: Future<Output = AskResult> + Send + 'static,
    {
        let mut slot = self.slot.lock().await;
        if let Some(entry) = slot.as_ref() {
            if entry.fingerprint == fingerprint {
                entry.waiters.active.fetch_add(1, Ordering::SeqCst);
                return Admission::Joined(OutcomeHandle {
                    rx: entry.rx.clone(),
                    waiters: entry.waiters.clone(),
                });
            }
            return Admission::Busy;
        }

        let (tx, rx) = watch::channel(None);
        let waiters = Arc::new(WaiterBook::default());
        waiters.active.store(1, Ordering::SeqCst);

        let slot_arc = self.slot.clone();
        let book = waiters.clone();
        let fingerprint_hash = hash_fingerprint(fingerprint);
        tokio::spawn(async move {
            let result = Arc::new(task.await);
            let ok = result.is_ok();
            let _ = tx.send(Some(result));
            *slot_arc.lock().await = None;
            if book.all_timed_out() {
                tracing::warn!(
                    fingerprint = %format!("{fingerprint_hash:016x}"),
                    ok,
                    "ui task settled after every caller timed out"
                );
            }
        });

        *slot = Some(InFlightEntry {
            fingerprint: fingerprint.to_string(),
            rx: rx.clone(),
            waiters: waiters.clone(),
        });
        Admission::Admitted(OutcomeHandle { rx, waiters })
    }
}

/// Prompts are sensitive; logs only ever see the fingerprint's hash.
fn hash_fingerprint(fingerprint: &str) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    fingerprint.hash(&mut hasher);
    hasher.finish()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueRefusal {
    Full { retry_after_sec: u64 },
    Busy,
}

type QueueJob = Pin<Box<dyn Future<Output = ()> + Send>>;

struct QueueInner {
    jobs: Mutex<VecDeque<(String, QueueJob)>>,
    running: AtomicBool,
    depth: AtomicUsize,
    notify: Notify,
    max_size: usize,
    default_timeout: Duration,
}

/// Bounded FIFO queue with a single worker task driving the UI.
#[derive(Clone)]
pub struct UiWorkQueue {
    inner: Arc<QueueInner>,
}

impl UiWorkQueue {
    #[must_use]
    pub fn new(max_size: usize, default_timeout: Duration) -> Self {
        let inner = Arc::new(QueueInner {
            jobs: Mutex::new(VecDeque::new()),
            running: AtomicBool::new(false),
            depth: AtomicUsize::new(0),
            notify: Notify::new(),
            max_size,
            default_timeout,
        });
        tokio::spawn(worker(inner.clone()));
        Self { inner }
    }

    #[must_use]
    pub fn default_timeout(&self) -> Duration {
        self.inner.default_timeout
    }

    /// Queued jobs, including the one currently running.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.inner.depth.load(Ordering::SeqCst)
    }

    /// FIFO enqueue; refuses with a retry hint when the queue is full.
    pub async fn submit<T, F>(
        &self,
        label: &str,
        job: F,
    ) -> Result<oneshot::Receiver<T>, QueueRefusal>
    where
        T: Send + 'static,
        F: Future<Output = T> + Send + 'static,
    {
        let mut jobs = self.inner.jobs.lock().await;
        if jobs.len() >= self.inner.max_size {
            return Err(QueueRefusal::Full {
                retry_after_sec: QUEUE_FULL_RETRY_AFTER_SEC,
            });
        }
        Ok(self.push(&mut jobs, label, job))
    }

    /// Enqueue only when the queue is empty and nothing is running; the
    /// completion path maps a refusal to `previous_response_pending`.
    pub async fn submit_if_idle<T, F>(
        &self,
        label: &str,
        job: F,
    ) -> Result<oneshot::Receiver<T>, QueueRefusal>
    where
        T: Send + 'static,
        F: Future<Output = T> + Send + 'static,
    {
        let mut jobs = self.inner.jobs.lock().await;
        if !jobs.is_empty() || self.inner.running.load(Ordering::SeqCst) {
            return Err(QueueRefusal::Busy);
        }
        Ok(self.push(&mut jobs, label, job))
    }

    fn push<T, F>(
        &self,
        jobs: &mut VecDeque<(String, QueueJob)>,
        label: &str,
        job: F,
    ) -> oneshot::Receiver<T>
    where
        T: Send + 'static,
        F: Future<Output = T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        jobs.push_back((
            label.to_string(),
            Box::pin(async move {
                let _ = tx.send(job.await);
            }),
        ));
        self.inner.depth.fetch_add(1, Ordering::SeqCst);
        self.inner.notify.notify_one();
        rx
    }
}

async fn worker(inner: Arc<QueueInner>) {
    loop {
        let next = {
            let mut jobs = inner.jobs.lock().await;
            let next = jobs.pop_front();
            if next.is_some() {
                inner.running.store(true, Ordering::SeqCst);
            }
            next
        };
        match next {
            Some((label, job)) => {
                tracing::debug!(job = %label, "ui job started");
                job.await;
                inner.running.store(false, Ordering::SeqCst);
                inner.depth.fetch_sub(1, Ordering::SeqCst);
                tracing::debug!(job = %label, "ui job finished");
            }
            None => inner.notify.notified().await,
        }
    }
}

/// Caller-side wait on a queued job's result.
pub async fn await_job<T>(rx: oneshot::Receiver<T>, timeout: Duration) -> Result<T, BridgeError> {
    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(_recv)) => Err(BridgeError::new(
            BridgeErrorKind::Unknown,
            "ui job dropped before completion",
        )),
        Err(_elapsed) => Err(BridgeError::timeout(
            "ui job did not complete before the deadline",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatgpt_driver::ExtractionMode;
    use std::sync::atomic::AtomicU32;

    fn outcome(text: &str) -> AskOutcome {
        AskOutcome {
            text: text.to_string(),
            context_reset: false,
            opened_conversation_id: None,
            extraction_mode: ExtractionMode::Marker,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn identical_fingerprints_coalesce_onto_one_task() {
        let flight = SingleFlight::new();
        let runs = Arc::new(AtomicU32::new(0));

        let runs_a = runs.clone();
        let first = flight
            .try_admit("fp-1", async move {
                runs_a.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(150)).await;
                Ok(outcome("ok"))
            })
            .await;
        let Admission::Admitted(first) = first else {
            panic!("expected admission into the free slot");
        };

        let runs_b = runs.clone();
        let second = flight
            .try_admit("fp-1", async move {
                runs_b.fetch_add(1, Ordering::SeqCst);
                Ok(outcome("never runs"))
            })
            .await;
        let Admission::Joined(second) = second else {
            panic!("expected joining the in-flight task");
        };

        let timeout = Duration::from_secs(5);
        let (a, b) = tokio::join!(first.wait(timeout), second.wait(timeout));
        assert_eq!(a.unwrap().text, "ok");
        assert_eq!(b.unwrap().text, "ok");
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn mismatched_fingerprint_is_rejected_immediately() {
        let flight = SingleFlight::new();
        let Admission::Admitted(handle) = flight
            .try_admit("fp-1", async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(outcome("one"))
            })
            .await
        else {
            panic!("expected admission");
        };

        assert!(matches!(
            flight.try_admit("fp-2", async { Ok(outcome("two")) }).await,
            Admission::Busy
        ));

        handle.wait(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn slot_clears_after_settlement() {
        let flight = SingleFlight::new();
        let Admission::Admitted(handle) =
            flight.try_admit("fp-1", async { Ok(outcome("one")) }).await
        else {
            panic!("expected admission");
        };
        handle.wait(Duration::from_secs(5)).await.unwrap();

        // Yield so the spawned task can clear the slot.
        tokio::task::yield_now().await;
        assert!(matches!(
            flight.try_admit("fp-2", async { Ok(outcome("two")) }).await,
            Admission::Admitted(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn caller_timeout_leaves_the_task_running() {
        let flight = SingleFlight::new();
        let finished = Arc::new(AtomicBool::new(false));
        let finished_task = finished.clone();
        let Admission::Admitted(handle) = flight
            .try_admit("fp-slow", async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                finished_task.store(true, Ordering::SeqCst);
                Ok(outcome("late"))
            })
            .await
        else {
            panic!("expected admission");
        };

        let err = handle.wait(Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err.kind, BridgeErrorKind::Timeout);
        assert!(!finished.load(Ordering::SeqCst));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn queue_preserves_fifo_order() {
        let queue = UiWorkQueue::new(20, Duration::from_secs(5));
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut receivers = Vec::new();
        for i in 0..3 {
            let order = order.clone();
            let rx = queue
                .submit("test", async move {
                    order.lock().await.push(i);
                    i
                })
                .await
                .unwrap();
            receivers.push(rx);
        }
        for (i, rx) in receivers.into_iter().enumerate() {
            assert_eq!(await_job(rx, Duration::from_secs(5)).await.unwrap(), i);
        }
        assert_eq!(*order.lock().await, vec![0, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_refuses_with_retry_hint() {
        let queue = UiWorkQueue::new(1, Duration::from_secs(5));
        let _blocker = queue
            .submit("blocker", async {
                tokio::time::sleep(Duration::from_secs(600)).await;
            })
            .await
            .unwrap();
        // Worker may or may not have picked the first job up; fill whatever
        // capacity remains.
        let mut refusal = None;
        for _ in 0..3 {
            match queue.submit("filler", async {}).await {
                Ok(_) => {}
                Err(r) => {
                    refusal = Some(r);
                    break;
                }
            }
        }
        assert_eq!(
            refusal,
            Some(QueueRefusal::Full {
                retry_after_sec: QUEUE_FULL_RETRY_AFTER_SEC
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn submit_if_idle_refuses_while_any_job_runs() {
        let queue = UiWorkQueue::new(20, Duration::from_secs(5));
        let _long = queue
            .submit("long", async {
                tokio::time::sleep(Duration::from_secs(30)).await;
            })
            .await
            .unwrap();
        tokio::task::yield_now().await;

        assert_eq!(
            queue.submit_if_idle::<(), _>("ask", async {}).await.err(),
            Some(QueueRefusal::Busy)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn submit_if_idle_accepts_on_a_quiet_queue() {
        let queue = UiWorkQueue::new(20, Duration::from_secs(5));
        let rx = queue.submit_if_idle("ask", async { 7 }).await.unwrap();
        assert_eq!(await_job(rx, Duration::from_secs(5)).await.unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn depth_counts_queued_and_running_jobs() {
        let queue = UiWorkQueue::new(20, Duration::from_secs(5));
        assert_eq!(queue.depth(), 0);
        let rx = queue
            .submit("job", async {
                tokio::time::sleep(Duration::from_millis(50)).await;
            })
            .await
            .unwrap();
        assert_eq!(queue.depth(), 1);
        await_job(rx, Duration::from_secs(5)).await.unwrap();
        assert_eq!(queue.depth(), 0);
    }
}
