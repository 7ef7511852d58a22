use crate::record::RawRecord;
use crate::validate::{ValidationOutcome, validate_batch};
use chrono::{DateTime, Utc};
use hashbrown::HashMap;
use log::{debug, error, info, warn};
use std::collections::BinaryHeap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("validation pool queue is full")]
    Overloaded,

    #[error("validation task timed out")]
    TimedOut,

    #[error("the worker executing this task was lost")]
    WorkerLost,

    #[error("validation pool is shutting down")]
    ShuttingDown,
}

/// CPU-bound work the pool knows how to run. Health probes outrank
/// validation in the queue so a loaded pool can still be probed.
pub enum TaskKind {
    HealthCheck,
    Validate {
        // Shared with the submitter so a WorkerLost fallback can re-validate
        // inline without copying the batch
        records: Arc<Vec<RawRecord>>,
        now: DateTime<Utc>,
    },
}

pub enum TaskOutput {
    Healthy,
    Valid(ValidationOutcome),
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    pub task_timeout: Duration,
    pub max_queue_depth: usize,
    pub replace_backoff: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|cores| cores.get())
            .unwrap_or(1);
        PoolConfig {
            min_workers: 2.min(cores),
            max_workers: cores.min(8),
            task_timeout: Duration::from_secs(30),
            max_queue_depth: 256,
            replace_backoff: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Default)]
pub struct PoolCounters {
    pub submitted: AtomicU64,
    pub completed: AtomicU64,
    pub timed_out: AtomicU64,
    pub rejected_overloaded: AtomicU64,
    pub workers_spawned: AtomicU64,
    pub workers_lost: AtomicU64,
    pub queue_depth: AtomicU64,
    pub busy_workers: AtomicU64,
    pub worker_count: AtomicU64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct PoolSnapshot {
    pub submitted: u64,
    pub completed: u64,
    pub timed_out: u64,
    pub rejected_overloaded: u64,
    pub workers_spawned: u64,
    pub workers_lost: u64,
    pub queue_depth: u64,
    pub busy_workers: u64,
    pub worker_count: u64,
    /// busy / total, 0.0 when the pool has no workers
    pub utilization: f64,
}

impl PoolCounters {
    pub fn snapshot(&self) -> PoolSnapshot {
        let busy = self.busy_workers.load(Ordering::Relaxed);
        let total = self.worker_count.load(Ordering::Relaxed);
        PoolSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            rejected_overloaded: self.rejected_overloaded.load(Ordering::Relaxed),
            workers_spawned: self.workers_spawned.load(Ordering::Relaxed),
            workers_lost: self.workers_lost.load(Ordering::Relaxed),
            queue_depth: self.queue_depth.load(Ordering::Relaxed),
            busy_workers: busy,
            worker_count: total,
            utilization: if total > 0 {
                busy as f64 / total as f64
            } else {
                0.0
            },
        }
    }
}

/// Fixed pool of OS threads for CPU-bound validation, so large batches do not
/// stall the async runtime. The lower bound of workers is created eagerly;
/// more are added under queue pressure up to the upper bound. Workers live
/// for the process lifetime unless a task panics in one, in which case the
/// worker is dropped and a replacement spawns after a short backoff.
pub struct ValidationPool {
    submit_tx: mpsc::UnboundedSender<Submission>,
    counters: Arc<PoolCounters>,
    shutdown: CancellationToken,
    manager: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

struct Submission {
    kind: TaskKind,
    reply: oneshot::Sender<Result<TaskOutput, PoolError>>,
}

impl ValidationPool {
    /// Spawn the manager task and the eager lower bound of workers. Must be
    /// called from within a tokio runtime.
    pub fn start(config: PoolConfig) -> ValidationPool {
        let (submit_tx, submit_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let counters = Arc::new(PoolCounters::default());
        let shutdown = CancellationToken::new();

        let manager = Manager::new(config, counters.clone(), shutdown.clone(), event_tx);
        let handle = tokio::spawn(manager.run(submit_rx, event_rx));

        ValidationPool {
            submit_tx,
            counters,
            shutdown,
            manager: parking_lot::Mutex::new(Some(handle)),
        }
    }

    pub async fn execute(&self, kind: TaskKind) -> Result<TaskOutput, PoolError> {
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.submit_tx
            .send(Submission {
                kind,
                reply: reply_tx,
            })
            .map_err(|_| PoolError::ShuttingDown)?;

        // The manager owns all deadlines; a dropped reply only happens when
        // it unwinds during shutdown
        reply_rx.await.unwrap_or(Err(PoolError::ShuttingDown))
    }

    /// Offload one batch validation.
    pub async fn execute_validation(
        &self,
        records: Arc<Vec<RawRecord>>,
        now: DateTime<Utc>,
    ) -> Result<ValidationOutcome, PoolError> {
        match self.execute(TaskKind::Validate { records, now }).await? {
            TaskOutput::Valid(outcome) => Ok(outcome),
            TaskOutput::Healthy => unreachable!("validate tasks only produce validation output"),
        }
    }

    /// Probe the pool: returns once some worker has run a health-check task.
    pub async fn health_check(&self) -> Result<(), PoolError> {
        self.execute(TaskKind::HealthCheck).await.map(|_| ())
    }

    pub fn counters(&self) -> Arc<PoolCounters> {
        self.counters.clone()
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        self.counters.snapshot()
    }

    /// Stop the manager and let all workers exit. Queued and in-flight tasks
    /// fail with `ShuttingDown`.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handle = self.manager.lock().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!("validation pool manager exited abnormally: {err}");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Manager internals
// ---------------------------------------------------------------------------

const TIMEOUT_CHECK_INTERVAL: Duration = Duration::from_millis(100);

struct QueuedTask {
    seq: u64,
    priority: u8,
    kind: TaskKind,
    reply: oneshot::Sender<Result<TaskOutput, PoolError>>,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}
impl Eq for QueuedTask {}
impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Max-heap: higher priority first, then FIFO within a priority
        self.priority
            .cmp(&other.priority)
            .then(other.seq.cmp(&self.seq))
    }
}

struct Job {
    task_id: u64,
    kind: TaskKind,
}

enum WorkerEvent {
    Finished {
        worker_id: u64,
        task_id: u64,
        output: Result<TaskOutput, String>,
    },
    Exited {
        worker_id: u64,
    },
}

enum SlotState {
    Idle,
    Busy {
        task_id: u64,
        deadline: Instant,
        // Some until the submitter has been answered (reply or timeout)
        reply: Option<oneshot::Sender<Result<TaskOutput, PoolError>>>,
        is_probe: bool,
    },
}

struct WorkerSlot {
    job_tx: std::sync::mpsc::Sender<Job>,
    state: SlotState,
    unhealthy: bool,
}

struct Manager {
    config: PoolConfig,
    counters: Arc<PoolCounters>,
    shutdown: CancellationToken,
    workers: HashMap<u64, WorkerSlot>,
    queue: BinaryHeap<QueuedTask>,
    pending_spawns: Vec<Instant>,
    event_tx: mpsc::UnboundedSender<WorkerEvent>,
    next_worker_id: u64,
    next_task_id: u64,
    next_seq: u64,
}

impl Manager {
    fn new(
        config: PoolConfig,
        counters: Arc<PoolCounters>,
        shutdown: CancellationToken,
        event_tx: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Manager {
        Manager {
            config,
            counters,
            shutdown,
            workers: HashMap::new(),
            queue: BinaryHeap::new(),
            pending_spawns: Vec::new(),
            event_tx,
            next_worker_id: 0,
            next_task_id: 0,
            next_seq: 0,
        }
    }

    async fn run(
        mut self,
        mut submit_rx: mpsc::UnboundedReceiver<Submission>,
        mut event_rx: mpsc::UnboundedReceiver<WorkerEvent>,
    ) {
        for _ in 0..self.config.min_workers {
            self.spawn_worker();
        }
        info!(
            "validation pool started with {} workers (max {})",
            self.config.min_workers, self.config.max_workers
        );

        let mut tick = tokio::time::interval(TIMEOUT_CHECK_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                submission = submit_rx.recv() => {
                    match submission {
                        Some(submission) => self.enqueue(submission),
                        None => break,
                    }
                }
                Some(event) = event_rx.recv() => self.handle_event(event),
                _ = tick.tick() => {
                    self.check_timeouts();
                    self.spawn_due_replacements();
                }
                _ = self.shutdown.cancelled() => break,
            }

            self.dispatch();
            self.counters
                .queue_depth
                .store(self.queue.len() as u64, Ordering::Relaxed);
        }

        debug!("validation pool manager unwinding");
        for task in self.queue.drain() {
            let _ = task.reply.send(Err(PoolError::ShuttingDown));
        }
        for (_, slot) in self.workers.iter_mut() {
            if let SlotState::Busy { reply, .. } = &mut slot.state {
                if let Some(reply) = reply.take() {
                    let _ = reply.send(Err(PoolError::ShuttingDown));
                }
            }
        }
        // Dropping the slots closes every job channel, which ends the worker
        // threads at their next recv
        self.workers.clear();
    }

    fn enqueue(&mut self, submission: Submission) {
        if self.queue.len() >= self.config.max_queue_depth {
            self.counters
                .rejected_overloaded
                .fetch_add(1, Ordering::Relaxed);
            let _ = submission.reply.send(Err(PoolError::Overloaded));
            return;
        }

        let priority = match submission.kind {
            TaskKind::HealthCheck => 1,
            TaskKind::Validate { .. } => 0,
        };
        self.next_seq += 1;
        self.queue.push(QueuedTask {
            seq: self.next_seq,
            priority,
            kind: submission.kind,
            reply: submission.reply,
        });

        // Scale up under pressure: everything busy and room to grow
        let idle = self
            .workers
            .values()
            .any(|slot| matches!(slot.state, SlotState::Idle));
        if !idle && self.workers.len() + self.pending_spawns.len() < self.config.max_workers {
            self.spawn_worker();
        }
    }

    fn dispatch(&mut self) {
        loop {
            if self.queue.is_empty() {
                return;
            }
            let Some(worker_id) = self
                .workers
                .iter()
                .find(|(_, slot)| matches!(slot.state, SlotState::Idle) && !slot.unhealthy)
                .map(|(id, _)| *id)
            else {
                return;
            };

            let task = self
                .queue
                .pop()
                .expect("queue emptiness was checked above");
            self.next_task_id += 1;
            let task_id = self.next_task_id;

            let slot = self
                .workers
                .get_mut(&worker_id)
                .expect("worker id came from the map");
            let send_result = slot.job_tx.send(Job {
                task_id,
                kind: task.kind,
            });

            match send_result {
                Ok(()) => {
                    slot.state = SlotState::Busy {
                        task_id,
                        deadline: Instant::now() + self.config.task_timeout,
                        reply: Some(task.reply),
                        is_probe: false,
                    };
                    self.counters.busy_workers.fetch_add(1, Ordering::Relaxed);
                }
                Err(_) => {
                    // The worker's receiving end is gone: it died without an
                    // exit event. Fail this task and drop the worker.
                    let _ = task.reply.send(Err(PoolError::WorkerLost));
                    self.remove_worker(worker_id, "job channel closed");
                }
            }
        }
    }

    fn handle_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Finished {
                worker_id,
                task_id,
                output,
            } => {
                let Some(slot) = self.workers.get_mut(&worker_id) else {
                    // A previously-removed worker finished its orphaned task
                    return;
                };
                let SlotState::Busy {
                    task_id: running, ..
                } = &slot.state
                else {
                    return;
                };
                if *running != task_id {
                    return;
                }

                let state = std::mem::replace(&mut slot.state, SlotState::Idle);
                self.counters.busy_workers.fetch_sub(1, Ordering::Relaxed);
                let SlotState::Busy {
                    reply, is_probe, ..
                } = state
                else {
                    unreachable!("state was checked to be busy above");
                };

                match output {
                    Ok(output) => {
                        self.counters.completed.fetch_add(1, Ordering::Relaxed);
                        if is_probe {
                            slot.unhealthy = false;
                            debug!("worker {worker_id} passed its health probe");
                        } else if let Some(reply) = reply {
                            let _ = reply.send(Ok(output));
                        }
                        // A worker that had timed out but eventually finished
                        // gets probed before it serves real traffic again
                        let needs_probe = slot.unhealthy && !is_probe;
                        if needs_probe {
                            self.send_probe(worker_id);
                        }
                    }
                    Err(panic_message) => {
                        error!("worker {worker_id} panicked in a task: {panic_message}");
                        if let Some(reply) = reply {
                            let _ = reply.send(Err(PoolError::WorkerLost));
                        }
                        // An Exited event follows; removal happens there
                    }
                }
            }
            WorkerEvent::Exited { worker_id } => {
                self.remove_worker(worker_id, "worker thread exited");
            }
        }
    }

    fn check_timeouts(&mut self) {
        let now = Instant::now();
        let mut lost = Vec::new();

        for (worker_id, slot) in self.workers.iter_mut() {
            let SlotState::Busy {
                deadline, reply, ..
            } = &mut slot.state
            else {
                continue;
            };
            if *deadline > now {
                continue;
            }

            if let Some(reply) = reply.take() {
                // First expiry: fail the task, keep the worker but flag it
                self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
                slot.unhealthy = true;
                warn!("task on worker {worker_id} timed out; worker flagged unhealthy");
                let _ = reply.send(Err(PoolError::TimedOut));
                *deadline = now + self.config.task_timeout;
            } else {
                // Second expiry without the task ever finishing: the thread
                // is wedged. Orphan it and replace.
                lost.push(*worker_id);
            }
        }

        for worker_id in lost {
            self.remove_worker(worker_id, "worker unresponsive past its grace period");
        }
    }

    fn send_probe(&mut self, worker_id: u64) {
        self.next_task_id += 1;
        let task_id = self.next_task_id;
        let Some(slot) = self.workers.get_mut(&worker_id) else {
            return;
        };
        if slot
            .job_tx
            .send(Job {
                task_id,
                kind: TaskKind::HealthCheck,
            })
            .is_ok()
        {
            slot.state = SlotState::Busy {
                task_id,
                deadline: Instant::now() + self.config.task_timeout,
                reply: None,
                is_probe: true,
            };
            self.counters.busy_workers.fetch_add(1, Ordering::Relaxed);
        } else {
            self.remove_worker(worker_id, "job channel closed before probe");
        }
    }

    fn remove_worker(&mut self, worker_id: u64, reason: &str) {
        let Some(slot) = self.workers.remove(&worker_id) else {
            return;
        };
        warn!("removing worker {worker_id}: {reason}");
        self.counters.workers_lost.fetch_add(1, Ordering::Relaxed);
        self.counters
            .worker_count
            .store(self.workers.len() as u64, Ordering::Relaxed);

        if let SlotState::Busy { reply, .. } = slot.state {
            self.counters.busy_workers.fetch_sub(1, Ordering::Relaxed);
            if let Some(reply) = reply {
                let _ = reply.send(Err(PoolError::WorkerLost));
            }
        }

        // Replacement is asynchronous so a crash loop cannot spin the pool
        self.pending_spawns
            .push(Instant::now() + self.config.replace_backoff);
    }

    fn spawn_due_replacements(&mut self) {
        let now = Instant::now();
        let mut due = 0;
        self.pending_spawns.retain(|at| {
            if *at <= now {
                due += 1;
                false
            } else {
                true
            }
        });
        for _ in 0..due {
            if self.workers.len() < self.config.max_workers {
                self.spawn_worker();
            }
        }
    }

    fn spawn_worker(&mut self) {
        self.next_worker_id += 1;
        let worker_id = self.next_worker_id;
        let (job_tx, job_rx) = std::sync::mpsc::channel();
        let event_tx = self.event_tx.clone();

        std::thread::Builder::new()
            .name(format!("validation-worker-{worker_id}"))
            .spawn(move || worker_loop(worker_id, job_rx, event_tx))
            .expect("spawning a validation worker thread must not fail");

        self.workers.insert(
            worker_id,
            WorkerSlot {
                job_tx,
                state: SlotState::Idle,
                unhealthy: false,
            },
        );
        self.counters.workers_spawned.fetch_add(1, Ordering::Relaxed);
        self.counters
            .worker_count
            .store(self.workers.len() as u64, Ordering::Relaxed);
        debug!("spawned validation worker {worker_id}");
    }
}

fn worker_loop(
    worker_id: u64,
    job_rx: std::sync::mpsc::Receiver<Job>,
    event_tx: mpsc::UnboundedSender<WorkerEvent>,
) {
    while let Ok(job) = job_rx.recv() {
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| run_task(job.kind)));
        match result {
            Ok(output) => {
                if event_tx
                    .send(WorkerEvent::Finished {
                        worker_id,
                        task_id: job.task_id,
                        output: Ok(output),
                    })
                    .is_err()
                {
                    return; // manager is gone
                }
            }
            Err(panic) => {
                // A panic in validation is a fatal worker error: report the
                // failed task, announce the exit, and let the manager replace
                // this thread
                let message = panic_message(panic);
                let _ = event_tx.send(WorkerEvent::Finished {
                    worker_id,
                    task_id: job.task_id,
                    output: Err(message),
                });
                let _ = event_tx.send(WorkerEvent::Exited { worker_id });
                return;
            }
        }
    }
}

fn run_task(kind: TaskKind) -> TaskOutput {
    match kind {
        TaskKind::HealthCheck => TaskOutput::Healthy,
        TaskKind::Validate { records, now } => TaskOutput::Valid(validate_batch(&records, now)),
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic payload of unknown type".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn small_pool() -> ValidationPool {
        ValidationPool::start(PoolConfig {
            min_workers: 2,
            max_workers: 4,
            task_timeout: Duration::from_secs(5),
            max_queue_depth: 8,
            replace_backoff: Duration::from_millis(10),
        })
    }

    #[tokio::test]
    async fn validates_a_batch_off_thread() {
        let pool = small_pool();
        let records = Arc::new(vec![
            json!({"app_id": "A", "message": "m", "level": "info", "source": "s"}),
            json!({"app_id": "A", "level": "info", "source": "s"}),
        ]);

        let outcome = pool
            .execute_validation(records, Utc::now())
            .await
            .unwrap();
        assert_eq!(outcome.valid.len(), 1);
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].index, 1);

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn health_check_round_trips() {
        let pool = small_pool();
        pool.health_check().await.unwrap();
        assert!(pool.snapshot().completed >= 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn overload_fails_fast() {
        // A zero-depth queue rejects the submission before any worker sees it
        let pool = ValidationPool::start(PoolConfig {
            min_workers: 1,
            max_workers: 1,
            task_timeout: Duration::from_secs(5),
            max_queue_depth: 0,
            replace_backoff: Duration::from_millis(10),
        });

        let result = pool
            .execute_validation(Arc::new(vec![json!({})]), Utc::now())
            .await;
        assert_eq!(result.unwrap_err(), PoolError::Overloaded);
        assert_eq!(pool.snapshot().rejected_overloaded, 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_fails_queued_tasks() {
        let pool = small_pool();
        pool.shutdown().await;
        let result = pool
            .execute_validation(Arc::new(vec![json!({})]), Utc::now())
            .await;
        assert_eq!(result.unwrap_err(), PoolError::ShuttingDown);
    }

    #[test]
    fn queue_orders_health_checks_first() {
        let (tx_a, _rx_a) = oneshot::channel();
        let (tx_b, _rx_b) = oneshot::channel();
        let mut queue = BinaryHeap::new();
        queue.push(QueuedTask {
            seq: 1,
            priority: 0,
            kind: TaskKind::Validate {
                records: Arc::new(Vec::new()),
                now: Utc::now(),
            },
            reply: tx_a,
        });
        queue.push(QueuedTask {
            seq: 2,
            priority: 1,
            kind: TaskKind::HealthCheck,
            reply: tx_b,
        });

        let first = queue.pop().unwrap();
        assert!(matches!(first.kind, TaskKind::HealthCheck));
    }

    #[test]
    fn queue_is_fifo_within_a_priority() {
        let mut queue = BinaryHeap::new();
        for seq in 1..=3 {
            let (tx, _rx) = oneshot::channel();
            queue.push(QueuedTask {
                seq,
                priority: 0,
                kind: TaskKind::HealthCheck,
                reply: tx,
            });
        }
        assert_eq!(queue.pop().unwrap().seq, 1);
        assert_eq!(queue.pop().unwrap().seq, 2);
        assert_eq!(queue.pop().unwrap().seq, 3);
    }
}
