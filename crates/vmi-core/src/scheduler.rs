// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Deadline-driven periodic scheduler for metrics-generation tasks.
//!
//! The order of execution is set by a min-heap sorted by each task's next
//! scheduling time. A dispatcher multiplexes between a timer armed for the
//! heap top and a task queue carrying new or re-added tasks; due tasks are
//! moved onto a TODO queue feeding a worker pool. The pool size bounds the
//! concurrency of task execution and lets short tasks run without waiting
//! behind a long one.
//!
//! ```text
//!            +------------------+
//!            |  Next Task Heap  |
//!            +------------------+
//!                      ^
//!                      | task
//!                      v
//!            +------------------+
//!            |    Dispatcher    |
//!            +------------------+
//!              ^              | task
//!              | task         v
//!       +------------+ +------------+
//!       | Task Queue | | TODO Queue |
//!       +------------+ +------------+
//!           ^  ^              |
//!  new task |  |              v
//!  ---------+  +------- worker pool
//! ```
//!
//! Scheduling works off the wall clock on purpose: the emitted samples carry
//! wall-clock timestamps and the grid they land on must match. The wall
//! clock may move backwards (observed on virtualized hosts), which the
//! dispatcher counters by pushing the deadline forward interval by interval.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::generator::MetricsGenerator;

pub const SCHEDULER_MAX_NUM_WORKERS: usize = 8;

const SCHEDULER_TASK_Q_LEN: usize = 64;
const SCHEDULER_TODO_Q_LEN: usize = 64;

/// All task intervals are rounded to a multiple of the scheduler
/// granularity.
pub const SCHEDULER_GRANULARITY: Duration = Duration::from_millis(20);

/// The minimum pause between two consecutive executions of the same task.
pub const SCHEDULER_TASK_MIN_EXECUTION_PAUSE: Duration = Duration::from_millis(40);

/// The action executed by a task. Returning `false` removes the task from
/// rotation.
#[async_trait]
pub trait TaskAction: Send {
    async fn run(&mut self) -> bool;
}

struct GeneratorAction(Box<dyn MetricsGenerator>);

#[async_trait]
impl TaskAction for GeneratorAction {
    async fn run(&mut self) -> bool {
        self.0.generate().await
    }
}

/// Adapter so plain closures can be scheduled, mostly for tests.
pub struct FnAction<F: FnMut() -> bool + Send>(pub F);

#[async_trait]
impl<F: FnMut() -> bool + Send> TaskAction for FnAction<F> {
    async fn run(&mut self) -> bool {
        (self.0)()
    }
}

pub struct Task {
    id: String,
    interval: Duration,
    action: Box<dyn TaskAction>,
    // Next scheduling time:
    next_ts: SystemTime,
    // When last executed, used to protect long running tasks from being
    // scheduled back to back:
    last_executed: Option<SystemTime>,
    // Whether it was re-added by a worker or not. New tasks are scheduled
    // for execution immediately whereas re-added ones wait for their next
    // grid point:
    added_by_worker: bool,
}

impl Task {
    pub fn new(id: impl Into<String>, interval: Duration, action: Box<dyn TaskAction>) -> Self {
        Task {
            id: id.into(),
            interval,
            action,
            next_ts: UNIX_EPOCH,
            last_executed: None,
            added_by_worker: false,
        }
    }

    pub fn from_generator(generator: Box<dyn MetricsGenerator>) -> Self {
        let id = generator.id().to_string();
        let interval = generator.interval();
        Task::new(id, interval, Box::new(GeneratorAction(generator)))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

// Min-heap adapter: BinaryHeap is a max-heap, so order by reversed next_ts.
struct HeapTask(Task);

impl PartialEq for HeapTask {
    fn eq(&self, other: &Self) -> bool {
        self.0.next_ts == other.0.next_ts
    }
}

impl Eq for HeapTask {}

impl PartialOrd for HeapTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapTask {
    fn cmp(&self, other: &Self) -> Ordering {
        other.0.next_ts.cmp(&self.0.next_ts)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TaskStats {
    /// How many times the task was scheduled.
    pub scheduled_count: u64,
    /// How many times the task was delayed because it was too close to its
    /// previous execution.
    pub delayed_count: u64,
    /// How many times the task overran, i.e. its runtime >= interval.
    pub overrun_count: u64,
    /// How many times the task was executed.
    pub executed_count: u64,
    /// How many times the next scheduling time was pushed forward to counter
    /// the wall clock seemingly going backwards.
    pub deadline_hack_count: u64,
    /// Total runtime of the task, in microseconds.
    pub total_runtime_usec: u64,
    /// Set once the task's action asked to stop.
    pub disabled: bool,
}

pub type SchedulerStats = HashMap<String, TaskStats>;

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// The number of workers. -1 matches the number of available cores, in
    /// both cases capped at [`SCHEDULER_MAX_NUM_WORKERS`].
    pub num_workers: i32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig { num_workers: -1 }
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("scheduler is not accepting tasks")]
    NotAcceptingTasks,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RunState {
    Created,
    Running,
    Stopped,
}

struct SchedulerShared {
    stats: Mutex<SchedulerStats>,
    state: Mutex<RunState>,
    cancel: CancellationToken,
}

/// Round an interval to the nearest multiple of the scheduler granularity
/// (half-up), with a floor of the minimum execution pause.
pub fn compliant_task_interval(interval: Duration) -> Duration {
    let granule = SCHEDULER_GRANULARITY.as_millis() as u64;
    let millis = interval.as_millis() as u64;
    let mut compliant = millis - millis % granule;
    if millis - compliant >= granule / 2 {
        compliant += granule;
    }
    let floor = SCHEDULER_TASK_MIN_EXECUTION_PAUSE.as_millis() as u64;
    if compliant < floor {
        compliant = floor;
    }
    Duration::from_millis(compliant)
}

// The nearest future multiple of `interval` on the wall-clock grid.
fn next_grid_point(now: SystemTime, interval: Duration) -> SystemTime {
    let nanos = now
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let interval_nanos = interval.as_nanos().max(1);
    let truncated = nanos - nanos % interval_nanos;
    UNIX_EPOCH + Duration::from_nanos(truncated as u64) + interval
}

fn until(ts: SystemTime) -> Duration {
    ts.duration_since(SystemTime::now()).unwrap_or_default()
}

pub struct Scheduler {
    num_workers: usize,
    task_tx: mpsc::Sender<Task>,
    task_rx: Mutex<Option<mpsc::Receiver<Task>>>,
    todo_tx: async_channel::Sender<Task>,
    todo_rx: async_channel::Receiver<Task>,
    shared: Arc<SchedulerShared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(cfg: &SchedulerConfig) -> Self {
        let mut num_workers = if cfg.num_workers <= 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            cfg.num_workers as usize
        };
        if num_workers > SCHEDULER_MAX_NUM_WORKERS {
            num_workers = SCHEDULER_MAX_NUM_WORKERS;
        }
        info!(num_workers, "scheduler");

        let (task_tx, task_rx) = mpsc::channel(SCHEDULER_TASK_Q_LEN);
        let (todo_tx, todo_rx) = async_channel::bounded(SCHEDULER_TODO_Q_LEN);
        Scheduler {
            num_workers,
            task_tx,
            task_rx: Mutex::new(Some(task_rx)),
            todo_tx,
            todo_rx,
            shared: Arc::new(SchedulerShared {
                stats: Mutex::new(SchedulerStats::new()),
                state: Mutex::new(RunState::Created),
                cancel: CancellationToken::new(),
            }),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    /// Add a new task; its interval is rounded to the scheduler granularity
    /// first. New tasks with a sufficiently distant grid point run
    /// immediately, the rest wait for regular scheduling.
    pub async fn add_task(&self, mut task: Task) -> Result<(), SchedulerError> {
        task.added_by_worker = false;
        let compliant = compliant_task_interval(task.interval);
        if compliant != task.interval {
            warn!(
                task = %task.id,
                "interval: {:?} -> {:?}", task.interval, compliant
            );
            task.interval = compliant;
        }
        info!(task = %task.id, "add task: interval={:?}", task.interval);
        self.task_tx
            .send(task)
            .await
            .map_err(|_| SchedulerError::NotAcceptingTasks)
    }

    pub fn start(&self) {
        {
            #[allow(clippy::expect_used)]
            let mut state = self.shared.state.lock().expect("lock poisoned");
            if *state != RunState::Created {
                warn!("scheduler can only be started once, current state {state:?}");
                return;
            }
            *state = RunState::Running;
        }

        let task_rx = {
            #[allow(clippy::expect_used)]
            self.task_rx.lock().expect("lock poisoned").take()
        };
        let Some(task_rx) = task_rx else {
            return;
        };

        #[allow(clippy::expect_used)]
        let mut handles = self.handles.lock().expect("lock poisoned");
        handles.push(tokio::spawn(dispatcher_loop(
            Arc::clone(&self.shared),
            task_rx,
            self.todo_tx.clone(),
        )));
        for worker_id in 0..self.num_workers {
            handles.push(tokio::spawn(worker_loop(
                Arc::clone(&self.shared),
                self.todo_rx.clone(),
                self.task_tx.clone(),
                worker_id,
            )));
        }
        info!("scheduler started");
    }

    /// Copy the current stats into `to`.
    pub fn snap_stats(&self, to: &mut SchedulerStats) {
        #[allow(clippy::expect_used)]
        let stats = self.shared.stats.lock().expect("lock poisoned");
        for (id, task_stats) in stats.iter() {
            to.insert(id.clone(), task_stats.clone());
        }
    }

    /// Stop the dispatcher and the workers and wait for them to exit.
    /// Idempotent.
    pub async fn shutdown(&self) {
        {
            #[allow(clippy::expect_used)]
            let mut state = self.shared.state.lock().expect("lock poisoned");
            if *state == RunState::Stopped {
                warn!("scheduler already stopped");
                return;
            }
            *state = RunState::Stopped;
        }
        info!("stop scheduler");
        self.shared.cancel.cancel();
        let handles = {
            #[allow(clippy::expect_used)]
            std::mem::take(&mut *self.handles.lock().expect("lock poisoned"))
        };
        for handle in handles {
            let _ = handle.await;
        }
        info!("scheduler stopped");
    }
}

async fn dispatcher_loop(
    shared: Arc<SchedulerShared>,
    mut task_rx: mpsc::Receiver<Task>,
    todo_tx: async_channel::Sender<Task>,
) {
    info!("start dispatcher loop");

    let mut heap: BinaryHeap<HeapTask> = BinaryHeap::new();
    let mut timer: Option<(SystemTime, Pin<Box<Sleep>>)> = None;

    loop {
        if timer.is_none() {
            if let Some(head) = heap.peek() {
                let next_ts = head.0.next_ts;
                timer = Some((next_ts, Box::pin(tokio::time::sleep(until(next_ts)))));
            }
        }

        #[allow(clippy::unwrap_used)] // guarded by the branch precondition
        let dispatch = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = async { timer.as_mut().unwrap().1.as_mut().await }, if timer.is_some() => {
                timer = None;
                heap.pop().map(|entry| entry.0)
            }
            received = task_rx.recv() => {
                let Some(mut task) = received else { break };
                let now = SystemTime::now();
                // The desired next scheduling time is the nearest future
                // multiple of the interval:
                let mut next_ts = next_grid_point(now, task.interval);

                if task.added_by_worker {
                    // The wall clock may have moved backwards, leaving
                    // next_ts before the previously scheduled time; push it
                    // forward interval by interval until it no longer is.
                    let mut hack_count = 0u64;
                    while next_ts < task.next_ts {
                        next_ts += task.interval;
                        hack_count += 1;
                    }
                    // Additionally enforce the pause since the last
                    // execution, delaying the task as needed:
                    let mut delayed = false;
                    if let Some(last_executed) = task.last_executed {
                        let min_next_ts = last_executed + SCHEDULER_TASK_MIN_EXECUTION_PAUSE;
                        if next_ts < min_next_ts {
                            next_ts = min_next_ts;
                            delayed = true;
                        }
                    }

                    if hack_count > 0 || delayed {
                        #[allow(clippy::expect_used)]
                        let mut stats = shared.stats.lock().expect("lock poisoned");
                        let task_stats = stats.entry(task.id.clone()).or_default();
                        task_stats.deadline_hack_count += hack_count;
                        if delayed {
                            task_stats.delayed_count += 1;
                        }
                    }

                    task.next_ts = next_ts;
                    push_and_rearm(&mut heap, &mut timer, task);
                    None
                } else if next_ts.duration_since(now).unwrap_or_default()
                    < SCHEDULER_TASK_MIN_EXECUTION_PAUSE
                {
                    // New task whose next grid point falls too close into
                    // the near future: wait for the regular scheduling
                    // instead of running right away.
                    task.next_ts = next_ts;
                    push_and_rearm(&mut heap, &mut timer, task);
                    None
                } else {
                    // New task that can run right away; any pending timer is
                    // no longer applicable and will be re-armed off the heap
                    // top.
                    task.next_ts = now;
                    timer = None;
                    Some(task)
                }
            }
        };

        if let Some(task) = dispatch {
            {
                #[allow(clippy::expect_used)]
                let mut stats = shared.stats.lock().expect("lock poisoned");
                stats.entry(task.id.clone()).or_default().scheduled_count += 1;
            }
            if todo_tx.send(task).await.is_err() {
                break;
            }
        }
    }
    info!("dispatcher stopped");
}

fn push_and_rearm(
    heap: &mut BinaryHeap<HeapTask>,
    timer: &mut Option<(SystemTime, Pin<Box<Sleep>>)>,
    task: Task,
) {
    // Drop the armed timer if the new scheduling time is sooner than the one
    // currently pending; the loop top re-arms off the new heap head.
    if let Some((armed_ts, _)) = timer {
        if task.next_ts < *armed_ts {
            *timer = None;
        }
    }
    heap.push(HeapTask(task));
}

async fn worker_loop(
    shared: Arc<SchedulerShared>,
    todo_rx: async_channel::Receiver<Task>,
    task_tx: mpsc::Sender<Task>,
    worker_id: usize,
) {
    info!(worker_id, "start worker");
    loop {
        let mut task = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            received = todo_rx.recv() => {
                match received {
                    Ok(task) => task,
                    Err(_) => break,
                }
            }
        };

        let start = Instant::now();
        let requeue = task.action.run().await;
        let runtime = start.elapsed();
        task.last_executed = Some(SystemTime::now());

        {
            #[allow(clippy::expect_used)]
            let mut stats = shared.stats.lock().expect("lock poisoned");
            let task_stats = stats.entry(task.id.clone()).or_default();
            if runtime >= task.interval {
                task_stats.overrun_count += 1;
            }
            task_stats.executed_count += 1;
            task_stats.disabled = !requeue;
            task_stats.total_runtime_usec += runtime.as_micros() as u64;
        }

        if requeue {
            task.added_by_worker = true;
            if task_tx.send(task).await.is_err() {
                break;
            }
        }
    }
    info!(worker_id, "worker stopped");
}
