// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Scheduler timing scenarios: several tasks with different intervals run
//! concurrently and their observed execution cadence is checked against the
//! configured intervals.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use vmi_core::scheduler::{FnAction, Scheduler, SchedulerConfig, SchedulerStats, Task};

#[derive(Clone)]
struct ExecutionLog {
    timestamps: Arc<Mutex<Vec<Instant>>>,
}

impl ExecutionLog {
    fn new() -> Self {
        ExecutionLog {
            timestamps: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn record(&self) {
        self.timestamps.lock().unwrap().push(Instant::now());
    }

    fn intervals(&self) -> Vec<Duration> {
        let timestamps = self.timestamps.lock().unwrap();
        timestamps
            .windows(2)
            .map(|pair| pair[1] - pair[0])
            .collect()
    }

    fn len(&self) -> usize {
        self.timestamps.lock().unwrap().len()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_five_tasks_with_different_intervals() {
    let interval_ms: [u64; 5] = [400, 700, 300, 500, 100];
    let run_for = Duration::from_millis(4_300);
    let tolerance = 0.2;

    let scheduler = Scheduler::new(&SchedulerConfig { num_workers: 5 });
    scheduler.start();

    let mut logs = Vec::new();
    for (task_num, &ms) in interval_ms.iter().enumerate() {
        let log = ExecutionLog::new();
        logs.push(log.clone());
        let action = FnAction(move || {
            log.record();
            true
        });
        scheduler
            .add_task(Task::new(
                format!("task_{task_num}"),
                Duration::from_millis(ms),
                Box::new(action),
            ))
            .await
            .unwrap();
    }

    tokio::time::sleep(run_for).await;
    scheduler.shutdown().await;
    let mut stats = SchedulerStats::new();
    scheduler.snap_stats(&mut stats);

    for (task_num, &ms) in interval_ms.iter().enumerate() {
        let interval = Duration::from_millis(ms);
        let log = &logs[task_num];
        let executions = log.len();

        // Roughly run_for / interval executions, allowing for the startup
        // alignment to the interval grid:
        let expected = run_for.as_millis() as u64 / ms;
        assert!(
            (executions as i64 - expected as i64).abs() <= 2,
            "task_{task_num}: {executions} executions, expected ~{expected}"
        );

        // Measured cadence settles onto the interval; skip the first two
        // intervals which may straddle the initial grid alignment.
        let lo = interval.mul_f64(1. - tolerance);
        let hi = interval.mul_f64(1. + tolerance);
        for (i, gap) in log.intervals().iter().enumerate().skip(2) {
            assert!(
                *gap >= lo && *gap <= hi,
                "task_{task_num} interval#{i}: {gap:?} outside [{lo:?}, {hi:?}]"
            );
        }

        // Idle tasks must not be counted as overrunning or delayed:
        let task_stats = &stats[&format!("task_{task_num}")];
        assert_eq!(task_stats.overrun_count, 0, "task_{task_num} overruns");
        assert_eq!(task_stats.delayed_count, 0, "task_{task_num} delays");
        assert_eq!(task_stats.executed_count, executions as u64);
        assert!(task_stats.scheduled_count >= task_stats.executed_count);
        assert!(!task_stats.disabled);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_overrunning_task_is_counted_and_delayed() {
    let scheduler = Scheduler::new(&SchedulerConfig { num_workers: 1 });
    scheduler.start();

    let log = ExecutionLog::new();
    let action_log = log.clone();
    scheduler
        .add_task(Task::new(
            "slow",
            Duration::from_millis(40),
            Box::new(FnAction(move || {
                action_log.record();
                std::thread::sleep(Duration::from_millis(60));
                true
            })),
        ))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(600)).await;
    scheduler.shutdown().await;
    let mut stats = SchedulerStats::new();
    scheduler.snap_stats(&mut stats);

    let task_stats = &stats["slow"];
    assert!(task_stats.executed_count >= 3);
    // Every execution runs past the interval:
    assert_eq!(task_stats.overrun_count, task_stats.executed_count);
    // Back-to-back protection kicks in: each rescheduling lands inside the
    // minimum pause after the previous execution.
    assert!(task_stats.delayed_count >= 1);
    assert!(task_stats.total_runtime_usec >= 60_000 * task_stats.executed_count);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_interval_rounding_applied_on_add() {
    let scheduler = Scheduler::new(&SchedulerConfig { num_workers: 1 });
    scheduler.start();

    // 47ms rounds to 40ms; the observed cadence follows the rounded value.
    let log = ExecutionLog::new();
    let action_log = log.clone();
    scheduler
        .add_task(Task::new(
            "rounded",
            Duration::from_millis(47),
            Box::new(FnAction(move || {
                action_log.record();
                true
            })),
        ))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    scheduler.shutdown().await;

    let intervals = log.intervals();
    assert!(intervals.len() >= 4);
    for gap in intervals.iter().skip(2) {
        assert!(
            *gap >= Duration::from_millis(30) && *gap <= Duration::from_millis(50),
            "cadence {gap:?} does not follow the rounded 40ms interval"
        );
    }
}
