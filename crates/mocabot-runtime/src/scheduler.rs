//! Fixed-interval background tasks with overlap protection.
//!
//! # Design
//! - One timing loop per task; each tick spawns at most one run.
//! - A tick that lands while the previous run is still going is skipped, never queued.
//! - Errors and panics from a run are logged and counted; the schedule keeps going.
//! - Shutdown stops the loops and waits for in-flight runs to finish.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use mocabot_telemetry::Metrics;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Work executed on every scheduler tick.
#[async_trait]
pub trait PeriodicTask: Send + Sync + 'static {
    /// Run the task once.
    async fn run(&self) -> anyhow::Result<()>;
}

/// Execution state of a scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// No run in flight.
    Idle,
    /// A run is in flight.
    Running,
}

#[derive(Debug, Default)]
struct TaskStats {
    running: AtomicBool,
    runs: AtomicU64,
    skipped: AtomicU64,
    failures: AtomicU64,
}

/// Read-only view of one scheduled task.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    name: Arc<str>,
    stats: Arc<TaskStats>,
}

impl TaskHandle {
    /// Name the task was registered under.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether a run is in flight.
    #[must_use]
    pub fn state(&self) -> TaskState {
        if self.stats.running.load(Ordering::Acquire) {
            TaskState::Running
        } else {
            TaskState::Idle
        }
    }

    /// Completed runs, successful or not.
    #[must_use]
    pub fn runs(&self) -> u64 {
        self.stats.runs.load(Ordering::Relaxed)
    }

    /// Ticks dropped because a run was still in flight.
    #[must_use]
    pub fn skipped(&self) -> u64 {
        self.stats.skipped.load(Ordering::Relaxed)
    }

    /// Runs that returned an error or panicked.
    #[must_use]
    pub fn failures(&self) -> u64 {
        self.stats.failures.load(Ordering::Relaxed)
    }
}

/// Owner of the periodic timing loops.
pub struct Scheduler {
    shutdown: watch::Sender<bool>,
    loops: Vec<JoinHandle<()>>,
    tasks: Vec<TaskHandle>,
    metrics: Option<Metrics>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    /// Scheduler without metrics.
    #[must_use]
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shutdown,
            loops: Vec::new(),
            tasks: Vec::new(),
            metrics: None,
        }
    }

    /// Scheduler that reports skipped ticks and failed runs to `metrics`.
    #[must_use]
    pub fn with_metrics(metrics: Metrics) -> Self {
        Self {
            metrics: Some(metrics),
            ..Self::new()
        }
    }

    /// Run `task` every `interval`, starting one interval from now.
    ///
    /// Must be called from within a tokio runtime. Intervals shorter than one
    /// millisecond are rounded up.
    pub fn add_periodic(
        &mut self,
        name: &str,
        interval: Duration,
        task: Arc<dyn PeriodicTask>,
    ) -> TaskHandle {
        let interval = interval.max(MIN_INTERVAL);
        let handle = TaskHandle {
            name: Arc::from(name),
            stats: Arc::new(TaskStats::default()),
        };
        let driver = TaskDriver {
            handle: handle.clone(),
            task,
            metrics: self.metrics.clone(),
        };
        let shutdown = self.shutdown.subscribe();
        self.loops.push(tokio::spawn(driver.drive(interval, shutdown)));
        self.tasks.push(handle.clone());
        info!(task = %name, interval_ms = interval.as_millis(), "periodic task scheduled");
        handle
    }

    /// Handles for every scheduled task, in registration order.
    #[must_use]
    pub fn tasks(&self) -> &[TaskHandle] {
        &self.tasks
    }

    /// Handle for the task registered as `name`.
    #[must_use]
    pub fn task(&self, name: &str) -> Option<&TaskHandle> {
        self.tasks.iter().find(|handle| handle.name() == name)
    }

    /// Stop scheduling, let in-flight runs finish, and join every loop.
    pub async fn shutdown(self) {
        if self.shutdown.send(true).is_err() {
            debug!("scheduler loops already stopped");
        }
        for timing_loop in self.loops {
            if let Err(err) = timing_loop.await {
                warn!(error = %err, "scheduler loop join failed");
            }
        }
        info!(tasks = self.tasks.len(), "scheduler stopped");
    }
}

struct TaskDriver {
    handle: TaskHandle,
    task: Arc<dyn PeriodicTask>,
    metrics: Option<Metrics>,
}

impl TaskDriver {
    async fn drive(self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut in_flight: Option<JoinHandle<()>> = None;

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if self.handle.stats.running.swap(true, Ordering::AcqRel) {
                        self.handle.stats.skipped.fetch_add(1, Ordering::Relaxed);
                        if let Some(metrics) = &self.metrics {
                            metrics.inc_scheduler_tick_skipped(self.handle.name());
                        }
                        debug!(task = %self.handle.name, "tick skipped; previous run still in flight");
                        continue;
                    }
                    in_flight = Some(tokio::spawn(run_once(
                        self.handle.clone(),
                        Arc::clone(&self.task),
                        self.metrics.clone(),
                    )));
                }
            }
        }

        if let Some(run) = in_flight
            && let Err(err) = run.await
        {
            warn!(task = %self.handle.name, error = %err, "in-flight run join failed");
        }
        debug!(task = %self.handle.name, "timing loop stopped");
    }
}

async fn run_once(handle: TaskHandle, task: Arc<dyn PeriodicTask>, metrics: Option<Metrics>) {
    let outcome = AssertUnwindSafe(task.run()).catch_unwind().await;
    handle.stats.runs.fetch_add(1, Ordering::Relaxed);

    let failed = match outcome {
        Ok(Ok(())) => false,
        Ok(Err(err)) => {
            warn!(task = %handle.name, error = %err, "periodic task failed");
            true
        }
        Err(_) => {
            error!(task = %handle.name, "periodic task panicked");
            true
        }
    };
    if failed {
        handle.stats.failures.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = &metrics {
            metrics.inc_scheduler_task_failure(handle.name());
        }
    }
    handle.stats.running.store(false, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct SlowTask {
        delay: Duration,
        active: AtomicUsize,
        max_active: AtomicUsize,
        completed: AtomicUsize,
    }

    #[async_trait]
    impl PeriodicTask for SlowTask {
        async fn run(&self) -> anyhow::Result<()> {
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);
            time::sleep(self.delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            self.completed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingTask;

    #[async_trait]
    impl PeriodicTask for FailingTask {
        async fn run(&self) -> anyhow::Result<()> {
            Err(anyhow::anyhow!("store unavailable"))
        }
    }

    struct PanickingTask(bool);

    #[async_trait]
    impl PeriodicTask for PanickingTask {
        async fn run(&self) -> anyhow::Result<()> {
            assert!(!self.0, "sweep exploded");
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_ticks_are_skipped() -> anyhow::Result<()> {
        let metrics = Metrics::new()?;
        let mut scheduler = Scheduler::with_metrics(metrics.clone());
        let task = Arc::new(SlowTask {
            delay: Duration::from_millis(250),
            ..SlowTask::default()
        });
        let handle = scheduler.add_periodic("slow", Duration::from_millis(100), task.clone());

        time::sleep(Duration::from_millis(1_050)).await;

        assert_eq!(task.max_active.load(Ordering::SeqCst), 1);
        assert!(handle.runs() >= 2);
        assert!(handle.skipped() >= 2);
        assert_eq!(metrics.scheduler_ticks_skipped("slow"), handle.skipped());
        scheduler.shutdown().await;
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn failing_runs_do_not_stop_the_schedule() {
        let mut scheduler = Scheduler::new();
        let every = Duration::from_millis(100);
        let failing = scheduler.add_periodic("failing", every, Arc::new(FailingTask));
        let panicking = scheduler.add_periodic("panicking", every, Arc::new(PanickingTask(true)));

        time::sleep(Duration::from_millis(350)).await;

        assert!(failing.failures() >= 2);
        assert_eq!(failing.failures(), failing.runs());
        assert!(panicking.failures() >= 2);
        assert_eq!(panicking.state(), TaskState::Idle);
        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_waits_for_in_flight_run() {
        let mut scheduler = Scheduler::new();
        let task = Arc::new(SlowTask {
            delay: Duration::from_millis(500),
            ..SlowTask::default()
        });
        let handle = scheduler.add_periodic("slow", Duration::from_millis(100), task.clone());

        time::sleep(Duration::from_millis(150)).await;
        assert_eq!(handle.state(), TaskState::Running);

        scheduler.shutdown().await;
        assert_eq!(task.completed.load(Ordering::SeqCst), 1);
        assert_eq!(handle.state(), TaskState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn tasks_are_listed_by_name() {
        let mut scheduler = Scheduler::new();
        scheduler.add_periodic("store-reload", Duration::from_secs(1), Arc::new(FailingTask));
        scheduler.add_periodic("dos-detect", Duration::from_secs(5), Arc::new(FailingTask));

        let names: Vec<&str> = scheduler.tasks().iter().map(TaskHandle::name).collect();
        assert_eq!(names, vec!["store-reload", "dos-detect"]);
        assert!(scheduler.task("dos-detect").is_some());
        assert!(scheduler.task("missing").is_none());
        scheduler.shutdown().await;
    }
}
