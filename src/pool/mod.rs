//! # Deadline Pool
//!
//! A fixed set of workers over a single deadline-sorted task queue. Each
//! task is a named reconciliation function returning its next deadline;
//! returning `None` retires the task. `trigger` re-deadlines a queued task
//! to now, or flags an executing task to run once more the moment it
//! finishes.
//!
//! A task is in exactly one of three states: waiting (in the queue and the
//! registry), executing (registry only) or retired (neither). All shared
//! state sits behind one mutex; task functions run outside it. Sleepers are
//! woken through a single watch channel bumped on every queue change, so an
//! arbitrary number of workers wake at once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Idle sleep when the queue is empty.
const IDLE_SLEEP: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("no task named {0:?}")]
    NoTask(String),
}

/// A schedulable reconciliation task.
#[async_trait]
pub trait Task: Send + 'static {
    /// Run one pass and return the next deadline; `None` retires the task.
    async fn run(&mut self) -> Option<Instant>;
}

enum Registered {
    Waiting(Box<dyn Task>),
    Executing { rerun: bool },
}

#[derive(Default)]
struct State {
    /// Sorted ascending by deadline at all times.
    queue: Vec<Queued>,
    reg: HashMap<String, Registered>,
}

struct Queued {
    name: String,
    deadline: Instant,
}

impl State {
    fn sort(&mut self) {
        self.queue.sort_by_key(|q| q.deadline);
    }
}

/// Deadline-ordered pool of `workers` concurrent task runners.
pub struct Pool {
    state: Arc<Mutex<State>>,
    wake_tx: watch::Sender<u64>,
    shutdown_tx: watch::Sender<bool>,
    workers: usize,
}

impl Pool {
    pub fn new(workers: usize) -> Self {
        let (wake_tx, _) = watch::channel(0);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            state: Arc::new(Mutex::new(State::default())),
            wake_tx,
            shutdown_tx,
            workers: workers.max(1),
        }
    }

    /// Register a task and queue it for `deadline`.
    pub fn add(&self, name: impl Into<String>, task: Box<dyn Task>, deadline: Instant) {
        let name = name.into();
        let mut state = self.state.lock().expect("pool mutex poisoned");
        state.reg.insert(name.clone(), Registered::Waiting(task));
        state.queue.retain(|q| q.name != name);
        state.queue.push(Queued { name, deadline });
        state.sort();
        drop(state);
        self.wake();
    }

    /// Make a task run as soon as possible: a queued task's deadline drops
    /// to now; an executing task runs exactly once more after it returns.
    pub fn trigger(&self, name: &str) -> Result<(), PoolError> {
        let mut state = self.state.lock().expect("pool mutex poisoned");
        match state.reg.get_mut(name) {
            None => return Err(PoolError::NoTask(name.to_string())),
            Some(Registered::Executing { rerun }) => {
                *rerun = true;
                return Ok(());
            }
            Some(Registered::Waiting(_)) => {}
        }
        let now = Instant::now();
        for queued in &mut state.queue {
            if queued.name == name {
                queued.deadline = now;
            }
        }
        state.sort();
        drop(state);
        self.wake();
        Ok(())
    }

    /// Whether a task is registered (waiting or executing).
    pub fn contains(&self, name: &str) -> bool {
        self.state
            .lock()
            .expect("pool mutex poisoned")
            .reg
            .contains_key(name)
    }

    /// True when nothing is waiting or executing.
    pub fn is_idle(&self) -> bool {
        self.state.lock().expect("pool mutex poisoned").reg.is_empty()
    }

    /// Spawn the worker loops.
    pub fn run(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        (0..self.workers)
            .map(|i| {
                let pool = Arc::clone(self);
                tokio::spawn(async move { pool.worker_loop(i).await })
            })
            .collect()
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    fn wake(&self) {
        self.wake_tx.send_modify(|v| *v += 1);
    }

    async fn worker_loop(&self, worker: usize) {
        let mut wake_rx = self.wake_tx.subscribe();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            if *shutdown_rx.borrow() {
                debug!(worker, "pool worker stopping");
                return;
            }
            // Mark the wake signal seen before inspecting the queue: any
            // enqueue after this point makes changed() fire immediately,
            // closing the missed-wakeup window.
            wake_rx.borrow_and_update();

            let action = self.next_action();
            match action {
                Action::Run(name, task) => {
                    self.execute(name, task).await;
                }
                Action::Sleep(duration) => {
                    tokio::select! {
                        _ = tokio::time::sleep(duration) => {}
                        _ = wake_rx.changed() => {}
                        _ = shutdown_rx.changed() => {}
                    }
                }
            }
        }
    }

    fn next_action(&self) -> Action {
        let mut state = self.state.lock().expect("pool mutex poisoned");
        let now = Instant::now();
        let Some(head) = state.queue.first() else {
            return Action::Sleep(IDLE_SLEEP);
        };
        if head.deadline > now {
            return Action::Sleep(head.deadline - now);
        }
        let queued = state.queue.remove(0);
        match state.reg.insert(
            queued.name.clone(),
            Registered::Executing { rerun: false },
        ) {
            Some(Registered::Waiting(task)) => Action::Run(queued.name, task),
            other => {
                // A stale queue entry for a task that was re-added or
                // retired concurrently; put the registry back and move on.
                warn!(name = %queued.name, "stale queue entry");
                match other {
                    Some(entry) => {
                        state.reg.insert(queued.name, entry);
                    }
                    None => {
                        state.reg.remove(&queued.name);
                    }
                }
                Action::Sleep(Duration::ZERO)
            }
        }
    }

    /// Run `task` outside the lock, then re-enqueue or retire it.
    async fn execute(&self, name: String, mut task: Box<dyn Task>) {
        let next_deadline = task.run().await;

        let mut state = self.state.lock().expect("pool mutex poisoned");
        // The task was replaced under our feet (re-added while executing);
        // the newer registration wins.
        let Some(Registered::Executing { rerun }) = state.reg.get(&name) else {
            drop(state);
            self.wake();
            return;
        };
        // A trigger received while executing forces an immediate re-run,
        // regardless of what the task returned.
        let deadline = if *rerun {
            Some(Instant::now())
        } else {
            next_deadline
        };
        match deadline {
            None => {
                state.reg.remove(&name);
                debug!(name = %name, "task retired");
            }
            Some(deadline) => {
                state.reg.insert(name.clone(), Registered::Waiting(task));
                state.queue.push(Queued { name, deadline });
                state.sort();
            }
        }
        drop(state);
        self.wake();
    }
}

enum Action {
    Run(String, Box<dyn Task>),
    Sleep(Duration),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Recorder {
        id: usize,
        log: Arc<Mutex<Vec<usize>>>,
        runs: Arc<AtomicUsize>,
        next: Option<Duration>,
        delay: Duration,
    }

    #[async_trait]
    impl Task for Recorder {
        async fn run(&mut self) -> Option<Instant> {
            tokio::time::sleep(self.delay).await;
            self.log.lock().unwrap().push(self.id);
            self.runs.fetch_add(1, Ordering::SeqCst);
            self.next.map(|d| Instant::now() + d)
        }
    }

    fn recorder(
        id: usize,
        log: &Arc<Mutex<Vec<usize>>>,
        runs: &Arc<AtomicUsize>,
        next: Option<Duration>,
        delay: Duration,
    ) -> Box<dyn Task> {
        Box::new(Recorder {
            id,
            log: log.clone(),
            runs: runs.clone(),
            next,
            delay,
        })
    }

    #[tokio::test]
    async fn test_single_worker_runs_in_deadline_order() {
        let pool = Arc::new(Pool::new(1));
        let log = Arc::new(Mutex::new(Vec::new()));
        let runs = Arc::new(AtomicUsize::new(0));
        let now = Instant::now();

        // Added out of order; deadlines d1 < d2 < d3.
        pool.add(
            "t3",
            recorder(3, &log, &runs, None, Duration::ZERO),
            now + Duration::from_millis(90),
        );
        pool.add(
            "t1",
            recorder(1, &log, &runs, None, Duration::ZERO),
            now + Duration::from_millis(30),
        );
        pool.add(
            "t2",
            recorder(2, &log, &runs, None, Duration::ZERO),
            now + Duration::from_millis(60),
        );

        let handles = pool.run();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(*log.lock().unwrap(), vec![1, 2, 3]);
        assert!(pool.is_idle());
        pool.shutdown();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_trigger_queued_task_runs_promptly() {
        let pool = Arc::new(Pool::new(1));
        let log = Arc::new(Mutex::new(Vec::new()));
        let runs = Arc::new(AtomicUsize::new(0));

        pool.add(
            "t",
            recorder(1, &log, &runs, None, Duration::ZERO),
            Instant::now() + Duration::from_secs(3600),
        );
        let _handles = pool.run();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        pool.trigger("t").unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        pool.shutdown();
    }

    #[tokio::test]
    async fn test_trigger_while_running_causes_one_more_run() {
        let pool = Arc::new(Pool::new(2));
        let log = Arc::new(Mutex::new(Vec::new()));
        let runs = Arc::new(AtomicUsize::new(0));

        // fn sleeps 100ms and schedules itself 1s out.
        pool.add(
            "t",
            recorder(
                1,
                &log,
                &runs,
                Some(Duration::from_secs(1)),
                Duration::from_millis(100),
            ),
            Instant::now(),
        );
        let _handles = pool.run();

        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.trigger("t").unwrap();

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        pool.shutdown();
    }

    #[tokio::test]
    async fn test_trigger_unknown_task_errors() {
        let pool = Pool::new(1);
        assert_eq!(
            pool.trigger("ghost"),
            Err(PoolError::NoTask("ghost".to_string()))
        );
    }

    #[tokio::test]
    async fn test_retirement_removes_task() {
        let pool = Arc::new(Pool::new(1));
        let log = Arc::new(Mutex::new(Vec::new()));
        let runs = Arc::new(AtomicUsize::new(0));

        pool.add(
            "once",
            recorder(1, &log, &runs, None, Duration::ZERO),
            Instant::now(),
        );
        let _handles = pool.run();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!pool.contains("once"));
        assert_eq!(
            pool.trigger("once"),
            Err(PoolError::NoTask("once".to_string()))
        );
        pool.shutdown();
    }
}
