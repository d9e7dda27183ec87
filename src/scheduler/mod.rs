//! Periodic background tasks on plain timer threads.
//!
//! Every registered task gets its own thread that waits out the task's
//! interval on a shared condition variable, so shutdown interrupts a sleep
//! immediately instead of waiting for the next tick.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::{Error, Result};

/// Context provided to background tasks during execution.
pub struct Context {
    pub task_name: &'static str,
    pub run_id: u64,
}

/// Trait for background tasks that run periodically.
pub trait BackgroundTask: Send + Sync {
    /// Task name for logging.
    fn name(&self) -> &'static str;

    /// How often to run this task.
    fn interval(&self) -> Duration;

    /// Execute the task.
    fn execute(&self, ctx: Context) -> Result<()>;
}

#[derive(Default)]
struct Shutdown {
    stop: Mutex<bool>,
    signal: Condvar,
}

/// Scheduler managing timer threads with graceful shutdown.
pub struct Scheduler {
    handles: Mutex<Vec<JoinHandle<()>>>,
    shutdown: Arc<Shutdown>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            handles: Mutex::new(Vec::new()),
            shutdown: Arc::new(Shutdown::default()),
        }
    }

    /// Registers a periodic background task.
    pub fn register<T: BackgroundTask + 'static>(&self, task: Arc<T>) -> &Self {
        let handle = self.spawn_timer_loop(task);
        self.handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
        self
    }

    fn spawn_timer_loop<T: BackgroundTask + 'static>(&self, task: Arc<T>) -> JoinHandle<()> {
        let shutdown = Arc::clone(&self.shutdown);
        std::thread::spawn(move || {
            let interval = task.interval();
            let mut run_id = 0u64;
            loop {
                let stopped = shutdown.stop.lock().unwrap_or_else(|e| e.into_inner());
                if *stopped {
                    break;
                }
                let (stopped, wait) = shutdown
                    .signal
                    .wait_timeout(stopped, interval)
                    .unwrap_or_else(|e| e.into_inner());
                if *stopped {
                    tracing::debug!(task = task.name(), "task shutting down");
                    break;
                }
                if !wait.timed_out() {
                    continue; // spurious wakeup
                }
                drop(stopped);

                run_id += 1;
                let ctx = Context {
                    task_name: task.name(),
                    run_id,
                };
                if let Err(e) = task.execute(ctx) {
                    tracing::error!(task = task.name(), error = %e, "task execution failed");
                }
            }
        })
    }

    /// Graceful shutdown: signal every task thread and wait for it.
    pub fn shutdown(&self) -> Result<()> {
        *self.shutdown.stop.lock()? = true;
        self.shutdown.signal.notify_all();
        for handle in self.handles.lock()?.drain(..) {
            handle
                .join()
                .map_err(|_| Error::IO("task thread panicked".to_string()))?;
        }
        Ok(())
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct TestTask {
        interval: Duration,
        counter: Arc<AtomicUsize>,
    }

    impl BackgroundTask for TestTask {
        fn name(&self) -> &'static str {
            "test-task"
        }

        fn interval(&self) -> Duration {
            self.interval
        }

        fn execute(&self, _ctx: Context) -> Result<()> {
            self.counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_scheduler_runs_tasks() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));

        scheduler.register(Arc::new(TestTask {
            interval: Duration::from_millis(10),
            counter: counter.clone(),
        }));

        std::thread::sleep(Duration::from_millis(80));
        assert!(counter.load(Ordering::SeqCst) > 0);
        scheduler.shutdown().unwrap();
    }

    #[test]
    fn test_scheduler_graceful_shutdown() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));

        scheduler.register(Arc::new(TestTask {
            // Longer than the test: only shutdown can end the wait.
            interval: Duration::from_secs(60),
            counter: counter.clone(),
        }));

        let start = std::time::Instant::now();
        scheduler.shutdown().unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_shutdown_stops_further_runs() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));

        scheduler.register(Arc::new(TestTask {
            interval: Duration::from_millis(5),
            counter: counter.clone(),
        }));

        std::thread::sleep(Duration::from_millis(40));
        scheduler.shutdown().unwrap();

        let frozen = counter.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(counter.load(Ordering::SeqCst), frozen);
    }
}
