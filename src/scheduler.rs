use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::Result;

/// Context provided to background tasks during execution
pub struct Context {
    pub task_name: &'static str,
    pub run_id: u64,
    stop: Arc<StopSignal>,
}

impl Context {
    /// Long-running executions poll this to bail out early on shutdown.
    pub fn is_shutdown(&self) -> bool {
        self.stop.is_stopped()
    }
}

/// Trait for background tasks that run periodically
pub trait BackgroundTask: Send + Sync {
    /// Task name for logging
    fn name(&self) -> &'static str;

    /// How often to run this task. Queried before every run, so a task may
    /// adapt its own cadence.
    fn interval(&self) -> Duration;

    /// Execute the task
    fn execute(&self, ctx: Context) -> Result<()>;
}

struct StopSignal {
    stopped: Mutex<bool>,
    cv: Condvar,
    flag: AtomicBool,
}

impl StopSignal {
    fn new() -> Self {
        Self {
            stopped: Mutex::new(false),
            cv: Condvar::new(),
            flag: AtomicBool::new(false),
        }
    }

    /// Sleep up to `dur`, returning true if shutdown was signalled.
    fn wait(&self, dur: Duration) -> bool {
        let guard = self.stopped.lock().unwrap();
        if *guard {
            return true;
        }
        let (guard, _) = self.cv.wait_timeout(guard, dur).unwrap();
        *guard
    }

    fn is_stopped(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    fn trigger(&self) {
        self.flag.store(true, Ordering::Release);
        let mut guard = self.stopped.lock().unwrap();
        *guard = true;
        self.cv.notify_all();
    }
}

/// Scheduler manages background tasks with graceful shutdown. Each task
/// gets its own OS thread running a timer loop.
pub struct Scheduler {
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stop: Arc<StopSignal>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(Vec::new()),
            stop: Arc::new(StopSignal::new()),
        }
    }

    /// Register a periodic background task
    pub fn register<T: BackgroundTask + 'static>(&self, task: Arc<T>) -> &Self {
        let handle = self.spawn_timer_loop(task);
        self.tasks.lock().unwrap().push(handle);
        self
    }

    fn spawn_timer_loop<T: BackgroundTask + 'static>(&self, task: Arc<T>) -> JoinHandle<()> {
        let stop = self.stop.clone();
        let mut run_id = 0u64;

        std::thread::Builder::new()
            .name(format!("ember-{}", task.name()))
            .spawn(move || loop {
                if stop.wait(task.interval()) {
                    tracing::info!(task = task.name(), "task shutting down");
                    break;
                }

                run_id += 1;
                let ctx = Context {
                    task_name: task.name(),
                    run_id,
                    stop: stop.clone(),
                };

                if let Err(e) = task.execute(ctx) {
                    tracing::error!(task = task.name(), error = %e, "task execution failed");
                }
            })
            .expect("failed to spawn background task thread")
    }

    /// Graceful shutdown - signal and join all tasks
    pub fn shutdown(&self) {
        self.stop.trigger();
        for task in self.tasks.lock().unwrap().drain(..) {
            let _ = task.join();
        }
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
        name: &'static str,
        interval: Duration,
        counter: Arc<AtomicUsize>,
    }

    impl BackgroundTask for TestTask {
        fn name(&self) -> &'static str {
            self.name
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
    fn test_scheduler_basic() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));

        scheduler.register(Arc::new(TestTask {
            name: "test-task",
            interval: Duration::from_millis(5),
            counter: counter.clone(),
        }));

        std::thread::sleep(Duration::from_millis(60));
        assert!(counter.load(Ordering::SeqCst) > 0);

        scheduler.shutdown();
    }

    #[test]
    fn test_scheduler_graceful_shutdown() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));

        scheduler.register(Arc::new(TestTask {
            name: "test-task",
            interval: Duration::from_millis(5),
            counter: counter.clone(),
        }));

        std::thread::sleep(Duration::from_millis(30));
        scheduler.shutdown();

        let after_shutdown = counter.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(after_shutdown, counter.load(Ordering::SeqCst));
    }
}
