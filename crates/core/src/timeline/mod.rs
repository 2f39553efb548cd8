//! Timing primitives shared by the long-running loops.
//!
//! Every sleep that paces a loop goes through a [`Clock`] and observes a
//! [`Shutdown`] signal, so production code waits in real time while tests
//! drive a [`VirtualClock`] through a fixed number of cycles.

use std::{
    fmt,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use tracing::{debug, error, warn};

use crate::Result;

/// Process-wide stop signal. Cloning shares the same underlying flag.
#[derive(Clone, Default)]
pub struct Shutdown {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Shutdown {
    /// Creates an untriggered signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Flags the signal and wakes every waiter.
    pub fn trigger(&self) {
        let (flag, cvar) = &*self.inner;
        *self.flag(flag) = true;
        cvar.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        let (flag, _) = &*self.inner;
        *self.flag(flag)
    }

    /// Blocks for up to `timeout`. Returns `true` if shutdown was triggered
    /// before or during the wait. A timeout past the end of the clock waits
    /// for the trigger alone.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (flag, cvar) = &*self.inner;
        let deadline = Instant::now().checked_add(timeout);
        let mut stopped = self.flag(flag);

        while !*stopped {
            stopped = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    cvar.wait_timeout(stopped, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => cvar.wait(stopped).unwrap_or_else(PoisonError::into_inner),
            };
        }

        true
    }

    // A poisoned flag still holds a valid bool.
    fn flag<'a>(&self, flag: &'a Mutex<bool>) -> MutexGuard<'a, bool> {
        flag.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Shutdown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shutdown")
            .field("triggered", &self.is_triggered())
            .finish()
    }
}

/// Source of pacing sleeps.
pub trait Clock: Send + Sync {
    /// Sleeps for `duration` unless `shutdown` fires first. Returns `false`
    /// when the caller should stop.
    fn sleep(&self, duration: Duration, shutdown: &Shutdown) -> bool;
}

/// Wall-clock implementation backed by the shutdown condvar.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn sleep(&self, duration: Duration, shutdown: &Shutdown) -> bool {
        !shutdown.wait_timeout(duration)
    }
}

/// Deterministic clock: sleeps return immediately and are recorded.
///
/// With a budget, the clock triggers shutdown once that many sleeps have been
/// recorded, which lets a test run an exact number of loop iterations.
#[derive(Debug, Default)]
pub struct VirtualClock {
    state: Mutex<VirtualState>,
}

#[derive(Debug, Default)]
struct VirtualState {
    elapsed: Duration,
    sleeps: Vec<Duration>,
    budget: Option<usize>,
}

impl VirtualClock {
    /// Creates a clock without a budget.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a clock that triggers shutdown after `sleeps` sleeps.
    pub fn with_budget(sleeps: usize) -> Self {
        Self {
            state: Mutex::new(VirtualState {
                budget: Some(sleeps),
                ..Default::default()
            }),
        }
    }

    /// Total virtual time slept so far.
    pub fn elapsed(&self) -> Duration {
        self.state().elapsed
    }

    /// Every duration requested so far, in call order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.state().sleeps.clone()
    }

    fn state(&self) -> MutexGuard<'_, VirtualState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Clock for VirtualClock {
    fn sleep(&self, duration: Duration, shutdown: &Shutdown) -> bool {
        if shutdown.is_triggered() {
            return false;
        }

        let mut state = self.state();
        state.elapsed = state.elapsed.saturating_add(duration);
        state.sleeps.push(duration);
        if state.budget.is_some_and(|budget| state.sleeps.len() >= budget) {
            shutdown.trigger();
        }
        true
    }
}

/// Owns the worker threads of a session and their shared stop signal.
#[derive(Debug, Default)]
pub struct Scheduler {
    shutdown: Shutdown,
    tasks: Vec<(String, JoinHandle<()>)>,
}

impl Scheduler {
    /// Creates a scheduler with no tasks and an untriggered signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the stop signal shared by every task.
    pub fn shutdown(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Number of tasks spawned and not yet joined.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Spawns a named thread that receives the shared stop signal.
    pub fn spawn<F>(&mut self, name: &str, task: F) -> Result<()>
    where
        F: FnOnce(Shutdown) + Send + 'static,
    {
        let shutdown = self.shutdown.clone();
        let task_name = name.to_string();
        let handle = thread::Builder::new().name(name.to_string()).spawn(move || {
            debug!(task = %task_name, "task started");
            task(shutdown);
            debug!(task = %task_name, "task stopped");
        })?;

        self.tasks.push((name.to_string(), handle));
        Ok(())
    }

    /// Spawns a task that runs `task` once per `period` until shutdown. A
    /// failing iteration is logged and the cadence is kept.
    pub fn spawn_periodic<F>(
        &mut self,
        name: &str,
        period: Duration,
        clock: Arc<dyn Clock>,
        mut task: F,
    ) -> Result<()>
    where
        F: FnMut() -> Result<()> + Send + 'static,
    {
        let task_name = name.to_string();
        self.spawn(name, move |shutdown| {
            while !shutdown.is_triggered() {
                if let Err(err) = task() {
                    warn!(task = %task_name, %err, "periodic task failed");
                }
                if !clock.sleep(period, &shutdown) {
                    break;
                }
            }
        })
    }

    /// Signals every task to stop and waits for them.
    pub fn stop(&mut self) {
        self.shutdown.trigger();
        self.join();
    }

    /// Waits for every task without signalling them.
    pub fn join(&mut self) {
        for (name, handle) in self.tasks.drain(..) {
            if handle.join().is_err() {
                error!(task = %name, "task panicked");
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if !self.tasks.is_empty() {
            self.stop();
        }
    }
}
