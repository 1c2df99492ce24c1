//! Shutdown signalling and periodic background workers.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::types::{PenumbraError, Result};

/// Cancellation token shared by every background worker of a replica.
///
/// Cloning is cheap; triggering any clone wakes every waiter.
#[derive(Clone, Default)]
pub struct Shutdown {
    inner: Arc<ShutdownInner>,
}

#[derive(Default)]
struct ShutdownInner {
    triggered: Mutex<bool>,
    wakeup: Condvar,
}

impl Shutdown {
    /// Creates an untriggered token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Signals every holder to stop.
    pub fn trigger(&self) {
        let mut triggered = self.inner.triggered.lock();
        *triggered = true;
        self.inner.wakeup.notify_all();
    }

    /// Whether [`Shutdown::trigger`] has been called.
    pub fn is_triggered(&self) -> bool {
        *self.inner.triggered.lock()
    }

    /// Fails with `Cancelled` once triggered. Workers call this right before
    /// their final commit so a cancelled cycle writes nothing.
    pub fn check(&self) -> Result<()> {
        if self.is_triggered() {
            return Err(PenumbraError::Cancelled);
        }
        Ok(())
    }

    /// Sleeps up to `timeout`. Returns true if the token fired.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut triggered = self.inner.triggered.lock();
        while !*triggered {
            if self
                .inner
                .wakeup
                .wait_until(&mut triggered, deadline)
                .timed_out()
            {
                break;
            }
        }
        *triggered
    }
}

/// Timing of one periodic worker.
#[derive(Clone, Copy, Debug)]
pub struct IntervalSchedule {
    /// Wait before the first run.
    pub delay: Duration,
    /// Wait between runs.
    pub interval: Duration,
}

impl IntervalSchedule {
    /// First run after one interval.
    pub fn every(interval: Duration) -> Self {
        Self {
            delay: interval,
            interval,
        }
    }

    /// First run after `delay`, then every `interval`.
    pub fn delayed(delay: Duration, interval: Duration) -> Self {
        Self { delay, interval }
    }
}

/// Runs `task` on its own thread until `shutdown` fires.
///
/// Task errors are logged and the worker keeps its schedule, except `Closed`
/// and `Cancelled`, which end the loop.
pub fn spawn_interval<F>(
    name: &'static str,
    schedule: IntervalSchedule,
    shutdown: Shutdown,
    mut task: F,
) -> Result<JoinHandle<()>>
where
    F: FnMut(&Shutdown) -> Result<()> + Send + 'static,
{
    let handle = thread::Builder::new()
        .name(format!("penumbra-{name}"))
        .spawn(move || {
            let mut wait = schedule.delay;
            loop {
                if shutdown.wait_timeout(wait) {
                    break;
                }
                match task(&shutdown) {
                    Ok(()) => debug!(process = name, "process.interval.ran"),
                    Err(PenumbraError::Closed) | Err(PenumbraError::Cancelled) => break,
                    Err(err) => warn!(process = name, error = %err, "process.interval.failed"),
                }
                wait = schedule.interval;
            }
            debug!(process = name, "process.interval.exit");
        })?;
    Ok(handle)
}
