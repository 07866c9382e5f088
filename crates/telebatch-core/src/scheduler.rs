//! One-shot flush timers, one per device.
//!
//! A timer is a tokio task that sleeps for the batch interval and then runs
//! its callback. The owner must call [`FlushTimers::clear_fired`] from the
//! callback before requesting the flush, so that a reading submitted during
//! the flush can arm a fresh timer. Generations keep a late callback from
//! clearing a timer that was armed after it.

use std::collections::HashMap;
use std::time::Duration;

use tokio::task::AbortHandle;
use tracing::trace;

#[derive(Debug)]
struct TimerEntry {
    generation: u64,
    abort: AbortHandle,
}

/// Armed flush timers keyed by device id.
#[derive(Debug, Default)]
pub struct FlushTimers {
    timers: HashMap<String, TimerEntry>,
    next_generation: u64,
}

impl FlushTimers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_armed(&self, device_id: &str) -> bool {
        self.timers.contains_key(device_id)
    }

    #[must_use]
    pub fn armed_count(&self) -> usize {
        self.timers.len()
    }

    /// Arm a timer for `device_id` unless one is already armed.
    ///
    /// Returns the generation of the new timer, or `None` when the device
    /// already had one. Must be called from within a tokio runtime.
    pub fn arm<F>(&mut self, device_id: &str, delay: Duration, fire: F) -> Option<u64>
    where
        F: FnOnce(u64) + Send + 'static,
    {
        if self.is_armed(device_id) {
            return None;
        }

        self.next_generation += 1;
        let generation = self.next_generation;
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            fire(generation);
        });

        trace!(device_id, generation, delay_ms = delay.as_millis() as u64, "flush timer armed");
        self.timers.insert(
            device_id.to_string(),
            TimerEntry {
                generation,
                abort: task.abort_handle(),
            },
        );
        Some(generation)
    }

    /// Forget the timer that just fired. Returns false for a stale generation.
    pub fn clear_fired(&mut self, device_id: &str, generation: u64) -> bool {
        match self.timers.get(device_id) {
            Some(entry) if entry.generation == generation => {
                self.timers.remove(device_id);
                true
            }
            _ => false,
        }
    }

    /// Abort every armed timer. Returns how many were cancelled.
    pub fn cancel_all(&mut self) -> usize {
        let cancelled = self.timers.len();
        for (_, entry) in self.timers.drain() {
            entry.abort.abort();
        }
        cancelled
    }
}

impl Drop for FlushTimers {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
