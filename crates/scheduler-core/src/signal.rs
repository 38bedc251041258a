//! Wake signaling between the scheduler loop and whoever mutates the
//! store (spec.md §4.I). A newly-stored trigger that fires sooner than
//! whatever the loop is currently sleeping for must wake it early.

use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};

struct SignalState {
    /// Earliest fire time the loop believes it needs to wake up for.
    next_wakeup: Option<DateTime<Utc>>,
    shutdown: bool,
}

/// Condition-variable wake mechanism, mirroring the teacher's
/// `agentor-cli::config_watcher` debounce thread's use of a blocking
/// channel, but for scheduler wakeups instead of file events.
pub struct Signaler {
    state: Mutex<SignalState>,
    condvar: Condvar,
}

impl Default for Signaler {
    fn default() -> Self {
        Self::new()
    }
}

impl Signaler {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SignalState {
                next_wakeup: None,
                shutdown: false,
            }),
            condvar: Condvar::new(),
        }
    }

    /// Record what the loop is about to sleep until, then block until
    /// either that time is reached, shutdown is requested, or a signal
    /// claims an earlier trigger is now due.
    pub fn wait_until(&self, deadline: Option<DateTime<Utc>>) {
        let mut state = self.state.lock();
        state.next_wakeup = deadline;
        loop {
            if state.shutdown {
                return;
            }
            let now = Utc::now();
            let sleep_for = match state.next_wakeup {
                Some(t) if t <= now => return,
                Some(t) => (t - now).to_std().unwrap_or(Duration::ZERO),
                None => Duration::from_secs(3600),
            };
            let timed_out = self.condvar.wait_for(&mut state, sleep_for).timed_out();
            if timed_out || state.shutdown {
                return;
            }
            // Spurious wake or a signal with a later candidate: loop and
            // re-check against the (possibly updated) next_wakeup.
        }
    }

    /// Notify the loop that a trigger earlier than its current sleep
    /// target may now be due (called after storing/resuming a trigger).
    pub fn signal_earlier_trigger(&self, candidate: DateTime<Utc>) {
        let mut state = self.state.lock();
        let should_wake = match state.next_wakeup {
            Some(current) => candidate < current,
            None => true,
        };
        if should_wake {
            state.next_wakeup = Some(candidate);
            self.condvar.notify_all();
        }
    }

    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        state.shutdown = true;
        self.condvar.notify_all();
    }

    pub fn is_shutdown(&self) -> bool {
        self.state.lock().shutdown
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_shutdown_wakes_waiter() {
        let signaler = Arc::new(Signaler::new());
        let waiter = signaler.clone();
        let handle = thread::spawn(move || {
            waiter.wait_until(None);
        });
        thread::sleep(Duration::from_millis(20));
        signaler.shutdown();
        handle.join().unwrap();
        assert!(signaler.is_shutdown());
    }

    #[test]
    fn test_signal_earlier_trigger_wakes_before_deadline() {
        let signaler = Arc::new(Signaler::new());
        let waiter = signaler.clone();
        let far_future = Utc::now() + chrono::Duration::hours(1);
        let handle = thread::spawn(move || {
            waiter.wait_until(Some(far_future));
        });
        thread::sleep(Duration::from_millis(20));
        signaler.signal_earlier_trigger(Utc::now());
        handle.join().unwrap();
    }
}
