//! Pause gate for the worker loops.
//!
//! A closed gate parks the worker on a condition variable; opening it wakes
//! the worker immediately. Waits are bounded so a parked worker still sees
//! the running flag drop during `stop()`.

use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

#[derive(Default)]
pub struct PauseGate {
    paused: Mutex<bool>,
    cv: Condvar,
}

impl PauseGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Close the gate. Returns `false` if it was already closed.
    pub fn close(&self) -> bool {
        let mut paused = self.paused.lock().unwrap_or_else(PoisonError::into_inner);
        !std::mem::replace(&mut *paused, true)
    }

    /// Open the gate and wake waiters. Returns `false` if it was already open.
    pub fn open(&self) -> bool {
        let mut paused = self.paused.lock().unwrap_or_else(PoisonError::into_inner);
        let was_paused = std::mem::replace(&mut *paused, false);
        self.cv.notify_all();
        was_paused
    }

    pub fn is_open(&self) -> bool {
        !*self.paused.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait up to `timeout` for the gate to be open. Returns whether it is.
    pub fn wait_open(&self, timeout: Duration) -> bool {
        let paused = self.paused.lock().unwrap_or_else(PoisonError::into_inner);
        let (paused, _) = self
            .cv
            .wait_timeout_while(paused, timeout, |p| *p)
            .unwrap_or_else(PoisonError::into_inner);
        !*paused
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn open_gate_passes_immediately() {
        let gate = PauseGate::new();
        assert!(gate.is_open());
        assert!(gate.wait_open(Duration::from_millis(1)));
    }

    #[test]
    fn closed_gate_times_out() {
        let gate = PauseGate::new();
        assert!(gate.close());
        assert!(!gate.close());
        assert!(!gate.wait_open(Duration::from_millis(20)));
    }

    #[test]
    fn open_wakes_waiter() {
        let gate = Arc::new(PauseGate::new());
        gate.close();

        let waiter = {
            let gate = Arc::clone(&gate);
            std::thread::spawn(move || {
                let start = Instant::now();
                let open = gate.wait_open(Duration::from_secs(5));
                (open, start.elapsed())
            })
        };

        std::thread::sleep(Duration::from_millis(50));
        assert!(gate.open());
        let (open, waited) = waiter.join().unwrap();
        assert!(open);
        assert!(waited < Duration::from_secs(5));
    }
}
