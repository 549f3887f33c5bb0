// Control signal cell shared between the controller and a job's worker
use crate::models::ControlSignal;
use parking_lot::{Condvar, Mutex};
use std::time::Duration;

/// Holds at most one unconsumed signal. A new signal overwrites the pending
/// one, so only the latest intent survives until the worker's next
/// checkpoint.
pub struct ControlCell {
    pending: Mutex<Option<ControlSignal>>,
    wake: Condvar,
}

impl ControlCell {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(None),
            wake: Condvar::new(),
        }
    }

    /// Never blocks beyond the lock
    pub fn submit(&self, signal: ControlSignal) {
        let mut pending = self.pending.lock();
        *pending = Some(signal);
        self.wake.notify_all();
    }

    pub fn peek(&self) -> Option<ControlSignal> {
        *self.pending.lock()
    }

    /// Consumes the pending signal
    pub fn take(&self) -> Option<ControlSignal> {
        self.pending.lock().take()
    }

    /// Consumes the pending signal unless it is `keep`
    pub fn take_unless(&self, keep: ControlSignal) -> Option<ControlSignal> {
        let mut pending = self.pending.lock();
        if *pending == Some(keep) {
            return None;
        }
        pending.take()
    }

    /// Waits up to `timeout` for a signal and consumes it
    pub fn wait_take(&self, timeout: Duration) -> Option<ControlSignal> {
        let mut pending = self.pending.lock();
        if pending.is_none() {
            self.wake.wait_for(&mut pending, timeout);
        }
        pending.take()
    }

    pub fn clear(&self) {
        self.pending.lock().take();
    }
}

impl Default for ControlCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_later_signal_overwrites_earlier() {
        let cell = ControlCell::new();
        cell.submit(ControlSignal::Pause);
        cell.submit(ControlSignal::Cancel);
        assert_eq!(cell.take(), Some(ControlSignal::Cancel));
        assert_eq!(cell.take(), None);
    }

    #[test]
    fn test_take_unless_leaves_kept_signal_pending() {
        let cell = ControlCell::new();
        cell.submit(ControlSignal::Pause);
        assert_eq!(cell.take_unless(ControlSignal::Pause), None);
        assert_eq!(cell.peek(), Some(ControlSignal::Pause));

        cell.submit(ControlSignal::Cancel);
        assert_eq!(cell.take_unless(ControlSignal::Pause), Some(ControlSignal::Cancel));
        assert_eq!(cell.peek(), None);
    }

    #[test]
    fn test_wait_take_times_out_without_signal() {
        let cell = ControlCell::new();
        let started = Instant::now();
        assert_eq!(cell.wait_take(Duration::from_millis(30)), None);
        assert!(started.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn test_wait_take_wakes_on_submit() {
        let cell = Arc::new(ControlCell::new());
        let submitter = cell.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            submitter.submit(ControlSignal::Resume);
        });

        let mut received = None;
        for _ in 0..50 {
            received = cell.wait_take(Duration::from_millis(100));
            if received.is_some() {
                break;
            }
        }
        handle.join().unwrap();
        assert_eq!(received, Some(ControlSignal::Resume));
    }
}
