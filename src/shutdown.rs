//! Cooperative cancellation shared by the accept loop and background workers

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct Inner {
    triggered: Mutex<bool>,
    cond: Condvar,
}

/// Cloneable stop flag that sleeping workers can wait on.
#[derive(Clone, Default)]
pub struct ShutdownSignal {
    inner: Arc<Inner>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        let mut triggered = self.inner.triggered.lock();
        *triggered = true;
        self.inner.cond.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        *self.inner.triggered.lock()
    }

    /// Sleep for up to `timeout`, waking early on trigger. Returns whether
    /// the signal has been triggered.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut triggered = self.inner.triggered.lock();
        if !*triggered {
            self.inner.cond.wait_for(&mut triggered, timeout);
        }
        *triggered
    }

    /// Block until triggered
    pub fn wait(&self) {
        let mut triggered = self.inner.triggered.lock();
        while !*triggered {
            self.inner.cond.wait(&mut triggered);
        }
    }
}

impl std::fmt::Debug for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownSignal")
            .field("triggered", &self.is_triggered())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn wait_times_out_when_untriggered() {
        let s = ShutdownSignal::new();
        assert!(!s.wait_timeout(Duration::from_millis(10)));
        assert!(!s.is_triggered());
    }

    #[test]
    fn trigger_wakes_sleepers_early() {
        let s = ShutdownSignal::new();
        let waiter = {
            let s = s.clone();
            thread::spawn(move || {
                let start = Instant::now();
                let woke = s.wait_timeout(Duration::from_secs(30));
                (woke, start.elapsed())
            })
        };
        thread::sleep(Duration::from_millis(20));
        s.trigger();
        let (woke, elapsed) = waiter.join().unwrap();
        assert!(woke);
        assert!(elapsed < Duration::from_secs(10));
        s.wait();
    }
}
