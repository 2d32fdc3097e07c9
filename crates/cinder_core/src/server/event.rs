use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Manual reset event used to park OS threads.
///
/// Once set, every waiter returns until the event is reset.
#[derive(Debug, Default)]
pub struct WaitEvent {
    is_set: Mutex<bool>,
    cond: Condvar,
}

impl WaitEvent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        let mut is_set = self.is_set.lock();
        *is_set = true;
        self.cond.notify_all();
    }

    pub fn reset(&self) {
        *self.is_set.lock() = false;
    }

    pub fn is_set(&self) -> bool {
        *self.is_set.lock()
    }

    pub fn wait(&self) {
        let mut is_set = self.is_set.lock();
        while !*is_set {
            self.cond.wait(&mut is_set);
        }
    }

    /// Returns true if the event was set before the timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut is_set = self.is_set.lock();
        if !*is_set {
            let _ = self
                .cond
                .wait_while_for(&mut is_set, |is_set| !*is_set, timeout);
        }
        *is_set
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn set_before_wait() {
        let event = WaitEvent::new();
        event.set();
        event.wait();
        assert!(event.is_set());

        event.reset();
        assert!(!event.wait_timeout(Duration::from_millis(1)));
    }

    #[test]
    fn wakes_waiter() {
        let event = Arc::new(WaitEvent::new());
        let handle = thread::spawn({
            let event = event.clone();
            move || event.wait()
        });

        event.set();
        handle.join().unwrap();
    }
}
