use parking_lot::Mutex;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

/// Fires a [`ShutdownSignal`] for every clone at once.
pub struct ShutdownTrigger {
    flag: Arc<AtomicBool>,
    // Dropping the sender disconnects every waiting receiver.
    sender: Mutex<Option<flume::Sender<()>>>,
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.sender.lock().take();
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Cloneable view of a shutdown request, usable from blocking workers.
#[derive(Clone)]
pub struct ShutdownSignal {
    flag: Arc<AtomicBool>,
    waker: flume::Receiver<()>,
}

impl ShutdownSignal {
    pub fn pair() -> (ShutdownTrigger, ShutdownSignal) {
        let flag = Arc::new(AtomicBool::new(false));
        let (sender, waker) = flume::bounded(1);
        (
            ShutdownTrigger {
                flag: Arc::clone(&flag),
                sender: Mutex::new(Some(sender)),
            },
            ShutdownSignal { flag, waker },
        )
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Sleep for `interval` or until shutdown; returns true on shutdown.
    pub fn wait(&self, interval: Duration) -> bool {
        match self.waker.recv_timeout(interval) {
            Err(flume::RecvTimeoutError::Timeout) => self.is_triggered(),
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_wait_times_out_without_trigger() {
        let (_trigger, signal) = ShutdownSignal::pair();
        assert!(!signal.wait(Duration::from_millis(20)));
        assert!(!signal.is_triggered());
    }

    #[test]
    fn test_trigger_wakes_all_clones() {
        let (trigger, signal) = ShutdownSignal::pair();
        let other = signal.clone();
        let waiter = std::thread::spawn(move || {
            let start = Instant::now();
            let stopped = other.wait(Duration::from_secs(10));
            (stopped, start.elapsed())
        });
        std::thread::sleep(Duration::from_millis(20));
        trigger.trigger();

        let (stopped, elapsed) = waiter.join().unwrap();
        assert!(stopped);
        assert!(elapsed < Duration::from_secs(5));
        assert!(signal.wait(Duration::from_secs(10)));
        assert!(trigger.is_triggered());
    }
}
