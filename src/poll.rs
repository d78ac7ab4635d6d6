//! Bounded waiting for game state that's initialised on another thread

use std::thread;
use std::time::Duration;

use log::debug;

/// Something that can pause the calling thread
pub trait Sleeper {
    /// Blocks for roughly `duration`
    fn sleep(&self, duration: Duration);
}

/// Sleeps for real
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// Retry schedule: at most `attempts` probes, `interval` apart
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Poll {
    /// Number of probes
    attempts: u32,
    /// Pause between probes
    interval: Duration,
}

impl Poll {
    /// Schedule of `attempts` probes, `interval` apart
    pub const fn new(attempts: u32, interval: Duration) -> Self {
        Self { attempts, interval }
    }

    /// Runs `probe` until it returns a value or the attempts run out.
    ///
    /// There's no sleep before the first probe or after the last one.
    pub fn until<T, S, F>(&self, sleeper: &S, mut probe: F) -> Option<T>
    where
        S: Sleeper + ?Sized,
        F: FnMut() -> Option<T>,
    {
        for attempt in 1..=self.attempts {
            if let Some(value) = probe() {
                return Some(value);
            }
            if attempt < self.attempts {
                debug!("not ready yet, retrying in {:?} ({attempt}/{})", self.interval, self.attempts);
                sleeper.sleep(self.interval);
            }
        }
        None
    }
}
