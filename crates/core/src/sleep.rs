use std::cell::{Cell, RefCell};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use rand::Rng;

/// Source of time for every polling loop. All suspension points go through `sleep`.
pub trait Clock {
    fn now(&self) -> Instant;
    fn wall(&self) -> SystemTime;
    fn sleep(&self, d: Duration);
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn wall(&self) -> SystemTime {
        SystemTime::now()
    }

    fn sleep(&self, d: Duration) {
        if !d.is_zero() {
            thread::sleep(d);
        }
    }
}

/// Virtual clock: `sleep` advances time instantly and records the requested duration.
pub struct ManualClock {
    origin: Instant,
    wall_origin: SystemTime,
    elapsed: Cell<Duration>,
    sleeps: RefCell<Vec<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            wall_origin: SystemTime::now(),
            elapsed: Cell::new(Duration::ZERO),
            sleeps: RefCell::new(Vec::new()),
        }
    }

    pub fn advance(&self, d: Duration) {
        self.elapsed.set(self.elapsed.get() + d);
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed.get()
    }

    /// Every non-zero sleep requested so far, in order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.borrow().clone()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.elapsed.get()
    }

    fn wall(&self) -> SystemTime {
        self.wall_origin + self.elapsed.get()
    }

    fn sleep(&self, d: Duration) {
        if d.is_zero() {
            return;
        }
        self.sleeps.borrow_mut().push(d);
        self.advance(d);
    }
}

/// Random wait in `[max(0, base - range), base + range]` seconds.
pub fn jitter_secs(base: u64, range: u64) -> Duration {
    let lo = base.saturating_sub(range);
    let hi = base + range;
    Duration::from_secs(rand::thread_rng().gen_range(lo..=hi))
}

pub fn ms(v: u64) -> Duration {
    Duration::from_millis(v)
}
