//! Injected time source.
//!
//! Heartbeat and reconnect behaviour depend only on monotonic nanos, so the
//! session takes a [`Clock`] rather than reading system time. Tests drive a
//! [`ManualClock`] to make liveness deterministic.

use std::time::{SystemTime, UNIX_EPOCH};

/// Time source for the messaging core.
pub trait Clock {
    /// Monotonic nanoseconds. Only differences are meaningful.
    fn mono_nanos(&self) -> u64;

    /// Wall-clock nanoseconds since the Unix epoch, for SendingTime fields.
    fn wall_nanos(&self) -> i64;
}

/// Production clock backed by the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn mono_nanos(&self) -> u64 {
        use std::sync::OnceLock;
        use std::time::Instant;
        static ORIGIN: OnceLock<Instant> = OnceLock::new();
        let origin = *ORIGIN.get_or_init(Instant::now);
        origin.elapsed().as_nanos() as u64
    }

    fn wall_nanos(&self) -> i64 {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(d) => d.as_nanos() as i64,
            Err(_) => 0,
        }
    }
}

/// Hand-advanced clock for tests. Clones share the same state, so a test
/// can keep one handle while the session under test owns another.
#[derive(Debug, Default, Clone)]
pub struct ManualClock {
    shared: std::rc::Rc<ManualClockState>,
}

#[derive(Debug, Default)]
struct ManualClockState {
    mono: std::cell::Cell<u64>,
    wall: std::cell::Cell<i64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts the wall clock at `nanos` since the Unix epoch.
    pub fn with_wall_nanos(nanos: i64) -> Self {
        let clock = Self::new();
        clock.shared.wall.set(nanos);
        clock
    }

    /// Advances both clocks by `nanos`.
    pub fn advance(&self, nanos: u64) {
        self.shared.mono.set(self.shared.mono.get() + nanos);
        self.shared.wall.set(self.shared.wall.get() + nanos as i64);
    }

    pub fn advance_secs(&self, secs: u64) {
        self.advance(secs * 1_000_000_000);
    }
}

impl Clock for ManualClock {
    fn mono_nanos(&self) -> u64 {
        self.shared.mono.get()
    }

    fn wall_nanos(&self) -> i64 {
        self.shared.wall.get()
    }
}
