//! Wall-clock time source injected at configuration time.
//!
//! The tracer reads the wall clock once per trace, then derives every later
//! timestamp from a monotonic tick base (see `recorder::TickClock`), so this
//! trait only needs to answer "what time is it now" in epoch microseconds.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Microsecond-resolution time source.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Epoch microseconds.
    fn current_time_micros(&self) -> u64;
}

/// The default clock, backed by [`SystemTime`].
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn current_time_micros(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_micros() as u64)
            .unwrap_or(0)
    }
}
