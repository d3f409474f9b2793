//! Injectable time source
//!
//! Every date-threshold decision in the billing core reads "now" through
//! this trait so tests can pin the clock deterministically.

use time::OffsetDateTime;

/// Source of the current time
pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

/// Wall-clock implementation used by the binaries
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}
