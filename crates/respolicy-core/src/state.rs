//! Internal pipeline clock.

use std::time::Instant;

/// Monotonic clock shared by the pipeline and all event producers.
///
/// Times are reported as seconds since pipeline start, which keeps log
/// prefixes and event deadlines compact and comparable.
#[derive(Clone, Copy)]
pub(crate) struct Clock {
    start: Instant,
}

impl Clock {
    pub(crate) fn new() -> Self {
        Self { start: Instant::now() }
    }

    pub(crate) fn time(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}
