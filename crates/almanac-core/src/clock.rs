use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};

/// Injected timestamp source.
///
/// Commit and logbook times come from a `Clock` handle rather than a global,
/// so tests can produce deterministic values.
#[derive(Clone)]
pub struct Clock(Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>);

impl Clock {
    /// The system clock.
    pub fn system() -> Self {
        Self(Arc::new(Utc::now))
    }

    /// Always returns `at`.
    pub fn fixed(at: DateTime<Utc>) -> Self {
        Self(Arc::new(move || at))
    }

    /// Starts at `start` and advances `step_seconds` on every read, so
    /// consecutive commits get distinct, ordered timestamps in tests.
    pub fn ticking(start: DateTime<Utc>, step_seconds: i64) -> Self {
        let base = start.timestamp();
        let ticks = AtomicI64::new(0);
        Self(Arc::new(move || {
            let n = ticks.fetch_add(1, Ordering::SeqCst);
            Utc.timestamp_opt(base + n * step_seconds, 0)
                .single()
                .unwrap_or(start)
        }))
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.0)()
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::system()
    }
}
