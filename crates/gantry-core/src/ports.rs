//! Port traits (hexagonal architecture).
//!
//! These traits define what the scheduling core needs from its surroundings.

use crate::material::BuildCause;
use crate::Result;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

/// Source of timestamps for run records.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Looks up the build cause of a historical pipeline run.
///
/// Used to walk fetch-task ancestry one hop at a time.
pub trait UpstreamPipelineResolver: Send + Sync {
    fn build_cause_for(&self, pipeline_name: &str, pipeline_counter: u32) -> Result<BuildCause>;
}
