//! Wall-clock abstraction for the scheduler.
//!
//! Scheduling works in UTC wall-clock time so calendar intervals (months,
//! years) can be applied, but sleeping goes through tokio's timer so paused
//! test runtimes can drive it.

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use tokio::time::Instant;

/// Source of "now" plus the ability to wait for a wall-clock deadline
#[async_trait]
pub trait Clock: Send + Sync {
    /// Current UTC time
    fn now(&self) -> DateTime<Utc>;

    /// Suspend until `deadline`; returns immediately if it already passed
    async fn sleep_until(&self, deadline: DateTime<Utc>);
}

/// The system clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep_until(&self, deadline: DateTime<Utc>) {
        let remaining = (deadline - Utc::now()).to_std().unwrap_or_default();
        tokio::time::sleep(remaining).await;
    }
}

/// Wall clock derived from tokio's monotonic clock
///
/// Reads as `origin_wall` plus the tokio time elapsed since construction.
/// Under a paused runtime this makes wall-clock time advance only when the
/// runtime auto-advances, which keeps timing tests deterministic.
#[derive(Debug, Clone, Copy)]
pub struct AnchoredClock {
    origin_wall: DateTime<Utc>,
    origin: Instant,
}

impl AnchoredClock {
    /// Anchor `origin_wall` to the current tokio instant
    #[must_use]
    pub fn new(origin_wall: DateTime<Utc>) -> Self {
        Self {
            origin_wall,
            origin: Instant::now(),
        }
    }
}

#[async_trait]
impl Clock for AnchoredClock {
    fn now(&self) -> DateTime<Utc> {
        TimeDelta::from_std(self.origin.elapsed())
            .ok()
            .and_then(|elapsed| self.origin_wall.checked_add_signed(elapsed))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    async fn sleep_until(&self, deadline: DateTime<Utc>) {
        let Ok(offset) = (deadline - self.origin_wall).to_std() else {
            // Before the anchor: already in the past.
            return;
        };
        match self.origin.checked_add(offset) {
            Some(instant) => tokio::time::sleep_until(instant).await,
            None => std::future::pending().await,
        }
    }
}
