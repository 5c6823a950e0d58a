//! Loop Transport for Orbitone
//!
//! Keeps one registration per looping entity and hands out the repetitions
//! that fall inside the lookahead window. The scheduler never touches the
//! audio graph itself; the engine turns due ticks into voice events.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;

use super::AudioEngine;
use crate::music::{Interval, MIN_INTERVAL_SECONDS};
use crate::platform::AudioPlatform;

/// Most repetitions of one loop handed out by a single [`LoopScheduler::due`]
/// call; the rest follow on later calls
pub const MAX_TICKS_PER_LOOP: usize = 16;

/// Identifier of one loop registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct LoopHandle(u64);

impl fmt::Display for LoopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "loop-{}", self.0)
    }
}

/// An active loop
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoopRegistration {
    pub handle: LoopHandle,
    /// Clock time of the first repetition, in seconds
    pub start_time: f64,
    /// Length of one repetition at the tempo the loop started with
    pub duration_seconds: f64,
    /// Clock time of the next repetition not yet handed out
    pub next_tick: f64,
    pub interval: Interval,
}

impl LoopRegistration {
    /// Fraction of the current repetition that has elapsed, in `[0, 1)`
    pub fn progress(&self, now: f64) -> f64 {
        if !(self.duration_seconds > 0.0) || now <= self.start_time {
            return 0.0;
        }
        let fraction = (now - self.start_time).rem_euclid(self.duration_seconds) / self.duration_seconds;
        // rem_euclid may round up to the divisor
        if fraction >= 1.0 {
            0.0
        } else {
            fraction
        }
    }
}

/// A loop repetition that should be scheduled now
#[derive(Debug, Clone, PartialEq)]
pub struct DueTick {
    pub entity_id: String,
    pub at: f64,
    pub duration_seconds: f64,
}

/// Table of active loops
///
/// # Example
/// ```
/// use orbitone::engine::LoopScheduler;
/// use orbitone::music::Interval;
///
/// let scheduler = LoopScheduler::new();
/// scheduler.start("l1", Interval::ONE_MEASURE, 0.0, 120.0);
/// assert!(scheduler.is_active("l1"));
/// assert_eq!(scheduler.progress("l1", 1.0), 0.5);
/// ```
#[derive(Debug, Default)]
pub struct LoopScheduler {
    loops: Mutex<HashMap<String, LoopRegistration>>,
    next_handle: AtomicU64,
}

impl LoopScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a loop for `entity_id` starting at `start_time`
    ///
    /// Idempotent: an entity that already loops keeps its registration.
    /// Repetitions shorter than [`MIN_INTERVAL_SECONDS`] (tiny absolute
    /// intervals or extreme tempos) are stretched to that length.
    /// Returns the handle and whether a new registration was made.
    pub fn start(
        &self,
        entity_id: &str,
        interval: Interval,
        start_time: f64,
        bpm: f64,
    ) -> (LoopHandle, bool) {
        let mut loops = self.loops.lock();
        if let Some(existing) = loops.get(entity_id) {
            tracing::debug!(entity_id, handle = %existing.handle, "loop already running");
            return (existing.handle, false);
        }

        let handle = LoopHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let requested = interval.to_seconds(bpm);
        let duration_seconds = if requested >= MIN_INTERVAL_SECONDS {
            requested
        } else {
            tracing::warn!(
                entity_id,
                interval = %interval,
                requested,
                "loop interval too short; using the minimum"
            );
            MIN_INTERVAL_SECONDS
        };
        loops.insert(
            entity_id.to_string(),
            LoopRegistration {
                handle,
                start_time,
                duration_seconds,
                next_tick: start_time,
                interval,
            },
        );
        tracing::debug!(entity_id, handle = %handle, interval = %interval, duration_seconds, "loop started");
        (handle, true)
    }

    /// Cancel the loop of `entity_id`; returns whether one existed
    pub fn stop(&self, entity_id: &str) -> bool {
        let removed = self.loops.lock().remove(entity_id);
        if let Some(registration) = &removed {
            tracing::debug!(entity_id, handle = %registration.handle, "loop stopped");
        }
        removed.is_some()
    }

    /// Progress of the current repetition, 0 when the entity does not loop
    pub fn progress(&self, entity_id: &str, now: f64) -> f64 {
        self.loops
            .lock()
            .get(entity_id)
            .map_or(0.0, |registration| registration.progress(now))
    }

    pub fn is_active(&self, entity_id: &str) -> bool {
        self.loops.lock().contains_key(entity_id)
    }

    pub fn registration(&self, entity_id: &str) -> Option<LoopRegistration> {
        self.loops.lock().get(entity_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.loops.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.loops.lock().is_empty()
    }

    /// Hand out every repetition starting before `now + lookahead`
    ///
    /// Each repetition is handed out once. Repetitions already in the past
    /// are skipped rather than played late, keeping the loop on its grid.
    /// At most [`MAX_TICKS_PER_LOOP`] repetitions per loop are returned.
    pub fn due(&self, now: f64, lookahead: f64) -> Vec<DueTick> {
        let horizon = now + lookahead;
        let mut due = Vec::new();
        let mut loops = self.loops.lock();
        for (entity_id, registration) in loops.iter_mut() {
            let duration = registration.duration_seconds;
            if !(duration > 0.0) {
                continue;
            }
            if registration.next_tick < now {
                let missed = ((now - registration.next_tick) / duration).ceil();
                registration.next_tick += missed * duration;
            }
            let mut handed_out = 0;
            while registration.next_tick <= horizon && handed_out < MAX_TICKS_PER_LOOP {
                handed_out += 1;
                due.push(DueTick {
                    entity_id: entity_id.clone(),
                    at: registration.next_tick,
                    duration_seconds: duration,
                });
                registration.next_tick += duration;
            }
        }
        due.sort_by(|a, b| a.at.total_cmp(&b.at));
        due
    }

    /// Drop every registration
    pub fn clear(&self) {
        self.loops.lock().clear();
    }
}

// ============================================================================
// Background Transport
// ============================================================================

/// Run [`AudioEngine::tick`] every `period` on the current tokio runtime
///
/// The task stops once the engine has been shut down. Abort the returned
/// handle to stop it earlier.
pub fn spawn_transport<P>(engine: Arc<AudioEngine<P>>, period: Duration) -> JoinHandle<()>
where
    P: AudioPlatform + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            if engine.is_shut_down() {
                tracing::debug!(engine_id = %engine.id(), "transport stopping");
                break;
            }
            engine.tick();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    // ------------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------------

    #[test]
    fn test_start_is_idempotent() {
        let scheduler = LoopScheduler::new();
        let (first, created) = scheduler.start("l1", Interval::ONE_MEASURE, 0.0, 120.0);
        assert!(created);
        let (second, created) = scheduler.start("l1", Interval::EIGHTH, 5.0, 60.0);
        assert!(!created);
        assert_eq!(first, second);
        assert_eq!(scheduler.len(), 1);

        let registration = scheduler.registration("l1").unwrap();
        assert_eq!(registration.start_time, 0.0);
        assert_eq!(registration.duration_seconds, 2.0);
    }

    #[test]
    fn test_stop_is_safe_when_absent() {
        let scheduler = LoopScheduler::new();
        assert!(!scheduler.stop("missing"));
        scheduler.start("l1", Interval::ONE_MEASURE, 0.0, 120.0);
        assert!(scheduler.stop("l1"));
        assert!(!scheduler.is_active("l1"));
        assert_eq!(scheduler.progress("l1", 3.0), 0.0);
    }

    #[test]
    fn test_restart_gets_new_handle() {
        let scheduler = LoopScheduler::new();
        let (first, _) = scheduler.start("l1", Interval::ONE_MEASURE, 0.0, 120.0);
        scheduler.stop("l1");
        let (second, created) = scheduler.start("l1", Interval::ONE_MEASURE, 1.0, 120.0);
        assert!(created);
        assert_ne!(first, second);
    }

    // ------------------------------------------------------------------------
    // Progress
    // ------------------------------------------------------------------------

    #[test]
    fn test_progress_wraps() {
        let scheduler = LoopScheduler::new();
        scheduler.start("l1", Interval::ONE_MEASURE, 1.0, 120.0);
        assert_eq!(scheduler.progress("l1", 0.5), 0.0);
        assert_eq!(scheduler.progress("l1", 1.0), 0.0);
        assert_relative_eq!(scheduler.progress("l1", 1.5), 0.25);
        assert_relative_eq!(scheduler.progress("l1", 2.5), 0.75);
        assert_relative_eq!(scheduler.progress("l1", 3.5), 0.25);
    }

    #[test]
    fn test_progress_stays_in_range() {
        let scheduler = LoopScheduler::new();
        scheduler.start("l1", Interval::Seconds(0.3), 0.0, 120.0);
        let mut previous = 0.0;
        for step in 0..200 {
            let now = step as f64 * 0.01;
            let progress = scheduler.progress("l1", now);
            assert!((0.0..1.0).contains(&progress), "progress {progress} at {now}");
            // weakly increasing except at wraparound
            assert!(progress >= previous || previous - progress > 0.5);
            previous = progress;
        }
    }

    // ------------------------------------------------------------------------
    // Lookahead
    // ------------------------------------------------------------------------

    #[test]
    fn test_due_hands_out_each_tick_once() {
        let scheduler = LoopScheduler::new();
        scheduler.start("l1", Interval::Seconds(0.5), 0.0, 120.0);

        let due = scheduler.due(0.0, 0.1);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].at, 0.0);
        assert!(scheduler.due(0.05, 0.1).is_empty());

        let due = scheduler.due(0.45, 0.1);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].at, 0.5);
        assert_eq!(due[0].entity_id, "l1");
    }

    #[test]
    fn test_due_skips_missed_ticks() {
        let scheduler = LoopScheduler::new();
        scheduler.start("l1", Interval::Seconds(0.5), 0.0, 120.0);
        scheduler.due(0.0, 0.1);

        let due = scheduler.due(2.2, 0.1);
        assert!(due.is_empty());
        let due = scheduler.due(2.45, 0.1);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].at, 2.5);
    }

    #[test]
    fn test_tiny_interval_is_stretched() {
        let scheduler = LoopScheduler::new();
        scheduler.start("l1", Interval::Seconds(1e-9), 0.0, 120.0);
        let registration = scheduler.registration("l1").unwrap();
        assert_eq!(registration.duration_seconds, MIN_INTERVAL_SECONDS);

        // Extreme tempo on a short subdivision hits the same floor
        let sixty_fourth: Interval = "64t".parse().unwrap();
        scheduler.start("l2", sixty_fourth, 0.0, 1.0e9);
        assert_eq!(
            scheduler.registration("l2").unwrap().duration_seconds,
            MIN_INTERVAL_SECONDS
        );
    }

    #[test]
    fn test_due_is_bounded_per_loop() {
        let scheduler = LoopScheduler::new();
        scheduler.start("l1", Interval::Seconds(MIN_INTERVAL_SECONDS), 0.0, 120.0);
        let due = scheduler.due(0.0, 10.0);
        assert_eq!(due.len(), MAX_TICKS_PER_LOOP);

        // The remainder comes on the next call, still in order
        let next = scheduler.due(0.0, 10.0);
        assert_eq!(next.len(), MAX_TICKS_PER_LOOP);
        assert!(next[0].at > due[MAX_TICKS_PER_LOOP - 1].at);
    }

    #[test]
    fn test_due_is_sorted_across_loops() {
        let scheduler = LoopScheduler::new();
        scheduler.start("late", Interval::Seconds(1.0), 0.05, 120.0);
        scheduler.start("early", Interval::Seconds(1.0), 0.01, 120.0);
        let due = scheduler.due(0.0, 0.1);
        let order: Vec<&str> = due.iter().map(|t| t.entity_id.as_str()).collect();
        assert_eq!(order, vec!["early", "late"]);
    }
}
