//! Dispatch priority function (`SPEC_FULL.md` §4.4).
//!
//! Pure: given a task, the current time, and the tunable thresholds,
//! compute a single `f64` score. Higher sorts first. Exposed as a named
//! function rather than a trait -- the spec calls out that an alternate
//! scoring policy may replace this later without touching the Scheduler,
//! and a free function is the simplest thing that can be swapped.

use chrono::{DateTime, Utc};
use optd_db::models::{StepName, Task, TaskStatus};
use optd_db::thresholds::Thresholds;

/// Score a task for dispatch ordering.
///
/// `best_distance` is the parent's best-known metric distance when
/// `task` is a `fine_tune` step continuing that lineage; `None` for an
/// `optimize` task or a `fine_tune` task with no recorded metric yet.
pub fn score(task: &Task, now: DateTime<Utc>, thresholds: &Thresholds, best_distance: Option<f64>) -> f64 {
    let base = task.priority;
    let age_min = age_minutes(task, now);
    let aging = thresholds.aging_factor * age_min;

    if matches!(task.status, TaskStatus::Retrying) {
        let exponent = task.attempt_count.max(1) as i32;
        return base * 2f64.powi(exponent) + aging;
    }

    if matches!(task.step_name, StepName::FineTune) {
        if let Some(distance) = best_distance {
            return (1000.0 - (distance * 100.0).floor()) + aging;
        }
    }

    base + aging
}

fn age_minutes(task: &Task, now: DateTime<Utc>) -> f64 {
    let reference = task.updated_at.max(task.created_at);
    let delta = now.signed_duration_since(reference);
    delta.num_milliseconds() as f64 / 60_000.0
}

/// Stable ordering for a batch of scored tasks: priority descending,
/// then task id ascending to break ties deterministically.
pub fn cmp_for_dispatch(a: (&Task, f64), b: (&Task, f64)) -> std::cmp::Ordering {
    b.1.total_cmp(&a.1).then_with(|| a.0.id.cmp(&b.0.id))
}
