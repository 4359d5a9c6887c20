//! Worker-result evaluator (`SPEC_FULL.md` §4.3).
//!
//! Pure: takes the metrics a worker reported for a task plus the current
//! distance/score thresholds and decides whether that task's work met
//! the bar. No I/O, no knowledge of the task's job or status.

use optd_db::models::Metric;

/// The outcome of evaluating a task's reported metrics against the
/// current thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// At least one metric cleared both thresholds simultaneously.
    Success,
    /// At least one metric cleared one threshold, but none cleared both.
    Partial,
    /// No metric cleared either threshold.
    None,
}

/// Evaluate a task's metrics against `distance_threshold`/`score_threshold`.
///
/// A task with no metrics at all evaluates to [`Verdict::None`] -- a
/// worker that reported nothing gave the scheduler nothing to accept.
pub fn evaluate(metrics: &[Metric], distance_threshold: f64, score_threshold: f64) -> Verdict {
    let meets_distance = |m: &Metric| m.distance <= distance_threshold;
    let meets_score = |m: &Metric| m.score >= score_threshold;

    if metrics.iter().any(|m| meets_score(m) && meets_distance(m)) {
        return Verdict::Success;
    }
    if metrics.iter().any(|m| meets_score(m) || meets_distance(m)) {
        return Verdict::Partial;
    }
    Verdict::None
}
