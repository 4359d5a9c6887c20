//! The controller/supervisor scheduling plane (`SPEC_FULL.md` §1, §2).
//!
//! This crate owns every control loop that mutates job/task state: the
//! Scheduler (`scheduler`), the Fine-Tune Spawner (`spawner`), the
//! Watchdog (`watchdog`), and the Auto-Reoptimizer (`reoptimizer`). The
//! pure decision functions each loop calls into -- the job-status
//! aggregator, the worker-result evaluator, and the dispatch priority
//! function -- live in their own modules so they can be unit tested
//! without a database.

pub mod aggregate;
pub mod config;
pub mod evaluator;
pub mod ingest;
pub mod leadership;
pub mod notifier;
pub mod priority;
pub mod reoptimizer;
pub mod scheduler;
pub mod spawner;
pub mod state;
pub mod watchdog;
