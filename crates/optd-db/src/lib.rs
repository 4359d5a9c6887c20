//! Store layer for the optimization-job controller.
//!
//! Owns every Job/Task/Metric/Artifact/ReoptimizeHistory row (see
//! `SPEC_FULL.md` §3) behind typed models and query functions. Nothing in
//! this crate talks to the Broker; that lives in `optd-broker`.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
pub mod thresholds;
