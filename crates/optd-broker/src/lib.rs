//! Broker layer: the Redis-backed transient queue and blob store
//! (`SPEC_FULL.md` §3, §6.2). Holds no durable state of its own --
//! everything here can be rebuilt from `optd_db` plus a Watchdog pass.

pub mod client;
pub mod config;
pub mod envelope;

pub use client::Broker;
pub use config::BrokerConfig;
pub use envelope::Envelope;
