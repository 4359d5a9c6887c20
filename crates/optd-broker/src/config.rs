//! Broker connection configuration.

use std::env;

/// `CONTROLLER_REDIS_URL`, falling back to the conventional local default.
pub const REDIS_URL_ENV: &str = "CONTROLLER_REDIS_URL";
const DEFAULT_URL: &str = "redis://127.0.0.1:6379";

/// Queue-name env vars, matching the original implementation's naming
/// (`REDIS_MAIN_QUEUE`, `REDIS_PROCESSING_QUEUE`, `REDIS_DEAD_LETTER_QUEUE`).
const MAIN_QUEUE_ENV: &str = "CONTROLLER_MAIN_QUEUE";
const PROCESSING_QUEUE_ENV: &str = "CONTROLLER_PROCESSING_QUEUE";
const DEAD_LETTER_QUEUE_ENV: &str = "CONTROLLER_DEAD_LETTER_QUEUE";

const DEFAULT_MAIN_QUEUE: &str = "optd_tasks_main";
const DEFAULT_PROCESSING_QUEUE: &str = "optd_tasks_processing";
const DEFAULT_DEAD_LETTER_QUEUE: &str = "optd_tasks_dead";

/// Connection and queue-naming configuration for [`crate::BrokerClient`].
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub redis_url: String,
    pub main_queue: String,
    pub processing_queue: String,
    pub dead_letter_queue: String,
}

impl BrokerConfig {
    pub fn from_env() -> Self {
        Self {
            redis_url: env::var(REDIS_URL_ENV).unwrap_or_else(|_| DEFAULT_URL.to_string()),
            main_queue: env::var(MAIN_QUEUE_ENV).unwrap_or_else(|_| DEFAULT_MAIN_QUEUE.to_string()),
            processing_queue: env::var(PROCESSING_QUEUE_ENV)
                .unwrap_or_else(|_| DEFAULT_PROCESSING_QUEUE.to_string()),
            dead_letter_queue: env::var(DEAD_LETTER_QUEUE_ENV)
                .unwrap_or_else(|_| DEFAULT_DEAD_LETTER_QUEUE.to_string()),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            redis_url: DEFAULT_URL.to_string(),
            main_queue: DEFAULT_MAIN_QUEUE.to_string(),
            processing_queue: DEFAULT_PROCESSING_QUEUE.to_string(),
            dead_letter_queue: DEFAULT_DEAD_LETTER_QUEUE.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_stable() {
        let cfg = BrokerConfig::default();
        assert_eq!(cfg.redis_url, DEFAULT_URL);
        assert_eq!(cfg.main_queue, DEFAULT_MAIN_QUEUE);
        assert_eq!(cfg.processing_queue, DEFAULT_PROCESSING_QUEUE);
        assert_eq!(cfg.dead_letter_queue, DEFAULT_DEAD_LETTER_QUEUE);
    }
}
