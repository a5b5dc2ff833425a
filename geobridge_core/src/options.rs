use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{InvalidOptionsSnafu, Result};

/// What a session does when the publish queue stays full past the enqueue
/// timeout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Drop the record and keep the connection open.
    #[default]
    FailOpen,
    /// Close the session so that no record is silently skipped.
    FailClosed,
}

/// Options of the publish queue and sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueOptions {
    /// Maximum number of records buffered between sessions and the publisher.
    pub capacity: usize,
    /// How long a session waits for room in a full queue.
    pub enqueue_timeout: Duration,
    pub backpressure: BackpressurePolicy,
}

/// Options of the batching publisher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublisherOptions {
    /// Topic the records are published to.
    pub topic: String,
    pub max_batch_size: usize,
    /// Maximum time a batch stays open after its first record.
    pub max_batch_linger: Duration,
    pub retry: RetryOptions,
}

/// Exponential backoff for transient publish errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryOptions {
    /// Retries after the first attempt. Zero disables retries.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

/// Options for a [`Bridge`](crate::Bridge).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeOptions {
    pub queue: QueueOptions,
    pub publisher: PublisherOptions,
    /// Part of the shutdown deadline reserved to flush the broker and
    /// dead-letter what is left.
    pub shutdown_grace: Duration,
}

impl BridgeOptions {
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.publisher.topic = topic.into();
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue.capacity = capacity;
        self
    }

    pub fn with_enqueue_timeout(mut self, timeout: Duration) -> Self {
        self.queue.enqueue_timeout = timeout;
        self
    }

    pub fn with_backpressure(mut self, policy: BackpressurePolicy) -> Self {
        self.queue.backpressure = policy;
        self
    }

    pub fn with_batching(mut self, max_batch_size: usize, max_batch_linger: Duration) -> Self {
        self.publisher.max_batch_size = max_batch_size;
        self.publisher.max_batch_linger = max_batch_linger;
        self
    }

    pub fn with_retry(mut self, retry: RetryOptions) -> Self {
        self.publisher.retry = retry;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue.capacity == 0 {
            return InvalidOptionsSnafu {
                message: "queue capacity must be at least 1",
            }
            .fail();
        }

        if self.publisher.max_batch_size == 0 {
            return InvalidOptionsSnafu {
                message: "max batch size must be at least 1",
            }
            .fail();
        }

        if self.publisher.topic.is_empty() {
            return InvalidOptionsSnafu {
                message: "topic must not be empty",
            }
            .fail();
        }

        if !(self.publisher.retry.multiplier >= 1.0) {
            return InvalidOptionsSnafu {
                message: "backoff multiplier must be at least 1.0",
            }
            .fail();
        }

        if self.publisher.retry.initial_backoff > self.publisher.retry.max_backoff {
            return InvalidOptionsSnafu {
                message: "initial backoff exceeds max backoff",
            }
            .fail();
        }

        Ok(())
    }
}

impl RetryOptions {
    /// The delay before retry number `retry` (starting at 1).
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(32) as i32;
        let delay = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        if !delay.is_finite() || delay >= self.max_backoff.as_secs_f64() {
            return self.max_backoff;
        }

        Duration::from_secs_f64(delay)
    }
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            queue: QueueOptions::default(),
            publisher: PublisherOptions::default(),
            shutdown_grace: Duration::from_millis(500),
        }
    }
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            capacity: 1024,
            enqueue_timeout: Duration::from_millis(100),
            backpressure: BackpressurePolicy::FailOpen,
        }
    }
}

impl Default for PublisherOptions {
    fn default() -> Self {
        Self {
            topic: "gpscoords".to_string(),
            max_batch_size: 100,
            max_batch_linger: Duration::from_millis(50),
            retry: RetryOptions::default(),
        }
    }
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options_are_valid() {
        BridgeOptions::default().validate().unwrap();
    }

    #[test]
    fn test_zero_capacity_is_rejected() {
        let options = BridgeOptions::default().with_queue_capacity(0);
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_zero_batch_size_is_rejected() {
        let options = BridgeOptions::default().with_batching(0, Duration::from_millis(10));
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_backoff_grows_and_is_capped() {
        let retry = RetryOptions {
            max_retries: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
            multiplier: 2.0,
        };

        assert_eq!(retry.backoff(1), Duration::from_millis(100));
        assert_eq!(retry.backoff(2), Duration::from_millis(200));
        assert_eq!(retry.backoff(3), Duration::from_millis(400));
        assert_eq!(retry.backoff(5), Duration::from_secs(1));
        assert_eq!(retry.backoff(1000), Duration::from_secs(1));
    }

    #[test]
    fn test_policy_serde_names() {
        let policy: BackpressurePolicy = serde_json::from_str("\"fail_closed\"").unwrap();
        assert_eq!(policy, BackpressurePolicy::FailClosed);
    }
}
