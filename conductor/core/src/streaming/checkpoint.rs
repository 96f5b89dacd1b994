//! Checkpoint cadence
//!
//! A session persists its accumulated content on every status transition and,
//! while streaming, every N tokens or every T elapsed, whichever comes first.

use std::time::Duration;

use tokio::time::Instant;

use crate::config::StreamingConfig;

/// When to write intermediate checkpoints
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CheckpointPolicy {
    /// Tokens between checkpoints
    pub every_tokens: u32,
    /// Time between checkpoints
    pub interval: Duration,
}

impl CheckpointPolicy {
    /// Build from streaming configuration
    #[must_use]
    pub fn from_config(config: &StreamingConfig) -> Self {
        Self {
            every_tokens: config.checkpoint_every_tokens.max(1),
            interval: config.checkpoint_interval,
        }
    }
}

impl Default for CheckpointPolicy {
    fn default() -> Self {
        Self::from_config(&StreamingConfig::default())
    }
}

/// Tracks progress since the last checkpoint
#[derive(Debug)]
pub(crate) struct CheckpointClock {
    policy: CheckpointPolicy,
    tokens_since: u32,
    last_at: Instant,
}

impl CheckpointClock {
    pub(crate) fn new(policy: CheckpointPolicy) -> Self {
        Self {
            policy,
            tokens_since: 0,
            last_at: Instant::now(),
        }
    }

    /// Count one token; true when a checkpoint is due
    pub(crate) fn tick(&mut self) -> bool {
        self.tokens_since += 1;
        self.tokens_since >= self.policy.every_tokens
            || self.last_at.elapsed() >= self.policy.interval
    }

    /// A checkpoint was written
    pub(crate) fn reset(&mut self) {
        self.tokens_since = 0;
        self.last_at = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_count_trigger() {
        let mut clock = CheckpointClock::new(CheckpointPolicy {
            every_tokens: 3,
            interval: Duration::from_secs(3600),
        });
        assert!(!clock.tick());
        assert!(!clock.tick());
        assert!(clock.tick());
        clock.reset();
        assert!(!clock.tick());
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_trigger() {
        let mut clock = CheckpointClock::new(CheckpointPolicy {
            every_tokens: 1000,
            interval: Duration::from_millis(500),
        });
        assert!(!clock.tick());
        tokio::time::advance(Duration::from_millis(600)).await;
        assert!(clock.tick());
    }

    #[test]
    fn test_zero_tokens_is_clamped() {
        let config = StreamingConfig {
            checkpoint_every_tokens: 0,
            ..StreamingConfig::default()
        };
        assert_eq!(CheckpointPolicy::from_config(&config).every_tokens, 1);
    }
}
