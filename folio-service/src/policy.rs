//! Shared delivery policy for both queue consumers.
//!
//! A handler reports a [`HandlerOutcome`]; [`disposition`] turns it into what
//! happens to the message. Poison messages are caught by [`PoisonPolicy`]
//! before the handler ever sees them.

use crate::config::QueueConfig;

/// What a message handler made of one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Work done; the message can go.
    Success,
    /// Leave the message for redelivery once its lease expires.
    RetryableFailure { reason: String },
    /// The message can never succeed; drop it.
    PoisonDrop,
}

/// What the consumer does with the message afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Delete,
    /// Do nothing; the visibility timeout brings it back.
    Release,
}

pub fn disposition(outcome: &HandlerOutcome) -> Disposition {
    match outcome {
        HandlerOutcome::Success | HandlerOutcome::PoisonDrop => Disposition::Delete,
        HandlerOutcome::RetryableFailure { .. } => Disposition::Release,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoisonPolicy {
    pub max_dequeue_count: u32,
}

impl PoisonPolicy {
    pub fn new(max_dequeue_count: u32) -> Self {
        Self { max_dequeue_count }
    }

    /// True when a delivery may be handed to the handler. With the default of
    /// 2, the third delivery is the first one refused.
    pub fn admit(&self, delivery_count: u32) -> bool {
        delivery_count <= self.max_dequeue_count
    }
}

impl From<&QueueConfig> for PoisonPolicy {
    fn from(config: &QueueConfig) -> Self {
        Self::new(config.max_dequeue_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poison_threshold() {
        let policy = PoisonPolicy::new(2);
        assert!(policy.admit(1));
        assert!(policy.admit(2));
        assert!(!policy.admit(3));
        assert!(!policy.admit(10));
    }

    #[test]
    fn test_dispositions() {
        assert_eq!(disposition(&HandlerOutcome::Success), Disposition::Delete);
        assert_eq!(disposition(&HandlerOutcome::PoisonDrop), Disposition::Delete);
        assert_eq!(
            disposition(&HandlerOutcome::RetryableFailure {
                reason: "layout timed out".to_string()
            }),
            Disposition::Release
        );
    }
}
