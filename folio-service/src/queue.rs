//! At-least-once work queue abstraction.
//!
//! Receiving a message leases it: the message stays invisible to other
//! receivers until the visibility timeout elapses, then reappears with a
//! higher delivery count. Handlers that finish delete it with the lease they
//! were handed; handlers that give up simply let the lease expire.

use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::error::ServiceResult;

/// A message received under a lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeasedMessage {
    pub id: String,
    pub body: String,
    /// Number of times this message has been handed out, including this one.
    pub delivery_count: u32,
    /// Proof of the current lease; stale after redelivery.
    pub lease_token: String,
    pub inserted_at: DateTime<Utc>,
}

pub trait WorkQueue: Send + Sync {
    fn name(&self) -> &str;

    /// Append a message and return its id.
    fn enqueue(&self, body: &str) -> ServiceResult<String>;

    /// Lease up to `max_messages` visible messages for `visibility_timeout`.
    fn receive(
        &self,
        max_messages: usize,
        visibility_timeout: Duration,
    ) -> ServiceResult<Vec<LeasedMessage>>;

    /// Remove a message for good. Fails with `QueueError::LeaseLost` when the
    /// message has since been leased to someone else; succeeds when the
    /// message is already gone.
    fn delete(&self, message: &LeasedMessage) -> ServiceResult<()>;

    /// Push the lease deadline out to now + `visibility_timeout`.
    fn renew_lease(&self, message: &LeasedMessage, visibility_timeout: Duration)
    -> ServiceResult<()>;

    /// Messages currently stored, visible or not.
    fn approximate_len(&self) -> ServiceResult<u64>;
}
