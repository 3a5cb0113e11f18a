//! Retry decision logic for rejected messages.
//!
//! The outcome of a rejection is computed here as an explicit value rather
//! than signalled through error types: the broker backends call [`decide`]
//! and act on the returned [`RejectOutcome`].

use crate::envelope::{Properties, keys, parse_u32, parse_u64};
use std::time::Duration;

/// Default retry bounds applied when the envelope carries retry metadata
/// without explicit delay or maximum values.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of redelivery attempts before a message is
    /// dead-lettered.
    pub max_attempts: u32,
    /// Delay before a rescheduled message becomes claimable again.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            delay: Duration::from_secs(10),
        }
    }
}

/// What a rejection should do to the underlying row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectOutcome {
    /// Reschedule the message: return it to the claimable pool after `delay`,
    /// recording `attempt` as the new retry count.
    Retry {
        /// Delay before the message becomes claimable again.
        delay: Duration,
        /// The attempt number to persist. Written with a floor of the row's
        /// current count so duplicate rejects never regress it.
        attempt: u32,
    },
    /// Retry metadata was present but the attempt budget is spent: mark the
    /// row failed and stop redelivering.
    Exhausted,
    /// No retry metadata: terminal rejection, mark the row failed if it
    /// exists.
    Fatal,
}

/// Decides the fate of a rejected message from its properties.
///
/// Presence of the [`keys::RETRY_COUNT`] property opts a message into retry
/// semantics; its value is the number of attempts that have already failed.
/// Absent or malformed numeric values fall back to `0` for the count and to
/// the policy defaults for delay and maximum.
pub fn decide(properties: &Properties, policy: &RetryPolicy) -> RejectOutcome {
    if !properties.contains_key(keys::RETRY_COUNT) {
        return RejectOutcome::Fatal;
    }

    let count = parse_u32(properties, keys::RETRY_COUNT).unwrap_or(0);
    let max = parse_u32(properties, keys::RETRY_MAX).unwrap_or(policy.max_attempts);

    if count >= max {
        return RejectOutcome::Exhausted;
    }

    let delay = parse_u64(properties, keys::RETRY_DELAY)
        .map(Duration::from_millis)
        .unwrap_or(policy.delay);

    RejectOutcome::Retry {
        delay,
        attempt: count + 1,
    }
}
