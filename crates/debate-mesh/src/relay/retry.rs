use async_trait::async_trait;
use debate_protocol::{ParticipantId, SessionId, SignalId, SignalMessage};
use rand::Rng;

use super::{InboxSink, RelayChannel, Subscription};
use crate::config::RetryPolicy;
use crate::error::RelayError;

/// Relay wrapper retrying transient publish failures with exponential backoff.
///
/// Retries stay at this boundary; callers see either success or the last
/// error once the attempts are exhausted.
pub struct RetryingRelay<R> {
    inner: R,
    policy: RetryPolicy,
}

impl<R: RelayChannel> RetryingRelay<R> {
    pub fn new(inner: R, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }
}

#[async_trait]
impl<R: RelayChannel> RelayChannel for RetryingRelay<R> {
    async fn publish(
        &self,
        session_id: &SessionId,
        message: &SignalMessage,
    ) -> Result<SignalId, RelayError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match self.inner.publish(session_id, message).await {
                Ok(id) => return Ok(id),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let base = self.policy.backoff(attempt);
                    // Up to 10% jitter so peers retrying together spread out
                    let jitter = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 10);
                    let delay = base + std::time::Duration::from_millis(jitter);
                    tracing::warn!(
                        "Publishing {} to {} failed (attempt {}/{}): {}; retrying in {:?}",
                        message.kind(),
                        message.to,
                        attempt,
                        max_attempts,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn subscribe_inbox(
        &self,
        session_id: &SessionId,
        recipient: &ParticipantId,
        sink: InboxSink,
    ) -> Result<Subscription, RelayError> {
        self.inner.subscribe_inbox(session_id, recipient, sink).await
    }

    async fn unsubscribe(&self, subscription: &Subscription) {
        self.inner.unsubscribe(subscription).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::MemoryRelay;
    use debate_protocol::{IceCandidateInit, SignalPayload};

    fn candidate() -> SignalMessage {
        SignalMessage::new(
            "a".into(),
            "b".into(),
            SignalPayload::Candidate(IceCandidateInit {
                candidate: "candidate:1".into(),
                ..Default::default()
            }),
        )
    }

    fn quick_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
        }
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let memory = MemoryRelay::new();
        memory.fail_next_publishes(2);
        let relay = RetryingRelay::new(memory.clone(), quick_policy(3));

        let session = SessionId::new("s");
        relay.publish(&session, &candidate()).await.unwrap();
        assert_eq!(memory.pending_signals(&session).len(), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let memory = MemoryRelay::new();
        memory.fail_next_publishes(5);
        let relay = RetryingRelay::new(memory.clone(), quick_policy(3));

        let err = relay
            .publish(&SessionId::new("s"), &candidate())
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(memory.publish_count(), 0);
    }
}
