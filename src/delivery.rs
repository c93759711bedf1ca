//! Follow-up delivery — fan-out of terminal job events to subscribers.
//!
//! A chat response that carries a `jobId` promises a follow-up event on
//! this channel. Delivery is at-most-once: a subscriber that never
//! receives the event for a known `jobId` must treat the follow-up as
//! failed, not as "no follow-up was needed".

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::debug;

use crate::jobs::model::JobEvent;

/// Default broadcast channel capacity.
const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// Sink for terminal job events.
#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    async fn publish(&self, event: JobEvent);
}

/// In-process fan-out backed by a broadcast channel.
pub struct BroadcastDelivery {
    tx: broadcast::Sender<JobEvent>,
}

impl BroadcastDelivery {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(DEFAULT_BROADCAST_CAPACITY);
        Self { tx }
    }

    /// Subscribe to job events. Each client calls this.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastDelivery {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeliveryChannel for BroadcastDelivery {
    async fn publish(&self, event: JobEvent) {
        debug!(
            job_id = %event.job_id,
            status = %event.status,
            "Publishing job event"
        );
        // Broadcast — ok if no receivers are listening yet
        let _ = self.tx.send(event);
    }
}

/// Delivery that drops everything, for callers that poll job state instead.
pub struct NullDelivery;

#[async_trait]
impl DeliveryChannel for NullDelivery {
    async fn publish(&self, _event: JobEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::model::JobStatus;
    use uuid::Uuid;

    fn event(status: JobStatus) -> JobEvent {
        JobEvent {
            job_id: Uuid::new_v4(),
            thread_id: Some("th-1".to_string()),
            job_type: "deep-processing".to_string(),
            status,
            content: Some("answer".to_string()),
            error: None,
        }
    }

    #[tokio::test]
    async fn broadcast_reaches_subscriber() {
        let delivery = BroadcastDelivery::new();
        let mut rx = delivery.subscribe();

        let sent = event(JobStatus::Completed);
        let job_id = sent.job_id;
        delivery.publish(sent).await;

        let received = rx.recv().await.unwrap();
        assert_eq!(received.job_id, job_id);
        assert_eq!(received.status, JobStatus::Completed);
        assert_eq!(received.thread_id.as_deref(), Some("th-1"));
    }

    #[tokio::test]
    async fn all_subscribers_receive_the_event() {
        let delivery = BroadcastDelivery::new();
        let mut rx1 = delivery.subscribe();
        let mut rx2 = delivery.subscribe();

        delivery.publish(event(JobStatus::Failed)).await;

        assert_eq!(rx1.recv().await.unwrap().status, JobStatus::Failed);
        assert_eq!(rx2.recv().await.unwrap().status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn publish_without_subscribers_does_not_panic() {
        let delivery = BroadcastDelivery::new();
        delivery.publish(event(JobStatus::Completed)).await;
    }

    #[tokio::test]
    async fn null_delivery_swallows_events() {
        NullDelivery.publish(event(JobStatus::Completed)).await;
    }
}
