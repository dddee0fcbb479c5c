//! In-process event bus over a tokio broadcast channel.

use async_trait::async_trait;
use futures::stream;
use tally_core::Result;
use tally_core::events::LedgerEvent;
use tally_core::ports::{EventBus, EventStream};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

/// Fan-out bus for ledger events within one process.
///
/// Subscribers see events published after they subscribe. A subscriber
/// that falls more than `capacity` events behind skips the oldest ones.
#[derive(Clone)]
pub struct LocalEventBus {
    sender: broadcast::Sender<LedgerEvent>,
}

impl LocalEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for LocalEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl EventBus for LocalEventBus {
    async fn publish(&self, event: LedgerEvent) -> Result<()> {
        let subject = event.subject();
        // No subscribers is not an error.
        match self.sender.send(event) {
            Ok(receivers) => debug!(subject = %subject, receivers, "Published event"),
            Err(_) => debug!(subject = %subject, "Published event with no subscribers"),
        }
        Ok(())
    }

    async fn subscribe(&self) -> Result<EventStream> {
        let receiver = self.sender.subscribe();
        let events = stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => return Some((event, receiver)),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Event subscriber lagged; events dropped");
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        });
        Ok(Box::pin(events))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use futures::StreamExt;
    use tally_core::events::{BalanceAlertPayload, BalanceStatus};
    use tally_core::ids::AccountId;

    fn alert(available: i64) -> LedgerEvent {
        LedgerEvent::BalanceAlert(BalanceAlertPayload {
            account_id: AccountId::new("user_1"),
            status: BalanceStatus::Low,
            available,
            notified_at: Utc::now(),
        })
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = LocalEventBus::default();
        bus.publish(alert(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_subscribers_receive_in_order() {
        let bus = LocalEventBus::default();
        let mut first = bus.subscribe().await.unwrap();
        let mut second = bus.subscribe().await.unwrap();
        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(alert(1)).await.unwrap();
        bus.publish(alert(2)).await.unwrap();

        for stream in [&mut first, &mut second] {
            for expected in [1, 2] {
                match stream.next().await {
                    Some(LedgerEvent::BalanceAlert(p)) => assert_eq!(p.available, expected),
                    other => panic!("unexpected event: {:?}", other),
                }
            }
        }
    }

    #[tokio::test]
    async fn test_lagging_subscriber_skips_oldest() {
        let bus = LocalEventBus::new(2);
        let mut events = bus.subscribe().await.unwrap();
        for i in 0..5 {
            bus.publish(alert(i)).await.unwrap();
        }
        match events.next().await {
            Some(LedgerEvent::BalanceAlert(p)) => assert_eq!(p.available, 3),
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
