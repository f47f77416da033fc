use crate::events::Event;
use crate::MessageBus;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Bus for a region controller running without messaging. Events are
/// logged and counted, never delivered.
pub struct NoopMessageBus {
    instance_id: String,
    discarded: AtomicU64,
}

impl NoopMessageBus {
    pub fn new(instance_id: &str) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            discarded: AtomicU64::new(0),
        }
    }

    pub fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl MessageBus for NoopMessageBus {
    async fn publish(&self, event: &Event) -> anyhow::Result<()> {
        self.discarded.fetch_add(1, Ordering::Relaxed);
        debug!(
            instance_id = %self.instance_id,
            event_type = event.topic_suffix(),
            subnets = ?event.subnet_ids(),
            "noop: change event discarded"
        );
        Ok(())
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        debug!(
            instance_id = %self.instance_id,
            discarded = self.discarded(),
            "noop: message bus shutdown"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ChangeAction;
    use chrono::Utc;

    #[tokio::test]
    async fn test_publish_counts_discarded() {
        let bus = NoopMessageBus::new("region-01");
        let event = Event::IpRangeChanged {
            instance_id: "region-01".to_string(),
            subnet_id: 1,
            iprange_id: 4,
            start_ip: "10.0.0.101".to_string(),
            end_ip: "10.0.0.200".to_string(),
            action: ChangeAction::Deleted,
            timestamp: Utc::now(),
        };
        bus.publish(&event).await.unwrap();
        bus.publish(&event).await.unwrap();
        assert_eq!(bus.discarded(), 2);
    }
}
