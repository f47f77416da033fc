pub mod events;
pub mod nats;
pub mod noop;

use async_trait::async_trait;
use events::Event;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Trait for the message bus abstraction.
/// Implementations can use NATS, or be a no-op for standalone mode.
#[async_trait]
pub trait MessageBus: Send + Sync + 'static {
    /// Publish an event to the appropriate subject.
    async fn publish(&self, event: &Event) -> anyhow::Result<()>;

    /// Gracefully shut down the message bus.
    async fn shutdown(&self) -> anyhow::Result<()>;
}

/// Create a message bus from configuration.
pub async fn create_message_bus(
    backend: &str,
    instance_id: &str,
    topic_prefix: &str,
    url: Option<&str>,
) -> anyhow::Result<Box<dyn MessageBus>> {
    match backend {
        "nats" => {
            let url = url.ok_or_else(|| anyhow::anyhow!("nats backend requires messaging.url"))?;
            Ok(Box::new(
                nats::NatsMessageBus::new(instance_id, topic_prefix, url).await?,
            ))
        }
        "noop" => Ok(Box::new(noop::NoopMessageBus::new(instance_id))),
        other => {
            warn!(backend = other, "unknown messaging backend, falling back to noop");
            Ok(Box::new(noop::NoopMessageBus::new(instance_id)))
        }
    }
}

/// Drain change events produced by synchronous IPAM code onto the bus.
/// The task ends once every sender has been dropped.
pub fn spawn_forwarder(
    bus: Arc<dyn MessageBus>,
    mut rx: mpsc::UnboundedReceiver<Event>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if let Err(e) = bus.publish(&event).await {
                warn!(
                    event_type = event.topic_suffix(),
                    "failed to publish change event: {e}"
                );
            }
        }
        debug!("event forwarder stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use events::ChangeAction;
    use std::sync::Mutex;

    struct CapturingBus {
        published: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MessageBus for CapturingBus {
        async fn publish(&self, event: &Event) -> anyhow::Result<()> {
            self.published
                .lock()
                .unwrap()
                .push(event.topic_suffix().to_string());
            Ok(())
        }

        async fn shutdown(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_forwarder_publishes_until_senders_drop() {
        let bus = Arc::new(CapturingBus {
            published: Mutex::new(Vec::new()),
        });
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = spawn_forwarder(bus.clone(), rx);

        tx.send(Event::SubnetChanged {
            instance_id: "region-01".to_string(),
            subnet_id: 1,
            cidr: "10.0.0.0/24".to_string(),
            action: ChangeAction::Created,
            timestamp: Utc::now(),
        })
        .unwrap();
        drop(tx);

        handle.await.unwrap();
        assert_eq!(*bus.published.lock().unwrap(), vec!["subnets".to_string()]);
    }

    #[tokio::test]
    async fn test_create_noop_bus() {
        let bus = create_message_bus("noop", "region-01", "maas", None)
            .await
            .unwrap();
        assert!(bus.shutdown().await.is_ok());
    }

    #[tokio::test]
    async fn test_nats_requires_url() {
        assert!(create_message_bus("nats", "region-01", "maas", None)
            .await
            .is_err());
    }
}
