use crate::events::Event;
use crate::MessageBus;
use async_nats::Client;
use async_trait::async_trait;
use tracing::{debug, info};

/// NATS-backed message bus using async-nats.
pub struct NatsMessageBus {
    client: Client,
    instance_id: String,
    topic_prefix: String,
}

impl NatsMessageBus {
    pub async fn new(instance_id: &str, topic_prefix: &str, url: &str) -> anyhow::Result<Self> {
        info!(
            instance_id = instance_id,
            topic_prefix = topic_prefix,
            url = url,
            "connecting to NATS"
        );

        let client = async_nats::connect(url)
            .await
            .map_err(|e| anyhow::anyhow!("failed to connect to NATS at {url}: {e}"))?;

        info!(instance_id = instance_id, url = url, "NATS connection established");

        Ok(Self {
            client,
            instance_id: instance_id.to_string(),
            topic_prefix: topic_prefix.to_string(),
        })
    }

    fn subject_for_event(&self, event: &Event) -> String {
        subject(&self.topic_prefix, event)
    }
}

/// `<prefix>.<instance>.<suffix>`
fn subject(topic_prefix: &str, event: &Event) -> String {
    format!(
        "{}.{}.{}",
        topic_prefix,
        event.instance_id(),
        event.topic_suffix()
    )
}

#[async_trait]
impl MessageBus for NatsMessageBus {
    async fn publish(&self, event: &Event) -> anyhow::Result<()> {
        let subject = self.subject_for_event(event);
        let payload = serde_json::to_vec(event)?;

        debug!(
            subject = %subject,
            payload_len = payload.len(),
            "nats: publishing event"
        );

        self.client
            .publish(subject.clone(), payload.into())
            .await
            .map_err(|e| anyhow::anyhow!("nats publish to {subject}: {e}"))?;

        Ok(())
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        info!(instance_id = %self.instance_id, "nats: draining connection");
        self.client
            .drain()
            .await
            .map_err(|e| anyhow::anyhow!("nats drain: {e}"))?;
        Ok(())
    }
}
