use maas_ipam_msg::events::Event;
use tokio::sync::mpsc;
use tracing::debug;

/// Called after a mutation commits, once per emitted event.
pub trait ChangeHook: Send + Sync {
    fn on_change(&self, event: &Event);
}

/// Hands events to the async side, where `maas_ipam_msg::spawn_forwarder`
/// publishes them on the message bus.
pub struct BusHook {
    tx: mpsc::UnboundedSender<Event>,
}

impl BusHook {
    pub fn new(tx: mpsc::UnboundedSender<Event>) -> Self {
        Self { tx }
    }
}

impl ChangeHook for BusHook {
    fn on_change(&self, event: &Event) {
        if self.tx.send(event.clone()).is_err() {
            debug!(
                event_type = event.topic_suffix(),
                "event forwarder gone, dropping change event"
            );
        }
    }
}
