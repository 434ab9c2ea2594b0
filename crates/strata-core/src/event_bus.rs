use tokio::sync::broadcast;

use strata_tools::RecordEventSink;
use strata_types::RecordEvent;

pub const EVENT_BUS_CAPACITY: usize = 2048;

/// Process-wide `record_event` channel. Every subscriber gets its own copy
/// of each event published after it subscribed.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RecordEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RecordEvent> {
        self.tx.subscribe()
    }

    /// Never blocks and never fails; with no subscribers the event is dropped.
    pub fn publish(&self, event: RecordEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordEventSink for EventBus {
    fn publish(&self, event: RecordEvent) {
        EventBus::publish(self, event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_types::{Record, RecordData};

    fn event() -> RecordEvent {
        let record = Record::new("t1", RecordData::new(), "u1");
        RecordEvent::created("a1", &record, "u1")
    }

    #[tokio::test]
    async fn fans_out_to_every_subscriber() {
        let bus = EventBus::new();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();
        bus.publish(event());
        assert_eq!(first.recv().await.expect("first").app_id, "a1");
        assert_eq!(second.recv().await.expect("second").app_id, "a1");
        assert_eq!(bus.subscriber_count(), 2);
    }

    #[test]
    fn publishing_without_subscribers_is_a_no_op() {
        let bus = EventBus::new();
        RecordEventSink::publish(&bus, event());
        assert_eq!(bus.subscriber_count(), 0);
    }
}
