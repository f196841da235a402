use relay_common::EventEnvelope;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::broadcast;

const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Bus channel carrying live events for one {tenant, topic} on this replica.
pub fn topic_channel(tenant: &str, topic: &str) -> String {
    format!("TOPIC_EVENTS:{tenant}:{topic}")
}

/// Single-replica multi-consumer broadcast keyed by channel name.
///
/// Subscribers see only values published after they subscribed. Backpressure
/// is the consumer's problem: a receiver that cannot keep up observes a lag
/// gap and is skipped for the offending deliveries; the durable
/// per-subscriber queue is the authoritative backpressure path.
pub struct BroadcastBus {
    channels: Mutex<HashMap<String, broadcast::Sender<EventEnvelope>>>,
    capacity: usize,
}

impl Default for BroadcastBus {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl BroadcastBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Deliver to every current subscriber of `channel`; returns how many
    /// receivers took the value.
    pub fn publish(&self, channel: &str, envelope: EventEnvelope) -> usize {
        let mut channels = self.channels.lock().expect("bus lock");
        match channels.get(channel) {
            Some(sender) => {
                let delivered = sender.send(envelope).unwrap_or(0);
                // Drop the channel entry once the last receiver is gone so
                // idle topics do not accumulate forever.
                if sender.receiver_count() == 0 {
                    channels.remove(channel);
                }
                delivered
            }
            None => 0,
        }
    }

    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<EventEnvelope> {
        let mut channels = self.channels.lock().expect("bus lock");
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.lock().expect("bus lock").len()
    }
}
