//! Small typed publish-subscribe abstraction used for the crawl's
//! event-emitter-style notifications: session retirement and the periodic
//! persist-state tick. Each publisher owns a `tokio::sync::broadcast`
//! channel; subscribers register by cloning a receiver. No cross-thread
//! synchronization beyond the channel itself is needed since handlers run
//! cooperatively on the scheduler.

use tokio::sync::broadcast;

#[derive(Debug, Clone)]
pub enum CrawlEvent {
    /// A session was retired from the pool and will no longer be served.
    SessionRetired { session_id: String },
    /// The process-wide "persist your state" tick, dispatched periodically.
    PersistState,
    /// The snapshotter observed a CPU-overload signal.
    CpuOverloaded { is_overloaded: bool, created_at: u64 },
}

/// A multi-producer, multi-consumer event bus. Cloning shares the same
/// underlying channel; each subscriber gets its own receiver and therefore
/// its own delivery cursor.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CrawlEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CrawlEvent> {
        self.sender.subscribe()
    }

    /// Publishes an event. Returns the number of active receivers it
    /// reached; a publish with zero subscribers is not an error.
    pub fn publish(&self, event: CrawlEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Spawns a task that ticks a `PersistState` event onto `bus` on `interval`,
/// mirroring the process-wide persist-state dispatch described for
/// RequestList/SessionPool state persistence.
pub fn spawn_persist_state_ticker(bus: EventBus, interval: std::time::Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval);
        loop {
            timer.tick().await;
            bus.publish(CrawlEvent::PersistState);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        bus.publish(CrawlEvent::SessionRetired { session_id: "s1".into() });
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, CrawlEvent::SessionRetired { session_id } if session_id == "s1"));
    }

    #[test]
    fn test_publish_with_no_subscribers() {
        let bus = EventBus::new(16);
        assert_eq!(bus.publish(CrawlEvent::PersistState), 0);
    }
}
