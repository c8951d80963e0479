//! Event bus for queue operations
//!
//! Services announce what they did here; the binary attaches a logging
//! listener, embedders may subscribe for their own bookkeeping.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, trace, warn};

use crate::routines::Category;

/// Events emitted by the capture pipeline and the backfill job
#[derive(Debug, Clone)]
pub enum QueueEvent {
    // Queue events
    RecordWritten {
        id: i64,
        event: String,
        event_type: String,
    },
    RecordSkipped {
        event: String,
        obj_type: String,
    },
    WriteFailed {
        event: String,
        reason: String,
    },
    QueueReset {
        removed: usize,
    },

    // Registry events
    ProviderRegistered {
        name: String,
        namespace: String,
        overrides: Vec<Category>,
    },
    ProviderUpdated {
        name: String,
        namespace: String,
    },
    ProviderUnregistered {
        name: String,
        namespace: String,
    },

    // Capture events
    RoutineFailed {
        provider: String,
        category: Category,
        reason: String,
    },

    // Backfill events
    BackfillStarted {
        run_id: String,
        found_items: i64,
    },
    BackfillCheckpoint {
        run_id: String,
        processed_items: i64,
        progress: i64,
        last_item: i64,
    },
    BackfillFinished {
        run_id: String,
        state: String,
        processed_items: i64,
    },
    BackfillFailed {
        run_id: String,
        reason: String,
    },
}

/// Trait for event listeners
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &QueueEvent);
}

/// Event bus for broadcasting queue events
pub struct EventBus {
    sender: broadcast::Sender<QueueEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all subscribers
    pub fn emit(&self, event: QueueEvent) {
        trace!(event = ?event, "Emitting queue event");
        // No subscribers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Logging event listener
pub struct LoggingEventListener;

impl EventListener for LoggingEventListener {
    fn on_event(&self, event: &QueueEvent) {
        match event {
            QueueEvent::RecordWritten { id, event, event_type } => {
                debug!(id, event = %event, event_type = %event_type, "Queue record written");
            }
            QueueEvent::ProviderRegistered { name, namespace, overrides } => {
                info!(provider = %name, namespace = %namespace, overrides = ?overrides, "Provider registered");
            }
            QueueEvent::ProviderUnregistered { name, namespace } => {
                info!(provider = %name, namespace = %namespace, "Provider unregistered");
            }
            QueueEvent::RoutineFailed { provider, category, reason } => {
                warn!(provider = %provider, category = %category, reason = %reason, "Capture routine failed");
            }
            QueueEvent::BackfillCheckpoint { run_id, processed_items, progress, .. } => {
                debug!(run_id = %run_id, processed = processed_items, progress, "Backfill checkpoint");
            }
            QueueEvent::BackfillFinished { run_id, state, processed_items } => {
                info!(run_id = %run_id, state = %state, processed = processed_items, "Backfill run ended");
            }
            QueueEvent::BackfillFailed { run_id, reason } => {
                error!(run_id = %run_id, reason = %reason, "Backfill failed");
            }
            QueueEvent::QueueReset { removed } => {
                info!(removed, "Queue reset");
            }
            _ => {
                trace!(event = ?event, "Queue event");
            }
        }
    }
}

/// Spawn a background task that logs all events
pub fn spawn_logging_listener(event_bus: Arc<EventBus>) -> tokio::task::JoinHandle<()> {
    spawn_listener(event_bus, LoggingEventListener)
}

/// Feed every event to `listener` until the last bus handle is dropped.
/// Events still buffered at that point are delivered before the task ends.
pub fn spawn_listener<L>(event_bus: Arc<EventBus>, listener: L) -> tokio::task::JoinHandle<()>
where
    L: EventListener + 'static,
{
    let mut receiver = event_bus.subscribe();

    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => listener.on_event(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(skipped = n, "Event listener lagged, skipped events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Event bus closed, stopping listener");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn test_event_bus_emit_receive() {
        let bus = EventBus::new();
        let mut receiver = bus.subscribe();

        bus.emit(QueueEvent::RecordWritten {
            id: 9,
            event: "updateStatus".into(),
            event_type: "lp_event".into(),
        });

        let event = timeout(Duration::from_millis(100), receiver.recv())
            .await
            .expect("timeout")
            .expect("receive error");

        match event {
            QueueEvent::RecordWritten { id, event_type, .. } => {
                assert_eq!(id, 9);
                assert_eq!(event_type, "lp_event");
            }
            _ => panic!("Wrong event type"),
        }
    }

    struct Counting(Arc<std::sync::atomic::AtomicUsize>);

    impl EventListener for Counting {
        fn on_event(&self, _: &QueueEvent) {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_listener_drains_after_bus_dropped() {
        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let handle = spawn_listener(bus.clone(), Counting(seen.clone()));

        for removed in 0..200 {
            bus.emit(QueueEvent::QueueReset { removed });
        }
        drop(bus);

        timeout(Duration::from_secs(5), handle)
            .await
            .expect("listener did not stop")
            .expect("listener panicked");
        assert_eq!(seen.load(std::sync::atomic::Ordering::SeqCst), 200);
    }

    #[test]
    fn test_event_bus_no_subscribers() {
        let bus = EventBus::new();
        bus.emit(QueueEvent::QueueReset { removed: 0 });
        assert_eq!(bus.subscriber_count(), 0);
    }
}
