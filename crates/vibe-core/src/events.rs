//! A small typed pub/sub bus shared by the Lifecycle Service, the
//! Adaptive Timeout Manager, and the Execution Coordinator. Each publishes
//! `OrchestratorEvent`s; subscribers get a bounded `mpsc` channel so a slow
//! consumer can never make the publishing side block. A full channel is
//! not an error — the event is dropped and a warning is logged, matching
//! the "bounded buffer, drop blocked subscribers" behavior the design
//! calls for.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::types::{TaskId, TaskStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OrchestratorEvent {
    TaskTransitioned {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },
    TaskDecomposed {
        task_id: TaskId,
        subtask_count: usize,
    },
    BatchScheduled {
        project_id: String,
        batch_index: usize,
        task_count: usize,
    },
    TaskTimedOut {
        task_id: TaskId,
        elapsed_ms: u64,
    },
    CascadeTriggered {
        root_task_id: TaskId,
        affected_task_ids: Vec<TaskId>,
    },
    Stagnation {
        task_id: TaskId,
        stalled_for_ms: u64,
    },
}

const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;

struct Subscriber {
    id: Uuid,
    sender: mpsc::Sender<OrchestratorEvent>,
}

/// A process-local event bus. Cheap to clone (an `Arc` around the
/// subscriber list) so every component that needs to publish or subscribe
/// can hold its own handle.
#[derive(Clone)]
pub struct EventBus {
    subscribers: std::sync::Arc<Mutex<Vec<Subscriber>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: std::sync::Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Registers a new subscriber and returns the receiving half of its
    /// channel. Drop the returned `EventSubscription` (or just the
    /// receiver) to unsubscribe.
    pub fn subscribe(&self) -> mpsc::Receiver<OrchestratorEvent> {
        self.subscribe_with_capacity(DEFAULT_SUBSCRIBER_CAPACITY)
    }

    pub fn subscribe_with_capacity(&self, capacity: usize) -> mpsc::Receiver<OrchestratorEvent> {
        let (tx, rx) = mpsc::channel(capacity);
        self.subscribers.lock().push(Subscriber {
            id: Uuid::new_v4(),
            sender: tx,
        });
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Publishes to every live subscriber. A subscriber whose channel is
    /// currently full has the event dropped for it and a warning logged;
    /// a subscriber whose receiver has been dropped is pruned from the
    /// registry.
    pub fn publish(&self, event: OrchestratorEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|subscriber| match subscriber.sender.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(
                    subscriber_id = %subscriber.id,
                    "event bus subscriber is full, dropping event"
                );
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(OrchestratorEvent::TaskTransitioned {
            task_id: "task-1".to_string(),
            from: TaskStatus::Pending,
            to: TaskStatus::InProgress,
        });

        let received = rx.recv().await.expect("event should arrive");
        match received {
            OrchestratorEvent::TaskTransitioned { task_id, .. } => {
                assert_eq!(task_id, "task-1");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn dropped_receiver_is_pruned_on_next_publish() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        drop(rx);
        assert_eq!(bus.subscriber_count(), 1);

        bus.publish(OrchestratorEvent::TaskDecomposed {
            task_id: "task-1".to_string(),
            subtask_count: 3,
        });

        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn full_channel_drops_event_without_panicking() {
        let bus = EventBus::new();
        let _rx = bus.subscribe_with_capacity(1);

        bus.publish(OrchestratorEvent::TaskTimedOut {
            task_id: "task-1".to_string(),
            elapsed_ms: 1000,
        });
        // Second publish finds the channel already full; it must not panic
        // or block, and the subscriber must stay registered.
        bus.publish(OrchestratorEvent::TaskTimedOut {
            task_id: "task-2".to_string(),
            elapsed_ms: 2000,
        });

        assert_eq!(bus.subscriber_count(), 1);
    }
}
