//! Task lifecycle events.
//!
//! Every state change of a scheduled task is broadcast as a [`TaskTransition`].
//! Publishing never blocks and never fails: with no subscriber the event is dropped,
//! and a lagging subscriber loses the oldest events.

use crate::scheduler::TaskState;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskTransition {
    pub workflow: String,
    pub task: String,
    pub from: TaskState,
    pub to: TaskState,
    pub at: DateTime<Utc>,
}

impl TaskTransition {
    pub fn new(
        workflow: impl Into<String>,
        task: impl Into<String>,
        from: TaskState,
        to: TaskState,
    ) -> Self {
        Self {
            workflow: workflow.into(),
            task: task.into(),
            from,
            to,
            at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventPublisher {
    sender: broadcast::Sender<TaskTransition>,
}

impl EventPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Returns how many subscribers received the event
    pub fn publish(&self, event: TaskTransition) -> usize {
        // SendError only means nobody is listening
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskTransition> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_without_subscribers_is_dropped() {
        let publisher = EventPublisher::default();
        let delivered = publisher.publish(TaskTransition::new(
            "dev",
            "db",
            TaskState::Pending,
            TaskState::Ready,
        ));
        assert_eq!(delivered, 0);
    }

    #[tokio::test]
    async fn test_subscriber_receives_transitions() {
        let publisher = EventPublisher::new(8);
        let mut rx = publisher.subscribe();
        assert_eq!(publisher.subscriber_count(), 1);

        publisher.publish(TaskTransition::new(
            "dev",
            "db",
            TaskState::Ready,
            TaskState::Running,
        ));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.task, "db");
        assert_eq!(event.from, TaskState::Ready);
        assert_eq!(event.to, TaskState::Running);
    }
}
