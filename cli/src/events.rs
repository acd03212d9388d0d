//! Task lifecycle notifications for whoever is listening.
//!
//! The hub is created once by the application root and handed to the task
//! manager. Listeners call [`EventHub::subscribe`] when they start and drop
//! the receiver when they stop; there is no other registration state.

use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum TaskEvent {
    Submitted { task_id: String },
    Completed { task_id: String, title: String },
    Failed { task_id: String, error: String },
    RetryStarted { task_id: String },
    Resubmitted { previous_id: String, task_id: String },
    Removed { task_id: String },
    Cleared,
    NotificationSent { task_id: String },
    /// The song is ready but nobody could be told about it.
    NotificationFailed { task_id: String, reason: String },
}

impl TaskEvent {
    pub fn describe(&self) -> String {
        match self {
            Self::Submitted { task_id } => format!("Task {task_id} submitted"),
            Self::Completed { task_id, title } => format!("Task {task_id} completed: {title}"),
            Self::Failed { task_id, error } => format!("Task {task_id} failed: {error}"),
            Self::RetryStarted { task_id } => format!("Retrying task {task_id}"),
            Self::Resubmitted { previous_id, task_id } => {
                format!("Task {previous_id} resubmitted as {task_id}")
            }
            Self::Removed { task_id } => format!("Task {task_id} removed"),
            Self::Cleared => "History cleared".to_string(),
            Self::NotificationSent { task_id } => format!("Notification sent for task {task_id}"),
            Self::NotificationFailed { task_id, reason } => {
                format!("Song ready, but notification failed for task {task_id}: {reason}")
            }
        }
    }
}

#[derive(Clone)]
pub struct EventHub {
    tx: broadcast::Sender<TaskEvent>,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: TaskEvent) {
        // No receivers is fine; nobody is watching right now.
        let _ = self.tx.send(event);
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_to_every_subscriber() {
        let hub = EventHub::new(8);
        let mut first = hub.subscribe();
        let mut second = hub.subscribe();
        hub.publish(TaskEvent::Submitted { task_id: "task-1".into() });
        assert_eq!(first.recv().await.unwrap(), TaskEvent::Submitted { task_id: "task-1".into() });
        assert_eq!(second.recv().await.unwrap(), TaskEvent::Submitted { task_id: "task-1".into() });
    }

    #[test]
    fn dropping_receiver_unsubscribes() {
        let hub = EventHub::default();
        let rx = hub.subscribe();
        assert_eq!(hub.tx.receiver_count(), 1);
        drop(rx);
        assert_eq!(hub.tx.receiver_count(), 0);
        hub.publish(TaskEvent::Cleared);
    }

    #[test]
    fn notification_failure_reads_as_soft_warning() {
        let event =
            TaskEvent::NotificationFailed { task_id: "t".into(), reason: "smtp down".into() };
        assert!(event.describe().starts_with("Song ready, but notification failed"));
    }
}
