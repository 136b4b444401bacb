//! Job change events published to in-process subscribers.

use tokio::sync::broadcast;

use crate::state::{JobStatus, Progress};

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    StatusChanged {
        job_id: String,
        from: JobStatus,
        to: JobStatus,
    },
    Progress {
        job_id: String,
        progress: Progress,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> &str {
        match self {
            JobEvent::StatusChanged { job_id, .. } | JobEvent::Progress { job_id, .. } => job_id,
        }
    }
}

/// Broadcast channel for [`JobEvent`]s. Slow subscribers lose the oldest
/// events and can fall back to reading the store.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<JobEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: JobEvent) {
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    pub fn status_changed(&self, job_id: &str, from: JobStatus, to: JobStatus) {
        self.publish(JobEvent::StatusChanged {
            job_id: job_id.to_string(),
            from,
            to,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.status_changed("j1", JobStatus::Queued, JobStatus::Running);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.job_id(), "j1");
        assert!(matches!(
            event,
            JobEvent::StatusChanged {
                to: JobStatus::Running,
                ..
            }
        ));
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new(4);
        bus.publish(JobEvent::Progress {
            job_id: "j".into(),
            progress: Progress::default(),
        });
    }
}
