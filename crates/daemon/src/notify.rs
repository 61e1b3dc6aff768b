//! Job event notification port.
//!
//! State-mutating operations publish typed events through the
//! [`StatusPublisher`] trait. The daemon core does not know how events
//! reach consumers; the default sink discards them and embedders can
//! subscribe through a channel-backed publisher.

use crate::jobs::{BuildStep, JobStatus};
use serde::Serialize;
use tokio::sync::mpsc;

/// A job state change worth telling subscribers about.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobEvent {
    /// A job entered or left the queue.
    QueueChanged { id: u64, name: String, added: bool },
    /// A job's lifecycle state, pause state, or error flag changed.
    StatusChanged {
        id: u64,
        status: JobStatus,
        paused: bool,
        error: bool,
    },
    /// A job gained processing data during its build.
    ProcessingDataChanged { id: u64, step: BuildStep },
    /// Encode progress moved.
    ProgressChanged {
        id: u64,
        progress: u8,
        fps: Option<f64>,
        eta_secs: Option<u64>,
    },
}

impl JobEvent {
    /// Stable topic string for the event kind.
    pub fn topic(&self) -> &'static str {
        match self {
            JobEvent::QueueChanged { .. } => "job_queue",
            JobEvent::StatusChanged { .. } => "job_status",
            JobEvent::ProcessingDataChanged { .. } => "job_processing_data",
            JobEvent::ProgressChanged { .. } => "job_progress",
        }
    }
}

/// Notification port called by state-mutating operations.
pub trait StatusPublisher: Send + Sync {
    fn publish(&self, event: JobEvent);
}

/// Publisher that discards every event.
#[derive(Debug, Default)]
pub struct NullPublisher;

impl StatusPublisher for NullPublisher {
    fn publish(&self, _event: JobEvent) {}
}

/// Publisher that forwards events to an unbounded channel.
#[derive(Debug)]
pub struct ChannelPublisher {
    sender: mpsc::UnboundedSender<JobEvent>,
}

impl ChannelPublisher {
    /// Creates the publisher and the receiving end for the subscriber.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<JobEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl StatusPublisher for ChannelPublisher {
    fn publish(&self, event: JobEvent) {
        if self.sender.send(event).is_err() {
            tracing::debug!("job event dropped, subscriber is gone");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topics_are_stable() {
        let queue = JobEvent::QueueChanged {
            id: 1,
            name: "Movie".to_string(),
            added: true,
        };
        let status = JobEvent::StatusChanged {
            id: 1,
            status: JobStatus::Encoding,
            paused: false,
            error: false,
        };
        let data = JobEvent::ProcessingDataChanged {
            id: 1,
            step: BuildStep::Probing,
        };
        let progress = JobEvent::ProgressChanged {
            id: 1,
            progress: 42,
            fps: Some(96.5),
            eta_secs: Some(1800),
        };

        assert_eq!(queue.topic(), "job_queue");
        assert_eq!(status.topic(), "job_status");
        assert_eq!(data.topic(), "job_processing_data");
        assert_eq!(progress.topic(), "job_progress");
    }

    #[test]
    fn test_channel_publisher_delivers_in_order() {
        let (publisher, mut receiver) = ChannelPublisher::new();

        publisher.publish(JobEvent::QueueChanged {
            id: 7,
            name: "Movie".to_string(),
            added: true,
        });
        publisher.publish(JobEvent::StatusChanged {
            id: 7,
            status: JobStatus::Building,
            paused: false,
            error: false,
        });

        assert!(matches!(
            receiver.try_recv(),
            Ok(JobEvent::QueueChanged { id: 7, added: true, .. })
        ));
        assert!(matches!(
            receiver.try_recv(),
            Ok(JobEvent::StatusChanged {
                id: 7,
                status: JobStatus::Building,
                ..
            })
        ));
        assert!(receiver.try_recv().is_err());
    }

    #[test]
    fn test_publish_without_subscriber_does_not_panic() {
        let (publisher, receiver) = ChannelPublisher::new();
        drop(receiver);
        publisher.publish(JobEvent::ProgressChanged {
            id: 1,
            progress: 10,
            fps: None,
            eta_secs: None,
        });

        NullPublisher.publish(JobEvent::QueueChanged {
            id: 2,
            name: "Other".to_string(),
            added: false,
        });
    }

    #[test]
    fn test_event_serializes_with_kind_tag() {
        let event = JobEvent::ProgressChanged {
            id: 3,
            progress: 55,
            fps: Some(120.0),
            eta_secs: Some(600),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "progress_changed");
        assert_eq!(json["id"], 3);
        assert_eq!(json["progress"], 55);
    }
}
