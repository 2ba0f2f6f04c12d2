//! In-process status fan-out.
//!
//! Every job publishes [`StatusEvent`]s on one broadcast channel. Subscribers
//! filter by job id or configuration name; a transport (HTTP polling, a
//! push channel, the CLI spinner) sits on top of a subscription.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;

use newsloom_shared::{
    AggregationPhase, AggregationStats, AggregationStatus, JobId, JobStatus, JobType,
    StatusError, UsageTotals,
};

/// The engine-facing part of a job status payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregationSummary {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_source: Option<String>,
    pub current_phase: AggregationPhase,
    pub errors: Vec<StatusError>,
    pub stats: AggregationStats,
}

impl From<AggregationStatus> for AggregationSummary {
    fn from(status: AggregationStatus) -> Self {
        Self {
            current_source: status.current_source,
            current_phase: status.current_phase,
            errors: status.errors,
            stats: status.stats,
        }
    }
}

/// Serializable view of a job. Holds no runtime handles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusPayload {
    pub job_id: JobId,
    pub config_name: String,
    pub job_type: JobType,
    pub start_time: DateTime<Utc>,
    pub status: JobStatus,
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<String>,
    pub usage: UsageTotals,
    pub aggregation_status: AggregationSummary,
}

/// Everything published on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StatusEvent {
    /// Live engine status for a configuration.
    StatusUpdate {
        config_name: String,
        status: AggregationStatus,
    },
    /// A job changed status, progress or usage.
    JobStatusUpdate(JobStatusPayload),
}

/// Broadcast bus for [`StatusEvent`]s. Cloning shares the channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<StatusEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish to current subscribers. Having none is fine.
    pub fn publish(&self, event: StatusEvent) {
        let _ = self.sender.send(event);
    }

    /// Every event, unfiltered.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.sender.subscribe()
    }

    /// Job status updates for one job.
    pub fn subscribe_job(&self, job_id: JobId) -> JobSubscription {
        JobSubscription {
            rx: self.sender.subscribe(),
            job_id,
        }
    }

    /// Live engine status for one configuration.
    pub fn subscribe_config(&self, config_name: impl Into<String>) -> ConfigSubscription {
        ConfigSubscription {
            rx: self.sender.subscribe(),
            config_name: config_name.into(),
        }
    }
}

/// Filtered receiver for one job's updates.
pub struct JobSubscription {
    rx: broadcast::Receiver<StatusEvent>,
    job_id: JobId,
}

impl JobSubscription {
    /// Next update for this job, or `None` once the bus is gone. Lagging
    /// skips the missed events.
    pub async fn recv(&mut self) -> Option<JobStatusPayload> {
        loop {
            match self.rx.recv().await {
                Ok(StatusEvent::JobStatusUpdate(payload)) if payload.job_id == self.job_id => {
                    return Some(payload);
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(job_id = %self.job_id, missed, "job subscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Filtered receiver for one configuration's engine status.
pub struct ConfigSubscription {
    rx: broadcast::Receiver<StatusEvent>,
    config_name: String,
}

impl ConfigSubscription {
    pub async fn recv(&mut self) -> Option<AggregationStatus> {
        loop {
            match self.rx.recv().await {
                Ok(StatusEvent::StatusUpdate {
                    config_name,
                    status,
                }) if config_name == self.config_name => return Some(status),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(config = %self.config_name, missed, "status subscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(job_id: JobId, status: JobStatus) -> JobStatusPayload {
        JobStatusPayload {
            job_id,
            config_name: "cfg".into(),
            job_type: JobType::OneTime,
            start_time: Utc::now(),
            status,
            progress: 0,
            error: None,
            cancel_reason: None,
            usage: UsageTotals::default(),
            aggregation_status: AggregationSummary::default(),
        }
    }

    #[tokio::test]
    async fn job_subscription_filters_by_id() {
        let bus = EventBus::new(16);
        let mine = JobId::new();
        let mut sub = bus.subscribe_job(mine.clone());

        bus.publish(StatusEvent::JobStatusUpdate(payload(JobId::new(), JobStatus::Running)));
        bus.publish(StatusEvent::StatusUpdate {
            config_name: "cfg".into(),
            status: AggregationStatus::default(),
        });
        bus.publish(StatusEvent::JobStatusUpdate(payload(mine.clone(), JobStatus::Completed)));

        let got = sub.recv().await.expect("event");
        assert_eq!(got.job_id, mine);
        assert_eq!(got.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn config_subscription_filters_by_name() {
        let bus = EventBus::new(16);
        let mut sub = bus.subscribe_config("feeds");
        let mut other = AggregationStatus::default();
        other.stats.total_items_fetched = 1;
        let mut wanted = AggregationStatus::default();
        wanted.stats.total_items_fetched = 7;

        bus.publish(StatusEvent::StatusUpdate {
            config_name: "other".into(),
            status: other,
        });
        bus.publish(StatusEvent::StatusUpdate {
            config_name: "feeds".into(),
            status: wanted,
        });

        assert_eq!(sub.recv().await.unwrap().stats.total_items_fetched, 7);
    }

    #[tokio::test]
    async fn lagged_subscriber_keeps_going() {
        let bus = EventBus::new(2);
        let id = JobId::new();
        let mut sub = bus.subscribe_job(id.clone());
        for _ in 0..5 {
            bus.publish(StatusEvent::JobStatusUpdate(payload(id.clone(), JobStatus::Running)));
        }
        bus.publish(StatusEvent::JobStatusUpdate(payload(id.clone(), JobStatus::Failed)));

        let mut last = None;
        while let Ok(Some(p)) =
            tokio::time::timeout(std::time::Duration::from_millis(50), sub.recv()).await
        {
            last = Some(p.status);
        }
        assert_eq!(last, Some(JobStatus::Failed));
    }

    #[tokio::test]
    async fn closed_bus_ends_subscription() {
        let bus = EventBus::new(4);
        let mut sub = bus.subscribe_job(JobId::new());
        drop(bus);
        assert!(sub.recv().await.is_none());
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let event = StatusEvent::JobStatusUpdate(payload(JobId::new(), JobStatus::Cancelled));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "jobStatusUpdate");
        assert_eq!(json["status"], "cancelled");
    }
}
