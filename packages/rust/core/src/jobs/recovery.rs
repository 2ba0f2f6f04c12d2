//! Settle jobs left unfinished by a previous process.

use std::collections::HashSet;

use tracing::{info, instrument, warn};

use newsloom_shared::{JobId, JobLogEntry, JobStore, JobType, Result};

use super::JobManager;

/// Cancel reason for continuous jobs found running at startup.
pub const CONTINUOUS_RESTART_REASON: &str = "server restarted; continuous job cannot be resumed";

/// Failure message for one-time jobs found running at startup.
pub const ONE_TIME_RESTART_ERROR: &str = "server restarted before job completed";

/// What a recovery sweep changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub cancelled: Vec<JobId>,
    pub failed: Vec<JobId>,
}

impl RecoveryReport {
    pub fn total(&self) -> usize {
        self.cancelled.len() + self.failed.len()
    }
}

/// Move every pending or running record not in `skip` to a terminal status.
pub async fn sweep_stale_jobs(store: &dyn JobStore, skip: &HashSet<JobId>) -> Result<RecoveryReport> {
    let mut report = RecoveryReport::default();
    for record in store.get_running_jobs().await? {
        if skip.contains(&record.id) {
            continue;
        }
        let id = record.id;
        match record.job_type {
            JobType::Continuous => {
                if store.cancel_job(&id, CONTINUOUS_RESTART_REASON).await? {
                    store
                        .add_job_log(
                            &id,
                            &JobLogEntry::warn(format!("Job cancelled: {CONTINUOUS_RESTART_REASON}")),
                        )
                        .await?;
                    report.cancelled.push(id);
                }
            }
            JobType::OneTime => {
                if store.fail_job(&id, ONE_TIME_RESTART_ERROR).await? {
                    store
                        .add_job_log(
                            &id,
                            &JobLogEntry::error(format!("Job failed: {ONE_TIME_RESTART_ERROR}")),
                        )
                        .await?;
                    report.failed.push(id);
                }
            }
        }
    }
    Ok(report)
}

impl JobManager {
    /// Settle jobs a previous process left pending or running. Jobs this
    /// manager is running are untouched.
    #[instrument(skip_all)]
    pub async fn recover_stale_jobs(&self) -> Result<RecoveryReport> {
        let live: HashSet<JobId> = self.active.lock().await.keys().cloned().collect();
        let report = sweep_stale_jobs(self.store.as_ref(), &live).await?;
        if report.total() > 0 {
            warn!(
                cancelled = report.cancelled.len(),
                failed = report.failed.len(),
                "recovered stale jobs"
            );
        } else {
            info!("no stale jobs to recover");
        }
        Ok(report)
    }
}
