//! In-memory content and job store.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use newsloom_shared::{
    ContentItem, ContentStore, JobId, JobLogEntry, JobRecord, JobStatus, JobStore, Result,
    SummaryItem, TickUsage,
};
use tokio::sync::RwLock;

#[derive(Default)]
struct MemoryState {
    content: Vec<ContentItem>,
    content_index: HashMap<String, usize>,
    summaries: Vec<SummaryItem>,
    jobs: Vec<JobRecord>,
    ticks: HashMap<JobId, Vec<TickUsage>>,
}

impl MemoryState {
    fn job_mut(&mut self, id: &JobId) -> Option<&mut JobRecord> {
        self.jobs.iter_mut().find(|j| &j.id == id)
    }
}

/// Content and job storage held entirely in memory. Nothing survives the
/// process.
#[derive(Default)]
pub struct MemoryStorage {
    state: RwLock<MemoryState>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored content, in first-insert order.
    pub async fn content_items(&self) -> Vec<ContentItem> {
        self.state.read().await.content.clone()
    }

    /// Stored summaries, in insert order.
    pub async fn summary_items(&self) -> Vec<SummaryItem> {
        self.state.read().await.summaries.clone()
    }

    pub async fn summaries_for(&self, date: NaiveDate) -> Vec<SummaryItem> {
        self.state
            .read()
            .await
            .summaries
            .iter()
            .filter(|s| s.date == date)
            .cloned()
            .collect()
    }

    pub async fn job_ticks(&self, id: &JobId) -> Vec<TickUsage> {
        self.state
            .read()
            .await
            .ticks
            .get(id)
            .cloned()
            .unwrap_or_default()
    }

    async fn finish(
        &self,
        id: &JobId,
        status: JobStatus,
        error: Option<&str>,
        reason: Option<&str>,
    ) -> bool {
        let mut state = self.state.write().await;
        let Some(job) = state.job_mut(id) else {
            return false;
        };
        if job.status.is_terminal() {
            return false;
        }
        job.status = status;
        job.end_time = Some(Utc::now());
        if status == JobStatus::Completed {
            job.progress = 100;
        }
        if let Some(error) = error {
            job.error = Some(error.to_string());
        }
        if let Some(reason) = reason {
            job.cancel_reason = Some(reason.to_string());
        }
        true
    }
}

#[async_trait]
impl ContentStore for MemoryStorage {
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn get_content_item(&self, content_id: &str) -> Result<Option<ContentItem>> {
        let state = self.state.read().await;
        Ok(state
            .content_index
            .get(content_id)
            .map(|&i| state.content[i].clone()))
    }

    async fn save_content_items(&self, items: &[ContentItem]) -> Result<usize> {
        let mut state = self.state.write().await;
        let mut written = 0;
        for item in items {
            let Some(id) = item.content_id.clone() else {
                continue;
            };
            match state.content_index.get(&id).copied() {
                Some(i) => state.content[i] = item.clone(),
                None => {
                    let i = state.content.len();
                    state.content.push(item.clone());
                    state.content_index.insert(id, i);
                }
            }
            written += 1;
        }
        Ok(written)
    }

    async fn save_summary_item(&self, item: &SummaryItem) -> Result<()> {
        let mut state = self.state.write().await;
        let existing = state.summaries.iter_mut().find(|s| {
            s.generator == item.generator && s.kind == item.kind && s.date == item.date
        });
        match existing {
            Some(slot) => *slot = item.clone(),
            None => state.summaries.push(item.clone()),
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for MemoryStorage {
    async fn create_job(&self, record: &JobRecord) -> Result<()> {
        self.state.write().await.jobs.push(record.clone());
        Ok(())
    }

    async fn get_job(&self, id: &JobId) -> Result<Option<JobRecord>> {
        Ok(self
            .state
            .read()
            .await
            .jobs
            .iter()
            .find(|j| &j.id == id)
            .cloned())
    }

    async fn list_jobs(&self) -> Result<Vec<JobRecord>> {
        let mut jobs = self.state.read().await.jobs.clone();
        jobs.reverse();
        Ok(jobs)
    }

    async fn start_job(&self, id: &JobId) -> Result<bool> {
        let mut state = self.state.write().await;
        match state.job_mut(id) {
            Some(job) if job.status == JobStatus::Pending => {
                job.status = JobStatus::Running;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update_job_progress(&self, id: &JobId, progress: u8) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(job) = state.job_mut(id) {
            if !job.status.is_terminal() {
                job.progress = progress.min(100);
            }
        }
        Ok(())
    }

    async fn complete_job(&self, id: &JobId) -> Result<bool> {
        Ok(self.finish(id, JobStatus::Completed, None, None).await)
    }

    async fn fail_job(&self, id: &JobId, error: &str) -> Result<bool> {
        Ok(self.finish(id, JobStatus::Failed, Some(error), None).await)
    }

    async fn cancel_job(&self, id: &JobId, reason: &str) -> Result<bool> {
        Ok(self
            .finish(id, JobStatus::Cancelled, None, Some(reason))
            .await)
    }

    async fn add_job_log(&self, id: &JobId, entry: &JobLogEntry) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(job) = state.job_mut(id) {
            job.logs.push(entry.clone());
        }
        Ok(())
    }

    async fn get_running_jobs(&self) -> Result<Vec<JobRecord>> {
        Ok(self
            .state
            .read()
            .await
            .jobs
            .iter()
            .filter(|j| !j.status.is_terminal())
            .cloned()
            .collect())
    }

    async fn add_job_usage(&self, id: &JobId, usage: &TickUsage) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(job) = state.job_mut(id) {
            job.usage.absorb(usage);
        }
        Ok(())
    }

    async fn record_continuous_tick(&self, id: &JobId, usage: &TickUsage) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(job) = state.job_mut(id) {
            job.usage.record(usage);
        }
        state.ticks.entry(id.clone()).or_default().push(*usage);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use newsloom_shared::JobType;

    #[tokio::test]
    async fn content_dedupes_by_id() {
        let store = MemoryStorage::new();
        let item = ContentItem::new("rss", "rssItem", "a", Utc::now());
        let mut no_id = ContentItem::new("rss", "rssItem", "b", Utc::now());
        no_id.content_id = None;

        assert_eq!(
            store
                .save_content_items(&[item.clone(), item.clone(), no_id])
                .await
                .unwrap(),
            2
        );
        assert_eq!(store.content_items().await.len(), 1);
    }

    #[tokio::test]
    async fn terminal_jobs_are_absorbing() {
        let store = MemoryStorage::new();
        let job = JobRecord::pending(JobId::new(), "cfg", JobType::Continuous);
        store.create_job(&job).await.unwrap();
        assert!(store.start_job(&job.id).await.unwrap());
        assert!(store.cancel_job(&job.id, "entitlement lapsed").await.unwrap());
        assert!(!store.complete_job(&job.id).await.unwrap());

        store
            .record_continuous_tick(&job.id, &TickUsage::default())
            .await
            .unwrap();
        let loaded = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Cancelled);
        assert_eq!(loaded.usage.ticks, 1);
        assert!(store.get_running_jobs().await.unwrap().is_empty());
    }
}
