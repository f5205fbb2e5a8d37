//! Extraction job table with retention and a hard cap.

use chrono::{DateTime, Utc};
use recall_extract::ExtractionOutcome;
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExtractJob {
    pub job_id: String,
    pub status: JobStatus,
    pub source: String,
    pub context: String,
    pub message_length: usize,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_depth: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ExtractionOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
}

impl ExtractJob {
    fn finished(&self) -> bool {
        matches!(self.status, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Opaque 128-bit random job id, hex encoded.
pub fn new_job_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

pub struct JobStore {
    retention_sec: i64,
    max_jobs: usize,
    jobs: Mutex<HashMap<String, ExtractJob>>,
}

impl JobStore {
    pub fn new(retention_sec: u64, max_jobs: usize) -> Self {
        Self {
            retention_sec: retention_sec as i64,
            max_jobs,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    pub async fn insert_queued(
        &self,
        job_id: &str,
        source: &str,
        context: &str,
        message_length: usize,
    ) {
        let mut jobs = self.jobs.lock().await;
        jobs.insert(
            job_id.to_string(),
            ExtractJob {
                job_id: job_id.to_string(),
                status: JobStatus::Queued,
                source: source.to_string(),
                context: context.to_string(),
                message_length,
                created_at: Utc::now(),
                started_at: None,
                completed_at: None,
                queue_depth: None,
                result: None,
                error: None,
                mode: None,
            },
        );
    }

    pub async fn remove(&self, job_id: &str) {
        self.jobs.lock().await.remove(job_id);
    }

    pub async fn get(&self, job_id: &str) -> Option<ExtractJob> {
        self.jobs.lock().await.get(job_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.jobs.lock().await.len()
    }

    pub async fn mark_running(&self, job_id: &str, queue_depth: usize) {
        let mut jobs = self.jobs.lock().await;
        if let Some(job) = jobs.get_mut(job_id) {
            job.status = JobStatus::Running;
            job.started_at = Some(Utc::now());
            job.queue_depth = Some(queue_depth);
        }
    }

    pub async fn mark_completed(&self, job_id: &str, result: ExtractionOutcome) {
        let mut jobs = self.jobs.lock().await;
        if let Some(job) = jobs.get_mut(job_id) {
            job.status = JobStatus::Completed;
            job.completed_at = Some(Utc::now());
            job.result = Some(result);
        }
    }

    pub async fn mark_failed(&self, job_id: &str, error: String) {
        let mut jobs = self.jobs.lock().await;
        if let Some(job) = jobs.get_mut(job_id) {
            job.status = JobStatus::Failed;
            job.completed_at = Some(Utc::now());
            job.error = Some(error);
        }
    }

    pub async fn set_mode(&self, job_id: &str, mode: &str) {
        let mut jobs = self.jobs.lock().await;
        if let Some(job) = jobs.get_mut(job_id) {
            job.mode = Some(mode.to_string());
            if job.started_at.is_none() {
                job.started_at = Some(Utc::now());
                job.status = JobStatus::Running;
            }
        }
    }

    /// Drop finished jobs past the retention window, then enforce the hard
    /// cap by evicting the oldest finished jobs.
    pub async fn trim_finished(&self) {
        let mut jobs = self.jobs.lock().await;
        let cutoff = Utc::now() - chrono::Duration::seconds(self.retention_sec);
        jobs.retain(|_, job| {
            !job.finished() || job.completed_at.is_none_or(|at| at >= cutoff)
        });

        if jobs.len() > self.max_jobs {
            let mut finished: Vec<(String, DateTime<Utc>)> = jobs
                .values()
                .filter(|job| job.finished())
                .map(|job| (job.job_id.clone(), job.completed_at.unwrap_or(job.created_at)))
                .collect();
            finished.sort_by_key(|(_, at)| *at);
            let to_evict = jobs.len() - self.max_jobs;
            for (job_id, _) in finished.into_iter().take(to_evict) {
                jobs.remove(&job_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_ids_are_128_bit_hex() {
        let id = new_job_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, new_job_id());
    }

    #[tokio::test]
    async fn test_job_lifecycle() {
        let store = JobStore::new(300, 10);
        store.insert_queued("j1", "src", "stop", 42).await;

        store.mark_running("j1", 3).await;
        let job = store.get("j1").await.unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.queue_depth, Some(3));
        assert!(job.started_at.is_some());

        store
            .mark_completed("j1", ExtractionOutcome::default())
            .await;
        let job = store.get("j1").await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.result.is_some());
    }

    #[tokio::test]
    async fn test_retention_drops_old_finished_jobs() {
        let store = JobStore::new(60, 10);
        store.insert_queued("old", "s", "stop", 1).await;
        store.mark_failed("old", "boom".to_string()).await;
        {
            let mut jobs = store.jobs.lock().await;
            jobs.get_mut("old").unwrap().completed_at =
                Some(Utc::now() - chrono::Duration::seconds(120));
        }
        store.insert_queued("fresh", "s", "stop", 1).await;

        store.trim_finished().await;
        assert!(store.get("old").await.is_none());
        assert!(store.get("fresh").await.is_some());
    }

    #[tokio::test]
    async fn test_cap_evicts_oldest_finished() {
        let store = JobStore::new(3600, 2);
        for i in 0..4 {
            let id = format!("j{i}");
            store.insert_queued(&id, "s", "stop", 1).await;
            store
                .mark_completed(&id, ExtractionOutcome::default())
                .await;
        }
        store.trim_finished().await;
        assert_eq!(store.len().await, 2);
        // The most recently finished jobs survive.
        assert!(store.get("j3").await.is_some());
    }

    #[tokio::test]
    async fn test_running_jobs_never_evicted_by_retention() {
        let store = JobStore::new(60, 10);
        store.insert_queued("run", "s", "stop", 1).await;
        store.mark_running("run", 0).await;
        store.trim_finished().await;
        assert!(store.get("run").await.is_some());
    }
}
