// 任务台账：PENDING 创建、状态迁移与归属查询。
use crate::state_machine::JobStatus;
use crate::storage::{JobRecord, StorageBackend};
use anyhow::{anyhow, Result};
use std::sync::Arc;
use uuid::Uuid;

pub struct JobLedger {
    storage: Arc<dyn StorageBackend>,
}

impl JobLedger {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    /// Creation always starts at PENDING; the job id is minted here, never
    /// by the submitting request.
    pub fn create_pending(&self, user_id: &str, job_type: &str) -> Result<JobRecord> {
        let now = now_ts();
        let record = JobRecord {
            job_id: format!("job_{}", Uuid::new_v4().simple()),
            user_id: user_id.trim().to_string(),
            job_type: job_type.trim().to_string(),
            status: JobStatus::Pending,
            error: String::new(),
            created_at: now,
            updated_at: now,
        };
        self.storage.insert_job(&record)?;
        Ok(record)
    }

    /// PENDING → RUNNING; reports whether the row changed. A repeat call is
    /// a no-op, which keeps redelivered dispatches harmless.
    pub fn start(&self, job_id: &str) -> Result<bool> {
        self.storage.transition_job(job_id, JobStatus::Running, "")
    }

    /// RUNNING → SUCCEEDED/FAILED. Terminal states are absorbing, so a late
    /// or duplicate completion signal changes nothing.
    pub fn finish(&self, job_id: &str, status: JobStatus, error: &str) -> Result<bool> {
        if !status.is_terminal() {
            return Err(anyhow!("finish requires a terminal status"));
        }
        self.storage.transition_job(job_id, status, error)
    }

    pub fn get(&self, job_id: &str) -> Result<Option<JobRecord>> {
        self.storage.get_job(job_id)
    }

    /// Ownership-filtered read: non-privileged requesters get the same
    /// `None` for "does not exist" and "exists but not owned", so job ids
    /// cannot be probed for existence.
    pub fn query_for(
        &self,
        job_id: &str,
        requester_id: &str,
        privileged: bool,
    ) -> Result<Option<JobRecord>> {
        let Some(job) = self.storage.get_job(job_id)? else {
            return Ok(None);
        };
        if !privileged && job.user_id != requester_id {
            return Ok(None);
        }
        Ok(Some(job))
    }

    pub fn list_stale_pending(&self, older_than: f64, limit: i64) -> Result<Vec<JobRecord>> {
        self.storage.list_stale_pending_jobs(older_than, limit)
    }
}

fn now_ts() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}
