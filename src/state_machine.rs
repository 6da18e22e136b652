// 任务状态机：约束 PENDING→RUNNING→SUCCEEDED/FAILED 的有序迁移。
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Succeeded => "SUCCEEDED",
            JobStatus::Failed => "FAILED",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Some(JobStatus::Pending),
            "RUNNING" => Some(JobStatus::Running),
            "SUCCEEDED" => Some(JobStatus::Succeeded),
            "FAILED" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

pub fn can_transit(src: JobStatus, dst: JobStatus) -> bool {
    valid_sources(dst).contains(&src)
}

/// Source states from which `target` may be entered. Creation always starts
/// at PENDING, so PENDING itself has no valid sources.
pub fn valid_sources(target: JobStatus) -> &'static [JobStatus] {
    match target {
        JobStatus::Pending => &[],
        JobStatus::Running => &[JobStatus::Pending],
        JobStatus::Succeeded | JobStatus::Failed => &[JobStatus::Running],
    }
}
