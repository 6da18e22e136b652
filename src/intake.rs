// 命令接入：先校验、再按 (user_id, idempotency_key) 原子去重，最多创建一个任务。
use crate::dispatcher::Dispatcher;
use crate::jobs::JobLedger;
use crate::queue::{AccountSelector, DispatchRequest, JobQueue};
use crate::storage::{CommandInsertOutcome, CommandRequestRecord, StorageBackend};
use anyhow::{anyhow, Result};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::info;
use uuid::Uuid;

/// Flat command types that predate the `site.action` scheme. They carry no
/// account selector and are scheduled directly instead of queued.
const LEGACY_COMMANDS: &[&str] = &["IMPORT_CUSTOMERS"];

// Bounded backoff for the race window where a concurrent winner has
// inserted the request row but not yet linked its job id.
const LINK_READ_RETRIES: usize = 5;
const LINK_READ_BACKOFF: Duration = Duration::from_millis(40);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandKind {
    Site { site: String, action: String },
    Legacy(&'static str),
}

pub fn parse_command_type(raw: &str) -> Option<CommandKind> {
    let cleaned = raw.trim();
    if cleaned.is_empty() {
        return None;
    }
    if let Some((site, action)) = cleaned.split_once('.') {
        let site = site.trim();
        let action = action.trim();
        if site.is_empty() || action.is_empty() {
            return None;
        }
        return Some(CommandKind::Site {
            site: site.to_string(),
            action: action.to_string(),
        });
    }
    LEGACY_COMMANDS
        .iter()
        .copied()
        .find(|known| *known == cleaned)
        .map(CommandKind::Legacy)
}

#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub user_id: String,
    pub idempotency_key: String,
    pub command_type: String,
    pub payload: Value,
    pub account_selector: Option<AccountSelector>,
}

/// Expected branches of `submit`; `Err` is reserved for storage faults.
#[derive(Debug, Clone)]
pub enum SubmitOutcome {
    /// This caller won the insert; a fresh PENDING job was created and
    /// scheduled.
    Accepted { job_id: String },
    /// Idempotent hit: the key already resolved to a job. No new job, no
    /// re-enqueue.
    Duplicate { job_id: String },
    /// A concurrent winner holds the key but has not linked its job yet.
    /// The caller may retry; a second job is never created.
    NotLinkedYet,
    UnknownType(String),
    MissingSelector(String),
}

pub struct CommandIntake {
    storage: Arc<dyn StorageBackend>,
    ledger: Arc<JobLedger>,
    queue: JobQueue,
    dispatcher: Arc<Dispatcher>,
}

impl CommandIntake {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        ledger: Arc<JobLedger>,
        queue: JobQueue,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Self {
            storage,
            ledger,
            queue,
            dispatcher,
        }
    }

    pub async fn submit(&self, request: SubmitRequest) -> Result<SubmitOutcome> {
        // Validation happens before any row exists, so rejected submissions
        // leave no trace.
        let Some(kind) = parse_command_type(&request.command_type) else {
            return Ok(SubmitOutcome::UnknownType(request.command_type));
        };
        if matches!(kind, CommandKind::Site { .. }) && request.account_selector.is_none() {
            return Ok(SubmitOutcome::MissingSelector(request.command_type));
        }

        let selector_value = request
            .account_selector
            .as_ref()
            .map(|selector| serde_json::to_value(selector))
            .transpose()?;
        let record = CommandRequestRecord {
            request_id: format!("cmd_{}", Uuid::new_v4().simple()),
            user_id: request.user_id.trim().to_string(),
            idempotency_key: request.idempotency_key.trim().to_string(),
            cmd_type: request.command_type.trim().to_string(),
            payload: request.payload.clone(),
            account_selector: selector_value,
            job_id: None,
            created_at: now_ts(),
        };

        match self.storage.try_insert_command_request(&record)? {
            CommandInsertOutcome::Inserted => {
                let job = self
                    .ledger
                    .create_pending(&record.user_id, &record.cmd_type)?;
                self.storage.link_command_job(
                    &record.user_id,
                    &record.idempotency_key,
                    &job.job_id,
                )?;
                info!(
                    "command accepted: job {} type {} for user {}",
                    job.job_id, record.cmd_type, record.user_id
                );
                self.schedule(kind, &job.job_id, &record.user_id, &request)?;
                Ok(SubmitOutcome::Accepted { job_id: job.job_id })
            }
            CommandInsertOutcome::Conflict => {
                for attempt in 0..LINK_READ_RETRIES {
                    let existing = self
                        .storage
                        .get_command_request(&record.user_id, &record.idempotency_key)?
                        .ok_or_else(|| {
                            anyhow!("command request vanished after uniqueness conflict")
                        })?;
                    if let Some(job_id) = existing.job_id {
                        info!(
                            "idempotent hit: key {} already resolved to job {job_id}",
                            record.idempotency_key
                        );
                        return Ok(SubmitOutcome::Duplicate { job_id });
                    }
                    if attempt + 1 < LINK_READ_RETRIES {
                        sleep(LINK_READ_BACKOFF).await;
                    }
                }
                Ok(SubmitOutcome::NotLinkedYet)
            }
        }
    }

    fn schedule(
        &self,
        kind: CommandKind,
        job_id: &str,
        user_id: &str,
        request: &SubmitRequest,
    ) -> Result<()> {
        match kind {
            CommandKind::Site { site, action } => {
                let selector = request
                    .account_selector
                    .clone()
                    .ok_or_else(|| anyhow!("structured command lost its account selector"))?;
                self.queue.enqueue(DispatchRequest {
                    job_id: job_id.to_string(),
                    user_id: user_id.to_string(),
                    site,
                    action,
                    account_selector: selector,
                    payload: request.payload.clone(),
                })
            }
            CommandKind::Legacy(_) => {
                let dispatcher = self.dispatcher.clone();
                let job_id = job_id.to_string();
                let user_id = user_id.to_string();
                tokio::spawn(async move {
                    dispatcher.run_import_customers(&job_id, &user_id).await;
                });
                Ok(())
            }
        }
    }
}

fn now_ts() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_structured_command_type() {
        assert_eq!(
            parse_command_type("demo.fetch_profile"),
            Some(CommandKind::Site {
                site: "demo".to_string(),
                action: "fetch_profile".to_string(),
            })
        );
    }

    #[test]
    fn parse_legacy_command_type() {
        assert_eq!(
            parse_command_type("IMPORT_CUSTOMERS"),
            Some(CommandKind::Legacy("IMPORT_CUSTOMERS"))
        );
    }

    #[test]
    fn parse_rejects_unknown_and_malformed_types() {
        assert_eq!(parse_command_type("EXPORT_CUSTOMERS"), None);
        assert_eq!(parse_command_type(""), None);
        assert_eq!(parse_command_type("demo."), None);
        assert_eq!(parse_command_type(".fetch_profile"), None);
    }
}
