// 存储模块：封装 SQLite 持久化读写，提供账户/会话/命令/任务的统一接口。

mod sqlite;

use crate::config::StorageConfig;
use crate::state_machine::JobStatus;
use anyhow::{anyhow, Result};
use serde_json::Value;
use std::sync::Arc;

pub use sqlite::SqliteStorage;

#[derive(Debug, Clone)]
pub struct UserAccountRecord {
    pub user_id: String,
    pub username: String,
    pub password_hash: String,
    pub roles: Vec<String>,
    pub status: String,
    pub created_at: f64,
    pub updated_at: f64,
    pub last_login_at: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct UserTokenRecord {
    pub token: String,
    pub user_id: String,
    pub expires_at: f64,
    pub created_at: f64,
    pub last_used_at: f64,
}

/// Credentials a user registered for one third-party site. Immutable after
/// creation; the `(user_id, site, account_name)` tuple is unique.
#[derive(Debug, Clone)]
pub struct SiteAccountRecord {
    pub account_id: String,
    pub user_id: String,
    pub site: String,
    pub account_name: String,
    pub secret_encrypted: String,
    pub meta: Option<Value>,
    pub created_at: f64,
}

/// One login's worth of reusable session material. Rows are append-only
/// history; only the most recently updated ACTIVE, unexpired row is live.
#[derive(Debug, Clone)]
pub struct SiteSessionRecord {
    pub session_id: String,
    pub account_id: String,
    pub data_encrypted: String,
    pub status: String,
    pub expires_at: Option<f64>,
    pub created_at: f64,
    pub updated_at: f64,
}

pub const SESSION_STATUS_ACTIVE: &str = "ACTIVE";

#[derive(Debug, Clone)]
pub struct CommandRequestRecord {
    pub request_id: String,
    pub user_id: String,
    pub idempotency_key: String,
    pub cmd_type: String,
    pub payload: Value,
    pub account_selector: Option<Value>,
    pub job_id: Option<String>,
    pub created_at: f64,
}

#[derive(Debug, Clone)]
pub struct JobRecord {
    pub job_id: String,
    pub user_id: String,
    pub job_type: String,
    pub status: JobStatus,
    pub error: String,
    pub created_at: f64,
    pub updated_at: f64,
}

/// Result of the atomic command-request insert. `Conflict` means another
/// submission with the same `(user_id, idempotency_key)` got there first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandInsertOutcome {
    Inserted,
    Conflict,
}

pub trait StorageBackend: Send + Sync {
    fn ensure_initialized(&self) -> Result<()>;

    fn upsert_user_account(&self, record: &UserAccountRecord) -> Result<()>;
    fn get_user_account(&self, user_id: &str) -> Result<Option<UserAccountRecord>>;
    fn get_user_account_by_username(&self, username: &str) -> Result<Option<UserAccountRecord>>;

    fn create_user_token(&self, record: &UserTokenRecord) -> Result<()>;
    fn get_user_token(&self, token: &str) -> Result<Option<UserTokenRecord>>;
    fn touch_user_token(&self, token: &str, last_used_at: f64) -> Result<()>;
    fn delete_user_token(&self, token: &str) -> Result<i64>;

    /// Duplicate `(user_id, site, account_name)` tuples are a caller error
    /// and surface as `Err`.
    fn insert_site_account(&self, record: &SiteAccountRecord) -> Result<()>;
    fn get_site_account(
        &self,
        user_id: &str,
        site: &str,
        account_name: &str,
    ) -> Result<Option<SiteAccountRecord>>;
    fn list_site_accounts(
        &self,
        user_id: &str,
        site: Option<&str>,
    ) -> Result<Vec<SiteAccountRecord>>;

    fn insert_site_session(&self, record: &SiteSessionRecord) -> Result<()>;
    /// Most recently updated ACTIVE session whose expiry is strictly in the
    /// future (or absent).
    fn latest_active_session(&self, account_id: &str) -> Result<Option<SiteSessionRecord>>;

    fn try_insert_command_request(
        &self,
        record: &CommandRequestRecord,
    ) -> Result<CommandInsertOutcome>;
    fn get_command_request(
        &self,
        user_id: &str,
        idempotency_key: &str,
    ) -> Result<Option<CommandRequestRecord>>;
    fn get_command_request_by_job(&self, job_id: &str) -> Result<Option<CommandRequestRecord>>;
    fn link_command_job(&self, user_id: &str, idempotency_key: &str, job_id: &str) -> Result<()>;

    fn insert_job(&self, record: &JobRecord) -> Result<()>;
    fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>>;
    /// Apply `target` only if the current status is a valid source per the
    /// transition table; reports whether the row changed. Invalid requests
    /// are silent no-ops so duplicate completion signals stay harmless.
    fn transition_job(&self, job_id: &str, target: JobStatus, error: &str) -> Result<bool>;
    fn list_stale_pending_jobs(&self, older_than: f64, limit: i64) -> Result<Vec<JobRecord>>;
}

/// 构建存储后端，根据 backend 配置选择实现。
pub fn build_storage(config: &StorageConfig) -> Result<Arc<dyn StorageBackend>> {
    let backend = config.backend.trim().to_lowercase();
    let backend = if backend.is_empty() {
        "sqlite".to_string()
    } else {
        backend
    };
    match backend.as_str() {
        "sqlite" | "default" => Ok(Arc::new(SqliteStorage::new(
            config.db_path.trim().to_string(),
        ))),
        other => Err(anyhow!("unknown storage backend: {other}")),
    }
}
