// SQLite 存储实现：WAL 模式，每次调用独立连接，约束冲突由错误码识别。
use crate::state_machine::{self, JobStatus};
use crate::storage::{
    CommandInsertOutcome, CommandRequestRecord, JobRecord, SiteAccountRecord, SiteSessionRecord,
    StorageBackend, UserAccountRecord, UserTokenRecord,
};
use anyhow::{anyhow, Result};
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, ErrorCode, OptionalExtension};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

pub struct SqliteStorage {
    db_path: PathBuf,
    initialized: AtomicBool,
    init_guard: Mutex<()>,
}

impl SqliteStorage {
    pub fn new(db_path: String) -> Self {
        let path = if db_path.trim().is_empty() {
            PathBuf::from("./data/courier.db")
        } else {
            PathBuf::from(db_path)
        };
        Self {
            db_path: path,
            initialized: AtomicBool::new(false),
            init_guard: Mutex::new(()),
        }
    }

    fn ensure_db_dir(&self) -> Result<()> {
        if let Some(parent) = self.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    fn open(&self) -> Result<Connection> {
        self.ensure_db_dir()?;
        let conn = Connection::open(&self.db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.busy_timeout(Duration::from_secs(5)).ok();
        Ok(conn)
    }

    fn now_ts() -> f64 {
        Utc::now().timestamp_millis() as f64 / 1000.0
    }

    fn json_to_string(value: &Value) -> String {
        serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
    }

    fn json_from_str(text: &str) -> Option<Value> {
        if text.trim().is_empty() {
            return None;
        }
        serde_json::from_str::<Value>(text).ok()
    }

    fn parse_string_list(value: Option<String>) -> Vec<String> {
        let Some(raw) = value else {
            return Vec::new();
        };
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Vec::new();
        }
        if let Ok(items) = serde_json::from_str::<Vec<String>>(trimmed) {
            return items
                .into_iter()
                .map(|item| item.trim().to_string())
                .filter(|item| !item.is_empty())
                .collect();
        }
        trimmed
            .split(',')
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect()
    }

    fn string_list_to_json(list: &[String]) -> String {
        serde_json::to_string(list).unwrap_or_else(|_| "[]".to_string())
    }

    fn is_constraint_violation(err: &rusqlite::Error) -> bool {
        matches!(
            err,
            rusqlite::Error::SqliteFailure(failure, _)
                if matches!(failure.code, ErrorCode::ConstraintViolation)
        )
    }
}

type RawJobRow = (String, String, String, String, String, f64, f64);

fn job_from_row(row: RawJobRow) -> Result<JobRecord> {
    let (job_id, user_id, job_type, status, error, created_at, updated_at) = row;
    let status = JobStatus::parse(&status)
        .ok_or_else(|| anyhow!("unknown job status in storage: {status}"))?;
    Ok(JobRecord {
        job_id,
        user_id,
        job_type,
        status,
        error,
        created_at,
        updated_at,
    })
}

const JOB_COLUMNS: &str = "job_id, user_id, job_type, status, error, created_at, updated_at";

impl StorageBackend for SqliteStorage {
    fn ensure_initialized(&self) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        let _guard = self.init_guard.lock();
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        let conn = self.open()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS users (
              user_id TEXT PRIMARY KEY,
              username TEXT NOT NULL UNIQUE,
              password_hash TEXT NOT NULL,
              roles TEXT NOT NULL,
              status TEXT NOT NULL,
              created_at REAL NOT NULL,
              updated_at REAL NOT NULL,
              last_login_at REAL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_users_username
              ON users (username);
            CREATE TABLE IF NOT EXISTS user_tokens (
              token TEXT PRIMARY KEY,
              user_id TEXT NOT NULL,
              expires_at REAL NOT NULL,
              created_at REAL NOT NULL,
              last_used_at REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_user_tokens_user
              ON user_tokens (user_id);
            CREATE INDEX IF NOT EXISTS idx_user_tokens_expires
              ON user_tokens (expires_at);
            CREATE TABLE IF NOT EXISTS site_accounts (
              account_id TEXT PRIMARY KEY,
              user_id TEXT NOT NULL,
              site TEXT NOT NULL,
              account_name TEXT NOT NULL,
              secret_encrypted TEXT NOT NULL,
              meta TEXT,
              created_at REAL NOT NULL,
              UNIQUE (user_id, site, account_name)
            );
            CREATE INDEX IF NOT EXISTS idx_site_accounts_user
              ON site_accounts (user_id, site);
            CREATE TABLE IF NOT EXISTS site_sessions (
              session_id TEXT PRIMARY KEY,
              account_id TEXT NOT NULL,
              data_encrypted TEXT NOT NULL,
              status TEXT NOT NULL,
              expires_at REAL,
              created_at REAL NOT NULL,
              updated_at REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_site_sessions_account
              ON site_sessions (account_id, updated_at);
            CREATE TABLE IF NOT EXISTS command_requests (
              request_id TEXT PRIMARY KEY,
              user_id TEXT NOT NULL,
              idempotency_key TEXT NOT NULL,
              cmd_type TEXT NOT NULL,
              payload TEXT NOT NULL,
              account_selector TEXT,
              job_id TEXT,
              created_at REAL NOT NULL,
              UNIQUE (user_id, idempotency_key)
            );
            CREATE INDEX IF NOT EXISTS idx_command_requests_job
              ON command_requests (job_id);
            CREATE TABLE IF NOT EXISTS jobs (
              job_id TEXT PRIMARY KEY,
              user_id TEXT NOT NULL,
              job_type TEXT NOT NULL,
              status TEXT NOT NULL,
              error TEXT NOT NULL DEFAULT '',
              created_at REAL NOT NULL,
              updated_at REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_user
              ON jobs (user_id);
            CREATE INDEX IF NOT EXISTS idx_jobs_status_updated
              ON jobs (status, updated_at);
            "#,
        )?;
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn upsert_user_account(&self, record: &UserAccountRecord) -> Result<()> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let roles = Self::string_list_to_json(&record.roles);
        conn.execute(
            "INSERT INTO users (user_id, username, password_hash, roles, status, created_at, updated_at, last_login_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(user_id) DO UPDATE SET username = excluded.username, password_hash = excluded.password_hash, \
             roles = excluded.roles, status = excluded.status, created_at = excluded.created_at, \
             updated_at = excluded.updated_at, last_login_at = excluded.last_login_at",
            params![
                record.user_id,
                record.username,
                record.password_hash,
                roles,
                record.status,
                record.created_at,
                record.updated_at,
                record.last_login_at
            ],
        )?;
        Ok(())
    }

    fn get_user_account(&self, user_id: &str) -> Result<Option<UserAccountRecord>> {
        self.ensure_initialized()?;
        let cleaned = user_id.trim();
        if cleaned.is_empty() {
            return Ok(None);
        }
        let conn = self.open()?;
        let row = conn
            .query_row(
                "SELECT user_id, username, password_hash, roles, status, created_at, updated_at, last_login_at \
                 FROM users WHERE user_id = ?",
                params![cleaned],
                |row| {
                    Ok(UserAccountRecord {
                        user_id: row.get(0)?,
                        username: row.get(1)?,
                        password_hash: row.get(2)?,
                        roles: Self::parse_string_list(row.get::<_, Option<String>>(3)?),
                        status: row.get(4)?,
                        created_at: row.get(5)?,
                        updated_at: row.get(6)?,
                        last_login_at: row.get(7)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    fn get_user_account_by_username(&self, username: &str) -> Result<Option<UserAccountRecord>> {
        self.ensure_initialized()?;
        let cleaned = username.trim();
        if cleaned.is_empty() {
            return Ok(None);
        }
        let conn = self.open()?;
        let row = conn
            .query_row(
                "SELECT user_id, username, password_hash, roles, status, created_at, updated_at, last_login_at \
                 FROM users WHERE username = ?",
                params![cleaned],
                |row| {
                    Ok(UserAccountRecord {
                        user_id: row.get(0)?,
                        username: row.get(1)?,
                        password_hash: row.get(2)?,
                        roles: Self::parse_string_list(row.get::<_, Option<String>>(3)?),
                        status: row.get(4)?,
                        created_at: row.get(5)?,
                        updated_at: row.get(6)?,
                        last_login_at: row.get(7)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    fn create_user_token(&self, record: &UserTokenRecord) -> Result<()> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO user_tokens (token, user_id, expires_at, created_at, last_used_at) VALUES (?, ?, ?, ?, ?)",
            params![
                record.token,
                record.user_id,
                record.expires_at,
                record.created_at,
                record.last_used_at
            ],
        )?;
        Ok(())
    }

    fn get_user_token(&self, token: &str) -> Result<Option<UserTokenRecord>> {
        self.ensure_initialized()?;
        let cleaned = token.trim();
        if cleaned.is_empty() {
            return Ok(None);
        }
        let conn = self.open()?;
        let row = conn
            .query_row(
                "SELECT token, user_id, expires_at, created_at, last_used_at FROM user_tokens WHERE token = ?",
                params![cleaned],
                |row| {
                    Ok(UserTokenRecord {
                        token: row.get(0)?,
                        user_id: row.get(1)?,
                        expires_at: row.get(2)?,
                        created_at: row.get(3)?,
                        last_used_at: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    fn touch_user_token(&self, token: &str, last_used_at: f64) -> Result<()> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        conn.execute(
            "UPDATE user_tokens SET last_used_at = ? WHERE token = ?",
            params![last_used_at, token.trim()],
        )?;
        Ok(())
    }

    fn delete_user_token(&self, token: &str) -> Result<i64> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let affected = conn.execute(
            "DELETE FROM user_tokens WHERE token = ?",
            params![token.trim()],
        )?;
        Ok(affected as i64)
    }

    fn insert_site_account(&self, record: &SiteAccountRecord) -> Result<()> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let meta = record.meta.as_ref().map(Self::json_to_string);
        let insert = conn.execute(
            "INSERT INTO site_accounts (account_id, user_id, site, account_name, secret_encrypted, meta, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                record.account_id,
                record.user_id,
                record.site,
                record.account_name,
                record.secret_encrypted,
                meta,
                record.created_at
            ],
        );
        match insert {
            Ok(_) => Ok(()),
            Err(err) if Self::is_constraint_violation(&err) => Err(anyhow!(
                "site account already exists: {}/{}",
                record.site,
                record.account_name
            )),
            Err(err) => Err(err.into()),
        }
    }

    fn get_site_account(
        &self,
        user_id: &str,
        site: &str,
        account_name: &str,
    ) -> Result<Option<SiteAccountRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let row = conn
            .query_row(
                "SELECT account_id, user_id, site, account_name, secret_encrypted, meta, created_at \
                 FROM site_accounts WHERE user_id = ? AND site = ? AND account_name = ?",
                params![user_id.trim(), site.trim(), account_name.trim()],
                |row| {
                    Ok(SiteAccountRecord {
                        account_id: row.get(0)?,
                        user_id: row.get(1)?,
                        site: row.get(2)?,
                        account_name: row.get(3)?,
                        secret_encrypted: row.get(4)?,
                        meta: row
                            .get::<_, Option<String>>(5)?
                            .as_deref()
                            .and_then(Self::json_from_str),
                        created_at: row.get(6)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    fn list_site_accounts(
        &self,
        user_id: &str,
        site: Option<&str>,
    ) -> Result<Vec<SiteAccountRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let mut sql = String::from(
            "SELECT account_id, user_id, site, account_name, secret_encrypted, meta, created_at \
             FROM site_accounts WHERE user_id = ?",
        );
        let mut args: Vec<SqlValue> = vec![SqlValue::Text(user_id.trim().to_string())];
        if let Some(site) = site.map(str::trim).filter(|value| !value.is_empty()) {
            sql.push_str(" AND site = ?");
            args.push(SqlValue::Text(site.to_string()));
        }
        sql.push_str(" ORDER BY created_at DESC");
        let mut statement = conn.prepare(&sql)?;
        let rows = statement.query_map(params_from_iter(args), |row| {
            Ok(SiteAccountRecord {
                account_id: row.get(0)?,
                user_id: row.get(1)?,
                site: row.get(2)?,
                account_name: row.get(3)?,
                secret_encrypted: row.get(4)?,
                meta: row
                    .get::<_, Option<String>>(5)?
                    .as_deref()
                    .and_then(Self::json_from_str),
                created_at: row.get(6)?,
            })
        })?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    fn insert_site_session(&self, record: &SiteSessionRecord) -> Result<()> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO site_sessions (session_id, account_id, data_encrypted, status, expires_at, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                record.session_id,
                record.account_id,
                record.data_encrypted,
                record.status,
                record.expires_at,
                record.created_at,
                record.updated_at
            ],
        )?;
        Ok(())
    }

    fn latest_active_session(&self, account_id: &str) -> Result<Option<SiteSessionRecord>> {
        self.ensure_initialized()?;
        let cleaned = account_id.trim();
        if cleaned.is_empty() {
            return Ok(None);
        }
        let now = Self::now_ts();
        let conn = self.open()?;
        let row = conn
            .query_row(
                "SELECT session_id, account_id, data_encrypted, status, expires_at, created_at, updated_at \
                 FROM site_sessions \
                 WHERE account_id = ? AND status = 'ACTIVE' AND (expires_at IS NULL OR expires_at > ?) \
                 ORDER BY updated_at DESC LIMIT 1",
                params![cleaned, now],
                |row| {
                    Ok(SiteSessionRecord {
                        session_id: row.get(0)?,
                        account_id: row.get(1)?,
                        data_encrypted: row.get(2)?,
                        status: row.get(3)?,
                        expires_at: row.get(4)?,
                        created_at: row.get(5)?,
                        updated_at: row.get(6)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    fn try_insert_command_request(
        &self,
        record: &CommandRequestRecord,
    ) -> Result<CommandInsertOutcome> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let payload = Self::json_to_string(&record.payload);
        let selector = record.account_selector.as_ref().map(Self::json_to_string);
        let insert = conn.execute(
            "INSERT INTO command_requests (request_id, user_id, idempotency_key, cmd_type, payload, account_selector, job_id, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                record.request_id,
                record.user_id,
                record.idempotency_key,
                record.cmd_type,
                payload,
                selector,
                record.job_id,
                record.created_at
            ],
        );
        match insert {
            Ok(_) => Ok(CommandInsertOutcome::Inserted),
            Err(err) if Self::is_constraint_violation(&err) => Ok(CommandInsertOutcome::Conflict),
            Err(err) => Err(err.into()),
        }
    }

    fn get_command_request(
        &self,
        user_id: &str,
        idempotency_key: &str,
    ) -> Result<Option<CommandRequestRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let row = conn
            .query_row(
                "SELECT request_id, user_id, idempotency_key, cmd_type, payload, account_selector, job_id, created_at \
                 FROM command_requests WHERE user_id = ? AND idempotency_key = ?",
                params![user_id.trim(), idempotency_key.trim()],
                command_request_from_row,
            )
            .optional()?;
        Ok(row)
    }

    fn get_command_request_by_job(&self, job_id: &str) -> Result<Option<CommandRequestRecord>> {
        self.ensure_initialized()?;
        let cleaned = job_id.trim();
        if cleaned.is_empty() {
            return Ok(None);
        }
        let conn = self.open()?;
        let row = conn
            .query_row(
                "SELECT request_id, user_id, idempotency_key, cmd_type, payload, account_selector, job_id, created_at \
                 FROM command_requests WHERE job_id = ?",
                params![cleaned],
                command_request_from_row,
            )
            .optional()?;
        Ok(row)
    }

    fn link_command_job(&self, user_id: &str, idempotency_key: &str, job_id: &str) -> Result<()> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        // job_id is attached exactly once; a second link attempt is a no-op.
        conn.execute(
            "UPDATE command_requests SET job_id = ? WHERE user_id = ? AND idempotency_key = ? AND job_id IS NULL",
            params![job_id, user_id.trim(), idempotency_key.trim()],
        )?;
        Ok(())
    }

    fn insert_job(&self, record: &JobRecord) -> Result<()> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO jobs (job_id, user_id, job_type, status, error, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                record.job_id,
                record.user_id,
                record.job_type,
                record.status.as_str(),
                record.error,
                record.created_at,
                record.updated_at
            ],
        )?;
        Ok(())
    }

    fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>> {
        self.ensure_initialized()?;
        let cleaned = job_id.trim();
        if cleaned.is_empty() {
            return Ok(None);
        }
        let conn = self.open()?;
        let row: Option<RawJobRow> = conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE job_id = ?"),
                params![cleaned],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                    ))
                },
            )
            .optional()?;
        row.map(job_from_row).transpose()
    }

    fn transition_job(&self, job_id: &str, target: JobStatus, error: &str) -> Result<bool> {
        self.ensure_initialized()?;
        let sources = state_machine::valid_sources(target);
        if sources.is_empty() {
            return Ok(false);
        }
        let placeholders = vec!["?"; sources.len()].join(", ");
        let sql = format!(
            "UPDATE jobs SET status = ?, error = ?, updated_at = ? WHERE job_id = ? AND status IN ({placeholders})"
        );
        let mut args: Vec<SqlValue> = vec![
            SqlValue::Text(target.as_str().to_string()),
            SqlValue::Text(error.to_string()),
            SqlValue::Real(Self::now_ts()),
            SqlValue::Text(job_id.trim().to_string()),
        ];
        for source in sources {
            args.push(SqlValue::Text(source.as_str().to_string()));
        }
        let conn = self.open()?;
        let affected = conn.execute(&sql, params_from_iter(args))?;
        Ok(affected > 0)
    }

    fn list_stale_pending_jobs(&self, older_than: f64, limit: i64) -> Result<Vec<JobRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let mut statement = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE status = 'PENDING' AND updated_at < ? \
             ORDER BY updated_at ASC LIMIT ?"
        ))?;
        let rows = statement.query_map(params![older_than, limit.max(1)], |row| {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
                row.get(6)?,
            ))
        })?;
        let mut records = Vec::new();
        for row in rows {
            records.push(job_from_row(row?)?);
        }
        Ok(records)
    }
}

fn command_request_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CommandRequestRecord> {
    Ok(CommandRequestRecord {
        request_id: row.get(0)?,
        user_id: row.get(1)?,
        idempotency_key: row.get(2)?,
        cmd_type: row.get(3)?,
        payload: row
            .get::<_, Option<String>>(4)?
            .as_deref()
            .and_then(SqliteStorage::json_from_str)
            .unwrap_or(Value::Null),
        account_selector: row
            .get::<_, Option<String>>(5)?
            .as_deref()
            .and_then(SqliteStorage::json_from_str),
        job_id: row.get(6)?,
        created_at: row.get(7)?,
    })
}
