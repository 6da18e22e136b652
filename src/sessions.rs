// 会话复用：优先使用未过期的 ACTIVE 会话，失效时走连接器登录并落库。
use crate::connectors::{LoginContext, SessionHandle, SiteConnector};
use crate::storage::{SiteAccountRecord, SiteSessionRecord, StorageBackend, SESSION_STATUS_ACTIVE};
use crate::vault::SecretVault;
use anyhow::{anyhow, Result};
use dashmap::DashMap;
use reqwest::Client;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

/// Expected branches of `ensure_session`. `Err` is reserved for storage and
/// crypto faults.
#[derive(Debug, Clone)]
pub enum SessionOutcome {
    Ready(SessionHandle),
    UserActionRequired,
    LoginFailed(String),
}

pub struct SessionService {
    storage: Arc<dyn StorageBackend>,
    vault: Arc<SecretVault>,
    ttl_s: i64,
    // One login at a time per account; rows stay append-only either way,
    // the lock just avoids redundant logins under concurrent dispatches.
    login_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl SessionService {
    pub fn new(storage: Arc<dyn StorageBackend>, vault: Arc<SecretVault>, ttl_s: i64) -> Self {
        Self {
            storage,
            vault,
            ttl_s,
            login_locks: DashMap::new(),
        }
    }

    pub async fn ensure_session(
        &self,
        http: &Client,
        account: &SiteAccountRecord,
        credentials: &serde_json::Value,
        connector: &dyn SiteConnector,
    ) -> Result<SessionOutcome> {
        if let Some(session) = self.cached_session(&account.account_id)? {
            return Ok(SessionOutcome::Ready(session));
        }

        let lock = self
            .login_locks
            .entry(account.account_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // Another dispatch may have logged in while we waited for the lock.
        if let Some(session) = self.cached_session(&account.account_id)? {
            return Ok(SessionOutcome::Ready(session));
        }

        info!("session miss, logging in account {}", account.account_id);
        let outcome = connector
            .login(LoginContext {
                http,
                account,
                credentials,
            })
            .await?;
        if outcome.needs_user_action {
            return Ok(SessionOutcome::UserActionRequired);
        }
        if !outcome.ok {
            return Ok(SessionOutcome::LoginFailed(outcome.error));
        }
        let session = outcome
            .session
            .ok_or_else(|| anyhow!("connector reported login ok without session material"))?;

        let now = now_ts();
        let expires_at = if self.ttl_s > 0 {
            Some(now + self.ttl_s as f64)
        } else {
            None
        };
        let record = SiteSessionRecord {
            session_id: format!("sess_{}", Uuid::new_v4().simple()),
            account_id: account.account_id.clone(),
            data_encrypted: self.vault.encrypt_json(&session.to_value())?,
            status: SESSION_STATUS_ACTIVE.to_string(),
            expires_at,
            created_at: now,
            updated_at: now,
        };
        self.storage.insert_site_session(&record)?;
        info!(
            "session saved for account {}: {}",
            account.account_id, record.session_id
        );
        Ok(SessionOutcome::Ready(session))
    }

    fn cached_session(&self, account_id: &str) -> Result<Option<SessionHandle>> {
        let Some(row) = self.storage.latest_active_session(account_id)? else {
            return Ok(None);
        };
        match self.vault.decrypt_json(&row.data_encrypted) {
            Ok(value) => {
                info!("session hit for account {account_id}: {}", row.session_id);
                Ok(Some(SessionHandle::from_value(&value)))
            }
            Err(err) => {
                // Undecryptable rows (key rotation, corruption) fall through
                // to a fresh login instead of poisoning the account.
                warn!(
                    "discarding undecryptable session {} for account {account_id}: {err}",
                    row.session_id
                );
                Ok(None)
            }
        }
    }
}

fn now_ts() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}
