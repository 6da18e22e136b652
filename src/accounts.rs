// Site-account directory: user-owned third-party credentials, resolved by
// (site, account_name) selector. Credential blobs never touch storage in
// plain text.
use crate::queue::AccountSelector;
use crate::storage::{SiteAccountRecord, StorageBackend};
use crate::vault::SecretVault;
use anyhow::{anyhow, Result};
use serde_json::Value;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

pub struct AccountStore {
    storage: Arc<dyn StorageBackend>,
    vault: Arc<SecretVault>,
}

impl AccountStore {
    pub fn new(storage: Arc<dyn StorageBackend>, vault: Arc<SecretVault>) -> Self {
        Self { storage, vault }
    }

    pub fn create(
        &self,
        user_id: &str,
        site: &str,
        account_name: &str,
        secrets: &Value,
        meta: Option<Value>,
    ) -> Result<SiteAccountRecord> {
        let site = site.trim();
        let account_name = account_name.trim();
        if site.is_empty() || account_name.is_empty() {
            return Err(anyhow!("site and account_name are required"));
        }
        let record = SiteAccountRecord {
            account_id: format!("acc_{}", Uuid::new_v4().simple()),
            user_id: user_id.trim().to_string(),
            site: site.to_string(),
            account_name: account_name.to_string(),
            secret_encrypted: self.vault.encrypt_json(secrets)?,
            meta,
            created_at: now_ts(),
        };
        self.storage.insert_site_account(&record)?;
        info!(
            "account created: {} {}/{} for user {}",
            record.account_id, record.site, record.account_name, record.user_id
        );
        Ok(record)
    }

    pub fn list(&self, user_id: &str, site: Option<&str>) -> Result<Vec<SiteAccountRecord>> {
        self.storage.list_site_accounts(user_id, site)
    }

    pub fn resolve(&self, user_id: &str, selector: &AccountSelector) -> Result<SiteAccountRecord> {
        self.storage
            .get_site_account(user_id, &selector.site, &selector.account_name)?
            .ok_or_else(|| anyhow!("account_not_found"))
    }

    pub fn credentials(&self, record: &SiteAccountRecord) -> Result<Value> {
        self.vault.decrypt_json(&record.secret_encrypted)
    }
}

fn now_ts() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}
