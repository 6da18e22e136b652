// 全局状态：存储、加密、注册表与调度器在此装配。
use crate::accounts::AccountStore;
use crate::config::Config;
use crate::connectors::{build_default_connector_registry, ConnectorRegistry};
use crate::dispatcher::{spawn_pending_sweep, Dispatcher};
use crate::intake::CommandIntake;
use crate::jobs::JobLedger;
use crate::queue::{spawn_dispatch_workers, JobQueue};
use crate::sessions::SessionService;
use crate::storage::{build_storage, StorageBackend};
use crate::user_store::UserStore;
use crate::vault::SecretVault;
use anyhow::Result;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub storage: Arc<dyn StorageBackend>,
    pub vault: Arc<SecretVault>,
    pub user_store: Arc<UserStore>,
    pub accounts: Arc<AccountStore>,
    pub jobs: Arc<JobLedger>,
    pub sessions: Arc<SessionService>,
    pub connectors: ConnectorRegistry,
    pub intake: Arc<CommandIntake>,
    pub dispatcher: Arc<Dispatcher>,
    pub http: reqwest::Client,
}

impl AppState {
    /// Wires every service and spawns the dispatch workers plus the
    /// stale-PENDING sweep. Must run inside a tokio runtime.
    pub fn new(config: Config) -> Result<Self> {
        let storage = build_storage(&config.storage)?;
        storage.ensure_initialized()?;

        let vault = Arc::new(SecretVault::new(&config.security.secret_key));
        let user_store = Arc::new(UserStore::new(
            storage.clone(),
            config.security.token_ttl_s,
        ));
        let accounts = Arc::new(AccountStore::new(storage.clone(), vault.clone()));
        let jobs = Arc::new(JobLedger::new(storage.clone()));
        let sessions = Arc::new(SessionService::new(
            storage.clone(),
            vault.clone(),
            config.session.ttl_s,
        ));
        let connectors = build_default_connector_registry();
        let http = reqwest::Client::new();

        let dispatcher = Arc::new(Dispatcher::new(
            jobs.clone(),
            accounts.clone(),
            sessions.clone(),
            connectors.clone(),
            http.clone(),
        ));
        let (queue, receiver) = JobQueue::channel();
        spawn_dispatch_workers(receiver, dispatcher.clone(), config.dispatch.workers);
        spawn_pending_sweep(
            dispatcher.clone(),
            storage.clone(),
            queue.clone(),
            config.dispatch.requeue_after_s,
            config.dispatch.sweep_interval_s,
        );
        let intake = Arc::new(CommandIntake::new(
            storage.clone(),
            jobs.clone(),
            queue,
            dispatcher.clone(),
        ));

        Ok(Self {
            config,
            storage,
            vault,
            user_store,
            accounts,
            jobs,
            sessions,
            connectors,
            intake,
            dispatcher,
            http,
        })
    }
}
