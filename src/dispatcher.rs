// Worker 侧统一调度：解析账号 → 会话 → 调用连接器 → 驱动任务到终态。
use crate::accounts::AccountStore;
use crate::connectors::{ConnectorRegistry, PerformContext};
use crate::intake::{parse_command_type, CommandKind};
use crate::jobs::JobLedger;
use crate::queue::{AccountSelector, DispatchRequest, JobQueue};
use crate::sessions::{SessionOutcome, SessionService};
use crate::state_machine::JobStatus;
use crate::storage::StorageBackend;
use anyhow::{anyhow, Result};
use futures::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info, warn};

const SWEEP_BATCH: i64 = 100;

#[derive(Debug, Clone)]
pub struct DispatchResult {
    pub ok: bool,
    pub data: Value,
    pub error: String,
}

impl DispatchResult {
    fn succeeded(data: Value) -> Self {
        Self {
            ok: true,
            data,
            error: String::new(),
        }
    }

    fn failed(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: Value::Null,
            error: error.into(),
        }
    }
}

pub struct Dispatcher {
    ledger: Arc<JobLedger>,
    accounts: Arc<AccountStore>,
    sessions: Arc<SessionService>,
    registry: ConnectorRegistry,
    http: reqwest::Client,
}

impl Dispatcher {
    pub fn new(
        ledger: Arc<JobLedger>,
        accounts: Arc<AccountStore>,
        sessions: Arc<SessionService>,
        registry: ConnectorRegistry,
        http: reqwest::Client,
    ) -> Self {
        Self {
            ledger,
            accounts,
            sessions,
            registry,
            http,
        }
    }

    /// Run one dispatch attempt to a definite terminal job state. Nothing
    /// escapes this boundary: expected failures, unexpected faults and even
    /// connector panics all resolve to FAILED.
    pub async fn dispatch(&self, request: DispatchRequest) -> DispatchResult {
        info!(
            "dispatch job {} ({}.{}) for user {}",
            request.job_id, request.site, request.action, request.user_id
        );
        let run = AssertUnwindSafe(self.run(&request)).catch_unwind().await;
        match run {
            Ok(Ok(data)) => {
                self.resolve_succeeded(&request.job_id);
                info!("job {} finished: SUCCEEDED", request.job_id);
                DispatchResult::succeeded(data)
            }
            Ok(Err(err)) => {
                let message = err.to_string();
                self.resolve_failed(&request.job_id, &message);
                info!("job {} finished: FAILED {message}", request.job_id);
                DispatchResult::failed(message)
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!("panic while dispatching job {}: {message}", request.job_id);
                self.resolve_failed(&request.job_id, &message);
                DispatchResult::failed(message)
            }
        }
    }

    async fn run(&self, request: &DispatchRequest) -> Result<Value> {
        let account = self
            .accounts
            .resolve(&request.user_id, &request.account_selector)?;
        let credentials = self.accounts.credentials(&account)?;
        let connector = self
            .registry
            .get(&request.site)
            .ok_or_else(|| anyhow!("connector not registered: {}", request.site))?;

        let session = match self
            .sessions
            .ensure_session(&self.http, &account, &credentials, connector.as_ref())
            .await?
        {
            SessionOutcome::Ready(session) => session,
            SessionOutcome::UserActionRequired => return Err(anyhow!("pending_user_action")),
            SessionOutcome::LoginFailed(reason) => return Err(anyhow!("login_failed: {reason}")),
        };

        self.ledger.start(&request.job_id)?;
        let outcome = connector
            .perform(PerformContext {
                http: &self.http,
                action: &request.action,
                payload: &request.payload,
                session: &session,
            })
            .await?;
        if !outcome.ok {
            return Err(anyhow!(outcome.error));
        }
        Ok(outcome.data)
    }

    /// Legacy flat command: three simulated steps, then a terminal state.
    pub async fn run_import_customers(&self, job_id: &str, user_id: &str) -> DispatchResult {
        info!("job {job_id} start IMPORT_CUSTOMERS for user {user_id}");
        if let Err(err) = self.ledger.start(job_id) {
            let message = err.to_string();
            self.resolve_failed(job_id, &message);
            return DispatchResult::failed(message);
        }
        for step in ["download_csv", "parse_csv", "upsert_db"] {
            info!("job {job_id} step {step}");
            sleep(Duration::from_millis(200)).await;
        }
        self.resolve_succeeded(job_id);
        info!("job {job_id} finished: SUCCEEDED");
        DispatchResult::succeeded(Value::Null)
    }

    fn resolve_succeeded(&self, job_id: &str) {
        match self.ledger.finish(job_id, JobStatus::Succeeded, "") {
            Ok(true) => {}
            Ok(false) => warn!("job {job_id} already terminal, success dropped"),
            Err(err) => error!("failed to record success for job {job_id}: {err}"),
        }
    }

    /// A failure can surface before the RUNNING transition (resolution or
    /// login errors). The table has no PENDING→FAILED edge, so walk the
    /// legal path: start (idempotent), then finish.
    fn resolve_failed(&self, job_id: &str, message: &str) {
        if let Err(err) = self.ledger.start(job_id) {
            error!("failed to mark job {job_id} running: {err}");
        }
        match self.ledger.finish(job_id, JobStatus::Failed, message) {
            Ok(true) => {}
            Ok(false) => warn!("job {job_id} already terminal, failure dropped: {message}"),
            Err(err) => error!("failed to record failure for job {job_id}: {err}"),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        return message.to_string();
    }
    if let Some(message) = panic.downcast_ref::<String>() {
        return message.clone();
    }
    "unknown panic".to_string()
}

/// Requeue PENDING jobs whose dispatch never reached RUNNING (worker died
/// between enqueue and start). The dispatch request is rebuilt from the
/// stored command row; redelivery is safe because completions are no-ops
/// on already-resolved jobs.
pub async fn sweep_pending_once(
    dispatcher: &Arc<Dispatcher>,
    storage: &Arc<dyn StorageBackend>,
    queue: &JobQueue,
    requeue_after_s: i64,
) -> Result<usize> {
    let cutoff = now_ts() - requeue_after_s.max(1) as f64;
    let stale = storage.list_stale_pending_jobs(cutoff, SWEEP_BATCH)?;
    let mut requeued = 0usize;
    for job in stale {
        let Some(request) = storage.get_command_request_by_job(&job.job_id)? else {
            warn!("stale pending job {} has no command request", job.job_id);
            continue;
        };
        match parse_command_type(&request.cmd_type) {
            Some(CommandKind::Site { site, action }) => {
                let selector = request
                    .account_selector
                    .as_ref()
                    .and_then(|value| serde_json::from_value::<AccountSelector>(value.clone()).ok());
                let Some(selector) = selector else {
                    warn!(
                        "stale pending job {} has no usable account selector",
                        job.job_id
                    );
                    continue;
                };
                warn!("requeue stale pending job {}", job.job_id);
                queue.enqueue(DispatchRequest {
                    job_id: job.job_id.clone(),
                    user_id: job.user_id.clone(),
                    site,
                    action,
                    account_selector: selector,
                    payload: request.payload.clone(),
                })?;
                requeued += 1;
            }
            Some(CommandKind::Legacy(_)) => {
                warn!("requeue stale pending legacy job {}", job.job_id);
                let dispatcher = dispatcher.clone();
                let job_id = job.job_id.clone();
                let user_id = job.user_id.clone();
                tokio::spawn(async move {
                    dispatcher.run_import_customers(&job_id, &user_id).await;
                });
                requeued += 1;
            }
            None => {
                warn!(
                    "stale pending job {} has unknown command type {}",
                    job.job_id, request.cmd_type
                );
            }
        }
    }
    Ok(requeued)
}

pub fn spawn_pending_sweep(
    dispatcher: Arc<Dispatcher>,
    storage: Arc<dyn StorageBackend>,
    queue: JobQueue,
    requeue_after_s: i64,
    sweep_interval_s: u64,
) {
    if requeue_after_s <= 0 {
        info!("pending sweep disabled");
        return;
    }
    tokio::spawn(async move {
        let interval = Duration::from_secs(sweep_interval_s.max(1));
        loop {
            sleep(interval).await;
            match sweep_pending_once(&dispatcher, &storage, &queue, requeue_after_s).await {
                Ok(0) => {}
                Ok(count) => info!("pending sweep requeued {count} job(s)"),
                Err(err) => error!("pending sweep failed: {err}"),
            }
        }
    });
}

fn now_ts() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}
