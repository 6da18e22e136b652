use courier_server::accounts::AccountStore;
use courier_server::connectors::build_default_connector_registry;
use courier_server::dispatcher::{sweep_pending_once, Dispatcher};
use courier_server::jobs::JobLedger;
use courier_server::queue::JobQueue;
use courier_server::sessions::SessionService;
use courier_server::state_machine::JobStatus;
use courier_server::storage::{
    CommandRequestRecord, JobRecord, SqliteStorage, StorageBackend,
};
use courier_server::vault::SecretVault;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;

fn temp_db(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!(
        "courier_{tag}_{}.db",
        uuid::Uuid::new_v4().simple()
    ))
}

fn now_ts() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

struct Harness {
    dispatcher: Arc<Dispatcher>,
    ledger: Arc<JobLedger>,
    accounts: Arc<AccountStore>,
    storage: Arc<dyn StorageBackend>,
}

fn build_harness(db_path: &PathBuf) -> Harness {
    let storage: Arc<dyn StorageBackend> = Arc::new(SqliteStorage::new(
        db_path.to_string_lossy().to_string(),
    ));
    storage.ensure_initialized().unwrap();
    let vault = Arc::new(SecretVault::new("test-secret"));
    let ledger = Arc::new(JobLedger::new(storage.clone()));
    let accounts = Arc::new(AccountStore::new(storage.clone(), vault.clone()));
    let sessions = Arc::new(SessionService::new(storage.clone(), vault, 3600));
    let dispatcher = Arc::new(Dispatcher::new(
        ledger.clone(),
        accounts.clone(),
        sessions,
        build_default_connector_registry(),
        reqwest::Client::new(),
    ));
    Harness {
        dispatcher,
        ledger,
        accounts,
        storage,
    }
}

/// Plant a PENDING job as if a worker died right after enqueue: the job and
/// its command row exist, but no RUNNING transition ever happened.
fn plant_stale_job(
    harness: &Harness,
    job_id: &str,
    cmd_type: &str,
    selector: Option<serde_json::Value>,
    age_s: f64,
) {
    let then = now_ts() - age_s;
    harness
        .storage
        .insert_job(&JobRecord {
            job_id: job_id.to_string(),
            user_id: "u1".to_string(),
            job_type: cmd_type.to_string(),
            status: JobStatus::Pending,
            error: String::new(),
            created_at: then,
            updated_at: then,
        })
        .unwrap();
    harness
        .storage
        .try_insert_command_request(&CommandRequestRecord {
            request_id: format!("cmd_{job_id}"),
            user_id: "u1".to_string(),
            idempotency_key: format!("key_{job_id}"),
            cmd_type: cmd_type.to_string(),
            payload: json!({ "uid": "42" }),
            account_selector: selector,
            job_id: Some(job_id.to_string()),
            created_at: then,
        })
        .unwrap();
}

#[tokio::test]
async fn stale_pending_job_is_requeued_and_completes() {
    let db_path = temp_db("sweep_requeue");
    let harness = build_harness(&db_path);
    harness
        .accounts
        .create("u1", "demo", "a1", &json!({ "password": "pw" }), None)
        .unwrap();
    plant_stale_job(
        &harness,
        "job_stale",
        "demo.fetch_profile",
        Some(json!({ "site": "demo", "account_name": "a1" })),
        300.0,
    );

    let (queue, mut receiver) = JobQueue::channel();
    let requeued = sweep_pending_once(&harness.dispatcher, &harness.storage, &queue, 60)
        .await
        .unwrap();
    assert_eq!(requeued, 1);

    let request = receiver.try_recv().expect("request requeued");
    assert_eq!(request.job_id, "job_stale");
    assert_eq!(request.site, "demo");
    assert_eq!(request.action, "fetch_profile");

    let result = harness.dispatcher.dispatch(request).await;
    assert!(result.ok, "dispatch failed: {}", result.error);
    assert_eq!(
        harness.ledger.get("job_stale").unwrap().unwrap().status,
        JobStatus::Succeeded
    );

    let _ = std::fs::remove_file(db_path);
}

#[tokio::test]
async fn fresh_pending_jobs_are_left_alone() {
    let db_path = temp_db("sweep_fresh");
    let harness = build_harness(&db_path);
    plant_stale_job(
        &harness,
        "job_fresh",
        "demo.fetch_profile",
        Some(json!({ "site": "demo", "account_name": "a1" })),
        1.0,
    );

    let (queue, mut receiver) = JobQueue::channel();
    let requeued = sweep_pending_once(&harness.dispatcher, &harness.storage, &queue, 60)
        .await
        .unwrap();
    assert_eq!(requeued, 0);
    assert!(receiver.try_recv().is_err());

    let _ = std::fs::remove_file(db_path);
}

#[tokio::test]
async fn terminal_jobs_are_never_requeued() {
    let db_path = temp_db("sweep_terminal");
    let harness = build_harness(&db_path);
    plant_stale_job(
        &harness,
        "job_done",
        "demo.fetch_profile",
        Some(json!({ "site": "demo", "account_name": "a1" })),
        300.0,
    );
    harness.ledger.start("job_done").unwrap();
    harness
        .ledger
        .finish("job_done", JobStatus::Succeeded, "")
        .unwrap();

    let (queue, mut receiver) = JobQueue::channel();
    let requeued = sweep_pending_once(&harness.dispatcher, &harness.storage, &queue, 60)
        .await
        .unwrap();
    assert_eq!(requeued, 0);
    assert!(receiver.try_recv().is_err());

    let _ = std::fs::remove_file(db_path);
}

#[tokio::test]
async fn stale_legacy_job_is_rescheduled_directly() {
    let db_path = temp_db("sweep_legacy");
    let harness = build_harness(&db_path);
    plant_stale_job(&harness, "job_legacy", "IMPORT_CUSTOMERS", None, 300.0);

    let (queue, _receiver) = JobQueue::channel();
    let requeued = sweep_pending_once(&harness.dispatcher, &harness.storage, &queue, 60)
        .await
        .unwrap();
    assert_eq!(requeued, 1);

    let mut status = JobStatus::Pending;
    for _ in 0..50 {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        status = harness.ledger.get("job_legacy").unwrap().unwrap().status;
        if status.is_terminal() {
            break;
        }
    }
    assert_eq!(status, JobStatus::Succeeded);

    let _ = std::fs::remove_file(db_path);
}
