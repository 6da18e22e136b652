use courier_server::accounts::AccountStore;
use courier_server::connectors::build_default_connector_registry;
use courier_server::dispatcher::Dispatcher;
use courier_server::intake::{CommandIntake, SubmitOutcome, SubmitRequest};
use courier_server::jobs::JobLedger;
use courier_server::queue::{AccountSelector, DispatchRequest, JobQueue};
use courier_server::sessions::SessionService;
use courier_server::state_machine::JobStatus;
use courier_server::storage::{SqliteStorage, StorageBackend};
use courier_server::vault::SecretVault;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;

fn temp_db(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!(
        "courier_{tag}_{}.db",
        uuid::Uuid::new_v4().simple()
    ))
}

struct Harness {
    intake: Arc<CommandIntake>,
    ledger: Arc<JobLedger>,
    storage: Arc<dyn StorageBackend>,
    // Held so enqueued dispatch requests have somewhere to go.
    _receiver: UnboundedReceiver<DispatchRequest>,
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
        accounts,
        sessions,
        build_default_connector_registry(),
        reqwest::Client::new(),
    ));
    let (queue, receiver) = JobQueue::channel();
    let intake = Arc::new(CommandIntake::new(
        storage.clone(),
        ledger.clone(),
        queue,
        dispatcher,
    ));
    Harness {
        intake,
        ledger,
        storage,
        _receiver: receiver,
    }
}

fn site_command(key: &str) -> SubmitRequest {
    SubmitRequest {
        user_id: "u1".to_string(),
        idempotency_key: key.to_string(),
        command_type: "demo.fetch_profile".to_string(),
        payload: json!({ "uid": "42" }),
        account_selector: Some(AccountSelector {
            site: "demo".to_string(),
            account_name: "a1".to_string(),
        }),
    }
}

#[tokio::test]
async fn duplicate_key_returns_same_job() {
    let db_path = temp_db("idem_dup");
    let harness = build_harness(&db_path);

    let first = harness.intake.submit(site_command("k1")).await.unwrap();
    let SubmitOutcome::Accepted { job_id } = first else {
        panic!("first submission should be accepted, got {first:?}");
    };

    let second = harness.intake.submit(site_command("k1")).await.unwrap();
    let SubmitOutcome::Duplicate { job_id: dup_id } = second else {
        panic!("second submission should be a duplicate, got {second:?}");
    };
    assert_eq!(job_id, dup_id);

    let job = harness.ledger.get(&job_id).unwrap().expect("job exists");
    assert_eq!(job.status, JobStatus::Pending);

    let request = harness
        .storage
        .get_command_request("u1", "k1")
        .unwrap()
        .expect("request row exists");
    assert_eq!(request.job_id.as_deref(), Some(job_id.as_str()));

    let _ = std::fs::remove_file(db_path);
}

#[tokio::test]
async fn concurrent_submissions_share_one_job() {
    let db_path = temp_db("idem_race");
    let harness = build_harness(&db_path);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let intake = harness.intake.clone();
        handles.push(tokio::spawn(async move {
            intake.submit(site_command("race-key")).await.unwrap()
        }));
    }

    let mut job_ids = Vec::new();
    let mut accepted = 0;
    for handle in handles {
        match handle.await.unwrap() {
            SubmitOutcome::Accepted { job_id } => {
                accepted += 1;
                job_ids.push(job_id);
            }
            SubmitOutcome::Duplicate { job_id } => job_ids.push(job_id),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
    assert_eq!(accepted, 1);
    assert!(job_ids.windows(2).all(|pair| pair[0] == pair[1]));

    let _ = std::fs::remove_file(db_path);
}

#[tokio::test]
async fn unknown_type_rejected_without_side_effects() {
    let db_path = temp_db("idem_unknown");
    let harness = build_harness(&db_path);

    let mut request = site_command("k-unknown");
    request.command_type = "EXPORT_CUSTOMERS".to_string();
    let outcome = harness.intake.submit(request).await.unwrap();
    assert!(matches!(outcome, SubmitOutcome::UnknownType(_)));

    assert!(harness
        .storage
        .get_command_request("u1", "k-unknown")
        .unwrap()
        .is_none());

    let _ = std::fs::remove_file(db_path);
}

#[tokio::test]
async fn structured_type_requires_selector() {
    let db_path = temp_db("idem_selector");
    let harness = build_harness(&db_path);

    let mut request = site_command("k-selector");
    request.account_selector = None;
    let outcome = harness.intake.submit(request).await.unwrap();
    assert!(matches!(outcome, SubmitOutcome::MissingSelector(_)));

    assert!(harness
        .storage
        .get_command_request("u1", "k-selector")
        .unwrap()
        .is_none());

    let _ = std::fs::remove_file(db_path);
}

#[tokio::test]
async fn legacy_command_needs_no_selector_and_completes() {
    let db_path = temp_db("idem_legacy");
    let harness = build_harness(&db_path);

    let request = SubmitRequest {
        user_id: "u1".to_string(),
        idempotency_key: "k-legacy".to_string(),
        command_type: "IMPORT_CUSTOMERS".to_string(),
        payload: json!({}),
        account_selector: None,
    };
    let outcome = harness.intake.submit(request).await.unwrap();
    let SubmitOutcome::Accepted { job_id } = outcome else {
        panic!("legacy command should be accepted, got {outcome:?}");
    };

    // The legacy task runs on a spawned task with simulated steps.
    let mut status = JobStatus::Pending;
    for _ in 0..50 {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        status = harness.ledger.get(&job_id).unwrap().unwrap().status;
        if status.is_terminal() {
            break;
        }
    }
    assert_eq!(status, JobStatus::Succeeded);

    let _ = std::fs::remove_file(db_path);
}
