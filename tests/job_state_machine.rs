use courier_server::jobs::JobLedger;
use courier_server::state_machine::JobStatus;
use courier_server::storage::{SqliteStorage, StorageBackend};
use std::path::PathBuf;
use std::sync::Arc;

fn temp_db(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!(
        "courier_{tag}_{}.db",
        uuid::Uuid::new_v4().simple()
    ))
}

fn build_ledger(db_path: &PathBuf) -> (Arc<JobLedger>, Arc<dyn StorageBackend>) {
    let storage: Arc<dyn StorageBackend> = Arc::new(SqliteStorage::new(
        db_path.to_string_lossy().to_string(),
    ));
    storage.ensure_initialized().unwrap();
    (Arc::new(JobLedger::new(storage.clone())), storage)
}

#[test]
fn invalid_transitions_are_silent_noops() {
    let db_path = temp_db("sm_invalid");
    let (ledger, storage) = build_ledger(&db_path);
    let job = ledger.create_pending("u1", "demo.fetch_profile").unwrap();

    // PENDING cannot jump straight to a terminal state.
    assert!(!ledger
        .finish(&job.job_id, JobStatus::Succeeded, "")
        .unwrap());
    assert!(!ledger.finish(&job.job_id, JobStatus::Failed, "nope").unwrap());
    let row = storage.get_job(&job.job_id).unwrap().unwrap();
    assert_eq!(row.status, JobStatus::Pending);
    assert!(row.error.is_empty());

    let _ = std::fs::remove_file(db_path);
}

#[test]
fn happy_path_walks_the_table() {
    let db_path = temp_db("sm_happy");
    let (ledger, storage) = build_ledger(&db_path);
    let job = ledger.create_pending("u1", "demo.fetch_profile").unwrap();

    assert!(ledger.start(&job.job_id).unwrap());
    assert_eq!(
        storage.get_job(&job.job_id).unwrap().unwrap().status,
        JobStatus::Running
    );

    // A second start is a no-op, not an error.
    assert!(!ledger.start(&job.job_id).unwrap());

    assert!(ledger.finish(&job.job_id, JobStatus::Failed, "boom").unwrap());
    let row = storage.get_job(&job.job_id).unwrap().unwrap();
    assert_eq!(row.status, JobStatus::Failed);
    assert_eq!(row.error, "boom");

    let _ = std::fs::remove_file(db_path);
}

#[test]
fn terminal_states_absorb_late_signals() {
    let db_path = temp_db("sm_terminal");
    let (ledger, storage) = build_ledger(&db_path);
    let job = ledger.create_pending("u1", "demo.fetch_profile").unwrap();
    ledger.start(&job.job_id).unwrap();
    ledger
        .finish(&job.job_id, JobStatus::Succeeded, "")
        .unwrap();

    assert!(!ledger.start(&job.job_id).unwrap());
    assert!(!ledger
        .finish(&job.job_id, JobStatus::Failed, "late failure")
        .unwrap());
    let row = storage.get_job(&job.job_id).unwrap().unwrap();
    assert_eq!(row.status, JobStatus::Succeeded);
    assert!(row.error.is_empty());

    let _ = std::fs::remove_file(db_path);
}

#[test]
fn finish_requires_a_terminal_status() {
    let db_path = temp_db("sm_guard");
    let (ledger, _storage) = build_ledger(&db_path);
    let job = ledger.create_pending("u1", "demo.fetch_profile").unwrap();

    assert!(ledger.finish(&job.job_id, JobStatus::Running, "").is_err());
    assert!(ledger.finish(&job.job_id, JobStatus::Pending, "").is_err());

    let _ = std::fs::remove_file(db_path);
}

#[test]
fn ownership_isolation_hides_foreign_jobs() {
    let db_path = temp_db("sm_owner");
    let (ledger, _storage) = build_ledger(&db_path);
    let job = ledger.create_pending("alice", "demo.fetch_profile").unwrap();

    // Owner sees the job.
    assert!(ledger.query_for(&job.job_id, "alice", false).unwrap().is_some());

    // A stranger gets the same answer as for a nonexistent id.
    assert!(ledger.query_for(&job.job_id, "bob", false).unwrap().is_none());
    assert!(ledger.query_for("job_missing", "bob", false).unwrap().is_none());

    // Privileged requesters bypass the ownership filter.
    assert!(ledger.query_for(&job.job_id, "bob", true).unwrap().is_some());

    let _ = std::fs::remove_file(db_path);
}
