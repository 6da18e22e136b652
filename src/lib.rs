// Library entrypoint for integration tests and internal reuse.
pub mod accounts;
pub mod api;
pub mod auth;
pub mod config;
pub mod connectors;
pub mod dispatcher;
pub mod intake;
pub mod jobs;
pub mod queue;
pub mod sessions;
pub mod shutdown;
pub mod state;
pub mod state_machine;
pub mod storage;
pub mod user_store;
pub mod vault;
