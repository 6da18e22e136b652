use crate::storage::SiteAccountRecord;
use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

/// Opaque reusable authentication state obtained from a successful login.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub kind: String,
    pub store: Value,
}

impl SessionHandle {
    pub fn new(kind: impl Into<String>, store: Value) -> Self {
        Self {
            kind: kind.into(),
            store,
        }
    }

    pub fn to_value(&self) -> Value {
        json!({ "kind": self.kind, "store": self.store })
    }

    pub fn from_value(value: &Value) -> Self {
        let kind = value
            .get("kind")
            .and_then(Value::as_str)
            .unwrap_or("http")
            .to_string();
        let store = value.get("store").cloned().unwrap_or_else(|| json!({}));
        Self { kind, store }
    }
}

pub struct LoginContext<'a> {
    pub http: &'a Client,
    pub account: &'a SiteAccountRecord,
    pub credentials: &'a Value,
}

pub struct PerformContext<'a> {
    pub http: &'a Client,
    pub action: &'a str,
    pub payload: &'a Value,
    pub session: &'a SessionHandle,
}

#[derive(Debug, Clone)]
pub struct LoginOutcome {
    pub ok: bool,
    pub session: Option<SessionHandle>,
    pub needs_user_action: bool,
    pub error: String,
}

impl LoginOutcome {
    pub fn succeeded(session: SessionHandle) -> Self {
        Self {
            ok: true,
            session: Some(session),
            needs_user_action: false,
            error: String::new(),
        }
    }

    pub fn needs_user_action(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            session: None,
            needs_user_action: true,
            error: error.into(),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            session: None,
            needs_user_action: false,
            error: error.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ActionOutcome {
    pub ok: bool,
    pub data: Value,
    pub error: String,
}

impl ActionOutcome {
    pub fn succeeded(data: Value) -> Self {
        Self {
            ok: true,
            data,
            error: String::new(),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: Value::Null,
            error: error.into(),
        }
    }
}

/// Per-site adapter: login once, then perform named actions against the
/// site with the resulting session. `Err` is reserved for unexpected
/// faults; expected failures travel in the outcome structs.
#[async_trait]
pub trait SiteConnector: Send + Sync {
    fn site(&self) -> &'static str;

    async fn login(&self, context: LoginContext<'_>) -> Result<LoginOutcome>;

    /// Unsupported actions must come back as `ActionOutcome::failed`, never
    /// as a panic or an `Err`.
    async fn perform(&self, context: PerformContext<'_>) -> Result<ActionOutcome>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_handle_value_round_trip() {
        let handle = SessionHandle::new("http", json!({ "token": "abc" }));
        let restored = SessionHandle::from_value(&handle.to_value());
        assert_eq!(restored.kind, "http");
        assert_eq!(restored.store, json!({ "token": "abc" }));
    }

    #[test]
    fn session_handle_tolerates_missing_fields() {
        let restored = SessionHandle::from_value(&json!({}));
        assert_eq!(restored.kind, "http");
        assert_eq!(restored.store, json!({}));
    }
}
