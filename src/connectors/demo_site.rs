// Offline demo connector so the pipeline can be exercised end to end
// without real site credentials.
use crate::connectors::adapter::{
    ActionOutcome, LoginContext, LoginOutcome, PerformContext, SessionHandle, SiteConnector,
};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

pub const DEMO_SITE: &str = "demo";

pub struct DemoConnector;

#[async_trait]
impl SiteConnector for DemoConnector {
    fn site(&self) -> &'static str {
        DEMO_SITE
    }

    async fn login(&self, context: LoginContext<'_>) -> Result<LoginOutcome> {
        let password = context
            .credentials
            .get("password")
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim();
        if password.is_empty() {
            info!(
                "demo login needs user action for account {}",
                context.account.account_id
            );
            return Ok(LoginOutcome::needs_user_action("missing password"));
        }
        info!("demo login ok for account {}", context.account.account_id);
        Ok(LoginOutcome::succeeded(SessionHandle::new(
            "http",
            json!({ "token": format!("TOKEN_{}", context.account.account_name) }),
        )))
    }

    async fn perform(&self, context: PerformContext<'_>) -> Result<ActionOutcome> {
        match context.action {
            "fetch_profile" => {
                let uid = context
                    .payload
                    .get("uid")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .trim()
                    .to_string();
                if uid.is_empty() {
                    return Ok(ActionOutcome::failed("fetch_profile requires uid"));
                }
                if context
                    .session
                    .store
                    .get("token")
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|token| !token.is_empty())
                    .is_none()
                {
                    return Ok(ActionOutcome::failed("session has no token"));
                }
                info!("demo fetch_profile uid={uid}");
                Ok(ActionOutcome::succeeded(json!({
                    "uid": uid,
                    "name": "Alice",
                    "level": 3,
                })))
            }
            other => Ok(ActionOutcome::failed(format!("unsupported action: {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SiteAccountRecord;

    fn demo_account() -> SiteAccountRecord {
        SiteAccountRecord {
            account_id: "acc_demo".to_string(),
            user_id: "u1".to_string(),
            site: DEMO_SITE.to_string(),
            account_name: "a1".to_string(),
            secret_encrypted: String::new(),
            meta: None,
            created_at: 0.0,
        }
    }

    #[tokio::test]
    async fn login_without_password_needs_user_action() {
        let connector = DemoConnector;
        let http = reqwest::Client::new();
        let account = demo_account();
        let credentials = json!({});
        let outcome = connector
            .login(LoginContext {
                http: &http,
                account: &account,
                credentials: &credentials,
            })
            .await
            .unwrap();
        assert!(!outcome.ok);
        assert!(outcome.needs_user_action);
        assert!(outcome.session.is_none());
    }

    #[tokio::test]
    async fn login_with_password_mints_token() {
        let connector = DemoConnector;
        let http = reqwest::Client::new();
        let account = demo_account();
        let credentials = json!({ "password": "hunter2" });
        let outcome = connector
            .login(LoginContext {
                http: &http,
                account: &account,
                credentials: &credentials,
            })
            .await
            .unwrap();
        assert!(outcome.ok);
        let session = outcome.session.unwrap();
        assert_eq!(session.store["token"], json!("TOKEN_a1"));
    }

    #[tokio::test]
    async fn perform_rejects_unsupported_action() {
        let connector = DemoConnector;
        let http = reqwest::Client::new();
        let session = SessionHandle::new("http", json!({ "token": "TOKEN_a1" }));
        let payload = json!({});
        let outcome = connector
            .perform(PerformContext {
                http: &http,
                action: "delete_account",
                payload: &payload,
                session: &session,
            })
            .await
            .unwrap();
        assert!(!outcome.ok);
        assert_eq!(outcome.error, "unsupported action: delete_account");
    }

    #[tokio::test]
    async fn perform_fetch_profile() {
        let connector = DemoConnector;
        let http = reqwest::Client::new();
        let session = SessionHandle::new("http", json!({ "token": "TOKEN_a1" }));
        let payload = json!({ "uid": "42" });
        let outcome = connector
            .perform(PerformContext {
                http: &http,
                action: "fetch_profile",
                payload: &payload,
                session: &session,
            })
            .await
            .unwrap();
        assert!(outcome.ok);
        assert_eq!(outcome.data["uid"], json!("42"));
        assert_eq!(outcome.data["level"], json!(3));
    }
}
