//! HTTP API
//!
//! Registration and revocation answer synchronously; execution outcomes are
//! only visible through the action audit routes.

pub mod handlers;
pub mod types;

use alloy_primitives::Address;
use axum::{
    http::StatusCode,
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::delegation::DelegationRegistry;
use crate::error::Error;
use crate::executor::ExecutionStore;
use crate::indexer::Indexer;
use crate::rules::RuleSet;

use handlers::*;

/// Error half of every fallible handler
pub type ApiError = (StatusCode, String);

/// Shared handler state
pub struct AppState {
    pub identity: Address,
    pub registry: Arc<DelegationRegistry>,
    pub indexer: Arc<dyn Indexer>,
    pub store: Arc<ExecutionStore>,
    pub rules: RuleSet,
}

/// Map a crate error onto an HTTP status
pub fn api_error(e: Error) -> ApiError {
    let status = match &e {
        Error::Validation(_) => StatusCode::BAD_REQUEST,
        Error::DelegationNotFound(_) => StatusCode::NOT_FOUND,
        Error::DelegationInactive { .. } => StatusCode::CONFLICT,
        Error::IndexerTimeout(_) | Error::Indexer(_) | Error::IndexerStale { .. } => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        Error::IndexerMalformed(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!("API request failed: {}", e);
    }
    (status, e.to_string())
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/delegations", post(register_delegation_handler))
        .route(
            "/api/delegations/{id}",
            get(get_delegation_handler).delete(revoke_delegation_handler),
        )
        .route("/api/delegations/{id}/revoke", post(revoke_delegation_handler))
        .route("/api/delegations/{id}/pause", post(pause_delegation_handler))
        .route("/api/delegations/{id}/resume", post(resume_delegation_handler))
        .route("/api/wallets/{address}/health", get(wallet_health_handler))
        .route("/api/wallets/{address}/approvals", get(wallet_approvals_handler))
        .route("/api/actions", get(list_actions_handler))
        .route("/api/actions/review", get(review_queue_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the API until shutdown is signalled
pub async fn serve(
    addr: SocketAddr,
    state: Arc<AppState>,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("API listening on {}", listener.local_addr()?);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            info!("API shutting down");
        })
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RulesConfig;
    use crate::executor::authority::Rejection;
    use crate::delegation::ActionKind;
    use crate::rules::{ProposedAction, RevokeReason};
    use crate::test_support::*;
    use alloy_primitives::U256;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use chrono::Utc;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    struct TestApp {
        router: Router,
        registry: Arc<DelegationRegistry>,
        indexer: Arc<FakeIndexer>,
        store: Arc<ExecutionStore>,
    }

    fn app() -> TestApp {
        let registry = Arc::new(DelegationRegistry::new(None));
        let indexer = Arc::new(FakeIndexer::new());
        let store = Arc::new(ExecutionStore::new(None));
        let state = Arc::new(AppState {
            identity: AGENT,
            registry: registry.clone(),
            indexer: indexer.clone(),
            store: store.clone(),
            rules: RuleSet::from_config(&RulesConfig::default()).unwrap(),
        });
        TestApp {
            router: router(state),
            registry,
            indexer,
            store,
        }
    }

    async fn call(
        router: &Router,
        method: &str,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json");
        let request = match body {
            Some(body) => request.body(Body::from(body.to_string())).unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::String(
            String::from_utf8_lossy(&bytes).to_string(),
        ));
        (status, value)
    }

    fn registration_body() -> Value {
        json!({
            "delegator": WALLET.to_string(),
            "scope": {
                "targets": [TOKEN.to_string()],
                "actions": ["revoke"],
                "maxActionsPerCycle": 5
            },
            "grantProof": "sig"
        })
    }

    #[tokio::test]
    async fn test_register_and_fetch_delegation() {
        let app = app();
        let (status, body) = call(&app.router, "POST", "/api/delegations", Some(registration_body())).await;
        assert_eq!(status, StatusCode::CREATED);
        let id = body["delegationId"].as_str().unwrap().to_string();

        let (status, body) = call(&app.router, "GET", &format!("/api/delegations/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "active");
        assert_eq!(body["maxActionsPerCycle"], 5);
        assert!(body.get("grantProof").is_none());

        let active = app.registry.list_active(&AGENT).await;
        assert_eq!(active.len(), 1);
    }

    #[tokio::test]
    async fn test_register_rejects_invalid_scope() {
        let app = app();
        let mut body = registration_body();
        body["scope"]["targets"] = json!([]);
        let (status, _) = call(&app.router, "POST", "/api/delegations", Some(body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(
            &app.router,
            "POST",
            "/api/delegations",
            Some(json!({"delegator": "nope"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(app.registry.list_all().await.is_empty());
    }

    #[tokio::test]
    async fn test_revoke_is_idempotent() {
        let app = app();
        let id = app
            .registry
            .register(registration(WALLET, vec![TOKEN]))
            .await
            .unwrap();

        let uri = format!("/api/delegations/{}", id);
        let (status, body) = call(&app.router, "DELETE", &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "revoked");

        let (status, _) = call(&app.router, "POST", &format!("{}/revoke", uri), None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(app.registry.list_active(&AGENT).await.is_empty());

        let (status, _) = call(&app.router, "POST", &format!("{}/resume", uri), None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = call(&app.router, "DELETE", "/api/delegations/unknown", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_wallet_health_never_indexed_vs_empty() {
        let app = app();
        let uri = format!("/api/wallets/{}/health", WALLET);

        let (status, body) = call(&app.router, "GET", &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"status": "never_indexed"}));

        app.indexer.set_snapshot(snapshot(WALLET, vec![], Utc::now()));
        let (_, body) = call(&app.router, "GET", &uri, None).await;
        assert_eq!(body["status"], "indexed");
        assert_eq!(body["activeApprovals"], 0);
        assert_eq!(body["score"], 100);
    }

    #[tokio::test]
    async fn test_wallet_approvals_risky_filter() {
        let app = app();
        let now = Utc::now();
        app.indexer.set_snapshot(snapshot(
            WALLET,
            vec![
                approval(WALLET, TOKEN, SPENDER, U256::MAX, now),
                approval(WALLET, OTHER_TOKEN, SPENDER, U256::from(10u64), now),
            ],
            now,
        ));

        let uri = format!("/api/wallets/{}/approvals", WALLET);
        let (status, body) = call(&app.router, "GET", &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["approvals"].as_array().unwrap().len(), 2);
        assert_eq!(body["approvals"][0]["amount"], U256::MAX.to_string());
        assert_eq!(body["approvals"][0]["flaggedReason"], "unlimited_approval");

        let (_, body) = call(&app.router, "GET", &format!("{}?risky_only=true", uri), None).await;
        assert_eq!(body["approvals"].as_array().unwrap().len(), 1);

        let (status, _) = call(&app.router, "GET", "/api/wallets/0xzz/approvals", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_indexer_outage_is_503() {
        let app = app();
        app.indexer.fail_next(1);
        let (status, _) = call(
            &app.router,
            "GET",
            &format!("/api/wallets/{}/health", WALLET),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_actions_audit_and_review_queue() {
        let app = app();
        let now = Utc::now();
        let delegation = app
            .registry
            .register(registration(WALLET, vec![TOKEN]))
            .await
            .unwrap();
        let action = ProposedAction {
            kind: ActionKind::Revoke,
            owner: WALLET,
            token: TOKEN,
            spender: SPENDER,
            reason: RevokeReason::UnlimitedApproval,
        };
        let key = action.idempotency_key(&delegation);
        app.store
            .claim(&key, &delegation, &action, now, chrono::Duration::minutes(10))
            .unwrap();
        app.store.record_permanent_failure(
            &key,
            &Error::AuthorityRejected(Rejection::RejectedOnChain("reverted".to_string())),
            now,
        );

        let (status, body) = call(
            &app.router,
            "GET",
            &format!("/api/actions?delegation_id={}", delegation),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["status"], "failed");
        assert_eq!(body[0]["reason"], "unlimited_approval");

        let (_, body) = call(&app.router, "GET", "/api/actions?delegation_id=other", None).await;
        assert!(body.as_array().unwrap().is_empty());

        let (_, body) = call(&app.router, "GET", "/api/actions/review", None).await;
        assert_eq!(body.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_liveness() {
        let app = app();
        let (status, body) = call(&app.router, "GET", "/api/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }
}
