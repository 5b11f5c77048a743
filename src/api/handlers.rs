//! Route handlers

use alloy_primitives::Address;
use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

use crate::delegation::{DelegationId, RegistrationRequest};
use crate::monitor::{assess, WalletHealth};
use crate::rules::evaluate;

use super::types::*;
use super::{api_error, ApiError, AppState};

pub async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

// --- Delegations ---

pub async fn register_delegation_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<RegisterDelegationBody>, JsonRejection>,
) -> Result<(StatusCode, Json<RegisterDelegationResponse>), ApiError> {
    let Json(body) = payload.map_err(|e| (StatusCode::BAD_REQUEST, e.body_text()))?;

    let request = RegistrationRequest {
        delegator: body.delegator,
        delegate: body.delegate.unwrap_or(state.identity),
        scope: body.scope.into(),
        grant_proof: body.grant_proof,
    };

    let id = state.registry.register(request).await.map_err(api_error)?;
    info!(delegation = %id, "Delegation registered via API");

    Ok((
        StatusCode::CREATED,
        Json(RegisterDelegationResponse {
            delegation_id: id.to_string(),
        }),
    ))
}

pub async fn get_delegation_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<DelegationView>, ApiError> {
    state
        .registry
        .get(&DelegationId::from(id.as_str()))
        .await
        .map(|d| Json(d.into()))
        .ok_or((StatusCode::NOT_FOUND, format!("delegation {} not found", id)))
}

pub async fn revoke_delegation_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<DelegationView>, ApiError> {
    let delegation = state
        .registry
        .revoke(&DelegationId::from(id.as_str()))
        .await
        .map_err(api_error)?;
    Ok(Json(delegation.into()))
}

pub async fn pause_delegation_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<DelegationView>, ApiError> {
    let delegation = state
        .registry
        .pause(&DelegationId::from(id.as_str()))
        .await
        .map_err(api_error)?;
    Ok(Json(delegation.into()))
}

pub async fn resume_delegation_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<DelegationView>, ApiError> {
    let delegation = state
        .registry
        .resume(&DelegationId::from(id.as_str()))
        .await
        .map_err(api_error)?;
    Ok(Json(delegation.into()))
}

// --- Wallets ---

fn parse_wallet(raw: &str) -> Result<Address, ApiError> {
    Address::from_str(raw)
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("invalid address {}: {}", raw, e)))
}

pub async fn wallet_health_handler(
    State(state): State<Arc<AppState>>,
    Path(address): Path<String>,
) -> Result<Json<WalletHealth>, ApiError> {
    let wallet = parse_wallet(&address)?;
    let snapshot = state
        .indexer
        .wallet_snapshot(&wallet)
        .await
        .map_err(api_error)?;
    Ok(Json(assess(snapshot.as_ref(), &state.rules, Utc::now())))
}

pub async fn wallet_approvals_handler(
    State(state): State<Arc<AppState>>,
    Path(address): Path<String>,
    Query(query): Query<ApprovalsQuery>,
) -> Result<Json<ApprovalsResponse>, ApiError> {
    let wallet = parse_wallet(&address)?;
    let snapshot = state
        .indexer
        .wallet_snapshot(&wallet)
        .await
        .map_err(api_error)?
        .ok_or((StatusCode::NOT_FOUND, format!("wallet {} never indexed", wallet)))?;

    let now = Utc::now();
    let approvals = snapshot
        .approvals
        .iter()
        .map(|a| {
            let reason = evaluate(a, &state.rules, now).map(|action| action.reason);
            ApprovalView::new(a, reason)
        })
        .filter(|view| !query.risky_only || view.flagged_reason.is_some())
        .collect();

    Ok(Json(ApprovalsResponse {
        wallet: snapshot.wallet,
        indexed_at: snapshot.indexed_at,
        approvals,
    }))
}

// --- Actions ---

pub async fn list_actions_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ActionsQuery>,
) -> Json<Vec<ActionRecordView>> {
    let delegation_id = query.delegation_id.map(|id| DelegationId::from(id.as_str()));
    Json(
        state
            .store
            .list(delegation_id.as_ref())
            .into_iter()
            .map(Into::into)
            .collect(),
    )
}

pub async fn review_queue_handler(
    State(state): State<Arc<AppState>>,
) -> Json<Vec<ActionRecordView>> {
    Json(
        state
            .store
            .review_queue()
            .into_iter()
            .map(Into::into)
            .collect(),
    )
}
