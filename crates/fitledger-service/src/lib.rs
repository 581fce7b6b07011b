#![deny(unsafe_code)]

pub mod registry;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use fitledger_core::{
    storage, ActivityOutcome, ActivityRecord, AmountParseError, EconomyConfig, EconomyError,
    Mission, OwnershipRecord, Reward, RewardCatalog, RewardCategory, StorageConfig, StorageError,
    TokenAmount, Transaction, TransactionKind, UnitId,
};
use registry::{SessionRegistry, DEFAULT_MAX_CACHED_SESSIONS};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub storage: StorageConfig,
    pub economy: EconomyConfig,
    pub catalog: RewardCatalog,
    pub max_cached_sessions: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::Memory,
            economy: EconomyConfig::default(),
            catalog: RewardCatalog::builtin(),
            max_cached_sessions: DEFAULT_MAX_CACHED_SESSIONS,
        }
    }
}

#[derive(Clone)]
pub struct ServiceState {
    pub registry: Arc<SessionRegistry>,
}

impl ServiceState {
    pub async fn bootstrap(config: ServiceConfig) -> Result<Self, ServiceError> {
        let ServiceConfig {
            storage,
            economy,
            catalog,
            max_cached_sessions,
        } = config;
        economy.validate()?;

        let store = storage::connect(storage).await?;
        let registry = SessionRegistry::new(store, Arc::new(catalog), Arc::new(economy))
            .with_max_cached_sessions(max_cached_sessions);

        Ok(Self {
            registry: Arc::new(registry),
        })
    }
}

pub fn build_router(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/catalog", get(list_catalog))
        .route("/v1/users/:user_id", get(get_user))
        .route("/v1/users/:user_id/transactions", get(list_transactions))
        .route("/v1/users/:user_id/missions", get(list_missions))
        .route("/v1/users/:user_id/credit", post(credit))
        .route("/v1/users/:user_id/debit", post(debit))
        .route("/v1/users/:user_id/convert", post(convert))
        .route("/v1/users/:user_id/activities", post(record_activity))
        .route("/v1/users/:user_id/steps", post(record_steps))
        .route("/v1/users/:user_id/purchases", post(purchase))
        .with_state(state)
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("economy error: {0}")]
    Economy(#[from] EconomyError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{message}")]
    Http { status: StatusCode, message: String },
    #[error(transparent)]
    Economy(#[from] EconomyError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Amount(#[from] AmountParseError),
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self::Http {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ApiError::Http { status, .. } => *status,
            ApiError::Economy(err) => match err {
                EconomyError::InsufficientBalance { .. }
                | EconomyError::TransactionConflict { .. } => StatusCode::CONFLICT,
                EconomyError::RewardNotFound(_) => StatusCode::NOT_FOUND,
                EconomyError::InvalidAmount(_)
                | EconomyError::UnknownUnit(_)
                | EconomyError::InvalidActivity(_)
                | EconomyError::InvalidUserId(_) => StatusCode::BAD_REQUEST,
                EconomyError::Ledger(_) | EconomyError::Config(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
            ApiError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Amount(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Economy(err) => ApiError::Economy(err),
            ServiceError::Storage(err) => ApiError::Storage(err),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        match &self {
            _ if status.is_server_error() => error!(error = %self, "Request failed"),
            ApiError::Economy(err) if err.is_business_failure() => {
                debug!(error = %err, "Request declined")
            }
            _ => warn!(status = status.as_u16(), error = %self, "Request rejected"),
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    storage_backend: &'static str,
    cached_sessions: usize,
}

async fn health(State(state): State<ServiceState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "fitledger-service",
        storage_backend: state.registry.store_label(),
        cached_sessions: state.registry.cached_sessions().await,
    })
}

const CATEGORY_NAMES: &str = "fitness_gear, nutrition, experience, digital, charity";

#[derive(Debug, Clone, Deserialize)]
struct CatalogQuery {
    category: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct CatalogResponse {
    total: usize,
    items: Vec<Reward>,
}

async fn list_catalog(
    State(state): State<ServiceState>,
    Query(query): Query<CatalogQuery>,
) -> Result<Json<CatalogResponse>, ApiError> {
    let catalog = state.registry.catalog();
    let items: Vec<Reward> = match query.category.as_deref() {
        None => catalog.list().to_vec(),
        Some(value) => {
            let category = RewardCategory::parse(&value.to_ascii_lowercase()).ok_or_else(|| {
                ApiError::bad_request(format!(
                    "invalid category '{}'; expected one of: {}",
                    value, CATEGORY_NAMES
                ))
            })?;
            catalog.by_category(category).into_iter().cloned().collect()
        }
    };

    Ok(Json(CatalogResponse {
        total: items.len(),
        items,
    }))
}

#[derive(Debug, Clone, Serialize)]
struct UserSummary {
    user_id: String,
    balance_minor: TokenAmount,
    balance: String,
    experience_points: u64,
    level: u64,
    transaction_count: usize,
    owned: Vec<OwnershipRecord>,
}

async fn get_user(
    Path(user_id): Path<String>,
    State(state): State<ServiceState>,
) -> Result<Json<UserSummary>, ApiError> {
    let summary = state
        .registry
        .read(&user_id, |session| {
            let ledger = session.ledger();
            UserSummary {
                user_id: session.user_id().to_string(),
                balance_minor: ledger.balance(),
                balance: ledger.balance().to_string(),
                experience_points: ledger.experience_points(),
                level: ledger.level(),
                transaction_count: ledger.transactions().len(),
                owned: session.owned().to_vec(),
            }
        })
        .await?;
    Ok(Json(summary))
}

#[derive(Debug, Clone, Deserialize)]
struct TransactionsQuery {
    kind: Option<String>,
    limit: Option<usize>,
    offset: Option<usize>,
    order: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct TransactionsResponse {
    total: usize,
    returned: usize,
    items: Vec<Transaction>,
}

fn parse_kind_filter(kind: Option<&str>) -> Result<Option<TransactionKind>, ApiError> {
    match kind.map(|value| value.to_ascii_lowercase()) {
        None => Ok(None),
        Some(value) => TransactionKind::parse(&value).map(Some).ok_or_else(|| {
            ApiError::bad_request(format!(
                "invalid kind '{}'; expected one of: credited, debited, converted",
                value
            ))
        }),
    }
}

async fn list_transactions(
    Path(user_id): Path<String>,
    State(state): State<ServiceState>,
    Query(query): Query<TransactionsQuery>,
) -> Result<Json<TransactionsResponse>, ApiError> {
    let kind_filter = parse_kind_filter(query.kind.as_deref())?;

    let order = query
        .order
        .as_deref()
        .unwrap_or("desc")
        .to_ascii_lowercase();
    if order != "asc" && order != "desc" {
        return Err(ApiError::bad_request(format!(
            "invalid order '{}'; expected asc or desc",
            order
        )));
    }

    let mut entries = state
        .registry
        .read(&user_id, |session| session.ledger().transactions().to_vec())
        .await?;

    if let Some(kind) = kind_filter {
        entries.retain(|entry| entry.kind == kind);
    }
    if order == "desc" {
        entries.reverse();
    }

    let total = entries.len();
    let offset = query.offset.unwrap_or(0);
    let limit = query.limit.unwrap_or(100).min(1000);
    let items = entries
        .into_iter()
        .skip(offset)
        .take(limit)
        .collect::<Vec<_>>();

    Ok(Json(TransactionsResponse {
        total,
        returned: items.len(),
        items,
    }))
}

#[derive(Debug, Clone, Serialize)]
struct MissionsResponse {
    expires_at: Option<DateTime<Utc>>,
    items: Vec<Mission>,
}

/// Returns the current batch, starting a fresh one if the last has expired.
async fn list_missions(
    Path(user_id): Path<String>,
    State(state): State<ServiceState>,
) -> Result<Json<MissionsResponse>, ApiError> {
    let now = Utc::now();
    let items = state
        .registry
        .mutate(&user_id, |session| {
            session.refresh_missions(now);
            Ok(session.missions().to_vec())
        })
        .await?;

    Ok(Json(MissionsResponse {
        expires_at: items.iter().filter_map(|mission| mission.expiry).min(),
        items,
    }))
}

/// Request amount, given either as minor units or as a decimal token string
/// such as `"12.50"`.
#[derive(Debug, Clone, Deserialize)]
struct RequestedAmount {
    amount_minor: Option<u64>,
    amount: Option<String>,
}

impl RequestedAmount {
    fn resolve(&self) -> Result<TokenAmount, ApiError> {
        match (self.amount_minor, self.amount.as_deref()) {
            (Some(minor), None) => Ok(TokenAmount::from_minor(minor)),
            (None, Some(decimal)) => Ok(decimal.parse::<TokenAmount>()?),
            (Some(_), Some(_)) => Err(ApiError::bad_request(
                "give either amount_minor or amount, not both",
            )),
            (None, None) => Err(ApiError::bad_request("amount_minor or amount is required")),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct AdjustRequest {
    #[serde(flatten)]
    amount: RequestedAmount,
    description: Option<String>,
    transaction_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize)]
struct TransactionResponse {
    transaction: Transaction,
    balance_minor: TokenAmount,
}

async fn credit(
    Path(user_id): Path<String>,
    State(state): State<ServiceState>,
    Json(request): Json<AdjustRequest>,
) -> Result<Json<TransactionResponse>, ApiError> {
    let description = request
        .description
        .unwrap_or_else(|| "Manual credit".to_string());
    let amount = request.amount.resolve()?;

    let response = state
        .registry
        .mutate(&user_id, |session| {
            let transaction = session.credit(request.transaction_id, amount, &description)?;
            Ok(TransactionResponse {
                transaction,
                balance_minor: session.ledger().balance(),
            })
        })
        .await?;
    Ok(Json(response))
}

async fn debit(
    Path(user_id): Path<String>,
    State(state): State<ServiceState>,
    Json(request): Json<AdjustRequest>,
) -> Result<Json<TransactionResponse>, ApiError> {
    let description = request
        .description
        .unwrap_or_else(|| "Manual debit".to_string());
    let amount = request.amount.resolve()?;

    let response = state
        .registry
        .mutate(&user_id, |session| {
            let transaction = session.debit(request.transaction_id, amount, &description)?;
            Ok(TransactionResponse {
                transaction,
                balance_minor: session.ledger().balance(),
            })
        })
        .await?;
    Ok(Json(response))
}

#[derive(Debug, Clone, Deserialize)]
struct ConvertRequest {
    #[serde(flatten)]
    amount: RequestedAmount,
    unit: String,
    transaction_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize)]
struct ConvertResponse {
    transaction: Transaction,
    unit: UnitId,
    converted_minor: u64,
    balance_minor: TokenAmount,
}

async fn convert(
    Path(user_id): Path<String>,
    State(state): State<ServiceState>,
    Json(request): Json<ConvertRequest>,
) -> Result<Json<ConvertResponse>, ApiError> {
    let unit = UnitId::new(&request.unit);
    let amount = request.amount.resolve()?;

    let response = state
        .registry
        .mutate(&user_id, |session| {
            let conversion = session.convert(request.transaction_id, amount, &unit)?;
            Ok(ConvertResponse {
                transaction: conversion.transaction,
                unit: conversion.unit,
                converted_minor: conversion.converted_minor,
                balance_minor: session.ledger().balance(),
            })
        })
        .await?;
    Ok(Json(response))
}

async fn record_activity(
    Path(user_id): Path<String>,
    State(state): State<ServiceState>,
    Json(activity): Json<ActivityRecord>,
) -> Result<Json<ActivityOutcome>, ApiError> {
    let now = Utc::now();
    let outcome = state
        .registry
        .mutate(&user_id, |session| session.ingest_activity(&activity, now))
        .await?;
    Ok(Json(outcome))
}

#[derive(Debug, Clone, Deserialize)]
struct StepsRequest {
    step_count: u32,
    at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
struct StepsResponse {
    completed_missions: Vec<Mission>,
    balance_minor: TokenAmount,
}

async fn record_steps(
    Path(user_id): Path<String>,
    State(state): State<ServiceState>,
    Json(request): Json<StepsRequest>,
) -> Result<Json<StepsResponse>, ApiError> {
    let at = request.at.unwrap_or_else(Utc::now);
    let response = state
        .registry
        .mutate(&user_id, |session| {
            let completed_missions = session.record_steps(request.step_count, at)?;
            Ok(StepsResponse {
                completed_missions,
                balance_minor: session.ledger().balance(),
            })
        })
        .await?;
    Ok(Json(response))
}

#[derive(Debug, Clone, Deserialize)]
struct PurchaseRequest {
    reward_id: String,
    transaction_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize)]
struct PurchaseResponse {
    ownership: OwnershipRecord,
    balance_minor: TokenAmount,
}

async fn purchase(
    Path(user_id): Path<String>,
    State(state): State<ServiceState>,
    Json(request): Json<PurchaseRequest>,
) -> Result<Json<PurchaseResponse>, ApiError> {
    let response = state
        .registry
        .mutate(&user_id, |session| {
            let ownership = session.purchase(request.transaction_id, &request.reward_id)?;
            Ok(PurchaseResponse {
                ownership,
                balance_minor: session.ledger().balance(),
            })
        })
        .await?;
    Ok(Json(response))
}
