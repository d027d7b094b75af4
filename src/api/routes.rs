use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::bets::{BetError, BetRepository, PlaceBetRequest, PlacementError, PlacementService};
use crate::ledger::{LedgerError, LedgerStore};
use crate::models::{from_amount, to_amount, Bet, BetStatus, Transaction, User};
use crate::provider::CallbackService;
use crate::queue::{JobQueue, QueueDepth, QueueError};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub ledger: LedgerStore,
    pub bets: BetRepository,
    pub placement: PlacementService,
    pub callbacks: CallbackService,
    pub queue: JobQueue,
    pub currency: String,
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/users", post(create_user))
        .route("/api/users/:id/balance", get(get_balance))
        .route("/api/users/:id/transactions", get(get_transactions))
        .route("/api/bets", post(place_bet).get(get_bets))
        .route("/api/bets/cancel", post(cancel_bet))
        .route("/api/provider/callback", post(provider_callback))
        .with_state(state)
}

// ===== Route Handlers =====

/// Health check endpoint, including queue depth for operators
async fn health_check(State(state): State<AppState>) -> Result<Json<HealthResponse>, ApiError> {
    let queue = state.queue.depth().await?;
    Ok(Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        queue,
    }))
}

async fn create_user(
    State(state): State<AppState>,
    Json(req): Json<CreateUserRequest>,
) -> Result<(StatusCode, Json<UserView>), ApiError> {
    if !req.initial_balance.is_finite() || req.initial_balance < 0.0 {
        return Err(ApiError::BadRequest(
            "initial_balance must be a non-negative number".to_string(),
        ));
    }
    let currency = match req.currency {
        Some(c) if c != state.currency => {
            return Err(ApiError::BadRequest("unsupported currency".to_string()))
        }
        Some(c) => c,
        None => state.currency.clone(),
    };
    let user = state
        .ledger
        .create_user(to_amount(req.initial_balance), &currency)
        .await?;
    Ok((StatusCode::CREATED, Json(user.into())))
}

async fn get_balance(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<BalanceResponse>, ApiError> {
    let user = state.ledger.get_user(&user_id).await?;
    Ok(Json(BalanceResponse {
        user_id: user.id,
        balance: from_amount(user.balance),
        currency: user.currency,
    }))
}

async fn get_transactions(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(params): Query<TransactionQuery>,
) -> Result<Json<TransactionsResponse>, ApiError> {
    // Unknown user is a 404, same as the balance endpoint.
    state.ledger.get_user(&user_id).await?;
    let limit = params.limit.unwrap_or(50).min(500);
    let transactions = state.ledger.transactions_for_user(&user_id, limit).await?;
    Ok(Json(TransactionsResponse {
        count: transactions.len(),
        transactions: transactions.into_iter().map(Into::into).collect(),
    }))
}

async fn place_bet(
    State(state): State<AppState>,
    Json(req): Json<PlaceBetRequest>,
) -> Result<(StatusCode, Json<BetActionResponse>), ApiError> {
    let placed = state.placement.place_bet(&req).await?;
    Ok((
        StatusCode::CREATED,
        Json(BetActionResponse {
            success: true,
            bet: placed.bet.into(),
            balance: from_amount(placed.balance),
        }),
    ))
}

async fn cancel_bet(
    State(state): State<AppState>,
    Json(req): Json<CancelBetRequest>,
) -> Result<Json<BetActionResponse>, ApiError> {
    let cancelled = state.placement.cancel_bet(&req.user_id, &req.bet_id).await?;
    Ok(Json(BetActionResponse {
        success: true,
        bet: cancelled.bet.into(),
        balance: from_amount(cancelled.balance),
    }))
}

async fn get_bets(
    State(state): State<AppState>,
    Query(params): Query<BetQuery>,
) -> Result<Json<BetsResponse>, ApiError> {
    let status = match params.status.as_deref() {
        Some(s) => Some(
            BetStatus::parse(s)
                .ok_or_else(|| ApiError::BadRequest(format!("unknown status: {s}")))?,
        ),
        None => None,
    };
    let limit = params.limit.unwrap_or(50).min(500);
    let bets = state.bets.bets_for_user(&params.user_id, status, limit).await?;
    Ok(Json(BetsResponse {
        count: bets.len(),
        bets: bets.into_iter().map(Into::into).collect(),
    }))
}

/// Provider wallet webhook. Verification runs against the raw bytes, so the
/// body is taken unparsed here.
async fn provider_callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let (status, resp) = state.callbacks.process(&headers, &body).await;
    (status, Json(resp)).into_response()
}

// ===== Request/Response Types =====

#[derive(Deserialize)]
struct CreateUserRequest {
    #[serde(default)]
    initial_balance: f64,
    currency: Option<String>,
}

#[derive(Deserialize)]
struct TransactionQuery {
    limit: Option<u32>,
}

#[derive(Deserialize)]
struct BetQuery {
    user_id: String,
    /// Filter by bet status ("matched", "won", ...)
    status: Option<String>,
    limit: Option<u32>,
}

#[derive(Deserialize)]
struct CancelBetRequest {
    user_id: String,
    bet_id: String,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    queue: QueueDepth,
}

#[derive(Serialize)]
struct BalanceResponse {
    user_id: String,
    balance: f64,
    currency: String,
}

#[derive(Serialize)]
struct UserView {
    id: String,
    balance: f64,
    currency: String,
    created_at: i64,
}

impl From<User> for UserView {
    fn from(u: User) -> Self {
        Self {
            id: u.id,
            balance: from_amount(u.balance),
            currency: u.currency,
            created_at: u.created_at,
        }
    }
}

#[derive(Serialize)]
struct TransactionView {
    id: String,
    txn_type: crate::models::TransactionType,
    amount: f64,
    currency: String,
    status: crate::models::TransactionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    external_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    balance_after: Option<f64>,
    created_at: i64,
}

impl From<Transaction> for TransactionView {
    fn from(t: Transaction) -> Self {
        Self {
            id: t.id,
            txn_type: t.txn_type,
            amount: from_amount(t.amount),
            currency: t.currency,
            status: t.status,
            external_ref: t.external_ref,
            balance_after: t.balance_after.map(from_amount),
            created_at: t.created_at,
        }
    }
}

#[derive(Serialize)]
struct TransactionsResponse {
    count: usize,
    transactions: Vec<TransactionView>,
}

#[derive(Serialize)]
struct BetView {
    id: String,
    user_id: String,
    match_id: String,
    event_type_id: String,
    market_id: String,
    selection_id: String,
    market_type: crate::models::MarketType,
    odds: f64,
    stake: f64,
    side: crate::models::BetSide,
    status: BetStatus,
    payout: f64,
    created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    matched_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    settled_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cancelled_at: Option<i64>,
}

impl From<Bet> for BetView {
    fn from(b: Bet) -> Self {
        Self {
            id: b.id,
            user_id: b.user_id,
            match_id: b.match_id,
            event_type_id: b.event_type_id,
            market_id: b.market_id,
            selection_id: b.selection_id,
            market_type: b.market_type,
            odds: b.odds,
            stake: from_amount(b.stake),
            side: b.side,
            status: b.status,
            payout: from_amount(b.payout),
            created_at: b.created_at,
            matched_at: b.matched_at,
            settled_at: b.settled_at,
            cancelled_at: b.cancelled_at,
        }
    }
}

#[derive(Serialize)]
struct BetActionResponse {
    success: bool,
    bet: BetView,
    balance: f64,
}

#[derive(Serialize)]
struct BetsResponse {
    count: usize,
    bets: Vec<BetView>,
}

// ===== Error Handling =====

#[derive(Debug)]
enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Internal(String),
}

impl From<LedgerError> for ApiError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::NotFound => ApiError::NotFound("user not found".to_string()),
            LedgerError::InsufficientBalance => {
                ApiError::BadRequest("Insufficient balance".to_string())
            }
            LedgerError::InvalidAmount => {
                ApiError::BadRequest("amount must be positive".to_string())
            }
            LedgerError::Storage(e) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<BetError> for ApiError {
    fn from(e: BetError) -> Self {
        match e {
            BetError::NotFound => ApiError::NotFound("bet not found".to_string()),
            BetError::Storage(e) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<PlacementError> for ApiError {
    fn from(e: PlacementError) -> Self {
        match e {
            PlacementError::Validation(msg) => ApiError::BadRequest(msg),
            PlacementError::InsufficientBalance => {
                ApiError::BadRequest("Insufficient balance".to_string())
            }
            PlacementError::UserNotFound => ApiError::NotFound("user not found".to_string()),
            PlacementError::BetNotFound => ApiError::NotFound("bet not found".to_string()),
            PlacementError::NotOpen => ApiError::Conflict("bet is not open".to_string()),
            PlacementError::Storage(msg) => ApiError::Internal(msg),
        }
    }
}

impl From<QueueError> for ApiError {
    fn from(e: QueueError) -> Self {
        ApiError::Internal(e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => {
                tracing::error!("internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "success": false,
            "error": message,
        }));

        (status, body).into_response()
    }
}
