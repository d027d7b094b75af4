//! Provider wallet callbacks: balance, bet, win, refund, rollback.
//!
//! The provider delivers these at-least-once and concurrently. Money safety
//! comes from doing the idempotency lookup and the balance mutation inside
//! one SQLite transaction: a duplicate delivery either sees the committed
//! `external_ref` row and replays the stored result, or lost the race and
//! fails on the UNIQUE constraint. Either way the effect applies once.

use axum::http::{HeaderMap, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::db::DbHandle;
use crate::ledger::{LedgerError, LedgerStore};
use crate::models::{from_amount, to_amount, TransactionStatus, TransactionType};
use crate::provider::signature::{CallbackHeaders, SignatureVerifier};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackAction {
    Balance,
    Bet,
    Win,
    Refund,
    Rollback,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackRequest {
    pub action: CallbackAction,
    pub player_id: String,
    pub currency: String,
    #[serde(default)]
    pub amount: Option<f64>,
    #[serde(default)]
    pub transaction_id: Option<String>,
    #[serde(default)]
    pub rollback_transactions: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CallbackResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub balance: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rolled_back: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped: Option<Vec<String>>,
}

impl CallbackResponse {
    fn ok(balance: i64) -> Self {
        Self {
            success: true,
            balance: Some(from_amount(balance)),
            ..Default::default()
        }
    }

    fn ok_with_txn(balance: i64, transaction_id: String) -> Self {
        Self {
            transaction_id: Some(transaction_id),
            ..Self::ok(balance)
        }
    }

    fn err(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(msg.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Error)]
enum CallbackError {
    #[error("{0}")]
    Validation(String),
    // Message casing is part of the provider wallet protocol.
    #[error("Insufficient balance")]
    InsufficientBalance,
    #[error("player not found")]
    PlayerNotFound,
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<LedgerError> for CallbackError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::NotFound => CallbackError::PlayerNotFound,
            LedgerError::InsufficientBalance => CallbackError::InsufficientBalance,
            LedgerError::InvalidAmount => {
                CallbackError::Validation("amount must be positive".to_string())
            }
            LedgerError::Storage(e) => CallbackError::Storage(e.to_string()),
        }
    }
}

impl From<rusqlite::Error> for CallbackError {
    fn from(e: rusqlite::Error) -> Self {
        CallbackError::Storage(e.to_string())
    }
}

fn status_for(e: &CallbackError) -> StatusCode {
    match e {
        CallbackError::Validation(_) | CallbackError::InsufficientBalance => {
            StatusCode::BAD_REQUEST
        }
        CallbackError::PlayerNotFound => StatusCode::NOT_FOUND,
        CallbackError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[derive(Clone)]
pub struct CallbackService {
    conn: DbHandle,
    ledger: LedgerStore,
    verifier: SignatureVerifier,
    currency: String,
}

impl CallbackService {
    pub fn new(ledger: LedgerStore, verifier: SignatureVerifier, currency: &str) -> Self {
        Self {
            conn: ledger.handle(),
            ledger,
            verifier,
            currency: currency.to_string(),
        }
    }

    /// Full callback pipeline: authenticate the raw bytes, parse, validate
    /// currency, dispatch on action.
    pub async fn process(
        &self,
        headers: &HeaderMap,
        raw_body: &[u8],
    ) -> (StatusCode, CallbackResponse) {
        let auth = match CallbackHeaders::from_header_map(headers) {
            Ok(h) => h,
            Err(e) => {
                warn!("callback rejected: {e}");
                return (StatusCode::BAD_REQUEST, CallbackResponse::err(e.to_string()));
            }
        };

        let body = match self.verifier.verify(&auth, raw_body) {
            Ok(body) => body,
            Err(e) => {
                // Enough context to audit, never the secret.
                warn!(
                    merchant_id = %auth.merchant_id,
                    timestamp = %auth.timestamp,
                    nonce = %auth.nonce,
                    "callback signature rejected: {e}"
                );
                return (StatusCode::BAD_REQUEST, CallbackResponse::err(e.to_string()));
            }
        };

        let req: CallbackRequest = match serde_json::from_value(body) {
            Ok(req) => req,
            Err(e) => {
                return (
                    StatusCode::BAD_REQUEST,
                    CallbackResponse::err(format!("invalid request: {e}")),
                )
            }
        };

        if req.currency != self.currency {
            warn!(
                currency = %req.currency,
                expected = %self.currency,
                "callback with unsupported currency"
            );
            return (
                StatusCode::BAD_REQUEST,
                CallbackResponse::err("unsupported currency"),
            );
        }

        match self.dispatch(&req).await {
            Ok(resp) => (StatusCode::OK, resp),
            Err(e) => {
                if let CallbackError::Storage(msg) = &e {
                    error!(player_id = %req.player_id, "callback storage failure: {msg}");
                }
                (status_for(&e), CallbackResponse::err(e.to_string()))
            }
        }
    }

    async fn dispatch(&self, req: &CallbackRequest) -> Result<CallbackResponse, CallbackError> {
        match req.action {
            CallbackAction::Balance => self.balance(req).await,
            CallbackAction::Bet => self.apply_once(req, TransactionType::Bet).await,
            CallbackAction::Win => self.apply_once(req, TransactionType::Win).await,
            CallbackAction::Refund => self.apply_once(req, TransactionType::Refund).await,
            CallbackAction::Rollback => self.rollback(req).await,
        }
    }

    async fn balance(&self, req: &CallbackRequest) -> Result<CallbackResponse, CallbackError> {
        let balance = self.ledger.get_balance(&req.player_id).await?;
        Ok(CallbackResponse::ok(balance))
    }

    /// `bet` / `win` / `refund`: apply the delta at most once per provider
    /// transaction id. A replay answers with the balance the original commit
    /// produced, which the provider requires to be identical.
    async fn apply_once(
        &self,
        req: &CallbackRequest,
        txn_type: TransactionType,
    ) -> Result<CallbackResponse, CallbackError> {
        let txn_ref = req
            .transaction_id
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| CallbackError::Validation("transaction_id is required".to_string()))?;
        let raw_amount = req
            .amount
            .ok_or_else(|| CallbackError::Validation("amount is required".to_string()))?;
        if !raw_amount.is_finite() || raw_amount <= 0.0 {
            return Err(CallbackError::Validation(
                "amount must be a positive number".to_string(),
            ));
        }
        let amount = to_amount(raw_amount);
        if amount <= 0 {
            return Err(CallbackError::Validation(
                "amount is below the smallest representable amount".to_string(),
            ));
        }

        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        if let Some(prev) = LedgerStore::find_by_reference_in_tx(&tx, txn_ref)? {
            let balance = match prev.balance_after {
                Some(b) => b,
                None => LedgerStore::balance_in_tx(&tx, &req.player_id)?,
            };
            debug!(
                txn_ref,
                player_id = %req.player_id,
                "duplicate delivery, replaying stored result"
            );
            return Ok(CallbackResponse::ok_with_txn(balance, prev.id));
        }

        let balance = if txn_type.is_debit() {
            LedgerStore::debit_in_tx(&tx, &req.player_id, amount)?
        } else {
            LedgerStore::credit_in_tx(&tx, &req.player_id, amount)?
        };
        let recorded = LedgerStore::record_in_tx(
            &tx,
            &req.player_id,
            txn_type,
            amount,
            &self.currency,
            TransactionStatus::Completed,
            Some(txn_ref),
            Some(balance),
        )?;
        tx.commit()?;

        info!(
            txn_ref,
            player_id = %req.player_id,
            txn_type = txn_type.as_str(),
            amount,
            "provider transaction applied"
        );
        Ok(CallbackResponse::ok_with_txn(balance, recorded.id))
    }

    /// Undo previously applied transactions. The whole list commits as one
    /// unit; individual references that cannot be reversed are skipped and
    /// reported, never fatal.
    async fn rollback(&self, req: &CallbackRequest) -> Result<CallbackResponse, CallbackError> {
        let refs = req.rollback_transactions.as_ref().ok_or_else(|| {
            CallbackError::Validation("rollback_transactions is required".to_string())
        })?;

        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let mut rolled_back = Vec::new();
        let mut skipped = Vec::new();

        for txn_ref in refs {
            let Some(orig) = LedgerStore::find_by_reference_in_tx(&tx, txn_ref)? else {
                debug!(txn_ref, "rollback reference unknown, skipping");
                skipped.push(txn_ref.clone());
                continue;
            };
            if orig.status == TransactionStatus::RolledBack {
                // Replay of an earlier rollback; report it, move no money.
                rolled_back.push(txn_ref.clone());
                continue;
            }

            let balance = if orig.txn_type.is_debit() {
                // Undo a debit by crediting the amount back.
                LedgerStore::credit_in_tx(&tx, &orig.user_id, orig.amount)?
            } else {
                // Undo a credit by debiting; winnings already spent would
                // take the balance negative, so the reference is skipped.
                match LedgerStore::debit_in_tx(&tx, &orig.user_id, orig.amount) {
                    Ok(balance) => balance,
                    Err(LedgerError::InsufficientBalance) => {
                        warn!(
                            txn_ref,
                            user_id = %orig.user_id,
                            "rollback would overdraw the balance, skipping"
                        );
                        skipped.push(txn_ref.clone());
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                }
            };

            LedgerStore::mark_rolled_back_in_tx(&tx, &orig.id)?;
            LedgerStore::record_in_tx(
                &tx,
                &orig.user_id,
                TransactionType::RolledBack,
                orig.amount,
                &orig.currency,
                TransactionStatus::Completed,
                None,
                Some(balance),
            )?;
            rolled_back.push(txn_ref.clone());
        }

        let balance = LedgerStore::balance_in_tx(&tx, &req.player_id)?;
        tx.commit()?;

        info!(
            player_id = %req.player_id,
            rolled_back = rolled_back.len(),
            skipped = skipped.len(),
            "rollback processed"
        );
        Ok(CallbackResponse {
            success: true,
            balance: Some(from_amount(balance)),
            rolled_back: Some(rolled_back),
            skipped: Some(skipped),
            ..Default::default()
        })
    }
}
