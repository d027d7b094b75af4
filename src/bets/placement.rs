//! Bet placement: validate, debit the stake and create the bet as one unit.
//!
//! There is no order book here. Every accepted bet is matched immediately at
//! the client-supplied odds, which is the behavior the wider platform
//! expects; odds are not re-checked against a live provider price.

use chrono::Utc;
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::bets::repo::{BetError, BetRepository};
use crate::db::DbHandle;
use crate::ledger::{LedgerError, LedgerStore};
use crate::models::{
    to_amount, Amount, Bet, BetSide, BetStatus, MarketType, TransactionStatus, TransactionType,
};
use crate::queue::{JobPayload, JobQueue};

#[derive(Debug, Error)]
pub enum PlacementError {
    #[error("{0}")]
    Validation(String),
    // Message casing is part of the provider wallet protocol.
    #[error("Insufficient balance")]
    InsufficientBalance,
    #[error("user not found")]
    UserNotFound,
    #[error("bet not found")]
    BetNotFound,
    #[error("bet is not open")]
    NotOpen,
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<LedgerError> for PlacementError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::NotFound => PlacementError::UserNotFound,
            LedgerError::InsufficientBalance => PlacementError::InsufficientBalance,
            LedgerError::InvalidAmount => {
                PlacementError::Validation("amount must be positive".to_string())
            }
            LedgerError::Storage(e) => PlacementError::Storage(e.to_string()),
        }
    }
}

impl From<BetError> for PlacementError {
    fn from(e: BetError) -> Self {
        match e {
            BetError::NotFound => PlacementError::BetNotFound,
            BetError::Storage(e) => PlacementError::Storage(e.to_string()),
        }
    }
}

impl From<rusqlite::Error> for PlacementError {
    fn from(e: rusqlite::Error) -> Self {
        PlacementError::Storage(e.to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlaceBetRequest {
    pub user_id: String,
    pub match_id: String,
    pub event_type_id: String,
    pub market_id: String,
    pub selection_id: String,
    pub market_type: MarketType,
    pub odds: f64,
    pub stake: f64,
    #[serde(default = "default_side")]
    pub side: BetSide,
}

fn default_side() -> BetSide {
    BetSide::Back
}

#[derive(Debug, Clone)]
pub struct PlacedBet {
    pub bet: Bet,
    pub balance: Amount,
}

#[derive(Clone)]
pub struct PlacementService {
    conn: DbHandle,
    queue: JobQueue,
    scan_delay_secs: u64,
}

impl PlacementService {
    pub fn new(conn: DbHandle, queue: JobQueue, scan_delay_secs: u64) -> Self {
        Self {
            conn,
            queue,
            scan_delay_secs,
        }
    }

    /// Debit the stake and insert the matched bet in one commit. Either both
    /// happen or neither does.
    pub async fn place_bet(&self, req: &PlaceBetRequest) -> Result<PlacedBet, PlacementError> {
        validate(req)?;
        let stake = to_amount(req.stake);
        if stake <= 0 {
            return Err(PlacementError::Validation(
                "stake is below the smallest representable amount".to_string(),
            ));
        }

        let now = Utc::now().timestamp();
        let bet = Bet {
            id: Uuid::new_v4().to_string(),
            user_id: req.user_id.clone(),
            match_id: req.match_id.clone(),
            event_type_id: req.event_type_id.clone(),
            market_id: req.market_id.clone(),
            selection_id: req.selection_id.clone(),
            market_type: req.market_type,
            odds: req.odds,
            stake,
            side: req.side,
            status: BetStatus::Matched,
            payout: 0,
            created_at: now,
            matched_at: Some(now),
            settled_at: None,
            cancelled_at: None,
            result_checked_at: None,
        };

        let balance = {
            let mut conn = self.conn.lock().await;
            let tx = conn.transaction()?;
            let balance = LedgerStore::debit_in_tx(&tx, &req.user_id, stake)?;
            let currency = LedgerStore::user_currency_in_tx(&tx, &req.user_id)?;
            LedgerStore::record_in_tx(
                &tx,
                &req.user_id,
                TransactionType::Bet,
                stake,
                &currency,
                TransactionStatus::Completed,
                None,
                Some(balance),
            )?;
            BetRepository::insert_in_tx(&tx, &bet)?;
            tx.commit()?;
            balance
        };

        info!(
            bet_id = %bet.id,
            user_id = %bet.user_id,
            match_id = %bet.match_id,
            stake = bet.stake,
            odds = bet.odds,
            "bet placed and matched"
        );

        // Ask the settlement side to look at this match soon, ahead of the
        // periodic scan. The bet stands even if the enqueue fails; the
        // scanner will pick the group up on its own cadence.
        let payload = JobPayload::ScanMatch {
            match_id: bet.match_id.clone(),
            market_type: bet.market_type,
        };
        if let Err(e) = self
            .queue
            .enqueue(&payload, now + self.scan_delay_secs as i64)
            .await
        {
            warn!(bet_id = %bet.id, "could not enqueue settlement scan: {e}");
        }

        Ok(PlacedBet { bet, balance })
    }

    /// Cancel an open bet and refund its stake in one commit.
    pub async fn cancel_bet(
        &self,
        user_id: &str,
        bet_id: &str,
    ) -> Result<PlacedBet, PlacementError> {
        let now = Utc::now().timestamp();
        let (mut bet, balance) = {
            let mut conn = self.conn.lock().await;
            let tx = conn.transaction()?;
            let bet =
                BetRepository::get_in_tx(&tx, bet_id)?.ok_or(PlacementError::BetNotFound)?;
            if bet.user_id != user_id {
                return Err(PlacementError::BetNotFound);
            }
            if !BetRepository::cancel_in_tx(&tx, bet_id, now)? {
                return Err(PlacementError::NotOpen);
            }
            let balance = LedgerStore::credit_in_tx(&tx, user_id, bet.stake)?;
            let currency = LedgerStore::user_currency_in_tx(&tx, user_id)?;
            LedgerStore::record_in_tx(
                &tx,
                user_id,
                TransactionType::Refund,
                bet.stake,
                &currency,
                TransactionStatus::Completed,
                None,
                Some(balance),
            )?;
            tx.commit()?;
            (bet, balance)
        };
        bet.status = BetStatus::Cancelled;
        bet.cancelled_at = Some(now);

        info!(bet_id = %bet.id, user_id = %bet.user_id, "bet cancelled, stake refunded");
        Ok(PlacedBet { bet, balance })
    }
}

fn validate(req: &PlaceBetRequest) -> Result<(), PlacementError> {
    let reject = |msg: &str| Err(PlacementError::Validation(msg.to_string()));
    if req.user_id.trim().is_empty() {
        return reject("user_id is required");
    }
    if req.match_id.trim().is_empty() {
        return reject("match_id is required");
    }
    if req.market_id.trim().is_empty() {
        return reject("market_id is required");
    }
    if req.selection_id.trim().is_empty() {
        return reject("selection_id is required");
    }
    if !req.stake.is_finite() || req.stake <= 0.0 {
        return reject("stake must be a positive number");
    }
    if !req.odds.is_finite() || req.odds <= 0.0 {
        return reject("odds must be a positive number");
    }
    Ok(())
}
