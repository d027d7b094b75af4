//! Applies settled results to the matched bets of one group.
//!
//! Each bet settles in its own transaction: the `matched → won/lost` guard
//! and the payout credit commit together, so a replayed declare job (or a
//! concurrent scanner) finds nothing left to do. Payout is `stake * odds`,
//! stake included, credited exactly once.

use anyhow::Result;
use chrono::Utc;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::bets::BetRepository;
use crate::db::DbHandle;
use crate::ledger::LedgerStore;
use crate::models::{Amount, Bet, MarketType, TransactionStatus, TransactionType};
use crate::odds::SelectionOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settled {
    Won,
    Lost,
    /// Already out of `matched` when we got there.
    Skipped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeclareSummary {
    pub won: usize,
    pub lost: usize,
    pub skipped: usize,
}

#[derive(Clone)]
pub struct ResultDeclarer {
    conn: DbHandle,
    repo: BetRepository,
}

impl ResultDeclarer {
    pub fn new(conn: DbHandle, repo: BetRepository) -> Self {
        Self { conn, repo }
    }

    /// Transition every matched bet of the group: selections mapped to
    /// `winner` are paid, everything else loses.
    pub async fn declare(
        &self,
        match_id: &str,
        market_type: MarketType,
        winners: &HashMap<String, SelectionOutcome>,
    ) -> Result<DeclareSummary> {
        if winners.is_empty() {
            // An empty map must never settle a whole group as lost.
            warn!(
                match_id,
                market_type = market_type.as_str(),
                "declare called without results, leaving group matched"
            );
            return Ok(DeclareSummary::default());
        }

        let bets = self.repo.matched_bets_for_group(match_id, market_type).await?;
        let mut summary = DeclareSummary::default();
        for bet in &bets {
            match self.settle_bet(bet, winners).await? {
                Settled::Won => summary.won += 1,
                Settled::Lost => summary.lost += 1,
                Settled::Skipped => summary.skipped += 1,
            }
        }

        info!(
            match_id,
            market_type = market_type.as_str(),
            won = summary.won,
            lost = summary.lost,
            skipped = summary.skipped,
            "results declared"
        );
        Ok(summary)
    }

    async fn settle_bet(
        &self,
        bet: &Bet,
        winners: &HashMap<String, SelectionOutcome>,
    ) -> Result<Settled> {
        let now = Utc::now().timestamp();
        match winners.get(&bet.selection_id) {
            Some(SelectionOutcome::Winner) => {
                let payout = payout_for(bet);
                let mut conn = self.conn.lock().await;
                let tx = conn.transaction()?;
                if !BetRepository::mark_won_in_tx(&tx, &bet.id, payout, now)? {
                    return Ok(Settled::Skipped);
                }
                let balance = LedgerStore::credit_in_tx(&tx, &bet.user_id, payout)?;
                let currency = LedgerStore::user_currency_in_tx(&tx, &bet.user_id)?;
                LedgerStore::record_in_tx(
                    &tx,
                    &bet.user_id,
                    TransactionType::Win,
                    payout,
                    &currency,
                    TransactionStatus::Completed,
                    None,
                    Some(balance),
                )?;
                tx.commit()?;
                debug!(bet_id = %bet.id, payout, "bet won");
                Ok(Settled::Won)
            }
            // Loser, or the provider never listed the selection.
            _ => {
                let mut conn = self.conn.lock().await;
                let tx = conn.transaction()?;
                let changed = BetRepository::mark_lost_in_tx(&tx, &bet.id, now)?;
                tx.commit()?;
                if changed {
                    debug!(bet_id = %bet.id, "bet lost");
                    Ok(Settled::Lost)
                } else {
                    Ok(Settled::Skipped)
                }
            }
        }
    }
}

fn payout_for(bet: &Bet) -> Amount {
    (bet.stake as f64 * bet.odds).round() as Amount
}
