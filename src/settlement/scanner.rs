//! Periodic settlement scan.
//!
//! Every cycle lists the (match, market-type) groups still holding matched
//! bets, skips the ones checked within the recheck window, and asks the
//! provider whether each match has finished. Groups are stamped
//! `result_checked_at = now` BEFORE the provider is queried; overlapping
//! runs therefore drop the group instead of racing each other. That stamp is
//! cooperative, not a lock: the guarded `matched → won/lost` transition in
//! the declare path is what actually makes double-processing harmless.

use anyhow::Result;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::bets::BetRepository;
use crate::models::MarketType;
use crate::odds::OddsApi;
use crate::queue::{JobPayload, JobQueue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    /// Another task in this process is already scanning the group.
    InFlight,
    NotFinished,
    /// Match finished but the provider has no usable results yet; the group
    /// stays matched for a later scan. Expected state, not an error.
    NoResults,
    Enqueued,
}

#[derive(Clone)]
pub struct SettlementScanner {
    repo: BetRepository,
    odds: Arc<dyn OddsApi>,
    queue: JobQueue,
    recheck_secs: u64,
    in_flight: Arc<Mutex<HashSet<(String, MarketType)>>>,
}

impl SettlementScanner {
    pub fn new(
        repo: BetRepository,
        odds: Arc<dyn OddsApi>,
        queue: JobQueue,
        recheck_secs: u64,
    ) -> Self {
        Self {
            repo,
            odds,
            queue,
            recheck_secs,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// One pass over every due group. Returns how many declare jobs were
    /// enqueued.
    pub async fn run_cycle(&self) -> Result<usize> {
        let now = Utc::now().timestamp();
        let cutoff = now - self.recheck_secs as i64;
        let groups = self.repo.matched_groups(cutoff).await?;
        if groups.is_empty() {
            return Ok(0);
        }
        debug!(groups = groups.len(), "settlement scan cycle");

        let mut enqueued = 0;
        for (match_id, market_type) in groups {
            match self.scan_group(&match_id, market_type).await {
                Ok(ScanOutcome::Enqueued) => enqueued += 1,
                Ok(_) => {}
                Err(e) => warn!(
                    match_id = %match_id,
                    market_type = market_type.as_str(),
                    "group scan failed: {e:#}"
                ),
            }
        }
        Ok(enqueued)
    }

    /// Check one group against the provider. Also the entry point for the
    /// placement-time scan jobs, which bypass the recheck window on purpose.
    pub async fn scan_group(
        &self,
        match_id: &str,
        market_type: MarketType,
    ) -> Result<ScanOutcome> {
        let key = (match_id.to_string(), market_type);
        if !self.in_flight.lock().insert(key.clone()) {
            return Ok(ScanOutcome::InFlight);
        }
        let outcome = self.scan_group_inner(match_id, market_type).await;
        self.in_flight.lock().remove(&key);
        outcome
    }

    async fn scan_group_inner(
        &self,
        match_id: &str,
        market_type: MarketType,
    ) -> Result<ScanOutcome> {
        let now = Utc::now().timestamp();
        // Stamp first. If the provider call below fails the group stays
        // muted for one recheck window, which is the accepted cost.
        self.repo
            .stamp_result_checked(match_id, market_type, now)
            .await?;

        let state = self.odds.match_state(match_id).await?;
        if !state.is_finished() {
            debug!(match_id, "match not finished yet");
            return Ok(ScanOutcome::NotFinished);
        }

        let results = self.odds.market_results(match_id, market_type).await?;
        let winners = results.winner_map();
        if winners.is_empty() {
            debug!(
                match_id,
                market_type = market_type.as_str(),
                "finished but no settled results yet"
            );
            return Ok(ScanOutcome::NoResults);
        }

        let payload = JobPayload::DeclareResult {
            match_id: match_id.to_string(),
            market_type,
            winners,
        };
        self.queue.enqueue(&payload, now).await?;
        info!(
            match_id,
            market_type = market_type.as_str(),
            "results available, declare job enqueued"
        );
        Ok(ScanOutcome::Enqueued)
    }

    /// Fixed-interval loop. The first tick fires immediately, which doubles
    /// as the startup scan.
    pub fn spawn(self, scan_secs: u64) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(scan_secs.max(1)));
            loop {
                ticker.tick().await;
                match self.run_cycle().await {
                    Ok(n) if n > 0 => info!(enqueued = n, "settlement scan complete"),
                    Ok(_) => {}
                    Err(e) => warn!("settlement scan failed: {e:#}"),
                }
            }
        })
    }
}
