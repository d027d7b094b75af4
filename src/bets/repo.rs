//! Bet repository: durable bet rows plus the guarded lifecycle transitions.
//!
//! Settlement correctness leans on the guards here: `matched → won/lost` and
//! `matched → cancelled` only fire while the row is still `matched`, so a
//! second settlement pass (or a retried queue job) finds nothing to do.

use rusqlite::{params, OptionalExtension};
use thiserror::Error;

use crate::db::DbHandle;
use crate::models::{Amount, Bet, BetStatus, MarketType};

#[derive(Debug, Error)]
pub enum BetError {
    #[error("bet not found")]
    NotFound,
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
}

#[derive(Clone)]
pub struct BetRepository {
    conn: DbHandle,
}

impl BetRepository {
    pub async fn new(conn: DbHandle) -> Result<Self, BetError> {
        {
            let c = conn.lock().await;
            c.execute_batch(
                "CREATE TABLE IF NOT EXISTS bets (
                    id TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL REFERENCES users(id),
                    match_id TEXT NOT NULL,
                    event_type_id TEXT NOT NULL,
                    market_id TEXT NOT NULL,
                    selection_id TEXT NOT NULL,
                    market_type TEXT NOT NULL,
                    odds REAL NOT NULL,
                    stake INTEGER NOT NULL,
                    side TEXT NOT NULL,
                    status TEXT NOT NULL,
                    payout INTEGER NOT NULL DEFAULT 0,
                    created_at INTEGER NOT NULL,
                    matched_at INTEGER,
                    settled_at INTEGER,
                    cancelled_at INTEGER,
                    result_checked_at INTEGER
                );
                CREATE INDEX IF NOT EXISTS idx_bets_user ON bets(user_id);
                CREATE INDEX IF NOT EXISTS idx_bets_scan
                    ON bets(status, match_id, market_type);",
            )?;
        }
        Ok(Self { conn })
    }

    pub async fn get(&self, bet_id: &str) -> Result<Bet, BetError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!("{SELECT_BET} WHERE id = ?1"))?;
        stmt.query_row(params![bet_id], map_bet)
            .optional()?
            .ok_or(BetError::NotFound)
    }

    pub async fn bets_for_user(
        &self,
        user_id: &str,
        status: Option<BetStatus>,
        limit: u32,
    ) -> Result<Vec<Bet>, BetError> {
        let conn = self.conn.lock().await;
        let rows = match status {
            Some(status) => {
                let mut stmt = conn.prepare_cached(&format!(
                    "{SELECT_BET} WHERE user_id = ?1 AND status = ?2
                     ORDER BY created_at DESC, id LIMIT ?3"
                ))?;
                let rows = stmt
                    .query_map(params![user_id, status, limit], map_bet)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
            None => {
                let mut stmt = conn.prepare_cached(&format!(
                    "{SELECT_BET} WHERE user_id = ?1
                     ORDER BY created_at DESC, id LIMIT ?2"
                ))?;
                let rows = stmt
                    .query_map(params![user_id, limit], map_bet)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
        };
        Ok(rows)
    }

    /// Distinct (match, market-type) groups holding `matched` bets whose last
    /// result check is older than the cutoff (or never happened).
    pub async fn matched_groups(
        &self,
        checked_before: i64,
    ) -> Result<Vec<(String, MarketType)>, BetError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT DISTINCT match_id, market_type FROM bets
             WHERE status = 'matched'
               AND (result_checked_at IS NULL OR result_checked_at < ?1)
             ORDER BY match_id",
        )?;
        let rows = stmt
            .query_map(params![checked_before], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, MarketType>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Stamp the whole group before asking the provider anything; the stamp
    /// is what keeps overlapping scanner runs from re-picking the group.
    pub async fn stamp_result_checked(
        &self,
        match_id: &str,
        market_type: MarketType,
        now: i64,
    ) -> Result<usize, BetError> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE bets SET result_checked_at = ?1
             WHERE match_id = ?2 AND market_type = ?3 AND status = 'matched'",
            params![now, match_id, market_type],
        )?;
        Ok(changed)
    }

    pub async fn matched_bets_for_group(
        &self,
        match_id: &str,
        market_type: MarketType,
    ) -> Result<Vec<Bet>, BetError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "{SELECT_BET} WHERE match_id = ?1 AND market_type = ?2 AND status = 'matched'
             ORDER BY created_at, id"
        ))?;
        let rows = stmt
            .query_map(params![match_id, market_type], map_bet)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ------------------------------------------------------------------
    // In-transaction building blocks
    // ------------------------------------------------------------------

    pub(crate) fn get_in_tx(
        tx: &rusqlite::Transaction<'_>,
        bet_id: &str,
    ) -> Result<Option<Bet>, BetError> {
        Ok(tx
            .query_row(
                &format!("{SELECT_BET} WHERE id = ?1"),
                params![bet_id],
                map_bet,
            )
            .optional()?)
    }

    pub(crate) fn insert_in_tx(
        tx: &rusqlite::Transaction<'_>,
        bet: &Bet,
    ) -> Result<(), BetError> {
        tx.execute(
            "INSERT INTO bets
                (id, user_id, match_id, event_type_id, market_id, selection_id,
                 market_type, odds, stake, side, status, payout, created_at,
                 matched_at, settled_at, cancelled_at, result_checked_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                     ?14, ?15, ?16, ?17)",
            params![
                bet.id,
                bet.user_id,
                bet.match_id,
                bet.event_type_id,
                bet.market_id,
                bet.selection_id,
                bet.market_type,
                bet.odds,
                bet.stake,
                bet.side,
                bet.status,
                bet.payout,
                bet.created_at,
                bet.matched_at,
                bet.settled_at,
                bet.cancelled_at,
                bet.result_checked_at,
            ],
        )?;
        Ok(())
    }

    /// `matched → won`, settling payout exactly once. Returns false when the
    /// bet already left `matched`.
    pub(crate) fn mark_won_in_tx(
        tx: &rusqlite::Transaction<'_>,
        bet_id: &str,
        payout: Amount,
        now: i64,
    ) -> Result<bool, BetError> {
        let changed = tx.execute(
            "UPDATE bets SET status = 'won', payout = ?1, settled_at = ?2
             WHERE id = ?3 AND status = 'matched'",
            params![payout, now, bet_id],
        )?;
        Ok(changed > 0)
    }

    /// `matched → lost` with payout 0.
    pub(crate) fn mark_lost_in_tx(
        tx: &rusqlite::Transaction<'_>,
        bet_id: &str,
        now: i64,
    ) -> Result<bool, BetError> {
        let changed = tx.execute(
            "UPDATE bets SET status = 'lost', payout = 0, settled_at = ?1
             WHERE id = ?2 AND status = 'matched'",
            params![now, bet_id],
        )?;
        Ok(changed > 0)
    }

    /// `pending/matched → cancelled`. The caller refunds the stake in the
    /// same transaction.
    pub(crate) fn cancel_in_tx(
        tx: &rusqlite::Transaction<'_>,
        bet_id: &str,
        now: i64,
    ) -> Result<bool, BetError> {
        let changed = tx.execute(
            "UPDATE bets SET status = 'cancelled', cancelled_at = ?1
             WHERE id = ?2 AND status IN ('pending', 'matched')",
            params![now, bet_id],
        )?;
        Ok(changed > 0)
    }
}

const SELECT_BET: &str = "SELECT id, user_id, match_id, event_type_id, market_id, selection_id,
        market_type, odds, stake, side, status, payout, created_at, matched_at,
        settled_at, cancelled_at, result_checked_at FROM bets";

fn map_bet(row: &rusqlite::Row<'_>) -> rusqlite::Result<Bet> {
    Ok(Bet {
        id: row.get(0)?,
        user_id: row.get(1)?,
        match_id: row.get(2)?,
        event_type_id: row.get(3)?,
        market_id: row.get(4)?,
        selection_id: row.get(5)?,
        market_type: row.get(6)?,
        odds: row.get(7)?,
        stake: row.get(8)?,
        side: row.get(9)?,
        status: row.get(10)?,
        payout: row.get(11)?,
        created_at: row.get(12)?,
        matched_at: row.get(13)?,
        settled_at: row.get(14)?,
        cancelled_at: row.get(15)?,
        result_checked_at: row.get(16)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{self, DbHandle};
    use crate::models::{to_amount, BetSide};
    use chrono::Utc;
    use tempfile::NamedTempFile;
    use uuid::Uuid;

    async fn create_test_repo() -> (BetRepository, DbHandle, NamedTempFile) {
        let file = NamedTempFile::new().unwrap();
        let conn = db::open(file.path().to_str().unwrap()).unwrap();
        // Bets reference users; the ledger schema has to exist first.
        crate::ledger::LedgerStore::new(conn.clone()).await.unwrap();
        let repo = BetRepository::new(conn.clone()).await.unwrap();
        (repo, conn, file)
    }

    fn sample_bet(user_id: &str, match_id: &str, selection_id: &str) -> Bet {
        let now = Utc::now().timestamp();
        Bet {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            match_id: match_id.to_string(),
            event_type_id: "4".to_string(),
            market_id: "1.234".to_string(),
            selection_id: selection_id.to_string(),
            market_type: MarketType::MatchOdds,
            odds: 2.0,
            stake: to_amount(200.0),
            side: BetSide::Back,
            status: BetStatus::Matched,
            payout: 0,
            created_at: now,
            matched_at: Some(now),
            settled_at: None,
            cancelled_at: None,
            result_checked_at: None,
        }
    }

    async fn insert(conn: &DbHandle, bet: &Bet) {
        let mut c = conn.lock().await;
        let tx = c.transaction().unwrap();
        BetRepository::insert_in_tx(&tx, bet).unwrap();
        tx.commit().unwrap();
    }

    async fn seed_user(conn: &DbHandle) -> String {
        let ledger = crate::ledger::LedgerStore::new(conn.clone()).await.unwrap();
        ledger.create_user(to_amount(1000.0), "USD").await.unwrap().id
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let (repo, conn, _f) = create_test_repo().await;
        let user = seed_user(&conn).await;
        let bet = sample_bet(&user, "m-1", "sel-a");
        insert(&conn, &bet).await;

        let loaded = repo.get(&bet.id).await.unwrap();
        assert_eq!(loaded.stake, to_amount(200.0));
        assert_eq!(loaded.status, BetStatus::Matched);
        assert_eq!(loaded.market_type, MarketType::MatchOdds);
        assert!(matches!(repo.get("missing").await, Err(BetError::NotFound)));
    }

    #[tokio::test]
    async fn test_matched_groups_and_throttle() {
        let (repo, conn, _f) = create_test_repo().await;
        let user = seed_user(&conn).await;
        insert(&conn, &sample_bet(&user, "m-1", "sel-a")).await;
        insert(&conn, &sample_bet(&user, "m-1", "sel-b")).await;
        insert(&conn, &sample_bet(&user, "m-2", "sel-a")).await;

        let now = Utc::now().timestamp();
        let groups = repo.matched_groups(now - 3600).await.unwrap();
        assert_eq!(groups.len(), 2);

        // Stamping hides the group until the cutoff passes it again.
        let stamped = repo
            .stamp_result_checked("m-1", MarketType::MatchOdds, now)
            .await
            .unwrap();
        assert_eq!(stamped, 2);
        let groups = repo.matched_groups(now - 3600).await.unwrap();
        assert_eq!(groups, vec![("m-2".to_string(), MarketType::MatchOdds)]);

        // An hour later the stamped group is due again.
        let groups = repo.matched_groups(now + 3601).await.unwrap();
        assert_eq!(groups.len(), 2);
    }

    #[tokio::test]
    async fn test_settle_transitions_are_guarded() {
        let (repo, conn, _f) = create_test_repo().await;
        let user = seed_user(&conn).await;
        let bet = sample_bet(&user, "m-1", "sel-a");
        insert(&conn, &bet).await;
        let now = Utc::now().timestamp();

        {
            let mut c = conn.lock().await;
            let tx = c.transaction().unwrap();
            assert!(BetRepository::mark_won_in_tx(&tx, &bet.id, to_amount(400.0), now).unwrap());
            // Second settle finds the bet already out of `matched`.
            assert!(!BetRepository::mark_won_in_tx(&tx, &bet.id, to_amount(999.0), now).unwrap());
            assert!(!BetRepository::mark_lost_in_tx(&tx, &bet.id, now).unwrap());
            assert!(!BetRepository::cancel_in_tx(&tx, &bet.id, now).unwrap());
            tx.commit().unwrap();
        }

        let loaded = repo.get(&bet.id).await.unwrap();
        assert_eq!(loaded.status, BetStatus::Won);
        assert_eq!(loaded.payout, to_amount(400.0));
        assert_eq!(loaded.settled_at, Some(now));
    }

    #[tokio::test]
    async fn test_bets_for_user_filters_status() {
        let (repo, conn, _f) = create_test_repo().await;
        let user = seed_user(&conn).await;
        let won = sample_bet(&user, "m-1", "sel-a");
        insert(&conn, &won).await;
        insert(&conn, &sample_bet(&user, "m-2", "sel-b")).await;
        {
            let mut c = conn.lock().await;
            let tx = c.transaction().unwrap();
            BetRepository::mark_won_in_tx(&tx, &won.id, to_amount(400.0), 1).unwrap();
            tx.commit().unwrap();
        }

        let all = repo.bets_for_user(&user, None, 10).await.unwrap();
        assert_eq!(all.len(), 2);
        let matched = repo
            .bets_for_user(&user, Some(BetStatus::Matched), 10)
            .await
            .unwrap();
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].match_id, "m-2");
    }
}
