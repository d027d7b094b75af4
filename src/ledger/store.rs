//! Ledger store: the single source of truth for balances.
//!
//! Every mutation is a relative delta applied inside a SQLite transaction,
//! never an overwrite of a previously read total. The `transactions` table
//! doubles as the idempotency guard: provider transaction ids land in
//! `external_ref` (UNIQUE), and `balance_after` preserves the balance a
//! commit produced so duplicate deliveries can answer with the original
//! result.
//!
//! Composable `*_in_tx` helpers operate on a caller-supplied
//! `rusqlite::Transaction` so the placement service and callback handler can
//! span ledger + bet writes in one commit.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use thiserror::Error;
use uuid::Uuid;

use crate::db::DbHandle;
use crate::models::{Amount, Transaction, TransactionStatus, TransactionType, User};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("user not found")]
    NotFound,
    // Message casing is part of the provider wallet protocol.
    #[error("Insufficient balance")]
    InsufficientBalance,
    #[error("amount must be positive")]
    InvalidAmount,
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
}

#[derive(Clone)]
pub struct LedgerStore {
    conn: DbHandle,
}

impl LedgerStore {
    /// Wrap the shared connection and make sure the money tables exist.
    pub async fn new(conn: DbHandle) -> Result<Self, LedgerError> {
        {
            let c = conn.lock().await;
            c.execute_batch(
                "CREATE TABLE IF NOT EXISTS users (
                    id TEXT PRIMARY KEY,
                    balance INTEGER NOT NULL DEFAULT 0,
                    currency TEXT NOT NULL,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL
                );
                CREATE TABLE IF NOT EXISTS transactions (
                    id TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL REFERENCES users(id),
                    txn_type TEXT NOT NULL,
                    amount INTEGER NOT NULL,
                    currency TEXT NOT NULL,
                    status TEXT NOT NULL,
                    external_ref TEXT UNIQUE,
                    balance_after INTEGER,
                    created_at INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_transactions_user
                    ON transactions(user_id, created_at);",
            )?;
        }
        Ok(Self { conn })
    }

    /// Create a user, recording any starting balance as a `deposit` so the
    /// balance stays the sum of committed transactions.
    pub async fn create_user(
        &self,
        initial_balance: Amount,
        currency: &str,
    ) -> Result<User, LedgerError> {
        if initial_balance < 0 {
            return Err(LedgerError::InvalidAmount);
        }
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let now = Utc::now().timestamp();
        let id = Uuid::new_v4().to_string();
        tx.execute(
            "INSERT INTO users (id, balance, currency, created_at, updated_at)
             VALUES (?1, 0, ?2, ?3, ?3)",
            params![id, currency, now],
        )?;
        let mut balance = 0;
        if initial_balance > 0 {
            balance = Self::credit_in_tx(&tx, &id, initial_balance)?;
            Self::record_in_tx(
                &tx,
                &id,
                TransactionType::Deposit,
                initial_balance,
                currency,
                TransactionStatus::Completed,
                None,
                Some(balance),
            )?;
        }
        tx.commit()?;
        Ok(User {
            id,
            balance,
            currency: currency.to_string(),
            created_at: now,
            updated_at: now,
        })
    }

    pub async fn get_user(&self, user_id: &str) -> Result<User, LedgerError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, balance, currency, created_at, updated_at FROM users WHERE id = ?1",
        )?;
        stmt.query_row(params![user_id], |row| {
            Ok(User {
                id: row.get(0)?,
                balance: row.get(1)?,
                currency: row.get(2)?,
                created_at: row.get(3)?,
                updated_at: row.get(4)?,
            })
        })
        .optional()?
        .ok_or(LedgerError::NotFound)
    }

    pub async fn get_balance(&self, user_id: &str) -> Result<Amount, LedgerError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached("SELECT balance FROM users WHERE id = ?1")?;
        stmt.query_row(params![user_id], |row| row.get(0))
            .optional()?
            .ok_or(LedgerError::NotFound)
    }

    /// Debit `amount` from the user and append the matching transaction row,
    /// in one commit. Fails without effect when balance < amount.
    pub async fn debit(
        &self,
        user_id: &str,
        amount: Amount,
        txn_type: TransactionType,
        external_ref: Option<&str>,
    ) -> Result<Transaction, LedgerError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let balance = Self::debit_in_tx(&tx, user_id, amount)?;
        let currency = Self::user_currency_in_tx(&tx, user_id)?;
        let record = Self::record_in_tx(
            &tx,
            user_id,
            txn_type,
            amount,
            &currency,
            TransactionStatus::Completed,
            external_ref,
            Some(balance),
        )?;
        tx.commit()?;
        Ok(record)
    }

    /// Credit counterpart of [`debit`](Self::debit).
    pub async fn credit(
        &self,
        user_id: &str,
        amount: Amount,
        txn_type: TransactionType,
        external_ref: Option<&str>,
    ) -> Result<Transaction, LedgerError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let balance = Self::credit_in_tx(&tx, user_id, amount)?;
        let currency = Self::user_currency_in_tx(&tx, user_id)?;
        let record = Self::record_in_tx(
            &tx,
            user_id,
            txn_type,
            amount,
            &currency,
            TransactionStatus::Completed,
            external_ref,
            Some(balance),
        )?;
        tx.commit()?;
        Ok(record)
    }

    pub async fn deposit(&self, user_id: &str, amount: Amount) -> Result<Transaction, LedgerError> {
        self.credit(user_id, amount, TransactionType::Deposit, None)
            .await
    }

    pub async fn withdraw(
        &self,
        user_id: &str,
        amount: Amount,
    ) -> Result<Transaction, LedgerError> {
        self.debit(user_id, amount, TransactionType::Withdraw, None)
            .await
    }

    /// Look up a provider-originated transaction by its external id.
    pub async fn find_by_reference(
        &self,
        external_ref: &str,
    ) -> Result<Option<Transaction>, LedgerError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, user_id, txn_type, amount, currency, status, external_ref,
                    balance_after, created_at
             FROM transactions WHERE external_ref = ?1",
        )?;
        Ok(stmt
            .query_row(params![external_ref], map_transaction)
            .optional()?)
    }

    /// Recent transaction history, newest first.
    pub async fn transactions_for_user(
        &self,
        user_id: &str,
        limit: u32,
    ) -> Result<Vec<Transaction>, LedgerError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, user_id, txn_type, amount, currency, status, external_ref,
                    balance_after, created_at
             FROM transactions WHERE user_id = ?1
             ORDER BY created_at DESC, id LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![user_id, limit], map_transaction)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Clone of the underlying handle for services composing their own
    /// transactions.
    pub fn handle(&self) -> DbHandle {
        self.conn.clone()
    }

    // ------------------------------------------------------------------
    // In-transaction building blocks
    // ------------------------------------------------------------------

    /// Conditional decrement: subtracts only when the row still holds at
    /// least `amount`, so concurrent debits can never overdraft. Returns the
    /// balance after the debit.
    pub(crate) fn debit_in_tx(
        tx: &rusqlite::Transaction<'_>,
        user_id: &str,
        amount: Amount,
    ) -> Result<Amount, LedgerError> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount);
        }
        let changed = tx.execute(
            "UPDATE users SET balance = balance - ?1, updated_at = ?2
             WHERE id = ?3 AND balance >= ?1",
            params![amount, Utc::now().timestamp(), user_id],
        )?;
        if changed == 0 {
            // Distinguish a missing user from a short balance.
            let exists: Option<Amount> = tx
                .query_row(
                    "SELECT balance FROM users WHERE id = ?1",
                    params![user_id],
                    |row| row.get(0),
                )
                .optional()?;
            return match exists {
                Some(_) => Err(LedgerError::InsufficientBalance),
                None => Err(LedgerError::NotFound),
            };
        }
        let balance = tx.query_row(
            "SELECT balance FROM users WHERE id = ?1",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(balance)
    }

    /// Relative increment. Returns the balance after the credit.
    pub(crate) fn credit_in_tx(
        tx: &rusqlite::Transaction<'_>,
        user_id: &str,
        amount: Amount,
    ) -> Result<Amount, LedgerError> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount);
        }
        let changed = tx.execute(
            "UPDATE users SET balance = balance + ?1, updated_at = ?2 WHERE id = ?3",
            params![amount, Utc::now().timestamp(), user_id],
        )?;
        if changed == 0 {
            return Err(LedgerError::NotFound);
        }
        let balance = tx.query_row(
            "SELECT balance FROM users WHERE id = ?1",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(balance)
    }

    /// Append a transaction row. The UNIQUE index on `external_ref` backstops
    /// the idempotency guard should two identical deliveries ever race past
    /// the lookup.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn record_in_tx(
        tx: &rusqlite::Transaction<'_>,
        user_id: &str,
        txn_type: TransactionType,
        amount: Amount,
        currency: &str,
        status: TransactionStatus,
        external_ref: Option<&str>,
        balance_after: Option<Amount>,
    ) -> Result<Transaction, LedgerError> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().timestamp();
        tx.execute(
            "INSERT INTO transactions
                (id, user_id, txn_type, amount, currency, status, external_ref,
                 balance_after, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                id,
                user_id,
                txn_type,
                amount,
                currency,
                status,
                external_ref,
                balance_after,
                now
            ],
        )?;
        Ok(Transaction {
            id,
            user_id: user_id.to_string(),
            txn_type,
            amount,
            currency: currency.to_string(),
            status,
            external_ref: external_ref.map(|s| s.to_string()),
            balance_after,
            created_at: now,
        })
    }

    pub(crate) fn find_by_reference_in_tx(
        tx: &rusqlite::Transaction<'_>,
        external_ref: &str,
    ) -> Result<Option<Transaction>, LedgerError> {
        Ok(tx
            .query_row(
                "SELECT id, user_id, txn_type, amount, currency, status, external_ref,
                        balance_after, created_at
                 FROM transactions WHERE external_ref = ?1",
                params![external_ref],
                map_transaction,
            )
            .optional()?)
    }

    /// Forward-only status flip used when a provider rollback lands.
    pub(crate) fn mark_rolled_back_in_tx(
        tx: &rusqlite::Transaction<'_>,
        txn_id: &str,
    ) -> Result<(), LedgerError> {
        let changed = tx.execute(
            "UPDATE transactions SET status = 'rolled_back'
             WHERE id = ?1 AND status != 'rolled_back'",
            params![txn_id],
        )?;
        if changed == 0 {
            return Err(LedgerError::NotFound);
        }
        Ok(())
    }

    pub(crate) fn balance_in_tx(
        tx: &rusqlite::Transaction<'_>,
        user_id: &str,
    ) -> Result<Amount, LedgerError> {
        tx.query_row(
            "SELECT balance FROM users WHERE id = ?1",
            params![user_id],
            |row| row.get(0),
        )
        .optional()?
        .ok_or(LedgerError::NotFound)
    }

    pub(crate) fn user_currency_in_tx(
        tx: &rusqlite::Transaction<'_>,
        user_id: &str,
    ) -> Result<String, LedgerError> {
        tx.query_row(
            "SELECT currency FROM users WHERE id = ?1",
            params![user_id],
            |row| row.get(0),
        )
        .optional()?
        .ok_or(LedgerError::NotFound)
    }
}

fn map_transaction(row: &rusqlite::Row<'_>) -> rusqlite::Result<Transaction> {
    Ok(Transaction {
        id: row.get(0)?,
        user_id: row.get(1)?,
        txn_type: row.get(2)?,
        amount: row.get(3)?,
        currency: row.get(4)?,
        status: row.get(5)?,
        external_ref: row.get(6)?,
        balance_after: row.get(7)?,
        created_at: row.get(8)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::models::to_amount;
    use std::sync::Arc;
    use tempfile::NamedTempFile;

    async fn create_test_store() -> (LedgerStore, NamedTempFile) {
        let file = NamedTempFile::new().unwrap();
        let conn = db::open(file.path().to_str().unwrap()).unwrap();
        let store = LedgerStore::new(conn).await.unwrap();
        (store, file)
    }

    #[tokio::test]
    async fn test_create_user_and_balance() {
        let (store, _f) = create_test_store().await;
        let user = store.create_user(to_amount(1000.0), "USD").await.unwrap();
        assert_eq!(user.balance, to_amount(1000.0));
        assert_eq!(store.get_balance(&user.id).await.unwrap(), to_amount(1000.0));

        // Starting balance shows up as a deposit in the log.
        let history = store.transactions_for_user(&user.id, 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].txn_type, TransactionType::Deposit);
        assert_eq!(history[0].balance_after, Some(to_amount(1000.0)));
    }

    #[tokio::test]
    async fn test_unknown_user_not_found() {
        let (store, _f) = create_test_store().await;
        assert!(matches!(
            store.get_balance("nope").await,
            Err(LedgerError::NotFound)
        ));
        assert!(matches!(
            store
                .debit("nope", 100, TransactionType::Bet, None)
                .await,
            Err(LedgerError::NotFound)
        ));
        assert!(matches!(
            store
                .credit("nope", 100, TransactionType::Win, None)
                .await,
            Err(LedgerError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_debit_insufficient_leaves_balance() {
        let (store, _f) = create_test_store().await;
        let user = store.create_user(to_amount(50.0), "USD").await.unwrap();
        let err = store
            .debit(&user.id, to_amount(100.0), TransactionType::Bet, None)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientBalance));
        assert_eq!(store.get_balance(&user.id).await.unwrap(), to_amount(50.0));
        // No transaction row was appended for the rejected debit.
        assert_eq!(
            store.transactions_for_user(&user.id, 10).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_zero_and_negative_amounts_rejected() {
        let (store, _f) = create_test_store().await;
        let user = store.create_user(to_amount(10.0), "USD").await.unwrap();
        assert!(matches!(
            store.debit(&user.id, 0, TransactionType::Bet, None).await,
            Err(LedgerError::InvalidAmount)
        ));
        assert!(matches!(
            store
                .credit(&user.id, -5, TransactionType::Win, None)
                .await,
            Err(LedgerError::InvalidAmount)
        ));
    }

    #[tokio::test]
    async fn test_balance_is_sum_of_committed_deltas() {
        let (store, _f) = create_test_store().await;
        let user = store.create_user(to_amount(100.0), "USD").await.unwrap();
        store.deposit(&user.id, to_amount(25.0)).await.unwrap();
        store
            .debit(&user.id, to_amount(40.0), TransactionType::Bet, Some("ext-1"))
            .await
            .unwrap();
        store
            .credit(&user.id, to_amount(80.0), TransactionType::Win, Some("ext-2"))
            .await
            .unwrap();
        let err = store.withdraw(&user.id, to_amount(9999.0)).await;
        assert!(err.is_err());

        let history = store.transactions_for_user(&user.id, 50).await.unwrap();
        let sum: Amount = history
            .iter()
            .map(|t| if t.txn_type.is_debit() { -t.amount } else { t.amount })
            .sum();
        assert_eq!(sum, store.get_balance(&user.id).await.unwrap());
        assert_eq!(sum, to_amount(165.0));
    }

    #[tokio::test]
    async fn test_find_by_reference() {
        let (store, _f) = create_test_store().await;
        let user = store.create_user(to_amount(100.0), "USD").await.unwrap();
        let recorded = store
            .debit(&user.id, to_amount(30.0), TransactionType::Bet, Some("prov-77"))
            .await
            .unwrap();
        let found = store.find_by_reference("prov-77").await.unwrap().unwrap();
        assert_eq!(found.id, recorded.id);
        assert_eq!(found.balance_after, Some(to_amount(70.0)));
        assert!(store.find_by_reference("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_debits_never_overdraft() {
        let (store, _f) = create_test_store().await;
        let store = Arc::new(store);
        let user = store.create_user(to_amount(450.0), "USD").await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..10 {
            let store = store.clone();
            let uid = user.id.clone();
            handles.push(tokio::spawn(async move {
                store
                    .debit(&uid, to_amount(100.0), TransactionType::Bet, None)
                    .await
                    .is_ok()
            }));
        }
        let mut successes = 0;
        for h in handles {
            if h.await.unwrap() {
                successes += 1;
            }
        }
        assert_eq!(successes, 4);
        assert_eq!(store.get_balance(&user.id).await.unwrap(), to_amount(50.0));
    }
}
