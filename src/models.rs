//! Core domain types for the exchange money core: fixed-point amounts,
//! transaction and bet records, and the enums behind their state machines.

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

// =============================================================================
// FIXED-POINT AMOUNT
// =============================================================================

/// Fixed-point money amount with 6 decimal places.
/// All ledger arithmetic happens in integer micro-units; floats only appear
/// at the JSON boundary.
pub type Amount = i64;

/// Conversion factor: 1.0 in display units = 1_000_000 micro-units.
pub const AMOUNT_SCALE: i64 = 1_000_000;

/// Convert a boundary f64 into a fixed-point Amount (round to nearest micro).
#[inline]
pub fn to_amount(value: f64) -> Amount {
    (value * AMOUNT_SCALE as f64).round() as Amount
}

/// Convert a fixed-point Amount back to display units.
#[inline]
pub fn from_amount(amount: Amount) -> f64 {
    amount as f64 / AMOUNT_SCALE as f64
}

// =============================================================================
// TRANSACTIONS
// =============================================================================

/// What moved the money.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Deposit,
    Withdraw,
    Bet,
    Win,
    Refund,
    Promocode,
    RolledBack,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Deposit => "deposit",
            TransactionType::Withdraw => "withdraw",
            TransactionType::Bet => "bet",
            TransactionType::Win => "win",
            TransactionType::Refund => "refund",
            TransactionType::Promocode => "promocode",
            TransactionType::RolledBack => "rolled_back",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "deposit" => Some(TransactionType::Deposit),
            "withdraw" => Some(TransactionType::Withdraw),
            "bet" => Some(TransactionType::Bet),
            "win" => Some(TransactionType::Win),
            "refund" => Some(TransactionType::Refund),
            "promocode" => Some(TransactionType::Promocode),
            "rolled_back" => Some(TransactionType::RolledBack),
            _ => None,
        }
    }

    /// Whether this type takes money from the user (true) or gives it (false).
    pub fn is_debit(&self) -> bool {
        matches!(self, TransactionType::Withdraw | TransactionType::Bet)
    }
}

/// Status of a transaction. Transitions are forward-only; a rolled-back
/// transaction never comes back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
    RolledBack,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Completed => "completed",
            TransactionStatus::Failed => "failed",
            TransactionStatus::RolledBack => "rolled_back",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TransactionStatus::Pending),
            "completed" => Some(TransactionStatus::Completed),
            "failed" => Some(TransactionStatus::Failed),
            "rolled_back" => Some(TransactionStatus::RolledBack),
            _ => None,
        }
    }
}

/// Immutable transaction record. `external_ref` carries the provider's
/// transaction id for webhook-originated rows and is the idempotency key;
/// `balance_after` is the balance the row's commit produced, returned
/// verbatim on duplicate delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub user_id: String,
    pub txn_type: TransactionType,
    pub amount: Amount,
    pub currency: String,
    pub status: TransactionStatus,
    pub external_ref: Option<String>,
    pub balance_after: Option<Amount>,
    pub created_at: i64,
}

// =============================================================================
// BETS
// =============================================================================

/// Bet lifecycle. Placement inserts straight into `matched` (stake already
/// debited); settlement moves `matched` into `won`/`lost`; `cancelled`
/// refunds the stake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetStatus {
    Pending,
    Matched,
    Won,
    Lost,
    Cancelled,
}

impl BetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BetStatus::Pending => "pending",
            BetStatus::Matched => "matched",
            BetStatus::Won => "won",
            BetStatus::Lost => "lost",
            BetStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(BetStatus::Pending),
            "matched" => Some(BetStatus::Matched),
            "won" => Some(BetStatus::Won),
            "lost" => Some(BetStatus::Lost),
            "cancelled" => Some(BetStatus::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetSide {
    Back,
    Lay,
}

impl BetSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            BetSide::Back => "back",
            BetSide::Lay => "lay",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "back" => Some(BetSide::Back),
            "lay" => Some(BetSide::Lay),
            _ => None,
        }
    }
}

/// Market families the odds provider settles differently. Each family has
/// its own result payload shape on the provider side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketType {
    MatchOdds,
    Bookmaker,
    Session,
    Fancy,
}

impl MarketType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketType::MatchOdds => "match_odds",
            MarketType::Bookmaker => "bookmaker",
            MarketType::Session => "session",
            MarketType::Fancy => "fancy",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            // "odds" is what older upstream clients send for the plain
            // match-odds market.
            "match_odds" | "odds" => Some(MarketType::MatchOdds),
            "bookmaker" => Some(MarketType::Bookmaker),
            "session" => Some(MarketType::Session),
            "fancy" => Some(MarketType::Fancy),
            _ => None,
        }
    }
}

/// A bet record. Stake is in micro-units; odds stay the decimal multiplier
/// the client sent. `payout = stake * odds` is computed once, on the
/// transition into `won`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bet {
    pub id: String,
    pub user_id: String,
    pub match_id: String,
    pub event_type_id: String,
    pub market_id: String,
    pub selection_id: String,
    pub market_type: MarketType,
    pub odds: f64,
    pub stake: Amount,
    pub side: BetSide,
    pub status: BetStatus,
    pub payout: Amount,
    pub created_at: i64,
    pub matched_at: Option<i64>,
    pub settled_at: Option<i64>,
    pub cancelled_at: Option<i64>,
    pub result_checked_at: Option<i64>,
}

// =============================================================================
// USERS
// =============================================================================

/// A wallet-holding user. Balance is only ever mutated through relative
/// deltas in the ledger store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub balance: Amount,
    pub currency: String,
    pub created_at: i64,
    pub updated_at: i64,
}

// =============================================================================
// SQLITE TEXT MAPPING
// =============================================================================

macro_rules! impl_sql_text {
    ($ty:ty) => {
        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                let text = value.as_str()?;
                <$ty>::parse(text).ok_or_else(|| {
                    FromSqlError::Other(format!("unrecognized value: {text}").into())
                })
            }
        }
    };
}

impl_sql_text!(TransactionType);
impl_sql_text!(TransactionStatus);
impl_sql_text!(BetStatus);
impl_sql_text!(BetSide);
impl_sql_text!(MarketType);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_amount_round_trip() {
        assert_eq!(to_amount(1000.0), 1_000_000_000);
        assert_eq!(from_amount(1_000_000_000), 1000.0);
        assert_eq!(to_amount(0.000001), 1);
        // Rounds to nearest micro-unit instead of truncating.
        assert_eq!(to_amount(0.1 + 0.2), 300_000);
    }

    #[test]
    fn test_enum_text_round_trip() {
        for t in [
            TransactionType::Deposit,
            TransactionType::Withdraw,
            TransactionType::Bet,
            TransactionType::Win,
            TransactionType::Refund,
            TransactionType::Promocode,
            TransactionType::RolledBack,
        ] {
            assert_eq!(TransactionType::parse(t.as_str()), Some(t));
        }
        for s in [
            BetStatus::Pending,
            BetStatus::Matched,
            BetStatus::Won,
            BetStatus::Lost,
            BetStatus::Cancelled,
        ] {
            assert_eq!(BetStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(MarketType::parse("odds"), Some(MarketType::MatchOdds));
        assert_eq!(MarketType::parse("roulette"), None);
    }

    #[test]
    fn test_debit_classification() {
        assert!(TransactionType::Bet.is_debit());
        assert!(TransactionType::Withdraw.is_debit());
        assert!(!TransactionType::Win.is_debit());
        assert!(!TransactionType::Refund.is_debit());
    }
}
