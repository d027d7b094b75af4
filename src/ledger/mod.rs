//! Authoritative money state: user balances and the append-only
//! transaction log.

pub mod store;

pub use store::{LedgerError, LedgerStore};
