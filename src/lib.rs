//! BetVault Backend Library
//!
//! Exposes the exchange core for the `betvault` binary and integration
//! tests: ledger, bets, provider callbacks, settlement, and the job queue.

pub mod api;
pub mod bets;
pub mod config;
pub mod db;
pub mod ledger;
pub mod models;
pub mod odds;
pub mod provider;
pub mod queue;
pub mod settlement;
