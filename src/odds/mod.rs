//! Read-only integration with the odds provider: match state and settled
//! market results, typed at the boundary.

pub mod client;
pub mod results;

pub use client::{OddsApi, OddsProviderClient};
pub use results::{
    BookmakerResult, FancyResult, MarketResults, MatchState, OddsResult, SelectionOutcome,
    SessionResult,
};
