//! Bet records and the services that move them through their lifecycle.

pub mod placement;
pub mod repo;

pub use placement::{PlaceBetRequest, PlacedBet, PlacementError, PlacementService};
pub use repo::{BetError, BetRepository};
