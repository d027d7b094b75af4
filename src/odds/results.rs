//! Typed shapes for the odds provider's responses.
//!
//! Every market family ships its own result payload; each one is parsed into
//! an explicit variant here and reduced to a per-selection winner/loser map
//! before settlement touches it. Nothing downstream ever sees raw provider
//! JSON.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::models::MarketType;

/// Outcome of one selection once a market settles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionOutcome {
    Winner,
    Loser,
}

/// Match status as reported by the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchState {
    pub match_id: String,
    /// Structured lifecycle field. Newer provider deployments send it;
    /// older ones only ship the free-text score message.
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub score_message: Option<String>,
}

const FINISHED_STATUSES: &[&str] = &["finished", "completed", "closed", "settled"];
const FINISHED_KEYWORDS: &[&str] = &["finished", "ended", "completed"];

impl MatchState {
    /// Whether results can be fetched for this match. Prefers the structured
    /// status; falls back to score-message keywords for deployments that do
    /// not send one.
    pub fn is_finished(&self) -> bool {
        if let Some(status) = &self.status {
            return FINISHED_STATUSES.contains(&status.to_lowercase().as_str());
        }
        if let Some(msg) = &self.score_message {
            let msg = msg.to_lowercase();
            return FINISHED_KEYWORDS.iter().any(|k| msg.contains(k));
        }
        false
    }
}

/// Plain match-odds market result line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OddsResult {
    pub market_id: String,
    pub selection_id: String,
    pub position: SelectionOutcome,
}

/// Bookmaker market result line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookmakerResult {
    pub market_id: String,
    pub selection_id: String,
    pub is_winner: bool,
}

/// Session market result line: the declared value plus the provider's
/// decision for the quoted selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionResult {
    pub selection_id: String,
    pub declared_value: f64,
    pub winner: bool,
}

/// Fancy market result line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FancyResult {
    pub selection_id: String,
    pub result: String,
    pub winner: bool,
}

/// Settled results for one (match, market-type) group.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "market_type", rename_all = "snake_case")]
pub enum MarketResults {
    MatchOdds { results: Vec<OddsResult> },
    Bookmaker { results: Vec<BookmakerResult> },
    Session { results: Vec<SessionResult> },
    Fancy { results: Vec<FancyResult> },
}

impl MarketResults {
    pub fn market_type(&self) -> MarketType {
        match self {
            MarketResults::MatchOdds { .. } => MarketType::MatchOdds,
            MarketResults::Bookmaker { .. } => MarketType::Bookmaker,
            MarketResults::Session { .. } => MarketType::Session,
            MarketResults::Fancy { .. } => MarketType::Fancy,
        }
    }

    /// No result lines at all: the provider has nothing for this group yet.
    pub fn is_empty(&self) -> bool {
        match self {
            MarketResults::MatchOdds { results } => results.is_empty(),
            MarketResults::Bookmaker { results } => results.is_empty(),
            MarketResults::Session { results } => results.is_empty(),
            MarketResults::Fancy { results } => results.is_empty(),
        }
    }

    /// Reduce the per-family shapes to the one thing settlement needs:
    /// selection id → winner/loser.
    pub fn winner_map(&self) -> HashMap<String, SelectionOutcome> {
        let mut map = HashMap::new();
        match self {
            MarketResults::MatchOdds { results } => {
                for r in results {
                    map.insert(r.selection_id.clone(), r.position);
                }
            }
            MarketResults::Bookmaker { results } => {
                for r in results {
                    map.insert(r.selection_id.clone(), outcome(r.is_winner));
                }
            }
            MarketResults::Session { results } => {
                for r in results {
                    map.insert(r.selection_id.clone(), outcome(r.winner));
                }
            }
            MarketResults::Fancy { results } => {
                for r in results {
                    map.insert(r.selection_id.clone(), outcome(r.winner));
                }
            }
        }
        map
    }
}

fn outcome(winner: bool) -> SelectionOutcome {
    if winner {
        SelectionOutcome::Winner
    } else {
        SelectionOutcome::Loser
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finished_prefers_structured_status() {
        let state = MatchState {
            match_id: "m-1".to_string(),
            status: Some("Finished".to_string()),
            score_message: None,
        };
        assert!(state.is_finished());

        // A live status wins even when the message contains a keyword.
        let state = MatchState {
            match_id: "m-1".to_string(),
            status: Some("in_play".to_string()),
            score_message: Some("first innings completed".to_string()),
        };
        assert!(!state.is_finished());
    }

    #[test]
    fn test_finished_falls_back_to_score_message() {
        let state = MatchState {
            match_id: "m-1".to_string(),
            status: None,
            score_message: Some("Match finished, home side won by 3 wickets".to_string()),
        };
        assert!(state.is_finished());

        let state = MatchState {
            match_id: "m-1".to_string(),
            status: None,
            score_message: Some("Rain delay".to_string()),
        };
        assert!(!state.is_finished());

        let state = MatchState {
            match_id: "m-1".to_string(),
            status: None,
            score_message: None,
        };
        assert!(!state.is_finished());
    }

    #[test]
    fn test_winner_map_per_family() {
        let odds = MarketResults::MatchOdds {
            results: vec![
                OddsResult {
                    market_id: "1.1".to_string(),
                    selection_id: "a".to_string(),
                    position: SelectionOutcome::Winner,
                },
                OddsResult {
                    market_id: "1.1".to_string(),
                    selection_id: "b".to_string(),
                    position: SelectionOutcome::Loser,
                },
            ],
        };
        let map = odds.winner_map();
        assert_eq!(map.get("a"), Some(&SelectionOutcome::Winner));
        assert_eq!(map.get("b"), Some(&SelectionOutcome::Loser));

        let session = MarketResults::Session {
            results: vec![SessionResult {
                selection_id: "s1".to_string(),
                declared_value: 42.0,
                winner: true,
            }],
        };
        assert_eq!(session.winner_map().get("s1"), Some(&SelectionOutcome::Winner));
        assert_eq!(session.market_type(), MarketType::Session);
        assert!(!session.is_empty());
    }

    #[test]
    fn test_tagged_deserialization_rejects_unknown_shape() {
        let ok: MarketResults = serde_json::from_str(
            r#"{"market_type":"fancy","results":[{"selection_id":"f1","result":"65 runs","winner":false}]}"#,
        )
        .unwrap();
        assert_eq!(ok.market_type(), MarketType::Fancy);
        assert_eq!(ok.winner_map().get("f1"), Some(&SelectionOutcome::Loser));

        let bad = serde_json::from_str::<MarketResults>(r#"{"market_type":"roulette","results":[]}"#);
        assert!(bad.is_err());
    }
}
