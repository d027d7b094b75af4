//! Settlement: find finished matches, fetch results, pay winners.

pub mod declare;
pub mod scanner;

pub use declare::{DeclareSummary, ResultDeclarer};
pub use scanner::{ScanOutcome, SettlementScanner};

use async_trait::async_trait;

use crate::queue::{JobHandler, JobPayload};

/// Queue-side entry point for settlement work.
pub struct SettlementJobHandler {
    scanner: SettlementScanner,
    declarer: ResultDeclarer,
}

impl SettlementJobHandler {
    pub fn new(scanner: SettlementScanner, declarer: ResultDeclarer) -> Self {
        Self { scanner, declarer }
    }
}

#[async_trait]
impl JobHandler for SettlementJobHandler {
    async fn handle(&self, payload: &JobPayload) -> anyhow::Result<()> {
        match payload {
            JobPayload::ScanMatch {
                match_id,
                market_type,
            } => {
                self.scanner.scan_group(match_id, *market_type).await?;
                Ok(())
            }
            JobPayload::DeclareResult {
                match_id,
                market_type,
                winners,
            } => {
                self.declarer.declare(match_id, *market_type, winners).await?;
                Ok(())
            }
        }
    }
}
