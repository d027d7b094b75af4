//! Process configuration, read once from the environment at startup.

/// Runtime configuration for the exchange core.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub port: u16,
    pub provider_base_url: String,
    pub provider_api_key: Option<String>,
    pub provider_timeout_secs: u64,
    pub merchant_id: String,
    pub merchant_secret: String,
    pub settlement_currency: String,
    pub settlement_scan_secs: u64,
    pub result_recheck_secs: u64,
    pub queue_poll_secs: u64,
    pub queue_max_attempts: u32,
    pub queue_base_delay_secs: u64,
    pub queue_workers: usize,
    pub placement_scan_delay_secs: u64,
}

/// Placeholder secret for local runs; startup warns when it is still active.
pub const DEV_MERCHANT_SECRET: &str = "dev-secret-change-me";

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let database_path =
            std::env::var("DATABASE_PATH").unwrap_or_else(|_| "./betvault.db".to_string());

        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .unwrap_or(8080);

        let provider_base_url = std::env::var("PROVIDER_BASE_URL")
            .unwrap_or_else(|_| "http://localhost:9090".to_string());

        let provider_api_key = std::env::var("PROVIDER_API_KEY").ok();

        let provider_timeout_secs = std::env::var("PROVIDER_TIMEOUT_SECS")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .unwrap_or(10);

        let merchant_id = std::env::var("MERCHANT_ID").unwrap_or_else(|_| "1000".to_string());

        let merchant_secret =
            std::env::var("MERCHANT_SECRET").unwrap_or_else(|_| DEV_MERCHANT_SECRET.to_string());

        let settlement_currency =
            std::env::var("SETTLEMENT_CURRENCY").unwrap_or_else(|_| "USD".to_string());

        let settlement_scan_secs = std::env::var("SETTLEMENT_SCAN_SECS")
            .unwrap_or_else(|_| "300".to_string())
            .parse()
            .unwrap_or(300);

        let result_recheck_secs = std::env::var("RESULT_RECHECK_SECS")
            .unwrap_or_else(|_| "3600".to_string())
            .parse()
            .unwrap_or(3600);

        let queue_poll_secs = std::env::var("QUEUE_POLL_SECS")
            .unwrap_or_else(|_| "2".to_string())
            .parse()
            .unwrap_or(2);

        let queue_max_attempts = std::env::var("QUEUE_MAX_ATTEMPTS")
            .unwrap_or_else(|_| "3".to_string())
            .parse()
            .unwrap_or(3);

        let queue_base_delay_secs = std::env::var("QUEUE_BASE_DELAY_SECS")
            .unwrap_or_else(|_| "2".to_string())
            .parse()
            .unwrap_or(2);

        let queue_workers = std::env::var("QUEUE_WORKERS")
            .unwrap_or_else(|_| "2".to_string())
            .parse()
            .unwrap_or(2);

        let placement_scan_delay_secs = std::env::var("PLACEMENT_SCAN_DELAY_SECS")
            .unwrap_or_else(|_| "60".to_string())
            .parse()
            .unwrap_or(60);

        Ok(Self {
            database_path,
            port,
            provider_base_url,
            provider_api_key,
            provider_timeout_secs,
            merchant_id,
            merchant_secret,
            settlement_currency,
            settlement_scan_secs,
            result_recheck_secs,
            queue_poll_secs,
            queue_max_attempts,
            queue_base_delay_secs,
            queue_workers,
            placement_scan_delay_secs,
        })
    }
}
