//! Process configuration, loaded once from the environment.

use anyhow::{bail, Context, Result};

const PLACEHOLDER_KEYS: &[&str] = &["changeme", "your_encryption_key_here", ""];

#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub encryption_key: String,

    pub master_account_id: String,
    pub is_production: bool,
    pub brokerage_base_url: String,
    pub brokerage_stream_url: String,

    pub max_concurrent_orders: usize,
    pub min_order_size: f64,
    pub min_notional_value: f64,
    pub allow_fractional_shares: bool,

    pub failure_threshold: u32,
    pub circuit_timeout_secs: u64,

    pub retry_max_attempts: u32,
    pub retry_initial_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub retry_exponential_base: f64,
    pub retry_jitter: bool,

    pub latency_warning_threshold_ms: u64,
    pub latency_critical_threshold_ms: u64,

    pub enable_slack_alerts: bool,
    pub slack_webhook_url: Option<String>,
    pub enable_email_alerts: bool,

    pub master_credential_check_interval_secs: u64,
    pub stream_reconnect_initial_delay_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let database_path =
            std::env::var("DATABASE_PATH").unwrap_or_else(|_| "./trade_copier.db".to_string());
        let encryption_key = std::env::var("ENCRYPTION_KEY").unwrap_or_default();

        let master_account_id = std::env::var("MASTER_ACCOUNT_ID").unwrap_or_default();
        let is_production = std::env::var("IS_PRODUCTION")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);
        let brokerage_base_url = std::env::var("BROKERAGE_BASE_URL")
            .unwrap_or_else(|_| "https://paper-api.alpaca.markets".to_string());
        let brokerage_stream_url = std::env::var("BROKERAGE_STREAM_URL")
            .unwrap_or_else(|_| "wss://paper-api.alpaca.markets/stream".to_string());

        let max_concurrent_orders = std::env::var("MAX_CONCURRENT_ORDERS")
            .unwrap_or_else(|_| "50".to_string())
            .parse()
            .unwrap_or(50);
        let min_order_size = std::env::var("MIN_ORDER_SIZE")
            .unwrap_or_else(|_| "1.0".to_string())
            .parse()
            .unwrap_or(1.0);
        let min_notional_value = std::env::var("MIN_NOTIONAL_VALUE")
            .unwrap_or_else(|_| "1.0".to_string())
            .parse()
            .unwrap_or(1.0);
        let allow_fractional_shares = std::env::var("ALLOW_FRACTIONAL_SHARES")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(true);

        let failure_threshold = std::env::var("FAILURE_THRESHOLD")
            .unwrap_or_else(|_| "5".to_string())
            .parse()
            .unwrap_or(5);
        let circuit_timeout_secs = std::env::var("CIRCUIT_TIMEOUT_SECS")
            .unwrap_or_else(|_| "300".to_string())
            .parse()
            .unwrap_or(300);

        let retry_max_attempts = std::env::var("RETRY_MAX_ATTEMPTS")
            .unwrap_or_else(|_| "3".to_string())
            .parse()
            .unwrap_or(3);
        let retry_initial_delay_ms = std::env::var("RETRY_INITIAL_DELAY_MS")
            .unwrap_or_else(|_| "1000".to_string())
            .parse()
            .unwrap_or(1000);
        let retry_max_delay_ms = std::env::var("RETRY_MAX_DELAY_MS")
            .unwrap_or_else(|_| "30000".to_string())
            .parse()
            .unwrap_or(30000);
        let retry_exponential_base = std::env::var("RETRY_EXPONENTIAL_BASE")
            .unwrap_or_else(|_| "2.0".to_string())
            .parse()
            .unwrap_or(2.0);
        let retry_jitter = std::env::var("RETRY_JITTER")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(true);

        let latency_warning_threshold_ms = std::env::var("LATENCY_WARNING_THRESHOLD_MS")
            .unwrap_or_else(|_| "500".to_string())
            .parse()
            .unwrap_or(500);
        let latency_critical_threshold_ms = std::env::var("LATENCY_CRITICAL_THRESHOLD_MS")
            .unwrap_or_else(|_| "2000".to_string())
            .parse()
            .unwrap_or(2000);

        let enable_slack_alerts = std::env::var("ENABLE_SLACK_ALERTS")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);
        let slack_webhook_url = std::env::var("SLACK_WEBHOOK_URL").ok();
        let enable_email_alerts = std::env::var("ENABLE_EMAIL_ALERTS")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        let master_credential_check_interval_secs =
            std::env::var("MASTER_CREDENTIAL_CHECK_INTERVAL_SECS")
                .unwrap_or_else(|_| "60".to_string())
                .parse()
                .unwrap_or(60);
        let stream_reconnect_initial_delay_secs = std::env::var("STREAM_RECONNECT_INITIAL_DELAY_SECS")
            .unwrap_or_else(|_| "5".to_string())
            .parse()
            .unwrap_or(5);

        let config = Self {
            database_path,
            encryption_key,
            master_account_id,
            is_production,
            brokerage_base_url,
            brokerage_stream_url,
            max_concurrent_orders,
            min_order_size,
            min_notional_value,
            allow_fractional_shares,
            failure_threshold,
            circuit_timeout_secs,
            retry_max_attempts,
            retry_initial_delay_ms,
            retry_max_delay_ms,
            retry_exponential_base,
            retry_jitter,
            latency_warning_threshold_ms,
            latency_critical_threshold_ms,
            enable_slack_alerts,
            slack_webhook_url,
            enable_email_alerts,
            master_credential_check_interval_secs,
            stream_reconnect_initial_delay_secs,
        };

        config.validate().context("invalid configuration")?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if PLACEHOLDER_KEYS.contains(&self.encryption_key.as_str()) {
            bail!("ENCRYPTION_KEY is missing or still set to a placeholder value");
        }
        if self.latency_critical_threshold_ms <= self.latency_warning_threshold_ms {
            bail!("LATENCY_CRITICAL_THRESHOLD_MS must be greater than LATENCY_WARNING_THRESHOLD_MS");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Config {
        Config {
            database_path: ":memory:".into(),
            encryption_key: "a-real-secret".into(),
            master_account_id: "MASTER1".into(),
            is_production: false,
            brokerage_base_url: "https://example.invalid".into(),
            brokerage_stream_url: "wss://example.invalid".into(),
            max_concurrent_orders: 50,
            min_order_size: 1.0,
            min_notional_value: 1.0,
            allow_fractional_shares: true,
            failure_threshold: 5,
            circuit_timeout_secs: 300,
            retry_max_attempts: 3,
            retry_initial_delay_ms: 1000,
            retry_max_delay_ms: 30000,
            retry_exponential_base: 2.0,
            retry_jitter: true,
            latency_warning_threshold_ms: 500,
            latency_critical_threshold_ms: 2000,
            enable_slack_alerts: false,
            slack_webhook_url: None,
            enable_email_alerts: false,
            master_credential_check_interval_secs: 60,
            stream_reconnect_initial_delay_secs: 5,
        }
    }

    #[test]
    fn rejects_placeholder_encryption_key() {
        let mut c = base();
        c.encryption_key = "changeme".into();
        assert!(c.validate().is_err());
    }

    #[test]
    fn rejects_empty_encryption_key() {
        let mut c = base();
        c.encryption_key = String::new();
        assert!(c.validate().is_err());
    }

    #[test]
    fn rejects_inverted_latency_thresholds() {
        let mut c = base();
        c.latency_critical_threshold_ms = 100;
        c.latency_warning_threshold_ms = 500;
        assert!(c.validate().is_err());
    }

    #[test]
    fn accepts_sane_config() {
        assert!(base().validate().is_ok());
    }
}
