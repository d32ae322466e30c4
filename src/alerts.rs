//! Deduplicated alert dispatch: Slack webhook (and an optional email stub),
//! both best-effort and non-blocking to the trade pipeline.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use reqwest::Client;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

const ALERT_COOLDOWN: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl AlertSeverity {
    fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Info => "info",
            AlertSeverity::Warning => "warning",
            AlertSeverity::Error => "error",
            AlertSeverity::Critical => "critical",
        }
    }
}

pub struct AlertManager {
    http: Client,
    slack_webhook_url: Option<String>,
    enable_slack: bool,
    enable_email: bool,
    cooldowns: Mutex<HashMap<String, Instant>>,
}

impl AlertManager {
    pub fn new(slack_webhook_url: Option<String>, enable_slack: bool, enable_email: bool) -> Self {
        Self {
            http: Client::new(),
            slack_webhook_url,
            enable_slack,
            enable_email,
            cooldowns: Mutex::new(HashMap::new()),
        }
    }

    async fn should_send(&self, key: &str) -> bool {
        let mut cooldowns = self.cooldowns.lock().await;
        let now = Instant::now();
        if let Some(last) = cooldowns.get(key) {
            if now.duration_since(*last) < ALERT_COOLDOWN {
                return false;
            }
        }
        cooldowns.insert(key.to_string(), now);
        true
    }

    pub async fn send_alert(&self, key: &str, title: &str, message: &str, severity: AlertSeverity) {
        if !self.should_send(key).await {
            debug!(key, "alert_suppressed_by_cooldown");
            return;
        }

        if !self.enable_slack && !self.enable_email {
            debug!(title, message, severity = severity.as_str(), "alert_logged_no_transport");
            return;
        }

        if self.enable_slack {
            if let Some(url) = &self.slack_webhook_url {
                self.send_slack(url, title, message, severity).await;
            }
        }
        if self.enable_email {
            // Email delivery is an external collaborator (§1); this crate
            // only logs that an email alert would be sent.
            debug!(title, "email_alert_dispatch_stubbed");
        }
    }

    async fn send_slack(&self, url: &str, title: &str, message: &str, severity: AlertSeverity) {
        let payload = json!({
            "text": format!("[{}] {}: {}", severity.as_str().to_uppercase(), title, message),
        });
        match self
            .http
            .post(url)
            .json(&payload)
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => warn!(status = %resp.status(), "slack_alert_delivery_failed"),
            Err(e) => error!(error = %e, "slack_alert_transport_error"),
        }
    }

    pub async fn alert_stream_disconnect(&self, reason: &str) {
        self.send_alert(
            "stream_disconnect",
            "Stream Disconnected",
            reason,
            AlertSeverity::Warning,
        )
        .await;
    }

    pub async fn alert_stream_reconnect(&self) {
        self.send_alert(
            "stream_reconnect",
            "Stream Reconnected",
            "trade-update stream reconnected",
            AlertSeverity::Info,
        )
        .await;
    }

    pub async fn alert_high_failure_rate(&self, master_order_id: &str, failures: usize, total: usize) {
        let key = format!("high_failure_rate:{master_order_id}");
        self.send_alert(
            &key,
            "High Failure Rate",
            &format!("{failures}/{total} client orders failed for master order {master_order_id}"),
            AlertSeverity::Error,
        )
        .await;
    }

    pub async fn alert_breaker_opened(&self, account_id: &str) {
        let key = format!("breaker_opened:{account_id}");
        self.send_alert(
            &key,
            "Circuit Breaker Opened",
            &format!("client account {account_id} breaker opened"),
            AlertSeverity::Error,
        )
        .await;
    }

    pub async fn alert_latency_threshold_exceeded(&self, latency_ms: u64) {
        self.send_alert(
            "latency_threshold_exceeded",
            "Latency Threshold Exceeded",
            &format!("replication latency {latency_ms}ms exceeded critical threshold"),
            AlertSeverity::Warning,
        )
        .await;
    }

    pub async fn alert_system_error(&self, component: &str, error: &str) {
        let key = format!("system_error:{component}");
        self.send_alert(
            &key,
            "System Error",
            &format!("{component}: {error}"),
            AlertSeverity::Critical,
        )
        .await;
    }

    pub async fn close(&self) {
        let mut cooldowns = self.cooldowns.lock().await;
        cooldowns.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cooldown_suppresses_repeat_alerts_within_window() {
        let manager = AlertManager::new(None, false, false);
        assert!(manager.should_send("key1").await);
        assert!(!manager.should_send("key1").await);
        assert!(manager.should_send("key2").await);
    }

    #[tokio::test]
    async fn no_transport_configured_does_not_panic() {
        let manager = AlertManager::new(None, false, false);
        manager
            .send_alert("k", "title", "message", AlertSeverity::Info)
            .await;
    }
}
