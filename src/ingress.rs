//! Trade-update stream listener: connects to the master account's fill
//! stream, filters to terminal fills, deduplicates, and forwards parsed
//! events to the dispatcher.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::alerts::AlertManager;
use crate::brokerage::{Credentials, OrderSide};
use crate::error::classify;
use crate::store::CredentialStore;

const MAX_ATTEMPTS: u32 = 10;
const STALL_DEADLINE: Duration = Duration::from_secs(3);
const RAPID_FAILURE_WINDOW: Duration = Duration::from_secs(2);
const RAPID_FAILURE_COUNT: u32 = 3;

#[derive(Debug, Deserialize)]
struct StreamOrderPayload {
    event: String,
    order: StreamOrder,
    #[serde(default)]
    timestamp: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamOrder {
    id: String,
    symbol: String,
    side: String,
    #[serde(rename = "type")]
    order_type: String,
    qty: String,
    filled_qty: Option<String>,
    filled_avg_price: Option<String>,
    limit_price: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FillEvent {
    pub master_order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: String,
    pub qty: f64,
    pub price: Option<f64>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

enum BackoffPath {
    Normal,
    RateLimitOrAuth,
}

fn backoff_delay(path: &BackoffPath, attempt: u32, normal_initial_secs: f64) -> Duration {
    match path {
        BackoffPath::Normal => {
            Duration::from_secs_f64((normal_initial_secs * 2f64.powi(attempt as i32 - 1)).min(300.0))
        }
        BackoffPath::RateLimitOrAuth => {
            Duration::from_secs_f64((60.0 * 2f64.powi(attempt as i32 - 1)).min(600.0))
        }
    }
}

fn classify_disconnect(reason: &str) -> BackoffPath {
    match classify(reason) {
        crate::error::CopierError::RateLimited(_) | crate::error::CopierError::AuthFailure(_) => {
            BackoffPath::RateLimitOrAuth
        }
        _ => BackoffPath::Normal,
    }
}

pub struct EventIngress {
    store: Arc<CredentialStore>,
    alerts: Arc<AlertManager>,
    stream_url: String,
    credentials: Mutex<Credentials>,
    running: Arc<std::sync::atomic::AtomicBool>,
    connection_lock: Arc<Mutex<()>>,
    recent_connect_attempts: Mutex<Vec<Instant>>,
    reconnect_initial_delay_secs: f64,
}

impl EventIngress {
    pub fn new(
        store: Arc<CredentialStore>,
        alerts: Arc<AlertManager>,
        stream_url: String,
        credentials: Credentials,
        reconnect_initial_delay_secs: f64,
    ) -> Self {
        Self {
            store,
            alerts,
            stream_url,
            credentials: Mutex::new(credentials),
            running: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            connection_lock: Arc::new(Mutex::new(())),
            recent_connect_attempts: Mutex::new(Vec::new()),
            reconnect_initial_delay_secs,
        }
    }

    pub async fn reconnect_with_new_credentials(&self, credentials: Credentials) {
        let mut guard = self.credentials.lock().await;
        *guard = credentials;
        info!("ingress_credentials_reloaded");
    }

    #[cfg(test)]
    pub async fn current_api_key(&self) -> String {
        self.credentials.lock().await.api_key.clone()
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Run the reconnect loop, forwarding parsed fill events to `tx`. Runs
    /// until `stop()` is called or the max reconnect-attempt budget is
    /// exhausted.
    pub async fn run(&self, tx: mpsc::Sender<FillEvent>) {
        self.running.store(true, Ordering::SeqCst);
        let mut attempt: u32 = 0;

        while self.running.load(Ordering::SeqCst) {
            let _lock = self.connection_lock.lock().await;

            if self.is_rapid_failure().await {
                warn!("rapid_reconnect_detected_forcing_extended_backoff");
                let delay = backoff_delay(&BackoffPath::RateLimitOrAuth, attempt.max(1), self.reconnect_initial_delay_secs);
                tokio::time::sleep(delay).await;
            }

            self.record_connect_attempt().await;

            let connect_result =
                tokio::time::timeout(STALL_DEADLINE, self.connect_and_stream(&tx)).await;

            match connect_result {
                Ok(Ok(())) => {
                    // Clean stream end (server closed); reconnect promptly.
                    attempt = 0;
                    self.alerts.alert_stream_reconnect().await;
                }
                Ok(Err(reason)) => {
                    attempt += 1;
                    self.alerts.alert_stream_disconnect(&reason).await;
                    if attempt > MAX_ATTEMPTS {
                        error!("max_reconnect_attempts_exceeded, stopping ingress");
                        break;
                    }
                    let path = classify_disconnect(&reason);
                    let delay = backoff_delay(&path, attempt, self.reconnect_initial_delay_secs);
                    warn!(attempt, delay_secs = delay.as_secs(), reason, "stream_reconnecting");
                    tokio::time::sleep(delay).await;
                }
                Err(_) => {
                    // Stall deadline elapsed before the connection reported
                    // ready: treat as an SDK/transport-level internal retry
                    // and force a fresh handle with extended backoff.
                    attempt += 1;
                    warn!(attempt, "connect_stall_deadline_exceeded, recreating stream handle");
                    let delay = backoff_delay(&BackoffPath::RateLimitOrAuth, attempt, self.reconnect_initial_delay_secs);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn record_connect_attempt(&self) {
        let mut attempts = self.recent_connect_attempts.lock().await;
        attempts.push(Instant::now());
        let cutoff = Instant::now() - RAPID_FAILURE_WINDOW;
        attempts.retain(|t| *t >= cutoff);
    }

    async fn is_rapid_failure(&self) -> bool {
        let attempts = self.recent_connect_attempts.lock().await;
        let cutoff = Instant::now() - RAPID_FAILURE_WINDOW;
        attempts.iter().filter(|t| **t >= cutoff).count() as u32 >= RAPID_FAILURE_COUNT
    }

    async fn connect_and_stream(&self, tx: &mpsc::Sender<FillEvent>) -> Result<(), String> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(&self.stream_url)
            .await
            .map_err(|e| e.to_string())?;
        let (mut write, mut read) = ws_stream.split();

        {
            let creds = self.credentials.lock().await;
            let auth_msg = serde_json::json!({
                "action": "auth",
                "key": creds.api_key,
                "secret": creds.secret_key,
            });
            write
                .send(Message::Text(auth_msg.to_string()))
                .await
                .map_err(|e| e.to_string())?;
        }

        info!("trade_update_stream_connected");

        while let Some(msg) = read.next().await {
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            let msg = msg.map_err(|e| e.to_string())?;
            let text = match msg {
                Message::Text(t) => t,
                Message::Close(_) => return Err("stream closed by server".to_string()),
                _ => continue,
            };

            if let Some(event) = self.parse_and_dedup(&text).await {
                if tx.send(event).await.is_err() {
                    return Err("dispatcher channel closed".to_string());
                }
            }
        }

        Ok(())
    }

    async fn parse_and_dedup(&self, raw: &str) -> Option<FillEvent> {
        let payload: StreamOrderPayload = match serde_json::from_str(raw) {
            Ok(p) => p,
            Err(e) => {
                debug!(error = %e, "ignoring unparseable stream message");
                return None;
            }
        };

        if payload.event != "fill" {
            return None;
        }

        let timestamp = payload
            .timestamp
            .clone()
            .unwrap_or_else(|| chrono::Utc::now().to_rfc3339());
        let event_id = format!("{}_{}_{}", payload.order.id, payload.event, timestamp);
        let content_hash = CredentialStore::content_hash(raw);

        match self
            .store
            .check_and_record_event(&event_id, &payload.event, &content_hash)
            .await
        {
            Ok(true) => {
                debug!(event_id, "duplicate_event_suppressed");
                return None;
            }
            Ok(false) => {}
            Err(e) => {
                error!(error = %e, "dedup_check_failed, forwarding event to be safe");
            }
        }

        let side = if payload.order.side.eq_ignore_ascii_case("buy") {
            OrderSide::Buy
        } else {
            OrderSide::Sell
        };

        let qty: f64 = payload
            .order
            .filled_qty
            .as_deref()
            .or(Some(payload.order.qty.as_str()))
            .and_then(|s| s.parse().ok())
            .unwrap_or(0.0);
        let price: Option<f64> = payload
            .order
            .filled_avg_price
            .as_deref()
            .or(payload.order.limit_price.as_deref())
            .and_then(|s| s.parse().ok());

        Some(FillEvent {
            master_order_id: payload.order.id,
            symbol: payload.order.symbol,
            side,
            order_type: payload.order.order_type,
            qty,
            price,
            timestamp: chrono::Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_backoff_doubles_and_caps() {
        assert_eq!(backoff_delay(&BackoffPath::Normal, 1, 5.0), Duration::from_secs(5));
        assert_eq!(backoff_delay(&BackoffPath::Normal, 2, 5.0), Duration::from_secs(10));
        assert_eq!(backoff_delay(&BackoffPath::Normal, 10, 5.0), Duration::from_secs(300));
    }

    #[test]
    fn rate_limit_backoff_doubles_and_caps_higher() {
        assert_eq!(
            backoff_delay(&BackoffPath::RateLimitOrAuth, 1, 5.0),
            Duration::from_secs(60)
        );
        assert_eq!(
            backoff_delay(&BackoffPath::RateLimitOrAuth, 10, 5.0),
            Duration::from_secs(600)
        );
    }

    #[test]
    fn classifies_auth_and_rate_limit_disconnects_to_long_path() {
        assert!(matches!(
            classify_disconnect("401 unauthorized"),
            BackoffPath::RateLimitOrAuth
        ));
        assert!(matches!(
            classify_disconnect("429 too many requests"),
            BackoffPath::RateLimitOrAuth
        ));
        assert!(matches!(classify_disconnect("connection reset"), BackoffPath::Normal));
    }

    #[tokio::test]
    async fn non_fill_events_are_dropped() {
        let store = Arc::new(CredentialStore::open(":memory:", "test-secret").unwrap());
        let alerts = Arc::new(AlertManager::new(None, false, false));
        let ingress = EventIngress::new(
            store,
            alerts,
            "wss://example.invalid".into(),
            Credentials {
                api_key: "k".into(),
                secret_key: "s".into(),
            },
            5.0,
        );

        let raw = r#"{"event":"new","order":{"id":"O1","symbol":"ABC","side":"buy","type":"market","qty":"10"}}"#;
        assert!(ingress.parse_and_dedup(raw).await.is_none());
    }

    #[tokio::test]
    async fn duplicate_fill_event_is_suppressed() {
        let store = Arc::new(CredentialStore::open(":memory:", "test-secret").unwrap());
        let alerts = Arc::new(AlertManager::new(None, false, false));
        let ingress = EventIngress::new(
            store,
            alerts,
            "wss://example.invalid".into(),
            Credentials {
                api_key: "k".into(),
                secret_key: "s".into(),
            },
            5.0,
        );

        let raw = r#"{"event":"fill","order":{"id":"O1","symbol":"ABC","side":"buy","type":"market","qty":"10","filled_qty":"10","filled_avg_price":"50.0"},"timestamp":"2026-01-01T00:00:00Z"}"#;
        let first = ingress.parse_and_dedup(raw).await;
        assert!(first.is_some());
        let second = ingress.parse_and_dedup(raw).await;
        assert!(second.is_none());
    }
}
