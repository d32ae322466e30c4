//! Parallel order execution: one client attempt per task, gated by a
//! per-client circuit breaker and a classified-error retry policy.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures_util::future::join_all;
use tracing::{error, info, warn};

use crate::alerts::AlertManager;
use crate::brokerage::{BrokerageClient, Credentials, OrderRequest, OrderSide, OrderType};
use crate::metrics::LatencyTracker;
use crate::retry::{with_retry, BreakerRegistry, BreakerState, RetryPolicy};
use crate::store::{BreakerState as StoreBreakerState, CredentialStore, TradeAuditLog, TradeStatus};

const HIGH_FAILURE_RATE_THRESHOLD: f64 = 0.1;

pub struct ClientOrder {
    pub account_id: String,
    pub credentials: Credentials,
    pub qty: f64,
}

pub struct OrderExecutor {
    store: Arc<CredentialStore>,
    brokerage: Arc<dyn BrokerageClient>,
    breakers: Arc<BreakerRegistry>,
    alerts: Arc<AlertManager>,
    latency: Arc<LatencyTracker>,
    retry_policy: RetryPolicy,
    latency_critical_threshold_ms: u64,
}

pub struct BatchResult {
    pub success_count: usize,
    pub failure_count: usize,
}

impl OrderExecutor {
    pub fn new(
        store: Arc<CredentialStore>,
        brokerage: Arc<dyn BrokerageClient>,
        breakers: Arc<BreakerRegistry>,
        alerts: Arc<AlertManager>,
        latency: Arc<LatencyTracker>,
        retry_policy: RetryPolicy,
        latency_critical_threshold_ms: u64,
    ) -> Self {
        Self {
            store,
            brokerage,
            breakers,
            alerts,
            latency,
            retry_policy,
            latency_critical_threshold_ms,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn execute_batch(
        &self,
        master_order_id: &str,
        symbol: &str,
        side: OrderSide,
        order_type: OrderType,
        master_qty: f64,
        master_price: Option<f64>,
        master_trade_time: chrono::DateTime<Utc>,
        client_orders: Vec<ClientOrder>,
    ) -> BatchResult {
        let total = client_orders.len();
        let futures = client_orders.into_iter().map(|co| {
            self.execute_single_order(
                master_order_id,
                symbol,
                side,
                order_type,
                master_qty,
                master_price,
                master_trade_time,
                co,
            )
        });
        let outcomes = join_all(futures).await;

        let success_count = outcomes.iter().filter(|ok| **ok).count();
        let failure_count = total - success_count;

        if total > 0 {
            let failure_rate = failure_count as f64 / total as f64;
            if failure_rate > HIGH_FAILURE_RATE_THRESHOLD {
                self.alerts
                    .alert_high_failure_rate(master_order_id, failure_count, total)
                    .await;
            }
        }

        info!(
            master_order_id,
            success_count, failure_count, "execute_batch_completed"
        );

        BatchResult {
            success_count,
            failure_count,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_single_order(
        &self,
        master_order_id: &str,
        symbol: &str,
        side: OrderSide,
        order_type: OrderType,
        master_qty: f64,
        master_price: Option<f64>,
        master_trade_time: chrono::DateTime<Utc>,
        client_order: ClientOrder,
    ) -> bool {
        // A limit/stop order with no reference price can't be built; downgrade
        // to market rather than submit a malformed request upstream.
        let order_type = if matches!(order_type, OrderType::Limit | OrderType::Stop) && master_price.is_none() {
            OrderType::Market
        } else {
            order_type
        };

        let audit_entry = TradeAuditLog {
            id: None,
            master_order_id: master_order_id.to_string(),
            client_account_id: client_order.account_id.clone(),
            client_order_id: None,
            symbol: symbol.to_string(),
            side: side.as_str().to_string(),
            order_type: format!("{order_type:?}").to_lowercase(),
            master_qty,
            master_price,
            client_qty: Some(client_order.qty),
            client_filled_qty: None,
            client_avg_price: None,
            status: TradeStatus::Pending,
            error_message: None,
            retry_count: 0,
            replication_latency_ms: None,
            master_trade_time,
            replication_started_at: Utc::now(),
            replication_completed_at: None,
        };

        let audit_id = match self.store.log_trade_attempt(&audit_entry).await {
            Ok(id) => id,
            Err(e) => {
                error!(client = %client_order.account_id, error = %e, "failed to write pending audit row");
                return false;
            }
        };

        // Latency is measured from here, after the audit write, per the
        // spec's explicit instruction (diverges from the reference
        // implementation, which times the audit insert too).
        let start = Instant::now();

        if !self.breakers.pre_call(&client_order.account_id).await {
            self.finish(audit_id, false, None, None, Some("circuit breaker open".into()), 0, start)
                .await;
            return false;
        }

        let order_request = OrderRequest {
            symbol: symbol.to_string(),
            qty: client_order.qty,
            side,
            order_type,
            limit_price: if order_type == OrderType::Limit { master_price } else { None },
            stop_price: if order_type == OrderType::Stop { master_price } else { None },
        };

        let mut attempts = 0u32;
        let brokerage = &self.brokerage;
        let creds = client_order.credentials.clone();
        let result = with_retry(&self.retry_policy, "submit_order", || {
            attempts += 1;
            let order_request = order_request.clone();
            let creds = creds.clone();
            async move { brokerage.submit_order(&creds, order_request).await }
        })
        .await;

        match result {
            Ok(ack) => {
                self.breakers.record_success(&client_order.account_id).await;
                let _ = self
                    .store
                    .update_circuit_breaker(&client_order.account_id, StoreBreakerState::Closed, false)
                    .await;
                let _ = self.store.record_successful_trade(&client_order.account_id).await;

                self.finish(
                    audit_id,
                    true,
                    Some(ack.order_id.clone()),
                    Some((ack.filled_qty, ack.filled_avg_price)),
                    None,
                    attempts.saturating_sub(1),
                    start,
                )
                .await;
                true
            }
            Err(e) => {
                let (new_state, just_opened) = self.breakers.record_failure(&client_order.account_id).await;
                if new_state == BreakerState::Open {
                    let _ = self
                        .store
                        .update_circuit_breaker(&client_order.account_id, StoreBreakerState::Open, true)
                        .await;
                    if just_opened {
                        self.alerts.alert_breaker_opened(&client_order.account_id).await;
                    }
                }
                warn!(client = %client_order.account_id, error = %e, "client_order_failed");
                self.finish(
                    audit_id,
                    false,
                    None,
                    None,
                    Some(e.to_string()),
                    attempts.saturating_sub(1),
                    start,
                )
                .await;
                false
            }
        }
    }

    async fn finish(
        &self,
        audit_id: i64,
        success: bool,
        client_order_id: Option<String>,
        filled: Option<(f64, f64)>,
        error_message: Option<String>,
        retry_count: u32,
        start: Instant,
    ) {
        let latency_ms = start.elapsed().as_millis() as i64;
        self.latency.record(latency_ms as u64).await;

        let status = if success { TradeStatus::Success } else { TradeStatus::Failed };
        let (filled_qty, avg_price) = filled.unzip();

        let _ = self
            .store
            .update_trade_result(
                audit_id,
                status,
                client_order_id.as_deref(),
                filled_qty,
                avg_price,
                error_message.as_deref(),
                retry_count,
                Some(latency_ms),
            )
            .await;

        if success {
            let _ = self
                .store
                .record_metric("replication_latency_ms", latency_ms as f64, None)
                .await;
            if latency_ms as u64 >= self.latency_critical_threshold_ms {
                self.alerts.alert_latency_threshold_exceeded(latency_ms as u64).await;
            }
        }
    }
}
