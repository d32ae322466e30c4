//! Application lifecycle: component initialization order, production
//! abort-window, credential-reload polling, graceful shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::alerts::AlertManager;
use crate::brokerage::{BrokerageClient, Credentials};
use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::executor::OrderExecutor;
use crate::ingress::EventIngress;
use crate::metrics::LatencyTracker;
use crate::retry::{BreakerRegistry, RetryPolicy};
use crate::scaling::ScalingEngine;
use crate::store::CredentialStore;

pub struct App {
    config: Config,
    store: Arc<CredentialStore>,
    alerts: Arc<AlertManager>,
    ingress: Arc<EventIngress>,
    scaling: Arc<ScalingEngine>,
}

impl App {
    pub async fn initialize(config: Config, brokerage: Arc<dyn BrokerageClient>) -> anyhow::Result<Self> {
        info!(
            master_account = %config.master_account_id,
            production = config.is_production,
            "trade_copier_initializing"
        );

        let store = Arc::new(CredentialStore::open(&config.database_path, &config.encryption_key)?);
        info!("credential_store_initialized");

        let scaling = Arc::new(ScalingEngine::new(
            brokerage.clone(),
            config.min_order_size,
            config.min_notional_value,
            config.allow_fractional_shares,
        ));
        info!("scaling_engine_initialized");

        let (api_key, secret_key) = store
            .get_master_credentials()
            .await?
            .ok_or_else(|| anyhow::anyhow!("no master account configured; add one before starting"))?;

        let alerts = Arc::new(AlertManager::new(
            config.slack_webhook_url.clone(),
            config.enable_slack_alerts,
            config.enable_email_alerts,
        ));
        info!("alert_manager_initialized");

        let ingress = Arc::new(EventIngress::new(
            store.clone(),
            alerts.clone(),
            config.brokerage_stream_url.clone(),
            Credentials { api_key, secret_key },
            config.stream_reconnect_initial_delay_secs as f64,
        ));
        info!("event_ingress_initialized");

        info!("trade_copier_initialized_successfully");

        Ok(Self {
            config,
            store,
            alerts,
            ingress,
            scaling,
        })
    }

    pub async fn run(self, brokerage: Arc<dyn BrokerageClient>) -> anyhow::Result<()> {
        if self.config.is_production {
            warn!("RUNNING IN PRODUCTION MODE, press Ctrl+C within 10 seconds to abort");
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(10)) => {}
                _ = tokio::signal::ctrl_c() => {
                    info!("startup_aborted_by_user");
                    return Ok(());
                }
            }
        }

        let breakers = Arc::new(BreakerRegistry::new(
            self.config.failure_threshold,
            Duration::from_secs(self.config.circuit_timeout_secs),
        ));
        let latency = Arc::new(LatencyTracker::new());
        let retry_policy = RetryPolicy {
            max_attempts: self.config.retry_max_attempts,
            initial_delay_ms: self.config.retry_initial_delay_ms,
            max_delay_ms: self.config.retry_max_delay_ms,
            exponential_base: self.config.retry_exponential_base,
            jitter: self.config.retry_jitter,
        };

        let executor = Arc::new(OrderExecutor::new(
            self.store.clone(),
            brokerage.clone(),
            breakers,
            self.alerts.clone(),
            latency,
            retry_policy,
            self.config.latency_critical_threshold_ms,
        ));

        let dispatcher = Arc::new(Dispatcher::new(
            self.store.clone(),
            self.scaling.clone(),
            executor,
            brokerage,
        ));

        let (tx, mut rx) = mpsc::channel(256);
        let ingress = self.ingress.clone();
        let ingress_task = tokio::spawn(async move { ingress.run(tx).await });

        let dispatcher_loop = dispatcher.clone();
        let dispatch_task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                dispatcher_loop.dispatch_trade(event).await;
            }
        });

        let reload_store = self.store.clone();
        let reload_ingress = self.ingress.clone();
        let reload_interval = Duration::from_secs(self.config.master_credential_check_interval_secs);
        let reload_task = tokio::spawn(async move {
            credential_reload_loop(reload_store, reload_ingress, reload_interval).await;
        });

        info!("trade_copier_running");
        self.alerts
            .send_alert(
                "trade_copier_started",
                "Trade Copier Started",
                "trade copier system started successfully",
                crate::alerts::AlertSeverity::Info,
            )
            .await;

        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");

        self.ingress.stop();
        reload_task.abort();
        // ingress owns the send half of the channel; once its task returns,
        // dropping `tx` closes the channel and the dispatch loop below drains
        // whatever was already queued and exits on its own.
        let _ = ingress_task.await;
        let _ = dispatch_task.await;

        self.store.close().await;
        info!("credential_store_closed");

        self.alerts.close().await;
        info!("alert_manager_closed");

        Ok(())
    }
}

async fn credential_reload_loop(store: Arc<CredentialStore>, ingress: Arc<EventIngress>, interval: Duration) {
    let mut last_updated_at = store
        .get_master()
        .await
        .ok()
        .flatten()
        .map(|m| m.updated_at);

    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        match store.get_master().await {
            Ok(Some(master)) if Some(master.updated_at) != last_updated_at => {
                last_updated_at = Some(master.updated_at);
                match store.get_master_credentials().await {
                    Ok(Some((api_key, secret_key))) => {
                        ingress
                            .reconnect_with_new_credentials(Credentials { api_key, secret_key })
                            .await;
                        info!("master_credentials_reloaded");
                    }
                    Ok(None) => warn!("master_updated_but_credentials_unavailable"),
                    Err(e) => warn!(error = %e, "failed_to_decrypt_reloaded_master_credentials"),
                }
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "credential_reload_poll_failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::AlertManager;

    #[tokio::test]
    async fn reload_loop_picks_up_rotated_master_credentials() {
        let store = Arc::new(CredentialStore::open(":memory:", "test-secret").unwrap());
        store.update_master("MASTER1", "old-key", "old-secret").await.unwrap();

        let alerts = Arc::new(AlertManager::new(None, false, false));
        let ingress = Arc::new(EventIngress::new(
            store.clone(),
            alerts,
            "wss://example.invalid".into(),
            Credentials {
                api_key: "old-key".into(),
                secret_key: "old-secret".into(),
            },
            5.0,
        ));

        let reload_store = store.clone();
        let reload_ingress = ingress.clone();
        let task = tokio::spawn(async move {
            credential_reload_loop(reload_store, reload_ingress, Duration::from_millis(20)).await;
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        store.update_master("MASTER1", "new-key", "new-secret").await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        task.abort();

        assert_eq!(ingress.current_api_key().await, "new-key");
    }
}
