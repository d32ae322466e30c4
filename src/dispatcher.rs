//! Per-fill orchestration: load eligible clients, scale in parallel,
//! execute in parallel.

use std::sync::Arc;

use futures_util::future::join_all;
use tracing::{debug, error, info, warn};

use crate::brokerage::{BrokerageClient, Credentials};
use crate::executor::{ClientOrder, OrderExecutor};
use crate::ingress::FillEvent;
use crate::scaling::{ScalingEngine, ScalingInput};
use crate::store::CredentialStore;

pub struct Dispatcher {
    store: Arc<CredentialStore>,
    scaling: Arc<ScalingEngine>,
    executor: Arc<OrderExecutor>,
    brokerage: Arc<dyn BrokerageClient>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<CredentialStore>,
        scaling: Arc<ScalingEngine>,
        executor: Arc<OrderExecutor>,
        brokerage: Arc<dyn BrokerageClient>,
    ) -> Self {
        Self {
            store,
            scaling,
            executor,
            brokerage,
        }
    }

    pub async fn dispatch_trade(&self, event: FillEvent) {
        if let Err(e) = self.try_dispatch(&event).await {
            error!(master_order_id = %event.master_order_id, error = %e, "trade_dispatch_error");
        }
    }

    async fn try_dispatch(&self, event: &FillEvent) -> anyhow::Result<()> {
        let master_creds = self
            .store
            .get_master_credentials()
            .await?
            .ok_or_else(|| anyhow::anyhow!("no active master account configured"))?;
        let master_creds = Credentials {
            api_key: master_creds.0,
            secret_key: master_creds.1,
        };

        let clients = self.store.list_active_eligible_clients().await?;
        if clients.is_empty() {
            debug!("no_eligible_clients, skipping dispatch");
            return Ok(());
        }

        let current_price = match self.brokerage.get_latest_quote(&master_creds, &event.symbol).await {
            Ok(quote) => Some(quote.mid()),
            Err(_) => event.price,
        };

        let master_remaining = match self.brokerage.get_open_position(&master_creds, &event.symbol).await {
            Ok(qty) => qty,
            Err(e) => {
                warn!(error = %e, "failed to read master position, treating as flat");
                0.0
            }
        };

        let scaling_input = ScalingInput {
            symbol: &event.symbol,
            side: event.side,
            master_qty: event.qty,
            master_remaining,
            current_price,
        };

        let scaling_tasks = clients.iter().map(|client| {
            let scaling = self.scaling.clone();
            let store = self.store.clone();
            let client = client.clone();
            let master_creds = master_creds.clone();
            async move {
                let (api_key, secret_key) = match store.decrypt_client_credentials(&client).await {
                    Ok(c) => c,
                    Err(e) => {
                        warn!(client = %client.account_id, error = %e, "failed to decrypt client credentials");
                        return None;
                    }
                };
                let client_creds = Credentials { api_key, secret_key };
                let qty = scaling
                    .scale_for_client(scaling_input, &client, &master_creds, &client_creds)
                    .await?;
                if qty <= 0.0 {
                    return None;
                }
                Some(ClientOrder {
                    account_id: client.account_id.clone(),
                    credentials: client_creds,
                    qty,
                })
            }
        });

        let client_orders: Vec<ClientOrder> = join_all(scaling_tasks).await.into_iter().flatten().collect();

        if client_orders.is_empty() {
            warn!(master_order_id = %event.master_order_id, "no_client_orders_after_scaling");
            return Ok(());
        }

        let order_type = match event.order_type.as_str() {
            "limit" => crate::brokerage::OrderType::Limit,
            "stop" => crate::brokerage::OrderType::Stop,
            _ => crate::brokerage::OrderType::Market,
        };

        let result = self
            .executor
            .execute_batch(
                &event.master_order_id,
                &event.symbol,
                event.side,
                order_type,
                event.qty,
                event.price,
                event.timestamp,
                client_orders,
            )
            .await;

        info!(
            master_order_id = %event.master_order_id,
            success = result.success_count,
            failure = result.failure_count,
            "trade_dispatch_completed"
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::AlertManager;
    use crate::brokerage::paper::PaperBrokerageClient;
    use crate::brokerage::OrderSide;
    use crate::metrics::LatencyTracker;
    use crate::retry::{BreakerRegistry, RetryPolicy};
    use crate::store::TradeDirection;
    use std::time::Duration;

    async fn build_dispatcher(brokerage: Arc<PaperBrokerageClient>) -> (Dispatcher, Arc<CredentialStore>) {
        let store = Arc::new(CredentialStore::open(":memory:", "test-secret").unwrap());
        store.update_master("MASTER1", "mk", "ms").await.unwrap();
        store
            .add_or_update_client("CLIENT1", "ck", "cs", None, None, 1.0, TradeDirection::Both)
            .await
            .unwrap();

        let brokerage: Arc<dyn BrokerageClient> = brokerage;
        let scaling = Arc::new(ScalingEngine::new(brokerage.clone(), 1.0, 0.0, true));
        let breakers = Arc::new(BreakerRegistry::new(3, Duration::from_secs(60)));
        let alerts = Arc::new(AlertManager::new(None, false, false));
        let latency = Arc::new(LatencyTracker::new());
        let executor = Arc::new(OrderExecutor::new(
            store.clone(),
            brokerage.clone(),
            breakers,
            alerts,
            latency,
            RetryPolicy::default(),
            5_000,
        ));

        (Dispatcher::new(store.clone(), scaling, executor, brokerage), store)
    }

    #[tokio::test]
    async fn proportional_buy_replicates_to_eligible_client() {
        let broker = Arc::new(PaperBrokerageClient::new(10_000.0));
        broker.set_quote("ABC", 49.9, 50.1).await;
        let (dispatcher, store) = build_dispatcher(broker.clone()).await;

        let event = FillEvent {
            master_order_id: "O1".into(),
            symbol: "ABC".into(),
            side: OrderSide::Buy,
            order_type: "market".into(),
            qty: 10.0,
            price: Some(50.0),
            timestamp: chrono::Utc::now(),
        };

        dispatcher.dispatch_trade(event).await;

        let any_creds = Credentials {
            api_key: "mk".into(),
            secret_key: "ms".into(),
        };
        let client_position = broker.get_open_position(&any_creds, "ABC").await.unwrap();
        assert!(client_position > 0.0, "expected a replicated buy, got {client_position}");

        let client = store.get_client("CLIENT1").await.unwrap().unwrap();
        assert_eq!(client.breaker_state, crate::store::BreakerState::Closed);
    }

    #[tokio::test]
    async fn no_eligible_clients_is_a_noop() {
        let broker = Arc::new(PaperBrokerageClient::new(10_000.0));
        let store = Arc::new(CredentialStore::open(":memory:", "test-secret").unwrap());
        store.update_master("MASTER1", "mk", "ms").await.unwrap();

        let brokerage: Arc<dyn BrokerageClient> = broker;
        let scaling = Arc::new(ScalingEngine::new(brokerage.clone(), 1.0, 0.0, true));
        let breakers = Arc::new(BreakerRegistry::new(3, Duration::from_secs(60)));
        let alerts = Arc::new(AlertManager::new(None, false, false));
        let latency = Arc::new(LatencyTracker::new());
        let executor = Arc::new(OrderExecutor::new(
            store.clone(),
            brokerage.clone(),
            breakers,
            alerts,
            latency,
            RetryPolicy::default(),
            5_000,
        ));
        let dispatcher = Dispatcher::new(store, scaling, executor, brokerage);

        let event = FillEvent {
            master_order_id: "O2".into(),
            symbol: "XYZ".into(),
            side: OrderSide::Buy,
            order_type: "market".into(),
            qty: 5.0,
            price: Some(10.0),
            timestamp: chrono::Utc::now(),
        };

        dispatcher.dispatch_trade(event).await;
    }
}
