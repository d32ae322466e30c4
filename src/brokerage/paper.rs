//! In-memory simulated brokerage, used for tests and dry runs: never makes
//! a network call, tracks positions per symbol so scaling/executor logic
//! can be exercised end to end.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::CopierError;

use super::{AccountInfo, AssetInfo, BrokerageClient, Credentials, OrderAck, OrderRequest, OrderSide, Quote};

pub struct PaperBrokerageClient {
    pub equity: f64,
    pub buying_power: f64,
    positions: Mutex<HashMap<String, f64>>,
    quotes: Mutex<HashMap<String, Quote>>,
    fractionable: Mutex<HashMap<String, bool>>,
}

impl PaperBrokerageClient {
    pub fn new(equity: f64) -> Self {
        Self {
            equity,
            buying_power: equity,
            positions: Mutex::new(HashMap::new()),
            quotes: Mutex::new(HashMap::new()),
            fractionable: Mutex::new(HashMap::new()),
        }
    }

    pub async fn set_position(&self, symbol: &str, qty: f64) {
        self.positions.lock().await.insert(symbol.to_string(), qty);
    }

    pub async fn set_quote(&self, symbol: &str, bid: f64, ask: f64) {
        self.quotes
            .lock()
            .await
            .insert(symbol.to_string(), Quote { bid, ask });
    }

    pub async fn set_fractionable(&self, symbol: &str, fractionable: bool) {
        self.fractionable
            .lock()
            .await
            .insert(symbol.to_string(), fractionable);
    }
}

#[async_trait]
impl BrokerageClient for PaperBrokerageClient {
    async fn get_account(&self, _creds: &Credentials) -> Result<AccountInfo, CopierError> {
        Ok(AccountInfo {
            equity: self.equity,
            cash: self.equity,
            buying_power: self.buying_power,
        })
    }

    async fn get_open_position(&self, _creds: &Credentials, symbol: &str) -> Result<f64, CopierError> {
        Ok(*self.positions.lock().await.get(symbol).unwrap_or(&0.0))
    }

    async fn get_asset(&self, _creds: &Credentials, symbol: &str) -> Result<AssetInfo, CopierError> {
        Ok(AssetInfo {
            fractionable: *self.fractionable.lock().await.get(symbol).unwrap_or(&false),
        })
    }

    async fn submit_order(&self, _creds: &Credentials, order: OrderRequest) -> Result<OrderAck, CopierError> {
        let mut positions = self.positions.lock().await;
        let entry = positions.entry(order.symbol.clone()).or_insert(0.0);
        match order.side {
            OrderSide::Buy => *entry += order.qty,
            OrderSide::Sell => *entry -= order.qty,
        }
        let fill_price = self
            .quotes
            .lock()
            .await
            .get(&order.symbol)
            .map(|q| q.mid())
            .unwrap_or(order.limit_price.unwrap_or(0.0));

        Ok(OrderAck {
            order_id: Uuid::new_v4().to_string(),
            filled_qty: order.qty,
            filled_avg_price: fill_price,
        })
    }

    async fn get_latest_quote(&self, _creds: &Credentials, symbol: &str) -> Result<Quote, CopierError> {
        self.quotes
            .lock()
            .await
            .get(symbol)
            .cloned()
            .ok_or_else(|| CopierError::InvalidSymbol(format!("no quote set for {symbol}")))
    }
}
