//! Brokerage dependency: the REST surface the scaling engine and order
//! executor need, abstracted behind one trait so paper and live brokerages
//! are interchangeable.

pub mod alpaca;
pub mod paper;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CopierError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit,
    Stop,
}

#[derive(Debug, Clone)]
pub struct AccountInfo {
    pub equity: f64,
    pub cash: f64,
    pub buying_power: f64,
}

#[derive(Debug, Clone)]
pub struct AssetInfo {
    pub fractionable: bool,
}

#[derive(Debug, Clone)]
pub struct Quote {
    pub bid: f64,
    pub ask: f64,
}

impl Quote {
    pub fn mid(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }
}

#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub symbol: String,
    pub qty: f64,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub limit_price: Option<f64>,
    pub stop_price: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct OrderAck {
    pub order_id: String,
    pub filled_qty: f64,
    pub filled_avg_price: f64,
}

/// Per-account credentials, held only transiently in the caller's stack.
#[derive(Clone)]
pub struct Credentials {
    pub api_key: String,
    pub secret_key: String,
}

#[async_trait]
pub trait BrokerageClient: Send + Sync {
    async fn get_account(&self, creds: &Credentials) -> Result<AccountInfo, CopierError>;

    /// `Ok(0.0)` if the account holds no position in `symbol` — brokerages
    /// typically 404 on a missing position, which this trait normalizes to
    /// a flat quantity rather than an error.
    async fn get_open_position(&self, creds: &Credentials, symbol: &str) -> Result<f64, CopierError>;

    async fn get_asset(&self, creds: &Credentials, symbol: &str) -> Result<AssetInfo, CopierError>;

    async fn submit_order(
        &self,
        creds: &Credentials,
        order: OrderRequest,
    ) -> Result<OrderAck, CopierError>;

    async fn get_latest_quote(&self, creds: &Credentials, symbol: &str) -> Result<Quote, CopierError>;
}
