//! Header-authenticated REST brokerage client (Alpaca-shaped API).

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use crate::error::{classify, CopierError};

use super::{AccountInfo, AssetInfo, BrokerageClient, Credentials, OrderAck, OrderRequest, OrderType, Quote};

pub struct AlpacaClient {
    http: Client,
    base_url: String,
}

impl AlpacaClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .expect("reqwest client builds with default TLS backend"),
            base_url: base_url.into(),
        }
    }

    fn authed(&self, creds: &Credentials, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.base_url, path))
            .header("APCA-API-KEY-ID", &creds.api_key)
            .header("APCA-API-SECRET-KEY", &creds.secret_key)
    }

    async fn upstream_error(resp: reqwest::Response) -> CopierError {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        classify(&format!("{} {}", status.as_u16(), body))
    }
}

#[derive(Deserialize)]
struct AlpacaAccount {
    equity: String,
    cash: String,
    buying_power: String,
}

#[derive(Deserialize)]
struct AlpacaPosition {
    qty: String,
}

#[derive(Deserialize)]
struct AlpacaAsset {
    fractionable: bool,
}

#[derive(Deserialize)]
struct AlpacaOrderAck {
    id: String,
    filled_qty: Option<String>,
    filled_avg_price: Option<String>,
}

#[derive(Deserialize)]
struct AlpacaQuote {
    #[serde(rename = "bp")]
    bid_price: f64,
    #[serde(rename = "ap")]
    ask_price: f64,
}

#[derive(Deserialize)]
struct AlpacaQuoteEnvelope {
    quote: AlpacaQuote,
}

fn parse_f64(s: &str) -> Result<f64, CopierError> {
    s.parse()
        .map_err(|_| CopierError::Unknown(format!("brokerage returned unparseable number: {s}")))
}

#[async_trait]
impl BrokerageClient for AlpacaClient {
    async fn get_account(&self, creds: &Credentials) -> Result<AccountInfo, CopierError> {
        let resp = self
            .authed(creds, reqwest::Method::GET, "/v2/account")
            .send()
            .await
            .map_err(|e| classify(&e.to_string()))?;

        if !resp.status().is_success() {
            return Err(Self::upstream_error(resp).await);
        }
        let body: AlpacaAccount = resp
            .json()
            .await
            .map_err(|e| CopierError::Unknown(e.to_string()))?;

        Ok(AccountInfo {
            equity: parse_f64(&body.equity)?,
            cash: parse_f64(&body.cash)?,
            buying_power: parse_f64(&body.buying_power)?,
        })
    }

    async fn get_open_position(&self, creds: &Credentials, symbol: &str) -> Result<f64, CopierError> {
        let resp = self
            .authed(creds, reqwest::Method::GET, &format!("/v2/positions/{symbol}"))
            .send()
            .await
            .map_err(|e| classify(&e.to_string()))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(0.0);
        }
        if !resp.status().is_success() {
            return Err(Self::upstream_error(resp).await);
        }
        let body: AlpacaPosition = resp
            .json()
            .await
            .map_err(|e| CopierError::Unknown(e.to_string()))?;
        parse_f64(&body.qty)
    }

    async fn get_asset(&self, creds: &Credentials, symbol: &str) -> Result<AssetInfo, CopierError> {
        let resp = self
            .authed(creds, reqwest::Method::GET, &format!("/v2/assets/{symbol}"))
            .send()
            .await
            .map_err(|e| classify(&e.to_string()))?;

        if !resp.status().is_success() {
            // Matches the reference behavior: default to non-fractionable
            // on lookup failure rather than hard-failing the whole order.
            return Ok(AssetInfo { fractionable: false });
        }
        let body: AlpacaAsset = resp
            .json()
            .await
            .map_err(|e| CopierError::Unknown(e.to_string()))?;
        Ok(AssetInfo {
            fractionable: body.fractionable,
        })
    }

    async fn submit_order(&self, creds: &Credentials, order: OrderRequest) -> Result<OrderAck, CopierError> {
        let mut payload = json!({
            "symbol": order.symbol,
            "qty": format!("{}", order.qty),
            "side": order.side.as_str(),
            "type": match order.order_type {
                OrderType::Market => "market",
                OrderType::Limit => "limit",
                OrderType::Stop => "stop",
            },
            "time_in_force": "day",
        });
        if let Some(price) = order.limit_price {
            payload["limit_price"] = json!(format!("{price}"));
        }
        if let Some(price) = order.stop_price {
            payload["stop_price"] = json!(format!("{price}"));
        }

        let resp = self
            .authed(creds, reqwest::Method::POST, "/v2/orders")
            .json(&payload)
            .send()
            .await
            .map_err(|e| classify(&e.to_string()))?;

        if !resp.status().is_success() {
            return Err(Self::upstream_error(resp).await);
        }
        let body: AlpacaOrderAck = resp
            .json()
            .await
            .map_err(|e| CopierError::Unknown(e.to_string()))?;

        Ok(OrderAck {
            order_id: body.id,
            filled_qty: body
                .filled_qty
                .as_deref()
                .map(parse_f64)
                .transpose()?
                .unwrap_or(0.0),
            filled_avg_price: body
                .filled_avg_price
                .as_deref()
                .map(parse_f64)
                .transpose()?
                .unwrap_or(0.0),
        })
    }

    async fn get_latest_quote(&self, creds: &Credentials, symbol: &str) -> Result<Quote, CopierError> {
        let resp = self
            .authed(
                creds,
                reqwest::Method::GET,
                &format!("/v2/stocks/{symbol}/quotes/latest"),
            )
            .send()
            .await
            .map_err(|e| classify(&e.to_string()))?;

        if !resp.status().is_success() {
            return Err(Self::upstream_error(resp).await);
        }
        let body: AlpacaQuoteEnvelope = resp
            .json()
            .await
            .map_err(|e| CopierError::Unknown(e.to_string()))?;
        Ok(Quote {
            bid: body.quote.bid_price,
            ask: body.quote.ask_price,
        })
    }
}
