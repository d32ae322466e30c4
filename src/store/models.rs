//! Persistent data model, field-for-field with the credential store's schema.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "open" => BreakerState::Open,
            "half_open" => BreakerState::HalfOpen,
            _ => BreakerState::Closed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeDirection {
    Long,
    Short,
    Both,
}

impl TradeDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeDirection::Long => "long",
            TradeDirection::Short => "short",
            TradeDirection::Both => "both",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "long" => TradeDirection::Long,
            "short" => TradeDirection::Short,
            _ => TradeDirection::Both,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeStatus {
    Pending,
    Success,
    Failed,
    Partial,
}

impl TradeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeStatus::Pending => "pending",
            TradeStatus::Success => "success",
            TradeStatus::Failed => "failed",
            TradeStatus::Partial => "partial",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "success" => TradeStatus::Success,
            "failed" => TradeStatus::Failed,
            "partial" => TradeStatus::Partial,
            _ => TradeStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterAccount {
    pub account_id: String,
    pub encrypted_api_key: String,
    pub encrypted_secret_key: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientAccount {
    pub account_id: String,
    pub encrypted_api_key: String,
    pub encrypted_secret_key: String,
    pub display_name: Option<String>,
    pub email: Option<String>,
    pub is_active: bool,
    pub breaker_state: BreakerState,
    pub failure_count: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub risk_multiplier: f64,
    pub trade_direction: TradeDirection,
    pub last_successful_trade: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeAuditLog {
    pub id: Option<i64>,
    pub master_order_id: String,
    pub client_account_id: String,
    pub client_order_id: Option<String>,
    pub symbol: String,
    pub side: String,
    pub order_type: String,
    pub master_qty: f64,
    pub master_price: Option<f64>,
    pub client_qty: Option<f64>,
    pub client_filled_qty: Option<f64>,
    pub client_avg_price: Option<f64>,
    pub status: TradeStatus,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub replication_latency_ms: Option<i64>,
    pub master_trade_time: DateTime<Utc>,
    pub replication_started_at: DateTime<Utc>,
    pub replication_completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeduplicationEntry {
    pub event_id: String,
    pub event_type: String,
    pub content_hash: String,
    pub processed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemMetric {
    pub timestamp: DateTime<Utc>,
    pub metric_name: String,
    pub metric_value: f64,
    pub tags: Option<String>,
}
