//! Credential store: encrypted-at-rest accounts, audit log, dedup cache.

pub mod db;
pub mod models;

pub use db::CredentialStore;
pub use models::{
    BreakerState, ClientAccount, DeduplicationEntry, MasterAccount, SystemMetric, TradeAuditLog,
    TradeDirection, TradeStatus,
};
