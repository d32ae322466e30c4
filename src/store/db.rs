//! SQLite-backed credential store: encrypted credentials, audit log,
//! dedup cache, and system metrics.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use super::models::{
    BreakerState, ClientAccount, DeduplicationEntry, MasterAccount, TradeAuditLog, TradeDirection,
    TradeStatus,
};
use crate::crypto::Cipher;

const DEDUP_TTL_HOURS: i64 = 24;

pub struct CredentialStore {
    conn: Arc<Mutex<Connection>>,
    cipher: Cipher,
}

impl CredentialStore {
    pub fn open(db_path: &str, encryption_secret: &str) -> Result<Self> {
        let conn = Connection::open(db_path).context("open credential store database")?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            cipher: Cipher::from_secret(encryption_secret)?,
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS master_accounts (
                account_id TEXT PRIMARY KEY,
                encrypted_api_key TEXT NOT NULL,
                encrypted_secret_key TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_master_active ON master_accounts(is_active);

            CREATE TABLE IF NOT EXISTS client_accounts (
                account_id TEXT PRIMARY KEY,
                encrypted_api_key TEXT NOT NULL,
                encrypted_secret_key TEXT NOT NULL,
                display_name TEXT,
                email TEXT,
                is_active INTEGER NOT NULL DEFAULT 1,
                breaker_state TEXT NOT NULL DEFAULT 'closed',
                failure_count INTEGER NOT NULL DEFAULT 0,
                last_failure_time TEXT,
                risk_multiplier REAL NOT NULL DEFAULT 1.0,
                trade_direction TEXT NOT NULL DEFAULT 'both',
                last_successful_trade TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_active_accounts ON client_accounts(is_active, breaker_state);

            CREATE TABLE IF NOT EXISTS trade_audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                master_order_id TEXT NOT NULL,
                client_account_id TEXT NOT NULL,
                client_order_id TEXT,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                order_type TEXT NOT NULL,
                master_qty REAL NOT NULL,
                master_price REAL,
                client_qty REAL,
                client_filled_qty REAL,
                client_avg_price REAL,
                status TEXT NOT NULL DEFAULT 'pending',
                error_message TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                replication_latency_ms INTEGER,
                master_trade_time TEXT NOT NULL,
                replication_started_at TEXT NOT NULL,
                replication_completed_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_audit_master_order ON trade_audit_log(master_order_id);
            CREATE INDEX IF NOT EXISTS idx_audit_client ON trade_audit_log(client_account_id);
            CREATE INDEX IF NOT EXISTS idx_audit_status ON trade_audit_log(status);

            CREATE TABLE IF NOT EXISTS system_metrics (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                metric_name TEXT NOT NULL,
                metric_value REAL NOT NULL,
                tags TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_metrics_name_time ON system_metrics(metric_name, timestamp);

            CREATE TABLE IF NOT EXISTS deduplication_cache (
                event_id TEXT PRIMARY KEY,
                event_type TEXT NOT NULL,
                content_hash TEXT NOT NULL,
                processed_at TEXT NOT NULL,
                expires_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_dedup_hash ON deduplication_cache(content_hash);
            CREATE INDEX IF NOT EXISTS idx_dedup_expiry ON deduplication_cache(expires_at);
            ",
        )
        .context("create credential store schema")?;
        Ok(())
    }

    // ---- master account ----

    pub async fn get_master(&self) -> Result<Option<MasterAccount>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT account_id, encrypted_api_key, encrypted_secret_key, is_active, created_at, updated_at
             FROM master_accounts WHERE is_active = 1 LIMIT 1",
            [],
            |row| {
                Ok(MasterAccount {
                    account_id: row.get(0)?,
                    encrypted_api_key: row.get(1)?,
                    encrypted_secret_key: row.get(2)?,
                    is_active: row.get(3)?,
                    created_at: row.get(4)?,
                    updated_at: row.get(5)?,
                })
            },
        )
        .optional()
        .context("query active master account")
    }

    pub async fn update_master(&self, account_id: &str, api_key: &str, secret_key: &str) -> Result<()> {
        let encrypted_api_key = self.cipher.encrypt(api_key)?;
        let encrypted_secret_key = self.cipher.encrypt(secret_key)?;
        let now = Utc::now();

        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        tx.execute("UPDATE master_accounts SET is_active = 0", [])?;
        tx.execute(
            "INSERT INTO master_accounts (account_id, encrypted_api_key, encrypted_secret_key, is_active, created_at, updated_at)
             VALUES (?1, ?2, ?3, 1, ?4, ?4)
             ON CONFLICT(account_id) DO UPDATE SET
                encrypted_api_key = excluded.encrypted_api_key,
                encrypted_secret_key = excluded.encrypted_secret_key,
                is_active = 1,
                updated_at = excluded.updated_at",
            params![account_id, encrypted_api_key, encrypted_secret_key, now],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub async fn get_master_credentials(&self) -> Result<Option<(String, String)>> {
        let master = match self.get_master().await? {
            Some(m) => m,
            None => return Ok(None),
        };
        let api_key = self.cipher.decrypt(&master.encrypted_api_key)?;
        let secret_key = self.cipher.decrypt(&master.encrypted_secret_key)?;
        Ok(Some((api_key, secret_key)))
    }

    // ---- client accounts ----

    pub async fn add_or_update_client(
        &self,
        account_id: &str,
        api_key: &str,
        secret_key: &str,
        display_name: Option<&str>,
        email: Option<&str>,
        risk_multiplier: f64,
        trade_direction: TradeDirection,
    ) -> Result<()> {
        let encrypted_api_key = self.cipher.encrypt(api_key)?;
        let encrypted_secret_key = self.cipher.encrypt(secret_key)?;
        let now = Utc::now();

        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO client_accounts
                (account_id, encrypted_api_key, encrypted_secret_key, display_name, email,
                 is_active, breaker_state, failure_count, risk_multiplier, trade_direction,
                 created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 1, 'closed', 0, ?6, ?7, ?8, ?8)
             ON CONFLICT(account_id) DO UPDATE SET
                encrypted_api_key = excluded.encrypted_api_key,
                encrypted_secret_key = excluded.encrypted_secret_key,
                display_name = excluded.display_name,
                email = excluded.email,
                risk_multiplier = excluded.risk_multiplier,
                trade_direction = excluded.trade_direction,
                updated_at = excluded.updated_at",
            params![
                account_id,
                encrypted_api_key,
                encrypted_secret_key,
                display_name,
                email,
                risk_multiplier,
                trade_direction.as_str(),
                now,
            ],
        )
        .context("upsert client account")?;
        Ok(())
    }

    fn row_to_client(row: &rusqlite::Row) -> rusqlite::Result<ClientAccount> {
        let breaker_state: String = row.get(6)?;
        let trade_direction: String = row.get(9)?;
        Ok(ClientAccount {
            account_id: row.get(0)?,
            encrypted_api_key: row.get(1)?,
            encrypted_secret_key: row.get(2)?,
            display_name: row.get(3)?,
            email: row.get(4)?,
            is_active: row.get(5)?,
            breaker_state: BreakerState::parse(&breaker_state),
            failure_count: row.get(7)?,
            last_failure_time: row.get(8)?,
            risk_multiplier: row.get(10)?,
            trade_direction: TradeDirection::parse(&trade_direction),
            last_successful_trade: row.get(11)?,
            created_at: row.get(12)?,
            updated_at: row.get(13)?,
        })
    }

    const CLIENT_COLUMNS: &'static str = "account_id, encrypted_api_key, encrypted_secret_key, display_name, email, \
         is_active, breaker_state, failure_count, last_failure_time, trade_direction, \
         risk_multiplier, last_successful_trade, created_at, updated_at";

    pub async fn get_client(&self, account_id: &str) -> Result<Option<ClientAccount>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {} FROM client_accounts WHERE account_id = ?1",
            Self::CLIENT_COLUMNS
        );
        conn.query_row(&sql, params![account_id], Self::row_to_client)
            .optional()
            .context("query client account")
    }

    /// Clients eligible for replication: active and breaker not open.
    pub async fn list_active_eligible_clients(&self) -> Result<Vec<ClientAccount>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {} FROM client_accounts WHERE is_active = 1 AND breaker_state != 'open'",
            Self::CLIENT_COLUMNS
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt
            .query_map([], Self::row_to_client)
            .context("query eligible clients")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("collect eligible clients")
    }

    /// Every client account regardless of active/breaker state, for admin
    /// listing. `active_only` applies the same active-account filter the CLI
    /// exposes via `--active-only`.
    pub async fn list_all_clients(&self, active_only: bool) -> Result<Vec<ClientAccount>> {
        let conn = self.conn.lock().await;
        let sql = if active_only {
            format!("SELECT {} FROM client_accounts WHERE is_active = 1", Self::CLIENT_COLUMNS)
        } else {
            format!("SELECT {} FROM client_accounts", Self::CLIENT_COLUMNS)
        };
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt.query_map([], Self::row_to_client).context("query all clients")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("collect all clients")
    }

    pub async fn decrypt_client_credentials(&self, client: &ClientAccount) -> Result<(String, String)> {
        let api_key = self.cipher.decrypt(&client.encrypted_api_key)?;
        let secret_key = self.cipher.decrypt(&client.encrypted_secret_key)?;
        Ok((api_key, secret_key))
    }

    pub async fn soft_deactivate(&self, account_id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE client_accounts SET is_active = 0, updated_at = ?2 WHERE account_id = ?1",
            params![account_id, Utc::now()],
        )?;
        Ok(())
    }

    pub async fn hard_delete(&self, account_id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM client_accounts WHERE account_id = ?1",
            params![account_id],
        )?;
        Ok(())
    }

    /// Atomic breaker transition. When `increment_failures` is set the
    /// failure counter is bumped as part of the same update.
    pub async fn update_circuit_breaker(
        &self,
        account_id: &str,
        new_state: BreakerState,
        increment_failures: bool,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        let now = Utc::now();
        if new_state == BreakerState::Closed {
            conn.execute(
                "UPDATE client_accounts SET breaker_state = 'closed', failure_count = 0,
                 last_failure_time = NULL, updated_at = ?2 WHERE account_id = ?1",
                params![account_id, now],
            )?;
        } else if increment_failures {
            conn.execute(
                "UPDATE client_accounts SET breaker_state = ?2, failure_count = failure_count + 1,
                 last_failure_time = ?3, updated_at = ?3 WHERE account_id = ?1",
                params![account_id, new_state.as_str(), now],
            )?;
        } else {
            conn.execute(
                "UPDATE client_accounts SET breaker_state = ?2, updated_at = ?3 WHERE account_id = ?1",
                params![account_id, new_state.as_str(), now],
            )?;
        }
        Ok(())
    }

    pub async fn record_successful_trade(&self, account_id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        let now = Utc::now();
        conn.execute(
            "UPDATE client_accounts SET last_successful_trade = ?2, updated_at = ?2 WHERE account_id = ?1",
            params![account_id, now],
        )?;
        Ok(())
    }

    // ---- audit log ----

    pub async fn log_trade_attempt(&self, entry: &TradeAuditLog) -> Result<i64> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO trade_audit_log
                (master_order_id, client_account_id, client_order_id, symbol, side, order_type,
                 master_qty, master_price, client_qty, status, retry_count,
                 master_trade_time, replication_started_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                entry.master_order_id,
                entry.client_account_id,
                entry.client_order_id,
                entry.symbol,
                entry.side,
                entry.order_type,
                entry.master_qty,
                entry.master_price,
                entry.client_qty,
                entry.status.as_str(),
                entry.retry_count,
                entry.master_trade_time,
                entry.replication_started_at,
            ],
        )
        .context("insert trade audit row")?;
        Ok(conn.last_insert_rowid())
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn update_trade_result(
        &self,
        audit_id: i64,
        status: TradeStatus,
        client_order_id: Option<&str>,
        client_filled_qty: Option<f64>,
        client_avg_price: Option<f64>,
        error_message: Option<&str>,
        retry_count: u32,
        replication_latency_ms: Option<i64>,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE trade_audit_log SET
                status = ?2, client_order_id = ?3, client_filled_qty = ?4, client_avg_price = ?5,
                error_message = ?6, retry_count = ?7, replication_latency_ms = ?8,
                replication_completed_at = ?9
             WHERE id = ?1",
            params![
                audit_id,
                status.as_str(),
                client_order_id,
                client_filled_qty,
                client_avg_price,
                error_message,
                retry_count,
                replication_latency_ms,
                Utc::now(),
            ],
        )
        .context("update trade audit row")?;
        Ok(())
    }

    // ---- dedup cache ----

    pub fn content_hash(payload: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(payload.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Returns true if this event is a duplicate (already recorded and not
    /// expired). Deletes expired entries first, then checks event_id OR
    /// content_hash, then inserts on miss — all within one transaction so
    /// concurrent callers with the same key cannot both observe "not a
    /// duplicate".
    pub async fn check_and_record_event(
        &self,
        event_id: &str,
        event_type: &str,
        content_hash: &str,
    ) -> Result<bool> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let now = Utc::now();

        tx.execute(
            "DELETE FROM deduplication_cache WHERE expires_at < ?1",
            params![now],
        )?;

        let existing: Option<String> = tx
            .query_row(
                "SELECT event_id FROM deduplication_cache WHERE event_id = ?1 OR content_hash = ?2",
                params![event_id, content_hash],
                |row| row.get(0),
            )
            .optional()?;

        if existing.is_some() {
            tx.commit()?;
            return Ok(true);
        }

        let expires_at = now + ChronoDuration::hours(DEDUP_TTL_HOURS);
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO deduplication_cache (event_id, event_type, content_hash, processed_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![event_id, event_type, content_hash, now, expires_at],
        )?;
        tx.commit()?;

        // INSERT OR IGNORE affected 0 rows only if another transaction won
        // the race on the event_id primary key between our SELECT and our
        // INSERT; treat that as a duplicate too.
        Ok(inserted == 0)
    }

    // ---- metrics ----

    pub async fn record_metric(&self, name: &str, value: f64, tags: Option<&str>) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO system_metrics (timestamp, metric_name, metric_value, tags) VALUES (?1, ?2, ?3, ?4)",
            params![Utc::now(), name, value, tags],
        )?;
        Ok(())
    }

    pub async fn close(&self) {
        // rusqlite::Connection closes on drop; nothing to flush explicitly,
        // but this gives the orchestrator an explicit lifecycle hook that
        // mirrors the other components' `close()`.
        let _ = self.conn.lock().await;
    }
}
