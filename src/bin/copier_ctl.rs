//! `copier-ctl`: thin CLI front-end over the Credential Store. Contains no
//! replication logic — add/bulk-load/list/delete/test-connection only.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use trade_copier::brokerage::alpaca::AlpacaClient;
use trade_copier::brokerage::{BrokerageClient, Credentials};
use trade_copier::config::Config;
use trade_copier::store::{CredentialStore, TradeDirection};

#[derive(Parser)]
#[command(name = "copier-ctl", about = "Manage trade-copier client accounts")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Add or update a single client account.
    Add {
        account_id: String,
        api_key: String,
        secret_key: String,
        #[arg(long)]
        display_name: Option<String>,
        #[arg(long)]
        email: Option<String>,
        #[arg(long, default_value_t = 1.0)]
        risk_multiplier: f64,
        #[arg(long, default_value = "both")]
        trade_direction: String,
    },
    /// Bulk-load clients from a CSV with columns:
    /// account_id,api_key,secret_key,account_name,email,is_active
    BulkLoad { csv_path: String },
    /// List client accounts.
    List {
        #[arg(long)]
        active_only: bool,
    },
    /// Delete a client account permanently.
    Delete { account_id: String },
    /// Verify the configured brokerage credentials for the master account.
    TestConnection,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();
    let cli = Cli::parse();
    let config = Config::from_env()?;
    let store = CredentialStore::open(&config.database_path, &config.encryption_key)?;

    match cli.command {
        Command::Add {
            account_id,
            api_key,
            secret_key,
            display_name,
            email,
            risk_multiplier,
            trade_direction,
        } => {
            store
                .add_or_update_client(
                    &account_id,
                    &api_key,
                    &secret_key,
                    display_name.as_deref(),
                    email.as_deref(),
                    risk_multiplier,
                    TradeDirection::parse(&trade_direction),
                )
                .await?;
            println!("added client {account_id}");
        }
        Command::BulkLoad { csv_path } => {
            let mut reader = csv::Reader::from_path(&csv_path)
                .with_context(|| format!("opening CSV at {csv_path}"))?;
            let mut count = 0;
            for result in reader.records() {
                let record = result.context("reading CSV row")?;
                let account_id = record.get(0).unwrap_or_default();
                let api_key = record.get(1).unwrap_or_default();
                let secret_key = record.get(2).unwrap_or_default();
                let display_name = record.get(3).filter(|s| !s.is_empty());
                let email = record.get(4).filter(|s| !s.is_empty());
                if account_id.is_empty() || api_key.is_empty() || secret_key.is_empty() {
                    eprintln!("skipping malformed row: {record:?}");
                    continue;
                }
                store
                    .add_or_update_client(
                        account_id,
                        api_key,
                        secret_key,
                        display_name,
                        email,
                        1.0,
                        TradeDirection::Both,
                    )
                    .await?;
                count += 1;
            }
            println!("loaded {count} clients from {csv_path}");
        }
        Command::List { active_only } => {
            let clients = store.list_all_clients(active_only).await?;
            let breakers_open = clients
                .iter()
                .filter(|c| c.breaker_state == trade_copier::store::BreakerState::Open)
                .count();
            for client in &clients {
                println!(
                    "{}\t{}\tactive={}\tbreaker={}\tdirection={}",
                    client.account_id,
                    client.display_name.clone().unwrap_or_default(),
                    client.is_active,
                    client.breaker_state.as_str(),
                    client.trade_direction.as_str(),
                );
            }
            println!("{} client(s), {} circuit breaker(s) open", clients.len(), breakers_open);
        }
        Command::Delete { account_id } => {
            store.hard_delete(&account_id).await?;
            println!("deleted client {account_id}");
        }
        Command::TestConnection => {
            let (api_key, secret_key) = store
                .get_master_credentials()
                .await?
                .context("no active master account configured")?;
            let brokerage: Arc<dyn BrokerageClient> = Arc::new(AlpacaClient::new(config.brokerage_base_url.clone()));
            let creds = Credentials { api_key, secret_key };
            let account = brokerage
                .get_account(&creds)
                .await
                .map_err(|e| anyhow::anyhow!("brokerage connection test failed: {e}"))?;
            println!(
                "connection OK: equity={:.2} buying_power={:.2}",
                account.equity, account.buying_power
            );
        }
    }

    Ok(())
}
