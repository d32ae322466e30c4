use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use trade_copier::brokerage::alpaca::AlpacaClient;
use trade_copier::brokerage::BrokerageClient;
use trade_copier::config::Config;
use trade_copier::orchestrator::App;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    let brokerage: Arc<dyn BrokerageClient> = Arc::new(AlpacaClient::new(config.brokerage_base_url.clone()));

    let app = App::initialize(config, brokerage.clone()).await?;
    app.run(brokerage).await
}
