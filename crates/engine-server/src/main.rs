//! Trading core with its binary TCP ingress.

use engine_server::{server, Config, ExchangeConfig, TradingCore};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;
    let exchange = ExchangeConfig::from_file(&config.exchange_file)?;
    info!(
        addr = %config.socket_addr_string(),
        max_clients = config.max_clients,
        markets = exchange.markets.len(),
        "starting engine-server"
    );

    let core = TradingCore::start(&config, exchange).await?;
    let mut ingress = tokio::spawn({
        let config = config.clone();
        let queue = core.queue();
        let shutdown = core.shutdown_signal();
        async move { server::run(&config, queue, shutdown).await }
    });

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(err) = signal {
                error!(error = %err, "ctrl_c handler failed");
            }
            info!("ctrl_c received");
        }
        result = &mut ingress => {
            match result {
                Ok(Ok(())) => info!("ingress stopped"),
                Ok(Err(err)) => error!(error = %err, "ingress failed"),
                Err(err) => error!(error = %err, "ingress task panicked"),
            }
        }
    }

    core.shutdown().await?;
    ingress.abort();
    info!("engine-server stopped");
    Ok(())
}
