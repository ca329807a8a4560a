//! Configuration for the trading core.
//!
//! Process knobs come from environment variables with defaults:
//!
//! - `ENGINE_BIND_ADDR`              (default: "0.0.0.0")
//! - `ENGINE_PORT`                   (default: "9000")
//! - `ENGINE_MAX_CLIENTS`            (default: "1024")
//! - `ENGINE_REDIS_URL`              (unset: in-memory backends)
//! - `ENGINE_SNAPSHOT_INTERVAL_SECS` (default: "5")
//! - `ENGINE_ORDERS_CAPACITY`        (default: "10000")
//! - `ENGINE_EVENTS_CAPACITY`        (default: "10000")
//! - `ENGINE_CANCEL_TIMEOUT_MS`      (default: "5000")
//! - `ENGINE_EXCHANGE_FILE`          (default: "exchange.toml")
//!
//! The exchange itself (markets, fees, risk policy, static rates) is read
//! from the TOML file named by `ENGINE_EXCHANGE_FILE`.

use std::env;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use engine_core::{Decimal, Market};
use serde::Deserialize;

/// Process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// IP address / interface to bind to (e.g. "0.0.0.0" or "127.0.0.1").
    pub bind_addr: String,

    /// TCP port to listen on.
    pub port: u16,

    /// Maximum number of simultaneously connected clients.
    pub max_clients: usize,

    /// Redis coordinates for sequences, events, orders and balances.
    pub redis_url: Option<String>,

    /// Period of the sequence saver and the balance checkpoint.
    pub snapshot_interval: Duration,

    pub orders_capacity: usize,
    pub events_capacity: usize,

    /// How long a cancel caller waits for the engine's answer.
    pub cancel_timeout: Duration,

    pub exchange_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bind_addr: "0.0.0.0".to_string(),
            port: 9000,
            max_clients: 1024,
            redis_url: None,
            snapshot_interval: Duration::from_secs(5),
            orders_capacity: 10_000,
            events_capacity: 10_000,
            cancel_timeout: Duration::from_millis(5_000),
            exchange_file: "exchange.toml".to_string(),
        }
    }
}

impl Config {
    /// Construct a `Config` from environment variables, falling back
    /// to the defaults above.
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Config::default();
        let bind_addr = env::var("ENGINE_BIND_ADDR").unwrap_or(defaults.bind_addr);
        let port = read_env_or_default("ENGINE_PORT", defaults.port)?;
        let max_clients = read_env_or_default("ENGINE_MAX_CLIENTS", defaults.max_clients)?;
        let redis_url = env::var("ENGINE_REDIS_URL").ok().filter(|url| !url.is_empty());
        let snapshot_secs = read_env_or_default("ENGINE_SNAPSHOT_INTERVAL_SECS", 5u64)?;
        let orders_capacity = read_env_or_default("ENGINE_ORDERS_CAPACITY", defaults.orders_capacity)?;
        let events_capacity = read_env_or_default("ENGINE_EVENTS_CAPACITY", defaults.events_capacity)?;
        let cancel_ms = read_env_or_default("ENGINE_CANCEL_TIMEOUT_MS", 5_000u64)?;
        let exchange_file = env::var("ENGINE_EXCHANGE_FILE").unwrap_or(defaults.exchange_file);

        anyhow::ensure!(snapshot_secs > 0, "ENGINE_SNAPSHOT_INTERVAL_SECS must be positive");
        anyhow::ensure!(orders_capacity > 0 && events_capacity > 0, "channel capacities must be positive");

        Ok(Config {
            bind_addr,
            port,
            max_clients,
            redis_url,
            snapshot_interval: Duration::from_secs(snapshot_secs),
            orders_capacity,
            events_capacity,
            cancel_timeout: Duration::from_millis(cancel_ms),
            exchange_file,
        })
    }

    /// Convenience: `addr:port` socket string.
    pub fn socket_addr_string(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }
}

fn read_env_or_default<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(val) => val.parse::<T>().with_context(|| format!("invalid {key}={val:?}")),
        Err(_) => Ok(default),
    }
}

// ----------------------------------------------------------------------------
// Exchange definition (TOML)
// ----------------------------------------------------------------------------

/// Markets, fees, risk policy and the static rate / bonus data.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    pub markets: Vec<Market>,
    pub fees: FeeConfig,
    pub risk: RiskConfig,
    pub rates: Vec<RateEntry>,
    pub reference_prices: Vec<ReferencePrice>,
    pub bonus: Vec<BonusEntry>,
}

/// Fee rates stamped on every admitted order and the account collecting them.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FeeConfig {
    pub maker_rate: Decimal,
    pub taker_rate: Decimal,
    pub revenue_user_id: u64,
    pub revenue_sub_account_id: u64,
}

/// Order-queue risk policies; each check has its own switch.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    pub bonus_allowlist_enabled: bool,
    /// Markets bonus accounts may trade on.
    pub bonus_markets: Vec<String>,
    pub high_risk_enabled: bool,
    pub high_risk_threshold: Decimal,
    pub abnormal_price_enabled: bool,
    /// Bounds of `price / reference * 100`.
    pub min_price_pct: Decimal,
    pub max_price_pct: Decimal,
}

/// `1 from = rate to`.
#[derive(Debug, Clone, Deserialize)]
pub struct RateEntry {
    pub from: String,
    pub to: String,
    pub rate: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReferencePrice {
    pub market: String,
    pub price: Decimal,
}

/// Bonus exposure of one sub-account, in the quote coin of the market it
/// trades on.
#[derive(Debug, Clone, Deserialize)]
pub struct BonusEntry {
    pub user_id: u64,
    pub sub_account_id: u64,
    /// Sum of active bonus contracts.
    pub active: Decimal,
    /// Bonus amount still owed back.
    #[serde(default)]
    pub outstanding: Decimal,
}

impl ExchangeConfig {
    pub fn from_toml_str(text: &str) -> anyhow::Result<Self> {
        let config: ExchangeConfig = toml::from_str(text).context("invalid exchange definition")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_toml_str(&text)
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(!self.markets.is_empty(), "no markets defined");
        for (i, m) in self.markets.iter().enumerate() {
            anyhow::ensure!(!m.id.is_empty(), "market #{i} has no id");
            anyhow::ensure!(
                m.market_coin != m.quote_coin,
                "market {} trades {} against itself",
                m.id,
                m.market_coin
            );
            anyhow::ensure!(
                self.markets[..i].iter().all(|other| other.id != m.id),
                "market {} defined twice",
                m.id
            );
        }
        anyhow::ensure!(
            self.fees.maker_rate >= Decimal::ZERO && self.fees.taker_rate >= Decimal::ZERO,
            "fee rates must not be negative"
        );
        if self.risk.abnormal_price_enabled {
            anyhow::ensure!(
                self.risk.min_price_pct <= self.risk.max_price_pct,
                "min_price_pct above max_price_pct"
            );
        }
        Ok(())
    }

    /// Every coin any market trades.
    pub fn coins(&self) -> Vec<String> {
        let mut coins: Vec<String> = self
            .markets
            .iter()
            .flat_map(|m| [m.market_coin.clone(), m.quote_coin.clone()])
            .collect();
        coins.sort();
        coins.dedup();
        coins
    }
}
