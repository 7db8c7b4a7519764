use anyhow::Result;
use tracing_subscriber::{EnvFilter, fmt};

const LOG_JSON_ENV: &str = "BTC_EXCHANGE_LOG_JSON";

/// Installs the global fmt subscriber. `RUST_LOG` drives filtering and
/// `BTC_EXCHANGE_LOG_JSON=1` switches to JSON lines.
pub fn init() -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let use_json = std::env::var(LOG_JSON_ENV)
        .map(|value| value == "1")
        .unwrap_or(false);

    let builder = fmt::Subscriber::builder()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);

    if use_json {
        builder
            .json()
            .try_init()
            .map_err(|e| anyhow::anyhow!("init json subscriber: {e}"))
    } else {
        builder
            .try_init()
            .map_err(|e| anyhow::anyhow!("init subscriber: {e}"))
    }
}
