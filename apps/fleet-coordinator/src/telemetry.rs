use anyhow::{Context, Result};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Installs the global subscriber. Output is human-readable unless
/// `FLEET_LOG_JSON` is truthy; `RUST_LOG` overrides the default `info` filter.
pub fn init() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if env_truthy("FLEET_LOG_JSON") {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_current_span(false))
            .try_init()
            .context("failed to initialise tracing subscriber")?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .context("failed to initialise tracing subscriber")?;
    }
    Ok(())
}

pub fn env_truthy(key: &str) -> bool {
    std::env::var(key).is_ok_and(|val| truthy(&val))
}

fn truthy(val: &str) -> bool {
    matches!(val.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

#[cfg(test)]
mod tests {
    use super::truthy;

    #[test_timeout::timeout]
    fn truthy_values() {
        assert!(truthy("1"));
        assert!(truthy("TRUE"));
        assert!(truthy("on"));
        assert!(!truthy("0"));
        assert!(!truthy(""));
    }
}
