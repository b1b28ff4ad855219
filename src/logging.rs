use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Registry};

use crate::config::LoggingConfig;
use crate::error::{PortdError, PortdResult};

/// Install the global subscriber. `RUST_LOG` overrides `logging.filter`.
pub fn init_tracing(config: &LoggingConfig) -> PortdResult<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.filter)
            .map_err(|err| PortdError::Config(format!("invalid logging.filter: {err}")))?,
    };

    let registry = Registry::default().with(filter);
    let result = if config.json {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer()).try_init()
    };
    result.map_err(|err| PortdError::Internal(format!("logger already set: {err}")))
}
