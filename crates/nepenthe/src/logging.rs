//! Tracing subscriber setup.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::NepentheError;

/// Installs the global subscriber.
///
/// `RUST_LOG` wins when set; otherwise everything at `level` and above is
/// logged. With `json` each event is one JSON object per line.
///
/// # Errors
/// [`NepentheError::Config`] if `level` isn't a valid filter or a global
/// subscriber is already installed.
pub fn init(level: &str, json: bool) -> Result<(), NepentheError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level).map_err(|e| NepentheError::Config(e.to_string()))?,
    };

    let registry = tracing_subscriber::registry().with(filter);
    let result = if json {
        registry.with(tracing_subscriber::fmt::layer().json()).try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };
    result.map_err(|e| NepentheError::Config(e.to_string()))
}
