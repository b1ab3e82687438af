use std::io::IsTerminal;
use std::sync::OnceLock;

use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

static INITIALISED: OnceLock<()> = OnceLock::new();

/// Errors raised while configuring the global subscriber.
#[derive(Debug, Error)]
pub enum InitError {
    #[error("tracing subscriber was already initialised")]
    AlreadyInitialised,
}

/// Configures the global tracing subscriber.
///
/// The filter is taken from `RUST_LOG` when set and defaults to `info`
/// otherwise. Calling this twice returns [`InitError::AlreadyInitialised`].
pub fn init_tracing() -> Result<(), InitError> {
    INITIALISED
        .set(())
        .map_err(|_| InitError::AlreadyInitialised)?;

    let ansi = std::io::stdout().is_terminal();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_ansi(ansi);
    Registry::default().with(filter).with(fmt_layer).init();

    Ok(())
}
