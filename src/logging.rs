use std::env;
use tracing::Level;
use tracing_error::ErrorLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Initialize the tracing log layer
///
/// Setting the `DEBUG` environment variable (any value) adds source file and
/// line number fields to every log line.
pub fn init() -> eyre::Result<()> {
    color_eyre::install()?;

    let debug = env::var_os("DEBUG").is_some();

    Registry::default()
        .with(ErrorLayer::default())
        .with(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_file(debug)
                .with_line_number(debug)
                .with_target(true),
        )
        .init();

    Ok(())
}
