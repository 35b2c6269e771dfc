use crate::error::ConfigError;
use std::path::Path;

// Declare the modules that make up this crate.
#[cfg(feature = "clap")]
pub mod cli;
pub mod error;
pub mod logging;
pub mod settings;

// Re-export the core types to provide a clean public API.
pub use logging::init_tracing;
pub use settings::{ClientSettings, LoggingSettings, OverflowPolicy, ServerSettings, Settings};

/// Loads the application configuration from `path` (if present) and the environment.
///
/// A missing file is not an error. Environment variables use the `STREAM` prefix
/// and `__` as the section separator, e.g. `STREAM__SERVER__BIND_ADDR=127.0.0.1:4000`.
pub fn load_config_from(path: &Path) -> Result<Settings, ConfigError> {
    let builder = config::Config::builder()
        .add_source(config::File::from(path).required(false))
        .add_source(
            config::Environment::with_prefix("STREAM")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("server.default_push_subscriptions")
                .with_list_parse_key("client.subscriptions"),
        )
        .build()?;

    // Attempt to deserialize the entire configuration into our `Settings` struct
    let settings = builder.try_deserialize::<Settings>()?;
    settings.validate()?;

    Ok(settings)
}
