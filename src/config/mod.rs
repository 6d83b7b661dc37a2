mod settings;

use config::{Config, ConfigError, Environment, File};

use settings::PartialSettings;

pub use settings::{BrokerSettings, DatagramSettings, LoggingSettings, Settings, StreamSettings};

/// Prefix of the environment variables read by [`load_config`], e.g.
/// `MSGBROKER_STREAM__PORT=9000`.
pub const ENV_PREFIX: &str = "MSGBROKER";

/// Loads the configuration from `config/default` and the environment.
/// Merges the configuration with default values.
pub fn load_config() -> Result<Settings, ConfigError> {
    load_config_from("config/default")
}

/// Same as [`load_config`] but reads the optional file at `path` (the
/// extension may be omitted).
pub fn load_config_from(path: &str) -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name(path).required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    Ok(partial.merge_into(Settings::default()))
}
