use std::env;

use config::{
    builder::DefaultState, Config, ConfigBuilder, ConfigError, Environment, File, FileFormat,
    FileStoredFormat,
};

use crate::{log_debug, log_warn};

pub const CONFIG_STR: &str = "CONFIG_STR";
pub const CONFIG_STR_FORMAT: &str = "CONFIG_STR_FMT";

/// Loads configuration from an optional file named [`file_name`] in the
/// current directory, an inline string passed through
/// `{env_prefix}_CONFIG_STR` (+ `_FMT`), and `{env_prefix}_*` environment
/// variables, in increasing priority.
pub fn load_config(
    file_name: &str,
    env_prefix: &str,
    config_builder: impl FnOnce(
        ConfigBuilder<DefaultState>,
    ) -> Result<ConfigBuilder<DefaultState>, ConfigError>,
) -> Result<Config, ConfigError> {
    let mut builder =
        config_builder(Config::builder()).expect("Failed to obtain configuration builder");
    builder = builder.add_source(File::with_name(file_name).required(false));

    if let Some((str, format)) = Option::zip(
        env::var(format!("{env_prefix}_{CONFIG_STR}")).ok(),
        env::var(format!("{env_prefix}_{CONFIG_STR_FORMAT}")).ok(),
    ) {
        match try_parse_format(&format) {
            Ok(format) => builder = builder.add_source(File::from_str(str.as_str(), format)),
            Err(format) => log_warn!("Unknown format for config string: {}", format),
        }
    }

    builder = builder.add_source(
        Environment::with_prefix(env_prefix)
            .prefix_separator("_")
            .separator("__"),
    );

    builder
        .build()
        .inspect(|c| log_debug!("Loaded raw configurations: {:?}", c))
}

fn try_parse_format(format: &str) -> Result<FileFormat, &str> {
    use FileFormat::*;
    let all_formats = [Toml, Json, Json5, Yaml, Ron, Ini];
    all_formats
        .into_iter()
        .find(|f| f.file_extensions().contains(&format))
        .ok_or(format)
}
