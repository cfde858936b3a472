use serde::Deserialize;

use common::{log_debug, log_warn};

pub const CONFIG_FILE_NAME: &str = "loam";
pub const ENV_PREFIX: &str = "LOAM";

impl TryFrom<::config::Config> for EngineConfig {
    type Error = ::config::ConfigError;

    fn try_from(value: ::config::Config) -> Result<Self, Self::Error> {
        let config: EngineConfig = value.try_deserialize()?;
        log_debug!("Loaded configurations: {:?}", config);
        Ok(config)
    }
}

/// Loads the engine configuration from an optional `loam.*` file and
/// `LOAM_*` environment variables, falling back to defaults.
pub fn load_config() -> EngineConfig {
    common::config::load_config(CONFIG_FILE_NAME, ENV_PREFIX, Ok)
        .and_then(TryInto::try_into)
        .unwrap_or_else(|err| {
            log_warn!("Failed to load configurations, using defaults: {}", err);
            EngineConfig::default()
        })
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub partitioning: PartitioningConfig,

    #[serde(default)]
    pub translation: TranslationConfig,

    #[serde(default)]
    pub decoding: DecodingConfig,
}

/// Budget for eagerly enumerated concrete candidates during heap-ref
/// partitioning. Exceeding it demotes the reference to a symbolic
/// residual.
#[derive(Debug, Clone, Deserialize)]
pub struct PartitioningConfig {
    #[serde(default = "default_max_concrete_candidates")]
    pub max_concrete_candidates: usize,
}

impl Default for PartitioningConfig {
    fn default() -> Self {
        PartitioningConfig {
            max_concrete_candidates: default_max_concrete_candidates(),
        }
    }
}

fn default_max_concrete_candidates() -> usize {
    32
}

#[derive(Debug, Clone, Deserialize)]
pub struct TranslationConfig {
    /// Update logs longer than this are not translated; the collection is
    /// encoded as its uninterpreted base instead.
    #[serde(default = "default_max_chain_length")]
    pub max_chain_length: usize,
}

impl Default for TranslationConfig {
    fn default() -> Self {
        TranslationConfig { max_chain_length: default_max_chain_length() }
    }
}

fn default_max_chain_length() -> usize {
    4096
}

#[derive(Debug, Clone, Deserialize)]
pub struct DecodingConfig {
    #[serde(default)]
    pub strategy: DecodeStrategy,

    /// With the automatic strategy, regions with at most this many known
    /// keys decode eagerly.
    #[serde(default = "default_eager_threshold")]
    pub eager_threshold: usize,
}

impl Default for DecodingConfig {
    fn default() -> Self {
        DecodingConfig {
            strategy: DecodeStrategy::default(),
            eager_threshold: default_eager_threshold(),
        }
    }
}

fn default_eager_threshold() -> usize {
    64
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodeStrategy {
    /// Eager for small, enumerable regions, lazy otherwise.
    #[default]
    Auto,
    #[serde(alias = "full")]
    Eager,
    #[serde(alias = "on_demand")]
    Lazy,
}
