pub mod settings;

use std::fmt::Write as _;

pub use settings::{
    Config, ConfigError, EmbeddingConfig, EmbeddingProvider, LoggingConfig, MAX_HOPS,
    OllamaConfig, SearchConfig,
};

/// Render the effective configuration for display
#[inline]
pub fn describe_config(config: &Config) -> anyhow::Result<String> {
    let mut out = toml::to_string_pretty(config)?;
    let _ = write!(
        out,
        "\n# config file: {}\n# index cache: {}\n",
        config.config_file_path().display(),
        config.cache_path().display()
    );
    Ok(out)
}
