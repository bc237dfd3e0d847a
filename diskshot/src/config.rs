//! Layered engine configuration: built-in defaults, then a TOML file, then
//! `DISKSHOT_*` environment variables.

use anyhow::{Context, Result, bail};
use diskshot_core::EngineConfig;
use diskshot_core::pipeline::PASSPHRASE_ENV;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use std::path::Path;

/// Read from the working directory when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "diskshot.toml";

const ENV_PREFIX: &str = "DISKSHOT_";

pub fn load(path: Option<&Path>) -> Result<EngineConfig> {
    let figment = Figment::from(Serialized::defaults(EngineConfig::default()));
    let figment = match path {
        Some(path) => {
            if !path.is_file() {
                bail!("Config file {} does not exist", path.display());
            }
            figment.merge(Toml::file(path))
        }
        None => figment.merge(Toml::file(DEFAULT_CONFIG_FILE)),
    };

    // The cipher stage's passphrase variable shares the prefix; it is never
    // configuration.
    let passphrase_key = PASSPHRASE_ENV.trim_start_matches(ENV_PREFIX).to_lowercase();
    figment
        .merge(Env::prefixed(ENV_PREFIX).ignore(&[passphrase_key.as_str()]))
        .extract()
        .context("Invalid configuration")
}
