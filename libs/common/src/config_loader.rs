//! Configuration loading helper functions
//!
//! Loads a typed configuration from a YAML, JSON or TOML file and merges
//! environment overrides on top.

use std::path::Path;

use figment::{
    providers::{Env, Format, Json, Toml, Yaml},
    Figment,
};
use serde::Deserialize;
use tracing::debug;

use crate::{Error, Result};

/// Build a figment for a config file, chosen by extension
fn file_figment(path: &Path) -> Result<Figment> {
    let extension = path
        .extension()
        .and_then(|s| s.to_str())
        .ok_or_else(|| Error::config("Config file must have an extension"))?;

    if !path.exists() {
        return Err(Error::config(format!(
            "Config file not found: {}",
            path.display()
        )));
    }

    let figment = match extension {
        "toml" => Figment::new().merge(Toml::file(path)),
        "yaml" | "yml" => Figment::new().merge(Yaml::file(path)),
        "json" => Figment::new().merge(Json::file(path)),
        _ => {
            return Err(Error::config(format!(
                "Unsupported config file format: {}",
                extension
            )))
        },
    };
    Ok(figment)
}

/// Load configuration from a specific file
pub fn load_config_from_file<T, P>(path: P) -> Result<T>
where
    T: for<'de> Deserialize<'de>,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    debug!("Loading config: {}", path.display());

    file_figment(path)?
        .extract()
        .map_err(|e| Error::config(format!("Failed to load configuration from file: {}", e)))
}

/// Load configuration from a file, with `<PREFIX>_`-prefixed environment overrides
///
/// Nested keys use a double underscore, e.g. `WISESRV_DIGITAL_INPUTS__LENGTH=4`.
pub fn load_config_with_env<T, P>(path: P, env_prefix: &str) -> Result<T>
where
    T: for<'de> Deserialize<'de>,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    debug!("Loading config: {} (env prefix {})", path.display(), env_prefix);

    file_figment(path)?
        .merge(Env::prefixed(&format!("{}_", env_prefix.to_uppercase())).split("__"))
        .extract()
        .map_err(|e| Error::config(format!("Failed to load configuration: {}", e)))
}
