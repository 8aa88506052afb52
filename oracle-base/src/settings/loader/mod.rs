//! Load a settings object from the config locations.

use std::{env, error::Error, path::PathBuf};

use config::{Config, Environment, File};
use eyre::{eyre, Context, Result};
use serde_json::Value;

use crate::settings::FromRawConf;

/// Prefix of environment overrides
pub const ENV_PREFIX: &str = "ORACLE";

/// Deserialize a settings object from the configs.
pub fn load_settings<S: FromRawConf>() -> Result<S> {
    let raw = load_raw_config(PathBuf::from("./config"))?;
    S::from_config(&raw).map_err(|e| eyre!("{e}"))
}

/// Merges config files and environment overrides into one JSON tree.
pub fn load_raw_config(config_dir: PathBuf) -> Result<Value> {
    let mut base_config_sources = vec![];
    let mut builder = Config::builder();

    // Load the default config files when the directory exists
    if config_dir.is_dir() {
        let mut paths = config_dir
            .read_dir()
            .context("Failed to open config directory")?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && p.extension().and_then(|s| s.to_str()) == Some("json"))
            .collect::<Vec<_>>();
        paths.sort();
        for path in paths {
            base_config_sources.push(format!("{path:?}"));
            builder = builder.add_source(File::from(path));
        }
    }

    // Load a set of additional user specified config files
    let config_file_paths: Vec<String> = env::var("CONFIG_FILES")
        .map(|s| s.split(',').map(|s| s.trim().to_owned()).collect())
        .unwrap_or_default();

    for path in &config_file_paths {
        let p = PathBuf::from(path);
        if p.is_file() {
            if p.extension() == Some("json".as_ref()) {
                builder = builder.add_source(File::from(p));
            } else {
                return Err(eyre!(
                    "Provided config path via CONFIG_FILES is of an unsupported type ({p:?})"
                ));
            }
        } else if !p.exists() {
            return Err(eyre!(
                "Provided config path via CONFIG_FILES does not exist ({p:?})"
            ));
        } else {
            return Err(eyre!(
                "Provided config path via CONFIG_FILES is not a file ({p:?})"
            ));
        }
    }

    let config_deserializer = builder
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__"),
        )
        .build()
        .context("Failed to load config sources")?;

    config_deserializer.try_deserialize::<Value>().or_else(|err| {
        let mut err = if let Some(source_err) = err.source() {
            let source = format!("Config error source: {source_err}");
            Err(err).context(source)
        } else {
            Err(err.into())
        };
        for cfg_path in base_config_sources.iter().chain(config_file_paths.iter()) {
            err = err.with_context(|| format!("Config loaded: {cfg_path}"));
        }
        err.context("Config deserialization error")
    })
}
