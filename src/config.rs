//! Configuration loading.
//!
//! Recognized dotted keys: `global.connection.address`,
//! `global.connection.port`, `server.logging`, `server.verbose`,
//! `persistence` (an opaque backend-specific sub-table). Loaded from an
//! optional TOML file and overridable by `APIARY_*` environment variables,
//! the layered-source shape the `config` crate is built for.

use serde::Deserialize;
use std::path::Path;

use crate::error::{Error, Result};
use crate::{DEFAULT_HOST, DEFAULT_PORT};

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionSettings {
    pub address: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GlobalSettings {
    pub connection: ConnectionSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    pub logging: bool,
    pub verbose: bool,
}

/// Top-level settings. `persistence` is opaque here: the core does not
/// interpret it, only passes it along to whichever backend is constructed.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub global: GlobalSettings,
    pub server: ServerSettings,
    #[serde(default)]
    pub persistence: serde_json::Value,
}

impl Settings {
    /// Load settings from an optional TOML file, defaults, and `APIARY_*`
    /// environment variable overrides (`APIARY_SERVER__VERBOSE=true`, etc).
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .set_default("global.connection.address", DEFAULT_HOST)?
            .set_default("global.connection.port", DEFAULT_PORT as i64)?
            .set_default("server.logging", false)?
            .set_default("server.verbose", true)?;

        if let Some(path) = config_path {
            builder = builder.add_source(config::File::from(path).required(false));
        }

        let settings = builder
            .add_source(config::Environment::with_prefix("APIARY").separator("__"))
            .build()?;

        settings.try_deserialize().map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_with_no_file_and_no_env() {
        let settings = Settings::load(None).unwrap();
        assert_eq!(settings.global.connection.address, DEFAULT_HOST);
        assert_eq!(settings.global.connection.port, DEFAULT_PORT);
        assert!(!settings.server.logging);
    }
}
