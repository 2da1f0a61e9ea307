//! Daemon configuration.
//!
//! Settings for the `scoped` binary: logging, the TCP server and the path
//! to the microscope tree document. Loaded from an optional TOML file with
//! environment overrides (`SCOPED__SERVER__BIND_ADDR=...`), falling back
//! to defaults suitable for a local simulated instrument.

use crate::error::{ScopeError, ScopeResult};
use config::Config;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub log_level: String,
    pub server: ServerSettings,
    pub microscope: MicroscopeSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    pub bind_addr: String,
    pub read_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MicroscopeSettings {
    /// Path to the component tree TOML document.
    pub tree: String,
}

impl Settings {
    /// Load settings: defaults, then the given file (if any), then
    /// `SCOPED__*` environment variables.
    pub fn load(path: Option<&Path>) -> ScopeResult<Self> {
        let mut builder = Config::builder()
            .set_default("log_level", "info")
            .map_err(cfg_err)?
            .set_default("server.bind_addr", "127.0.0.1:4545")
            .map_err(cfg_err)?
            .set_default("server.read_timeout_ms", 30_000_i64)
            .map_err(cfg_err)?
            .set_default("microscope.tree", "config/microscope.toml")
            .map_err(cfg_err)?;

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }

        builder
            .add_source(config::Environment::with_prefix("SCOPED").separator("__"))
            .build()
            .map_err(cfg_err)?
            .try_deserialize()
            .map_err(cfg_err)
    }

    pub fn bind_addr(&self) -> ScopeResult<SocketAddr> {
        self.server.bind_addr.parse().map_err(|e| {
            ScopeError::Config(format!(
                "invalid server.bind_addr '{}': {e}",
                self.server.bind_addr
            ))
        })
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.server.read_timeout_ms)
    }
}

fn cfg_err(e: config::ConfigError) -> ScopeError {
    ScopeError::Config(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_load_without_a_file() {
        let settings = Settings::load(None).unwrap();
        assert_eq!(settings.log_level, "info");
        assert_eq!(settings.bind_addr().unwrap().port(), 4545);
        assert_eq!(settings.read_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn file_overrides_defaults() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(
            file,
            r#"
            log_level = "debug"

            [server]
            bind_addr = "127.0.0.1:7000"

            [microscope]
            tree = "/etc/scoped/microscope.toml"
            "#
        )
        .unwrap();

        let settings = Settings::load(Some(file.path())).unwrap();
        assert_eq!(settings.log_level, "debug");
        assert_eq!(settings.bind_addr().unwrap().port(), 7000);
        assert_eq!(settings.microscope.tree, "/etc/scoped/microscope.toml");
        // untouched default
        assert_eq!(settings.server.read_timeout_ms, 30_000);
    }

    #[test]
    fn bad_bind_addr_is_a_config_error() {
        let mut settings = Settings::load(None).unwrap();
        settings.server.bind_addr = "nowhere".into();
        assert!(matches!(
            settings.bind_addr(),
            Err(ScopeError::Config(_))
        ));
    }
}
