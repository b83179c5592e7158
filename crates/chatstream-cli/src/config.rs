//! Server configuration: TOML file loading and log-filter setup.
//!
//! Every field has a default, so a missing file or a partial `[server]` /
//! `[store]` section still yields a runnable configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

/// `[server]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind the HTTP server to.
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

/// `[store]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to the SQLite message store.
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1".into()
}

fn default_port() -> u16 {
    8710
}

fn default_db_path() -> String {
    "chatstream.db".into()
}

/// Load configuration from `path`, falling back to defaults when the file
/// is missing.  A present-but-invalid file is an error.
pub fn load_config(path: impl AsRef<Path>) -> anyhow::Result<Config> {
    let path = path.as_ref();
    match std::fs::read_to_string(path) {
        Ok(content) => {
            let config = toml::from_str(&content)?;
            tracing::info!(path = %path.display(), "configuration loaded");
            Ok(config)
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(path = %path.display(), "no config file, using defaults");
            Ok(Config::default())
        }
        Err(err) => Err(err.into()),
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// The crates whose logs make up the pipeline's own narrative.
const PIPELINE_CRATES: [&str; 6] = [
    "chatstream",
    "chatstream_events",
    "chatstream_broker",
    "chatstream_store",
    "chatstream_processor",
    "chatstream_gateway",
];

/// Install the global tracing subscriber for the server process.
///
/// `RUST_LOG` takes precedence when set.  The fallback pins the pipeline
/// crates to `pipeline_level` and caps everything else at `warn`, so
/// per-event logging is never drowned out by dependency chatter.
pub fn init_tracing(pipeline_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let mut directives = vec!["warn".to_owned()];
        directives.extend(
            PIPELINE_CRATES
                .iter()
                .map(|krate| format!("{krate}={pipeline_level}")),
        );
        EnvFilter::new(directives.join(","))
    });

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let config = load_config("definitely/not/here.toml").unwrap();
        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.server.port, 8710);
        assert_eq!(config.store.db_path, "chatstream.db");
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nport = 9000").unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.store.db_path, "chatstream.db");
    }

    #[test]
    fn invalid_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server\nport = oops").unwrap();
        assert!(load_config(file.path()).is_err());
    }
}
