//! Daemon configuration, loaded from a TOML file.
//!
//! ```toml
//! [log]
//! filter = "info"
//!
//! [binder]
//! autoimport-dir = "/run/microbus"
//!
//! [[listen]]
//! uri = "unix:@hello"
//!
//! [[import]]
//! uri = "tcp:gps-host:1234/gps"
//! ```

use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub binder: BinderConfig,
    #[serde(default)]
    pub listen: Vec<Endpoint>,
    #[serde(default)]
    pub import: Vec<Endpoint>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogConfig {
    /// Tracing env-filter directive, e.g. `info` or `microbus=debug`.
    #[serde(default = "default_filter")]
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            filter: default_filter(),
        }
    }
}

fn default_filter() -> String {
    "info".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BinderConfig {
    /// Directory probed for `basedir/<api>` sockets when an unknown API
    /// is asked for.
    #[serde(rename = "autoimport-dir")]
    pub autoimport_dir: Option<String>,
    /// Keepalive period of the daemon heartbeat, in seconds.
    #[serde(rename = "keepalive-secs", default = "default_keepalive")]
    pub keepalive_secs: u32,
}

impl Default for BinderConfig {
    fn default() -> Self {
        BinderConfig {
            autoimport_dir: None,
            keepalive_secs: default_keepalive(),
        }
    }
}

fn default_keepalive() -> u32 {
    30
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Endpoint {
    pub uri: String,
}

impl Config {
    pub fn load(path: &str) -> Result<Config, String> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("cannot read config {path}: {e}"))?;
        toml::from_str(&text).map_err(|e| format!("bad config {path}: {e}"))
    }
}
