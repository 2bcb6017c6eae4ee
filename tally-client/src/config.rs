//! Load config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::logging::LogFormat;

/// Client configuration. File: ~/.config/tally/config.toml or /etc/tally/config.toml.
/// Env overrides: TALLY_SERVER_HOST, TALLY_SERVER_PORT, TALLY_BIND,
/// TALLY_HANDSHAKE_TIMEOUT_SECS, TALLY_INBOUND_TTL_SECS, TALLY_LOG_FORMAT.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Peer host name or address (default "localhost").
    #[serde(default = "default_server_host")]
    pub server_host: String,
    /// Peer UDP port (default 9876).
    #[serde(default = "default_server_port")]
    pub server_port: u16,
    /// Local socket address (default "0.0.0.0:0", any port).
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Seconds an outbound request waits for its acknowledgment (default 15).
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    /// Seconds a pushed payload stays cached awaiting confirmation (default 60).
    #[serde(default = "default_inbound_ttl_secs")]
    pub inbound_ttl_secs: u64,
    /// Seconds between registry expiry sweeps (default 5).
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Action whose successful ack establishes the session (default "login").
    #[serde(default = "default_session_action")]
    pub session_action: String,
    /// Default log filter when RUST_LOG is unset (default "info").
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// `pretty` or `json` (default `pretty`).
    #[serde(default)]
    pub log_format: LogFormat,
}

fn default_server_host() -> String {
    "localhost".into()
}
fn default_server_port() -> u16 {
    9876
}
fn default_bind() -> String {
    "0.0.0.0:0".into()
}
fn default_handshake_timeout_secs() -> u64 {
    15
}
fn default_inbound_ttl_secs() -> u64 {
    60
}
fn default_sweep_interval_secs() -> u64 {
    5
}
fn default_session_action() -> String {
    tally_core::session::DEFAULT_SESSION_ACTION.into()
}
fn default_log_level() -> String {
    "info".into()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_host: default_server_host(),
            server_port: default_server_port(),
            bind: default_bind(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            inbound_ttl_secs: default_inbound_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            session_action: default_session_action(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
        }
    }
}

impl Config {
    /// "host:port" of the peer, ready for DNS lookup.
    pub fn server(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs.max(1))
    }

    pub fn inbound_ttl(&self) -> Duration {
        Duration::from_secs(self.inbound_ttl_secs.max(1))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c, |name| std::env::var(name).ok());
    c
}

/// Apply overrides from `lookup`. Values that do not parse are ignored.
fn apply_env(c: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(s) = lookup("TALLY_SERVER_HOST") {
        if !s.is_empty() {
            c.server_host = s;
        }
    }
    if let Some(s) = lookup("TALLY_SERVER_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.server_port = p;
        }
    }
    if let Some(s) = lookup("TALLY_BIND") {
        if !s.is_empty() {
            c.bind = s;
        }
    }
    if let Some(s) = lookup("TALLY_HANDSHAKE_TIMEOUT_SECS") {
        if let Ok(n) = s.parse::<u64>() {
            c.handshake_timeout_secs = n;
        }
    }
    if let Some(s) = lookup("TALLY_INBOUND_TTL_SECS") {
        if let Ok(n) = s.parse::<u64>() {
            c.inbound_ttl_secs = n;
        }
    }
    if let Some(f) = lookup("TALLY_LOG_FORMAT").as_deref().and_then(LogFormat::parse) {
        c.log_format = f;
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/tally/config.toml"));
    }
    out.push(PathBuf::from("/etc/tally/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p) {
                Ok(s) => match toml::from_str::<Config>(&s) {
                    Ok(c) => return Some(c),
                    Err(e) => eprintln!("ignoring {}: {}", p.display(), e),
                },
                Err(e) => eprintln!("cannot read {}: {}", p.display(), e),
            }
            break;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults() {
        let c = Config::default();
        assert_eq!(c.server(), "localhost:9876");
        assert_eq!(c.handshake_timeout(), Duration::from_secs(15));
        assert_eq!(c.inbound_ttl(), Duration::from_secs(60));
        assert_eq!(c.session_action, "login");
        assert_eq!(c.log_format, LogFormat::Pretty);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let c: Config = toml::from_str("server_port = 5000\nlog_format = \"json\"\n").unwrap();
        assert_eq!(c.server_port, 5000);
        assert_eq!(c.server_host, "localhost");
        assert_eq!(c.log_format, LogFormat::Json);
    }

    #[test]
    fn unknown_log_format_rejected() {
        assert!(toml::from_str::<Config>("log_format = \"xml\"\n").is_err());
    }

    #[test]
    fn unknown_fields_rejected() {
        assert!(toml::from_str::<Config>("proxy_port = 3128\n").is_err());
    }

    #[test]
    fn env_overrides_and_bad_values_ignored() {
        let env: HashMap<&str, &str> = [
            ("TALLY_SERVER_HOST", "chat.example.org"),
            ("TALLY_SERVER_PORT", "not-a-port"),
            ("TALLY_HANDSHAKE_TIMEOUT_SECS", "3"),
            ("TALLY_LOG_FORMAT", "Json"),
        ]
        .into_iter()
        .collect();
        let mut c = Config::default();
        apply_env(&mut c, |k| env.get(k).map(|v| v.to_string()));
        assert_eq!(c.server_host, "chat.example.org");
        assert_eq!(c.server_port, 9876);
        assert_eq!(c.handshake_timeout(), Duration::from_secs(3));
        assert_eq!(c.log_format, LogFormat::Json);

        apply_env(&mut c, |k| (k == "TALLY_LOG_FORMAT").then(|| "xml".to_string()));
        assert_eq!(c.log_format, LogFormat::Json);
    }

    #[test]
    fn zero_durations_clamped() {
        let c = Config {
            handshake_timeout_secs: 0,
            ..Config::default()
        };
        assert_eq!(c.handshake_timeout(), Duration::from_secs(1));
    }
}
