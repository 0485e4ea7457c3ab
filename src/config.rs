// SPDX-License-Identifier: MIT
//! Declarative TOML configuration.
//!
//! Unlike ad-hoc flag soup, everything the server needs lives in one file
//! handed to `enrolld serve --config`. Parse or validation failure is a
//! fatal bootstrap error: the process logs the failed step and exits
//! non-zero rather than limping along with half a config.

use anyhow::{bail, Context as _, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

fn default_net() -> String {
    "tcp".to_string()
}

fn default_addr() -> String {
    "127.0.0.1:5555".to_string()
}

fn default_proto() -> String {
    "http".to_string()
}

fn default_trans() -> String {
    "plain".to_string()
}

fn default_db_kind() -> String {
    "sqlite".to_string()
}

fn default_db_conn() -> String {
    "enrolld.db".to_string()
}

fn default_cookie_expiry() -> i64 {
    7 * 24 * 60 * 60
}

fn default_msg_args_cap() -> usize {
    4
}

fn default_msg_bytes_cap() -> usize {
    1024
}

fn default_read_header_timeout() -> u64 {
    5
}

fn default_usem_delay_shift() -> u32 {
    8
}

fn default_senq() -> usize {
    64
}

fn default_static_dir() -> PathBuf {
    PathBuf::from("static")
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    /// Application protocol; only "http" is served.
    #[serde(default = "default_proto")]
    pub proto: String,
    /// Listener network; only "tcp" is served.
    #[serde(default = "default_net")]
    pub net: String,
    #[serde(default = "default_addr")]
    pub addr: String,
    /// "plain" or "tls". TLS termination is fronted by a proxy; when set to
    /// "tls" the cert/key paths are still validated so a misconfigured
    /// deployment fails at bootstrap, not at first connect.
    #[serde(default = "default_trans")]
    pub trans: String,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            proto: default_proto(),
            net: default_net(),
            addr: default_addr(),
            trans: default_trans(),
            tls_cert: None,
            tls_key: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DbConfig {
    /// Database engine; only "sqlite" is supported.
    #[serde(default = "default_db_kind")]
    pub kind: String,
    /// SQLite database path (or sqlite:// URL).
    #[serde(default = "default_db_conn")]
    pub conn: String,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            kind: default_db_kind(),
            conn: default_db_conn(),
        }
    }
}

/// OAuth2/OIDC settings for the `/auth` callback.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AuthConfig {
    pub client_id: String,
    pub authorize_url: String,
    pub token_url: String,
    pub jwks_url: String,
    /// Client secret for the authorization-code exchange.
    pub secret: String,
    /// Session cookie lifetime in seconds.
    #[serde(default = "default_cookie_expiry")]
    pub cookie_expiry_secs: i64,
    /// Userids allowed to call `POST /admin/mode`.
    #[serde(default)]
    pub admin_users: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PerfConfig {
    /// Max fields per protocol frame (verb and trailing included).
    #[serde(default = "default_msg_args_cap")]
    pub msg_args_cap: usize,
    /// Max bytes per protocol frame.
    #[serde(default = "default_msg_bytes_cap")]
    pub msg_bytes_cap: usize,
    /// Seconds allowed for a new WebSocket session to authenticate and
    /// bootstrap before it is dropped.
    #[serde(default = "default_read_header_timeout")]
    pub read_header_timeout_secs: u64,
    /// Notifier pacing: per-forwarder delay in ms is
    /// `(num_courses × num_sessions) >> usem_delay_shift_bits`.
    #[serde(default = "default_usem_delay_shift")]
    pub usem_delay_shift_bits: u32,
    /// Send the first `M` directly to the chooser on a successful `Y`
    /// instead of waiting for the coalesced signal.
    #[serde(default)]
    pub propagate_immediate: bool,
    /// Capacity of each session's update fan-in channel.
    #[serde(default = "default_senq")]
    pub senq: usize,
}

impl Default for PerfConfig {
    fn default() -> Self {
        Self {
            msg_args_cap: default_msg_args_cap(),
            msg_bytes_cap: default_msg_bytes_cap(),
            read_header_timeout_secs: default_read_header_timeout(),
            usem_delay_shift_bits: default_usem_delay_shift(),
            propagate_immediate: false,
            senq: default_senq(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Public base URL, used as the OAuth redirect target (`<url>/auth`).
    #[serde(default)]
    pub url: String,
    /// Production flag; disables the relaxed cookie attributes used in dev.
    #[serde(default)]
    pub prod: bool,
    /// Directory served under `/static` (index.html lives here too).
    #[serde(default = "default_static_dir")]
    pub static_dir: PathBuf,
    #[serde(default)]
    pub listener: ListenerConfig,
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub perf: PerfConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            prod: false,
            static_dir: default_static_dir(),
            listener: ListenerConfig::default(),
            db: DbConfig::default(),
            auth: AuthConfig::default(),
            perf: PerfConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Read and validate the config file. Every failure names the step.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("read config file {}", path.display()))?;
        let config: ServerConfig = toml::from_str(&contents)
            .with_context(|| format!("parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.listener.proto != "http" {
            bail!("listener.proto: only \"http\" is supported, got {:?}", self.listener.proto);
        }
        if self.listener.net != "tcp" {
            bail!("listener.net: only \"tcp\" is supported, got {:?}", self.listener.net);
        }
        match self.listener.trans.as_str() {
            "plain" => {}
            "tls" => {
                for (name, path) in [
                    ("listener.tls_cert", &self.listener.tls_cert),
                    ("listener.tls_key", &self.listener.tls_key),
                ] {
                    match path {
                        Some(p) if p.exists() => {}
                        Some(p) => bail!("{name}: {} does not exist", p.display()),
                        None => bail!("{name} is required when listener.trans = \"tls\""),
                    }
                }
            }
            other => bail!("listener.trans must be \"plain\" or \"tls\", got {other:?}"),
        }
        if self.db.kind != "sqlite" {
            bail!("db.kind: only \"sqlite\" is supported, got {:?}", self.db.kind);
        }
        if self.perf.msg_bytes_cap == 0 || self.perf.msg_args_cap == 0 {
            bail!("perf.msg_bytes_cap and perf.msg_args_cap must be positive");
        }
        if self.perf.senq == 0 {
            bail!("perf.senq must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let f = write_config("url = \"http://localhost:5555\"\n");
        let cfg = ServerConfig::load(f.path()).unwrap();
        assert_eq!(cfg.listener.addr, "127.0.0.1:5555");
        assert_eq!(cfg.db.kind, "sqlite");
        assert_eq!(cfg.perf.msg_args_cap, 4);
        assert_eq!(cfg.perf.senq, 64);
        assert!(!cfg.perf.propagate_immediate);
        assert!(!cfg.prod);
    }

    #[test]
    fn full_config_round_trips() {
        let f = write_config(
            r#"
url = "https://courses.example.edu"
prod = true

[listener]
addr = "0.0.0.0:8080"

[db]
conn = "var/enrolld.db"

[auth]
client_id = "abc"
authorize_url = "https://idp/authorize"
token_url = "https://idp/token"
jwks_url = "https://idp/jwks"
secret = "shh"
cookie_expiry_secs = 3600
admin_users = ["staff1"]

[perf]
msg_args_cap = 8
msg_bytes_cap = 2048
usem_delay_shift_bits = 10
propagate_immediate = true
senq = 128
"#,
        );
        let cfg = ServerConfig::load(f.path()).unwrap();
        assert!(cfg.prod);
        assert_eq!(cfg.listener.addr, "0.0.0.0:8080");
        assert_eq!(cfg.auth.admin_users, vec!["staff1"]);
        assert_eq!(cfg.perf.usem_delay_shift_bits, 10);
        assert!(cfg.perf.propagate_immediate);
    }

    #[test]
    fn rejects_unknown_db_kind() {
        let f = write_config("[db]\nkind = \"postgres\"\n");
        let err = ServerConfig::load(f.path()).unwrap_err().to_string();
        assert!(err.contains("sqlite"), "{err}");
    }

    #[test]
    fn tls_requires_cert_and_key() {
        let f = write_config("[listener]\ntrans = \"tls\"\n");
        assert!(ServerConfig::load(f.path()).is_err());
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(ServerConfig::load(Path::new("/nonexistent/enrolld.toml")).is_err());
    }
}
