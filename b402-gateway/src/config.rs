//! Gateway configuration.
//!
//! Loads configuration from a TOML file with support for environment variable
//! expansion. Variables use `$VAR` or `${VAR}` syntax.
//!
//! # Example Configuration
//!
//! ```toml
//! host = "0.0.0.0"
//! port = 4021
//! database_path = "/var/lib/b402/b402.sqlite3"
//!
//! [gate]
//! enabled = true
//! pay_to = "$X402_PAY_TO"
//! verifier = "algorand"
//! default_price = "0.05"
//!
//! [algorand]
//! indexer_url = "https://testnet-idx.algonode.cloud"
//! network = "testnet"
//! ```
//!
//! # Environment Variables
//!
//! - `CONFIG` - Path to configuration file (default: `config.toml`)
//! - `HOST` - Override server bind address
//! - `PORT` - Override server port
//! - `DATABASE_PATH` - Override the SQLite file

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use b402::GateConfig;
use b402_algorand::AlgorandConfig;
use serde::Deserialize;

use crate::error::GatewayError;

/// Top-level gateway configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GatewayConfig {
    /// Server bind address (default: `0.0.0.0`).
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Server port (default: `4021`).
    #[serde(default = "default_port")]
    pub port: u16,

    /// SQLite database file (default: `b402.sqlite3`).
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Receipts re-processed per reconciliation batch.
    #[serde(default = "default_reconcile_batch")]
    pub reconcile_batch: usize,

    /// Payment gate settings.
    #[serde(default)]
    pub gate: GateConfig,

    /// Algorand verifier settings; the verifier is registered only when present.
    #[serde(default)]
    pub algorand: Option<AlgorandConfig>,
}

const fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

const fn default_port() -> u16 {
    4021
}

fn default_database_path() -> PathBuf {
    PathBuf::from("b402.sqlite3")
}

const fn default_reconcile_batch() -> usize {
    100
}

impl GatewayConfig {
    /// Loads configuration from the path given by the `CONFIG` environment
    /// variable, falling back to `config.toml` in the current directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load() -> Result<Self, GatewayError> {
        let path = std::env::var("CONFIG").unwrap_or_else(|_| "config.toml".to_owned());
        Self::load_from(path)
    }

    /// Loads configuration from a specific file path.
    ///
    /// A missing file yields the defaults. `$VAR` references are expanded
    /// before parsing, then `HOST`, `PORT` and `DATABASE_PATH` override the
    /// file values.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, GatewayError> {
        let path = path.as_ref();
        let content = if path.exists() {
            std::fs::read_to_string(path).map_err(|source| GatewayError::ConfigRead {
                path: path.to_path_buf(),
                source,
            })?
        } else {
            tracing::warn!(path = %path.display(), "Config file not found, using defaults");
            String::new()
        };
        let lookup = |name: &str| std::env::var(name).ok();
        let mut config = Self::parse(&content, lookup)?;
        config.apply_overrides(lookup);
        Ok(config)
    }

    fn parse(content: &str, lookup: impl Fn(&str) -> Option<String>) -> Result<Self, GatewayError> {
        let expanded = expand_vars(content, lookup);
        Ok(toml::from_str(&expanded)?)
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(host) = lookup("HOST").and_then(|h| h.parse().ok()) {
            self.host = host;
        }
        if let Some(port) = lookup("PORT").and_then(|p| p.parse().ok()) {
            self.port = port;
        }
        if let Some(path) = lookup("DATABASE_PATH").filter(|p| !p.trim().is_empty()) {
            self.database_path = PathBuf::from(path);
        }
    }
}

/// Expands `$VAR` and `${VAR}` patterns through `lookup`.
///
/// Unresolved variables are left as-is.
fn expand_vars(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != '$' {
            result.push(ch);
            continue;
        }
        let braced = chars.next_if_eq(&'{').is_some();
        let mut name = String::new();
        let mut closed = false;
        while let Some(&c) = chars.peek() {
            if braced && c == '}' {
                chars.next();
                closed = true;
                break;
            }
            if !braced && !c.is_ascii_alphanumeric() && c != '_' {
                break;
            }
            name.push(c);
            chars.next();
        }

        match (name.is_empty(), lookup(&name)) {
            (false, Some(value)) => result.push_str(&value),
            _ => {
                result.push('$');
                if braced {
                    result.push('{');
                }
                result.push_str(&name);
                if closed {
                    result.push('}');
                }
            }
        }
    }

    result
}
