//! Common settings and configuration for the oracle node
//!
//! ### Configuration
//!
//! Settings are read from the config files, then from the environment.
//!
//! Configuration key/value pairs are loaded in the following order, with
//! later sources taking precedence:
//!
//! 1. The files matching `./config/*.json`.
//! 2. The files listed in `CONFIG_FILES` (comma separated), in order.
//! 3. Environment variables prefixed with `ORACLE_`. Nested keys are
//!    separated by a double underscore, e.g. `ORACLE_TXM__GAS_BUMP_PERCENT=30`
//!    overrides `txm.gasBumpPercent`.
//!
//! Keys are matched ignoring case and separators, see [`ValueParser`].

use std::time::Duration;

use serde_json::Value;
use url::Url;

pub use parser::*;
pub use trace::*;

pub mod loader;
mod parser;
mod trace;

/// Parse a raw settings object into its validated form.
pub trait FromRawConf: Sized {
    /// Converts `raw`, collecting every problem found.
    fn from_config(raw: &Value) -> ConfigResult<Self>;
}

/// Settings shared by every binary of the node.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Chain connection
    pub chain: ChainConf,
    /// Database connection
    pub database: DatabaseConf,
    /// HTTP server
    pub server: ServerConf,
    /// Logging
    pub tracing: TracingConfig,
    /// Sending keys
    pub keys: KeysConf,
}

/// Connection details for the EVM node.
#[derive(Debug, Clone)]
pub struct ChainConf {
    /// Websocket endpoint used for subscriptions and requests
    pub ws_url: Url,
    /// Expected chain id; checked at boot when set
    pub chain_id: Option<u64>,
    /// Blocks after which a block is treated as final
    pub finality_depth: u64,
    /// Request timeout for RPC calls
    pub request_timeout: Duration,
    /// How many times the websocket reconnects before the client gives up
    pub ws_reconnects: usize,
}

/// Database connection settings.
#[derive(Debug, Clone)]
pub struct DatabaseConf {
    /// Connection URL, `postgres://` or `sqlite:`
    pub url: String,
    /// Timeout applied to every database operation
    pub timeout: Duration,
    /// Pool size
    pub max_connections: u32,
    /// Grace given to subsystems on shutdown
    pub maximum_tx_duration: Duration,
    /// Whether to take the process wide advisory lock
    pub advisory_lock: bool,
    /// How often the advisory lock is checked
    pub lock_check_interval: Duration,
}

/// HTTP server settings.
#[derive(Debug, Clone)]
pub struct ServerConf {
    /// Port for the control surface and `/metrics`
    pub port: u16,
}

/// Sending keys, hex encoded secp256k1 secrets.
#[derive(Clone, Default)]
pub struct KeysConf {
    /// Secrets, never logged
    pub private_keys: Vec<String>,
}

impl std::fmt::Debug for KeysConf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeysConf")
            .field(
                "private_keys",
                &format!("<{} redacted>", self.private_keys.len()),
            )
            .finish()
    }
}

/// Default finality depth
pub const DEFAULT_FINALITY_DEPTH: u64 = 50;
/// Default websocket reconnect attempts
pub const DEFAULT_WS_RECONNECTS: usize = 10;
/// Default port of the HTTP server
pub const DEFAULT_SERVER_PORT: u16 = 6688;

impl FromRawConf for Settings {
    fn from_config(raw: &Value) -> ConfigResult<Self> {
        let mut err = ConfigParsingError::default();
        let root = ValueParser::new(raw);

        let chain = root.section("chain");
        let ws_url = chain.url(&mut err, "wsUrl");
        if chain.get_opt_key("wsUrl").is_none() {
            err.push_missing("chain.wsUrl");
        }
        let finality_depth = chain
            .u64(&mut err, "finalityDepth")
            .unwrap_or(DEFAULT_FINALITY_DEPTH);
        if finality_depth == 0 {
            err.push("chain.finalityDepth", eyre::eyre!("must be at least 1"));
        }
        let chain_id = chain.u64(&mut err, "chainId");
        let request_timeout =
            chain.duration_or(&mut err, "requestTimeout", Duration::from_secs(30));
        let ws_reconnects = chain
            .u64(&mut err, "wsReconnects")
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_WS_RECONNECTS);

        let db = root.section("database");
        let database_url = db.string(&mut err, "url").unwrap_or_default();
        if database_url.is_empty() {
            err.push_missing("database.url");
        }
        let database = DatabaseConf {
            url: database_url,
            timeout: db.duration_or(&mut err, "timeout", Duration::from_secs(60)),
            max_connections: db
                .u64(&mut err, "maxConnections")
                .map(|n| n.clamp(1, u32::MAX as u64) as u32)
                .unwrap_or(10),
            maximum_tx_duration: db.duration_or(
                &mut err,
                "maximumTxDuration",
                Duration::from_secs(30),
            ),
            advisory_lock: db.bool(&mut err, "advisoryLock").unwrap_or(true),
            lock_check_interval: db.duration_or(
                &mut err,
                "lockCheckInterval",
                Duration::from_secs(1),
            ),
        };

        let port = root
            .section("server")
            .u64(&mut err, "port")
            .map(|p| {
                u16::try_from(p).unwrap_or_else(|_| {
                    err.push("server.port", eyre::eyre!("port out of range"));
                    DEFAULT_SERVER_PORT
                })
            })
            .unwrap_or(DEFAULT_SERVER_PORT);

        let tracing = TracingConfig::from_section(&root.section("log"), &mut err);

        let keys = KeysConf {
            private_keys: root
                .section("keys")
                .string_list(&mut err, "privateKeys")
                .unwrap_or_default(),
        };
        for (i, key) in keys.private_keys.iter().enumerate() {
            let stripped = key.trim().trim_start_matches("0x");
            if stripped.len() != 64 || hex::decode(stripped).is_err() {
                err.push(
                    format!("keys.privateKeys[{i}]"),
                    eyre::eyre!("expected 32 bytes of hex"),
                );
            }
        }

        match ws_url {
            Some(ws_url) if err.is_ok() => Ok(Settings {
                chain: ChainConf {
                    ws_url,
                    chain_id,
                    finality_depth,
                    request_timeout,
                    ws_reconnects,
                },
                database,
                server: ServerConf { port },
                tracing,
                keys,
            }),
            _ => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn defaults_are_applied() {
        let raw = json!({
            "chain": {"wsUrl": "ws://localhost:8546"},
            "database": {"url": "sqlite::memory:"}
        });
        let settings = Settings::from_config(&raw).unwrap();
        assert_eq!(settings.chain.finality_depth, DEFAULT_FINALITY_DEPTH);
        assert_eq!(settings.chain.ws_reconnects, DEFAULT_WS_RECONNECTS);
        assert_eq!(settings.database.timeout, Duration::from_secs(60));
        assert_eq!(settings.server.port, DEFAULT_SERVER_PORT);
        assert!(settings.database.advisory_lock);
        assert_eq!(settings.tracing.level, Level::Info);
    }

    #[test]
    fn overrides_are_read() {
        let raw = json!({
            "chain": {"wsUrl": "ws://localhost:8546", "finalityDepth": "12", "chainId": 1337, "wsReconnects": 3},
            "database": {"url": "postgres://localhost/oracle", "timeout": "5s", "advisory_lock": "false"},
            "server": {"port": 8080},
            "log": {"level": "debug", "format": "json"}
        });
        let settings = Settings::from_config(&raw).unwrap();
        assert_eq!(settings.chain.finality_depth, 12);
        assert_eq!(settings.chain.chain_id, Some(1337));
        assert_eq!(settings.chain.ws_reconnects, 3);
        assert_eq!(settings.database.timeout, Duration::from_secs(5));
        assert!(!settings.database.advisory_lock);
        assert_eq!(settings.server.port, 8080);
        assert_eq!(settings.tracing.level, Level::Debug);
        assert_eq!(settings.tracing.fmt, Style::Json);
    }

    #[test]
    fn missing_fields_are_all_reported() {
        let err = Settings::from_config(&json!({})).unwrap_err();
        let report = err.to_string();
        assert!(report.contains("chain.wsUrl"), "{report}");
        assert!(report.contains("database.url"), "{report}");
    }

    #[test]
    fn bad_key_is_rejected_without_echoing_it() {
        let raw = json!({
            "chain": {"wsUrl": "ws://localhost:8546"},
            "database": {"url": "sqlite::memory:"},
            "keys": {"privateKeys": ["0x1234"]}
        });
        let report = Settings::from_config(&raw).unwrap_err().to_string();
        assert!(report.contains("keys.privateKeys[0]"));
        assert!(!report.contains("1234"));
    }
}
