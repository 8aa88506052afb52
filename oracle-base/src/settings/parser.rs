use std::{fmt, time::Duration};

use eyre::{eyre, Report};
use oracle_core::U256;
use serde_json::Value;
use url::Url;

/// Result of parsing a raw configuration.
pub type ConfigResult<T> = Result<T, ConfigParsingError>;

/// Every problem found while parsing a configuration, keyed by path.
#[derive(Debug, Default)]
pub struct ConfigParsingError(Vec<(String, Report)>);

impl ConfigParsingError {
    /// Records an error at `path`.
    pub fn push(&mut self, path: impl Into<String>, report: Report) {
        self.0.push((path.into(), report));
    }

    /// Records a missing required value at `path`.
    pub fn push_missing(&mut self, path: impl Into<String>) {
        self.push(path, eyre!("missing required value"));
    }

    /// Records the error of `res`, if any, and returns its value.
    pub fn take<T>(&mut self, path: &str, res: eyre::Result<T>) -> Option<T> {
        match res {
            Ok(v) => Some(v),
            Err(e) => {
                self.push(path, e);
                None
            }
        }
    }

    /// Absorbs the errors of another parse.
    pub fn merge(&mut self, other: ConfigParsingError) {
        self.0.extend(other.0);
    }

    /// Whether no error was recorded.
    pub fn is_ok(&self) -> bool {
        self.0.is_empty()
    }

    /// `Ok(value)` if no error was recorded.
    pub fn into_result<T>(self, value: T) -> ConfigResult<T> {
        if self.is_ok() {
            Ok(value)
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for ConfigParsingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} configuration error(s):", self.0.len())?;
        for (path, report) in &self.0 {
            writeln!(f, "  {path}: {report:#}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ConfigParsingError {}

static NULL: Value = Value::Null;

/// Reads typed values out of a raw JSON configuration tree.
///
/// Key lookups ignore case, `_` and `-`, so `gasBumpPercent`,
/// `gas_bump_percent` and `gasbumppercent` all match. Scalars may be given
/// as JSON numbers/booleans or as strings, since environment overrides are
/// always strings.
#[derive(Debug, Clone)]
pub struct ValueParser<'v> {
    val: &'v Value,
    path: String,
}

fn flat(key: &str) -> String {
    key.chars()
        .filter(|c| *c != '_' && *c != '-')
        .flat_map(char::to_lowercase)
        .collect()
}

impl<'v> ValueParser<'v> {
    /// Parser over the root of a configuration tree
    pub fn new(val: &'v Value) -> Self {
        Self {
            val,
            path: String::new(),
        }
    }

    /// Dotted path of this value
    pub fn path(&self) -> &str {
        &self.path
    }

    fn child_path(&self, key: &str) -> String {
        if self.path.is_empty() {
            key.to_owned()
        } else {
            format!("{}.{key}", self.path)
        }
    }

    /// The value at `key`, or `None` if absent or null.
    pub fn get_opt_key(&self, key: &str) -> Option<ValueParser<'v>> {
        let wanted = flat(key);
        let obj = self.val.as_object()?;
        obj.iter()
            .find(|(k, _)| flat(k) == wanted)
            .map(|(_, v)| v)
            .filter(|v| !v.is_null())
            .map(|v| ValueParser {
                val: v,
                path: self.child_path(key),
            })
    }

    /// The object at `key`; an absent section reads as empty.
    pub fn section(&self, key: &str) -> ValueParser<'v> {
        self.get_opt_key(key).unwrap_or_else(|| ValueParser {
            val: &NULL,
            path: self.child_path(key),
        })
    }

    /// Parses this value as an unsigned integer.
    pub fn parse_u64(&self) -> eyre::Result<u64> {
        match self.val {
            Value::Number(n) => n
                .as_u64()
                .ok_or_else(|| eyre!("expected a non-negative integer, got {n}")),
            Value::String(s) => s
                .trim()
                .parse::<u64>()
                .map_err(|e| eyre!("expected a non-negative integer, got {s:?}: {e}")),
            other => Err(eyre!("expected a non-negative integer, got {other}")),
        }
    }

    /// Parses this value as a boolean.
    pub fn parse_bool(&self) -> eyre::Result<bool> {
        match self.val {
            Value::Bool(b) => Ok(*b),
            Value::String(s) => match s.trim().to_lowercase().as_str() {
                "true" | "1" | "yes" => Ok(true),
                "false" | "0" | "no" => Ok(false),
                _ => Err(eyre!("expected a boolean, got {s:?}")),
            },
            other => Err(eyre!("expected a boolean, got {other}")),
        }
    }

    /// Parses this value as a string; numbers are formatted.
    pub fn parse_string(&self) -> eyre::Result<String> {
        match self.val {
            Value::String(s) => Ok(s.clone()),
            Value::Number(n) => Ok(n.to_string()),
            Value::Bool(b) => Ok(b.to_string()),
            other => Err(eyre!("expected a string, got {other}")),
        }
    }

    /// Parses a list given as an array or a comma separated string.
    pub fn parse_string_list(&self) -> eyre::Result<Vec<String>> {
        match self.val {
            Value::Array(items) => items
                .iter()
                .map(|v| ValueParser::new(v).parse_string())
                .collect(),
            Value::String(s) => Ok(s
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
                .collect()),
            other => Err(eyre!("expected a list, got {other}")),
        }
    }

    /// Parses a humantime duration such as `15s` or `10m`.
    pub fn parse_duration(&self) -> eyre::Result<Duration> {
        let s = self.parse_string()?;
        humantime::parse_duration(s.trim()).map_err(|e| eyre!("invalid duration {s:?}: {e}"))
    }

    /// Parses an amount of wei, see [`parse_wei`].
    pub fn parse_wei(&self) -> eyre::Result<U256> {
        parse_wei(&self.parse_string()?)
    }

    /// Parses a URL.
    pub fn parse_url(&self) -> eyre::Result<Url> {
        let s = self.parse_string()?;
        Url::parse(&s).map_err(|e| eyre!("invalid url {s:?}: {e}"))
    }

    /// Optional integer at `key`; a present but invalid value is recorded.
    pub fn u64(&self, err: &mut ConfigParsingError, key: &str) -> Option<u64> {
        let v = self.get_opt_key(key)?;
        err.take(v.path(), v.parse_u64())
    }

    /// Optional boolean at `key`.
    pub fn bool(&self, err: &mut ConfigParsingError, key: &str) -> Option<bool> {
        let v = self.get_opt_key(key)?;
        err.take(v.path(), v.parse_bool())
    }

    /// Optional string at `key`.
    pub fn string(&self, err: &mut ConfigParsingError, key: &str) -> Option<String> {
        let v = self.get_opt_key(key)?;
        err.take(v.path(), v.parse_string())
    }

    /// Optional list at `key`.
    pub fn string_list(&self, err: &mut ConfigParsingError, key: &str) -> Option<Vec<String>> {
        let v = self.get_opt_key(key)?;
        err.take(v.path(), v.parse_string_list())
    }

    /// Optional URL at `key`.
    pub fn url(&self, err: &mut ConfigParsingError, key: &str) -> Option<Url> {
        let v = self.get_opt_key(key)?;
        err.take(v.path(), v.parse_url())
    }

    /// Duration at `key`, or `default`.
    pub fn duration_or(
        &self,
        err: &mut ConfigParsingError,
        key: &str,
        default: Duration,
    ) -> Duration {
        self.get_opt_key(key)
            .and_then(|v| err.take(v.path(), v.parse_duration()))
            .unwrap_or(default)
    }

    /// Wei amount at `key`, or `default`.
    pub fn wei_or(&self, err: &mut ConfigParsingError, key: &str, default: U256) -> U256 {
        self.get_opt_key(key)
            .and_then(|v| err.take(v.path(), v.parse_wei()))
            .unwrap_or(default)
    }
}

/// Parses an amount of wei. Accepts a plain integer (`"20000000000"`) or an
/// amount with a unit (`"20 gwei"`, `"0.5ether"`).
pub fn parse_wei(value: &str) -> eyre::Result<U256> {
    let s = value.trim().to_lowercase();
    let split = s
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(s.len());
    let (amount, unit) = s.split_at(split);
    let amount = amount.trim();
    let unit = unit.trim();
    if amount.is_empty() {
        return Err(eyre!("missing amount in {value:?}"));
    }
    if unit.is_empty() || unit == "wei" {
        return U256::from_dec_str(amount).map_err(|e| eyre!("invalid wei amount {value:?}: {e}"));
    }
    let parsed = ethers::utils::parse_units(amount, unit)
        .map_err(|e| eyre!("invalid amount {value:?}: {e}"))?;
    Ok(parsed.into())
}
