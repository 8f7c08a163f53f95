//! Process settings from `key=value` arguments layered over environment variables.

use crate::config::ConfigSource;
use crate::error::LoadError;
use crate::hson::WhitespaceHandling;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_BIND: &str = "127.0.0.1:3000";
pub const DEFAULT_REFRESH_SECS: u64 = 5;

/// Setting keys with the environment variable that backs each one.
const KEYS: &[(&str, &str)] = &[
    ("config.Url", "CONFIG_URL"),
    ("config.Path", "CONFIG_PATH"),
    ("bind", "BIND"),
    ("refresh.Interval", "REFRESH_INTERVAL"),
    ("hson.Whitespace", "HSON_WHITESPACE"),
];

#[derive(Debug, Clone)]
pub struct Settings {
    pub source: ConfigSource,
    pub bind: Vec<SocketAddr>,
    pub refresh_interval: Duration,
}

fn parse_bind(text: &str) -> Result<SocketAddr, LoadError> {
    let text = text.trim();
    if let Ok(port) = text.trim_start_matches(':').parse::<u16>() {
        return Ok(SocketAddr::from(([127, 0, 0, 1], port)));
    }
    text.parse()
        .map_err(|_| LoadError::Settings(format!("invalid bind address '{}'", text)))
}

impl Settings {
    /// Build from command-line arguments (`key=value`, keys case-insensitive) and the
    /// environment. Arguments win; `bind` may repeat and takes comma-separated lists.
    pub fn from_args<I>(args: I, env: impl Fn(&str) -> Option<String>) -> Result<Self, LoadError>
    where
        I: IntoIterator<Item = String>,
    {
        let mut values: Vec<(&'static str, String)> = Vec::new();
        for arg in args {
            let (key, value) = arg
                .split_once('=')
                .ok_or_else(|| LoadError::Settings(format!("expected key=value, got '{}'", arg)))?;
            let known = KEYS
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(key.trim()))
                .ok_or_else(|| LoadError::Settings(format!("unknown setting '{}'", key)))?;
            values.push((known.0, value.trim().to_string()));
        }
        let lookup = |key: &str| -> Vec<String> {
            let from_args: Vec<String> = values
                .iter()
                .filter(|(k, _)| *k == key)
                .map(|(_, v)| v.clone())
                .collect();
            if !from_args.is_empty() {
                return from_args;
            }
            KEYS.iter()
                .find(|(k, _)| *k == key)
                .and_then(|(_, var)| env(var))
                .into_iter()
                .collect()
        };
        let single = |key: &str| lookup(key).pop().filter(|v| !v.is_empty());

        let whitespace = match single("hson.Whitespace") {
            Some(text) => text.parse::<WhitespaceHandling>().map_err(LoadError::Settings)?,
            None => WhitespaceHandling::default(),
        };
        let refresh_secs = match single("refresh.Interval") {
            Some(text) => text
                .parse::<u64>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| LoadError::Settings(format!("invalid refresh.Interval '{}'", text)))?,
            None => DEFAULT_REFRESH_SECS,
        };
        let mut bind = lookup("bind")
            .iter()
            .flat_map(|v| v.split(','))
            .filter(|v| !v.trim().is_empty())
            .map(parse_bind)
            .collect::<Result<Vec<_>, _>>()?;
        if bind.is_empty() {
            bind.push(parse_bind(DEFAULT_BIND)?);
        }

        Ok(Settings {
            source: ConfigSource {
                url: single("config.Url"),
                path: single("config.Path").map(PathBuf::from),
                whitespace,
            },
            bind,
            refresh_interval: Duration::from_secs(refresh_secs),
        })
    }
}
