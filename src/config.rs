// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : tradedesk - async client core for a simulated FX/CFD trading desk
Version : 0.1.0
License : MIT (see LICENSE)

Summary : Authenticated REST gateway with one-shot token renewal, live quote
          streams per symbol, an account event stream reconciled into
          positions/history, margin-gated order submission and a capital
          summary cache. Exposes Prometheus metrics and records JSONL events.
=============================================================================
*/
use std::env;
use std::path::PathBuf;

use dotenvy::dotenv;
use thiserror::Error;
use url::Url;

use crate::risk::{MAX_LEVERAGE, MIN_LEVERAGE};
use crate::stream::ReconnectPolicy;

pub const DEFAULT_API_BASE: &str = "http://127.0.0.1:8000";
pub const DEFAULT_SYMBOLS: &[&str] = &["EURUSD", "GBPUSD", "USDJPY", "AUDUSD", "USDCAD", "BTCUSDT"];
pub const DEFAULT_LEVERAGE: u32 = 500;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{key}: invalid url {value:?}: {source}")]
    Url { key: &'static str, value: String, source: url::ParseError },
    #[error("{key}: unsupported url scheme {scheme:?}")]
    Scheme { key: &'static str, scheme: String },
    #[error("{key}: invalid number {value:?}")]
    Number { key: &'static str, value: String },
    #[error("DEFAULT_LEVERAGE {0} outside 1..=5000")]
    Leverage(u32),
}

#[derive(Clone, Debug)]
pub struct Settings {
    // backend
    pub api_base: Url,
    pub ws_base: Url,

    // market data / orders
    pub symbols: Vec<String>,
    pub default_leverage: u32,

    // session
    pub token_file: Option<PathBuf>,

    // push streams
    pub reconnect: ReconnectPolicy,

    // files/metrics
    pub metrics_port: u16,
    pub record_file: Option<PathBuf>,
}

/// http -> ws, https -> wss; ws/wss pass through. Trailing slash trimmed.
pub fn ws_base_from_api(api_base: &Url) -> Result<Url, ConfigError> {
    let scheme = match api_base.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(ConfigError::Scheme { key: "API_BASE", scheme: other.to_string() }),
    };
    let rest = &api_base.as_str()[api_base.scheme().len()..];
    let raw = format!("{scheme}{}", rest.trim_end_matches('/'));
    Url::parse(&raw).map_err(|source| ConfigError::Url { key: "WS_BASE", value: raw, source })
}

/// Comma separated, trimmed, upper-cased, de-duplicated (first wins).
pub fn parse_symbols(raw: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for s in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let s = s.to_ascii_uppercase();
        if !out.contains(&s) {
            out.push(s);
        }
    }
    out
}

fn parse_url(key: &'static str, value: &str) -> Result<Url, ConfigError> {
    Url::parse(value.trim()).map_err(|source| ConfigError::Url { key, value: value.to_string(), source })
}

fn parse_num<T: std::str::FromStr>(key: &'static str, value: Option<String>, default: T) -> Result<T, ConfigError> {
    match value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) {
        None => Ok(default),
        Some(v) => v.parse().map_err(|_| ConfigError::Number { key, value: v }),
    }
}

impl Settings {
    /// Build settings from any key lookup (process env in `load`, maps in tests).
    pub fn from_lookup<F>(get: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        // ===== Backend =====
        let api_base = parse_url("API_BASE", &get("API_BASE").unwrap_or_else(|| DEFAULT_API_BASE.to_string()))?;
        let ws_base = match get("WS_BASE").filter(|v| !v.trim().is_empty()) {
            Some(v) => parse_url("WS_BASE", &v)?,
            None => ws_base_from_api(&api_base)?,
        };

        // ===== Symbols / leverage =====
        let symbols = get("SYMBOLS")
            .map(|s| parse_symbols(&s))
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_SYMBOLS.iter().map(|s| s.to_string()).collect());
        let default_leverage = parse_num("DEFAULT_LEVERAGE", get("DEFAULT_LEVERAGE"), DEFAULT_LEVERAGE)?;
        if !(MIN_LEVERAGE..=MAX_LEVERAGE).contains(&default_leverage) {
            return Err(ConfigError::Leverage(default_leverage));
        }

        // ===== Streams =====
        let defaults = ReconnectPolicy::default();
        let reconnect = ReconnectPolicy {
            max_retries: parse_num("RECONNECT_MAX_RETRIES", get("RECONNECT_MAX_RETRIES"), defaults.max_retries)?,
            base_ms: parse_num("RECONNECT_BASE_MS", get("RECONNECT_BASE_MS"), defaults.base_ms)?,
            ..defaults
        };

        Ok(Settings {
            api_base,
            ws_base,
            symbols,
            default_leverage,
            token_file: get("TOKEN_FILE").filter(|v| !v.is_empty()).map(PathBuf::from),
            reconnect,
            metrics_port: parse_num("METRICS_PORT", get("METRICS_PORT"), 9898)?,
            record_file: get("RECORD_FILE").filter(|v| !v.is_empty()).map(PathBuf::from),
        })
    }
}

pub fn load() -> Result<Settings, ConfigError> {
    // Make sure .env is read (API_BASE, SYMBOLS, ...)
    let _ = dotenv();
    Settings::from_lookup(|k| env::var(k).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ahash::AHashMap as HashMap;

    fn settings(pairs: &[(&str, &str)]) -> Result<Settings, ConfigError> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Settings::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn ws_base_follows_api_scheme() {
        let u = ws_base_from_api(&Url::parse("https://desk.example.com/").unwrap()).unwrap();
        assert_eq!(u.as_str(), "wss://desk.example.com/");
        let u = ws_base_from_api(&Url::parse("http://127.0.0.1:8000").unwrap()).unwrap();
        assert_eq!(u.as_str(), "ws://127.0.0.1:8000/");
        let u = ws_base_from_api(&Url::parse("https://desk.example.com/backend/").unwrap()).unwrap();
        assert_eq!(u.as_str(), "wss://desk.example.com/backend");
        assert!(ws_base_from_api(&Url::parse("ftp://x").unwrap()).is_err());
    }

    #[test]
    fn defaults() {
        let s = settings(&[]).unwrap();
        assert_eq!(s.api_base.as_str(), "http://127.0.0.1:8000/");
        assert_eq!(s.ws_base.scheme(), "ws");
        assert_eq!(s.symbols.len(), 6);
        assert_eq!(s.default_leverage, 500);
        assert_eq!(s.reconnect.max_retries, 5);
        assert_eq!(s.metrics_port, 9898);
        assert!(s.token_file.is_none());
    }

    #[test]
    fn overrides_and_errors() {
        let s = settings(&[("SYMBOLS", " eurusd, xauusd ,EURUSD"), ("WS_BASE", "wss://push.example"), ("RECONNECT_MAX_RETRIES", "0")]).unwrap();
        assert_eq!(s.symbols, vec!["EURUSD", "XAUUSD"]);
        assert_eq!(s.ws_base.as_str(), "wss://push.example/");
        assert_eq!(s.reconnect.max_retries, 0);

        assert!(matches!(settings(&[("API_BASE", "not a url")]), Err(ConfigError::Url { key: "API_BASE", .. })));
        assert!(matches!(settings(&[("METRICS_PORT", "abc")]), Err(ConfigError::Number { key: "METRICS_PORT", .. })));
        assert_eq!(settings(&[("DEFAULT_LEVERAGE", "9000")]).unwrap_err(), ConfigError::Leverage(9000));
    }
}
