// ===============================
// src/domain.rs
// ===============================
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side { Buy, Sell }

impl Side {
    pub fn as_str(&self) -> &'static str { match self { Side::Buy => "Buy", Side::Sell => "Sell" } }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "Buy" | "buy" | "BUY" => Some(Side::Buy),
            "Sell" | "sell" | "SELL" => Some(Side::Sell),
            _ => None,
        }
    }
}

/// Latest quote for one symbol. Overwritten in place on every accepted tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub bid: f64,
    pub ask: f64,
    pub last: f64,
    pub change_pct: Option<f64>,
    pub ts: DateTime<Utc>,
}

impl Quote {
    pub fn spread(&self) -> f64 {
        let s = self.ask - self.bid;
        if s.abs() < 1e-12 { 0.0 } else { s }
    }
}

/// An open position as pushed by the account stream.
///
/// Every field except `id` is optional because the backend pushes partial
/// updates; a row is only shown once [`Position::is_complete`] holds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub symbol: Option<String>,
    pub side: Option<Side>,
    pub net_lots: Option<f64>,
    pub open_price: Option<f64>,
    pub mark: Option<f64>,
    pub unreal_pnl: Option<f64>,
    /// Unix seconds.
    pub open_time: Option<i64>,
}

impl Position {
    pub fn is_complete(&self) -> bool {
        !self.id.is_empty()
            && self.symbol.as_deref().is_some_and(|s| !s.is_empty())
            && self.side.is_some()
            && self.open_price.is_some_and(f64::is_finite)
            && self.net_lots.is_some_and(|l| l > 0.0)
    }

    /// Field-level merge: only fields present in `patch` overwrite.
    pub fn merge(&mut self, patch: &Position) {
        if patch.symbol.is_some() { self.symbol = patch.symbol.clone(); }
        if patch.side.is_some() { self.side = patch.side; }
        if patch.net_lots.is_some() { self.net_lots = patch.net_lots; }
        if patch.open_price.is_some() { self.open_price = patch.open_price; }
        if patch.mark.is_some() { self.mark = patch.mark; }
        if patch.unreal_pnl.is_some() { self.unreal_pnl = patch.unreal_pnl; }
        if patch.open_time.is_some() { self.open_time = patch.open_time; }
    }

    /// Normalize one raw position object. `fallback_id` is used when the
    /// payload carries none of the known id fields.
    pub fn from_value(v: &Value, fallback_id: Option<String>) -> Option<Self> {
        let id = first_id(v, &["id", "position_id", "pos_id", "ref"]).or(fallback_id)?;
        let symbol = v
            .get("symbol")
            .and_then(lenient::as_string)
            .map(|s| s.to_ascii_uppercase())
            .filter(|s| !s.is_empty());
        let side = v.get("side").and_then(|s| s.as_str()).and_then(Side::parse);
        let open_time = v.get("open_time").and_then(parse_timestamp).map(|t| t.timestamp());
        Some(Position {
            id,
            symbol,
            side,
            net_lots: v.get("net_lots").and_then(lenient::as_f64),
            open_price: v.get("open_price").and_then(lenient::as_f64),
            mark: v.get("mark").and_then(lenient::as_f64),
            unreal_pnl: v.get("unreal_pnl").and_then(lenient::as_f64),
            open_time,
        })
    }
}

/// Closed position / ledger row shown in the history table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRow {
    pub id: String,
    pub symbol: String,
    pub realized_pnl: f64,
    pub closed_at: Option<DateTime<Utc>>,
}

/// Normalized history payload; `None` means the field was absent upstream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryPatch {
    pub id: String,
    pub symbol: Option<String>,
    pub realized_pnl: Option<f64>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl HistoryPatch {
    pub fn from_value(v: &Value, fallback_id: Option<String>) -> Option<Self> {
        let id = first_id(v, &["position_id", "pos_id", "ref", "id"]).or(fallback_id)?;
        let symbol = v
            .get("symbol")
            .and_then(lenient::as_string)
            .map(|s| s.to_ascii_uppercase())
            .filter(|s| !s.is_empty());
        let realized_pnl = ["realized_pnl", "realized", "pnl", "profit"]
            .iter()
            .find_map(|k| v.get(*k).and_then(lenient::as_f64));
        let closed_at = ["closed_at", "close_time", "timestamp", "last_ts", "ts", "time"]
            .iter()
            .find_map(|k| v.get(*k).and_then(parse_timestamp));
        Some(HistoryPatch { id, symbol, realized_pnl, closed_at })
    }

    pub fn into_row(self) -> HistoryRow {
        HistoryRow {
            id: self.id,
            symbol: self.symbol.unwrap_or_default(),
            realized_pnl: self.realized_pnl.unwrap_or(0.0),
            closed_at: self.closed_at,
        }
    }
}

impl HistoryRow {
    pub fn merge(&mut self, patch: &HistoryPatch) {
        if let Some(s) = &patch.symbol { self.symbol = s.clone(); }
        if let Some(p) = patch.realized_pnl { self.realized_pnl = p; }
        if patch.closed_at.is_some() { self.closed_at = patch.closed_at; }
    }
}

/// Account-level figures. Replaced wholesale on every refresh.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CapitalSnapshot {
    #[serde(default, deserialize_with = "lenient::f64_or_zero")]
    pub balance: f64,
    #[serde(default, deserialize_with = "lenient::f64_or_zero")]
    pub equity: f64,
    #[serde(default, deserialize_with = "lenient::f64_or_zero")]
    pub used_margin: f64,
    #[serde(default, deserialize_with = "lenient::f64_or_zero")]
    pub free_margin: f64,
}

impl CapitalSnapshot {
    /// Used margin as a rounded percentage of equity, clamped to 0..=100.
    pub fn margin_usage_pct(&self) -> u8 {
        if !self.equity.is_finite() || self.equity <= 0.0 {
            return 0;
        }
        (self.used_margin / self.equity * 100.0).clamp(0.0, 100.0).round() as u8
    }
}

/// Out-of-band risk notification from the account stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarginAlert {
    pub data: Value,
    pub received_at: DateTime<Utc>,
}

/// Backend acknowledgement of a placed order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderConfirmation {
    pub symbol: String,
    pub side: Side,
    pub lots: f64,
    pub price: f64,
    pub leverage: u32,
    pub response: Value,
}

/// Normalized events, as recorded to JSONL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    Quote(Quote),
    Account(crate::account::AccountEvent),
    Order { symbol: String, side: Side, outcome: String },
    Capital(CapitalSnapshot),
    Note(String),
}

fn first_id(v: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| v.get(*k).and_then(lenient::as_string))
        .filter(|s| !s.is_empty())
}

/// Timestamps arrive as unix seconds, unix milliseconds (anything above
/// 2_000_000_000) or ISO-8601 strings.
pub fn parse_timestamp(v: &Value) -> Option<DateTime<Utc>> {
    match v {
        Value::Number(n) => {
            let raw = n.as_f64()?;
            if !raw.is_finite() { return None; }
            let ms = if raw > 2_000_000_000.0 { raw } else { raw * 1000.0 };
            Utc.timestamp_millis_opt(ms as i64).single()
        }
        Value::String(s) => {
            let s = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc));
            }
            if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
                return Some(Utc.from_utc_datetime(&naive));
            }
            if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
                return Some(Utc.from_utc_datetime(&naive));
            }
            s.parse::<f64>().ok().and_then(|n| parse_timestamp(&Value::from(n)))
        }
        _ => None,
    }
}

/// The backend is loose with JSON types: numbers may arrive as strings.
pub mod lenient {
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    pub fn as_f64(v: &Value) -> Option<f64> {
        let n = match v {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }?;
        n.is_finite().then_some(n)
    }

    pub fn as_string(v: &Value) -> Option<String> {
        match v {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    pub fn f64_or_zero<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
        let v = Value::deserialize(d)?;
        Ok(as_f64(&v).unwrap_or(0.0))
    }
}
