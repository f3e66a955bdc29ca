// ===============================
// src/instruments.rs
// ===============================
//
// Instrument metadata: contract size, pip size, display precision and
// commission per lot. Known symbols are listed explicitly; anything else
// falls back to the defaults of its asset class.
//
use ahash::AHashMap as HashMap;
use once_cell::sync::Lazy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetClass { Fx, JpyFx, Metal, Crypto }

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InstrumentSpec {
    pub class: AssetClass,
    pub contract_size: f64,
    pub pip_size: f64,
    pub min_move: f64,
    pub precision: usize,
    /// Round-turn, per lot.
    pub commission_per_lot: f64,
}

const CRYPTO_BASES: [&str; 8] = ["BTC", "ETH", "SOL", "BNB", "XRP", "DOGE", "ADA", "MATIC"];
const METALS: [&str; 4] = ["XAU", "XAG", "GOLD", "SILVER"];
const DEFAULT_COMMISSION: f64 = 7.0;

impl AssetClass {
    pub fn of(symbol: &str) -> Self {
        let s = symbol.trim().to_ascii_uppercase();
        if s.ends_with("JPY") {
            AssetClass::JpyFx
        } else if METALS.iter().any(|m| s.contains(m)) {
            AssetClass::Metal
        } else if s.ends_with("USDT") || CRYPTO_BASES.iter().any(|b| s.contains(b)) {
            AssetClass::Crypto
        } else {
            AssetClass::Fx
        }
    }

    pub fn defaults(&self) -> InstrumentSpec {
        let (contract_size, pip_size, min_move, precision) = match self {
            AssetClass::Fx => (100_000.0, 0.0001, 0.00001, 5),
            AssetClass::JpyFx => (100_000.0, 0.01, 0.001, 3),
            AssetClass::Metal => (100.0, 0.01, 0.01, 2),
            AssetClass::Crypto => (1.0, 0.01, 0.01, 2),
        };
        InstrumentSpec {
            class: *self,
            contract_size,
            pip_size,
            min_move,
            precision,
            commission_per_lot: DEFAULT_COMMISSION,
        }
    }
}

pub struct InstrumentTable {
    by_symbol: HashMap<String, InstrumentSpec>,
}

impl InstrumentTable {
    pub fn new() -> Self { Self { by_symbol: HashMap::new() } }

    pub fn with_defaults() -> Self {
        let mut t = Self::new();
        for sym in [
            "EURUSD", "GBPUSD", "AUDUSD", "NZDUSD", "USDCAD", "USDCHF", "EURGBP",
            "USDJPY", "EURJPY", "GBPJPY",
            "XAUUSD", "XAGUSD",
            "BTCUSDT", "ETHUSDT", "SOLUSDT", "BTCUSD",
        ] {
            t.insert(sym, AssetClass::of(sym).defaults());
        }
        t
    }

    pub fn insert(&mut self, symbol: &str, spec: InstrumentSpec) {
        self.by_symbol.insert(symbol.to_ascii_uppercase(), spec);
    }

    pub fn get(&self, symbol: &str) -> InstrumentSpec {
        let key = symbol.trim().to_ascii_uppercase();
        self.by_symbol
            .get(&key)
            .copied()
            .unwrap_or_else(|| AssetClass::of(&key).defaults())
    }
}

impl Default for InstrumentTable {
    fn default() -> Self { Self::with_defaults() }
}

pub static INSTRUMENTS: Lazy<InstrumentTable> = Lazy::new(InstrumentTable::with_defaults);

pub fn spec(symbol: &str) -> InstrumentSpec { INSTRUMENTS.get(symbol) }

/// Display decimals: 3 for JPY pairs, 2 for metals and crypto, 5 otherwise.
pub fn precision(symbol: &str) -> usize { spec(symbol).precision }

pub fn format_price(symbol: &str, price: Option<f64>) -> String {
    match price {
        Some(p) if p.is_finite() => format!("{:.*}", precision(symbol), p),
        _ => "--".to_string(),
    }
}

/// `EURUSD` -> `EUR/USD`; anything that is not six letters is left alone.
pub fn display_symbol(symbol: &str) -> String {
    let s = symbol.trim();
    if s.len() == 6 && s.chars().all(|c| c.is_ascii_uppercase()) {
        format!("{}/{}", &s[..3], &s[3..])
    } else {
        s.to_string()
    }
}

/// Advisory pre-trade figures. The backend margin check is authoritative.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrderEstimate {
    pub margin_required: f64,
    pub commission: f64,
    pub pip_value: f64,
    pub spread: Option<f64>,
}

pub fn estimate(symbol: &str, lots: f64, price: Option<f64>, leverage: u32, spread: Option<f64>) -> OrderEstimate {
    let s = spec(symbol);
    let lots = if lots.is_finite() { lots } else { 0.0 };
    let margin_required = match price {
        Some(p) if p.is_finite() && leverage > 0 => lots * s.contract_size * p / leverage as f64,
        _ => 0.0,
    };
    OrderEstimate {
        margin_required,
        commission: lots * s.commission_per_lot,
        pip_value: lots * s.contract_size * s.pip_size,
        spread,
    }
}
