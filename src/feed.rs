// ===============================
// src/feed.rs (market data subscriptions)
// ===============================
//
// One push-stream per symbol: {WS_BASE}/ws/quotes/{SYMBOL}/
//
// Wire format (only `type == "tick"` is used, everything else is dropped):
//   {"type":"tick","symbol":"EURUSD","bid":1.0841,"ask":1.0843,"last":1.0842,"ts":1717000000}
// Numbers may also arrive as strings. A tick with only `last` becomes a
// degenerate quote (bid = ask = last).
//
// `MarketData::subscribe` diffs the wanted symbol set against the open
// sockets: removed symbols are closed, new ones opened, the rest untouched.
//
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use ahash::AHashMap as HashMap;
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info};
use url::Url;

use crate::domain::{lenient, parse_timestamp, Quote};
use crate::metrics::{DROPPED_MESSAGES, TICKS_BY_SYMBOL};
use crate::stream::{self, ReconnectPolicy, StreamHandle};

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum QuoteMessage {
    Tick(RawTick),
    #[serde(other)]
    Other,
}

#[derive(Debug, Default, Deserialize)]
struct RawTick {
    #[serde(default)]
    symbol: Option<Value>,
    #[serde(default)]
    bid: Option<Value>,
    #[serde(default)]
    ask: Option<Value>,
    #[serde(default)]
    last: Option<Value>,
    #[serde(default)]
    change_pct: Option<Value>,
    #[serde(default)]
    ts: Option<Value>,
}

fn num(v: &Option<Value>) -> Option<f64> { v.as_ref().and_then(lenient::as_f64) }

/// Parse one frame from a quote socket. `symbol` is the symbol the socket was
/// opened for; the quote is always keyed by it. `prev` supplies the last
/// known `change_pct` when the tick omits it.
pub fn parse_tick(symbol: &str, text: &str, prev: Option<&Quote>) -> Option<Quote> {
    let tick = match serde_json::from_str::<QuoteMessage>(text) {
        Ok(QuoteMessage::Tick(t)) => t,
        Ok(QuoteMessage::Other) => return None,
        Err(e) => {
            debug!(%symbol, error = %e, "unparsable quote frame");
            return None;
        }
    };

    if let Some(other) = tick.symbol.as_ref().and_then(lenient::as_string) {
        if !other.eq_ignore_ascii_case(symbol) {
            debug!(%symbol, tick_symbol = %other, "tick for a different symbol on this socket");
        }
    }

    let (bid, ask, last) = match (num(&tick.bid), num(&tick.ask), num(&tick.last)) {
        (Some(b), Some(a), l) => (b, a, l.unwrap_or((b + a) / 2.0)),
        (_, _, Some(l)) => (l, l, l),
        _ => return None,
    };

    let change_pct = num(&tick.change_pct).or_else(|| prev.and_then(|q| q.change_pct));
    let ts = tick.ts.as_ref().and_then(parse_timestamp).unwrap_or_else(Utc::now);

    Some(Quote { symbol: symbol.to_string(), bid, ask, last, change_pct, ts })
}

/// Latest quote per symbol, shared between the socket tasks and readers.
#[derive(Clone, Default)]
pub struct QuoteBook {
    inner: Arc<RwLock<HashMap<String, Quote>>>,
}

impl QuoteBook {
    pub fn new() -> Self { Self::default() }

    pub fn get(&self, symbol: &str) -> Option<Quote> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&normalize_symbol(symbol))
            .cloned()
    }

    pub fn bid(&self, symbol: &str) -> Option<f64> { self.get(symbol).map(|q| q.bid) }
    pub fn ask(&self, symbol: &str) -> Option<f64> { self.get(symbol).map(|q| q.ask) }
    pub fn last(&self, symbol: &str) -> Option<f64> { self.get(symbol).map(|q| q.last) }

    pub fn all(&self) -> Vec<Quote> {
        let mut v: Vec<Quote> = self.inner.read().unwrap_or_else(PoisonError::into_inner).values().cloned().collect();
        v.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        v
    }

    /// Apply one raw frame from the feed guarded by `live`; returns the
    /// accepted quote. `live` is read under the write lock, so a retired feed
    /// can never write.
    pub fn apply_live(&self, symbol: &str, text: &str, live: &AtomicBool) -> Option<Quote> {
        let key = normalize_symbol(symbol);
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if !live.load(Ordering::Acquire) {
            return None;
        }
        let quote = parse_tick(&key, text, guard.get(&key))?;
        guard.insert(key, quote.clone());
        Some(quote)
    }

    /// Mark a feed dead and drop its quote in one step.
    pub fn retire(&self, symbol: &str, live: &AtomicBool) {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        live.store(false, Ordering::Release);
        guard.remove(&normalize_symbol(symbol));
    }

    /// Insert a quote directly (manual overrides, tests).
    pub fn put(&self, quote: Quote) {
        let key = normalize_symbol(&quote.symbol);
        self.inner.write().unwrap_or_else(PoisonError::into_inner).insert(key, quote);
    }
}

pub fn normalize_symbol(symbol: &str) -> String { symbol.trim().to_ascii_uppercase() }

pub fn quote_url(ws_base: &Url, symbol: &str) -> Result<Url, url::ParseError> {
    let base = ws_base.as_str().trim_end_matches('/');
    Url::parse(&format!("{}/ws/quotes/{}/", base, urlencoding::encode(symbol)))
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SymbolDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl SymbolDiff {
    pub fn between(current: &BTreeSet<String>, wanted: &BTreeSet<String>) -> Self {
        Self {
            added: wanted.difference(current).cloned().collect(),
            removed: current.difference(wanted).cloned().collect(),
        }
    }
    pub fn is_empty(&self) -> bool { self.added.is_empty() && self.removed.is_empty() }
}

struct QuoteConn {
    handle: StreamHandle,
    live: Arc<AtomicBool>,
}

/// Owns the symbol -> socket map.
pub struct MarketData {
    ws_base: Url,
    policy: ReconnectPolicy,
    book: QuoteBook,
    conns: HashMap<String, QuoteConn>,
    tx: broadcast::Sender<Quote>,
}

impl MarketData {
    pub fn new(ws_base: Url, policy: ReconnectPolicy) -> Self {
        let (tx, _rx) = broadcast::channel(4096);
        Self { ws_base, policy, book: QuoteBook::new(), conns: HashMap::new(), tx }
    }

    pub fn book(&self) -> QuoteBook { self.book.clone() }

    /// Every accepted quote, in arrival order per symbol.
    pub fn updates(&self) -> broadcast::Receiver<Quote> { self.tx.subscribe() }

    pub fn symbols(&self) -> BTreeSet<String> { self.conns.keys().cloned().collect() }

    /// Reconcile open sockets with `symbols`. Unchanged symbols keep their
    /// socket (and their last quote).
    pub fn subscribe<S: AsRef<str>>(&mut self, symbols: &[S]) -> Result<SymbolDiff, url::ParseError> {
        let wanted: BTreeSet<String> = symbols
            .iter()
            .map(|s| normalize_symbol(s.as_ref()))
            .filter(|s| !s.is_empty())
            .collect();
        let diff = SymbolDiff::between(&self.symbols(), &wanted);

        // Validate every new URL before touching anything.
        let mut urls = Vec::with_capacity(diff.added.len());
        for sym in &diff.added {
            urls.push((sym.clone(), quote_url(&self.ws_base, sym)?));
        }

        for sym in &diff.removed {
            if let Some(conn) = self.conns.remove(sym) {
                self.book.retire(sym, &conn.live);
                conn.handle.close();
            }
        }
        for (sym, url) in urls {
            let conn = self.open(sym.clone(), url);
            self.conns.insert(sym, conn);
        }

        if !diff.is_empty() {
            info!(added = ?diff.added, removed = ?diff.removed, "quote subscriptions reconciled");
        }
        Ok(diff)
    }

    fn open(&self, symbol: String, url: Url) -> QuoteConn {
        let book = self.book.clone();
        let tx = self.tx.clone();
        let sym = symbol.clone();
        let live = Arc::new(AtomicBool::new(true));
        let flag = live.clone();
        let handle = stream::spawn(
            "quotes",
            symbol,
            self.policy,
            move || Some(url.clone()),
            move |text| match book.apply_live(&sym, text, &flag) {
                Some(q) => {
                    TICKS_BY_SYMBOL.with_label_values(&[sym.as_str()]).inc();
                    let _ = tx.send(q);
                }
                None => DROPPED_MESSAGES.with_label_values(&["quotes"]).inc(),
            },
        );
        QuoteConn { handle, live }
    }

    /// Close every socket and wait for them to finish.
    pub async fn unsubscribe(&mut self) {
        let conns: Vec<(String, QuoteConn)> = self.conns.drain().collect();
        for (sym, conn) in conns {
            self.book.retire(&sym, &conn.live);
            conn.handle.shutdown().await;
        }
    }
}
