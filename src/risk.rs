// ===============================
// src/risk.rs (local pre-trade checks)
// ===============================
//
// Runs before any network call. Resolves the execution price from the
// quote book (ask for Buy, bid for Sell) unless a manual price is given,
// and validates size and leverage. The backend margin check that follows
// is the authoritative gate; this only rejects what cannot be sent at all.
//
use thiserror::Error;

use crate::domain::Side;
use crate::feed::{normalize_symbol, QuoteBook};

pub const MIN_LEVERAGE: u32 = 1;
pub const MAX_LEVERAGE: u32 = 5000;

#[derive(Debug, Clone, PartialEq)]
pub struct OrderTicket {
    pub side: Side,
    pub symbol: String,
    pub lots: f64,
    pub leverage: Option<u32>,
    pub price: Option<f64>,
}

impl OrderTicket {
    pub fn market(side: Side, symbol: impl Into<String>, lots: f64) -> Self {
        Self { side, symbol: symbol.into(), lots, leverage: None, price: None }
    }
    pub fn with_leverage(mut self, leverage: u32) -> Self {
        self.leverage = Some(leverage);
        self
    }
    pub fn with_price(mut self, price: f64) -> Self {
        self.price = Some(price);
        self
    }
}

/// A ticket that passed local checks, with its price resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckedOrder {
    pub symbol: String,
    pub side: Side,
    pub lots: f64,
    pub price: f64,
    pub leverage: u32,
}

#[derive(Debug, Error, PartialEq)]
pub enum RiskError {
    #[error("price unavailable")]
    PriceUnavailable,
    #[error("invalid lot size")]
    InvalidLots,
    #[error("leverage {0} out of range")]
    InvalidLeverage(u32),
}

pub fn resolve_price(ticket: &OrderTicket, book: &QuoteBook) -> Option<f64> {
    let px = match ticket.price {
        Some(p) => Some(p),
        None => match ticket.side {
            Side::Buy => book.ask(&ticket.symbol),
            Side::Sell => book.bid(&ticket.symbol),
        },
    }?;
    (px.is_finite() && px > 0.0).then_some(px)
}

pub fn check(ticket: &OrderTicket, book: &QuoteBook, default_leverage: u32) -> Result<CheckedOrder, RiskError> {
    // 1) price
    let price = resolve_price(ticket, book).ok_or(RiskError::PriceUnavailable)?;

    // 2) size
    if !ticket.lots.is_finite() || ticket.lots <= 0.0 {
        return Err(RiskError::InvalidLots);
    }

    // 3) leverage
    let leverage = ticket.leverage.unwrap_or(default_leverage);
    if !(MIN_LEVERAGE..=MAX_LEVERAGE).contains(&leverage) {
        return Err(RiskError::InvalidLeverage(leverage));
    }

    Ok(CheckedOrder {
        symbol: normalize_symbol(&ticket.symbol),
        side: ticket.side,
        lots: ticket.lots,
        price,
        leverage,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Quote;
    use chrono::Utc;

    fn book_with(symbol: &str, bid: f64, ask: f64) -> QuoteBook {
        let b = QuoteBook::new();
        b.put(Quote { symbol: symbol.into(), bid, ask, last: (bid + ask) / 2.0, change_pct: None, ts: Utc::now() });
        b
    }

    #[test]
    fn buy_uses_ask_sell_uses_bid() {
        let b = book_with("EURUSD", 1.1, 1.2);
        let buy = check(&OrderTicket::market(Side::Buy, "eurusd", 1.0), &b, 500).unwrap();
        assert_eq!(buy.price, 1.2);
        assert_eq!(buy.symbol, "EURUSD");
        let sell = check(&OrderTicket::market(Side::Sell, "EURUSD", 1.0), &b, 500).unwrap();
        assert_eq!(sell.price, 1.1);
    }

    #[test]
    fn manual_price_wins() {
        let b = QuoteBook::new();
        let o = check(&OrderTicket::market(Side::Buy, "EURUSD", 1.0).with_price(1.05), &b, 500).unwrap();
        assert_eq!(o.price, 1.05);
    }

    #[test]
    fn no_quote_means_price_unavailable() {
        let b = QuoteBook::new();
        assert_eq!(check(&OrderTicket::market(Side::Buy, "EURUSD", 1.0), &b, 500), Err(RiskError::PriceUnavailable));
        let zero = OrderTicket::market(Side::Buy, "EURUSD", 1.0).with_price(0.0);
        assert_eq!(check(&zero, &b, 500), Err(RiskError::PriceUnavailable));
    }

    #[test]
    fn rejects_bad_size_and_leverage() {
        let b = book_with("EURUSD", 1.1, 1.2);
        assert_eq!(check(&OrderTicket::market(Side::Buy, "EURUSD", 0.0), &b, 500), Err(RiskError::InvalidLots));
        assert_eq!(check(&OrderTicket::market(Side::Buy, "EURUSD", f64::NAN), &b, 500), Err(RiskError::InvalidLots));
        let t = OrderTicket::market(Side::Buy, "EURUSD", 1.0).with_leverage(6000);
        assert_eq!(check(&t, &b, 500), Err(RiskError::InvalidLeverage(6000)));
        assert_eq!(check(&OrderTicket::market(Side::Buy, "EURUSD", 1.0), &b, 2000).unwrap().leverage, 2000);
    }
}
