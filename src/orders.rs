// ===============================
// src/orders.rs (order submission)
// ===============================
//
// submit():
// 1) local checks + price resolution (no network on failure)
// 2) backend margin check; any failure blocks the order
// 3) order placement
// The resulting position arrives later through the account stream; this
// module never edits positions on submit.
//
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use crate::api::{self, ApiError};
use crate::domain::OrderConfirmation;
use crate::feed::QuoteBook;
use crate::gateway::Gateway;
use crate::instruments::{self, OrderEstimate};
use crate::metrics::ORDERS;
use crate::positions::AccountStore;
use crate::risk::{self, CheckedOrder, OrderTicket, RiskError};

pub const FALLBACK_MESSAGE: &str = "Order submission failed.";

#[derive(Debug, Error, PartialEq)]
pub enum OrderError {
    #[error("price unavailable")]
    PriceUnavailable,
    #[error("invalid lot size")]
    InvalidLots,
    #[error("leverage {0} out of range")]
    InvalidLeverage(u32),
    #[error("margin rejected: {0}")]
    MarginRejected(String),
    #[error("margin check failed")]
    MarginCheckFailed,
    #[error("order rejected: {0}")]
    Rejected(String),
    #[error("transport: {0}")]
    Transport(String),
    #[error("another order is in flight")]
    Busy,
    #[error("unknown position {0}")]
    UnknownPosition(String),
}

impl OrderError {
    pub fn code(&self) -> &'static str {
        match self {
            OrderError::PriceUnavailable => "PRICE_UNAVAILABLE",
            OrderError::InvalidLots => "INVALID_LOTS",
            OrderError::InvalidLeverage(_) => "INVALID_LEVERAGE",
            OrderError::MarginRejected(_) => "MARGIN_REJECTED",
            OrderError::MarginCheckFailed => "MARGIN_CHECK_FAILED",
            OrderError::Rejected(_) => "ORDER_REJECTED",
            OrderError::Transport(_) => "TRANSPORT",
            OrderError::Busy => "BUSY",
            OrderError::UnknownPosition(_) => "UNKNOWN_POSITION",
        }
    }

    /// Text shown inline next to the order form.
    pub fn user_message(&self) -> String {
        match self {
            OrderError::PriceUnavailable => "Current price unavailable for execution.".to_string(),
            OrderError::InvalidLots => "Enter a valid volume greater than zero.".to_string(),
            OrderError::InvalidLeverage(l) => format!(
                "Leverage 1:{l} is outside 1:{}..1:{}.",
                risk::MIN_LEVERAGE,
                risk::MAX_LEVERAGE
            ),
            OrderError::MarginRejected(reason) => format!("Order blocked: {reason}"),
            OrderError::MarginCheckFailed => "Margin check failed.".to_string(),
            OrderError::Rejected(reason) if !reason.is_empty() => reason.clone(),
            OrderError::Busy => "An order is already being submitted.".to_string(),
            OrderError::UnknownPosition(id) => format!("Position {id} is not open."),
            _ => FALLBACK_MESSAGE.to_string(),
        }
    }
}

impl From<RiskError> for OrderError {
    fn from(e: RiskError) -> Self {
        match e {
            RiskError::PriceUnavailable => OrderError::PriceUnavailable,
            RiskError::InvalidLots => OrderError::InvalidLots,
            RiskError::InvalidLeverage(l) => OrderError::InvalidLeverage(l),
        }
    }
}

fn placement_error(e: ApiError) -> OrderError {
    match e {
        ApiError::Status { message, .. } => OrderError::Rejected(message),
        ApiError::Invalid(message) => OrderError::Rejected(message),
        other => OrderError::Transport(other.to_string()),
    }
}

/// Clears the in-flight flag when the submission ends, however it ends.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) { self.0.store(false, Ordering::Release); }
}

#[derive(Clone)]
pub struct OrderDesk {
    gw: Gateway,
    book: QuoteBook,
    account: AccountStore,
    default_leverage: u32,
    busy: Arc<AtomicBool>,
}

impl OrderDesk {
    pub fn new(gw: Gateway, book: QuoteBook, account: AccountStore, default_leverage: u32) -> Self {
        Self { gw, book, account, default_leverage, busy: Arc::new(AtomicBool::new(false)) }
    }

    pub fn in_flight(&self) -> bool { self.busy.load(Ordering::Acquire) }

    pub fn default_leverage(&self) -> u32 { self.default_leverage }

    /// Advisory figures for the order form, priced off the live ask.
    pub fn estimate(&self, symbol: &str, lots: f64, leverage: Option<u32>) -> OrderEstimate {
        let quote = self.book.get(symbol);
        instruments::estimate(
            symbol,
            lots,
            quote.as_ref().map(|q| q.ask),
            leverage.unwrap_or(self.default_leverage),
            quote.as_ref().map(|q| q.spread()),
        )
    }

    pub async fn submit(&self, ticket: &OrderTicket) -> Result<OrderConfirmation, OrderError> {
        if self.busy.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            return Err(OrderError::Busy);
        }
        let _guard = InFlight(self.busy.as_ref());

        let result = self.submit_inner(ticket).await;
        let outcome = match &result {
            Ok(_) => "placed",
            Err(e) => {
                warn!(symbol = %ticket.symbol, side = ticket.side.as_str(), code = e.code(), error = %e, "order not placed");
                e.code()
            }
        };
        ORDERS.with_label_values(&[outcome]).inc();
        result
    }

    async fn submit_inner(&self, ticket: &OrderTicket) -> Result<OrderConfirmation, OrderError> {
        let order = risk::check(ticket, &self.book, self.default_leverage)?;
        self.margin_gate(&order).await?;

        let CheckedOrder { symbol, side, lots, price, leverage } = order;
        let response = api::place_fill(&self.gw, &symbol, side, lots, price, leverage)
            .await
            .map_err(placement_error)?;
        info!(%symbol, side = side.as_str(), lots, price, leverage, "order placed");
        Ok(OrderConfirmation { symbol, side, lots, price, leverage, response })
    }

    async fn margin_gate(&self, order: &CheckedOrder) -> Result<(), OrderError> {
        match api::margin_check(&self.gw, &order.symbol, order.lots, order.price, order.leverage).await {
            Ok(_) => Ok(()),
            Err(ApiError::Status { status, message }) => {
                info!(symbol = %order.symbol, %status, reason = %message, "margin check rejected order");
                Err(OrderError::MarginRejected(message))
            }
            Err(e) => {
                warn!(symbol = %order.symbol, error = %e, "margin check failed");
                Err(OrderError::MarginCheckFailed)
            }
        }
    }

    /// Close one open position at `exit_price` (defaults to mark, then open
    /// price). The row is removed only after the backend confirms.
    pub async fn close_position(&self, position_id: &str, exit_price: Option<f64>) -> Result<Value, OrderError> {
        let pos = self
            .account
            .snapshot()
            .position(position_id)
            .cloned()
            .ok_or_else(|| OrderError::UnknownPosition(position_id.to_string()))?;
        let price = exit_price
            .or(pos.mark.filter(|m| *m != 0.0))
            .or(pos.open_price)
            .filter(|p| p.is_finite() && *p > 0.0)
            .ok_or(OrderError::PriceUnavailable)?;

        let resp = api::exit_position(&self.gw, position_id, price)
            .await
            .map_err(placement_error)?;
        self.account.remove_position(position_id);
        info!(%position_id, price, "position closed");
        Ok(resp)
    }

    /// Close by symbol (optionally partial). State follows from the stream.
    pub async fn close_symbol(&self, symbol: &str, lots: Option<f64>) -> Result<Value, OrderError> {
        api::close_symbol(&self.gw, symbol, lots).await.map_err(placement_error)
    }
}
