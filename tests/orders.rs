mod common;

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;

use common::MockBackend;
use tradedesk::account::AccountEvent;
use tradedesk::domain::{Position, Quote, Side};
use tradedesk::feed::QuoteBook;
use tradedesk::gateway::Gateway;
use tradedesk::orders::{OrderDesk, OrderError};
use tradedesk::positions::AccountStore;
use tradedesk::risk::OrderTicket;
use tradedesk::session::MemoryStore;

fn eurusd_book() -> QuoteBook {
    let book = QuoteBook::new();
    book.put(Quote { symbol: "EURUSD".into(), bid: 1.08410, ask: 1.08430, last: 1.08420, change_pct: None, ts: Utc::now() });
    book
}

fn desk(backend: &MockBackend, book: QuoteBook, account: AccountStore) -> OrderDesk {
    let gw = Gateway::new(backend.base_url(), Arc::new(MemoryStore::with_tokens(Some("a"), Some("r")))).unwrap();
    OrderDesk::new(gw, book, account, 500)
}

#[tokio::test]
async fn margin_rejection_blocks_the_order() {
    let backend = MockBackend::spawn().await;
    backend.state.route("POST", "/api/margin/check", |_| (400, json!({ "error": "Insufficient free margin" })));
    backend.state.route("POST", "/api/sim/fill", |_| (200, json!({ "ok": true })));
    let desk = desk(&backend, eurusd_book(), AccountStore::new());

    let err = desk.submit(&OrderTicket::market(Side::Buy, "EURUSD", 1.0)).await.unwrap_err();
    assert_eq!(err, OrderError::MarginRejected("Insufficient free margin".into()));
    assert_eq!(err.code(), "MARGIN_REJECTED");
    assert_eq!(err.user_message(), "Order blocked: Insufficient free margin");
    assert_eq!(backend.state.hits("/api/sim/fill"), 0);

    let check = backend.state.last("/api/margin/check").unwrap();
    assert_eq!(check.body["symbol"], "EURUSD");
    assert_eq!(check.body["price"], 1.0843);
    assert_eq!(check.body["leverage"], 500);
    assert!(!desk.in_flight());
}

#[tokio::test]
async fn margin_reason_comes_from_the_error_field() {
    let backend = MockBackend::spawn().await;
    backend.state.route("POST", "/api/margin/check", |_| {
        (400, json!({ "detail": "Bad request", "error": "Insufficient free margin" }))
    });
    let desk = desk(&backend, eurusd_book(), AccountStore::new());

    let err = desk.submit(&OrderTicket::market(Side::Buy, "EURUSD", 1.0)).await.unwrap_err();
    assert_eq!(err.user_message(), "Order blocked: Insufficient free margin");
    assert_eq!(backend.state.hits("/api/sim/fill"), 0);
}

#[tokio::test]
async fn unreadable_margin_error_body_is_a_failed_check() {
    let backend = MockBackend::spawn().await;
    backend.state.route("POST", "/api/margin/check", |_| (502, json!("<html><body>502 Bad Gateway</body></html>")));
    let desk = desk(&backend, eurusd_book(), AccountStore::new());

    let err = desk.submit(&OrderTicket::market(Side::Buy, "EURUSD", 1.0)).await.unwrap_err();
    assert_eq!(err, OrderError::MarginCheckFailed);
    assert_eq!(err.user_message(), "Margin check failed.");
    assert_eq!(backend.state.hits("/api/sim/fill"), 0);
}

#[tokio::test]
async fn missing_price_makes_no_network_call() {
    let backend = MockBackend::spawn().await;
    let desk = desk(&backend, QuoteBook::new(), AccountStore::new());

    let err = desk.submit(&OrderTicket::market(Side::Sell, "GBPUSD", 0.5)).await.unwrap_err();
    assert_eq!(err.code(), "PRICE_UNAVAILABLE");
    assert_eq!(err.user_message(), "Current price unavailable for execution.");
    assert!(backend.state.requests().is_empty());
}

#[tokio::test]
async fn unreachable_margin_check_blocks_with_generic_message() {
    let gw = Gateway::new("http://127.0.0.1:1".parse().unwrap(), Arc::new(MemoryStore::new())).unwrap();
    let desk = OrderDesk::new(gw, eurusd_book(), AccountStore::new(), 500);

    let err = desk.submit(&OrderTicket::market(Side::Buy, "EURUSD", 1.0)).await.unwrap_err();
    assert_eq!(err, OrderError::MarginCheckFailed);
    assert_eq!(err.user_message(), "Margin check failed.");
}

#[tokio::test]
async fn accepted_order_is_placed_at_the_side_price() {
    let backend = MockBackend::spawn().await;
    backend.state.route("POST", "/api/margin/check", |_| (200, json!({ "ok": true, "required": 216.86 })));
    backend.state.route("POST", "/api/sim/fill", |_| (201, json!({ "order_id": 7 })));
    let account = AccountStore::new();
    let desk = desk(&backend, eurusd_book(), account.clone());

    let ticket = OrderTicket::market(Side::Sell, "eurusd", 0.25).with_leverage(1000);
    let conf = desk.submit(&ticket).await.unwrap();
    assert_eq!(conf.price, 1.0841);
    assert_eq!(conf.leverage, 1000);
    assert_eq!(conf.response["order_id"], 7);

    let fill = backend.state.last("/api/sim/fill").unwrap();
    assert_eq!(fill.body["side"], "Sell");
    assert_eq!(fill.body["symbol"], "EURUSD");
    assert_eq!(fill.body["lots"], 0.25);
    // positions only ever come from the account stream
    assert!(account.snapshot().positions.is_empty());
}

#[tokio::test]
async fn placement_rejection_uses_backend_text_or_fallback() {
    let backend = MockBackend::spawn().await;
    backend.state.route("POST", "/api/margin/check", |_| (200, json!({})));
    backend.state.route("POST", "/api/sim/fill", |_| (400, json!({ "detail": "Market closed" })));
    let desk = desk(&backend, eurusd_book(), AccountStore::new());

    let err = desk.submit(&OrderTicket::market(Side::Buy, "EURUSD", 1.0)).await.unwrap_err();
    assert_eq!(err.code(), "ORDER_REJECTED");
    assert_eq!(err.user_message(), "Market closed");
}

#[tokio::test]
async fn close_removes_the_row_only_after_success() {
    let backend = MockBackend::spawn().await;
    backend.state.route("POST", "/api/exit_position/", |_| {
        (400, json!({ "detail": "Bad request", "error": "Position is locked" }))
    });
    let account = AccountStore::new();
    let pos = Position::from_value(
        &json!({ "id": 1, "symbol": "EURUSD", "side": "Buy", "net_lots": 1.0, "open_price": 1.1, "mark": 1.2345 }),
        None,
    )
    .unwrap();
    account.apply(AccountEvent::PositionsSnapshot(vec![pos]));
    let desk = desk(&backend, QuoteBook::new(), account.clone());

    let err = desk.close_position("1", None).await.unwrap_err();
    assert_eq!(err.user_message(), "Position is locked");
    assert_eq!(account.snapshot().positions.len(), 1);
    assert_eq!(backend.state.last("/api/exit_position/").unwrap().body["exit_price"], 1.2345);

    backend.state.route("POST", "/api/exit_position/", |_| (200, json!({ "ok": true })));
    desk.close_position("1", Some(1.25)).await.unwrap();
    assert!(account.snapshot().positions.is_empty());
    assert_eq!(backend.state.last("/api/exit_position/").unwrap().body["exit_price"], 1.25);

    let err = desk.close_position("1", None).await.unwrap_err();
    assert_eq!(err, OrderError::UnknownPosition("1".into()));
}
