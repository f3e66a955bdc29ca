// ===============================
// src/api.rs (typed REST endpoints)
// ===============================
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::domain::{CapitalSnapshot, HistoryPatch, Side};
use crate::gateway::{ApiRequest, Gateway, GatewayError};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error("{message}")]
    Status { status: StatusCode, message: String },
    #[error("unexpected response body: {0}")]
    Decode(String),
    #[error("{0}")]
    Invalid(String),
}

impl ApiError {
    pub fn status(&self) -> Option<StatusCode> {
        match self { ApiError::Status { status, .. } => Some(*status), _ => None }
    }
}

/// Pull a human readable message out of an error body.
pub fn error_message(body: &str, fallback: &str) -> String {
    if let Ok(v) = serde_json::from_str::<Value>(body) {
        for key in ["detail", "message", "error"] {
            if let Some(s) = v.get(key).and_then(|m| m.as_str()).filter(|s| !s.is_empty()) {
                return s.to_string();
            }
        }
        // DRF field errors: {"old_password": ["Wrong password."]}
        if let Some(obj) = v.as_object() {
            for val in obj.values() {
                if let Some(s) = val.as_array().and_then(|a| a.first()).and_then(|m| m.as_str()) {
                    return s.to_string();
                }
            }
        }
        return fallback.to_string();
    }
    let trimmed = body.trim();
    if trimmed.is_empty() { fallback.to_string() } else { trimmed.to_string() }
}

/// Trading endpoints put their reason in `error`. `None` when the body is
/// not JSON at all (proxy pages, truncated replies).
pub fn rejection_reason(body: &str, fallback: &str) -> Option<String> {
    let v: Value = serde_json::from_str(body).ok()?;
    match v.get("error").and_then(Value::as_str).filter(|s| !s.is_empty()) {
        Some(reason) => Some(reason.to_string()),
        None => Some(error_message(body, fallback)),
    }
}

fn decode<T: DeserializeOwned>(body: &str) -> Result<T, ApiError> {
    let raw = if body.trim().is_empty() { "null" } else { body };
    serde_json::from_str(raw).map_err(|e| ApiError::Decode(e.to_string()))
}

/// Map a response to `T`, or to `ApiError::Status` with the backend message.
pub async fn read_json<T: DeserializeOwned>(resp: Response, fallback: &str) -> Result<T, ApiError> {
    let status = resp.status();
    let body = resp.text().await.map_err(GatewayError::from)?;
    if !status.is_success() {
        return Err(ApiError::Status { status, message: error_message(&body, fallback) });
    }
    decode(&body)
}

/// Like `read_json`, but the reason comes from `error` first and an error
/// body that is not JSON surfaces as `ApiError::Decode`.
async fn read_rejection<T: DeserializeOwned>(resp: Response, fallback: &str) -> Result<T, ApiError> {
    let status = resp.status();
    let body = resp.text().await.map_err(GatewayError::from)?;
    if !status.is_success() {
        return Err(match rejection_reason(&body, fallback) {
            Some(message) => ApiError::Status { status, message },
            None => ApiError::Decode(format!("{status} with unreadable body")),
        });
    }
    decode(&body)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub page: u32,
    pub page_size: u32,
    pub items: Vec<T>,
    pub count: Option<u64>,
}

/// Paginated endpoints return either a bare list or `{count, results}`.
fn into_page(v: Value, page: u32, page_size: u32) -> Page<Value> {
    match v {
        Value::Array(items) => Page { page, page_size, count: Some(items.len() as u64), items },
        Value::Object(mut obj) => {
            let count = obj.get("count").and_then(|c| c.as_u64());
            let items = match obj.remove("results") {
                Some(Value::Array(items)) => items,
                _ => Vec::new(),
            };
            Page { page, page_size, items, count }
        }
        _ => Page { page, page_size, items: Vec::new(), count: Some(0) },
    }
}

// ---- profile ----

pub async fn get_me(gw: &Gateway) -> Result<Value, ApiError> {
    let resp = gw.request(&ApiRequest::get("/api/me/")).await?;
    read_json(resp, "Failed to load profile").await
}

pub async fn update_me(gw: &Gateway, patch: Value) -> Result<Value, ApiError> {
    let resp = gw.request(&ApiRequest::patch("/api/me/").json(patch)).await?;
    read_json(resp, "Failed to update profile").await
}

pub async fn change_password(gw: &Gateway, old_password: &str, new_password: &str) -> Result<Value, ApiError> {
    let req = ApiRequest::post("/api/me/change_password/")
        .json(json!({ "old_password": old_password, "new_password": new_password }));
    let resp = gw.request(&req).await?;
    read_json(resp, "Password change failed").await
}

// ---- KYC ----

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KycStatus {
    #[serde(default)]
    pub status: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl KycStatus {
    pub fn is_approved(&self) -> bool { self.status.eq_ignore_ascii_case("approved") }
}

pub async fn kyc_status(gw: &Gateway) -> Result<KycStatus, ApiError> {
    let resp = gw.request(&ApiRequest::get("/api/kyc/status/")).await?;
    read_json(resp, "Failed to fetch KYC status").await
}

// ---- deposits / withdrawals ----

pub async fn deposit_methods(gw: &Gateway) -> Result<Value, ApiError> {
    let req = ApiRequest::get("/api/deposit/crypto-methods/").query("online", 1);
    let resp = gw.request(&req).await?;
    read_json(resp, "Failed to fetch deposit methods").await
}

pub async fn create_upi_request(gw: &Gateway, amount: f64, payer_vpa: &str, note: Option<&str>) -> Result<Value, ApiError> {
    positive_amount(amount)?;
    let req = ApiRequest::post("/api/deposit/upi/request/")
        .json(json!({ "amount": amount, "payer_vpa": payer_vpa, "note": note }));
    let resp = gw.request(&req).await?;
    read_json(resp, "Failed to create UPI request").await
}

pub async fn list_upi_requests(gw: &Gateway, page: u32, page_size: u32) -> Result<Page<Value>, ApiError> {
    let req = ApiRequest::get("/api/deposit/upi/requests/")
        .query("page", page)
        .query("page_size", page_size);
    let resp = gw.request(&req).await?;
    let v: Value = read_json(resp, "Failed to load UPI requests").await?;
    Ok(into_page(v, page, page_size))
}

pub async fn create_withdrawal(gw: &Gateway, amount: f64) -> Result<Value, ApiError> {
    positive_amount(amount)?;
    let req = ApiRequest::post("/api/withdrawals/").json(json!({ "amount": amount }));
    let resp = gw.request(&req).await?;
    read_json(resp, "Failed to create withdrawal request").await
}

pub async fn list_withdrawals(gw: &Gateway, page: u32, page_size: u32) -> Result<Page<Value>, ApiError> {
    let req = ApiRequest::get("/api/withdrawals/")
        .query("page", page)
        .query("page_size", page_size);
    let resp = gw.request(&req).await?;
    let v: Value = read_json(resp, "Failed to load withdrawals").await?;
    Ok(into_page(v, page, page_size))
}

pub async fn get_withdrawal(gw: &Gateway, id: &str) -> Result<Value, ApiError> {
    let path = format!("/api/withdrawals/{}/", urlencoding::encode(id));
    let resp = gw.request(&ApiRequest::get(path)).await?;
    read_json(resp, "Failed to load withdrawal").await
}

fn positive_amount(amount: f64) -> Result<(), ApiError> {
    if amount.is_finite() && amount > 0.0 {
        Ok(())
    } else {
        Err(ApiError::Invalid("Enter a valid amount greater than zero.".to_string()))
    }
}

// ---- trading ----

pub async fn capital(gw: &Gateway) -> Result<CapitalSnapshot, ApiError> {
    let resp = gw.request(&ApiRequest::get("/api/capital/")).await?;
    read_json(resp, "Failed to fetch capital").await
}

/// Pre-trade margin check. Any non-2xx status is a rejection; the reason is
/// the backend's `error` field when present.
pub async fn margin_check(gw: &Gateway, symbol: &str, lots: f64, price: f64, leverage: u32) -> Result<Value, ApiError> {
    let req = ApiRequest::post("/api/margin/check")
        .json(json!({ "symbol": symbol, "lots": lots, "price": price, "leverage": leverage }));
    let resp = gw.request(&req).await?;
    read_rejection(resp, "margin check failed").await
}

pub async fn place_fill(gw: &Gateway, symbol: &str, side: Side, lots: f64, price: f64, leverage: u32) -> Result<Value, ApiError> {
    let req = ApiRequest::post("/api/sim/fill").json(json!({
        "symbol": symbol,
        "side": side.as_str(),
        "lots": lots,
        "price": price,
        "leverage": leverage,
    }));
    let resp = gw.request(&req).await?;
    read_json(resp, "Order rejected").await
}

pub async fn close_symbol(gw: &Gateway, symbol: &str, lots: Option<f64>) -> Result<Value, ApiError> {
    let body = match lots {
        Some(l) => json!({ "symbol": symbol, "lots": l }),
        None => json!({ "symbol": symbol }),
    };
    let resp = gw.request(&ApiRequest::post("/api/positions/close").json(body)).await?;
    read_json(resp, "Close rejected").await
}

pub async fn exit_position(gw: &Gateway, position_id: &str, exit_price: f64) -> Result<Value, ApiError> {
    let req = ApiRequest::post("/api/exit_position/")
        .json(json!({ "position_id": position_id, "exit_price": exit_price }));
    let resp = gw.request(&req).await?;
    let status = resp.status();
    let body = resp.text().await.map_err(GatewayError::from)?;
    if !status.is_success() {
        let fallback = "Failed to exit position";
        let message = rejection_reason(&body, fallback).unwrap_or_else(|| fallback.to_string());
        return Err(ApiError::Status { status, message });
    }
    decode(&body)
}

pub async fn list_orders(gw: &Gateway, symbol: Option<&str>) -> Result<Value, ApiError> {
    let mut req = ApiRequest::get("/api/orders");
    if let Some(s) = symbol {
        req = req.query("symbol", s);
    }
    let resp = gw.request(&req).await?;
    read_json(resp, "Orders fetch failed").await
}

pub async fn list_fills(gw: &Gateway, symbol: Option<&str>) -> Result<Value, ApiError> {
    let mut req = ApiRequest::get("/api/fills");
    if let Some(s) = symbol {
        req = req.query("symbol", s);
    }
    let resp = gw.request(&req).await?;
    read_json(resp, "Fills fetch failed").await
}

pub async fn order_history(gw: &Gateway) -> Result<Value, ApiError> {
    let resp = gw.request(&ApiRequest::get("/api/orderhistory/")).await?;
    read_json(resp, "Order history fetch failed").await
}

pub async fn admin_trades(gw: &Gateway) -> Result<Value, ApiError> {
    let resp = gw.request(&ApiRequest::get("/api/admin_trades/")).await?;
    read_json(resp, "Failed to load admin trades").await
}

/// Normalize a bulk history listing. Rows without an id get `hist-<index>`.
pub fn history_rows(v: &Value) -> Vec<HistoryPatch> {
    v.as_array()
        .map(|rows| {
            rows.iter()
                .enumerate()
                .filter_map(|(i, r)| HistoryPatch::from_value(r, Some(format!("hist-{i}"))))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_message_prefers_detail_then_message() {
        assert_eq!(error_message(r#"{"detail":"nope","message":"x"}"#, "fb"), "nope");
        assert_eq!(error_message(r#"{"message":"bad"}"#, "fb"), "bad");
        assert_eq!(error_message(r#"{"error":"Insufficient free margin"}"#, "fb"), "Insufficient free margin");
        assert_eq!(error_message(r#"{"old_password":["Wrong password."]}"#, "fb"), "Wrong password.");
        assert_eq!(error_message("plain failure", "fb"), "plain failure");
        assert_eq!(error_message("   ", "fb"), "fb");
        assert_eq!(error_message("{}", "fb"), "fb");
    }

    #[test]
    fn rejection_reason_reads_error_first() {
        let body = r#"{"detail":"Bad request","error":"Insufficient free margin"}"#;
        assert_eq!(rejection_reason(body, "fb").as_deref(), Some("Insufficient free margin"));
        assert_eq!(rejection_reason(r#"{"detail":"Market closed"}"#, "fb").as_deref(), Some("Market closed"));
        assert_eq!(rejection_reason(r#"{"error":""}"#, "fb").as_deref(), Some("fb"));
        assert_eq!(rejection_reason("<html>502 Bad Gateway</html>", "fb"), None);
    }

    #[test]
    fn pages_accept_list_or_envelope() {
        let p = into_page(json!([{"id": 1}, {"id": 2}]), 1, 10);
        assert_eq!(p.items.len(), 2);
        let p = into_page(json!({"count": 31, "results": [{"id": 1}]}), 2, 10);
        assert_eq!(p.count, Some(31));
        assert_eq!(p.items.len(), 1);
    }

    #[test]
    fn bulk_history_gets_fallback_ids() {
        let rows = history_rows(&json!([{"symbol": "eurusd", "realized": 3.5}, {"ref": "x9", "pnl": -1}]));
        assert_eq!(rows[0].id, "hist-0");
        assert_eq!(rows[1].id, "x9");
        assert_eq!(rows[1].realized_pnl, Some(-1.0));
        assert!(history_rows(&json!({"not": "a list"})).is_empty());
    }

    #[test]
    fn invalid_amount_is_rejected_locally() {
        assert!(positive_amount(0.0).is_err());
        assert!(positive_amount(f64::NAN).is_err());
        assert!(positive_amount(10.0).is_ok());
    }
}
