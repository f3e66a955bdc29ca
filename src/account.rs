// ===============================
// src/account.rs (authenticated account event stream)
// ===============================
//
// One socket per session: {WS_BASE}/ws/user/stream/?token=<access>
//
// Message families (tag: `type`, payload: `data`):
//   positions_snapshot                           -> replace positions
//   positions_update                             -> merge one position
//   order_update | position_closed | ledger_entry -> history upsert
//   margin_alert                                 -> alert channel only
// Anything else, or anything unparsable, is logged and dropped.
//
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use url::Url;

use crate::api::{self, ApiError};
use crate::domain::{HistoryPatch, MarginAlert, Position};
use crate::metrics::{ACCOUNT_EVENTS, DROPPED_MESSAGES, MARGIN_ALERTS};
use crate::gateway::Gateway;
use crate::positions::AccountStore;
use crate::session::{SessionStore, TokenKind};
use crate::stream::{self, ReconnectPolicy, StreamHandle};

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("missing access token")]
    MissingCredential,
    #[error("bad stream url: {0}")]
    Url(#[from] url::ParseError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryKind { OrderUpdate, PositionClosed, LedgerEntry }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AccountEvent {
    PositionsSnapshot(Vec<Position>),
    PositionsUpdate(Position),
    History { kind: HistoryKind, row: HistoryPatch },
    MarginAlert(MarginAlert),
}

impl AccountEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            AccountEvent::PositionsSnapshot(_) => "positions_snapshot",
            AccountEvent::PositionsUpdate(_) => "positions_update",
            AccountEvent::History { kind: HistoryKind::OrderUpdate, .. } => "order_update",
            AccountEvent::History { kind: HistoryKind::PositionClosed, .. } => "position_closed",
            AccountEvent::History { kind: HistoryKind::LedgerEntry, .. } => "ledger_entry",
            AccountEvent::MarginAlert(_) => "margin_alert",
        }
    }

    /// Events after which capital figures are likely stale.
    pub fn affects_capital(&self) -> bool { matches!(self, AccountEvent::History { .. }) }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireMessage {
    PositionsSnapshot { #[serde(default)] data: Value },
    PositionsUpdate { #[serde(default)] data: Value },
    OrderUpdate { #[serde(default)] data: Value },
    PositionClosed { #[serde(default)] data: Value },
    LedgerEntry { #[serde(default)] data: Value },
    MarginAlert { #[serde(default)] data: Value },
    #[serde(other)]
    Unknown,
}

fn history(kind: HistoryKind, data: &Value) -> Option<AccountEvent> {
    if !data.is_object() {
        return None;
    }
    HistoryPatch::from_value(data, None).map(|row| AccountEvent::History { kind, row })
}

/// Parse one frame into a normalized event.
pub fn parse_message(text: &str) -> Option<AccountEvent> {
    let msg = match serde_json::from_str::<WireMessage>(text) {
        Ok(m) => m,
        Err(e) => {
            warn!(error = %e, "account stream: unparsable frame");
            return None;
        }
    };
    let ev = match msg {
        WireMessage::PositionsSnapshot { data } => {
            let rows = data.as_array()?;
            let list = rows
                .iter()
                .enumerate()
                .filter(|(_, v)| v.is_object())
                .filter_map(|(i, v)| Position::from_value(v, Some(format!("pos-{i}"))))
                .collect();
            Some(AccountEvent::PositionsSnapshot(list))
        }
        WireMessage::PositionsUpdate { data } => {
            if !data.is_object() {
                return None;
            }
            Position::from_value(&data, None).map(AccountEvent::PositionsUpdate)
        }
        WireMessage::OrderUpdate { data } => history(HistoryKind::OrderUpdate, &data),
        WireMessage::PositionClosed { data } => history(HistoryKind::PositionClosed, &data),
        WireMessage::LedgerEntry { data } => history(HistoryKind::LedgerEntry, &data),
        WireMessage::MarginAlert { data } => Some(AccountEvent::MarginAlert(MarginAlert { data, received_at: Utc::now() })),
        WireMessage::Unknown => {
            debug!("account stream: unrecognized message type");
            None
        }
    };
    if ev.is_none() {
        debug!("account stream: message without usable payload");
    }
    ev
}

pub fn user_stream_url(ws_base: &Url, access: &str) -> Result<Url, url::ParseError> {
    let base = ws_base.as_str().trim_end_matches('/');
    Url::parse(&format!("{}/ws/user/stream/?token={}", base, urlencoding::encode(access)))
}

/// Route one frame: margin alerts to `alerts`, everything else into `account`.
pub fn dispatch(text: &str, account: &AccountStore, alerts: &mpsc::Sender<MarginAlert>) {
    match parse_message(text) {
        Some(AccountEvent::MarginAlert(alert)) => {
            MARGIN_ALERTS.inc();
            if let Err(e) = alerts.try_send(alert) {
                warn!(error = %e, "margin alert dropped");
            }
        }
        Some(ev) => {
            ACCOUNT_EVENTS.with_label_values(&[ev.kind()]).inc();
            account.apply(ev);
        }
        None => DROPPED_MESSAGES.with_label_values(&["account"]).inc(),
    }
}

/// Seed `account` from the bulk order history. Rows already pushed by the
/// stream are merged by id, so either order of arrival ends in one row.
pub async fn load_history(gw: &Gateway, account: &AccountStore) -> Result<usize, ApiError> {
    let raw = api::order_history(gw).await?;
    let rows = api::history_rows(&raw);
    account.merge_history(&rows);
    info!(rows = rows.len(), "order history loaded");
    Ok(rows.len())
}

/// Open the account stream. Fails before any connection attempt when no
/// access token is stored. The token is re-read on every reconnect.
pub fn connect(
    ws_base: &Url,
    store: Arc<dyn SessionStore>,
    account: AccountStore,
    alerts: mpsc::Sender<MarginAlert>,
    policy: ReconnectPolicy,
) -> Result<StreamHandle, StreamError> {
    let access = store.get(TokenKind::Access).ok_or(StreamError::MissingCredential)?;
    user_stream_url(ws_base, &access)?;

    let base = ws_base.clone();
    let make_url = move || {
        let access = store.get(TokenKind::Access)?;
        match user_stream_url(&base, &access) {
            Ok(u) => Some(u),
            Err(e) => {
                warn!(error = %e, "account stream url");
                None
            }
        }
    };
    Ok(stream::spawn(
        "account",
        "user".to_string(),
        policy,
        make_url,
        move |text| dispatch(text, &account, &alerts),
    ))
}
