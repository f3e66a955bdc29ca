// ===============================
// src/positions.rs (positions & history reconciliation)
// ===============================
//
// Merge rules, all keyed by id (never by position in a list):
// - snapshot : replace every position; incomplete rows are not shown
// - update   : known id -> field merge; unknown id -> insert only if complete
// - history  : known id -> field merge in place; unknown id -> insert at front
//
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};

use crate::account::AccountEvent;
use crate::domain::{HistoryPatch, HistoryRow, Position};
use crate::metrics::POSITIONS_OPEN;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccountState {
    pub positions: Vec<Position>,
    /// Most recent first.
    pub history: Vec<HistoryRow>,
}

impl AccountState {
    pub fn position(&self, id: &str) -> Option<&Position> { self.positions.iter().find(|p| p.id == id) }

    pub fn history_row(&self, id: &str) -> Option<&HistoryRow> { self.history.iter().find(|h| h.id == id) }

    /// Returns whether anything visible changed. Margin alerts never touch state.
    pub fn apply(&mut self, ev: &AccountEvent) -> bool {
        match ev {
            AccountEvent::PositionsSnapshot(list) => self.replace_positions(list),
            AccountEvent::PositionsUpdate(p) => self.upsert_position(p),
            AccountEvent::History { row, .. } => self.upsert_history(row),
            AccountEvent::MarginAlert(_) => false,
        }
    }

    pub fn replace_positions(&mut self, list: &[Position]) -> bool {
        let mut next: Vec<Position> = Vec::with_capacity(list.len());
        for p in list.iter().filter(|p| p.is_complete()) {
            match next.iter_mut().find(|q| q.id == p.id) {
                Some(existing) => existing.merge(p),
                None => next.push(p.clone()),
            }
        }
        if next == self.positions {
            return false;
        }
        self.positions = next;
        true
    }

    pub fn upsert_position(&mut self, patch: &Position) -> bool {
        if let Some(existing) = self.positions.iter_mut().find(|p| p.id == patch.id) {
            let before = existing.clone();
            existing.merge(patch);
            return *existing != before;
        }
        if patch.is_complete() {
            self.positions.push(patch.clone());
            true
        } else {
            false
        }
    }

    pub fn upsert_history(&mut self, patch: &HistoryPatch) -> bool {
        if let Some(existing) = self.history.iter_mut().find(|h| h.id == patch.id) {
            let before = existing.clone();
            existing.merge(patch);
            return *existing != before;
        }
        self.history.insert(0, patch.clone().into_row());
        true
    }

    /// Merge a bulk history listing (already most-recent-first). Known ids are
    /// merged in place, new ids keep the listing's order after existing rows.
    pub fn merge_history(&mut self, rows: &[HistoryPatch]) -> bool {
        let mut changed = false;
        for patch in rows {
            match self.history.iter_mut().find(|h| h.id == patch.id) {
                Some(existing) => {
                    let before = existing.clone();
                    existing.merge(patch);
                    changed |= *existing != before;
                }
                None => {
                    self.history.push(patch.clone().into_row());
                    changed = true;
                }
            }
        }
        changed
    }

    /// Drop a row after the backend confirmed a client-initiated close.
    pub fn remove_position(&mut self, id: &str) -> bool {
        let before = self.positions.len();
        self.positions.retain(|p| p.id != id);
        self.positions.len() != before
    }
}

/// Shared, observable account state. Writers go through `apply`; readers
/// hold a `watch::Receiver` and see every visible change.
#[derive(Clone)]
pub struct AccountStore {
    state: Arc<watch::Sender<AccountState>>,
    events: broadcast::Sender<AccountEvent>,
}

impl Default for AccountStore {
    fn default() -> Self { Self::new() }
}

impl AccountStore {
    pub fn new() -> Self {
        let (state, _rx) = watch::channel(AccountState::default());
        let (events, _) = broadcast::channel(1024);
        Self { state: Arc::new(state), events }
    }

    pub fn subscribe(&self) -> watch::Receiver<AccountState> { self.state.subscribe() }

    /// Normalized events as they were applied (margin alerts excluded).
    pub fn events(&self) -> broadcast::Receiver<AccountEvent> { self.events.subscribe() }

    pub fn snapshot(&self) -> AccountState { self.state.borrow().clone() }

    pub fn apply(&self, ev: AccountEvent) -> bool {
        let changed = self.state.send_if_modified(|s| s.apply(&ev));
        self.publish_gauge();
        let _ = self.events.send(ev);
        changed
    }

    pub fn merge_history(&self, rows: &[HistoryPatch]) -> bool {
        self.state.send_if_modified(|s| s.merge_history(rows))
    }

    pub fn remove_position(&self, id: &str) -> bool {
        let changed = self.state.send_if_modified(|s| s.remove_position(id));
        self.publish_gauge();
        changed
    }

    fn publish_gauge(&self) {
        POSITIONS_OPEN.set(self.state.borrow().positions.len() as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::HistoryKind;
    use crate::domain::Side;
    use serde_json::json;

    fn pos(v: serde_json::Value) -> Position { Position::from_value(&v, None).unwrap() }

    fn complete(id: u32) -> Position {
        pos(json!({"id": id, "symbol": "EURUSD", "side": "Buy", "net_lots": 1.0, "open_price": 1.1, "mark": 1.1}))
    }

    fn hist(v: serde_json::Value) -> AccountEvent {
        AccountEvent::History { kind: HistoryKind::PositionClosed, row: HistoryPatch::from_value(&v, None).unwrap() }
    }

    #[test]
    fn update_is_idempotent() {
        let mut s = AccountState::default();
        s.apply(&AccountEvent::PositionsSnapshot(vec![complete(1)]));
        let upd = AccountEvent::PositionsUpdate(pos(json!({"id": 1, "mark": 1.2345, "unreal_pnl": 12.0})));
        s.apply(&upd);
        let once = s.clone();
        assert!(!s.apply(&upd));
        assert_eq!(s, once);
    }

    #[test]
    fn partial_update_for_unknown_id_is_ignored() {
        let mut s = AccountState::default();
        assert!(!s.apply(&AccountEvent::PositionsUpdate(pos(json!({"id": 5, "symbol": "EURUSD", "side": "Buy", "net_lots": 1})))));
        assert!(!s.apply(&AccountEvent::PositionsUpdate(pos(json!({"id": 6, "symbol": "EURUSD", "side": "Buy", "net_lots": 0, "open_price": 1.1})))));
        assert!(s.positions.is_empty());

        assert!(s.apply(&AccountEvent::PositionsUpdate(complete(7))));
        assert_eq!(s.positions.len(), 1);
    }

    #[test]
    fn partial_update_never_erases_fields() {
        let mut s = AccountState::default();
        s.apply(&AccountEvent::PositionsSnapshot(vec![complete(1)]));
        s.apply(&AccountEvent::PositionsUpdate(pos(json!({"id": 1, "mark": 1.2345}))));
        assert_eq!(s.positions.len(), 1);
        let p = s.position("1").unwrap();
        assert_eq!(p.mark, Some(1.2345));
        assert_eq!(p.open_price, Some(1.1));
        assert_eq!(p.net_lots, Some(1.0));
        assert_eq!(p.side, Some(Side::Buy));
        assert_eq!(p.symbol.as_deref(), Some("EURUSD"));
    }

    #[test]
    fn empty_snapshot_clears_everything() {
        let mut s = AccountState::default();
        s.apply(&AccountEvent::PositionsSnapshot(vec![complete(1), complete(2)]));
        s.apply(&AccountEvent::PositionsUpdate(complete(3)));
        assert_eq!(s.positions.len(), 3);
        assert!(s.apply(&AccountEvent::PositionsSnapshot(vec![])));
        assert!(s.positions.is_empty());
    }

    #[test]
    fn snapshot_filters_incomplete_rows() {
        let mut s = AccountState::default();
        let partial = pos(json!({"id": 2, "symbol": "GBPUSD"}));
        s.apply(&AccountEvent::PositionsSnapshot(vec![complete(1), partial]));
        assert_eq!(s.positions.len(), 1);
        assert_eq!(s.positions[0].id, "1");
    }

    #[test]
    fn history_upsert_keeps_one_row() {
        let mut s = AccountState::default();
        s.apply(&hist(json!({"id": "h1", "symbol": "EURUSD", "realized_pnl": 10.0})));
        s.apply(&hist(json!({"id": "h1", "symbol": "EURUSD", "realized_pnl": 12.5})));
        assert_eq!(s.history.len(), 1);
        assert_eq!(s.history[0].realized_pnl, 12.5);
    }

    #[test]
    fn new_history_goes_to_front() {
        let mut s = AccountState::default();
        s.apply(&hist(json!({"id": "old", "pnl": 1})));
        s.apply(&hist(json!({"id": "new", "pnl": 2})));
        assert_eq!(s.history[0].id, "new");
        assert_eq!(s.history[1].id, "old");
    }

    #[test]
    fn bulk_history_merges_by_id() {
        let mut s = AccountState::default();
        s.apply(&hist(json!({"id": "a", "realized": 5, "symbol": "EURUSD"})));
        let bulk = vec![
            HistoryPatch::from_value(&json!({"id": "a", "realized": 6}), None).unwrap(),
            HistoryPatch::from_value(&json!({"id": "b", "realized": 1}), None).unwrap(),
        ];
        assert!(s.merge_history(&bulk));
        assert_eq!(s.history.len(), 2);
        assert_eq!(s.history_row("a").unwrap().realized_pnl, 6.0);
        assert_eq!(s.history_row("a").unwrap().symbol, "EURUSD");
    }

    #[test]
    fn interleaving_order_does_not_matter_for_distinct_ids() {
        let a = AccountEvent::PositionsUpdate(complete(1));
        let b = hist(json!({"id": "h", "pnl": 3}));
        let mut x = AccountState::default();
        x.apply(&a);
        x.apply(&b);
        let mut y = AccountState::default();
        y.apply(&b);
        y.apply(&a);
        assert_eq!(x, y);
    }

    #[test]
    fn store_notifies_watchers() {
        let store = AccountStore::new();
        let mut rx = store.subscribe();
        assert!(store.apply(AccountEvent::PositionsUpdate(complete(9))));
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().positions.len(), 1);
        assert!(store.remove_position("9"));
        assert!(store.snapshot().positions.is_empty());
    }
}
