// ===============================
// src/capital.rs (capital summary cache)
// ===============================
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::account::AccountEvent;
use crate::api;
use crate::domain::CapitalSnapshot;
use crate::gateway::Gateway;
use crate::metrics::CAPITAL_REFRESH;

/// Holds the single capital snapshot of the session. Every refresh replaces
/// it wholesale; a failed refresh resets it to zeros.
#[derive(Clone)]
pub struct CapitalCache {
    gw: Gateway,
    tx: Arc<watch::Sender<CapitalSnapshot>>,
}

impl CapitalCache {
    pub fn new(gw: Gateway) -> Self {
        let (tx, _rx) = watch::channel(CapitalSnapshot::default());
        Self { gw, tx: Arc::new(tx) }
    }

    pub fn current(&self) -> CapitalSnapshot { *self.tx.borrow() }

    pub fn subscribe(&self) -> watch::Receiver<CapitalSnapshot> { self.tx.subscribe() }

    pub async fn refresh(&self) -> CapitalSnapshot {
        let next = match api::capital(&self.gw).await {
            Ok(c) => {
                CAPITAL_REFRESH.with_label_values(&["ok"]).inc();
                debug!(balance = c.balance, equity = c.equity, "capital refreshed");
                c
            }
            Err(e) => {
                CAPITAL_REFRESH.with_label_values(&["error"]).inc();
                warn!(error = %e, "capital refresh failed, showing zeros");
                CapitalSnapshot::default()
            }
        };
        self.tx.send_replace(next);
        next
    }

    /// Refresh whenever the account stream reports a closure or ledger entry,
    /// plus every `every` as a safety net. Ends when the event stream closes.
    pub async fn follow(self, mut events: broadcast::Receiver<AccountEvent>, every: Option<Duration>) {
        let mut tick = interval(every.unwrap_or(Duration::from_secs(3600)));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tick.tick().await;
        loop {
            tokio::select! {
                ev = events.recv() => match ev {
                    Ok(ev) if ev.affects_capital() => { self.refresh().await; }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!(skipped = n, "capital follower lagged, refreshing");
                        self.refresh().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("account events closed, capital follower stopped");
                        return;
                    }
                },
                _ = tick.tick(), if every.is_some() => { self.refresh().await; }
            }
        }
    }
}
