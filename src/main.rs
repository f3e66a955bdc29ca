// ===============================
// src/main.rs
// ===============================
/*
 # live desk (quotes + account stream + capital), metrics on :9898
 TOKEN_FILE=.tradedesk/session.json cargo run -- login alice s3cret --remember
 cargo run -- watch --symbols EURUSD,USDJPY,XAUUSD

 curl -s localhost:9898/metrics | grep '^ticks_total_by_symbol'
 curl -s localhost:9898/metrics | grep '^account_events_total'
*/
/*
=============================================================================
Project : tradedesk - async client core for a simulated FX/CFD trading desk
Version : 0.1.0
License : MIT (see LICENSE)

Summary : Authenticated REST gateway with one-shot token renewal, live quote
          streams per symbol, an account event stream reconciled into
          positions/history, margin-gated order submission and a capital
          summary cache. Exposes Prometheus metrics and records JSONL events.
=============================================================================
*/
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use thiserror::Error;
use tokio::{
    select,
    sync::{broadcast, mpsc},
    time::{interval, timeout, Duration, Instant, MissedTickBehavior},
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

use tradedesk::account::{self, AccountEvent, StreamError};
use tradedesk::api::{self, ApiError};
use tradedesk::auth::{self, AuthError};
use tradedesk::capital::CapitalCache;
use tradedesk::config::{self, ConfigError, Settings};
use tradedesk::domain::{CapitalSnapshot, Event, Quote, Side};
use tradedesk::feed::{normalize_symbol, MarketData};
use tradedesk::gateway::{Gateway, GatewayError};
use tradedesk::instruments;
use tradedesk::metrics;
use tradedesk::orders::{OrderDesk, OrderError};
use tradedesk::positions::AccountStore;
use tradedesk::recorder;
use tradedesk::risk::OrderTicket;
use tradedesk::session::{FileStore, LayeredStore, SessionStore, StoreError};

const DEFAULT_TOKEN_FILE: &str = ".tradedesk/session.json";

#[derive(Parser, Debug)]
#[command(name = "tradedesk", version, about = "Trading desk client: quotes, account stream, orders")]
struct Cli {
    /// REST base URL (overrides API_BASE)
    #[arg(long, global = true)]
    api_base: Option<String>,

    /// Persistent credential file (overrides TOKEN_FILE)
    #[arg(long, global = true)]
    token_file: Option<PathBuf>,

    /// Prometheus port, 0 disables (overrides METRICS_PORT)
    #[arg(long, global = true)]
    metrics_port: Option<u16>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Authenticate and store the token pair
    Login {
        username: String,
        password: String,
        /// Keep the tokens in the token file instead of this process only
        #[arg(long)]
        remember: bool,
    },
    /// Blacklist the refresh token and wipe stored credentials
    Logout,
    /// Stream quotes, account events and capital until Ctrl-C
    Watch {
        #[arg(long, value_delimiter = ',')]
        symbols: Vec<String>,
        /// Stop after this many seconds
        #[arg(long)]
        seconds: Option<u64>,
    },
    /// Market buy
    Buy(OrderArgs),
    /// Market sell
    Sell(OrderArgs),
    /// Advisory margin / commission / pip value for an order
    Estimate {
        symbol: String,
        lots: f64,
        #[arg(long)]
        leverage: Option<u32>,
    },
    /// Print the capital summary
    Capital,
    /// Print closed-trade history
    History,
    /// Close one open position
    Close {
        position_id: String,
        #[arg(long)]
        price: Option<f64>,
    },
    /// Request a withdrawal
    Withdraw { amount: f64 },
}

#[derive(Args, Debug)]
struct OrderArgs {
    symbol: String,
    lots: f64,
    #[arg(long)]
    leverage: Option<u32>,
    /// Manual price; skips waiting for a live quote
    #[arg(long)]
    price: Option<f64>,
    /// How long to wait for the first quote
    #[arg(long, default_value_t = 5000)]
    wait_ms: u64,
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error("{}", .0.user_message())]
    Order(#[from] OrderError),
    #[error("bad url: {0}")]
    Url(#[from] url::ParseError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
}

struct Ctx {
    settings: Settings,
    store: Arc<LayeredStore>,
    gw: Gateway,
}

impl Ctx {
    fn new(cli: &Cli) -> Result<Self, CliError> {
        let mut settings = config::load()?;
        if let Some(base) = &cli.api_base {
            settings.api_base = Url::parse(base)?;
            settings.ws_base = config::ws_base_from_api(&settings.api_base)?;
        }
        if let Some(path) = &cli.token_file {
            settings.token_file = Some(path.clone());
        }
        if let Some(port) = cli.metrics_port {
            settings.metrics_port = port;
        }

        let token_file = settings.token_file.clone().unwrap_or_else(|| PathBuf::from(DEFAULT_TOKEN_FILE));
        let store = Arc::new(LayeredStore::new(Some(FileStore::open(&token_file)?)));
        let gw = Gateway::new(settings.api_base.clone(), store.clone())?;
        Ok(Self { settings, store, gw })
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // ---- Logging ----
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "command failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let ctx = Ctx::new(&cli)?;
    info!(api = %ctx.settings.api_base, ws = %ctx.settings.ws_base, "startup config");

    match cli.cmd {
        Command::Login { username, password, remember } => {
            auth::login_into(&ctx.gw, &ctx.store, &username, &password, remember).await?;
            if !remember {
                warn!("session-scoped login ends with this process; pass --remember to keep it");
            }
            Ok(())
        }
        Command::Logout => {
            auth::logout(&ctx.gw).await?;
            info!("logged out");
            Ok(())
        }
        Command::Watch { symbols, seconds } => watch(&ctx, symbols, seconds.map(Duration::from_secs)).await,
        Command::Buy(args) => place(&ctx, Side::Buy, args).await,
        Command::Sell(args) => place(&ctx, Side::Sell, args).await,
        Command::Estimate { symbol, lots, leverage } => {
            let mut md = MarketData::new(ctx.settings.ws_base.clone(), ctx.settings.reconnect);
            md.subscribe(&[&symbol])?;
            if wait_for_quote(&md, &symbol, Duration::from_secs(5)).await.is_none() {
                warn!(%symbol, "no live quote, margin shown as zero");
            }
            let desk = OrderDesk::new(ctx.gw.clone(), md.book(), AccountStore::new(), ctx.settings.default_leverage);
            let est = desk.estimate(&symbol, lots, leverage);
            md.unsubscribe().await;
            println!(
                "{} {lots} lots: margin {:.2}  commission {:.2}  pip value {:.2}  spread {}",
                instruments::display_symbol(&normalize_symbol(&symbol)),
                est.margin_required,
                est.commission,
                est.pip_value,
                instruments::format_price(&symbol, est.spread),
            );
            Ok(())
        }
        Command::Capital => {
            let cache = CapitalCache::new(ctx.gw.clone());
            print_capital(&cache.refresh().await);
            Ok(())
        }
        Command::History => {
            let account = AccountStore::new();
            account::load_history(&ctx.gw, &account).await?;
            for row in account.snapshot().history {
                let when = row.closed_at.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".to_string());
                println!("{:<12} {:<10} {:>12.2}  {when}", row.id, row.symbol, row.realized_pnl);
            }
            Ok(())
        }
        Command::Close { position_id, price } => close(&ctx, &position_id, price).await,
        Command::Withdraw { amount } => {
            let resp = api::create_withdrawal(&ctx.gw, amount).await?;
            println!("{}", serde_json::to_string_pretty(&resp)?);
            Ok(())
        }
    }
}

fn print_capital(c: &CapitalSnapshot) {
    println!(
        "balance {:.2}  equity {:.2}  used margin {:.2}  free margin {:.2}  usage {}%",
        c.balance,
        c.equity,
        c.used_margin,
        c.free_margin,
        c.margin_usage_pct()
    );
}

/// First quote for `symbol`, either already in the book or the next one pushed.
async fn wait_for_quote(md: &MarketData, symbol: &str, wait: Duration) -> Option<Quote> {
    let mut rx = md.updates();
    if let Some(q) = md.book().get(symbol) {
        return Some(q);
    }
    let symbol = normalize_symbol(symbol);
    let deadline = Instant::now() + wait;
    loop {
        let left = deadline.checked_duration_since(Instant::now())?;
        match timeout(left, rx.recv()).await {
            Ok(Ok(q)) if q.symbol == symbol => return Some(q),
            Ok(Ok(_)) | Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
            Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => return None,
        }
    }
}

/// Wait for the account stream's first positions snapshot.
async fn wait_for_snapshot(mut events: broadcast::Receiver<AccountEvent>, wait: Duration) -> Result<(), CliError> {
    let deadline = Instant::now() + wait;
    loop {
        let left = deadline
            .checked_duration_since(Instant::now())
            .ok_or(CliError::Timeout("positions snapshot"))?;
        match timeout(left, events.recv()).await {
            Ok(Ok(AccountEvent::PositionsSnapshot(_))) => return Ok(()),
            Ok(Ok(_)) | Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
            Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => {
                return Err(CliError::Timeout("positions snapshot"))
            }
        }
    }
}

async fn place(ctx: &Ctx, side: Side, args: OrderArgs) -> Result<(), CliError> {
    let mut md = MarketData::new(ctx.settings.ws_base.clone(), ctx.settings.reconnect);
    if args.price.is_none() {
        md.subscribe(&[&args.symbol])?;
        if wait_for_quote(&md, &args.symbol, Duration::from_millis(args.wait_ms)).await.is_none() {
            warn!(symbol = %args.symbol, "no quote received in time");
        }
    }

    let desk = OrderDesk::new(ctx.gw.clone(), md.book(), AccountStore::new(), ctx.settings.default_leverage);
    let mut ticket = OrderTicket::market(side, args.symbol.clone(), args.lots);
    if let Some(l) = args.leverage {
        ticket = ticket.with_leverage(l);
    }
    if let Some(p) = args.price {
        ticket = ticket.with_price(p);
    }

    let result = desk.submit(&ticket).await;
    md.unsubscribe().await;
    if let Some(path) = ctx.settings.record_file.clone() {
        let outcome = match &result {
            Ok(_) => "placed",
            Err(e) => e.code(),
        };
        let ev = Event::Order { symbol: normalize_symbol(&ticket.symbol), side, outcome: outcome.to_string() };
        record_one(path, ev).await;
    }
    let conf = result?;
    println!(
        "{} {} {} @ {} (1:{})",
        conf.side.as_str(),
        conf.lots,
        instruments::display_symbol(&conf.symbol),
        instruments::format_price(&conf.symbol, Some(conf.price)),
        conf.leverage
    );
    print_capital(&CapitalCache::new(ctx.gw.clone()).refresh().await);
    Ok(())
}

async fn record_one(path: PathBuf, ev: Event) {
    let (tx, rx) = mpsc::channel(1);
    let task = tokio::spawn(recorder::run(rx, path));
    let _ = tx.send(ev).await;
    drop(tx);
    match task.await {
        Ok(Err(e)) => warn!(error = %e, "could not record order outcome"),
        Err(e) => warn!(error = %e, "recorder task failed"),
        Ok(Ok(())) => {}
    }
}

async fn close(ctx: &Ctx, position_id: &str, price: Option<f64>) -> Result<(), CliError> {
    let account = AccountStore::new();
    let events = account.events();
    let (alert_tx, _alert_rx) = mpsc::channel(16);
    let handle = account::connect(&ctx.settings.ws_base, ctx.store.clone(), account.clone(), alert_tx, ctx.settings.reconnect)?;
    let ready = wait_for_snapshot(events, Duration::from_secs(10)).await;
    let result = match ready {
        Ok(()) => {
            let desk = OrderDesk::new(ctx.gw.clone(), Default::default(), account, ctx.settings.default_leverage);
            desk.close_position(position_id, price).await.map_err(CliError::from)
        }
        Err(e) => Err(e),
    };
    handle.shutdown().await;
    let resp = result?;
    println!("{}", serde_json::to_string_pretty(&resp)?);
    Ok(())
}

async fn watch(ctx: &Ctx, symbols: Vec<String>, limit: Option<Duration>) -> Result<(), CliError> {
    let symbols = if symbols.is_empty() { ctx.settings.symbols.clone() } else { symbols };

    // ---- Metrics ----
    metrics::init();
    tokio::spawn(metrics::serve_metrics(ctx.settings.metrics_port));
    for s in &symbols {
        metrics::CONFIG_SYMBOL.with_label_values(&[normalize_symbol(s).as_str()]).set(1);
    }

    // ---- Recorder (optional) ----
    let (rec_tx, rec_rx) = mpsc::channel::<Event>(8192);
    if let Some(path) = ctx.settings.record_file.clone() {
        tokio::spawn(async move {
            if let Err(e) = recorder::run(rec_rx, path).await {
                error!(error = %e, "recorder stopped");
            }
        });
    }

    // ---- Quotes ----
    let mut md = MarketData::new(ctx.settings.ws_base.clone(), ctx.settings.reconnect);
    md.subscribe(&symbols)?;
    let mut quotes = md.updates();

    // ---- Account stream + capital ----
    let account = AccountStore::new();
    let mut account_events = account.events();
    let (alert_tx, mut alerts) = mpsc::channel(64);
    if ctx.store.has_credentials() {
        if let Err(e) = account::load_history(&ctx.gw, &account).await {
            warn!(error = %e, "order history unavailable");
        }
    }
    let acct_handle = match account::connect(&ctx.settings.ws_base, ctx.store.clone(), account.clone(), alert_tx, ctx.settings.reconnect) {
        Ok(h) => Some(h),
        Err(StreamError::MissingCredential) => {
            warn!("not logged in, account stream disabled");
            None
        }
        Err(e) => return Err(e.into()),
    };

    let capital = CapitalCache::new(ctx.gw.clone());
    let mut capital_rx = capital.subscribe();
    if acct_handle.is_some() {
        capital.refresh().await;
        tokio::spawn(capital.clone().follow(account.events(), Some(Duration::from_secs(60))));
    }

    // ---- Heartbeat loop ----
    let mut heartbeat = interval(Duration::from_secs(1));
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let stop_at = limit.map(|d| Instant::now() + d);
    let mut tick_count: u64 = 0;

    loop {
        select! {
            Ok(q) = quotes.recv() => {
                tick_count += 1;
                let _ = rec_tx.try_send(Event::Quote(q));
            }
            Ok(ev) = account_events.recv() => {
                info!(kind = ev.kind(), "account event");
                let _ = rec_tx.try_send(Event::Account(ev));
            }
            Some(alert) = alerts.recv() => {
                warn!(data = %alert.data, "margin alert");
                let _ = rec_tx.try_send(Event::Account(AccountEvent::MarginAlert(alert)));
            }
            Ok(()) = capital_rx.changed() => {
                let c = *capital_rx.borrow_and_update();
                info!(balance = c.balance, equity = c.equity, usage_pct = c.margin_usage_pct(), "capital");
                let _ = rec_tx.try_send(Event::Capital(c));
            }
            _ = heartbeat.tick() => {
                let st = account.snapshot();
                info!(ticks = tick_count, positions = st.positions.len(), history = st.history.len(), "heartbeat");
                tick_count = 0;
                if stop_at.is_some_and(|t| Instant::now() >= t) {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                let _ = rec_tx.try_send(Event::Note("interrupted".to_string()));
                break;
            }
        }
    }

    md.unsubscribe().await;
    if let Some(h) = acct_handle {
        h.shutdown().await;
    }
    info!("watch stopped");
    Ok(())
}
