// ===============================
// tests/common/mod.rs (in-process mock backend)
// ===============================
//
// MockBackend      : hyper REST server, scripted per (method, path), records
//                    every request it sees.
// MockStreamServer : tokio-tungstenite push server, remembers each
//                    connection's path+query and lets tests push frames to
//                    every live socket on a path.
//
#![allow(dead_code)]

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use ahash::AHashMap as HashMap;
use futures_util::{SinkExt, StreamExt};
use hyper::body::to_bytes;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration, Instant};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{Request as WsRequest, Response as WsResponse};
use tokio_tungstenite::tungstenite::Message;
use url::Url;

// ---------------------------------------------------------------- REST

#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub auth: Option<String>,
    pub body: Value,
}

impl Recorded {
    pub fn bearer(&self) -> Option<&str> { self.auth.as_deref().and_then(|a| a.strip_prefix("Bearer ")) }
}

type Handler = Arc<dyn Fn(&Recorded) -> (u16, Value) + Send + Sync>;

#[derive(Clone, Default)]
pub struct BackendState {
    routes: Arc<Mutex<HashMap<(String, String), Handler>>>,
    requests: Arc<Mutex<Vec<Recorded>>>,
}

impl BackendState {
    /// Install (or replace) the handler for `method path`.
    pub fn route<F>(&self, method: &str, path: &str, f: F)
    where
        F: Fn(&Recorded) -> (u16, Value) + Send + Sync + 'static,
    {
        self.routes
            .lock()
            .unwrap()
            .insert((method.to_ascii_uppercase(), path.to_string()), Arc::new(f));
    }

    pub fn requests(&self) -> Vec<Recorded> { self.requests.lock().unwrap().clone() }

    pub fn hits(&self, path: &str) -> usize { self.requests().iter().filter(|r| r.path == path).count() }

    pub fn last(&self, path: &str) -> Option<Recorded> {
        self.requests().into_iter().rev().find(|r| r.path == path)
    }
}

async fn route(req: Request<Body>, state: BackendState) -> Response<Body> {
    let method = req.method().as_str().to_string();
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(str::to_string);
    let auth = req
        .headers()
        .get(hyper::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let bytes = to_bytes(req.into_body()).await.unwrap_or_default();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    let rec = Recorded { method: method.clone(), path: path.clone(), query, auth, body };
    state.requests.lock().unwrap().push(rec.clone());

    let handler = state.routes.lock().unwrap().get(&(method, path)).cloned();
    let (status, payload) = match handler {
        Some(h) => h(&rec),
        None => (404, serde_json::json!({ "detail": "Not found." })),
    };
    // a bare string payload is sent as-is, like a proxy error page
    let (content_type, text) = match payload {
        Value::String(raw) => ("text/html", raw),
        other => ("application/json", other.to_string()),
    };
    Response::builder()
        .status(StatusCode::from_u16(status).unwrap())
        .header("Content-Type", content_type)
        .body(Body::from(text))
        .unwrap()
}

pub struct MockBackend {
    addr: SocketAddr,
    pub state: BackendState,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl MockBackend {
    pub async fn spawn() -> Self {
        let state = BackendState::default();
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let std_listener = listener.into_std().unwrap();
        std_listener.set_nonblocking(true).unwrap();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let svc_state = state.clone();
        let make_svc = make_service_fn(move |_| {
            let state = svc_state.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req| {
                    let state = state.clone();
                    async move { Ok::<_, Infallible>(route(req, state).await) }
                }))
            }
        });
        let server = Server::from_tcp(std_listener).unwrap().serve(make_svc);
        let handle = tokio::spawn(async move {
            let _ = server
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
        });
        Self { addr, state, shutdown_tx: Some(shutdown_tx), handle }
    }

    pub fn base_url(&self) -> Url { Url::parse(&format!("http://{}", self.addr)).unwrap() }
}

impl Drop for MockBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.handle.abort();
    }
}

// ---------------------------------------------------------------- push streams

struct Conn {
    path: String,
    tx: mpsc::UnboundedSender<Message>,
}

#[derive(Default)]
struct StreamInner {
    /// path + query of every accepted connection, in order
    seen: Vec<String>,
    live: Vec<Conn>,
    greetings: HashMap<String, Vec<String>>,
}

#[derive(Clone, Default)]
pub struct StreamState {
    inner: Arc<Mutex<StreamInner>>,
}

impl StreamState {
    /// Frames sent to every new connection on `path` right after the handshake.
    pub fn on_connect(&self, path: &str, frames: Vec<String>) {
        self.inner.lock().unwrap().greetings.insert(path.to_string(), frames);
    }

    /// Push one text frame to every live socket on `path`. Returns how many got it.
    pub fn push(&self, path: &str, text: &str) -> usize {
        let inner = self.inner.lock().unwrap();
        inner
            .live
            .iter()
            .filter(|c| c.path == path && !c.tx.is_closed())
            .filter(|c| c.tx.send(Message::Text(text.to_string())).is_ok())
            .count()
    }

    /// Server-side close of every socket on `path`.
    pub fn kick(&self, path: &str) {
        let inner = self.inner.lock().unwrap();
        for c in inner.live.iter().filter(|c| c.path == path) {
            let _ = c.tx.send(Message::Close(None));
        }
    }

    pub fn seen(&self) -> Vec<String> { self.inner.lock().unwrap().seen.clone() }

    pub fn seen_count(&self, path: &str) -> usize {
        self.seen().iter().filter(|p| p.split('?').next() == Some(path)).count()
    }

    pub fn open_count(&self, path: &str) -> usize {
        self.inner.lock().unwrap().live.iter().filter(|c| c.path == path && !c.tx.is_closed()).count()
    }

    /// Poll until `cond` holds or two seconds pass.
    pub async fn wait_until<F: Fn(&StreamState) -> bool>(&self, cond: F) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if cond(self) {
                return true;
            }
            sleep(Duration::from_millis(10)).await;
        }
        cond(self)
    }
}

async fn handle_socket(state: StreamState, stream: TcpStream) {
    let captured = Arc::new(Mutex::new(String::new()));
    let cap = captured.clone();
    let ws = match accept_hdr_async(stream, move |req: &WsRequest, resp: WsResponse| {
        *cap.lock().unwrap() = req.uri().to_string();
        Ok(resp)
    })
    .await
    {
        Ok(ws) => ws,
        Err(_) => return,
    };
    let full = captured.lock().unwrap().clone();
    let path = full.split('?').next().unwrap_or("/").to_string();

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let greetings = {
        let mut inner = state.inner.lock().unwrap();
        inner.seen.push(full);
        inner.live.push(Conn { path: path.clone(), tx });
        inner.greetings.get(&path).cloned().unwrap_or_default()
    };

    let (mut sink, mut source) = ws.split();
    for g in greetings {
        if sink.send(Message::Text(g)).await.is_err() {
            return;
        }
    }
    loop {
        tokio::select! {
            out = rx.recv() => match out {
                Some(Message::Close(frame)) => {
                    let _ = sink.send(Message::Close(frame)).await;
                    break;
                }
                Some(msg) => {
                    if sink.send(msg).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            inbound = source.next() => match inbound {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            }
        }
    }
    // receiver dropped here: the connection stops counting as live
}

pub struct MockStreamServer {
    addr: SocketAddr,
    pub state: StreamState,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl MockStreamServer {
    pub async fn spawn() -> Self {
        let state = StreamState::default();
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let accept_state = state.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _peer)) => {
                            tokio::spawn(handle_socket(accept_state.clone(), stream));
                        }
                        Err(_) => break,
                    }
                }
            }
        });
        Self { addr, state, shutdown_tx: Some(shutdown_tx), handle }
    }

    pub fn base_url(&self) -> Url { Url::parse(&format!("ws://{}", self.addr)).unwrap() }
}

impl Drop for MockStreamServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.handle.abort();
    }
}
