// ===============================
// src/gateway.rs (credentialed REST gateway)
// ===============================
//
// Every authenticated REST call goes through `Gateway::request`:
// - attach `Authorization: Bearer <access>` when an access token exists
// - on 401: one renewal via the refresh token, then one retry
// - renewal failure hands the original 401 back unchanged
//
// Concurrent 401s are not coordinated: each caller renews on its own and
// the last successful write to the access slot wins.
//
use std::sync::Arc;
use std::time::Duration;

use reqwest::{Method, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::metrics::TOKEN_RENEWALS;
use crate::session::{SessionStore, TokenKind};

pub const REFRESH_PATH: &str = "/api/auth/refresh/";

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("transport: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("bad url: {0}")]
    Url(#[from] url::ParseError),
}

#[derive(Debug, Error)]
pub enum RenewError {
    #[error("no refresh token stored")]
    MissingRefresh,
    #[error("refresh rejected ({0})")]
    Rejected(StatusCode),
    #[error("refresh response without access token")]
    Malformed,
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

/// Description of one outbound call. Kept separate from `reqwest::RequestBuilder`
/// so the same request can be replayed after a renewal.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub json: Option<Value>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self { method, path: path.into(), query: Vec::new(), json: None }
    }
    pub fn get(path: impl Into<String>) -> Self { Self::new(Method::GET, path) }
    pub fn post(path: impl Into<String>) -> Self { Self::new(Method::POST, path) }
    pub fn patch(path: impl Into<String>) -> Self { Self::new(Method::PATCH, path) }

    pub fn query(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    pub fn json(mut self, body: Value) -> Self {
        self.json = Some(body);
        self
    }
}

#[derive(Clone)]
pub struct Gateway {
    http: reqwest::Client,
    api_base: Url,
    store: Arc<dyn SessionStore>,
}

#[derive(Deserialize)]
struct RefreshResponse {
    access: Option<String>,
}

impl Gateway {
    pub fn new(api_base: Url, store: Arc<dyn SessionStore>) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self { http, api_base, store })
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> { &self.store }

    pub fn api_base(&self) -> &Url { &self.api_base }

    /// Absolute `http(s)://` targets pass through; anything else is joined
    /// onto the API base.
    pub fn url(&self, path_or_url: &str) -> Result<Url, GatewayError> {
        let lower = path_or_url.to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            return Ok(Url::parse(path_or_url)?);
        }
        let base = self.api_base.as_str().trim_end_matches('/');
        let path = path_or_url.trim_start_matches('/');
        Ok(Url::parse(&format!("{base}/{path}"))?)
    }

    async fn send_once(&self, req: &ApiRequest, bearer: Option<&str>) -> Result<Response, GatewayError> {
        let url = self.url(&req.path)?;
        let mut builder = self.http.request(req.method.clone(), url);
        if !req.query.is_empty() {
            builder = builder.query(&req.query);
        }
        if let Some(body) = &req.json {
            builder = builder.json(body);
        }
        if let Some(token) = bearer {
            builder = builder.bearer_auth(token);
        }
        Ok(builder.send().await?)
    }

    /// Authenticated request with one-shot transparent renewal.
    pub async fn request(&self, req: &ApiRequest) -> Result<Response, GatewayError> {
        let access = self.store.get(TokenKind::Access);
        let resp = self.send_once(req, access.as_deref()).await?;
        if resp.status() != StatusCode::UNAUTHORIZED {
            return Ok(resp);
        }

        debug!(path = %req.path, "401, attempting token renewal");
        match self.renew().await {
            Ok(fresh) => self.send_once(req, Some(&fresh)).await,
            Err(e) => {
                warn!(path = %req.path, error = %e, "token renewal failed");
                Ok(resp)
            }
        }
    }

    /// Unauthenticated call (login, register, public endpoints).
    pub async fn request_public(&self, req: &ApiRequest) -> Result<Response, GatewayError> {
        self.send_once(req, None).await
    }

    /// Exchange the stored refresh token for a new access token and store it.
    pub async fn renew(&self) -> Result<String, RenewError> {
        let Some(refresh) = self.store.get(TokenKind::Refresh) else {
            TOKEN_RENEWALS.with_label_values(&["missing"]).inc();
            return Err(RenewError::MissingRefresh);
        };
        let req = ApiRequest::post(REFRESH_PATH).json(json!({ "refresh": refresh }));
        let resp = match self.send_once(&req, None).await {
            Ok(r) => r,
            Err(e) => {
                TOKEN_RENEWALS.with_label_values(&["error"]).inc();
                return Err(e.into());
            }
        };
        if !resp.status().is_success() {
            TOKEN_RENEWALS.with_label_values(&["rejected"]).inc();
            return Err(RenewError::Rejected(resp.status()));
        }
        let access = resp
            .json::<RefreshResponse>()
            .await
            .ok()
            .and_then(|r| r.access)
            .filter(|a| !a.is_empty());
        let Some(access) = access else {
            TOKEN_RENEWALS.with_label_values(&["error"]).inc();
            return Err(RenewError::Malformed);
        };
        if let Err(e) = self.store.set(TokenKind::Access, &access) {
            warn!(error = %e, "could not persist renewed access token");
        }
        TOKEN_RENEWALS.with_label_values(&["ok"]).inc();
        info!("access token renewed");
        Ok(access)
    }
}
