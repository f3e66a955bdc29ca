// ===============================
// src/auth.rs
// ===============================
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{info, warn};

use crate::api::{read_json, ApiError};
use crate::gateway::{ApiRequest, Gateway, GatewayError};
use crate::session::{LayeredStore, StoreError, TokenKind};

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("{code}: {message}")]
    Rejected { code: String, message: String },
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("login response without tokens")]
    Malformed,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenPair {
    pub access: String,
    pub refresh: String,
}

#[derive(Deserialize, Default)]
struct LoginFailure {
    code: Option<String>,
    message: Option<String>,
    detail: Option<String>,
}

/// Authenticate and return the token pair; the caller decides which scope keeps it.
pub async fn login(gw: &Gateway, username: &str, password: &str) -> Result<TokenPair, AuthError> {
    let req = ApiRequest::post("/api/auth/login/")
        .json(json!({ "username": username, "password": password }));
    let resp = gw.request_public(&req).await?;
    let status = resp.status();
    let body = resp.text().await.map_err(GatewayError::from)?;

    if !status.is_success() {
        let f: LoginFailure = serde_json::from_str(&body).unwrap_or_default();
        return Err(AuthError::Rejected {
            code: f.code.unwrap_or_else(|| "AUTH_FAILED".to_string()),
            message: f.message.or(f.detail).unwrap_or_else(|| "Login failed".to_string()),
        });
    }
    serde_json::from_str::<TokenPair>(&body).map_err(|_| AuthError::Malformed)
}

/// Login and keep the tokens in session scope, or persistent scope when `remember`.
pub async fn login_into(gw: &Gateway, store: &LayeredStore, username: &str, password: &str, remember: bool) -> Result<(), AuthError> {
    let pair = login(gw, username, password).await?;
    store.store_login(&pair.access, &pair.refresh, remember)?;
    info!(%username, remember, "logged in");
    Ok(())
}

pub async fn register(gw: &Gateway, username: &str, email: &str, password: &str) -> Result<Value, ApiError> {
    let req = ApiRequest::post("/api/auth/register/")
        .json(json!({ "username": username, "email": email, "password": password }));
    let resp = gw.request_public(&req).await?;
    read_json(resp, "Registration failed").await
}

/// Ask the backend to blacklist the refresh token, then wipe both scopes.
/// The backend call is best-effort.
pub async fn logout(gw: &Gateway) -> Result<(), StoreError> {
    let refresh = gw.store().get(TokenKind::Refresh);
    let req = ApiRequest::post("/api/auth/logout/").json(json!({ "refresh": refresh }));
    match gw.request(&req).await {
        Ok(resp) if !resp.status().is_success() => {
            warn!(status = %resp.status(), "logout not acknowledged by backend");
        }
        Ok(_) => {}
        Err(e) => warn!(error = %e, "logout request failed"),
    }
    gw.store().clear_all()
}
