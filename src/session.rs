// ===============================
// src/session.rs
// ===============================
//
// Credential storage. Two scopes, as in a browser:
// - MemoryStore : lives for the process (session-scoped)
// - FileStore   : JSON file on disk (persistent-scoped)
// LayeredStore reads session first, then persistent.
//
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind { Access, Refresh }

impl TokenKind {
    pub fn key(&self) -> &'static str { match self { TokenKind::Access => "access", TokenKind::Refresh => "refresh" } }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("token file io: {0}")]
    Io(#[from] std::io::Error),
    #[error("token file format: {0}")]
    Format(#[from] serde_json::Error),
}

/// Readers must call `get` per request; the access slot can be replaced by
/// any in-flight renewal.
pub trait SessionStore: Send + Sync {
    fn get(&self, kind: TokenKind) -> Option<String>;
    fn set(&self, kind: TokenKind, value: &str) -> Result<(), StoreError>;
    fn clear(&self, kind: TokenKind) -> Result<(), StoreError>;

    fn clear_all(&self) -> Result<(), StoreError> {
        self.clear(TokenKind::Access)?;
        self.clear(TokenKind::Refresh)
    }

    fn has_credentials(&self) -> bool {
        self.get(TokenKind::Access).is_some() || self.get(TokenKind::Refresh).is_some()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Tokens {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    access: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    refresh: Option<String>,
}

impl Tokens {
    fn slot(&mut self, kind: TokenKind) -> &mut Option<String> {
        match kind { TokenKind::Access => &mut self.access, TokenKind::Refresh => &mut self.refresh }
    }
    fn read(&self, kind: TokenKind) -> Option<String> {
        match kind { TokenKind::Access => self.access.clone(), TokenKind::Refresh => self.refresh.clone() }
            .filter(|t| !t.is_empty())
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tokens: RwLock<Tokens>,
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }

    pub fn with_tokens(access: Option<&str>, refresh: Option<&str>) -> Self {
        Self {
            tokens: RwLock::new(Tokens {
                access: access.map(str::to_string),
                refresh: refresh.map(str::to_string),
            }),
        }
    }
}

impl SessionStore for MemoryStore {
    fn get(&self, kind: TokenKind) -> Option<String> {
        self.tokens.read().unwrap_or_else(PoisonError::into_inner).read(kind)
    }
    fn set(&self, kind: TokenKind, value: &str) -> Result<(), StoreError> {
        *self.tokens.write().unwrap_or_else(PoisonError::into_inner).slot(kind) = Some(value.to_string());
        Ok(())
    }
    fn clear(&self, kind: TokenKind) -> Result<(), StoreError> {
        *self.tokens.write().unwrap_or_else(PoisonError::into_inner).slot(kind) = None;
        Ok(())
    }
}

/// Persistent store backed by a small JSON file (`{"access": .., "refresh": ..}`).
/// The file is cached in memory and rewritten on every change.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    tokens: RwLock<Tokens>,
}

impl FileStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let tokens = match std::fs::read_to_string(&path) {
            Ok(raw) if raw.trim().is_empty() => Tokens::default(),
            Ok(raw) => serde_json::from_str(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Tokens::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self { path, tokens: RwLock::new(tokens) })
    }

    pub fn path(&self) -> &Path { &self.path }

    fn persist(&self, tokens: &Tokens) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(&self.path, serde_json::to_vec_pretty(tokens)?)?;
        Ok(())
    }
}

impl SessionStore for FileStore {
    fn get(&self, kind: TokenKind) -> Option<String> {
        self.tokens.read().unwrap_or_else(PoisonError::into_inner).read(kind)
    }
    fn set(&self, kind: TokenKind, value: &str) -> Result<(), StoreError> {
        let mut guard = self.tokens.write().unwrap_or_else(PoisonError::into_inner);
        *guard.slot(kind) = Some(value.to_string());
        self.persist(&guard)
    }
    fn clear(&self, kind: TokenKind) -> Result<(), StoreError> {
        let mut guard = self.tokens.write().unwrap_or_else(PoisonError::into_inner);
        *guard.slot(kind) = None;
        self.persist(&guard)
    }
}

/// Session scope shadows persistent scope. Writes go to the scope that
/// already owns the refresh token (session when neither does).
pub struct LayeredStore {
    session: MemoryStore,
    persistent: Option<FileStore>,
}

impl LayeredStore {
    pub fn new(persistent: Option<FileStore>) -> Self {
        Self { session: MemoryStore::new(), persistent }
    }

    /// Store a fresh login pair in the requested scope, wiping the other one.
    pub fn store_login(&self, access: &str, refresh: &str, remember: bool) -> Result<(), StoreError> {
        self.clear_all()?;
        match (&self.persistent, remember) {
            (Some(p), true) => {
                p.set(TokenKind::Access, access)?;
                p.set(TokenKind::Refresh, refresh)
            }
            (None, true) => {
                warn!("no persistent token file configured, keeping login in session scope");
                self.session.set(TokenKind::Access, access)?;
                self.session.set(TokenKind::Refresh, refresh)
            }
            (_, false) => {
                self.session.set(TokenKind::Access, access)?;
                self.session.set(TokenKind::Refresh, refresh)
            }
        }
    }

    fn writes_persistent(&self) -> Option<&FileStore> {
        let p = self.persistent.as_ref()?;
        if self.session.get(TokenKind::Refresh).is_none() && p.get(TokenKind::Refresh).is_some() {
            Some(p)
        } else {
            None
        }
    }
}

impl SessionStore for LayeredStore {
    fn get(&self, kind: TokenKind) -> Option<String> {
        self.session
            .get(kind)
            .or_else(|| self.persistent.as_ref().and_then(|p| p.get(kind)))
    }
    fn set(&self, kind: TokenKind, value: &str) -> Result<(), StoreError> {
        match self.writes_persistent() {
            Some(p) => {
                // a stale session value would keep shadowing the new one
                self.session.clear(kind)?;
                p.set(kind, value)
            }
            None => self.session.set(kind, value),
        }
    }
    fn clear(&self, kind: TokenKind) -> Result<(), StoreError> {
        self.session.clear(kind)?;
        if let Some(p) = &self.persistent {
            p.clear(kind)?;
        }
        Ok(())
    }
}
