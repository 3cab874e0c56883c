//! Session-token decoding for the `session` entry of the render payload.

use std::sync::{Arc, RwLock};

use base64::{Engine, engine::general_purpose::STANDARD};
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;

use super::payload::Payload;

/// Cookie carrying the session token.
pub const SESSION_COOKIE: &str = "session_token";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session token is not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),
    #[error("session token is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("session payload is missing `email`")]
    MissingEmail,
    #[error("session rejected: {0}")]
    Rejected(String),
}

/// Turns a raw session token into the mapping injected as `payload.session`.
pub trait SessionParser: Send + Sync {
    fn parse(&self, token: &str) -> Result<Payload, SessionError>;
}

impl<F> SessionParser for F
where
    F: Fn(&str) -> Result<Payload, SessionError> + Send + Sync,
{
    fn parse(&self, token: &str) -> Result<Payload, SessionError> {
        self(token)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TokenClaims {
    id: String,
    name: String,
    email: String,
    provider: String,
}

/// Base64-encoded JSON claims: `{id, name, email, provider, iat}`; `iat` is not checked.
#[derive(Debug, Default, Clone, Copy)]
pub struct Base64JsonSessionParser;

impl SessionParser for Base64JsonSessionParser {
    fn parse(&self, token: &str) -> Result<Payload, SessionError> {
        let decoded = STANDARD.decode(token)?;
        let claims: TokenClaims = serde_json::from_slice(&decoded)?;
        if claims.email.is_empty() {
            return Err(SessionError::MissingEmail);
        }

        let mut session = Payload::new();
        session.insert("session_token".into(), Value::String(token.to_string()));
        session.insert(
            "user".into(),
            json!({
                "id": claims.id,
                "name": claims.name,
                "email": claims.email,
                "provider": claims.provider,
            }),
        );
        Ok(session)
    }
}

/// Swappable parser shared by every request handler.
#[derive(Clone)]
pub struct SessionParserSlot {
    inner: Arc<RwLock<Arc<dyn SessionParser>>>,
}

impl SessionParserSlot {
    pub fn new(parser: Arc<dyn SessionParser>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(parser)),
        }
    }

    /// Install `parser`, or restore the default when `None`.
    pub fn set(&self, parser: Option<Arc<dyn SessionParser>>) {
        let parser =
            parser.unwrap_or_else(|| Arc::new(Base64JsonSessionParser) as Arc<dyn SessionParser>);
        match self.inner.write() {
            Ok(mut guard) => *guard = parser,
            Err(poisoned) => *poisoned.into_inner() = parser,
        }
    }

    pub fn current(&self) -> Arc<dyn SessionParser> {
        match self.inner.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Parse `token` with the installed parser; failures mean "no session".
    pub fn session_for(&self, token: &str) -> Option<Payload> {
        if token.is_empty() {
            return None;
        }
        self.current().parse(token).ok()
    }
}

impl Default for SessionParserSlot {
    fn default() -> Self {
        Self::new(Arc::new(Base64JsonSessionParser))
    }
}
