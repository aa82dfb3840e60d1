/// Credentials for the signed-in staff user
use crate::types::UserId;
use http::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use std::fmt;
use std::sync::RwLock;
use tracing::warn;

/// Opaque bearer credential. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.0)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

/// The signed-in user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentUser {
    pub id: UserId,
    pub name: Option<String>,
}

impl CurrentUser {
    pub fn new(id: impl Into<UserId>) -> Self {
        Self {
            id: id.into(),
            name: None,
        }
    }
}

/// Source of the session credential and user identity.
///
/// Values are read at call time, so a provider may change underneath a
/// running session (sign-in, sign-out, token refresh).
pub trait CredentialProvider: Send + Sync {
    fn credential(&self) -> Option<Credential>;
    fn current_user(&self) -> Option<CurrentUser>;
}

/// In-memory provider that can be updated at runtime
#[derive(Debug, Default)]
pub struct StaticCredentials {
    inner: RwLock<(Option<Credential>, Option<CurrentUser>)>,
}

impl StaticCredentials {
    pub fn new(credential: Option<Credential>, user: Option<CurrentUser>) -> Self {
        Self {
            inner: RwLock::new((credential, user)),
        }
    }

    pub fn signed_in(token: impl Into<String>, user: CurrentUser) -> Self {
        Self::new(Some(Credential::new(token)), Some(user))
    }

    /// Read `PDV_TOKEN`, `PDV_USER_ID` and `PDV_USER_NAME`
    pub fn from_env() -> Self {
        let credential = std::env::var("PDV_TOKEN")
            .ok()
            .filter(|t| !t.is_empty())
            .map(Credential::new);
        let user = std::env::var("PDV_USER_ID")
            .ok()
            .filter(|id| !id.is_empty())
            .map(|id| CurrentUser {
                id: UserId::new(id),
                name: std::env::var("PDV_USER_NAME").ok(),
            });
        Self::new(credential, user)
    }

    pub fn set_credential(&self, credential: Option<Credential>) {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        guard.0 = credential;
    }

    pub fn set_user(&self, user: Option<CurrentUser>) {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        guard.1 = user;
    }

    pub fn sign_out(&self) {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        *guard = (None, None);
    }
}

impl CredentialProvider for StaticCredentials {
    fn credential(&self) -> Option<Credential> {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).0.clone()
    }

    fn current_user(&self) -> Option<CurrentUser> {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).1.clone()
    }
}

/// Headers for a REST call. `Authorization` is only present with a usable credential.
pub fn auth_headers(provider: &dyn CredentialProvider) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

    if let Some(credential) = provider.credential() {
        match HeaderValue::from_str(&credential.bearer()) {
            Ok(mut value) => {
                value.set_sensitive(true);
                headers.insert(AUTHORIZATION, value);
            }
            Err(_) => warn!("Credential contains characters not allowed in a header; ignoring it"),
        }
    }
    headers
}

/// Whether a header set carries an authorization field
pub fn is_authenticated(headers: &HeaderMap) -> bool {
    headers.contains_key(AUTHORIZATION)
}
