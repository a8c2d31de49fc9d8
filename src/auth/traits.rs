use super::OAuthConfig;
use super::error::AuthError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

/// Which identity provider a strategy talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Auth0,
    Okta,
}

impl Provider {
    /// Substring of the configured domain that selects the okta strategy
    pub const OKTA_MARKER: &'static str = "okta";

    pub fn for_domain(domain: &str) -> Self {
        if domain.contains(Self::OKTA_MARKER) {
            Provider::Okta
        } else {
            Provider::Auth0
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provider::Auth0 => f.write_str("auth0"),
            Provider::Okta => f.write_str("okta"),
        }
    }
}

// async_trait so these can live behind Box<dyn ..>, native async fns in traits still can't
/// The three things a provider has to be able to do for us
#[async_trait]
pub trait CredentialStrategy {
    fn provider(&self) -> Provider;

    /// Navigate away to the provider's login page
    fn login(&self, config: &OAuthConfig) -> Result<(), AuthError>;

    /// Pick tokens out of the redirect we just came back from
    async fn ensure_authed(&self, config: &OAuthConfig) -> Result<TokenResult, AuthError>;

    /// Silent renewal against the existing provider session
    async fn re_auth(&self, config: &OAuthConfig) -> Result<TokenResult, AuthError>;
}

/// Whatever is hosting us: location, navigation, session storage
pub trait Browser {
    fn location(&self) -> Url;

    /// Full navigation, the page is gone after this
    fn assign(&self, url: &Url);

    /// History API replaceState, no navigation
    fn replace_state(&self, path: &str);

    fn session_get(&self, key: &str) -> Option<String>;
    fn session_set(&self, key: &str, value: &str);
    fn session_remove(&self, key: &str);
}

/// In-app router handle, used to restore where the user was before login
pub trait History {
    fn replace(&self, path: &str);
}

pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenResult {
    pub access_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<UserProfile>,
}

impl TokenResult {
    pub fn new(access_token: impl Into<String>, identity_token: Option<String>) -> Self {
        Self {
            access_token: access_token.into(),
            identity_token,
            identity: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Audience {
    Single(String),
    Many(Vec<String>),
}

impl Audience {
    pub fn contains(&self, value: &str) -> bool {
        match self {
            Audience::Single(aud) => aud == value,
            Audience::Many(auds) => auds.iter().any(|a| a == value),
        }
    }
}

/// Identity token claims. Providers disagree on which username claim they send,
/// hence both `preferred_username` and `samAccountName`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    #[serde(default)]
    pub sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_username: Option<String>,
    #[serde(
        default,
        rename = "samAccountName",
        skip_serializing_if = "Option::is_none"
    )]
    pub sam_account_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<Audience>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>, // Issued at
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>, // Expiration time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl UserProfile {
    pub fn username(&self) -> &str {
        self.preferred_username
            .as_deref()
            .or(self.sam_account_name.as_deref())
            .unwrap_or(&self.sub)
    }
}

/// Broadcast to subscribers as the background renewal chain runs
#[derive(Debug, Clone)]
pub enum AuthEvent {
    Renewed { expires_at: Option<DateTime<Utc>> },
    RenewalFailed(AuthError),
}
