use super::OAuthConfig;
use super::error::{AuthError, AuthErrorCode};
use super::token::{ClaimsDecoder, IdTokenCheck};
use super::traits::{Browser, Clock, TokenResult, UserProfile};
use async_trait::async_trait;
use base64::{
    Engine,
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
};
use reqwest::{Client, ClientBuilder, header, redirect};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use url::Url;
use uuid::Uuid;

/// session storage key for the nonce of the login we are waiting on
pub const NONCE_KEY: &str = "kubelens.auth.nonce";

const SILENT_RENEW_TIMEOUT: Duration = Duration::from_secs(30);

/// Pre-login location travels through the provider as opaque base64 state
pub fn encode_state(path: &str) -> String {
    URL_SAFE_NO_PAD.encode(path.as_bytes())
}

/// Accepts url-safe and standard alphabets, older clients used btoa
pub fn decode_state(state: &str) -> Option<String> {
    let trimmed = state.trim_end_matches('=');
    let bytes = URL_SAFE_NO_PAD
        .decode(trimmed)
        .or_else(|_| STANDARD.decode(state))
        .ok()?;
    String::from_utf8(bytes).ok()
}

/// path + query of a url, what the app needs to put the user back
pub fn in_app_location(url: &Url) -> String {
    match url.query() {
        Some(q) => format!("{}?{}", url.path(), q),
        None => url.path().to_string(),
    }
}

/// `path` resolved against `base`, or `None` if it is not an absolute path
/// or would land on another origin (`//host/..`, `/\host/..`)
pub fn in_app_target(base: &Url, path: &str) -> Option<Url> {
    if !path.starts_with('/') || path.starts_with("//") {
        return None;
    }
    let target = base.join(path).ok()?;
    (target.origin() == base.origin()).then_some(target)
}

#[derive(Debug, Default, Deserialize)]
struct RedirectParams {
    access_token: Option<String>,
    id_token: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

impl RedirectParams {
    fn parse(raw: Option<&str>) -> Result<Self, AuthError> {
        match raw {
            Some(raw) if !raw.is_empty() => serde_urlencoded::from_str(raw).map_err(|e| {
                AuthError::new(
                    AuthErrorCode::InvalidRequest,
                    format!("Unable to parse redirect parameters: {}", e),
                )
            }),
            _ => Ok(Self::default()),
        }
    }
}

/// What came back on the redirect, before identity checks
#[derive(Debug, Clone)]
pub struct RedirectTokens {
    pub access_token: String,
    pub id_token: Option<String>,
    pub state: Option<String>,
}

/// Tokens live in the fragment. Errors can show up in the fragment or the
/// query depending on where the provider gave up.
pub fn parse_redirect(url: &Url) -> Result<Option<RedirectTokens>, AuthError> {
    let fragment = RedirectParams::parse(url.fragment())?;

    let error = match fragment.error.as_deref() {
        Some(_) => Some((fragment.error.clone(), fragment.error_description.clone())),
        None => {
            let query = RedirectParams::parse(url.query()).unwrap_or_default();
            query
                .error
                .is_some()
                .then(|| (query.error, query.error_description))
        }
    };

    if let Some((code, description)) = error {
        return Err(AuthError::new(
            code.unwrap_or_default(),
            description.unwrap_or_default(),
        ));
    }

    Ok(fragment.access_token.map(|access_token| RedirectTokens {
        access_token,
        id_token: fragment.id_token,
        state: fragment.state,
    }))
}

/// Builds `endpoint?k=v&...`, skipping empty values
pub fn authorize_url(endpoint: &str, params: &[(&str, &str)]) -> Result<Url, AuthError> {
    let mut url = Url::parse(endpoint)?;
    {
        let mut pairs = url.query_pairs_mut();
        for (key, value) in params.iter().filter(|(_, v)| !v.is_empty()) {
            pairs.append_pair(key, value);
        }
    }
    Ok(url)
}

/// `https://` unless the configured domain already says otherwise
pub fn origin_of(domain: &str) -> String {
    if domain.starts_with("https://") || domain.starts_with("http://") {
        domain.trim_end_matches('/').to_string()
    } else {
        format!("https://{}", domain.trim_end_matches('/'))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryValue {
    /// emitted as the bare key
    Flag,
    One(String),
    /// key repeated once per element
    Many(Vec<String>),
}

/// Ordered query parameters for the logout redirect
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryParams {
    params: Vec<(String, QueryValue)>,
}

impl QueryParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn flag(mut self, key: impl Into<String>) -> Self {
        self.params.push((key.into(), QueryValue::Flag));
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), QueryValue::One(value.into())));
        self
    }

    pub fn list<I, S>(mut self, key: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.params.push((
            key.into(),
            QueryValue::Many(values.into_iter().map(Into::into).collect()),
        ));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn to_query_string(&self) -> String {
        self.params
            .iter()
            .map(|(key, value)| {
                let key = urlencoding::encode(key);
                match value {
                    QueryValue::Flag => key.into_owned(),
                    QueryValue::One(v) => format!("{}={}", key, urlencoding::encode(v)),
                    QueryValue::Many(vs) => vs
                        .iter()
                        .map(|v| format!("{}={}", key, urlencoding::encode(v)))
                        .collect::<Vec<_>>()
                        .join("&"),
                }
            })
            .collect::<Vec<_>>()
            .join("&")
    }
}

/// Performs a `prompt=none` authorize request and hands back where the
/// provider tried to send us
#[async_trait]
pub trait SessionProbe {
    async fn authorize_silently(&self, url: Url) -> Result<Url, AuthError>;
}

/// Plain HTTP rendition of the hidden-iframe trick. The cookie jar carries the
/// provider session between requests.
#[derive(Clone)]
pub struct HttpSessionProbe {
    client: Client,
}

impl HttpSessionProbe {
    pub fn new() -> Result<Self, AuthError> {
        let client = Self::client_builder().build()?;
        Ok(Self { client })
    }

    fn client_builder() -> ClientBuilder {
        Client::builder()
            .cookie_store(true)
            .redirect(redirect::Policy::none())
            .timeout(SILENT_RENEW_TIMEOUT)
    }
}

#[async_trait]
impl SessionProbe for HttpSessionProbe {
    async fn authorize_silently(&self, url: Url) -> Result<Url, AuthError> {
        tracing::debug!("Silent authorize against {}", url.origin().ascii_serialization());

        let response = self.client.get(url.clone()).send().await?;
        let status = response.status();

        if !status.is_redirection() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::new(
                AuthErrorCode::LoginRequired,
                format!("Silent authorization did not redirect: {} - {}", status, body),
            ));
        }

        let location = response
            .headers()
            .get(header::LOCATION)
            .and_then(|h| h.to_str().ok())
            .ok_or_else(|| {
                AuthError::new(
                    AuthErrorCode::ServerError,
                    "Silent authorization redirect had no Location header",
                )
            })?;

        Ok(url.join(location)?)
    }
}

/// Shared plumbing both strategies are built on
pub struct ImplicitFlow {
    pub browser: Arc<dyn Browser + Send + Sync>,
    pub probe: Arc<dyn SessionProbe + Send + Sync>,
    pub clock: Arc<dyn Clock + Send + Sync>,
    decoder: ClaimsDecoder,
}

impl ImplicitFlow {
    pub fn new(
        browser: Arc<dyn Browser + Send + Sync>,
        probe: Arc<dyn SessionProbe + Send + Sync>,
        clock: Arc<dyn Clock + Send + Sync>,
    ) -> Self {
        Self {
            browser,
            probe,
            clock,
            decoder: ClaimsDecoder::new(),
        }
    }

    /// State for a login started from wherever the browser is right now
    pub fn login_state(&self) -> String {
        encode_state(&in_app_location(&self.browser.location()))
    }

    pub fn fresh_nonce(&self) -> String {
        let nonce = Uuid::new_v4().to_string();
        self.browser.session_set(NONCE_KEY, &nonce);
        nonce
    }

    /// Pre-login path carried in `state`, if it decodes and stays on our origin
    pub fn restorable_path(&self, state: &str) -> Option<String> {
        let Some(path) = decode_state(state) else {
            tracing::warn!("Ignoring undecodable state on redirect");
            return None;
        };
        if in_app_target(&self.browser.location(), &path).is_none() {
            tracing::warn!("Ignoring state that leaves the app: {}", path);
            return None;
        }
        Some(path)
    }

    pub fn navigate(&self, url: &Url) {
        tracing::info!("Redirecting to {}", url.origin().ascii_serialization());
        self.browser.assign(url);
    }

    /// Tokens off the current page, after a redirect-based login
    pub fn tokens_from_location(
        &self,
        config: &OAuthConfig,
    ) -> Result<Option<(TokenResult, Option<String>)>, AuthError> {
        let location = self.browser.location();
        let nonce = self.browser.session_get(NONCE_KEY);
        let parsed = self.tokens_from(&location, config, nonce.as_deref());
        if parsed.as_ref().is_ok_and(|p| p.is_some()) {
            self.browser.session_remove(NONCE_KEY);
        }
        parsed
    }

    /// Tokens off a silent-renew redirect. Silent requests carry their own nonce.
    pub async fn tokens_silently(
        &self,
        url: Url,
        config: &OAuthConfig,
        nonce: &str,
    ) -> Result<TokenResult, AuthError> {
        let landed = self.probe.authorize_silently(url).await?;
        match self.tokens_from(&landed, config, Some(nonce))? {
            Some((result, _)) => Ok(result),
            None => Err(AuthError::new(
                AuthErrorCode::LoginRequired,
                "Silent authorization returned no tokens",
            )),
        }
    }

    fn tokens_from(
        &self,
        url: &Url,
        config: &OAuthConfig,
        nonce: Option<&str>,
    ) -> Result<Option<(TokenResult, Option<String>)>, AuthError> {
        let Some(tokens) = parse_redirect(url)? else {
            return Ok(None);
        };

        let identity = match tokens.id_token.as_deref() {
            Some(id_token) => {
                let claims: UserProfile = self.decoder.claims(id_token)?;
                IdTokenCheck {
                    client_id: &config.client_id,
                    nonce,
                    now: self.clock.now(),
                }
                .verify(&claims)?;
                Some(claims)
            }
            None => None,
        };

        let result = TokenResult {
            access_token: tokens.access_token,
            identity_token: tokens.id_token,
            identity,
        };
        Ok(Some((result, tokens.state)))
    }
}
