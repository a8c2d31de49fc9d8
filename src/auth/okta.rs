use super::OAuthConfig;
use super::error::{AuthError, AuthErrorCode};
use super::implicit::{ImplicitFlow, authorize_url, origin_of};
use super::traits::{CredentialStrategy, Provider, TokenResult};
use async_trait::async_trait;
use url::Url;
use uuid::Uuid;

/// okta always wants both tokens back, regardless of what the app config says
const OKTA_RESPONSE_TYPE: &str = "token id_token";

/// Okta implicit flow. The configured domain is the full issuer, e.g.
/// `https://dev-123456.okta.com/oauth2/default`, and location is restored with
/// the History API directly instead of through the app router.
pub struct OktaStrategy {
    flow: ImplicitFlow,
}

impl OktaStrategy {
    pub fn new(flow: ImplicitFlow) -> Self {
        Self { flow }
    }

    fn authorize_url(
        &self,
        config: &OAuthConfig,
        state: &str,
        nonce: &str,
        prompt: Option<&str>,
    ) -> Result<Url, AuthError> {
        authorize_url(
            &format!("{}/v1/authorize", origin_of(&config.domain)),
            &[
                ("client_id", config.client_id.as_str()),
                ("redirect_uri", config.redirect_uri.as_str()),
                ("response_type", OKTA_RESPONSE_TYPE),
                ("response_mode", "fragment"),
                ("scope", config.scope.as_str()),
                ("state", state),
                ("nonce", nonce),
                ("prompt", prompt.unwrap_or_default()),
            ],
        )
    }

    fn fail(&self, config: &OAuthConfig, err: AuthError) -> AuthError {
        // clock off by more than five minutes: logging in again would just loop
        if err.is_clock_skew() {
            tracing::warn!("Okta token rejected for clock skew, not redirecting: {}", err);
        } else {
            tracing::warn!("Okta authentication failed, sending user to login: {}", err);
            if let Err(e) = self.login(config) {
                tracing::error!("Could not start okta login: {}", e);
            }
        }
        err
    }
}

#[async_trait]
impl CredentialStrategy for OktaStrategy {
    fn provider(&self) -> Provider {
        Provider::Okta
    }

    fn login(&self, config: &OAuthConfig) -> Result<(), AuthError> {
        let state = self.flow.login_state();
        let nonce = self.flow.fresh_nonce();
        let url = self.authorize_url(config, &state, &nonce, None)?;
        self.flow.navigate(&url);
        Ok(())
    }

    async fn ensure_authed(&self, config: &OAuthConfig) -> Result<TokenResult, AuthError> {
        let (result, state) = match self.flow.tokens_from_location(config) {
            Ok(Some(found)) => found,
            Ok(None) => {
                return Err(self.fail(
                    config,
                    AuthError::new(
                        AuthErrorCode::LoginRequired,
                        "Unable to parse a token from the url",
                    ),
                ));
            }
            Err(e) => return Err(self.fail(config, e)),
        };

        if let Some(path) = state.as_deref().and_then(|s| self.flow.restorable_path(s)) {
            self.flow.browser.replace_state(&path);
        }

        Ok(result)
    }

    async fn re_auth(&self, config: &OAuthConfig) -> Result<TokenResult, AuthError> {
        let nonce = Uuid::new_v4().to_string();
        let url = self.authorize_url(config, &self.flow.login_state(), &nonce, Some("none"))?;

        match self.flow.tokens_silently(url, config, &nonce).await {
            Ok(result) => {
                tracing::debug!("Okta session renewed");
                Ok(result)
            }
            Err(e) => Err(self.fail(config, e)),
        }
    }
}
