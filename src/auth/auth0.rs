use super::OAuthConfig;
use super::error::{AuthError, AuthErrorCode};
use super::implicit::{ImplicitFlow, authorize_url, origin_of};
use super::traits::{CredentialStrategy, History, Provider, TokenResult};
use async_trait::async_trait;
use std::sync::Arc;
use url::Url;
use uuid::Uuid;

/// Auth0 implicit flow. Puts the user back through the app's own router.
pub struct Auth0Strategy {
    flow: ImplicitFlow,
    history: Option<Arc<dyn History + Send + Sync>>,
}

impl Auth0Strategy {
    pub fn new(flow: ImplicitFlow, history: Option<Arc<dyn History + Send + Sync>>) -> Self {
        Self { flow, history }
    }

    fn authorize_url(
        &self,
        config: &OAuthConfig,
        state: &str,
        nonce: &str,
        prompt: Option<&str>,
    ) -> Result<Url, AuthError> {
        authorize_url(
            &format!("{}/authorize", origin_of(&config.domain)),
            &[
                ("client_id", config.client_id.as_str()),
                ("response_type", config.response_type.as_str()),
                ("redirect_uri", config.redirect_uri.as_str()),
                ("audience", config.audience.as_str()),
                ("scope", config.scope.as_str()),
                ("connection", config.connection.as_deref().unwrap_or_default()),
                ("state", state),
                ("nonce", nonce),
                ("prompt", prompt.unwrap_or_default()),
            ],
        )
    }

    fn restore_location(&self, state: &str) {
        let Some(path) = self.flow.restorable_path(state) else {
            return;
        };

        tracing::debug!("Restoring pre-login location {}", path);
        match &self.history {
            Some(history) => history.replace(&path),
            None => self.flow.browser.replace_state(&path),
        }
    }

    /// Everything except clock skew goes back to the login page
    fn fail(&self, config: &OAuthConfig, err: AuthError) -> AuthError {
        if err.is_clock_skew() {
            tracing::warn!("Auth0 token rejected for clock skew, not redirecting: {}", err);
        } else {
            tracing::warn!("Auth0 authentication failed, sending user to login: {}", err);
            if let Err(e) = self.login(config) {
                tracing::error!("Could not start auth0 login: {}", e);
            }
        }
        err
    }
}

#[async_trait]
impl CredentialStrategy for Auth0Strategy {
    fn provider(&self) -> Provider {
        Provider::Auth0
    }

    fn login(&self, config: &OAuthConfig) -> Result<(), AuthError> {
        let state = self.flow.login_state();
        let nonce = self.flow.fresh_nonce();
        let url = self.authorize_url(config, &state, &nonce, None)?;
        self.flow.navigate(&url);
        Ok(())
    }

    async fn ensure_authed(&self, config: &OAuthConfig) -> Result<TokenResult, AuthError> {
        match self.flow.tokens_from_location(config) {
            Ok(Some((result, state))) => {
                if let Some(state) = state {
                    self.restore_location(&state);
                }
                Ok(result)
            }
            Ok(None) => Err(self.fail(
                config,
                AuthError::new(
                    AuthErrorCode::LoginRequired,
                    "No tokens found on the auth0 redirect",
                ),
            )),
            Err(e) => Err(self.fail(config, e)),
        }
    }

    async fn re_auth(&self, config: &OAuthConfig) -> Result<TokenResult, AuthError> {
        let nonce = Uuid::new_v4().to_string();
        let url = self.authorize_url(config, &self.flow.login_state(), &nonce, Some("none"))?;

        self.flow
            .tokens_silently(url, config, &nonce)
            .await
            .map_err(|e| self.fail(config, e))
    }
}
