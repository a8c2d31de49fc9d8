mod auth0;
mod browser;
mod client;
mod error;
mod implicit;
mod okta;
mod token;
mod traits;

pub use auth0::Auth0Strategy;
pub use browser::MemoryBrowser;
pub use client::{AuthClient, AuthClientBuilder, RENEW_BEFORE_EXPIRY};
pub use error::{AuthError, AuthErrorCode};
pub use implicit::{
    HttpSessionProbe, ImplicitFlow, NONCE_KEY, QueryParams, QueryValue, SessionProbe,
    decode_state, encode_state,
};
pub use okta::OktaStrategy;
pub use token::ClaimsDecoder;
pub use traits::{
    Audience, AuthEvent, Browser, Clock, CredentialStrategy, History, Provider, SystemClock,
    TokenResult, UserProfile,
};

use serde::{Deserialize, Serialize};

/// Everything the client needs to know about the identity provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthConfig {
    pub client_id: String,
    /// auth0 tenant host, or the full okta issuer url
    pub domain: String,
    pub response_type: String,
    pub redirect_uri: String,
    pub audience: String,
    pub scope: String,
    /// auth0 connection; empty is fine, absent is not
    pub connection: Option<String>,
}

impl OAuthConfig {
    /// Reports every missing field at once rather than the first one
    pub fn validate(&self) -> Result<(), AuthError> {
        let checks = [
            (self.client_id.is_empty(), "No oAuth client id specified in configuration"),
            (self.domain.is_empty(), "No oAuth domain specified in configuration"),
            (
                self.response_type.is_empty(),
                "No oAuth response type specified in configuration",
            ),
            (
                self.redirect_uri.is_empty(),
                "No oAuth redirect uri specified in configuration",
            ),
            (self.audience.is_empty(), "No oAuth audience specified in configuration"),
            (self.scope.is_empty(), "No oAuth scope specified in configuration"),
            (
                self.connection.is_none(),
                "No oAuth connection specified in configuration",
            ),
        ];

        let problems: Vec<&str> = checks
            .iter()
            .filter(|(missing, _)| *missing)
            .map(|(_, message)| *message)
            .collect();

        if problems.is_empty() {
            Ok(())
        } else {
            Err(AuthError::missing_configuration(problems.join(", ")))
        }
    }

    pub fn provider(&self) -> Provider {
        Provider::for_domain(&self.domain)
    }
}
