use super::error::{AuthError, AuthErrorCode};
use super::traits::UserProfile;
use chrono::{DateTime, Duration, TimeZone, Utc};
use jsonwebtoken::{DecodingKey, Validation, decode};
use serde::Deserialize;
use serde::de::DeserializeOwned;

/// How far in the future an `iat` may be before we call it clock skew
pub const MAX_CLOCK_SKEW_SECS: i64 = 300;

#[derive(Debug, Deserialize)]
struct ExpiryClaim {
    #[serde(default)]
    exp: Option<i64>,
}

/// Reads a JWT payload without checking the signature. We are the audience of
/// these tokens only in the sense that we forward them; the API server verifies.
pub struct ClaimsDecoder {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl Default for ClaimsDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ClaimsDecoder {
    pub fn new() -> Self {
        let mut validation = Validation::default();
        validation.insecure_disable_signature_validation();
        validation.validate_exp = false; // expiry is our call, not the decoder's
        validation.validate_nbf = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();

        Self {
            decoding_key: DecodingKey::from_secret(&[]),
            validation,
        }
    }

    pub fn claims<T: DeserializeOwned>(&self, token: &str) -> Result<T, AuthError> {
        let token_data = decode::<T>(token, &self.decoding_key, &self.validation)
            .map_err(|e| AuthError::internal(format!("Invalid JWT: {}", e)))?;

        Ok(token_data.claims)
    }

    /// `None` when the token simply has no `exp`
    pub fn expires_at(&self, token: &str) -> Result<Option<DateTime<Utc>>, AuthError> {
        let claim: ExpiryClaim = self.claims(token)?;
        Ok(claim.exp.and_then(|exp| Utc.timestamp_opt(exp, 0).single()))
    }

    /// Undecodable counts as expired, a missing `exp` never expires
    pub fn is_expired(&self, token: &str, now: DateTime<Utc>) -> bool {
        match self.expires_at(token) {
            Ok(Some(expires_at)) => expires_at < now,
            Ok(None) => false,
            Err(e) => {
                tracing::debug!("Treating undecodable access token as expired: {}", e);
                true
            }
        }
    }

    pub fn identity(&self, token: Option<&str>) -> Option<UserProfile> {
        self.claims(token?).ok()
    }
}

/// What an identity token coming back from a redirect has to satisfy
pub struct IdTokenCheck<'a> {
    pub client_id: &'a str,
    pub nonce: Option<&'a str>,
    pub now: DateTime<Utc>,
}

impl IdTokenCheck<'_> {
    pub fn verify(&self, claims: &UserProfile) -> Result<(), AuthError> {
        let skew = Duration::seconds(MAX_CLOCK_SKEW_SECS);

        if let Some(iat) = claims.iat {
            if iat > (self.now + skew).timestamp() {
                return Err(AuthError::new(
                    AuthErrorCode::InvalidToken,
                    "The JWT was issued in the future",
                ));
            }
        }

        if let Some(exp) = claims.exp {
            if exp < (self.now - skew).timestamp() {
                return Err(AuthError::new(
                    AuthErrorCode::InvalidToken,
                    "The JWT expired and is no longer valid",
                ));
            }
        }

        if let Some(aud) = &claims.aud {
            if !aud.contains(self.client_id) {
                return Err(AuthError::new(
                    AuthErrorCode::InvalidToken,
                    format!(
                        "The audience [{:?}] does not match [{}]",
                        aud, self.client_id
                    ),
                ));
            }
        }

        if let Some(expected) = self.nonce {
            if claims.nonce.as_deref() != Some(expected) {
                return Err(AuthError::new(
                    AuthErrorCode::InvalidToken,
                    "OAuth flow response nonce doesn't match request nonce",
                ));
            }
        }

        Ok(())
    }
}
