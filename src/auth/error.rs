use serde::{Deserialize, Serialize};
use std::fmt;

/// OAuth error codes we know how to talk about. Providers can send anything,
/// so unknown codes are kept verbatim in `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum AuthErrorCode {
    AccessDenied,
    MissingConfiguration,
    LoginRequired,
    InvalidRequest,
    UnauthorizedClient,
    ServerError,
    InvalidScope,
    TemporarilyUnavailable,
    UnsupportedResponseType,
    TooManyAttempts,
    InvalidUserPassword,
    InvalidToken,
    Internal,
    Other(String),
}

impl AuthErrorCode {
    pub fn as_str(&self) -> &str {
        match self {
            Self::AccessDenied => "access_denied",
            Self::MissingConfiguration => "missing_configuration",
            Self::LoginRequired => "login_required",
            Self::InvalidRequest => "invalid_request",
            Self::UnauthorizedClient => "unauthorized_client",
            Self::ServerError => "server_error",
            Self::InvalidScope => "invalid_scope",
            Self::TemporarilyUnavailable => "temporarily_unavailable",
            Self::UnsupportedResponseType => "unsupported_response_type",
            Self::TooManyAttempts => "too_many_attempts",
            Self::InvalidUserPassword => "invalid_user_password",
            Self::InvalidToken => "invalid_token",
            Self::Internal => "INTERNAL",
            Self::Other(code) => code,
        }
    }
}

impl From<&str> for AuthErrorCode {
    fn from(code: &str) -> Self {
        match code {
            "access_denied" => Self::AccessDenied,
            "missing_configuration" => Self::MissingConfiguration,
            "login_required" => Self::LoginRequired,
            "invalid_request" => Self::InvalidRequest,
            "unauthorized_client" => Self::UnauthorizedClient,
            "server_error" => Self::ServerError,
            "invalid_scope" => Self::InvalidScope,
            "temporarily_unavailable" => Self::TemporarilyUnavailable,
            "unsupported_response_type" => Self::UnsupportedResponseType,
            "too_many_attempts" => Self::TooManyAttempts,
            "invalid_user_password" => Self::InvalidUserPassword,
            "invalid_token" => Self::InvalidToken,
            "INTERNAL" => Self::Internal,
            other => Self::Other(other.to_string()),
        }
    }
}

impl From<String> for AuthErrorCode {
    fn from(code: String) -> Self {
        Self::from(code.as_str())
    }
}

impl From<AuthErrorCode> for String {
    fn from(code: AuthErrorCode) -> Self {
        code.as_str().to_string()
    }
}

impl fmt::Display for AuthErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The one error type the client hands back, whichever provider produced it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct AuthError {
    pub code: AuthErrorCode,
    pub message: String,
}

impl AuthError {
    pub fn new(code: impl Into<AuthErrorCode>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn missing_configuration(message: impl Into<String>) -> Self {
        Self::new(AuthErrorCode::MissingConfiguration, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(AuthErrorCode::Internal, message)
    }

    /// Provider rejected the token because the local clock is behind.
    /// Redirecting to login would loop forever, so callers must not.
    pub fn is_clock_skew(&self) -> bool {
        self.message.contains("issued in the future")
    }
}

impl From<reqwest::Error> for AuthError {
    fn from(e: reqwest::Error) -> Self {
        Self::new(
            AuthErrorCode::TemporarilyUnavailable,
            format!("identity provider request failed: {}", e),
        )
    }
}

impl From<url::ParseError> for AuthError {
    fn from(e: url::ParseError) -> Self {
        Self::internal(format!("invalid url: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_codes_round_trip_through_strings() {
        assert_eq!(AuthErrorCode::from("login_required"), AuthErrorCode::LoginRequired);
        assert_eq!(AuthErrorCode::from("INTERNAL"), AuthErrorCode::Internal);
        assert_eq!(AuthErrorCode::Internal.as_str(), "INTERNAL");
    }

    #[test]
    fn test_unknown_code_is_preserved() {
        let code = AuthErrorCode::from("consent_required");
        assert_eq!(code, AuthErrorCode::Other("consent_required".to_string()));
        assert_eq!(code.to_string(), "consent_required");
    }

    #[test]
    fn test_display_includes_code_and_message() {
        let err = AuthError::new("invalid_request", "Test Error Message");
        assert_eq!(err.to_string(), "invalid_request: Test Error Message");
    }

    #[test]
    fn test_clock_skew_detection() {
        let skew = AuthError::new(AuthErrorCode::InvalidToken, "The JWT was issued in the future");
        assert!(skew.is_clock_skew());

        let other = AuthError::new(AuthErrorCode::LoginRequired, "invalid session");
        assert!(!other.is_clock_skew());
    }

    #[test]
    fn test_serializes_code_as_plain_string() {
        let err = AuthError::new("login_required", "invalid session");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["code"], "login_required");
        assert_eq!(json["message"], "invalid session");
    }
}
