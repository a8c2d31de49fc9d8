//! Token lifecycle for the kubelens dashboard: implicit-flow login against
//! auth0 or okta, a cached token pair, and renewal ahead of every expiry.

pub mod auth;

pub use auth::{AuthClient, AuthError, AuthErrorCode, OAuthConfig, TokenResult, UserProfile};
