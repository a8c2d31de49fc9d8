use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kubelens_auth::auth::{
    AuthClient, Browser, ClaimsDecoder, MemoryBrowser, NONCE_KEY, OAuthConfig, QueryParams,
};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// required fields default to empty so a bad setup gets the full list of what's missing
// from OAuthConfig::validate, not clap bailing on the first one
#[derive(Parser, Debug)]
#[command(name = "kubelens-auth")]
#[command(about = "drive the kubelens oauth implicit flow (auth0 or okta) from a terminal")]
struct Args {
    /// OAuth client ID
    #[arg(long, global = true, env = "OAUTH_CLIENT_ID", default_value = "")]
    client_id: String,

    /// Auth0 tenant host, or the full Okta issuer URL
    #[arg(long, global = true, env = "OAUTH_JWT_ISSUER", default_value = "")]
    domain: String,

    /// API audience the access token is for
    #[arg(long, global = true, env = "OAUTH_AUDIENCE", default_value = "")]
    audience: String,

    /// Where the provider sends the browser back to
    #[arg(long, global = true, env = "OAUTH_REDIRECT_URI", default_value = "")]
    redirect_uri: String,

    #[arg(long, global = true, env = "OAUTH_SCOPE", default_value = "openid profile email")]
    scope: String,

    #[arg(long, global = true, env = "OAUTH_RESPONSE_TYPE", default_value = "id_token token")]
    response_type: String,

    /// Auth0 connection (ignored by okta)
    #[arg(long, global = true, env = "OAUTH_CONNECTION", default_value = "")]
    connection: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the URL login would send the browser to
    AuthorizeUrl {
        /// Page the user was on; becomes the state restored after login
        #[arg(long)]
        from: Option<String>,
    },
    /// Finish a login from the URL the provider redirected back to
    Callback {
        url: String,

        /// Nonce printed by authorize-url, checked against the identity token
        #[arg(long)]
        nonce: Option<String>,
    },
    /// Print the provider logout URL
    LogoutUrl {
        /// Bare query key, e.g. --flag federate
        #[arg(long = "flag")]
        flags: Vec<String>,

        /// KEY=VALUE, repeat a key to send it more than once
        #[arg(long = "param", value_parser = parse_param)]
        params: Vec<(String, String)>,
    },
    /// Print the claims and expiry of a JWT without verifying it
    Decode { token: String },
}

fn parse_param(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", raw))
}

impl Args {
    fn oauth_config(&self) -> OAuthConfig {
        OAuthConfig {
            client_id: self.client_id.clone(),
            domain: self.domain.clone(),
            response_type: self.response_type.clone(),
            redirect_uri: self.redirect_uri.clone(),
            audience: self.audience.clone(),
            scope: self.scope.clone(),
            connection: Some(self.connection.clone()),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    // stdout is for results, logs go to stderr
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kubelens_auth=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match &args.command {
        Command::AuthorizeUrl { from } => {
            let config = args.oauth_config();
            config.validate()?;
            let from = from.clone().unwrap_or_else(|| config.redirect_uri.clone());
            let browser = Arc::new(MemoryBrowser::new(&from)?);
            let client = AuthClient::builder(config)
                .with_browser(browser.clone())
                .build()?;

            client.login()?;
            let target = browser
                .last_navigation()
                .context("login did not navigate anywhere")?;

            if let Some(nonce) = browser.session_get(NONCE_KEY) {
                tracing::info!("Pass --nonce {} to callback to check the identity token", nonce);
            }
            println!("{}", target);
        }
        Command::Callback { url, nonce } => {
            let browser = Arc::new(MemoryBrowser::new(url)?);
            if let Some(nonce) = nonce {
                browser.session_set(NONCE_KEY, nonce);
            }
            let client = AuthClient::builder(args.oauth_config())
                .with_browser(browser.clone())
                .build()?;

            let result = match client.ensure_authed().await {
                Ok(result) => result,
                Err(e) => {
                    if let Some(login) = browser.last_navigation() {
                        tracing::warn!("Provider wants a fresh login: {}", login);
                    }
                    return Err(e.into());
                }
            };

            tracing::info!("Authenticated with {}, now at {}", client.provider(), browser.location());
            if let Some(profile) = &result.identity {
                tracing::info!("Logged in as {}", profile.username());
            }
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::LogoutUrl { flags, params } => {
            let query = flags.iter().fold(QueryParams::new(), |q, key| q.flag(key));
            let query = params
                .iter()
                .fold(query, |q, (key, value)| q.param(key, value));

            let config = args.oauth_config();
            config.validate()?;
            let browser = Arc::new(MemoryBrowser::new(&config.redirect_uri)?);
            let client = AuthClient::builder(config)
                .with_browser(browser.clone())
                .build()?;

            client.logout(Some(&query))?;
            let target = browser
                .last_navigation()
                .context("logout did not navigate anywhere")?;
            println!("{}", target);
        }
        Command::Decode { token } => {
            let decoder = ClaimsDecoder::new();
            let claims: serde_json::Value = decoder.claims(token)?;
            println!("{}", serde_json::to_string_pretty(&claims)?);

            match decoder.expires_at(token)? {
                Some(at) => println!("expires: {}", at.to_rfc3339()),
                None => println!("expires: never"),
            }
        }
    }

    Ok(())
}
