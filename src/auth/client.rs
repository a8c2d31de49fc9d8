use super::OAuthConfig;
use super::auth0::Auth0Strategy;
use super::browser::MemoryBrowser;
use super::error::AuthError;
use super::implicit::{HttpSessionProbe, ImplicitFlow, QueryParams, SessionProbe, origin_of};
use super::okta::OktaStrategy;
use super::token::ClaimsDecoder;
use super::traits::{
    AuthEvent, Browser, Clock, CredentialStrategy, History, Provider, SystemClock, TokenResult,
    UserProfile,
};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Renewal kicks in this long before the access token expires
pub const RENEW_BEFORE_EXPIRY: Duration = Duration::from_secs(5 * 60);

/// A provider that keeps handing out tokens inside the renewal window would
/// otherwise have us renewing in a tight loop
const MAX_IMMEDIATE_RENEWALS: usize = 5;

const EVENT_CAPACITY: usize = 16;

/// Fire strictly after the renewal point, never on it
const TIMER_SLACK: Duration = Duration::from_millis(1);

fn renewal_deadline(delay: Duration) -> Instant {
    Instant::now() + delay + TIMER_SLACK
}

#[derive(Debug, Clone, Default)]
struct TokenPair {
    access_token: Option<String>,
    identity_token: Option<String>,
}

struct RenewalTimer {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct Inner {
    config: OAuthConfig,
    strategy: Box<dyn CredentialStrategy + Send + Sync>,
    browser: Arc<dyn Browser + Send + Sync>,
    clock: Arc<dyn Clock + Send + Sync>,
    decoder: ClaimsDecoder,
    tokens: RwLock<TokenPair>,
    timer: Mutex<Option<RenewalTimer>>,
    events: broadcast::Sender<AuthEvent>,
}

/// Holds the token pair, hands provider work to the selected strategy and
/// keeps the session alive by renewing ahead of every expiry.
///
/// Dropping the client stops the renewal chain.
pub struct AuthClient {
    inner: Arc<Inner>,
}

pub struct AuthClientBuilder {
    config: OAuthConfig,
    browser: Option<Arc<dyn Browser + Send + Sync>>,
    history: Option<Arc<dyn History + Send + Sync>>,
    clock: Option<Arc<dyn Clock + Send + Sync>>,
    probe: Option<Arc<dyn SessionProbe + Send + Sync>>,
    strategy: Option<Box<dyn CredentialStrategy + Send + Sync>>,
}

impl AuthClientBuilder {
    /// Without one the client gets a [`MemoryBrowser`] parked on the redirect uri
    pub fn with_browser(mut self, browser: Arc<dyn Browser + Send + Sync>) -> Self {
        self.browser = Some(browser);
        self
    }

    /// App router handle for putting the user back after an auth0 login
    pub fn with_history(mut self, history: Arc<dyn History + Send + Sync>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock + Send + Sync>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_session_probe(mut self, probe: Arc<dyn SessionProbe + Send + Sync>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Skip domain-based selection and use this strategy
    pub fn with_strategy(mut self, strategy: Box<dyn CredentialStrategy + Send + Sync>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn build(self) -> Result<AuthClient, AuthError> {
        self.config.validate()?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let browser: Arc<dyn Browser + Send + Sync> = match self.browser {
            Some(browser) => browser,
            None => Arc::new(MemoryBrowser::new(&self.config.redirect_uri)?),
        };

        let strategy = match self.strategy {
            Some(strategy) => strategy,
            None => {
                let probe: Arc<dyn SessionProbe + Send + Sync> = match self.probe {
                    Some(probe) => probe,
                    None => Arc::new(HttpSessionProbe::new()?),
                };
                let flow = ImplicitFlow::new(browser.clone(), probe, clock.clone());

                let strategy: Box<dyn CredentialStrategy + Send + Sync> =
                    match self.config.provider() {
                        Provider::Okta => Box::new(OktaStrategy::new(flow)),
                        Provider::Auth0 => Box::new(Auth0Strategy::new(flow, self.history)),
                    };
                strategy
            }
        };

        tracing::info!(
            "Auth client using {} strategy for {}",
            strategy.provider(),
            self.config.domain
        );

        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(AuthClient {
            inner: Arc::new(Inner {
                config: self.config,
                strategy,
                browser,
                clock,
                decoder: ClaimsDecoder::new(),
                tokens: RwLock::new(TokenPair::default()),
                timer: Mutex::new(None),
                events,
            }),
        })
    }
}

impl AuthClient {
    pub fn builder(config: OAuthConfig) -> AuthClientBuilder {
        AuthClientBuilder {
            config,
            browser: None,
            history: None,
            clock: None,
            probe: None,
            strategy: None,
        }
    }

    pub fn config(&self) -> &OAuthConfig {
        &self.inner.config
    }

    pub fn provider(&self) -> Provider {
        self.inner.strategy.provider()
    }

    /// Resolves with a usable token pair, going to the provider only when the
    /// cached one is missing or expired. Always leaves a renewal armed.
    pub async fn ensure_authed(&self) -> Result<TokenResult, AuthError> {
        let cached = self.inner.token_pair();
        let inner = &self.inner;

        let result = match cached.access_token {
            Some(access_token) if !inner.is_expired(&access_token) => {
                tracing::debug!("Cached access token still valid");
                TokenResult {
                    access_token,
                    identity: inner.decoder.identity(cached.identity_token.as_deref()),
                    identity_token: cached.identity_token,
                }
            }
            Some(_) => {
                tracing::info!("Access token expired, renewing with {}", self.provider());
                let result = inner.strategy.re_auth(&inner.config).await?;
                inner.store(&result);
                result
            }
            None => {
                tracing::info!("No access token yet, authenticating with {}", self.provider());
                let result = inner.strategy.ensure_authed(&inner.config).await?;
                inner.store(&result);
                result
            }
        };

        inner.schedule(result).await
    }

    /// Sends the browser to the provider's login page
    pub fn login(&self) -> Result<(), AuthError> {
        self.inner.strategy.login(&self.inner.config)
    }

    /// Forgets the tokens, stops renewal and navigates to the provider logout
    pub fn logout(&self, query: Option<&QueryParams>) -> Result<(), AuthError> {
        self.inner.cancel_timer();
        *self
            .inner
            .tokens
            .write()
            .unwrap_or_else(PoisonError::into_inner) = TokenPair::default();

        let query = query.map(QueryParams::to_query_string).unwrap_or_default();
        let url = Url::parse(&format!(
            "{}/logout?{}",
            origin_of(&self.inner.config.domain),
            query
        ))?;

        tracing::info!("Logging out via {}", url.origin().ascii_serialization());
        self.inner.browser.assign(&url);
        Ok(())
    }

    /// Claims of the current identity token, `None` if absent or undecodable
    pub fn identity(&self) -> Option<UserProfile> {
        let pair = self.inner.token_pair();
        self.inner.decoder.identity(pair.identity_token.as_deref())
    }

    pub fn is_logged_in(&self) -> bool {
        self.inner
            .token_pair()
            .access_token
            .is_some_and(|token| !self.inner.is_expired(&token))
    }

    pub fn access_token(&self) -> Option<String> {
        self.inner.token_pair().access_token
    }

    pub fn identity_token(&self) -> Option<String> {
        self.inner.token_pair().identity_token
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.inner.events.subscribe()
    }
}

impl Drop for AuthClient {
    fn drop(&mut self) {
        if let Some(timer) = self.inner.take_timer() {
            timer.cancel.cancel();
            timer.task.abort();
        }
    }
}

impl Inner {
    fn token_pair(&self) -> TokenPair {
        self.tokens
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn store(&self, result: &TokenResult) {
        let mut tokens = self.tokens.write().unwrap_or_else(PoisonError::into_inner);
        tokens.access_token = Some(result.access_token.clone());
        tokens.identity_token = result.identity_token.clone();
    }

    fn is_expired(&self, access_token: &str) -> bool {
        self.decoder.is_expired(access_token, self.clock.now())
    }

    /// `None` once we are inside the renewal window (or past expiry)
    fn renew_in(&self, access_token: &str) -> Result<Option<Duration>, AuthError> {
        let expires_at_ms = self
            .decoder
            .expires_at(access_token)?
            .map(|at| at.timestamp_millis())
            .unwrap_or(0);
        let renew_in_ms = expires_at_ms
            - self.clock.now().timestamp_millis()
            - RENEW_BEFORE_EXPIRY.as_millis() as i64;

        Ok((renew_in_ms > 0).then(|| Duration::from_millis(renew_in_ms as u64)))
    }

    /// Renews right away for as long as the provider hands back tokens that
    /// are already due, then reports how long the settled token has left.
    /// `Ok(None)` means `cancel` fired while a renewal was in flight and its
    /// result was dropped.
    async fn settle(
        &self,
        mut result: TokenResult,
        cancel: Option<&CancellationToken>,
    ) -> Result<Option<(TokenResult, Duration)>, AuthError> {
        let mut renewals = 0;
        loop {
            if let Some(delay) = self.renew_in(&result.access_token)? {
                return Ok(Some((result, delay)));
            }
            if renewals == MAX_IMMEDIATE_RENEWALS {
                return Err(AuthError::internal(format!(
                    "Provider returned {} consecutive tokens inside the renewal window",
                    renewals
                )));
            }
            renewals += 1;

            tracing::info!("Access token due for renewal already, renewing now");
            result = self.strategy.re_auth(&self.config).await?;
            if cancel.is_some_and(CancellationToken::is_cancelled) {
                return Ok(None);
            }
            self.store(&result);
        }
    }

    async fn schedule(self: &Arc<Self>, result: TokenResult) -> Result<TokenResult, AuthError> {
        let (result, delay) = self
            .settle(result, None)
            .await?
            .ok_or_else(|| AuthError::internal("Renewal cancelled without a timer"))?;
        self.arm(delay);
        Ok(result)
    }

    /// Replaces whatever renewal was pending with one `delay` from now
    fn arm(self: &Arc<Self>, delay: Duration) {
        let cancel = CancellationToken::new();
        let deadline = renewal_deadline(delay);
        let task = tokio::spawn(Arc::clone(self).renewal_loop(deadline, cancel.clone()));

        tracing::debug!("Next token renewal in {}s", delay.as_secs());

        let previous = self
            .timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(RenewalTimer { cancel, task });
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }
    }

    fn take_timer(&self) -> Option<RenewalTimer> {
        self.timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn cancel_timer(&self) {
        if let Some(timer) = self.take_timer() {
            timer.cancel.cancel();
        }
    }

    async fn renewal_loop(self: Arc<Self>, mut deadline: Instant, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {}
                _ = cancel.cancelled() => {
                    tracing::debug!("Token renewal cancelled");
                    return;
                }
            }

            tracing::info!("Renewing access token ahead of expiry");
            let renewed = match self.strategy.re_auth(&self.config).await {
                Ok(renewed) => renewed,
                Err(e) => return self.renewal_failed(e),
            };

            // logged out or superseded while the provider was answering
            if cancel.is_cancelled() {
                tracing::debug!("Discarding renewal for a cancelled timer");
                return;
            }
            self.store(&renewed);

            match self.settle(renewed, Some(&cancel)).await {
                Ok(Some((result, delay))) => {
                    let expires_at = self.decoder.expires_at(&result.access_token).ok().flatten();
                    let _ = self.events.send(AuthEvent::Renewed { expires_at });
                    tracing::debug!("Next token renewal in {}s", delay.as_secs());
                    deadline = renewal_deadline(delay);
                }
                Ok(None) => {
                    tracing::debug!("Discarding renewal for a cancelled timer");
                    return;
                }
                Err(e) => return self.renewal_failed(e),
            }
        }
    }

    /// The strategy has already sent the user to login if it could; all that
    /// is left is to say so and stop the chain
    fn renewal_failed(&self, e: AuthError) {
        tracing::error!("Background token renewal failed: {}", e);
        let _ = self.events.send(AuthEvent::RenewalFailed(e));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::error::AuthErrorCode;
    use crate::auth::token::tests::sign;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const ONE_MS: Duration = Duration::from_millis(1);
    const STALL: Duration = Duration::from_secs(1);

    /// Wall clock glued to tokio's (paused) clock, at the whole-second
    /// resolution JWT timestamps have
    struct TestClock {
        base: DateTime<Utc>,
        start: Instant,
    }

    impl TestClock {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                base: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
                start: Instant::now(),
            })
        }
    }

    impl Clock for TestClock {
        fn now(&self) -> DateTime<Utc> {
            self.base + chrono::Duration::seconds(self.start.elapsed().as_secs() as i64)
        }
    }

    #[derive(Default)]
    struct Calls {
        ensure: AtomicUsize,
        re_auth: AtomicUsize,
        login: AtomicUsize,
    }

    impl Calls {
        fn re_auth(&self) -> usize {
            self.re_auth.load(Ordering::SeqCst)
        }
    }

    struct ScriptedStrategy {
        clock: Arc<TestClock>,
        calls: Arc<Calls>,
        ensure_result: Mutex<Option<Result<TokenResult, AuthError>>>,
        renewals: Mutex<VecDeque<Result<TokenResult, AuthError>>>,
        /// this re_auth call (1-based) takes STALL to answer
        stall_on: Option<usize>,
    }

    fn ten_minutes() -> chrono::Duration {
        chrono::Duration::minutes(10)
    }

    fn token_with(clock: &TestClock, lifetime: chrono::Duration, tag: &str) -> TokenResult {
        let access = sign(json!({
            "sub": "user-1",
            "exp": (clock.now() + lifetime).timestamp(),
            "jti": tag,
        }));
        let id = sign(json!({ "sub": "user-1", "name": "Test User", "jti": tag }));
        TokenResult::new(access, Some(id))
    }

    #[async_trait]
    impl CredentialStrategy for ScriptedStrategy {
        fn provider(&self) -> Provider {
            Provider::Auth0
        }

        fn login(&self, _config: &OAuthConfig) -> Result<(), AuthError> {
            self.calls.login.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn ensure_authed(&self, _config: &OAuthConfig) -> Result<TokenResult, AuthError> {
            self.calls.ensure.fetch_add(1, Ordering::SeqCst);
            self.ensure_result
                .lock()
                .unwrap()
                .take()
                .unwrap_or_else(|| Ok(token_with(&self.clock, ten_minutes(), "initial")))
        }

        async fn re_auth(&self, _config: &OAuthConfig) -> Result<TokenResult, AuthError> {
            let n = self.calls.re_auth.fetch_add(1, Ordering::SeqCst) + 1;
            if self.stall_on == Some(n) {
                tokio::time::sleep(STALL).await;
            }
            self.renewals
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(token_with(&self.clock, ten_minutes(), &format!("renewed-{}", n))))
        }
    }

    struct Harness {
        client: AuthClient,
        browser: Arc<MemoryBrowser>,
        clock: Arc<TestClock>,
        calls: Arc<Calls>,
    }

    fn config() -> OAuthConfig {
        OAuthConfig {
            client_id: "testClientId".into(),
            domain: "tenant.auth0.com".into(),
            response_type: "token".into(),
            redirect_uri: "http://testRedirectUri".into(),
            audience: "testAudience".into(),
            scope: "profile".into(),
            connection: Some("testConnection".into()),
        }
    }

    fn harness_with(
        ensure_result: Option<Result<TokenResult, AuthError>>,
        renewals: Vec<Result<TokenResult, AuthError>>,
    ) -> Harness {
        stalling_harness(ensure_result, renewals, None)
    }

    fn stalling_harness(
        ensure_result: Option<Result<TokenResult, AuthError>>,
        renewals: Vec<Result<TokenResult, AuthError>>,
        stall_on: Option<usize>,
    ) -> Harness {
        let clock = TestClock::new();
        let calls = Arc::new(Calls::default());
        let browser = Arc::new(MemoryBrowser::at("https://lens.example.com/"));
        let strategy = ScriptedStrategy {
            clock: clock.clone(),
            calls: calls.clone(),
            ensure_result: Mutex::new(ensure_result),
            renewals: Mutex::new(renewals.into()),
            stall_on,
        };
        let client = AuthClient::builder(config())
            .with_browser(browser.clone())
            .with_clock(clock.clone())
            .with_strategy(Box::new(strategy))
            .build()
            .unwrap();
        Harness {
            client,
            browser,
            clock,
            calls,
        }
    }

    fn harness() -> Harness {
        harness_with(None, Vec::new())
    }

    fn seed(client: &AuthClient, access_token: &str, identity_token: Option<&str>) {
        let mut tokens = client.inner.tokens.write().unwrap();
        tokens.access_token = Some(access_token.to_string());
        tokens.identity_token = identity_token.map(str::to_string);
    }

    /// Lets spawned renewal tasks run up to their next await on the clock
    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn test_build_reports_all_missing_fields() {
        let browser = Arc::new(MemoryBrowser::at("https://lens.example.com/"));
        let cfg = OAuthConfig {
            client_id: String::new(),
            audience: String::new(),
            connection: None,
            ..config()
        };
        let err = AuthClient::builder(cfg)
            .with_browser(browser)
            .build()
            .err()
            .unwrap();
        assert_eq!(err.code, AuthErrorCode::MissingConfiguration);
        assert_eq!(
            err.message,
            "No oAuth client id specified in configuration, \
             No oAuth audience specified in configuration, \
             No oAuth connection specified in configuration"
        );
    }

    #[test]
    fn test_strategy_selected_by_domain() {
        let browser = Arc::new(MemoryBrowser::at("https://lens.example.com/"));
        let probe = Arc::new(NeverCalledProbe);

        let auth0 = AuthClient::builder(
            OAuthConfig {
                connection: Some(String::new()),
                ..config()
            },
        )
        .with_browser(browser.clone())
        .with_session_probe(probe.clone())
        .build()
        .unwrap();
        assert_eq!(auth0.provider(), Provider::Auth0);

        let okta = AuthClient::builder(
            OAuthConfig {
                domain: "https://dev-1.okta.com/oauth2/default/".into(),
                ..config()
            },
        )
        .with_browser(browser)
        .with_session_probe(probe)
        .build()
        .unwrap();
        assert_eq!(okta.provider(), Provider::Okta);
    }

    struct NeverCalledProbe;

    #[async_trait]
    impl SessionProbe for NeverCalledProbe {
        async fn authorize_silently(&self, _url: Url) -> Result<Url, AuthError> {
            panic!("silent authorization should not run in this test");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_token_delegates_to_strategy_ensure_authed() {
        let h = harness();
        let result = h.client.ensure_authed().await.unwrap();

        assert_eq!(h.calls.ensure.load(Ordering::SeqCst), 1);
        assert_eq!(h.calls.re_auth(), 0);
        assert_eq!(h.client.access_token(), Some(result.access_token.clone()));
        assert_eq!(h.client.identity_token(), result.identity_token);
        assert!(h.client.is_logged_in());
        assert_eq!(h.client.identity().unwrap().name.as_deref(), Some("Test User"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cached_token_is_returned_without_provider_calls() {
        let h = harness();
        let cached = token_with(&h.clock, ten_minutes(), "cached");
        seed(
            &h.client,
            &cached.access_token,
            cached.identity_token.as_deref(),
        );

        let first = h.client.ensure_authed().await.unwrap();
        let second = h.client.ensure_authed().await.unwrap();

        assert_eq!(first.access_token, cached.access_token);
        assert_eq!(first, second);
        assert_eq!(first.identity.unwrap().name.as_deref(), Some("Test User"));
        assert_eq!(h.calls.ensure.load(Ordering::SeqCst), 0);
        assert_eq!(h.calls.re_auth(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cached_token_with_bad_identity_token_has_no_identity() {
        let h = harness();
        let cached = token_with(&h.clock, ten_minutes(), "cached");
        seed(&h.client, &cached.access_token, Some("garbage"));

        let result = h.client.ensure_authed().await.unwrap();
        assert!(result.identity.is_none());
        assert!(h.client.identity().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_token_goes_through_re_auth() {
        let h = harness();
        let stale = token_with(&h.clock, -chrono::Duration::seconds(1), "stale");
        seed(&h.client, &stale.access_token, None);
        assert!(!h.client.is_logged_in());

        let result = h.client.ensure_authed().await.unwrap();

        assert_eq!(h.calls.re_auth(), 1);
        assert_eq!(h.calls.ensure.load(Ordering::SeqCst), 0);
        assert_ne!(result.access_token, stale.access_token);
        assert_eq!(h.client.access_token(), Some(result.access_token));
    }

    #[tokio::test(start_paused = true)]
    async fn test_strategy_failure_propagates_without_scheduling() {
        let h = harness_with(
            Some(Err(AuthError::new(
                AuthErrorCode::InvalidToken,
                "The JWT was issued in the future",
            ))),
            Vec::new(),
        );

        let err = h.client.ensure_authed().await.unwrap_err();
        assert!(err.is_clock_skew());
        assert!(h.client.access_token().is_none());

        tokio::time::advance(Duration::from_secs(3600)).await;
        settle().await;
        assert_eq!(h.calls.re_auth(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewal_is_self_sustaining() {
        let h = harness();
        let mut current = h.client.ensure_authed().await.unwrap().access_token;
        let mut events = h.client.subscribe();

        for cycle in 1..=5 {
            // exactly five minutes in is still too early
            tokio::time::advance(RENEW_BEFORE_EXPIRY).await;
            settle().await;
            assert_eq!(h.calls.re_auth(), cycle - 1);

            tokio::time::advance(ONE_MS).await;
            settle().await;
            assert_eq!(h.calls.re_auth(), cycle);

            let renewed = h.client.access_token().unwrap();
            assert_ne!(renewed, current);
            current = renewed;
            assert!(matches!(
                events.try_recv(),
                Ok(AuthEvent::Renewed { expires_at: Some(_) })
            ));
        }
        assert!(h.client.is_logged_in());
    }

    #[tokio::test(start_paused = true)]
    async fn test_logout_during_chained_renewal_discards_result() {
        let clock = TestClock::new();
        // first background renewal hands back a token that is already due,
        // and the follow-up renewal is still in flight when we log out
        let due = token_with(&clock, chrono::Duration::minutes(1), "due");
        let h = stalling_harness(None, vec![Ok(due)], Some(2));
        h.client.ensure_authed().await.unwrap();

        tokio::time::advance(RENEW_BEFORE_EXPIRY + ONE_MS).await;
        settle().await;
        assert_eq!(h.calls.re_auth(), 2);

        h.client.logout(None).unwrap();
        tokio::time::advance(STALL).await;
        settle().await;

        assert!(h.client.access_token().is_none());
        assert!(h.client.identity_token().is_none());
        assert!(!h.client.is_logged_in());

        tokio::time::advance(Duration::from_secs(3600)).await;
        settle().await;
        assert_eq!(h.calls.re_auth(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_near_expiry_token_renews_before_returning() {
        let clock = TestClock::new();
        let near = token_with(&clock, chrono::Duration::minutes(4), "near");
        let h = harness_with(Some(Ok(near.clone())), Vec::new());

        let result = h.client.ensure_authed().await.unwrap();

        assert_eq!(h.calls.re_auth(), 1);
        assert_ne!(result.access_token, near.access_token);
        assert_eq!(h.client.access_token(), Some(result.access_token));
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_without_exp_renews_immediately() {
        let no_exp = TokenResult::new(sign(json!({ "sub": "user-1" })), None);
        let h = harness_with(Some(Ok(no_exp)), Vec::new());

        h.client.ensure_authed().await.unwrap();
        assert_eq!(h.calls.re_auth(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_renewals_are_capped() {
        let clock = TestClock::new();
        let due = || Ok(token_with(&clock, chrono::Duration::minutes(1), "due"));
        let h = harness_with(Some(due()), (0..10).map(|_| due()).collect());

        let err = h.client.ensure_authed().await.unwrap_err();
        assert_eq!(err.code, AuthErrorCode::Internal);
        assert_eq!(h.calls.re_auth(), MAX_IMMEDIATE_RENEWALS);
    }

    #[tokio::test(start_paused = true)]
    async fn test_undecodable_access_token_fails_scheduling() {
        let h = harness_with(Some(Ok(TokenResult::new("opaque", None))), Vec::new());
        let err = h.client.ensure_authed().await.unwrap_err();
        assert_eq!(err.code, AuthErrorCode::Internal);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_renewal_failure_is_broadcast_and_stops_chain() {
        let h = harness_with(
            None,
            vec![Err(AuthError::new(AuthErrorCode::LoginRequired, "invalid session"))],
        );
        let initial = h.client.ensure_authed().await.unwrap();
        let mut events = h.client.subscribe();

        tokio::time::advance(RENEW_BEFORE_EXPIRY + ONE_MS).await;
        settle().await;
        assert_eq!(h.calls.re_auth(), 1);
        match events.try_recv() {
            Ok(AuthEvent::RenewalFailed(e)) => assert_eq!(e.code, AuthErrorCode::LoginRequired),
            other => panic!("expected renewal failure, got {:?}", other),
        }
        // pair is kept; it will read as expired once its time is up
        assert_eq!(h.client.access_token(), Some(initial.access_token));

        tokio::time::advance(Duration::from_secs(3600)).await;
        settle().await;
        assert_eq!(h.calls.re_auth(), 1);
        assert!(!h.client.is_logged_in());
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeat_ensure_authed_keeps_a_single_timer() {
        let h = harness();
        h.client.ensure_authed().await.unwrap();
        h.client.ensure_authed().await.unwrap();
        h.client.ensure_authed().await.unwrap();

        tokio::time::advance(RENEW_BEFORE_EXPIRY + ONE_MS).await;
        settle().await;
        assert_eq!(h.calls.re_auth(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_logout_clears_tokens_cancels_timer_and_navigates() {
        let h = harness();
        h.client.ensure_authed().await.unwrap();

        h.client
            .logout(Some(
                &QueryParams::new()
                    .flag("federate")
                    .param("returnTo", "https://example.com"),
            ))
            .unwrap();

        assert!(h.client.access_token().is_none());
        assert!(h.client.identity_token().is_none());
        assert!(!h.client.is_logged_in());
        assert_eq!(
            h.browser.last_navigation().unwrap().as_str(),
            "https://tenant.auth0.com/logout?federate&returnTo=https%3A%2F%2Fexample.com"
        );

        tokio::time::advance(Duration::from_secs(3600)).await;
        settle().await;
        assert_eq!(h.calls.re_auth(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_logout_without_params() {
        let h = harness();
        h.client.logout(None).unwrap();
        assert_eq!(
            h.browser.last_navigation().unwrap().as_str(),
            "https://tenant.auth0.com/logout?"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_client_stops_renewal() {
        let h = harness();
        h.client.ensure_authed().await.unwrap();
        let calls = h.calls.clone();
        drop(h);

        tokio::time::advance(Duration::from_secs(3600)).await;
        settle().await;
        assert_eq!(calls.re_auth(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_delegates_to_strategy() {
        let h = harness();
        h.client.login().unwrap();
        assert_eq!(h.calls.login.load(Ordering::SeqCst), 1);
    }
}
