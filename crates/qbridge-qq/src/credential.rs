//! Access-token lifecycle for outbound OpenAPI calls.
//!
//! The token is held in an `ArcSwap` so readers never block on a refresh.
//! Refreshes are serialized by an async mutex; a background loop renews the
//! token a minute before it expires and falls back to a fixed retry delay
//! when the token endpoint fails, leaving the last token in place.

use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use anyhow::{bail, Result};
use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use qbridge_core::is_within_margin;
use tokio::sync::watch;

/// Tokens this close to expiry are refreshed before use.
pub const STALENESS_MARGIN: Duration = Duration::from_secs(60);
pub const MIN_REFRESH_DELAY: Duration = Duration::from_secs(60);
pub const REFRESH_RETRY_DELAY: Duration = Duration::from_secs(300);

/// Token as returned by the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub token: String,
    pub expires_in: Duration,
}

/// Anything able to mint a fresh access token.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn fetch_token(&self) -> Result<AccessToken>;
}

/// Delay before the next scheduled refresh: one minute early, never sooner than a minute.
pub fn refresh_delay(expires_in: Duration) -> Duration {
    expires_in
        .saturating_sub(STALENESS_MARGIN)
        .max(MIN_REFRESH_DELAY)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialState {
    Uninitialized,
    Valid,
    Refreshing,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub token: String,
    pub expires_at: SystemTime,
    pub expires_in: Duration,
}

impl Credential {
    pub fn is_stale(&self, now: SystemTime) -> bool {
        is_within_margin(self.expires_at, STALENESS_MARGIN, now)
    }
}

pub struct CredentialManager {
    source: Arc<dyn TokenSource>,
    current: ArcSwapOption<Credential>,
    state: Mutex<CredentialState>,
    refresh_lock: tokio::sync::Mutex<()>,
    retry_delay: Duration,
}

impl std::fmt::Debug for CredentialManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialManager")
            .field("state", &self.state())
            .field(
                "expires_at",
                &self.snapshot().map(|credential| credential.expires_at),
            )
            .finish()
    }
}

impl CredentialManager {
    pub fn new(source: Arc<dyn TokenSource>) -> Self {
        Self {
            source,
            current: ArcSwapOption::empty(),
            state: Mutex::new(CredentialState::Uninitialized),
            refresh_lock: tokio::sync::Mutex::new(()),
            retry_delay: REFRESH_RETRY_DELAY,
        }
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// Builds the manager and performs the first acquisition; errors abort startup.
    pub async fn init(source: Arc<dyn TokenSource>) -> Result<Arc<Self>> {
        let manager = Arc::new(Self::new(source));
        manager.refresh().await?;
        Ok(manager)
    }

    pub fn state(&self) -> CredentialState {
        *self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn snapshot(&self) -> Option<Arc<Credential>> {
        self.current.load_full()
    }

    /// Delay until the scheduled refresh of the current token.
    pub fn next_refresh_delay(&self) -> Duration {
        self.snapshot()
            .map(|credential| refresh_delay(credential.expires_in))
            .unwrap_or(MIN_REFRESH_DELAY)
    }

    /// Fetches a new token unconditionally and returns the next refresh delay.
    pub async fn refresh(&self) -> Result<Duration> {
        let _guard = self.refresh_lock.lock().await;
        self.refresh_locked().await
    }

    /// Token for an outbound call, refreshed inline when within the staleness margin.
    pub async fn current_token(&self) -> Result<String> {
        if let Some(credential) = self.snapshot() {
            if !credential.is_stale(SystemTime::now()) {
                return Ok(credential.token.clone());
            }
        }

        let _guard = self.refresh_lock.lock().await;
        if let Some(credential) = self.snapshot() {
            if !credential.is_stale(SystemTime::now()) {
                return Ok(credential.token.clone());
            }
        }
        match self.refresh_locked().await {
            Ok(_) => self.loaded_token(),
            Err(error) => match self.snapshot() {
                Some(credential) => {
                    tracing::warn!(error = %error, "inline token refresh failed, using last token");
                    Ok(credential.token.clone())
                }
                None => Err(error),
            },
        }
    }

    /// Replaces a token the platform rejected; concurrent callers share one fetch.
    pub async fn force_refresh(&self, rejected: &str) -> Result<String> {
        let _guard = self.refresh_lock.lock().await;
        if let Some(credential) = self.snapshot() {
            if credential.token != rejected {
                return Ok(credential.token.clone());
            }
        }
        self.refresh_locked().await?;
        self.loaded_token()
    }

    async fn refresh_locked(&self) -> Result<Duration> {
        self.set_state(CredentialState::Refreshing);
        match self.source.fetch_token().await {
            Ok(fresh) => {
                let now = SystemTime::now();
                let delay = refresh_delay(fresh.expires_in);
                tracing::info!(
                    expires_in_secs = fresh.expires_in.as_secs(),
                    next_refresh_secs = delay.as_secs(),
                    "qq access token acquired"
                );
                self.current.store(Some(Arc::new(Credential {
                    token: fresh.token,
                    expires_at: now + fresh.expires_in,
                    expires_in: fresh.expires_in,
                })));
                self.set_state(CredentialState::Valid);
                Ok(delay)
            }
            Err(error) => {
                self.set_state(CredentialState::Failed);
                Err(error.context("failed to acquire qq access token"))
            }
        }
    }

    fn loaded_token(&self) -> Result<String> {
        match self.snapshot() {
            Some(credential) => Ok(credential.token.clone()),
            None => bail!("qq access token is not available"),
        }
    }

    fn set_state(&self, state: CredentialState) {
        *self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = state;
    }
}

/// Renews the token on schedule until `shutdown` flips to true.
pub async fn run_refresh_loop(
    manager: Arc<CredentialManager>,
    initial_delay: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut delay = initial_delay;
    loop {
        tracing::debug!(delay_secs = delay.as_secs(), "next qq token refresh scheduled");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {
                delay = match manager.refresh().await {
                    Ok(next) => next,
                    Err(error) => {
                        tracing::error!(
                            error = %format!("{error:#}"),
                            retry_secs = manager.retry_delay.as_secs(),
                            "scheduled qq token refresh failed"
                        );
                        manager.retry_delay
                    }
                };
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use tokio::sync::watch;

    use super::{
        refresh_delay, run_refresh_loop, AccessToken, CredentialManager, CredentialState,
        TokenSource,
    };

    /// Token source replaying scripted outcomes; `None` is a failed fetch.
    pub(crate) struct ScriptedTokenSource {
        script: Mutex<VecDeque<Option<AccessToken>>>,
        fallback: Option<AccessToken>,
        pub(crate) calls: AtomicUsize,
    }

    impl ScriptedTokenSource {
        pub(crate) fn new(script: Vec<Option<AccessToken>>, fallback: Option<AccessToken>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                fallback,
                calls: AtomicUsize::new(0),
            }
        }

        pub(crate) fn always(token: &str, expires_in_secs: u64) -> Self {
            Self::new(Vec::new(), Some(token_for(token, expires_in_secs)))
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    pub(crate) fn token_for(token: &str, expires_in_secs: u64) -> AccessToken {
        AccessToken {
            token: token.to_string(),
            expires_in: Duration::from_secs(expires_in_secs),
        }
    }

    #[async_trait]
    impl TokenSource for ScriptedTokenSource {
        async fn fetch_token(&self) -> Result<AccessToken> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self
                .script
                .lock()
                .expect("script lock")
                .pop_front()
                .unwrap_or_else(|| self.fallback.clone());
            next.ok_or_else(|| anyhow!("token endpoint unavailable"))
        }
    }

    #[test]
    fn unit_refresh_delay_fires_a_minute_early_with_floor() {
        assert_eq!(
            refresh_delay(Duration::from_secs(120)),
            Duration::from_secs(60)
        );
        assert_eq!(
            refresh_delay(Duration::from_secs(30)),
            Duration::from_secs(60)
        );
        assert_eq!(
            refresh_delay(Duration::from_secs(7200)),
            Duration::from_secs(7140)
        );
    }

    #[tokio::test]
    async fn functional_init_failure_propagates() {
        let source = Arc::new(ScriptedTokenSource::new(vec![None], None));
        let error = CredentialManager::init(source.clone())
            .await
            .expect_err("init should fail");
        assert!(format!("{error:#}").contains("token endpoint unavailable"));
    }

    #[tokio::test]
    async fn functional_fresh_token_is_served_without_refetch() {
        let source = Arc::new(ScriptedTokenSource::always("tok-1", 7200));
        let manager = CredentialManager::init(source.clone()).await.expect("init");
        assert_eq!(manager.state(), CredentialState::Valid);
        assert_eq!(manager.current_token().await.expect("token"), "tok-1");
        assert_eq!(manager.current_token().await.expect("token"), "tok-1");
        assert_eq!(source.calls(), 1);
        assert_eq!(manager.next_refresh_delay(), Duration::from_secs(7140));
    }

    #[tokio::test]
    async fn regression_token_within_margin_is_refreshed_inline() {
        let source = Arc::new(ScriptedTokenSource::new(
            vec![Some(token_for("near-expiry", 30))],
            Some(token_for("tok-2", 7200)),
        ));
        let manager = CredentialManager::init(source.clone()).await.expect("init");
        assert_eq!(manager.current_token().await.expect("token"), "tok-2");
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn regression_failed_refresh_keeps_last_token() {
        let source = Arc::new(ScriptedTokenSource::new(
            vec![Some(token_for("tok-1", 7200))],
            None,
        ));
        let manager = CredentialManager::init(source.clone()).await.expect("init");
        assert!(manager.refresh().await.is_err());
        assert_eq!(manager.state(), CredentialState::Failed);
        assert_eq!(manager.snapshot().expect("credential").token, "tok-1");
        assert_eq!(manager.current_token().await.expect("token"), "tok-1");
    }

    #[tokio::test]
    async fn functional_force_refresh_replaces_rejected_token_once() {
        let source = Arc::new(ScriptedTokenSource::new(
            vec![Some(token_for("tok-1", 7200))],
            Some(token_for("tok-2", 7200)),
        ));
        let manager = CredentialManager::init(source.clone()).await.expect("init");
        assert_eq!(manager.force_refresh("tok-1").await.expect("token"), "tok-2");
        assert_eq!(manager.force_refresh("tok-1").await.expect("token"), "tok-2");
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn integration_refresh_loop_retries_after_failure_until_shutdown() {
        let source = Arc::new(ScriptedTokenSource::new(
            vec![Some(token_for("tok-1", 7200))],
            None,
        ));
        let manager = Arc::new(
            CredentialManager::new(source.clone()).with_retry_delay(Duration::from_millis(5)),
        );
        manager.refresh().await.expect("initial refresh");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_refresh_loop(
            manager.clone(),
            Duration::from_millis(5),
            shutdown_rx,
        ));
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(source.calls() >= 3);
        assert_eq!(manager.snapshot().expect("credential").token, "tok-1");

        shutdown_tx.send(true).expect("shutdown");
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop should stop")
            .expect("join");
    }
}
