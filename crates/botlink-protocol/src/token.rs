/// Token lifecycle: short-lived access tokens backed by a long-lived,
/// rotating refresh token.
///
/// The manager owns the `TokenRecord` under a single-writer lock held
/// across the refresh round-trip, so concurrent callers share one
/// in-flight refresh outcome instead of racing the rotation.
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Refresh this long before expiry rather than cutting it to the wire.
pub const DEFAULT_RENEWAL_SKEW: Duration = Duration::from_secs(30);

/// One authenticated session's credentials. Rotation replaces the whole
/// record; the prior access token is invalid the instant a new one is
/// issued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub access_token: String,
    pub refresh_token: String,
    /// UTC, second granularity — subsecond precision is truncated so the
    /// persistence round-trip is lossless.
    pub expiry: DateTime<Utc>,
}

impl TokenRecord {
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        expiry: DateTime<Utc>,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            expiry: expiry.trunc_subsecs(0),
        }
    }

    /// Usable without a refresh: `now < expiry - skew`.
    pub fn is_fresh(&self, now: DateTime<Utc>, skew: Duration) -> bool {
        let skew = chrono::Duration::from_std(skew).unwrap_or(chrono::Duration::zero());
        now < self.expiry - skew
    }
}

/// Persistence collaborator. Invoked only by the token manager.
#[async_trait::async_trait]
pub trait TokenStore: Send + Sync {
    async fn load(&self) -> Result<Option<TokenRecord>, ProtocolError>;
    async fn save(&self, record: &TokenRecord) -> Result<(), ProtocolError>;
}

/// The refresh round-trip. Implemented over the pending-call registry
/// by the session; mocked in tests.
#[async_trait::async_trait]
pub trait TokenRefresher: Send + Sync {
    /// Exchange the current refresh token for a rotated record.
    async fn refresh(&self, refresh_token: &str) -> Result<TokenRecord, ProtocolError>;
}

struct TokenState {
    record: Option<TokenRecord>,
    logged_out: bool,
}

pub struct TokenManager {
    state: tokio::sync::Mutex<TokenState>,
    store: Arc<dyn TokenStore>,
    refresher: Arc<dyn TokenRefresher>,
    renewal_skew: Duration,
}

impl TokenManager {
    pub fn new(store: Arc<dyn TokenStore>, refresher: Arc<dyn TokenRefresher>) -> Self {
        Self::with_renewal_skew(store, refresher, DEFAULT_RENEWAL_SKEW)
    }

    pub fn with_renewal_skew(
        store: Arc<dyn TokenStore>,
        refresher: Arc<dyn TokenRefresher>,
        renewal_skew: Duration,
    ) -> Self {
        Self {
            state: tokio::sync::Mutex::new(TokenState {
                record: None,
                logged_out: true,
            }),
            store,
            refresher,
            renewal_skew,
        }
    }

    /// Install credentials after an external login.
    pub async fn login(&self, record: TokenRecord) -> Result<(), ProtocolError> {
        self.store.save(&record).await?;
        let mut state = self.state.lock().await;
        state.record = Some(record);
        state.logged_out = false;
        Ok(())
    }

    /// Drop credentials. Subsequent token requests fail with
    /// `AuthenticationExpired` until the next login.
    pub async fn logout(&self) {
        let mut state = self.state.lock().await;
        state.record = None;
        state.logged_out = true;
    }

    /// Load persisted credentials — reconnect without re-login.
    pub async fn restore(&self) -> Result<bool, ProtocolError> {
        let loaded = self.store.load().await?;
        let mut state = self.state.lock().await;
        match loaded {
            Some(record) => {
                state.record = Some(record);
                state.logged_out = false;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn is_logged_in(&self) -> bool {
        !self.state.lock().await.logged_out
    }

    /// Current access token, refreshing first when it is within the
    /// renewal skew of expiry.
    ///
    /// The state lock is held across the refresh, so every concurrent
    /// caller observes the same rotated token and exactly one refresh
    /// round-trip is issued. An auth-level failure (expired or revoked
    /// refresh token) logs the session out and surfaces
    /// `AuthenticationExpired` to all of them; a transport-level failure
    /// propagates without touching the credentials.
    pub async fn get_access_token(&self) -> Result<String, ProtocolError> {
        let mut state = self.state.lock().await;

        if state.logged_out {
            return Err(ProtocolError::AuthenticationExpired);
        }
        let record = state
            .record
            .as_ref()
            .ok_or(ProtocolError::AuthenticationExpired)?;
        if record.is_fresh(Utc::now(), self.renewal_skew) {
            return Ok(record.access_token.clone());
        }

        let refresh_token = record.refresh_token.clone();
        match self.refresher.refresh(&refresh_token).await {
            Ok(rotated) => {
                // The server already consumed the old refresh token, so
                // the rotated record is installed unconditionally; a
                // failed save only costs the restore after a restart.
                let access = rotated.access_token.clone();
                if let Err(e) = self.store.save(&rotated).await {
                    tracing::warn!("failed to persist rotated token record: {e}");
                }
                state.record = Some(rotated);
                Ok(access)
            }
            Err(e) if e.is_auth_failure() => {
                tracing::warn!("token refresh rejected, session logged out: {e}");
                state.record = None;
                state.logged_out = true;
                Err(ProtocolError::AuthenticationExpired)
            }
            Err(e) => Err(e),
        }
    }
}
