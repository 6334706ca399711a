use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use tracing::warn;

use crate::storage::{KeyValueStore, StorageError};

pub const ACCESS_TOKEN_KEY: &str = "access_token";
pub const REFRESH_TOKEN_KEY: &str = "refresh_token";
pub const TOKEN_EXPIRY_KEY: &str = "token_expiry";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access: String,
    pub refresh: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credentials {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |at| at <= now)
    }
}

/// Owns the access/refresh token pair and its locally computed expiry.
///
/// The expiry is stored as milliseconds since the epoch in a decimal string,
/// next to the two tokens.
pub struct CredentialManager {
    kv: Arc<dyn KeyValueStore>,
    ttl: Duration,
}

impl CredentialManager {
    pub fn new(kv: Arc<dyn KeyValueStore>, ttl: Duration) -> Self {
        Self { kv, ttl }
    }

    pub async fn issue(&self, access: &str, refresh: &str) -> Result<Credentials, StorageError> {
        self.issue_at(access, refresh, Utc::now()).await
    }

    pub async fn issue_at(
        &self,
        access: &str,
        refresh: &str,
        issued_at: DateTime<Utc>,
    ) -> Result<Credentials, StorageError> {
        let expires_at = issued_at + self.ttl;
        self.kv.set(ACCESS_TOKEN_KEY, access).await?;
        self.kv.set(REFRESH_TOKEN_KEY, refresh).await?;
        self.kv.set(TOKEN_EXPIRY_KEY, &expires_at.timestamp_millis().to_string()).await?;
        tracing::info!(%expires_at, "credentials issued");
        Ok(Credentials {
            access: access.to_string(),
            refresh: refresh.to_string(),
            expires_at: Some(expires_at),
        })
    }

    pub async fn current(&self) -> Result<Option<Credentials>, StorageError> {
        let Some(access) = self.kv.get(ACCESS_TOKEN_KEY).await? else { return Ok(None) };
        let refresh = self.kv.get(REFRESH_TOKEN_KEY).await?.unwrap_or_default();
        let expires_at = self
            .kv
            .get(TOKEN_EXPIRY_KEY)
            .await?
            .and_then(|raw| raw.trim().parse::<i64>().ok())
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single());
        Ok(Some(Credentials { access, refresh, expires_at }))
    }

    /// True when nothing is held, the expiry is missing or unreadable, or it
    /// has passed.
    pub async fn is_expired(&self) -> bool {
        match self.current().await {
            Ok(Some(creds)) => creds.is_expired_at(Utc::now()),
            Ok(None) => true,
            Err(e) => {
                warn!(error = %e, "credential store unreadable");
                true
            }
        }
    }

    /// Access token to send as a bearer credential, if one is held and live.
    pub async fn bearer(&self) -> Option<String> {
        match self.current().await {
            Ok(Some(creds)) if !creds.is_expired_at(Utc::now()) => Some(creds.access),
            Ok(Some(_)) => {
                warn!("access token expired, sending request without credentials");
                None
            }
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "credential store unreadable");
                None
            }
        }
    }

    pub async fn clear(&self) -> Result<(), StorageError> {
        for key in [ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY, TOKEN_EXPIRY_KEY] {
            self.kv.remove(key).await?;
        }
        Ok(())
    }
}
