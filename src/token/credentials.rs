//! Credential Store
//!
//! Typed view over a [`TokenStorage`] for the credentials of one namespace. Four string
//! entries are kept per prefix:
//!
//! | key                            | value                          |
//! |--------------------------------|--------------------------------|
//! | `<prefix>access-token`         | access token                   |
//! | `<prefix>refresh-token`        | refresh token                  |
//! | `<prefix>access-token-expiry`  | expiry, epoch milliseconds     |
//! | `<prefix>auth-mechanism`       | `header` or `param`            |
//!
//! Empty values read as absent.

use chrono::{DateTime, TimeZone, Utc};
use secrecy::SecretString;
use std::sync::Arc;
use tracing::debug;

use crate::error::OAuth2Error;
use crate::token::TokenStorage;
use crate::types::{AuthMechanism, CredentialRecord, TokenResponse};

const ACCESS_TOKEN: &str = "access-token";
const REFRESH_TOKEN: &str = "refresh-token";
const ACCESS_TOKEN_EXPIRY: &str = "access-token-expiry";
const AUTH_MECHANISM: &str = "auth-mechanism";

/// Namespaced credential accessors.
#[derive(Clone)]
pub struct CredentialStore {
    storage: Arc<dyn TokenStorage>,
    prefix: String,
}

impl CredentialStore {
    pub fn new(storage: Arc<dyn TokenStorage>, prefix: impl Into<String>) -> Self {
        Self {
            storage,
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Full storage key for an entry of this namespace.
    pub fn key(&self, entry: &str) -> String {
        format!("{}{}", self.prefix, entry)
    }

    async fn read(&self, entry: &str) -> Result<Option<String>, OAuth2Error> {
        let value = self.storage.get(&self.key(entry)).await?;
        Ok(value.filter(|v| !v.is_empty()))
    }

    async fn write(&self, entry: &str, value: &str) -> Result<(), OAuth2Error> {
        self.storage.set(&self.key(entry), value).await
    }

    async fn delete(&self, entry: &str) -> Result<(), OAuth2Error> {
        self.storage.remove(&self.key(entry)).await.map(|_| ())
    }

    pub async fn access_token(&self) -> Result<Option<String>, OAuth2Error> {
        self.read(ACCESS_TOKEN).await
    }

    pub async fn set_access_token(&self, token: &str) -> Result<(), OAuth2Error> {
        self.write(ACCESS_TOKEN, token).await
    }

    pub async fn remove_access_token(&self) -> Result<(), OAuth2Error> {
        self.delete(ACCESS_TOKEN).await
    }

    pub async fn refresh_token(&self) -> Result<Option<String>, OAuth2Error> {
        self.read(REFRESH_TOKEN).await
    }

    pub async fn set_refresh_token(&self, token: &str) -> Result<(), OAuth2Error> {
        self.write(REFRESH_TOKEN, token).await
    }

    pub async fn remove_refresh_token(&self) -> Result<(), OAuth2Error> {
        self.delete(REFRESH_TOKEN).await
    }

    /// Stored expiry. Unparseable values read as absent.
    pub async fn access_token_expiry(&self) -> Result<Option<DateTime<Utc>>, OAuth2Error> {
        let value = self.read(ACCESS_TOKEN_EXPIRY).await?;
        Ok(value
            .and_then(|v| v.trim().parse::<i64>().ok())
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()))
    }

    /// Store the expiry, or clear it with `None`.
    pub async fn set_access_token_expiry(
        &self,
        expiry: Option<DateTime<Utc>>,
    ) -> Result<(), OAuth2Error> {
        match expiry {
            Some(at) => {
                self.write(ACCESS_TOKEN_EXPIRY, &at.timestamp_millis().to_string())
                    .await
            }
            None => self.delete(ACCESS_TOKEN_EXPIRY).await,
        }
    }

    pub async fn auth_mechanism(&self) -> Result<Option<AuthMechanism>, OAuth2Error> {
        let value = self.read(AUTH_MECHANISM).await?;
        Ok(value.as_deref().and_then(AuthMechanism::parse))
    }

    /// Record a learned mechanism and return the one now in effect.
    ///
    /// `param` is sticky: recording `header` over it is ignored.
    pub async fn record_auth_mechanism(
        &self,
        mechanism: AuthMechanism,
    ) -> Result<AuthMechanism, OAuth2Error> {
        let current = self.auth_mechanism().await?;
        if current == Some(AuthMechanism::Param) {
            return Ok(AuthMechanism::Param);
        }
        if current != Some(mechanism) {
            debug!(prefix = %self.prefix, mechanism = %mechanism, "Recording auth mechanism");
            self.write(AUTH_MECHANISM, mechanism.as_str()).await?;
        }
        Ok(mechanism)
    }

    /// Install the tokens of a successful token endpoint response.
    ///
    /// Missing tokens are written as empty strings, clearing stale values. A missing
    /// `expires_in` clears any stored expiry.
    pub async fn install(
        &self,
        response: &TokenResponse,
        now: DateTime<Utc>,
    ) -> Result<(), OAuth2Error> {
        self.set_access_token(response.access_token.as_deref().unwrap_or(""))
            .await?;
        self.set_refresh_token(response.refresh_token.as_deref().unwrap_or(""))
            .await?;
        self.set_access_token_expiry(response.expiry_from(now)).await
    }

    /// Snapshot of every credential in this namespace.
    pub async fn load(&self) -> Result<CredentialRecord, OAuth2Error> {
        Ok(CredentialRecord {
            access_token: self.access_token().await?.map(SecretString::new),
            refresh_token: self.refresh_token().await?.map(SecretString::new),
            access_token_expiry: self.access_token_expiry().await?,
            auth_mechanism: self.auth_mechanism().await?,
        })
    }

    /// Remove every entry of this namespace.
    pub async fn clear(&self) -> Result<(), OAuth2Error> {
        for entry in [ACCESS_TOKEN, REFRESH_TOKEN, ACCESS_TOKEN_EXPIRY, AUTH_MECHANISM] {
            self.delete(entry).await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialStore")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}
