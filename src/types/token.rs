//! Token Types
//!
//! Token endpoint responses and the persisted credential record.

use chrono::{DateTime, Duration, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;

/// Token response from authorization server.
#[derive(Clone, Debug, Deserialize)]
pub struct TokenResponse {
    /// Access token. Absent values are installed as an empty string.
    #[serde(default)]
    pub access_token: Option<String>,
    /// Token type (usually "Bearer").
    #[serde(default = "default_token_type")]
    pub token_type: String,
    /// Expires in seconds. Accepts integers, floats and numeric strings.
    #[serde(default, deserialize_with = "lenient_seconds")]
    pub expires_in: Option<u64>,
    /// Refresh token.
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Granted scopes.
    #[serde(default)]
    pub scope: Option<String>,
    /// Additional fields.
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

/// Whole seconds from a JSON number or numeric string; anything else reads as absent.
fn lenient_seconds<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::Number(n)) => {
            n.as_u64().or_else(|| n.as_f64().and_then(whole_seconds))
        }
        Some(serde_json::Value::String(s)) => {
            let s = s.trim();
            s.parse::<u64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().and_then(whole_seconds))
        }
        _ => None,
    })
}

fn whole_seconds(secs: f64) -> Option<u64> {
    (secs.is_finite() && secs >= 0.0).then(|| secs.trunc() as u64)
}

impl TokenResponse {
    /// Expiry instant computed from `expires_in`, relative to `now`.
    ///
    /// A lifetime past the representable range yields `None`.
    pub fn expiry_from(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let secs = i64::try_from(self.expires_in?).ok()?;
        now.checked_add_signed(Duration::try_seconds(secs)?)
    }
}

/// How the access token travels with a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMechanism {
    /// `Authorization: Bearer <token>` request header.
    Header,
    /// `bearer_token=<token>` query parameter.
    Param,
}

impl AuthMechanism {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Header => "header",
            Self::Param => "param",
        }
    }

    /// Parse the persisted representation; unknown values read as unset.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "header" => Some(Self::Header),
            "param" => Some(Self::Param),
            _ => None,
        }
    }
}

impl std::fmt::Display for AuthMechanism {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of the credentials persisted under one namespace prefix.
#[derive(Clone, Default)]
pub struct CredentialRecord {
    pub access_token: Option<SecretString>,
    pub refresh_token: Option<SecretString>,
    /// `None` means the client treats the token as non-expiring.
    pub access_token_expiry: Option<DateTime<Utc>>,
    /// `None` until a mechanism has been learned.
    pub auth_mechanism: Option<AuthMechanism>,
}

impl CredentialRecord {
    /// Access token value, if present.
    pub fn access_token(&self) -> Option<&str> {
        self.access_token.as_ref().map(|t| t.expose_secret().as_str())
    }

    pub fn has_refresh_token(&self) -> bool {
        self.refresh_token.is_some()
    }

    /// Whether the access token expires before `now + lifetime`.
    pub fn expires_within(&self, lifetime: Duration) -> bool {
        self.access_token_expiry
            .map(|exp| {
                Utc::now()
                    .checked_add_signed(lifetime)
                    .map_or(true, |deadline| deadline > exp)
            })
            .unwrap_or(false)
    }
}

impl std::fmt::Debug for CredentialRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialRecord")
            .field("access_token", &self.access_token.as_ref().map(|_| "[REDACTED]"))
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .field("access_token_expiry", &self.access_token_expiry)
            .field("auth_mechanism", &self.auth_mechanism)
            .finish()
    }
}
