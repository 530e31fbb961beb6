//! Configuration Types
//!
//! OAuth2 client configuration types.

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// OAuth2 client configuration.
#[derive(Clone)]
pub struct OAuth2Config {
    /// Provider configuration.
    pub provider: ProviderConfig,
    /// Client credentials.
    pub credentials: ClientCredentials,
    /// Redirect URI registered with the provider.
    pub redirect_uri: String,
    /// Scopes requested during interactive authorization.
    pub scopes: Vec<String>,
    /// Popup window geometry.
    pub window: PopupWindowConfig,
    /// Namespace prefix for persisted credential entries.
    pub storage_prefix: String,
    /// Alternate name the server uses for the `WWW-Authenticate` header.
    pub www_authenticate_header: Option<String>,
    /// HTTP timeout.
    pub timeout: Duration,
    /// How long an authorization popup waits for its redirect.
    pub authorization_timeout: Duration,
}

impl OAuth2Config {
    /// Name of the response header carrying authentication challenges.
    pub fn challenge_header_name(&self) -> &str {
        self.www_authenticate_header
            .as_deref()
            .unwrap_or(WWW_AUTHENTICATE)
    }
}

impl std::fmt::Debug for OAuth2Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuth2Config")
            .field("provider", &self.provider)
            .field("credentials", &self.credentials)
            .field("redirect_uri", &self.redirect_uri)
            .field("scopes", &self.scopes)
            .field("window", &self.window)
            .field("storage_prefix", &self.storage_prefix)
            .field("www_authenticate_header", &self.www_authenticate_header)
            .field("timeout", &self.timeout)
            .field("authorization_timeout", &self.authorization_timeout)
            .finish()
    }
}

/// OAuth2 provider endpoint configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Authorization endpoint URL.
    pub authorize_endpoint: String,
    /// Token endpoint URL.
    pub token_endpoint: String,
}

/// Client credentials, always sent in the token request body.
#[derive(Clone)]
pub struct ClientCredentials {
    /// Client identifier.
    pub client_id: String,
    /// Client secret.
    pub client_secret: SecretString,
}

impl std::fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .finish()
    }
}

/// Size of the interactive authorization window.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PopupWindowConfig {
    pub width: u32,
    pub height: u32,
}

impl Default for PopupWindowConfig {
    fn default() -> Self {
        Self {
            width: DEFAULT_WINDOW_WIDTH,
            height: DEFAULT_WINDOW_HEIGHT,
        }
    }
}

/// Grant type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GrantType {
    #[serde(rename = "authorization_code")]
    AuthorizationCode,
    #[serde(rename = "refresh_token")]
    RefreshToken,
}

impl GrantType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AuthorizationCode => "authorization_code",
            Self::RefreshToken => "refresh_token",
        }
    }
}

/// Default configuration values.
pub const WWW_AUTHENTICATE: &str = "WWW-Authenticate";
pub const DEFAULT_STORAGE_PREFIX: &str = "oauth2.";
pub const DEFAULT_REDIRECT_URI: &str = "http://localhost/callback";
pub const DEFAULT_WINDOW_WIDTH: u32 = 500;
pub const DEFAULT_WINDOW_HEIGHT: u32 = 500;
pub const DEFAULT_TIMEOUT_MS: u64 = 30000;
pub const DEFAULT_AUTHORIZATION_TIMEOUT_SECS: u64 = 300;
