//! Configuration Builder
//!
//! Fluent builder for OAuth2 configuration.

use std::time::Duration;

use crate::error::{ConfigurationError, OAuth2Error};
use crate::types::{
    ClientCredentials, OAuth2Config, PopupWindowConfig, ProviderConfig,
    DEFAULT_AUTHORIZATION_TIMEOUT_SECS, DEFAULT_REDIRECT_URI, DEFAULT_STORAGE_PREFIX,
    DEFAULT_TIMEOUT_MS,
};
use secrecy::SecretString;

/// OAuth2 configuration builder.
pub struct OAuth2ConfigBuilder {
    client_id: Option<String>,
    client_secret: Option<SecretString>,
    authorize_endpoint: Option<String>,
    token_endpoint: Option<String>,
    redirect_uri: String,
    scopes: Vec<String>,
    window: PopupWindowConfig,
    storage_prefix: String,
    www_authenticate_header: Option<String>,
    timeout: Duration,
    authorization_timeout: Duration,
}

impl Default for OAuth2ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl OAuth2ConfigBuilder {
    /// Create new configuration builder.
    pub fn new() -> Self {
        Self {
            client_id: None,
            client_secret: None,
            authorize_endpoint: None,
            token_endpoint: None,
            redirect_uri: DEFAULT_REDIRECT_URI.to_string(),
            scopes: Vec::new(),
            window: PopupWindowConfig::default(),
            storage_prefix: DEFAULT_STORAGE_PREFIX.to_string(),
            www_authenticate_header: None,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            authorization_timeout: Duration::from_secs(DEFAULT_AUTHORIZATION_TIMEOUT_SECS),
        }
    }

    /// Set client ID.
    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Set client secret.
    pub fn client_secret(mut self, client_secret: impl Into<String>) -> Self {
        self.client_secret = Some(SecretString::new(client_secret.into()));
        self
    }

    /// Set authorization endpoint.
    pub fn authorize_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.authorize_endpoint = Some(endpoint.into());
        self
    }

    /// Set token endpoint.
    pub fn token_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.token_endpoint = Some(endpoint.into());
        self
    }

    /// Set the redirect URI registered with the provider.
    pub fn redirect_uri(mut self, redirect_uri: impl Into<String>) -> Self {
        self.redirect_uri = redirect_uri.into();
        self
    }

    /// Set scopes.
    pub fn scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes = scopes;
        self
    }

    /// Add a scope.
    pub fn add_scope(mut self, scope: impl Into<String>) -> Self {
        self.scopes.push(scope.into());
        self
    }

    /// Set the authorization window size.
    pub fn authorize_window(mut self, width: u32, height: u32) -> Self {
        self.window = PopupWindowConfig { width, height };
        self
    }

    /// Set the namespace prefix for persisted credentials.
    pub fn storage_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.storage_prefix = prefix.into();
        self
    }

    /// Read challenges from this header instead of `WWW-Authenticate`.
    pub fn rename_www_authenticate_header(mut self, name: impl Into<String>) -> Self {
        self.www_authenticate_header = Some(name.into());
        self
    }

    /// Set request timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set how long a popup flow waits for its redirect.
    pub fn authorization_timeout(mut self, timeout: Duration) -> Self {
        self.authorization_timeout = timeout;
        self
    }

    /// Configure endpoints from provider config (e.g., loaded from a file).
    pub fn from_provider_config(mut self, provider: ProviderConfig) -> Self {
        self.authorize_endpoint = Some(provider.authorize_endpoint);
        self.token_endpoint = Some(provider.token_endpoint);
        self
    }

    /// Build the OAuth2 configuration.
    pub fn build(self) -> Result<OAuth2Config, OAuth2Error> {
        let client_id = required(self.client_id, "clientID")?;
        let client_secret = self
            .client_secret
            .ok_or_else(|| missing("clientSecret"))?;
        let authorize_endpoint = required(self.authorize_endpoint, "authorizeEndpoint")?;
        let token_endpoint = required(self.token_endpoint, "tokenEndpoint")?;

        validate_endpoint(&authorize_endpoint)?;
        validate_endpoint(&token_endpoint)?;

        if self.window.width == 0 || self.window.height == 0 {
            return Err(OAuth2Error::Configuration(ConfigurationError::InvalidConfig {
                message: "authorization window must have a non-zero size".to_string(),
            }));
        }

        Ok(OAuth2Config {
            provider: ProviderConfig {
                authorize_endpoint,
                token_endpoint,
            },
            credentials: ClientCredentials {
                client_id,
                client_secret,
            },
            redirect_uri: self.redirect_uri,
            scopes: self.scopes,
            window: self.window,
            storage_prefix: self.storage_prefix,
            www_authenticate_header: self.www_authenticate_header,
            timeout: self.timeout,
            authorization_timeout: self.authorization_timeout,
        })
    }
}

fn missing(field: &str) -> OAuth2Error {
    OAuth2Error::Configuration(ConfigurationError::MissingRequired {
        field: field.to_string(),
    })
}

fn required(value: Option<String>, field: &str) -> Result<String, OAuth2Error> {
    match value {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(missing(field)),
    }
}

fn validate_endpoint(endpoint: &str) -> Result<(), OAuth2Error> {
    url::Url::parse(endpoint).map(|_| ()).map_err(|_| {
        OAuth2Error::Configuration(ConfigurationError::InvalidEndpoint {
            url: endpoint.to_string(),
        })
    })
}

/// Create a new OAuth2 configuration builder.
pub fn oauth2_config() -> OAuth2ConfigBuilder {
    OAuth2ConfigBuilder::new()
}
