//! OAuth2 Client
//!
//! Shared session for authenticated requests: configuration, transport, credential storage,
//! popup correlation and the injectable host hooks.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::{HttpTransport, PendingAuthorizations, ReqwestHttpTransport};
use crate::error::{ConfigurationError, ErrorKind, ErrorSink, OAuth2Error, TracingErrorSink};
use crate::flows::{
    AuthorizationGate, AuthorizationOutcome, AuthorizationPopupFlow, PopupLauncher,
    ProceedImmediately, SystemBrowserLauncher,
};
use crate::request::{append_bearer_token, AuthenticatedRequest, RequestContext};
use crate::token::{CredentialStore, InMemoryTokenStorage, TokenEndpointClient, TokenStorage};
use crate::types::{CallbackParams, OAuth2Config};

/// OAuth2 client producing authenticated requests.
pub struct OAuth2Client {
    config: Arc<OAuth2Config>,
    transport: Arc<dyn HttpTransport>,
    storage: Arc<dyn TokenStorage>,
    launcher: Arc<dyn PopupLauncher>,
    gate: Arc<dyn AuthorizationGate>,
    error_sink: Arc<dyn ErrorSink>,
    pending: Arc<PendingAuthorizations>,
}

impl OAuth2Client {
    /// Create a new OAuth2 client with default implementations.
    pub fn new(config: OAuth2Config) -> Result<Self, OAuth2Error> {
        let transport = Arc::new(ReqwestHttpTransport::with_timeout(config.timeout)?);
        Ok(Self::with_components(
            config,
            transport,
            Arc::new(InMemoryTokenStorage::new()),
        ))
    }

    /// Create a client with a custom transport and storage.
    pub fn with_components(
        config: OAuth2Config,
        transport: Arc<dyn HttpTransport>,
        storage: Arc<dyn TokenStorage>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            transport,
            storage,
            launcher: Arc::new(SystemBrowserLauncher),
            gate: Arc::new(ProceedImmediately),
            error_sink: Arc::new(TracingErrorSink),
            pending: Arc::new(PendingAuthorizations::new()),
        }
    }

    pub fn with_transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_storage(mut self, storage: Arc<dyn TokenStorage>) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_popup_launcher(mut self, launcher: Arc<dyn PopupLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    /// Install the consent step run before each popup.
    pub fn with_authorization_gate(mut self, gate: Arc<dyn AuthorizationGate>) -> Self {
        self.gate = gate;
        self
    }

    /// Install the receiver of unrecoverable failures.
    pub fn with_error_sink(mut self, error_sink: Arc<dyn ErrorSink>) -> Self {
        self.error_sink = error_sink;
        self
    }

    /// Get the OAuth2 configuration.
    pub fn config(&self) -> &OAuth2Config {
        &self.config
    }

    /// Credentials of this client's namespace.
    pub fn credentials(&self) -> CredentialStore {
        CredentialStore::new(self.storage.clone(), self.config.storage_prefix.clone())
    }

    /// Popups currently waiting for their redirect.
    pub fn pending_authorizations(&self) -> Arc<PendingAuthorizations> {
        self.pending.clone()
    }

    pub fn token_endpoint(&self) -> TokenEndpointClient {
        TokenEndpointClient::new(
            self.config.clone(),
            self.transport.clone(),
            self.credentials(),
        )
    }

    pub fn authorization_flow(&self) -> AuthorizationPopupFlow {
        AuthorizationPopupFlow::new(
            self.config.clone(),
            self.pending.clone(),
            self.launcher.clone(),
            self.gate.clone(),
            Arc::new(self.token_endpoint()),
        )
    }

    fn context(&self) -> RequestContext {
        let token_endpoint = Arc::new(self.token_endpoint());
        let authorization = Arc::new(AuthorizationPopupFlow::new(
            self.config.clone(),
            self.pending.clone(),
            self.launcher.clone(),
            self.gate.clone(),
            token_endpoint.clone(),
        ));

        RequestContext {
            config: self.config.clone(),
            transport: self.transport.clone(),
            credentials: self.credentials(),
            token_endpoint,
            authorization,
            error_sink: self.error_sink.clone(),
        }
    }

    /// Create a new authenticated request.
    pub fn request(&self) -> AuthenticatedRequest {
        AuthenticatedRequest::new(self.context())
    }

    /// Hand an authorization redirect to the popup waiting for it.
    ///
    /// Accepts a full redirect URL or a bare query string. Returns `false` when no pending
    /// popup matches its `state`; the redirect is then ignored.
    pub fn authorization_response(&self, redirect: &str) -> bool {
        let params = match CallbackParams::from_url_str(redirect) {
            Ok(params) => params,
            Err(_) => {
                let query = redirect.split_once('?').map_or(redirect, |(_, q)| q);
                CallbackParams::from_query(query)
            }
        };

        let delivered = self.pending.deliver_callback(params);
        if !delivered {
            debug!("Authorization redirect matched no pending popup");
        }
        delivered
    }

    /// `url` with the stored access token appended as `bearer_token`.
    pub async fn authorized_url(&self, url: &str) -> Result<String, OAuth2Error> {
        match self.credentials().access_token().await? {
            Some(token) => Ok(append_bearer_token(url, &token)),
            None => Ok(url.to_string()),
        }
    }

    /// Refresh the access token now if it expires within `lifetime`.
    ///
    /// Returns whether new tokens were installed. Tokens without a stored expiry never
    /// refresh. A failed refresh drops the refresh token and runs the interactive
    /// authorization instead; nothing is replayed afterwards.
    pub async fn ensure_access_token_lifetime(
        &self,
        lifetime: Duration,
    ) -> Result<bool, OAuth2Error> {
        let lifetime = chrono::Duration::from_std(lifetime).map_err(|e| {
            OAuth2Error::Configuration(ConfigurationError::InvalidConfig {
                message: e.to_string(),
            })
        })?;

        let record = self.credentials().load().await?;
        if !record.expires_within(lifetime) {
            return Ok(false);
        }

        debug!("Access token expires soon, refreshing");
        let refresh_error = match self.token_endpoint().refresh_access_token().await {
            Ok(_) => return Ok(true),
            Err(e) => e,
        };

        warn!(
            error = %refresh_error,
            code = refresh_error.error_code(),
            "Proactive token refresh failed, falling back to authorization"
        );
        self.error_sink
            .report(ErrorKind::Refresh, refresh_error.error_data().as_ref());
        self.credentials().remove_refresh_token().await?;

        match self
            .authorization_flow()
            .authorize(&CancellationToken::new())
            .await
        {
            Ok(AuthorizationOutcome::Authorized(_)) => Ok(true),
            Ok(AuthorizationOutcome::Declined) => {
                info!("Authorization declined after failed refresh");
                Err(refresh_error)
            }
            Err(e) => {
                warn!(error = %e, code = e.error_code(), "Authorization failed");
                self.error_sink
                    .report(ErrorKind::Authorize, e.error_data().as_ref());
                Err(e)
            }
        }
    }
}

/// Create a new OAuth2 client with default implementations.
pub fn oauth2_client(config: OAuth2Config) -> Result<OAuth2Client, OAuth2Error> {
    OAuth2Client::new(config)
}
