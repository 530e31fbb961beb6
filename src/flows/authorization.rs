//! Authorization Popup Flow
//!
//! Interactive authorization-code acquisition. The flow asks the host's
//! [`AuthorizationGate`] for consent, opens the authorization URL through a
//! [`PopupLauncher`], waits for the redirect routed back by [`PendingAuthorizations`], and
//! exchanges the returned code at the token endpoint.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::core::{PendingAuthorizations, PopupHandle};
use crate::error::{AuthorizationError, ConfigurationError, OAuth2Error};
use crate::token::TokenEndpointClient;
use crate::types::{CallbackParams, OAuth2Config, PopupWindowConfig, TokenResponse};

/// Consent step run before every popup.
#[async_trait]
pub trait AuthorizationGate: Send + Sync {
    /// Return `true` to proceed with the popup, `false` to decline.
    async fn request_authorization(&self) -> bool;
}

/// Gate that always proceeds.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProceedImmediately;

#[async_trait]
impl AuthorizationGate for ProceedImmediately {
    async fn request_authorization(&self) -> bool {
        true
    }
}

/// Opens the authorization URL for the user.
pub trait PopupLauncher: Send + Sync {
    fn open(&self, url: &Url, window: &PopupWindowConfig) -> Result<(), OAuth2Error>;
}

/// Launcher that opens the system browser.
///
/// Window geometry is left to the browser.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemBrowserLauncher;

impl PopupLauncher for SystemBrowserLauncher {
    fn open(&self, url: &Url, window: &PopupWindowConfig) -> Result<(), OAuth2Error> {
        debug!(width = window.width, height = window.height, "Opening authorization page");
        webbrowser::open(url.as_str()).map_err(|e| {
            OAuth2Error::Authorization(AuthorizationError::PopupFailed {
                message: e.to_string(),
            })
        })
    }
}

/// Scripted redirect of the mock launcher.
#[derive(Clone, Debug)]
enum MockRedirect {
    Code(String),
    Error {
        error: String,
        error_description: Option<String>,
    },
    Params(CallbackParams),
}

/// Mock popup launcher for testing.
///
/// Records every URL it opens. Once connected to a [`PendingAuthorizations`] table it
/// answers each popup with the next scripted redirect, using the `state` of the opened URL.
/// Popups opened with nothing scripted are left waiting.
#[derive(Default)]
pub struct MockPopupLauncher {
    opened: Mutex<Vec<Url>>,
    redirects: Mutex<VecDeque<MockRedirect>>,
    pending: Mutex<Option<Arc<PendingAuthorizations>>>,
    should_fail: Mutex<bool>,
}

impl MockPopupLauncher {
    /// Create new mock launcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver scripted redirects to this table.
    pub fn connect(&self, pending: Arc<PendingAuthorizations>) -> &Self {
        *self.pending.lock().unwrap_or_else(|e| e.into_inner()) = Some(pending);
        self
    }

    /// Answer the next popup with `?code=<code>`.
    pub fn redirect_with_code(&self, code: impl Into<String>) -> &Self {
        self.push(MockRedirect::Code(code.into()))
    }

    /// Answer the next popup with `?error=<error>`.
    pub fn redirect_with_error(
        &self,
        error: impl Into<String>,
        error_description: Option<&str>,
    ) -> &Self {
        self.push(MockRedirect::Error {
            error: error.into(),
            error_description: error_description.map(str::to_string),
        })
    }

    /// Answer the next popup with these parameters; `state` is filled in when absent.
    pub fn redirect_with_params(&self, params: CallbackParams) -> &Self {
        self.push(MockRedirect::Params(params))
    }

    /// Make every open fail.
    pub fn set_should_fail(&self, should_fail: bool) -> &Self {
        *self.should_fail.lock().unwrap_or_else(|e| e.into_inner()) = should_fail;
        self
    }

    /// URLs opened so far.
    pub fn opened_urls(&self) -> Vec<Url> {
        self.opened.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn open_count(&self) -> usize {
        self.opened.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn push(&self, redirect: MockRedirect) -> &Self {
        self.redirects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(redirect);
        self
    }
}

impl PopupLauncher for MockPopupLauncher {
    fn open(&self, url: &Url, _window: &PopupWindowConfig) -> Result<(), OAuth2Error> {
        if *self.should_fail.lock().unwrap_or_else(|e| e.into_inner()) {
            return Err(OAuth2Error::Authorization(AuthorizationError::PopupFailed {
                message: "Mock popup failure".to_string(),
            }));
        }

        self.opened
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(url.clone());

        let pending = self.pending.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let redirect = self
            .redirects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();

        if let (Some(pending), Some(redirect)) = (pending, redirect) {
            let state = CallbackParams::from_url(url).state;
            let params = match redirect {
                MockRedirect::Code(code) => CallbackParams {
                    code: Some(code),
                    state,
                    ..Default::default()
                },
                MockRedirect::Error {
                    error,
                    error_description,
                } => CallbackParams {
                    error: Some(error),
                    error_description,
                    state,
                    ..Default::default()
                },
                MockRedirect::Params(mut params) => {
                    if params.state.is_none() {
                        params.state = state;
                    }
                    params
                }
            };
            pending.deliver_callback(params);
        }

        Ok(())
    }
}

/// How an authorization attempt ended without an error.
#[derive(Debug)]
pub enum AuthorizationOutcome {
    /// Tokens were obtained and installed.
    Authorized(TokenResponse),
    /// The gate declined; no popup was opened.
    Declined,
}

/// A popup that is open and waiting for its redirect.
#[derive(Debug)]
pub struct OpenPopup {
    pub handle: PopupHandle,
    pub url: Url,
    receiver: tokio::sync::oneshot::Receiver<CallbackParams>,
}

/// Authorization popup flow.
pub struct AuthorizationPopupFlow {
    config: Arc<OAuth2Config>,
    pending: Arc<PendingAuthorizations>,
    launcher: Arc<dyn PopupLauncher>,
    gate: Arc<dyn AuthorizationGate>,
    token_endpoint: Arc<TokenEndpointClient>,
}

impl AuthorizationPopupFlow {
    pub fn new(
        config: Arc<OAuth2Config>,
        pending: Arc<PendingAuthorizations>,
        launcher: Arc<dyn PopupLauncher>,
        gate: Arc<dyn AuthorizationGate>,
        token_endpoint: Arc<TokenEndpointClient>,
    ) -> Self {
        Self {
            config,
            pending,
            launcher,
            gate,
            token_endpoint,
        }
    }

    /// Build the authorization URL for a popup.
    pub fn authorization_url(
        &self,
        handle: &PopupHandle,
        scopes: &[String],
    ) -> Result<Url, OAuth2Error> {
        let mut url = Url::parse(&self.config.provider.authorize_endpoint).map_err(|_| {
            OAuth2Error::Configuration(ConfigurationError::InvalidEndpoint {
                url: self.config.provider.authorize_endpoint.clone(),
            })
        })?;

        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.config.credentials.client_id)
            .append_pair("redirect_uri", &self.config.redirect_uri)
            .append_pair("scope", &scopes.join(" "))
            .append_pair("state", handle.as_str());

        Ok(url)
    }

    /// Register a correlation slot and open the popup for it.
    pub fn open_authorization_popup(&self, scopes: &[String]) -> Result<OpenPopup, OAuth2Error> {
        let (handle, receiver) = self.pending.register();

        let url = match self.authorization_url(&handle, scopes) {
            Ok(url) => url,
            Err(e) => {
                self.pending.deregister(&handle);
                return Err(e);
            }
        };

        debug!(handle = %handle, "Opening authorization popup");
        if let Err(e) = self.launcher.open(&url, &self.config.window) {
            self.pending.deregister(&handle);
            return Err(e);
        }

        Ok(OpenPopup {
            handle,
            url,
            receiver,
        })
    }

    /// Wait for the popup's redirect. The slot is released however the wait ends.
    pub async fn await_redirect(
        &self,
        popup: OpenPopup,
        cancel: &CancellationToken,
    ) -> Result<CallbackParams, OAuth2Error> {
        let timeout = self.config.authorization_timeout;
        let OpenPopup {
            handle, receiver, ..
        } = popup;

        let result = tokio::select! {
            received = tokio::time::timeout(timeout, receiver) => match received {
                Ok(Ok(params)) => Ok(params),
                Ok(Err(_)) => Err(OAuth2Error::Authorization(AuthorizationError::PopupFailed {
                    message: "authorization slot closed before a redirect arrived".to_string(),
                })),
                Err(_) => Err(OAuth2Error::Authorization(AuthorizationError::Timeout { timeout })),
            },
            _ = cancel.cancelled() => Err(OAuth2Error::Aborted),
        };

        self.pending.deregister(&handle);
        result
    }

    /// Run the whole interactive authorization: gate, popup, redirect, code exchange.
    pub async fn authorize(
        &self,
        cancel: &CancellationToken,
    ) -> Result<AuthorizationOutcome, OAuth2Error> {
        let proceed = tokio::select! {
            proceed = self.gate.request_authorization() => proceed,
            _ = cancel.cancelled() => return Err(OAuth2Error::Aborted),
        };
        if !proceed {
            info!("Authorization declined by gate");
            return Ok(AuthorizationOutcome::Declined);
        }

        let popup = self.open_authorization_popup(&self.config.scopes)?;
        let params = self.await_redirect(popup, cancel).await?;

        if let Some(error) = params.error {
            warn!(error = %error, "Authorization redirect carried an error");
            return Err(OAuth2Error::Authorization(AuthorizationError::Denied {
                error,
                error_description: params.error_description,
                error_uri: params.error_uri,
            }));
        }

        let code = params
            .code
            .ok_or(OAuth2Error::Authorization(AuthorizationError::MissingCode))?;

        let tokens = self
            .token_endpoint
            .exchange_authorization_code(&code, &self.config.redirect_uri)
            .await?;
        Ok(AuthorizationOutcome::Authorized(tokens))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builders::OAuth2ConfigBuilder;
    use crate::core::MockHttpTransport;
    use crate::token::{CredentialStore, InMemoryTokenStorage};
    use mockall::mock;
    use std::time::Duration;

    mock! {
        pub Gate {}

        #[async_trait]
        impl AuthorizationGate for Gate {
            async fn request_authorization(&self) -> bool;
        }
    }

    struct Fixture {
        flow: AuthorizationPopupFlow,
        pending: Arc<PendingAuthorizations>,
        launcher: Arc<MockPopupLauncher>,
        transport: Arc<MockHttpTransport>,
        credentials: CredentialStore,
    }

    fn fixture_with_gate(gate: Arc<dyn AuthorizationGate>) -> Fixture {
        let config = Arc::new(
            OAuth2ConfigBuilder::new()
                .client_id("c")
                .client_secret("s")
                .authorize_endpoint("https://p/auth")
                .token_endpoint("https://p/token")
                .redirect_uri("http://localhost/cb")
                .add_scope("read")
                .add_scope("write")
                .authorization_timeout(Duration::from_millis(50))
                .build()
                .unwrap(),
        );
        let transport = Arc::new(MockHttpTransport::new());
        let credentials = CredentialStore::new(Arc::new(InMemoryTokenStorage::new()), "oauth2.");
        let token_endpoint = Arc::new(TokenEndpointClient::new(
            config.clone(),
            transport.clone(),
            credentials.clone(),
        ));
        let pending = Arc::new(PendingAuthorizations::new());
        let launcher = Arc::new(MockPopupLauncher::new());
        launcher.connect(pending.clone());

        let flow = AuthorizationPopupFlow::new(
            config,
            pending.clone(),
            launcher.clone(),
            gate,
            token_endpoint,
        );

        Fixture {
            flow,
            pending,
            launcher,
            transport,
            credentials,
        }
    }

    fn fixture() -> Fixture {
        fixture_with_gate(Arc::new(ProceedImmediately))
    }

    #[test]
    fn test_authorization_url() {
        let f = fixture();
        let handle = PopupHandle::from("h1");
        let url = f
            .flow
            .authorization_url(&handle, &["read".to_string(), "write".to_string()])
            .unwrap();

        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(
            pairs,
            vec![
                ("response_type".to_string(), "code".to_string()),
                ("client_id".to_string(), "c".to_string()),
                ("redirect_uri".to_string(), "http://localhost/cb".to_string()),
                ("scope".to_string(), "read write".to_string()),
                ("state".to_string(), "h1".to_string()),
            ]
        );
        assert!(url.as_str().starts_with("https://p/auth?"));
    }

    #[tokio::test]
    async fn test_authorize_exchanges_code() {
        let f = fixture();
        f.launcher.redirect_with_code("code-1");
        f.transport
            .queue_json_response(200, &serde_json::json!({"access_token": "a1"}));

        let outcome = f.flow.authorize(&CancellationToken::new()).await.unwrap();

        assert!(matches!(outcome, AuthorizationOutcome::Authorized(_)));
        assert_eq!(f.launcher.open_count(), 1);
        assert!(f.pending.is_empty());

        let request = f.transport.get_last_request().unwrap();
        let body = request.body.unwrap();
        assert!(body.contains("code=code-1"));
        assert!(body.contains("grant_type=authorization_code"));
        assert_eq!(
            f.credentials.access_token().await.unwrap().as_deref(),
            Some("a1")
        );
    }

    #[tokio::test]
    async fn test_redirect_error_is_denied() {
        let f = fixture();
        f.launcher
            .redirect_with_error("access_denied", Some("User denied"));

        let result = f.flow.authorize(&CancellationToken::new()).await;

        match result {
            Err(OAuth2Error::Authorization(AuthorizationError::Denied { error, .. })) => {
                assert_eq!(error, "access_denied")
            }
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
        assert!(f.transport.get_requests().is_empty());
        assert!(f.pending.is_empty());
    }

    #[tokio::test]
    async fn test_redirect_without_code() {
        let f = fixture();
        f.launcher.redirect_with_params(CallbackParams::default());

        let result = f.flow.authorize(&CancellationToken::new()).await;

        assert!(matches!(
            result,
            Err(OAuth2Error::Authorization(AuthorizationError::MissingCode))
        ));
    }

    #[tokio::test]
    async fn test_timeout_deregisters_slot() {
        let f = fixture();

        let result = f.flow.authorize(&CancellationToken::new()).await;

        assert!(matches!(
            result,
            Err(OAuth2Error::Authorization(AuthorizationError::Timeout { .. }))
        ));
        assert!(f.pending.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_while_waiting() {
        let f = fixture();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = f.flow.authorize(&cancel).await;

        assert!(matches!(result, Err(OAuth2Error::Aborted)));
        assert!(f.pending.is_empty());
    }

    #[tokio::test]
    async fn test_unmatched_redirect_is_ignored() {
        let f = fixture();
        let popup = f.flow.open_authorization_popup(&[]).unwrap();

        let stray = CallbackParams {
            code: Some("stray".to_string()),
            state: Some("another-popup".to_string()),
            ..Default::default()
        };
        assert!(!f.pending.deliver_callback(stray));
        assert!(f.pending.is_pending(&popup.handle));

        let matching = CallbackParams {
            code: Some("mine".to_string()),
            state: Some(popup.handle.to_string()),
            ..Default::default()
        };
        assert!(f.pending.deliver_callback(matching));

        let params = f
            .flow
            .await_redirect(popup, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(params.code.as_deref(), Some("mine"));
    }

    #[tokio::test]
    async fn test_launcher_failure_releases_slot() {
        let f = fixture();
        f.launcher.set_should_fail(true);

        let result = f.flow.authorize(&CancellationToken::new()).await;

        assert!(matches!(
            result,
            Err(OAuth2Error::Authorization(AuthorizationError::PopupFailed { .. }))
        ));
        assert!(f.pending.is_empty());
    }

    #[tokio::test]
    async fn test_gate_decline_opens_nothing() {
        let mut gate = MockGate::new();
        gate.expect_request_authorization().times(1).returning(|| false);
        let f = fixture_with_gate(Arc::new(gate));

        let outcome = f.flow.authorize(&CancellationToken::new()).await.unwrap();

        assert!(matches!(outcome, AuthorizationOutcome::Declined));
        assert_eq!(f.launcher.open_count(), 0);
    }

    #[tokio::test]
    async fn test_gate_consulted_before_popup() {
        let mut gate = MockGate::new();
        gate.expect_request_authorization().times(1).returning(|| true);
        let f = fixture_with_gate(Arc::new(gate));
        f.launcher.redirect_with_code("c1");
        f.transport
            .queue_json_response(200, &serde_json::json!({"access_token": "a1"}));

        let outcome = f.flow.authorize(&CancellationToken::new()).await.unwrap();
        assert!(matches!(outcome, AuthorizationOutcome::Authorized(_)));
    }
}
