//! Authenticated Request
//!
//! A request object that attaches the stored access token, watches each completion, and
//! repairs authorization failures before replaying the request. The caller sees a single
//! coherent attempt: lifecycle notifications of a failed attempt that gets repaired are
//! never delivered, and only the replay's result reaches `send`'s caller.

use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::core::{HttpMethod, HttpRequest, HttpResponse, HttpTransport};
use crate::error::{ErrorKind, ErrorSink, NetworkError, OAuth2Error, RequestError};
use crate::flows::{AuthorizationOutcome, AuthorizationPopupFlow};
use crate::request::attempt::{append_bearer_token, RecordedCall, RequestAttempt};
use crate::request::decision::{classify, Episode, ResponseFacts, Verdict};
use crate::token::{CredentialStore, TokenEndpointClient};
use crate::types::{AuthMechanism, OAuth2Config};

/// Header asking the server to deliver its challenge under another name.
pub const RENAME_WWW_AUTHENTICATE: &str = "X-Rename-WWW-Authenticate";

/// Lifecycle of a request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ReadyState {
    #[default]
    Unsent,
    Opened,
    HeadersReceived,
    Loading,
    Done,
}

/// What the caller can observe of the request.
#[derive(Clone, Debug, Default)]
pub struct ResponseView {
    pub ready_state: ReadyState,
    /// `0` until headers arrive, and for a failure without status.
    pub status: u16,
    pub status_text: String,
    /// Response headers keyed by lowercase name.
    pub headers: HashMap<String, String>,
    pub body: String,
    pub response_type: Option<String>,
    /// MIME override, or the response's `Content-Type`.
    pub mime_type: Option<String>,
}

impl ResponseView {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// All headers as `name: value` lines, sorted by name.
    pub fn all_headers(&self) -> String {
        let mut names: Vec<&String> = self.headers.keys().collect();
        names.sort();
        names
            .into_iter()
            .map(|name| format!("{}: {}\r\n", name, self.headers[name]))
            .collect()
    }
}

type StateChangeListener = Box<dyn FnMut(&ResponseView) + Send>;

/// Everything a request needs from its client.
#[derive(Clone)]
pub struct RequestContext {
    pub config: Arc<OAuth2Config>,
    pub transport: Arc<dyn HttpTransport>,
    pub credentials: CredentialStore,
    pub token_endpoint: Arc<TokenEndpointClient>,
    pub authorization: Arc<AuthorizationPopupFlow>,
    pub error_sink: Arc<dyn ErrorSink>,
}

/// Cancels a request from another task.
#[derive(Clone, Debug)]
pub struct AbortHandle(CancellationToken);

impl AbortHandle {
    pub fn abort(&self) {
        self.0.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.0.is_cancelled()
    }
}

/// Result of handing one attempt to the transport.
struct Dispatched {
    /// `None` when the transport produced no status.
    response: Option<HttpResponse>,
    mechanism: Option<AuthMechanism>,
    sent_bearer_header: bool,
}

/// A single logical request with transparent authorization repair.
pub struct AuthenticatedRequest {
    context: RequestContext,
    attempt: Option<RequestAttempt>,
    view: ResponseView,
    replaying: bool,
    cancel: CancellationToken,
    listener: Option<StateChangeListener>,
}

impl AuthenticatedRequest {
    pub fn new(context: RequestContext) -> Self {
        Self {
            context,
            attempt: None,
            view: ResponseView::default(),
            replaying: false,
            cancel: CancellationToken::new(),
            listener: None,
        }
    }

    /// Register the listener for lifecycle notifications.
    pub fn on_state_change<F>(&mut self, listener: F)
    where
        F: FnMut(&ResponseView) + Send + 'static,
    {
        self.listener = Some(Box::new(listener));
    }

    /// Start a new attempt, discarding the previous one.
    pub fn open(&mut self, method: &str, url: &str, asynchronous: bool) {
        self.cancel = CancellationToken::new();
        self.replaying = false;
        self.attempt = Some(RequestAttempt::new(
            HttpMethod::parse(method),
            url,
            asynchronous,
        ));
        self.view = ResponseView::default();
        self.transition(ReadyState::Opened);
    }

    pub fn set_request_header(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), OAuth2Error> {
        self.opened_attempt()?.record(RecordedCall::SetRequestHeader {
            name: name.into(),
            value: value.into(),
        });
        Ok(())
    }

    pub fn override_mime_type(&mut self, mime: impl Into<String>) -> Result<(), OAuth2Error> {
        self.opened_attempt()?
            .record(RecordedCall::OverrideMimeType(mime.into()));
        Ok(())
    }

    pub fn set_response_type(
        &mut self,
        response_type: impl Into<String>,
    ) -> Result<(), OAuth2Error> {
        self.opened_attempt()?.response_type = Some(response_type.into());
        Ok(())
    }

    /// Handle that aborts this request from elsewhere. Valid until the next `open`.
    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle(self.cancel.clone())
    }

    /// Cancel the request and drop the captured attempt.
    pub fn abort(&mut self) {
        self.cancel.cancel();
        self.reset();
    }

    pub fn ready_state(&self) -> ReadyState {
        self.view.ready_state
    }

    pub fn status(&self) -> u16 {
        self.view.status
    }

    pub fn status_text(&self) -> &str {
        &self.view.status_text
    }

    pub fn response_text(&self) -> &str {
        &self.view.body
    }

    pub fn response(&self) -> &ResponseView {
        &self.view
    }

    pub fn get_response_header(&self, name: &str) -> Option<&str> {
        self.view.header(name)
    }

    pub fn get_all_response_headers(&self) -> String {
        self.view.all_headers()
    }

    /// The attempt currently captured for replay.
    pub fn attempt(&self) -> Option<&RequestAttempt> {
        self.attempt.as_ref()
    }

    /// `url` with the stored access token appended as `bearer_token`.
    pub async fn authorized_url(&self, url: &str) -> Result<String, OAuth2Error> {
        match self.context.credentials.access_token().await? {
            Some(token) => Ok(append_bearer_token(url, &token)),
            None => Ok(url.to_string()),
        }
    }

    /// Send the request and drive it to a terminal outcome.
    ///
    /// Authorization failures the client can repair are handled here and the request is
    /// replayed; the returned view is the one the caller should act on.
    pub async fn send(&mut self, body: Option<String>) -> Result<ResponseView, OAuth2Error> {
        self.opened_attempt()?.body = body;
        self.replaying = false;
        let mut episode = Episode::default();

        loop {
            if self.cancel.is_cancelled() {
                return Err(self.aborted());
            }

            let dispatched = match self.dispatch().await {
                Ok(dispatched) => dispatched,
                Err(OAuth2Error::Aborted) => return Err(self.aborted()),
                Err(e) => return Err(e),
            };

            let has_refresh_token = self.context.credentials.refresh_token().await?.is_some();
            let facts = match &dispatched.response {
                Some(response) => ResponseFacts::observe(
                    response.status,
                    &response.headers,
                    self.context.config.challenge_header_name(),
                    dispatched.mechanism,
                    self.context.transport.supports_request_headers(),
                    has_refresh_token,
                ),
                None => ResponseFacts {
                    status: 0,
                    mechanism: dispatched.mechanism,
                    has_refresh_token,
                    ..Default::default()
                },
            };

            let verdict = episode.permit(classify(&facts));
            debug!(
                status = facts.status,
                mechanism = ?dispatched.mechanism,
                verdict = ?verdict,
                replaying = self.replaying,
                "Request completed"
            );

            match verdict {
                Verdict::Final => {
                    if dispatched.sent_bearer_header
                        && dispatched.mechanism.is_none()
                        && facts.status != 0
                        && facts.status != 401
                    {
                        self.context
                            .credentials
                            .record_auth_mechanism(AuthMechanism::Header)
                            .await?;
                    }
                    return Ok(self.deliver(dispatched.response));
                }
                Verdict::NetworkError => {
                    self.context.error_sink.report(ErrorKind::NetworkError, None);
                    self.deliver(None);
                    return Err(OAuth2Error::Network(NetworkError::Opaque));
                }
                Verdict::SwitchToParam => {
                    info!("Request failed without status, sending the token as a query parameter");
                    self.context
                        .credentials
                        .record_auth_mechanism(AuthMechanism::Param)
                        .await?;
                }
                Verdict::Refresh => {
                    self.context.credentials.remove_access_token().await?;
                    match self.refresh().await {
                        Ok(()) => {}
                        Err(OAuth2Error::Aborted) => return Err(self.aborted()),
                        Err(e) => {
                            warn!(
                                error = %e,
                                code = e.error_code(),
                                "Token refresh failed, falling back to authorization"
                            );
                            self.context
                                .error_sink
                                .report(ErrorKind::Refresh, e.error_data().as_ref());
                            self.context.credentials.remove_refresh_token().await?;

                            if episode.permit(Verdict::Authorize) != Verdict::Authorize {
                                return Ok(self.deliver(dispatched.response));
                            }
                            if let Some(view) = self.authorize(&dispatched).await? {
                                return Ok(view);
                            }
                        }
                    }
                }
                Verdict::Authorize => {
                    if let Some(view) = self.authorize(&dispatched).await? {
                        return Ok(view);
                    }
                }
            }

            self.replaying = true;
        }
    }

    /// Run the interactive authorization.
    ///
    /// `Ok(None)` means tokens were installed and the request should be replayed;
    /// `Ok(Some(view))` means the gate declined and the response is final.
    async fn authorize(
        &mut self,
        dispatched: &Dispatched,
    ) -> Result<Option<ResponseView>, OAuth2Error> {
        let cancel = self.cancel.clone();
        match self.context.authorization.authorize(&cancel).await {
            Ok(AuthorizationOutcome::Authorized(_)) => Ok(None),
            Ok(AuthorizationOutcome::Declined) => {
                Ok(Some(self.deliver(dispatched.response.clone())))
            }
            Err(OAuth2Error::Aborted) => Err(self.aborted()),
            Err(e) => {
                warn!(error = %e, code = e.error_code(), "Authorization failed");
                self.context
                    .error_sink
                    .report(ErrorKind::Authorize, e.error_data().as_ref());
                Err(e)
            }
        }
    }

    async fn refresh(&self) -> Result<(), OAuth2Error> {
        tokio::select! {
            result = self.context.token_endpoint.refresh_access_token() => result.map(|_| ()),
            _ = self.cancel.cancelled() => Err(OAuth2Error::Aborted),
        }
    }

    async fn dispatch(&mut self) -> Result<Dispatched, OAuth2Error> {
        let mechanism = if self.context.transport.supports_request_headers() {
            self.context.credentials.auth_mechanism().await?
        } else {
            Some(AuthMechanism::Param)
        };
        let token = self.context.credentials.access_token().await?;

        let attempt = self
            .attempt
            .as_ref()
            .ok_or(OAuth2Error::Request(RequestError::NotOpened))?;

        let mut url = attempt.url.clone();
        let mut headers = attempt.headers();
        let mut sent_bearer_header = false;

        if self.context.transport.supports_request_headers() {
            if let Some(name) = &self.context.config.www_authenticate_header {
                headers.push((RENAME_WWW_AUTHENTICATE.to_string(), name.clone()));
            }
        }

        if let Some(token) = &token {
            if mechanism == Some(AuthMechanism::Param) {
                url = append_bearer_token(&url, token);
            } else {
                headers.push(("Authorization".to_string(), format!("Bearer {}", token)));
                sent_bearer_header = true;
            }
        }

        let request = HttpRequest {
            method: attempt.method.clone(),
            url,
            headers,
            body: attempt.body.clone(),
            timeout: Some(self.context.config.timeout),
            follow_redirects: true,
            max_response_size: None,
        };

        if self.replaying {
            self.transition(ReadyState::Opened);
        }

        trace!(method = request.method.as_str(), "Dispatching request");
        let result = tokio::select! {
            result = self.context.transport.send(request) => result,
            _ = self.cancel.cancelled() => return Err(OAuth2Error::Aborted),
        };

        let response = match result {
            Ok(response) => Some(response),
            Err(e) if e.is_opaque_failure() => {
                debug!(error = %e, "Transport failed without status");
                None
            }
            Err(e) => {
                warn!(error = %e, code = e.error_code(), "Request failed");
                return Err(e);
            }
        };

        Ok(Dispatched {
            response,
            mechanism,
            sent_bearer_header,
        })
    }

    /// Mirror a final response into the view and notify the caller.
    fn deliver(&mut self, response: Option<HttpResponse>) -> ResponseView {
        let (mime_override, response_type) = match &self.attempt {
            Some(attempt) => (
                attempt.mime_override().map(str::to_string),
                attempt.response_type.clone(),
            ),
            None => (None, None),
        };
        self.view.response_type = response_type;

        match response {
            Some(response) => {
                self.view.status = response.status;
                self.view.status_text = response.status_text;
                self.view.mime_type =
                    mime_override.or_else(|| response.headers.get("content-type").cloned());
                self.view.headers = response.headers;
                self.view.body = String::new();
                self.transition(ReadyState::HeadersReceived);

                self.view.body = response.body;
                self.transition(ReadyState::Loading);
            }
            None => {
                self.view.status = 0;
                self.view.status_text = String::new();
                self.view.headers = HashMap::new();
                self.view.body = String::new();
                self.view.mime_type = mime_override;
            }
        }

        self.transition(ReadyState::Done);
        self.view.clone()
    }

    fn transition(&mut self, state: ReadyState) {
        self.view.ready_state = state;
        if self.replaying && state <= ReadyState::HeadersReceived {
            return;
        }
        if let Some(listener) = self.listener.as_mut() {
            listener(&self.view);
        }
    }

    fn opened_attempt(&mut self) -> Result<&mut RequestAttempt, OAuth2Error> {
        self.attempt
            .as_mut()
            .ok_or(OAuth2Error::Request(RequestError::NotOpened))
    }

    fn aborted(&mut self) -> OAuth2Error {
        debug!("Request aborted");
        self.reset();
        OAuth2Error::Aborted
    }

    fn reset(&mut self) {
        self.attempt = None;
        self.replaying = false;
        self.view = ResponseView::default();
    }
}

impl std::fmt::Debug for AuthenticatedRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthenticatedRequest")
            .field("attempt", &self.attempt)
            .field("ready_state", &self.view.ready_state)
            .field("replaying", &self.replaying)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builders::OAuth2ConfigBuilder;
    use crate::client::OAuth2Client;
    use crate::core::MockHttpTransport;
    use crate::error::{AuthorizationError, ProtocolError, RecordingErrorSink};
    use crate::flows::MockPopupLauncher;
    use crate::token::MockTokenStorage;
    use std::sync::Mutex;
    use std::time::Duration;

    struct Harness {
        client: OAuth2Client,
        transport: Arc<MockHttpTransport>,
        storage: Arc<MockTokenStorage>,
        launcher: Arc<MockPopupLauncher>,
        sink: Arc<RecordingErrorSink>,
    }

    fn harness_with(
        transport: MockHttpTransport,
        configure: impl FnOnce(OAuth2ConfigBuilder) -> OAuth2ConfigBuilder,
    ) -> Harness {
        let builder = OAuth2ConfigBuilder::new()
            .client_id("c")
            .client_secret("s")
            .authorize_endpoint("https://p/auth")
            .token_endpoint("https://p/token");
        let config = configure(builder).build().unwrap();

        let transport = Arc::new(transport);
        let storage = Arc::new(MockTokenStorage::new());
        let launcher = Arc::new(MockPopupLauncher::new());
        let sink = Arc::new(RecordingErrorSink::new());

        let client = OAuth2Client::with_components(config, transport.clone(), storage.clone())
            .with_popup_launcher(launcher.clone())
            .with_error_sink(sink.clone());
        launcher.connect(client.pending_authorizations());

        Harness {
            client,
            transport,
            storage,
            launcher,
            sink,
        }
    }

    fn harness() -> Harness {
        harness_with(MockHttpTransport::new(), |b| b)
    }

    fn unauthorized(challenge: &str) -> HttpResponse {
        HttpResponse::new(401, "").with_header("WWW-Authenticate", challenge)
    }

    fn ok(body: &str) -> HttpResponse {
        HttpResponse::new(200, body).with_header("Content-Type", "text/plain")
    }

    fn record_events(request: &mut AuthenticatedRequest) -> Arc<Mutex<Vec<(ReadyState, u16)>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        request.on_state_change(move |view| {
            sink.lock().unwrap().push((view.ready_state, view.status));
        });
        events
    }

    #[tokio::test]
    async fn test_send_before_open() {
        let h = harness();
        let mut request = h.client.request();

        let result = request.send(None).await;

        assert!(matches!(
            result,
            Err(OAuth2Error::Request(RequestError::NotOpened))
        ));
        assert!(request.set_request_header("X-A", "1").is_err());
    }

    #[tokio::test]
    async fn test_success_without_token() {
        let h = harness();
        h.transport.queue_response(ok("hello"));
        let mut request = h.client.request();
        let events = record_events(&mut request);

        request.open("GET", "https://api/x", true);
        let view = request.send(None).await.unwrap();

        assert_eq!(view.status, 200);
        assert_eq!(request.response_text(), "hello");
        assert_eq!(request.ready_state(), ReadyState::Done);

        let sent = h.transport.get_last_request().unwrap();
        assert!(sent.header("authorization").is_none());
        assert_eq!(
            *events.lock().unwrap(),
            vec![
                (ReadyState::Opened, 0),
                (ReadyState::HeadersReceived, 200),
                (ReadyState::Loading, 200),
                (ReadyState::Done, 200),
            ]
        );
    }

    #[tokio::test]
    async fn test_bearer_without_error_triggers_authorization() {
        let h = harness();
        h.transport.queue_response(unauthorized(r#"Bearer realm="x""#));
        h.transport
            .queue_json_response(200, &serde_json::json!({"access_token": "a1"}));
        h.transport.queue_response(ok("data"));
        h.launcher.redirect_with_code("code-1");

        let mut request = h.client.request();
        request.open("GET", "https://api/x", true);
        let view = request.send(None).await.unwrap();

        assert_eq!(view.status, 200);
        assert_eq!(h.launcher.open_count(), 1);

        let requests = h.transport.get_requests();
        assert_eq!(requests.len(), 3);
        assert!(requests[0].header("authorization").is_none());
        assert_eq!(requests[1].url, "https://p/token");
        assert!(requests[1]
            .body
            .as_deref()
            .unwrap()
            .contains("grant_type=authorization_code"));
        assert_eq!(requests[2].header("authorization"), Some("Bearer a1"));
        assert!(h.sink.reports().is_empty());
        assert!(h.client.pending_authorizations().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_token_refreshes_and_replays() {
        let h = harness();
        h.storage.insert("oauth2.access-token", "a0");
        h.storage.insert("oauth2.refresh-token", "r1");
        h.transport
            .queue_response(unauthorized(r#"Bearer error="invalid_token""#));
        h.transport
            .queue_json_response(200, &serde_json::json!({"access_token": "a2"}));
        h.transport.queue_response(ok("data"));

        let mut request = h.client.request();
        request.open("GET", "https://api/x", true);
        let view = request.send(None).await.unwrap();

        assert_eq!(view.status, 200);
        assert_eq!(h.launcher.open_count(), 0);
        assert!(h
            .storage
            .get_remove_history()
            .contains(&"oauth2.access-token".to_string()));

        let requests = h.transport.get_requests();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[0].header("authorization"), Some("Bearer a0"));
        let form: Vec<(String, String)> =
            url::form_urlencoded::parse(requests[1].body.as_deref().unwrap().as_bytes())
                .into_owned()
                .collect();
        assert!(form.contains(&("grant_type".to_string(), "refresh_token".to_string())));
        assert!(form.contains(&("refresh_token".to_string(), "r1".to_string())));
        assert_eq!(requests[2].header("authorization"), Some("Bearer a2"));
    }

    #[tokio::test]
    async fn test_replay_reproduces_recorded_calls() {
        let h = harness();
        h.storage.insert("oauth2.refresh-token", "r1");
        h.transport
            .queue_response(unauthorized(r#"Bearer error="invalid_token""#));
        h.transport
            .queue_json_response(200, &serde_json::json!({"access_token": "a2"}));
        h.transport.queue_response(ok("{}"));

        let mut request = h.client.request();
        request.open("POST", "https://api/items", true);
        request.set_request_header("X-A", "1").unwrap();
        request.set_request_header("X-B", "2").unwrap();
        request.set_request_header("X-A", "3").unwrap();
        request.override_mime_type("application/json").unwrap();
        request
            .send(Some("payload".to_string()))
            .await
            .unwrap();

        let requests = h.transport.get_requests();
        let (first, replay) = (&requests[0], &requests[2]);
        assert_eq!(
            first.headers,
            vec![
                ("X-A".to_string(), "1".to_string()),
                ("X-B".to_string(), "2".to_string()),
                ("X-A".to_string(), "3".to_string()),
            ]
        );
        assert_eq!(
            replay.headers,
            vec![
                ("X-A".to_string(), "1".to_string()),
                ("X-B".to_string(), "2".to_string()),
                ("X-A".to_string(), "3".to_string()),
                ("Authorization".to_string(), "Bearer a2".to_string()),
            ]
        );
        assert_eq!(replay.method, HttpMethod::Post);
        assert_eq!(replay.body.as_deref(), Some("payload"));
        assert_eq!(request.response().mime_type.as_deref(), Some("application/json"));
    }

    #[tokio::test]
    async fn test_replay_suppresses_early_notifications() {
        let h = harness();
        h.storage.insert("oauth2.refresh-token", "r1");
        h.transport
            .queue_response(unauthorized(r#"Bearer error="invalid_token""#));
        h.transport
            .queue_json_response(200, &serde_json::json!({"access_token": "a2"}));
        h.transport.queue_response(ok("data"));

        let mut request = h.client.request();
        let events = record_events(&mut request);
        request.open("GET", "https://api/x", true);
        request.send(None).await.unwrap();

        assert_eq!(
            *events.lock().unwrap(),
            vec![
                (ReadyState::Opened, 0),
                (ReadyState::Loading, 200),
                (ReadyState::Done, 200),
            ]
        );
    }

    #[tokio::test]
    async fn test_other_bearer_error_bubbles() {
        let h = harness();
        h.storage.insert("oauth2.refresh-token", "r1");
        h.transport
            .queue_response(unauthorized(r#"Bearer error="insufficient_scope""#));

        let mut request = h.client.request();
        let events = record_events(&mut request);
        request.open("GET", "https://api/x", true);
        let view = request.send(None).await.unwrap();

        assert_eq!(view.status, 401);
        assert_eq!(h.transport.get_requests().len(), 1);
        assert_eq!(events.lock().unwrap().last(), Some(&(ReadyState::Done, 401)));
    }

    struct DecliningGate;

    #[async_trait::async_trait]
    impl crate::flows::AuthorizationGate for DecliningGate {
        async fn request_authorization(&self) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn test_declined_gate_bubbles_unauthorized() {
        let h = harness();
        let client = h.client.with_authorization_gate(Arc::new(DecliningGate));
        h.transport.queue_response(unauthorized(r#"Bearer realm="x""#));
        h.launcher.redirect_with_code("unused");

        let mut request = client.request();
        let events = record_events(&mut request);
        request.open("GET", "https://api/x", true);
        let view = request.send(None).await.unwrap();

        assert_eq!(view.status, 401);
        assert_eq!(h.launcher.open_count(), 0);
        assert_eq!(h.transport.get_requests().len(), 1);
        assert!(h.sink.reports().is_empty());
        assert_eq!(events.lock().unwrap().last(), Some(&(ReadyState::Done, 401)));
    }

    #[tokio::test]
    async fn test_param_mechanism_network_error() {
        let h = harness();
        h.storage.insert("oauth2.access-token", "a1");
        h.storage.insert("oauth2.auth-mechanism", "param");
        h.transport.queue_network_error("connection reset");

        let mut request = h.client.request();
        let events = record_events(&mut request);
        request.open("GET", "https://api/x", true);
        let result = request.send(None).await;

        assert!(matches!(
            result,
            Err(OAuth2Error::Network(NetworkError::Opaque))
        ));
        assert_eq!(h.transport.get_requests().len(), 1);
        assert_eq!(
            h.transport.get_last_request().unwrap().url,
            "https://api/x?bearer_token=a1"
        );
        assert_eq!(h.sink.reports(), vec![(ErrorKind::NetworkError, None)]);
        assert_eq!(events.lock().unwrap().last(), Some(&(ReadyState::Done, 0)));
    }

    #[tokio::test]
    async fn test_status_zero_switches_to_param() {
        let h = harness();
        h.storage.insert("oauth2.access-token", "a1");
        h.transport.queue_network_error("headers blocked");
        h.transport.queue_response(ok("data"));

        let mut request = h.client.request();
        request.open("GET", "https://api/x?page=2", true);
        let view = request.send(None).await.unwrap();

        assert_eq!(view.status, 200);
        let requests = h.transport.get_requests();
        assert_eq!(requests[0].header("authorization"), Some("Bearer a1"));
        assert_eq!(requests[1].url, "https://api/x?page=2&bearer_token=a1");
        assert!(requests[1].header("authorization").is_none());
        assert_eq!(h.storage.peek("oauth2.auth-mechanism").as_deref(), Some("param"));
        assert!(h.sink.reports().is_empty());
    }

    #[tokio::test]
    async fn test_unreadable_response_keeps_mechanism() {
        let h = harness();
        h.storage.insert("oauth2.access-token", "a1");
        h.transport
            .queue_error(OAuth2Error::Protocol(ProtocolError::ResponseTooLarge {
                size: 2 * 1024 * 1024,
            }));

        let mut request = h.client.request();
        request.open("POST", "https://api/upload", true);
        let result = request.send(Some("payload".to_string())).await;

        assert!(matches!(
            result,
            Err(OAuth2Error::Protocol(ProtocolError::ResponseTooLarge { .. }))
        ));
        assert_eq!(h.transport.get_requests().len(), 1);
        assert!(h.storage.peek("oauth2.auth-mechanism").is_none());
        assert!(h.sink.reports().is_empty());
    }

    #[tokio::test]
    async fn test_successful_header_request_learns_header() {
        let h = harness();
        h.storage.insert("oauth2.access-token", "a1");
        h.transport.queue_response(ok("data"));

        let mut request = h.client.request();
        request.open("GET", "https://api/x", true);
        request.send(None).await.unwrap();

        assert_eq!(h.storage.peek("oauth2.auth-mechanism").as_deref(), Some("header"));
    }

    #[tokio::test]
    async fn test_refresh_failure_falls_back_to_authorization() {
        let h = harness();
        h.storage.insert("oauth2.refresh-token", "r1");
        h.transport
            .queue_response(unauthorized(r#"Bearer error="invalid_token""#));
        h.transport
            .queue_json_response(400, &serde_json::json!({"error": "invalid_grant"}));
        h.transport
            .queue_json_response(200, &serde_json::json!({"access_token": "a3"}));
        h.transport.queue_response(ok("data"));
        h.launcher.redirect_with_code("code-2");

        let mut request = h.client.request();
        request.open("GET", "https://api/x", true);
        let view = request.send(None).await.unwrap();

        assert_eq!(view.status, 200);
        assert_eq!(h.sink.count(ErrorKind::Refresh), 1);
        assert_eq!(h.sink.reports()[0].1.as_ref().unwrap()["error"], "invalid_grant");
        assert!(h
            .storage
            .get_remove_history()
            .contains(&"oauth2.refresh-token".to_string()));
        assert_eq!(h.launcher.open_count(), 1);
        assert_eq!(
            h.transport.get_last_request().unwrap().header("authorization"),
            Some("Bearer a3")
        );
    }

    #[tokio::test]
    async fn test_each_corrective_action_runs_once_per_send() {
        let h = harness();
        h.transport.queue_response(unauthorized(r#"Bearer realm="x""#));
        h.transport
            .queue_json_response(200, &serde_json::json!({"access_token": "a1"}));
        h.transport.queue_response(unauthorized(r#"Bearer realm="x""#));
        h.launcher.redirect_with_code("code-1");

        let mut request = h.client.request();
        request.open("GET", "https://api/x", true);
        let view = request.send(None).await.unwrap();

        assert_eq!(view.status, 401);
        assert_eq!(h.launcher.open_count(), 1);
        assert_eq!(h.transport.get_requests().len(), 3);
    }

    #[tokio::test]
    async fn test_authorization_failure_is_reported() {
        let h = harness();
        h.transport.queue_response(unauthorized(r#"Bearer realm="x""#));
        h.transport.queue_json_response(
            400,
            &serde_json::json!({"error": "invalid_grant", "error_description": "bad code"}),
        );
        h.launcher.redirect_with_code("code-1");

        let mut request = h.client.request();
        let events = record_events(&mut request);
        request.open("GET", "https://api/x", true);
        let result = request.send(None).await;

        assert!(matches!(
            result,
            Err(OAuth2Error::Authorization(
                AuthorizationError::CodeExchangeRejected { .. }
            ))
        ));
        assert_eq!(h.sink.count(ErrorKind::Authorize), 1);
        assert!(h.storage.peek("oauth2.access-token").is_none());
        assert_eq!(*events.lock().unwrap(), vec![(ReadyState::Opened, 0)]);
    }

    #[tokio::test]
    async fn test_authorization_timeout() {
        let h = harness_with(MockHttpTransport::new(), |b| {
            b.authorization_timeout(Duration::from_millis(20))
        });
        h.transport.queue_response(unauthorized(r#"Bearer realm="x""#));

        let mut request = h.client.request();
        request.open("GET", "https://api/x", true);
        let result = request.send(None).await;

        assert!(matches!(
            result,
            Err(OAuth2Error::Authorization(AuthorizationError::Timeout { .. }))
        ));
        assert_eq!(h.sink.count(ErrorKind::Authorize), 1);
        assert!(h.client.pending_authorizations().is_empty());
    }

    #[tokio::test]
    async fn test_abort_while_popup_pending() {
        let h = harness();
        h.transport.queue_response(unauthorized(r#"Bearer realm="x""#));
        let pending = h.client.pending_authorizations();

        let mut request = h.client.request();
        request.open("GET", "https://api/x", true);
        let handle = request.abort_handle();

        let abort = async {
            while pending.is_empty() {
                tokio::task::yield_now().await;
            }
            handle.abort();
        };
        let (result, ()) = tokio::join!(request.send(None), abort);

        assert!(matches!(result, Err(OAuth2Error::Aborted)));
        assert!(pending.is_empty());
        assert!(request.attempt().is_none());
        assert_eq!(request.ready_state(), ReadyState::Unsent);
        assert_eq!(h.transport.get_requests().len(), 1);
        assert!(h.sink.reports().is_empty());
    }

    #[tokio::test]
    async fn test_abort_then_reopen() {
        let h = harness();
        h.transport.queue_response(ok("data"));

        let mut request = h.client.request();
        request.open("GET", "https://api/x", true);
        request.set_request_header("X-A", "1").unwrap();
        request.abort();
        assert!(request.attempt().is_none());
        assert!(request.send(None).await.is_err());

        request.open("GET", "https://api/y", true);
        let view = request.send(None).await.unwrap();
        assert_eq!(view.status, 200);
        assert!(h.transport.get_last_request().unwrap().headers.is_empty());
    }

    #[tokio::test]
    async fn test_renamed_challenge_header() {
        let h = harness_with(MockHttpTransport::new(), |b| {
            b.rename_www_authenticate_header("X-WWW-Authenticate")
        });
        h.storage.insert("oauth2.refresh-token", "r1");
        h.transport.queue_response(
            HttpResponse::new(401, "")
                .with_header("X-WWW-Authenticate", r#"Bearer error="invalid_token""#),
        );
        h.transport
            .queue_json_response(200, &serde_json::json!({"access_token": "a2"}));
        h.transport.queue_response(ok("data"));

        let mut request = h.client.request();
        request.open("GET", "https://api/x", true);
        let view = request.send(None).await.unwrap();

        assert_eq!(view.status, 200);
        let first = &h.transport.get_requests()[0];
        assert_eq!(
            first.header(RENAME_WWW_AUTHENTICATE),
            Some("X-WWW-Authenticate")
        );
    }

    #[tokio::test]
    async fn test_param_mechanism_keeps_rename_header() {
        let h = harness_with(MockHttpTransport::new(), |b| {
            b.rename_www_authenticate_header("X-WWW-Authenticate")
        });
        h.storage.insert("oauth2.access-token", "a1");
        h.storage.insert("oauth2.auth-mechanism", "param");
        h.transport.queue_response(ok("data"));

        let mut request = h.client.request();
        request.open("GET", "https://api/x", true);
        request.send(None).await.unwrap();

        let sent = h.transport.get_last_request().unwrap();
        assert_eq!(sent.url, "https://api/x?bearer_token=a1");
        assert!(sent.header("authorization").is_none());
        assert_eq!(
            sent.header(RENAME_WWW_AUTHENTICATE),
            Some("X-WWW-Authenticate")
        );
    }

    #[tokio::test]
    async fn test_transport_without_request_headers() {
        let h = harness_with(MockHttpTransport::without_request_headers(), |b| b);
        h.storage.insert("oauth2.access-token", "a1");
        h.storage.insert("oauth2.refresh-token", "r1");
        h.transport.queue_response(HttpResponse::new(401, ""));
        h.transport
            .queue_json_response(200, &serde_json::json!({"access_token": "a2"}));
        h.transport.queue_response(ok("data"));

        let mut request = h.client.request();
        request.open("GET", "https://api/x", true);
        let view = request.send(None).await.unwrap();

        assert_eq!(view.status, 200);
        let requests = h.transport.get_requests();
        assert_eq!(requests[0].url, "https://api/x?bearer_token=a1");
        assert!(requests[0].header("authorization").is_none());
        assert_eq!(requests[2].url, "https://api/x?bearer_token=a2");
        assert!(h.storage.peek("oauth2.auth-mechanism").is_none());
    }

    #[tokio::test]
    async fn test_response_accessors() {
        let h = harness();
        h.transport.queue_response(
            HttpResponse::new(200, "body")
                .with_header("Content-Type", "text/plain")
                .with_header("X-Trace", "t1"),
        );

        let mut request = h.client.request();
        request.open("GET", "https://api/x", true);
        request.set_response_type("text").unwrap();
        request.send(None).await.unwrap();

        assert_eq!(request.status_text(), "OK");
        assert_eq!(request.get_response_header("x-TRACE"), Some("t1"));
        assert_eq!(
            request.get_all_response_headers(),
            "content-type: text/plain\r\nx-trace: t1\r\n"
        );
        assert_eq!(request.response().response_type.as_deref(), Some("text"));
        assert_eq!(request.response().mime_type.as_deref(), Some("text/plain"));
    }

    #[tokio::test]
    async fn test_authorized_url() {
        let h = harness();
        let request = h.client.request();
        assert_eq!(
            request.authorized_url("https://api/x").await.unwrap(),
            "https://api/x"
        );

        h.storage.insert("oauth2.access-token", "a b");
        assert_eq!(
            request.authorized_url("https://api/x").await.unwrap(),
            "https://api/x?bearer_token=a+b"
        );
    }
}
