//! OAuth2 Request Integration
//!
//! Transparent OAuth2 bearer-token handling for outbound HTTP requests.
//!
//! # Features
//!
//! - Bearer token attachment as a header or as a `bearer_token` query parameter
//! - `WWW-Authenticate` challenge parsing (RFC 7235)
//! - Token Refresh (RFC 6749 Section 6) with transparent replay
//! - Authorization Code Flow (RFC 6749 Section 4.1) through a correlated popup
//! - Pluggable credential storage, consent gate and error sink
//!
//! # Example
//!
//! ```rust,ignore
//! use oauth2_request_integration::{oauth2_client, oauth2_config};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = oauth2_config()
//!         .client_id("my-client-id")
//!         .client_secret("my-client-secret")
//!         .authorize_endpoint("https://provider.com/authorize")
//!         .token_endpoint("https://provider.com/token")
//!         .redirect_uri("http://localhost:8080/callback")
//!         .build()?;
//!
//!     let client = oauth2_client(config)?;
//!
//!     // The redirect handler of the host hands redirects back to the client:
//!     // client.authorization_response(&redirect_url);
//!
//!     let mut request = client.request();
//!     request.open("GET", "https://api.provider.com/me", true);
//!     request.set_request_header("Accept", "application/json")?;
//!     let response = request.send(None).await?;
//!
//!     println!("{} {}", response.status, response.body);
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! - `types`: configuration, token and callback data structures
//! - `error`: error hierarchy and the error sink
//! - `challenge`: `WWW-Authenticate` parser
//! - `core`: HTTP transport and popup correlation
//! - `token`: credential storage and the token endpoint client
//! - `flows`: popup-driven authorization-code flow
//! - `request`: the authenticated request state machine
//! - `builders`: fluent configuration builder
//! - `client`: session object tying the components together

pub mod builders;
pub mod challenge;
pub mod client;
pub mod core;
pub mod error;
pub mod flows;
pub mod request;
pub mod token;
pub mod types;

// Re-export main client
pub use client::{oauth2_client, OAuth2Client};

// Re-export builders
pub use builders::{oauth2_config, OAuth2ConfigBuilder};

// Re-export errors
pub use error::{
    AuthorizationError, ConfigurationError, ErrorKind, ErrorSink, NetworkError, OAuth2Error,
    OAuth2Result, ProtocolError, RecordingErrorSink, RequestError, StorageError, TokenError,
    TracingErrorSink,
};

// Re-export types
pub use types::{
    // Config
    ClientCredentials, GrantType, OAuth2Config, PopupWindowConfig, ProviderConfig,
    // Token
    AuthMechanism, CredentialRecord, TokenResponse,
    // Callback
    CallbackParams,
};

// Re-export challenge parsing
pub use challenge::{parse_challenge, parse_challenges, ChallengeParams, Challenges};

// Re-export core components
pub use core::{
    // Transport
    HttpMethod, HttpRequest, HttpResponse, HttpTransport, MockHttpTransport,
    ReqwestHttpTransport,
    // Popup correlation
    PendingAuthorizations, PopupHandle,
};

// Re-export flows
pub use flows::{
    AuthorizationGate, AuthorizationOutcome, AuthorizationPopupFlow, MockPopupLauncher,
    OpenPopup, PopupLauncher, ProceedImmediately, SystemBrowserLauncher,
};

// Re-export requests
pub use request::{
    AbortHandle, AuthenticatedRequest, ReadyState, RequestContext, ResponseView,
};

// Re-export token management
pub use token::{
    CredentialStore, FileTokenStorage, InMemoryTokenStorage, MockTokenStorage,
    TokenEndpointClient, TokenStorage,
};
