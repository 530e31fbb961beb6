//! Token Endpoint Client
//!
//! Authorization-code and refresh-token exchanges against the provider's token endpoint.
//! Both post a form-encoded body carrying the client credentials and install the returned
//! tokens into the [`CredentialStore`].

use chrono::Utc;
use secrecy::ExposeSecret;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::core::{HttpMethod, HttpRequest, HttpResponse, HttpTransport};
use crate::error::{
    parse_error_response, AuthorizationError, OAuth2Error, ProtocolError, TokenError,
};
use crate::token::CredentialStore;
use crate::types::{GrantType, OAuth2Config, TokenResponse};

const MAX_TOKEN_RESPONSE_SIZE: usize = 1048576; // 1MB

/// Outcome of a token endpoint call that produced a JSON body.
enum TokenReply {
    Tokens(TokenResponse),
    Rejected {
        error: String,
        error_description: Option<String>,
        body: serde_json::Value,
    },
}

/// Token endpoint client.
pub struct TokenEndpointClient {
    config: Arc<OAuth2Config>,
    transport: Arc<dyn HttpTransport>,
    credentials: CredentialStore,
}

impl TokenEndpointClient {
    pub fn new(
        config: Arc<OAuth2Config>,
        transport: Arc<dyn HttpTransport>,
        credentials: CredentialStore,
    ) -> Self {
        Self {
            config,
            transport,
            credentials,
        }
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    /// Exchange an authorization code for tokens and install them.
    ///
    /// A provider `error` leaves the stored credentials untouched.
    pub async fn exchange_authorization_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<TokenResponse, OAuth2Error> {
        let reply = self
            .request_token(
                GrantType::AuthorizationCode,
                &[("code", code), ("redirect_uri", redirect_uri)],
            )
            .await?;

        match reply {
            TokenReply::Tokens(tokens) => {
                self.credentials.install(&tokens, Utc::now()).await?;
                info!("Authorization code exchanged for tokens");
                Ok(tokens)
            }
            TokenReply::Rejected {
                error,
                error_description,
                body,
            } => {
                warn!(error = %error, "Authorization code exchange rejected");
                Err(OAuth2Error::Authorization(
                    AuthorizationError::CodeExchangeRejected {
                        error,
                        error_description,
                        body,
                    },
                ))
            }
        }
    }

    /// Exchange the stored refresh token for a new access token and install the result.
    pub async fn refresh_access_token(&self) -> Result<TokenResponse, OAuth2Error> {
        let refresh_token = self
            .credentials
            .refresh_token()
            .await?
            .ok_or(OAuth2Error::Token(TokenError::NoRefreshToken))?;

        let reply = self
            .request_token(
                GrantType::RefreshToken,
                &[("refresh_token", refresh_token.as_str())],
            )
            .await?;

        match reply {
            TokenReply::Tokens(tokens) => {
                self.credentials.install(&tokens, Utc::now()).await?;
                info!("Access token refreshed");
                Ok(tokens)
            }
            TokenReply::Rejected { error, body, .. } => {
                warn!(error = %error, "Refresh token rejected");
                Err(OAuth2Error::Token(TokenError::RefreshRejected { error, body }))
            }
        }
    }

    fn build_body(&self, grant_type: GrantType, params: &[(&str, &str)]) -> String {
        let mut form = url::form_urlencoded::Serializer::new(String::new());
        form.append_pair("client_id", &self.config.credentials.client_id);
        form.append_pair(
            "client_secret",
            self.config.credentials.client_secret.expose_secret(),
        );
        form.append_pair("grant_type", grant_type.as_str());
        for (name, value) in params {
            form.append_pair(name, value);
        }
        form.finish()
    }

    async fn request_token(
        &self,
        grant_type: GrantType,
        params: &[(&str, &str)],
    ) -> Result<TokenReply, OAuth2Error> {
        let request = HttpRequest {
            method: HttpMethod::Post,
            url: self.config.provider.token_endpoint.clone(),
            headers: vec![
                (
                    "Content-Type".to_string(),
                    "application/x-www-form-urlencoded".to_string(),
                ),
                ("Accept".to_string(), "application/json".to_string()),
            ],
            body: Some(self.build_body(grant_type, params)),
            timeout: Some(self.config.timeout),
            follow_redirects: false,
            max_response_size: Some(MAX_TOKEN_RESPONSE_SIZE),
        };

        debug!(grant_type = grant_type.as_str(), "Requesting token");
        let response = self.transport.send(request).await?;
        parse_token_reply(&response)
    }
}

fn parse_token_reply(response: &HttpResponse) -> Result<TokenReply, OAuth2Error> {
    if (300..400).contains(&response.status) {
        return Err(OAuth2Error::Protocol(ProtocolError::UnexpectedRedirect {
            location: response.header("location").unwrap_or_default().to_string(),
        }));
    }

    let body: serde_json::Value = serde_json::from_str(&response.body).map_err(|e| {
        OAuth2Error::Protocol(ProtocolError::InvalidJson {
            message: e.to_string(),
        })
    })?;

    if let Some(error) = body.get("error") {
        let (error, error_description) = match parse_error_response(&response.body) {
            Some(parsed) => (parsed.error, parsed.error_description),
            None => (error.to_string(), None),
        };
        return Ok(TokenReply::Rejected {
            error,
            error_description,
            body,
        });
    }

    if !(200..300).contains(&response.status) {
        return Err(OAuth2Error::Protocol(ProtocolError::InvalidResponse {
            message: format!("token endpoint returned status {}", response.status),
        }));
    }

    let tokens = serde_json::from_value(body).map_err(|e| {
        OAuth2Error::Protocol(ProtocolError::InvalidJson {
            message: e.to_string(),
        })
    })?;
    Ok(TokenReply::Tokens(tokens))
}
