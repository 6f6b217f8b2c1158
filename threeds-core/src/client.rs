//! Protocol endpoints consumed by the orchestrator.

use async_trait::async_trait;
use reqwest::header::HeaderValue;
use secrecy::{ExposeSecret, SecretString};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

use crate::{
    config::ThreeDsConfig,
    error::ThreeDsError,
    http_request::Request,
    models::{
        AuthenticationRequest, AuthenticationResponse, ChallengeResultsRequest,
        SupportedVersionsRequest, SupportedVersionsResponse,
    },
};

/// Number of response characters echoed into errors. Kept short to avoid leaking
/// cardholder data into logs.
const RESPONSE_SNIPPET_CHARS: usize = 20;

/// The three protocol endpoints an authentication talks to.
///
/// Implementations report transport failures, non-success statuses and unparsable
/// bodies as errors. They do not retry protocol errors.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    /// Asks the directory server whether the card is enrolled and which version to use.
    async fn supported_versions(
        &self,
        request: &SupportedVersionsRequest,
    ) -> Result<SupportedVersionsResponse, ThreeDsError>;

    /// Submits the authentication request to the ACS.
    async fn authenticate(
        &self,
        request: &AuthenticationRequest,
    ) -> Result<AuthenticationResponse, ThreeDsError>;

    /// Fetches the outcome of a completed challenge.
    async fn challenge_results(
        &self,
        request: &ChallengeResultsRequest,
    ) -> Result<AuthenticationResponse, ThreeDsError>;
}

/// [`ProtocolClient`] for the TokenEx 3DS API.
pub struct TokenExClient {
    request: Request,
    tokenex_id: String,
    api_key: SecretString,
    supported_versions_url: String,
    authentication_url: String,
    challenge_results_url: String,
}

impl TokenExClient {
    /// Creates a client for the endpoints and credentials in `config`.
    #[must_use]
    pub fn new(config: &ThreeDsConfig) -> Self {
        Self {
            request: Request::new(config.request_timeout, config.max_connect_retries),
            tokenex_id: config.tokenex_id.clone(),
            api_key: SecretString::from(config.api_key.expose_secret().to_owned()),
            supported_versions_url: config.supported_versions_url.clone(),
            authentication_url: config.authentication_url.clone(),
            challenge_results_url: config.challenge_results_url.clone(),
        }
    }

    async fn post<B, R>(&self, url: &str, body: &B) -> Result<R, ThreeDsError>
    where
        B: Serialize + Sync + ?Sized,
        R: DeserializeOwned,
    {
        let mut api_key = HeaderValue::from_str(self.api_key.expose_secret()).map_err(|_| {
            ThreeDsError::InvalidInput {
                attribute: "api_key".to_string(),
                reason: "not a valid header value".to_string(),
            }
        })?;
        api_key.set_sensitive(true);

        let request_builder = self
            .request
            .post(url)
            .header("tx-tokenex-id", &self.tokenex_id)
            .header("tx-apikey", api_key)
            .json(body);

        let http_response = self.request.handle(request_builder).await?;
        let status = http_response.status();

        let response_text = http_response.text().await.map_err(|err| {
            ThreeDsError::SerializationError {
                error: format!(
                    "Failed to read response body from {url} with status {status}: {err}"
                ),
            }
        })?;
        debug!(url, status = status.as_u16(), "protocol endpoint responded");

        if !status.is_success() {
            warn!(url, status = status.as_u16(), "protocol endpoint returned an error");
            return Err(ThreeDsError::NetworkError {
                url: url.to_string(),
                status: Some(status.as_u16()),
                error: format!(
                    "request error with bad status code {status}, received: {}",
                    snippet(&response_text)
                ),
            });
        }

        serde_json::from_str::<R>(&response_text).map_err(|parse_err| {
            ThreeDsError::SerializationError {
                error: format!(
                    "Failed to parse response from {url} with status {status}: {parse_err}, received: {}",
                    snippet(&response_text)
                ),
            }
        })
    }
}

fn snippet(text: &str) -> String {
    text.chars().take(RESPONSE_SNIPPET_CHARS).collect()
}

#[async_trait]
impl ProtocolClient for TokenExClient {
    async fn supported_versions(
        &self,
        request: &SupportedVersionsRequest,
    ) -> Result<SupportedVersionsResponse, ThreeDsError> {
        self.post(&self.supported_versions_url, request).await
    }

    async fn authenticate(
        &self,
        request: &AuthenticationRequest,
    ) -> Result<AuthenticationResponse, ThreeDsError> {
        self.post(&self.authentication_url, request).await
    }

    async fn challenge_results(
        &self,
        request: &ChallengeResultsRequest,
    ) -> Result<AuthenticationResponse, ThreeDsError> {
        self.post(&self.challenge_results_url, request).await
    }
}
