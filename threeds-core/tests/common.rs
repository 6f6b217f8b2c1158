#![allow(dead_code, missing_docs)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::json;
use threeds_core::{
    models::{
        AuthenticationRequest, AuthenticationResponse, BrowserDetails, CardholderInput,
        ChallengeResultsRequest, MessageCategory, RequestHeaders, SupportedVersionsRequest,
        SupportedVersionsResponse, TokenizedCard,
    },
    orchestrator::AuthenticationInputs,
    CorrelationStores, Environment, Orchestrator, ProtocolClient, ThreeDsConfig, ThreeDsError,
};

pub const SERVER_TRANSACTION_ID: &str = "8a880dc0-d2d2-4067-bcb1-b08d1690b26e";
pub const METHOD_URL: &str = "https://acs.example.com/3dsmethod";
pub const ACS_URL: &str = "https://acs.example.com/challenge";

#[derive(Default)]
struct Script {
    versions: VecDeque<Result<SupportedVersionsResponse, ThreeDsError>>,
    authentications: VecDeque<Result<AuthenticationResponse, ThreeDsError>>,
    challenge_results: VecDeque<Result<AuthenticationResponse, ThreeDsError>>,
    version_requests: Vec<SupportedVersionsRequest>,
    authentication_requests: Vec<AuthenticationRequest>,
    challenge_requests: Vec<ChallengeResultsRequest>,
    authenticate_stall: Option<Duration>,
    challenge_results_stall: Option<Duration>,
}

/// A [`ProtocolClient`] that answers from queued responses and records every request.
///
/// Clones share the same script, so a test keeps one clone to inspect what the
/// orchestrator sent.
#[derive(Clone, Default)]
pub struct ScriptedClient {
    script: Arc<Mutex<Script>>,
}

impl ScriptedClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_supported_versions(
        self,
        response: Result<SupportedVersionsResponse, ThreeDsError>,
    ) -> Self {
        self.script.lock().unwrap().versions.push_back(response);
        self
    }

    pub fn on_authenticate(self, response: Result<AuthenticationResponse, ThreeDsError>) -> Self {
        self.script.lock().unwrap().authentications.push_back(response);
        self
    }

    pub fn on_challenge_results(
        self,
        response: Result<AuthenticationResponse, ThreeDsError>,
    ) -> Self {
        self.script
            .lock()
            .unwrap()
            .challenge_results
            .push_back(response);
        self
    }

    /// Holds the first authentication response back for `delay`.
    pub fn stall_authenticate(self, delay: Duration) -> Self {
        self.script.lock().unwrap().authenticate_stall = Some(delay);
        self
    }

    /// Holds the first challenge result back for `delay`.
    pub fn stall_challenge_results(self, delay: Duration) -> Self {
        self.script.lock().unwrap().challenge_results_stall = Some(delay);
        self
    }

    pub fn version_requests(&self) -> Vec<SupportedVersionsRequest> {
        self.script.lock().unwrap().version_requests.clone()
    }

    pub fn authentication_requests(&self) -> Vec<AuthenticationRequest> {
        self.script.lock().unwrap().authentication_requests.clone()
    }

    pub fn challenge_requests(&self) -> Vec<ChallengeResultsRequest> {
        self.script.lock().unwrap().challenge_requests.clone()
    }
}

fn unscripted(endpoint: &str) -> ThreeDsError {
    ThreeDsError::Generic {
        error: format!("no scripted response for {endpoint}"),
    }
}

#[async_trait]
impl ProtocolClient for ScriptedClient {
    async fn supported_versions(
        &self,
        request: &SupportedVersionsRequest,
    ) -> Result<SupportedVersionsResponse, ThreeDsError> {
        let mut script = self.script.lock().unwrap();
        script.version_requests.push(request.clone());
        script
            .versions
            .pop_front()
            .unwrap_or_else(|| Err(unscripted("supported_versions")))
    }

    async fn authenticate(
        &self,
        request: &AuthenticationRequest,
    ) -> Result<AuthenticationResponse, ThreeDsError> {
        let stall = {
            let mut script = self.script.lock().unwrap();
            script.authentication_requests.push(request.clone());
            script.authenticate_stall.take()
        };
        if let Some(delay) = stall {
            tokio::time::sleep(delay).await;
        }
        self.script
            .lock()
            .unwrap()
            .authentications
            .pop_front()
            .unwrap_or_else(|| Err(unscripted("authenticate")))
    }

    async fn challenge_results(
        &self,
        request: &ChallengeResultsRequest,
    ) -> Result<AuthenticationResponse, ThreeDsError> {
        let stall = {
            let mut script = self.script.lock().unwrap();
            script.challenge_requests.push(request.clone());
            script.challenge_results_stall.take()
        };
        if let Some(delay) = stall {
            tokio::time::sleep(delay).await;
        }
        self.script
            .lock()
            .unwrap()
            .challenge_results
            .pop_front()
            .unwrap_or_else(|| Err(unscripted("challenge_results")))
    }
}

pub fn config() -> ThreeDsConfig {
    ThreeDsConfig::from_environment(
        Environment::Staging,
        "tx-id",
        "secret-key",
        "https://hooks.example.com/challengeNotification",
        "https://hooks.example.com/deviceFingerprintNotification",
    )
    .unwrap()
}

pub fn orchestrator(client: ScriptedClient) -> Orchestrator<ScriptedClient> {
    Orchestrator::new(client, Arc::new(config()), CorrelationStores::new())
}

pub fn card() -> TokenizedCard {
    TokenizedCard {
        token: "5555550000004444".to_string(),
        version_check: None,
    }
}

pub fn inputs() -> AuthenticationInputs {
    AuthenticationInputs {
        message_category: MessageCategory::Payment,
        browser: BrowserDetails {
            browser_language: "en-US".to_string(),
            color_depth: 24,
            screen_height: 1080,
            screen_width: 1920,
            time_zone_offset: 300,
        },
        headers: RequestHeaders {
            accept: Some("text/html".to_string()),
            ip_address: Some("203.0.113.7".to_string()),
            user_agent: Some("Mozilla/5.0".to_string()),
        },
        cardholder: CardholderInput {
            full_name: "Jane Doe".to_string(),
            email: "jane@example.com".to_string(),
            card_expiration: "2912".to_string(),
        },
        purchase: None,
    }
}

pub fn enrolled(method_url: Option<&str>) -> SupportedVersionsResponse {
    enrolled_as(SERVER_TRANSACTION_ID, method_url)
}

pub fn enrolled_as(
    server_transaction_id: &str,
    method_url: Option<&str>,
) -> SupportedVersionsResponse {
    let mut entry = json!({
        "threeDSServerTransID": server_transaction_id,
        "dsIdentifier": "A000000004"
    });
    if let Some(url) = method_url {
        entry["threeDSMethodURL"] = json!(url);
    }
    serde_json::from_value(json!({
        "thirdPartyStatusCode": "200",
        "threeDSecureResponse": [entry],
        "recommended3dsVersion": { "A000000004": "2.2.0" }
    }))
    .unwrap()
}

pub fn not_enrolled() -> SupportedVersionsResponse {
    serde_json::from_value(json!({
        "thirdPartyStatusCode": "400",
        "threeDSecureResponse": [{ "threeDSServerTransID": SERVER_TRANSACTION_ID }]
    }))
    .unwrap()
}

pub fn frictionless() -> AuthenticationResponse {
    serde_json::from_value(json!({
        "threeDSecureResponse": {
            "transStatus": "Y",
            "eci": "05",
            "authenticationValue": "AAABBBCCCDDD",
            "threeDSServerTransID": SERVER_TRANSACTION_ID
        }
    }))
    .unwrap()
}

pub fn challenge() -> AuthenticationResponse {
    serde_json::from_value(json!({
        "threeDSecureResponse": {
            "transStatus": "C",
            "acsURL": ACS_URL,
            "encodedCReq": "eyJtZXNzYWdlVHlwZSI6IkNSZXEifQ",
            "threeDSServerTransID": SERVER_TRANSACTION_ID
        }
    }))
    .unwrap()
}

pub fn challenge_outcome() -> AuthenticationResponse {
    serde_json::from_value(json!({
        "threeDSecureResponse": {
            "transStatus": "Y",
            "eci": "02",
            "authenticationValue": "kBMI/uGZvlKCygBkcQIlLJeBTPLG",
            "threeDSServerTransID": SERVER_TRANSACTION_ID
        }
    }))
    .unwrap()
}

/// A base64 notification payload carrying `server_transaction_id`.
pub fn notification(server_transaction_id: &str) -> String {
    STANDARD.encode(json!({ "threeDSServerTransID": server_transaction_id }).to_string())
}
