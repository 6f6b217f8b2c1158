//! HTTP routes for the browser UI and the ACS.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Path, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Form, Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use threeds_core::{
    models::{
        BrowserDetails, CardholderInput, ChallengeNotification, MessageCategory,
        MethodNotification, PurchaseAmount, RequestHeaders, TokenizedCard,
    },
    orchestrator::{AuthenticationInputs, FailureReason},
    AuthenticationStatus, Orchestrator, ProtocolClient, ThreeDsError, WebhookIngestion,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::warn;

/// Shared by every handler.
pub struct AppState<C> {
    orchestrator: Arc<Orchestrator<C>>,
    ingestion: WebhookIngestion,
}

impl<C: ProtocolClient + 'static> AppState<C> {
    /// Wraps `orchestrator`; ingestion writes into the orchestrator's stores.
    pub fn new(orchestrator: Arc<Orchestrator<C>>) -> Self {
        let ingestion = WebhookIngestion::new(orchestrator.stores().clone());
        Self {
            orchestrator,
            ingestion,
        }
    }
}

impl<C> Clone for AppState<C> {
    fn clone(&self) -> Self {
        Self {
            orchestrator: Arc::clone(&self.orchestrator),
            ingestion: self.ingestion.clone(),
        }
    }
}

/// Body of `POST /authentications`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartAuthenticationRequest {
    /// Output of the tokenization iframe.
    #[serde(flatten)]
    pub card: TokenizedCard,
    /// Payment or non-payment.
    pub message_category: MessageCategory,
    /// Attributes captured in the browser.
    pub browser: BrowserDetails,
    /// Cardholder attributes.
    pub cardholder: CardholderInput,
    /// Purchase; the configured default applies when absent.
    #[serde(default)]
    pub purchase: Option<PurchaseAmount>,
}

/// Body of the two result endpoints.
#[derive(Debug, Deserialize)]
pub struct ResultsRequest {
    /// Correlation key.
    #[serde(rename = "threeDSServerTransID")]
    pub server_transaction_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    transactions: usize,
    pending_fingerprints: usize,
    pending_challenges: usize,
}

/// Builds the router.
///
/// The challenge notification only accepts cross-origin posts from the origin of the
/// configured notification URL; the rest of the API is open to the browser UI.
///
/// # Errors
///
/// Returns [`ThreeDsError::InvalidInput`] if the notification URL has no usable origin.
pub fn router<C: ProtocolClient + 'static>(state: AppState<C>) -> Result<Router, ThreeDsError> {
    let origin = state
        .orchestrator
        .config()
        .challenge_notification_origin()?;
    let origin = HeaderValue::from_str(&origin).map_err(|_| ThreeDsError::InvalidInput {
        attribute: "challenge_notification_url".to_string(),
        reason: format!("origin {origin} is not a valid header value"),
    })?;

    let notification_routes = Router::new()
        .route("/challengeNotification", post(challenge_notification::<C>))
        .layer(
            CorsLayer::new()
                .allow_origin([origin])
                .allow_methods([Method::POST])
                .allow_headers([header::CONTENT_TYPE]),
        );

    let router = Router::new()
        .route("/authentications", post(start::<C>))
        .route(
            "/authentications/:id",
            get(snapshot::<C>).delete(abandon::<C>),
        )
        .route(
            "/deviceFingerprintNotification",
            post(fingerprint_notification::<C>),
        )
        .route("/deviceFingerprintResults", post(fingerprint_results::<C>))
        .route("/challengeResults", post(challenge_results::<C>))
        .route("/healthz", get(healthz::<C>))
        .layer(CorsLayer::permissive())
        .merge(notification_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state);
    Ok(router)
}

fn request_headers(headers: &HeaderMap, peer: Option<SocketAddr>) -> RequestHeaders {
    let text = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    };
    let forwarded_for = text("x-forwarded-for")
        .and_then(|value| value.split(',').next().map(|ip| ip.trim().to_string()))
        .filter(|ip| !ip.is_empty());
    RequestHeaders {
        accept: text(header::ACCEPT.as_str()),
        ip_address: forwarded_for.or_else(|| peer.map(|addr| addr.ip().to_string())),
        user_agent: text(header::USER_AGENT.as_str()),
    }
}

fn status_code(status: &AuthenticationStatus) -> StatusCode {
    match status {
        AuthenticationStatus::Failed {
            reason:
                FailureReason::VersionCheck { .. }
                | FailureReason::Authentication { .. }
                | FailureReason::ChallengeResult { .. },
            ..
        } => StatusCode::BAD_GATEWAY,
        _ => StatusCode::OK,
    }
}

fn status_response(status: &AuthenticationStatus) -> Response {
    (status_code(status), Json(status)).into_response()
}

// The UI keeps polling as long as the response is not a success.
fn poll_response(status: &AuthenticationStatus, pending_message: &str) -> Response {
    if status.is_pending() {
        return (StatusCode::NOT_FOUND, Json(json!({ "result": pending_message })))
            .into_response();
    }
    status_response(status)
}

fn error_response(err: &ThreeDsError) -> Response {
    let status = match err {
        ThreeDsError::InvalidInput { .. } | ThreeDsError::MalformedNotification { .. } => {
            StatusCode::BAD_REQUEST
        }
        ThreeDsError::UnknownTransaction { .. } => StatusCode::NOT_FOUND,
        ThreeDsError::InvalidTransition { .. } => StatusCode::CONFLICT,
        ThreeDsError::NetworkError { .. } => StatusCode::BAD_GATEWAY,
        ThreeDsError::SerializationError { .. } | ThreeDsError::Generic { .. } => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, Json(json!({ "error": err.to_string() }))).into_response()
}

async fn start<C: ProtocolClient + 'static>(
    State(state): State<AppState<C>>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Json(request): Json<StartAuthenticationRequest>,
) -> Response {
    let inputs = AuthenticationInputs {
        message_category: request.message_category,
        browser: request.browser,
        headers: request_headers(&headers, peer.map(|ConnectInfo(addr)| addr)),
        cardholder: request.cardholder,
        purchase: request.purchase,
    };
    let status = state.orchestrator.start(request.card, inputs).await;
    status_response(&status)
}

async fn snapshot<C: ProtocolClient + 'static>(
    State(state): State<AppState<C>>,
    Path(id): Path<String>,
) -> Response {
    state.orchestrator.snapshot(&id).map_or_else(
        || {
            error_response(&ThreeDsError::UnknownTransaction {
                server_transaction_id: id,
            })
        },
        |context| Json(context).into_response(),
    )
}

async fn abandon<C: ProtocolClient + 'static>(
    State(state): State<AppState<C>>,
    Path(id): Path<String>,
) -> Response {
    match state.orchestrator.abandon(&id) {
        Ok(status) => Json(status).into_response(),
        Err(err) => error_response(&err),
    }
}

async fn fingerprint_notification<C: ProtocolClient + 'static>(
    State(state): State<AppState<C>>,
    Form(notification): Form<MethodNotification>,
) -> Response {
    match state.ingestion.fingerprint_completed(&notification) {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => error_response(&err),
    }
}

async fn challenge_notification<C: ProtocolClient + 'static>(
    State(state): State<AppState<C>>,
    Form(notification): Form<ChallengeNotification>,
) -> Response {
    match state.ingestion.challenge_completed(&notification) {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => error_response(&err),
    }
}

async fn fingerprint_results<C: ProtocolClient + 'static>(
    State(state): State<AppState<C>>,
    Json(request): Json<ResultsRequest>,
) -> Response {
    match state
        .orchestrator
        .poll_fingerprint(&request.server_transaction_id)
        .await
    {
        Ok(status) => poll_response(&status, "fingerprint not yet complete"),
        Err(err) => {
            warn!(server_transaction_id = %request.server_transaction_id, %err, "fingerprint poll rejected");
            error_response(&err)
        }
    }
}

async fn challenge_results<C: ProtocolClient + 'static>(
    State(state): State<AppState<C>>,
    Json(request): Json<ResultsRequest>,
) -> Response {
    match state
        .orchestrator
        .poll_challenge(&request.server_transaction_id)
        .await
    {
        Ok(status) => poll_response(&status, "challenge not yet complete"),
        Err(err) => {
            warn!(server_transaction_id = %request.server_transaction_id, %err, "challenge poll rejected");
            error_response(&err)
        }
    }
}

async fn healthz<C: ProtocolClient + 'static>(State(state): State<AppState<C>>) -> Response {
    let stores = state.orchestrator.stores();
    Json(HealthResponse {
        status: "ok",
        transactions: state.orchestrator.transaction_count(),
        pending_fingerprints: stores.fingerprint.len(),
        pending_challenges: stores.challenge.len(),
    })
    .into_response()
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use threeds_core::{
        models::{
            AuthenticationRequest, AuthenticationResponse, ChallengeResultsRequest,
            SupportedVersionsRequest, SupportedVersionsResponse,
        },
        CorrelationStores, Environment, ThreeDsConfig,
    };
    use tower::ServiceExt;

    use super::*;

    const ID: &str = "8a880dc0-d2d2-4067-bcb1-b08d1690b26e";

    #[derive(Default)]
    struct ScriptedClient {
        authentications: Mutex<VecDeque<AuthenticationResponse>>,
        challenge_results: Mutex<VecDeque<AuthenticationResponse>>,
    }

    #[async_trait]
    impl ProtocolClient for ScriptedClient {
        async fn supported_versions(
            &self,
            request: &SupportedVersionsRequest,
        ) -> Result<SupportedVersionsResponse, ThreeDsError> {
            if request.data == "not-enrolled" {
                return Ok(serde_json::from_value(json!({ "thirdPartyStatusCode": "400" })).unwrap());
            }
            Ok(serde_json::from_value(json!({
                "thirdPartyStatusCode": "200",
                "threeDSecureResponse": [{
                    "threeDSServerTransID": ID,
                    "dsIdentifier": "A000000004"
                }],
                "recommended3dsVersion": { "A000000004": "2.2.0" }
            }))
            .unwrap())
        }

        async fn authenticate(
            &self,
            _request: &AuthenticationRequest,
        ) -> Result<AuthenticationResponse, ThreeDsError> {
            self.authentications
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| ThreeDsError::NetworkError {
                    url: "https://test-api.tokenex.com/v2/ThreeDSecure/Authentications"
                        .to_string(),
                    status: Some(500),
                    error: "bad status".to_string(),
                })
        }

        async fn challenge_results(
            &self,
            _request: &ChallengeResultsRequest,
        ) -> Result<AuthenticationResponse, ThreeDsError> {
            self.challenge_results
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| ThreeDsError::Generic {
                    error: "unscripted".to_string(),
                })
        }
    }

    fn app(client: ScriptedClient) -> Router {
        let config = ThreeDsConfig::from_environment(
            Environment::Staging,
            "tx-id",
            "secret",
            "https://hooks.example.com/challengeNotification",
            "https://hooks.example.com/deviceFingerprintNotification",
        )
        .unwrap();
        let orchestrator = Orchestrator::new(client, Arc::new(config), CorrelationStores::new());
        router(AppState::new(Arc::new(orchestrator))).unwrap()
    }

    fn response(trans_status: &str) -> AuthenticationResponse {
        serde_json::from_value(json!({
            "threeDSecureResponse": {
                "transStatus": trans_status,
                "acsURL": "https://acs.example.com/challenge",
                "encodedCReq": "eyJtZXNzYWdlVHlwZSI6IkNSZXEifQ"
            }
        }))
        .unwrap()
    }

    fn start_body(token: &str) -> Body {
        Body::from(
            json!({
                "token": token,
                "messageCategory": "1",
                "browser": {
                    "browserLanguage": "en-US",
                    "colorDepth": 24,
                    "screenHeight": 1080,
                    "screenWidth": 1920,
                    "timeZoneOffset": 300
                },
                "cardholder": {
                    "fullName": "Jane Doe",
                    "email": "jane@example.com",
                    "cardExpiration": "2912"
                }
            })
            .to_string(),
        )
    }

    fn json_post(uri: &str, body: Body) -> Request<Body> {
        Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(body)
            .unwrap()
    }

    fn form_post(uri: &str, field: &str, payload: &str) -> Request<Body> {
        // base64 may contain '+', '/' and '=', which must be percent-encoded in a form
        let encoded = payload
            .replace('+', "%2B")
            .replace('/', "%2F")
            .replace('=', "%3D");
        Request::post(uri)
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(format!("{field}={encoded}")))
            .unwrap()
    }

    fn results_body() -> Body {
        Body::from(json!({ "threeDSServerTransID": ID }).to_string())
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_challenge_flow_over_http() {
        let client = ScriptedClient::default();
        client.authentications.lock().unwrap().push_back(response("C"));
        client
            .challenge_results
            .lock()
            .unwrap()
            .push_back(response("Y"));
        let app = app(client);

        let started = app
            .clone()
            .oneshot(json_post("/authentications", start_body("tok-1")))
            .await
            .unwrap();
        assert_eq!(started.status(), StatusCode::OK);
        let started = body_json(started).await;
        assert_eq!(started["status"], "challengeRequired");
        assert_eq!(started["handoff"]["acsUrl"], "https://acs.example.com/challenge");
        assert_eq!(started["handoff"]["pollIntervalMs"], 1000);

        let pending = app
            .clone()
            .oneshot(json_post("/challengeResults", results_body()))
            .await
            .unwrap();
        assert_eq!(pending.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            body_json(pending).await,
            json!({ "result": "challenge not yet complete" })
        );

        let cres = STANDARD.encode(json!({ "threeDSServerTransID": ID }).to_string());
        let notified = app
            .clone()
            .oneshot(form_post("/challengeNotification", "cres", &cres))
            .await
            .unwrap();
        assert_eq!(notified.status(), StatusCode::NO_CONTENT);

        let completed = app
            .clone()
            .oneshot(json_post("/challengeResults", results_body()))
            .await
            .unwrap();
        assert_eq!(completed.status(), StatusCode::OK);
        let completed = body_json(completed).await;
        assert_eq!(completed["status"], "completed");
        assert_eq!(completed["result"]["threeDSecureResponse"]["transStatus"], "Y");

        let snapshot = app
            .oneshot(
                Request::get(format!("/authentications/{ID}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let snapshot = body_json(snapshot).await;
        assert_eq!(snapshot["phase"], "Completed");
        assert!(snapshot.get("panToken").is_none());
    }

    #[tokio::test]
    async fn test_authentication_failure_is_bad_gateway() {
        let app = app(ScriptedClient::default());

        let response = app
            .oneshot(json_post("/authentications", start_body("tok-1")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(body_json(response).await["reason"]["kind"], "authentication");
    }

    #[tokio::test]
    async fn test_not_enrolled_is_a_result_not_an_error() {
        let app = app(ScriptedClient::default());

        let response = app
            .oneshot(json_post("/authentications", start_body("not-enrolled")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "failed");
        assert_eq!(body["reason"]["kind"], "notEnrolled");
    }

    #[tokio::test]
    async fn test_malformed_notification_is_bad_request() {
        let app = app(ScriptedClient::default());

        let response = app
            .clone()
            .oneshot(form_post(
                "/deviceFingerprintNotification",
                "threeDSMethodData",
                "not-base64!",
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let health = body_json(
            app.oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(health["pendingFingerprints"], 0);
    }

    #[tokio::test]
    async fn test_poll_for_unknown_transaction_is_not_found() {
        let app = app(ScriptedClient::default());

        let response = app
            .oneshot(json_post("/deviceFingerprintResults", results_body()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(body_json(response).await["error"]
            .as_str()
            .unwrap()
            .starts_with("unknown_transaction"));
    }

    #[tokio::test]
    async fn test_challenge_notification_cors_allows_only_notification_origin() {
        let app = app(ScriptedClient::default());

        let preflight = |origin: &str| {
            Request::builder()
                .method(Method::OPTIONS)
                .uri("/challengeNotification")
                .header(header::ORIGIN, origin)
                .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
                .body(Body::empty())
                .unwrap()
        };

        let allowed = app
            .clone()
            .oneshot(preflight("https://hooks.example.com"))
            .await
            .unwrap();
        assert_eq!(
            allowed.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "https://hooks.example.com"
        );

        let other = app
            .oneshot(preflight("https://evil.example.net"))
            .await
            .unwrap();
        assert!(other
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .is_none());
    }

    #[test]
    fn test_request_headers_prefer_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.7, 10.0.0.1"));
        headers.insert(header::USER_AGENT, HeaderValue::from_static("Mozilla/5.0"));
        let peer: SocketAddr = "192.0.2.1:5000".parse().unwrap();

        let parsed = request_headers(&headers, Some(peer));
        assert_eq!(parsed.ip_address.as_deref(), Some("203.0.113.7"));
        assert_eq!(parsed.user_agent.as_deref(), Some("Mozilla/5.0"));
        assert_eq!(parsed.accept, None);

        let parsed = request_headers(&HeaderMap::new(), Some(peer));
        assert_eq!(parsed.ip_address.as_deref(), Some("192.0.2.1"));
    }
}
