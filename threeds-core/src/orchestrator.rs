//! The authentication phase state machine.
//!
//! The flow is a linear pipeline with two optional detours, each of which waits for the
//! ACS to call back:
//!
//! ```text
//! Created ─▶ VersionChecked ─┬─▶ AwaitingFingerprint ─▶ Authenticating ─┬─▶ AwaitingChallenge ─▶ Completed
//!                            └────────────────────────▶ Authenticating ─┴─▶ Completed
//! ```
//!
//! Any non-terminal phase may fail. Every branch is decided by the previous response.
//!
//! Phases run as short request handlers. The out-of-band waits never hold a task across
//! wall-clock time: the caller polls, and each poll is one store lookup. Once the record
//! is there, the next protocol call runs on a detached task that applies its own result,
//! so a caller that goes away mid-poll cannot strand the transaction.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Local;
use serde::Serialize;
use strum::{Display, EnumIter};
use tokio::{task::JoinHandle, time::Instant};
use tracing::{debug, info, warn};

use crate::{
    client::ProtocolClient,
    config::ThreeDsConfig,
    error::ThreeDsError,
    models::{
        AuthenticationRequest, AuthenticationResponse, BrowserDetails, BrowserInfo,
        CardDetails, CardholderDetails, CardholderInput, ChallengeResultsRequest,
        MessageCategory, MethodData, PurchaseAmount, PurchaseDetails, RequestHeaders,
        SupportedVersionsRequest, TokenizedCard, VersionCheck,
    },
    polling::{PollOutcome, PollingGate},
    store::{CorrelationStores, Milestone},
    webhook::encode_method_data,
};

const METHOD_COMPLETED: u8 = 1;
const METHOD_NOT_COMPLETED: u8 = 2;
const ACCOUNT_TYPE_CREDIT: u8 = 2;
const CHALLENGE_WINDOW_FULL_SCREEN: u8 = 5;
const DEVICE_CHANNEL_BROWSER: u8 = 2;
const AUTHENTICATION_INDICATOR_PAYMENT: u8 = 1;
const TRANSACTION_TYPE_GOODS: u8 = 1;
const PURCHASE_DATE_FORMAT: &str = "%Y%m%d%H%M%S";

/// Phase of one authentication attempt.
///
/// Phases only move forward, except that any non-terminal phase may move to `Failed`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, EnumIter, Serialize,
)]
pub enum Phase {
    /// Tokenized card received, version check not yet answered.
    Created,
    /// Version check answered.
    VersionChecked,
    /// Waiting for the ACS to finish device fingerprinting.
    AwaitingFingerprint,
    /// Authentication request in flight.
    Authenticating,
    /// Waiting for the cardholder to finish the challenge.
    AwaitingChallenge,
    /// Final result available.
    Completed,
    /// Terminal failure, including non-enrolled cards.
    Failed,
}

impl Phase {
    /// Whether no further transition is possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// The phase `event` leads to.
    ///
    /// # Errors
    ///
    /// Returns [`ThreeDsError::InvalidTransition`] if `event` is not admitted in this phase.
    pub fn next(self, event: PhaseEvent) -> Result<Self, ThreeDsError> {
        let next = match (self, event) {
            (Self::Created, PhaseEvent::VersionCheckReceived) => Self::VersionChecked,
            (Self::VersionChecked, PhaseEvent::NotEnrolled) => Self::Failed,
            (Self::VersionChecked, PhaseEvent::MethodUrlPresent) => Self::AwaitingFingerprint,
            (Self::VersionChecked, PhaseEvent::MethodUrlAbsent)
            | (Self::AwaitingFingerprint, PhaseEvent::FingerprintReady) => Self::Authenticating,
            (Self::AwaitingFingerprint, PhaseEvent::FingerprintTimedOut) => {
                Self::AwaitingFingerprint
            }
            (Self::Authenticating, PhaseEvent::ChallengeRequired) => Self::AwaitingChallenge,
            (Self::Authenticating, PhaseEvent::Frictionless)
            | (Self::AwaitingChallenge, PhaseEvent::ChallengeReady) => Self::Completed,
            (Self::AwaitingChallenge, PhaseEvent::ChallengeTimedOut) => Self::AwaitingChallenge,
            (phase, PhaseEvent::ProtocolError | PhaseEvent::Abandoned) if !phase.is_terminal() => {
                Self::Failed
            }
            (phase, event) => {
                return Err(ThreeDsError::InvalidTransition {
                    phase,
                    event: event.to_string(),
                })
            }
        };
        Ok(next)
    }
}

/// What happened to a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
pub enum PhaseEvent {
    /// The version check returned a usable response.
    VersionCheckReceived,
    /// The card is not enrolled in 3DS.
    NotEnrolled,
    /// The ACS wants to fingerprint the device.
    MethodUrlPresent,
    /// The ACS does not fingerprint devices.
    MethodUrlAbsent,
    /// The fingerprint notification arrived.
    FingerprintReady,
    /// A fingerprint poll found nothing yet.
    FingerprintTimedOut,
    /// The ACS asked for a challenge.
    ChallengeRequired,
    /// The ACS decided without a challenge.
    Frictionless,
    /// The challenge notification arrived.
    ChallengeReady,
    /// A challenge poll found nothing yet.
    ChallengeTimedOut,
    /// A protocol endpoint failed or answered something unusable.
    ProtocolError,
    /// The caller gave up on the transaction.
    Abandoned,
}

/// Why a transaction failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum FailureReason {
    /// The card is not enrolled. A business outcome, not a system error.
    NotEnrolled {
        /// The `thirdPartyStatusCode` returned.
        status_code: String,
    },
    /// The version check failed.
    VersionCheck {
        /// Error details.
        error: String,
    },
    /// The authentication request failed.
    Authentication {
        /// Error details.
        error: String,
    },
    /// Fetching the challenge result failed.
    ChallengeResult {
        /// Error details.
        error: String,
    },
    /// The caller abandoned the transaction.
    Abandoned,
}

/// What the UI needs to post the hidden 3DS method form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FingerprintHandoff {
    /// Form action.
    pub method_url: String,
    /// Value of the `threeDSMethodData` form field.
    pub method_data: String,
    /// How often to poll for fingerprint completion.
    pub poll_interval_ms: u64,
}

/// What the UI needs to post the challenge form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeHandoff {
    /// Form action.
    pub acs_url: String,
    /// Value of the `creq` form field.
    pub creq: String,
    /// How often to poll for challenge completion.
    pub poll_interval_ms: u64,
}

/// Result of an orchestrator operation, as rendered to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum AuthenticationStatus {
    /// Post the method form and poll for fingerprint completion.
    #[serde(rename_all = "camelCase")]
    FingerprintRequired {
        /// Correlation key.
        server_transaction_id: String,
        /// Method form contents.
        handoff: FingerprintHandoff,
    },
    /// Post the challenge form and poll for challenge completion.
    #[serde(rename_all = "camelCase")]
    ChallengeRequired {
        /// Correlation key.
        server_transaction_id: String,
        /// Challenge form contents.
        handoff: ChallengeHandoff,
    },
    /// Not yet complete. Keep polling.
    #[serde(rename_all = "camelCase")]
    Pending {
        /// Correlation key.
        server_transaction_id: String,
        /// Current phase.
        phase: Phase,
    },
    /// Final authentication result.
    #[serde(rename_all = "camelCase")]
    Completed {
        /// Correlation key.
        server_transaction_id: String,
        /// Final response of the ACS.
        result: AuthenticationResponse,
    },
    /// Terminal failure.
    #[serde(rename_all = "camelCase")]
    Failed {
        /// Correlation key, when the version check assigned one.
        server_transaction_id: Option<String>,
        /// Cause of the failure.
        reason: FailureReason,
    },
}

impl AuthenticationStatus {
    /// Whether the caller should keep polling.
    #[must_use]
    pub const fn is_pending(&self) -> bool {
        matches!(self, Self::Pending { .. })
    }

    /// Whether the status is final.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Failed { .. })
    }
}

/// Cardholder and browser attributes collected when the authentication starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticationInputs {
    /// Payment or non-payment authentication.
    pub message_category: MessageCategory,
    /// Attributes captured in the browser.
    pub browser: BrowserDetails,
    /// Attributes taken from the browser's request.
    pub headers: RequestHeaders,
    /// Cardholder attributes.
    pub cardholder: CardholderInput,
    /// Purchase, or `None` for the configured default.
    pub purchase: Option<PurchaseAmount>,
}

/// State of one authentication attempt.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionContext {
    server_transaction_id: String,
    directory_server_identifier: String,
    message_version: String,
    #[serde(skip)]
    pan_token: String,
    phase: Phase,
    fingerprint_required: bool,
    fingerprint_success: bool,
    challenge_required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    fingerprint_handoff: Option<FingerprintHandoff>,
    #[serde(skip_serializing_if = "Option::is_none")]
    challenge_handoff: Option<ChallengeHandoff>,
    #[serde(skip_serializing_if = "Option::is_none")]
    final_result: Option<AuthenticationResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    failure: Option<FailureReason>,
    #[serde(skip)]
    inputs: AuthenticationInputs,
    #[serde(skip)]
    challenge_in_flight: bool,
    #[serde(skip)]
    finished_at: Option<Instant>,
}

impl TransactionContext {
    fn created(pan_token: String, inputs: AuthenticationInputs) -> Self {
        Self {
            server_transaction_id: String::new(),
            directory_server_identifier: String::new(),
            message_version: String::new(),
            pan_token,
            phase: Phase::Created,
            fingerprint_required: false,
            fingerprint_success: false,
            challenge_required: false,
            fingerprint_handoff: None,
            challenge_handoff: None,
            final_result: None,
            failure: None,
            inputs,
            challenge_in_flight: false,
            finished_at: None,
        }
    }

    /// Correlation key assigned by the version check. Empty before it.
    #[must_use]
    pub fn server_transaction_id(&self) -> &str {
        &self.server_transaction_id
    }

    /// Directory server selected by the version check.
    #[must_use]
    pub fn directory_server_identifier(&self) -> &str {
        &self.directory_server_identifier
    }

    /// Message version selected by the version check.
    #[must_use]
    pub fn message_version(&self) -> &str {
        &self.message_version
    }

    /// Current phase.
    #[must_use]
    pub const fn phase(&self) -> Phase {
        self.phase
    }

    /// Whether the ACS asked for device fingerprinting.
    #[must_use]
    pub const fn fingerprint_required(&self) -> bool {
        self.fingerprint_required
    }

    /// Whether device fingerprinting completed.
    #[must_use]
    pub const fn fingerprint_success(&self) -> bool {
        self.fingerprint_success
    }

    /// Whether the ACS asked for a challenge.
    #[must_use]
    pub const fn challenge_required(&self) -> bool {
        self.challenge_required
    }

    /// Final ACS response, set once `Completed`.
    #[must_use]
    pub const fn final_result(&self) -> Option<&AuthenticationResponse> {
        self.final_result.as_ref()
    }

    /// Cause of failure, set once `Failed`.
    #[must_use]
    pub const fn failure(&self) -> Option<&FailureReason> {
        self.failure.as_ref()
    }

    fn advance(&mut self, event: PhaseEvent) -> Result<(), ThreeDsError> {
        let next = self.phase.next(event)?;
        if next != self.phase {
            info!(
                server_transaction_id = %self.server_transaction_id,
                from = %self.phase,
                to = %next,
                %event,
                "phase transition"
            );
        }
        self.phase = next;
        self.mark_finished();
        Ok(())
    }

    fn mark_finished(&mut self) {
        if self.phase.is_terminal() && self.finished_at.is_none() {
            self.finished_at = Some(Instant::now());
        }
    }

    fn fail(&mut self, event: PhaseEvent, reason: FailureReason) {
        if let Err(err) = self.advance(event) {
            warn!(
                server_transaction_id = %self.server_transaction_id,
                %err,
                "forcing transaction into Failed"
            );
            self.phase = Phase::Failed;
            self.mark_finished();
        }
        warn!(
            server_transaction_id = %self.server_transaction_id,
            ?reason,
            "authentication failed"
        );
        self.failure = Some(reason);
    }

    fn record_version_check(&mut self, check: &VersionCheck) -> Result<(), ThreeDsError> {
        self.server_transaction_id.clone_from(&check.server_transaction_id);
        self.directory_server_identifier
            .clone_from(&check.directory_server_identifier);
        self.message_version.clone_from(&check.message_version);
        self.advance(PhaseEvent::VersionCheckReceived)
    }

    fn pending(&self) -> AuthenticationStatus {
        AuthenticationStatus::Pending {
            server_transaction_id: self.server_transaction_id.clone(),
            phase: self.phase,
        }
    }

    /// The status a caller should see for the current phase.
    #[must_use]
    pub fn status(&self) -> AuthenticationStatus {
        let server_transaction_id = self.server_transaction_id.clone();
        match (self.phase, &self.fingerprint_handoff, &self.challenge_handoff) {
            (Phase::AwaitingFingerprint, Some(handoff), _) => {
                AuthenticationStatus::FingerprintRequired {
                    server_transaction_id,
                    handoff: handoff.clone(),
                }
            }
            (Phase::AwaitingChallenge, _, Some(handoff)) => {
                AuthenticationStatus::ChallengeRequired {
                    server_transaction_id,
                    handoff: handoff.clone(),
                }
            }
            (Phase::Completed, _, _) => match &self.final_result {
                Some(result) => AuthenticationStatus::Completed {
                    server_transaction_id,
                    result: result.clone(),
                },
                None => self.pending(),
            },
            (Phase::Failed, _, _) => AuthenticationStatus::Failed {
                server_transaction_id: Some(server_transaction_id).filter(|id| !id.is_empty()),
                reason: self.failure.clone().unwrap_or(FailureReason::Abandoned),
            },
            _ => self.pending(),
        }
    }

    fn authentication_request(&self, config: &ThreeDsConfig) -> AuthenticationRequest {
        let inputs = &self.inputs;
        let purchase = inputs.purchase.as_ref().unwrap_or(&config.purchase);
        AuthenticationRequest {
            server_transaction_id: self.server_transaction_id.clone(),
            method_completion_indicator: if self.fingerprint_success {
                METHOD_COMPLETED
            } else {
                METHOD_NOT_COMPLETED
            },
            message_version: self.message_version.clone(),
            browser_info: BrowserInfo::new(&inputs.browser, &inputs.headers),
            acquirer_bin: config.merchant.acquirer_bin.clone(),
            cardholder_details: CardholderDetails {
                name: inputs.cardholder.full_name.clone(),
                email_address: inputs.cardholder.email.clone(),
            },
            card_details: CardDetails {
                number: self.pan_token.clone(),
                card_expiry_date: inputs.cardholder.card_expiration.clone(),
                account_type: ACCOUNT_TYPE_CREDIT,
            },
            challenge_window_size: CHALLENGE_WINDOW_FULL_SCREEN,
            device_channel: DEVICE_CHANNEL_BROWSER,
            directory_server_identifier: self.directory_server_identifier.clone(),
            generate_challenge_request: true,
            merchant_details: config.merchant.details(),
            message_category: inputs.message_category,
            notification_url: config.challenge_notification_url.clone(),
            authentication_indicator: AUTHENTICATION_INDICATOR_PAYMENT,
            purchase_details: PurchaseDetails::new(
                purchase,
                Local::now().format(PURCHASE_DATE_FORMAT).to_string(),
            ),
            transaction_type: TRANSACTION_TYPE_GOODS,
        }
    }

    fn apply_authentication(
        &mut self,
        response: Result<AuthenticationResponse, ThreeDsError>,
        poll_interval: Duration,
    ) {
        let response = match response {
            Ok(response) => response,
            Err(err) => {
                self.fail(
                    PhaseEvent::ProtocolError,
                    FailureReason::Authentication {
                        error: err.to_string(),
                    },
                );
                return;
            }
        };

        if !response.requires_challenge() {
            self.challenge_required = false;
            self.final_result = Some(response);
            if let Err(err) = self.advance(PhaseEvent::Frictionless) {
                self.fail(
                    PhaseEvent::ProtocolError,
                    FailureReason::Authentication {
                        error: err.to_string(),
                    },
                );
            }
            return;
        }

        let acs_url = response.result.acs_url.clone().filter(|url| !url.is_empty());
        let creq = response
            .result
            .encoded_creq
            .clone()
            .filter(|creq| !creq.is_empty());
        let (Some(acs_url), Some(creq)) = (acs_url, creq) else {
            self.fail(
                PhaseEvent::ProtocolError,
                FailureReason::Authentication {
                    error: "challenge requested without acsURL or encodedCReq".to_string(),
                },
            );
            return;
        };

        self.challenge_required = true;
        self.challenge_handoff = Some(ChallengeHandoff {
            acs_url,
            creq,
            poll_interval_ms: millis(poll_interval),
        });
        if let Err(err) = self.advance(PhaseEvent::ChallengeRequired) {
            self.fail(
                PhaseEvent::ProtocolError,
                FailureReason::Authentication {
                    error: err.to_string(),
                },
            );
        }
    }
}

/// Drives authentications through their phases.
///
/// One orchestrator serves the whole process. It owns the registry of transactions
/// keyed by server transaction identifier and shares the correlation stores with
/// webhook ingestion. Each identifier belongs to exactly one transaction.
///
/// Protocol calls made on behalf of a poll run on detached tasks. Dropping the future
/// returned by [`Orchestrator::poll_fingerprint`] or [`Orchestrator::poll_challenge`]
/// leaves the call running; its result lands in the registry and later polls report it.
/// Spawning requires a Tokio runtime.
pub struct Orchestrator<C> {
    shared: Arc<Shared<C>>,
}

struct Shared<C> {
    client: C,
    config: Arc<ThreeDsConfig>,
    stores: CorrelationStores,
    transactions: Mutex<HashMap<String, TransactionContext>>,
}

impl<C> Shared<C> {
    // Entries are replaced whole, so a poisoned lock never exposes a torn context.
    fn transactions(&self) -> MutexGuard<'_, HashMap<String, TransactionContext>> {
        self.transactions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl<C: ProtocolClient> Shared<C> {
    async fn authenticate(
        &self,
        server_transaction_id: &str,
        request: &AuthenticationRequest,
    ) -> AuthenticationStatus {
        let response = self.client.authenticate(request).await;

        let mut transactions = self.transactions();
        let Some(context) = transactions.get_mut(server_transaction_id) else {
            return abandoned(server_transaction_id);
        };
        if context.phase != Phase::Authenticating {
            return context.status();
        }
        context.apply_authentication(
            response,
            self.config.poll_policy(Milestone::Challenge).interval,
        );
        context.status()
    }

    async fn fetch_challenge_result(&self, server_transaction_id: &str) -> AuthenticationStatus {
        let response = self
            .client
            .challenge_results(&ChallengeResultsRequest {
                server_transaction_id: server_transaction_id.to_string(),
            })
            .await;

        let mut transactions = self.transactions();
        let Some(context) = transactions.get_mut(server_transaction_id) else {
            return abandoned(server_transaction_id);
        };
        context.challenge_in_flight = false;
        if context.phase != Phase::AwaitingChallenge {
            return context.status();
        }
        // the record is consumed only once its result is applied
        self.stores.challenge.remove(server_transaction_id);
        match response {
            Ok(result) => {
                context.final_result = Some(result);
                if let Err(err) = context.advance(PhaseEvent::ChallengeReady) {
                    context.fail(
                        PhaseEvent::ProtocolError,
                        FailureReason::ChallengeResult {
                            error: err.to_string(),
                        },
                    );
                }
            }
            Err(err) => context.fail(
                PhaseEvent::ProtocolError,
                FailureReason::ChallengeResult {
                    error: err.to_string(),
                },
            ),
        }
        context.status()
    }
}

impl<C: ProtocolClient + 'static> Orchestrator<C> {
    /// Creates an orchestrator calling `client` and consuming records from `stores`.
    #[must_use]
    pub fn new(client: C, config: Arc<ThreeDsConfig>, stores: CorrelationStores) -> Self {
        Self {
            shared: Arc::new(Shared {
                client,
                config,
                stores,
                transactions: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// The correlation stores this orchestrator consumes from.
    #[must_use]
    pub fn stores(&self) -> &CorrelationStores {
        &self.shared.stores
    }

    /// The configuration in use.
    #[must_use]
    pub fn config(&self) -> &ThreeDsConfig {
        &self.shared.config
    }

    fn transactions(&self) -> MutexGuard<'_, HashMap<String, TransactionContext>> {
        self.shared.transactions()
    }

    /// Registers a fresh context. Records left under its identifier by an earlier
    /// attempt are dropped: the ACS cannot notify for this attempt before its hand-off.
    fn register(&self, context: TransactionContext) {
        let server_transaction_id = context.server_transaction_id.clone();
        self.stores().clear(&server_transaction_id);
        if let Some(previous) = self
            .transactions()
            .insert(server_transaction_id.clone(), context)
        {
            if !previous.phase.is_terminal() {
                warn!(
                    server_transaction_id = %server_transaction_id,
                    phase = %previous.phase,
                    "replaced an in-flight transaction with the same identifier"
                );
            }
        }
    }

    fn spawn_authentication(
        &self,
        server_transaction_id: &str,
        request: AuthenticationRequest,
    ) -> JoinHandle<AuthenticationStatus> {
        let shared = Arc::clone(&self.shared);
        let server_transaction_id = server_transaction_id.to_string();
        tokio::spawn(async move { shared.authenticate(&server_transaction_id, &request).await })
    }

    fn spawn_challenge_result(
        &self,
        server_transaction_id: &str,
    ) -> JoinHandle<AuthenticationStatus> {
        let shared = Arc::clone(&self.shared);
        let server_transaction_id = server_transaction_id.to_string();
        tokio::spawn(async move { shared.fetch_challenge_result(&server_transaction_id).await })
    }

    /// Waits for a protocol task. A task that panicked fails its transaction.
    async fn join(
        &self,
        server_transaction_id: &str,
        task: JoinHandle<AuthenticationStatus>,
        reason: fn(String) -> FailureReason,
    ) -> AuthenticationStatus {
        let err = match task.await {
            Ok(status) => return status,
            Err(err) => err,
        };
        let mut transactions = self.transactions();
        let Some(context) = transactions.get_mut(server_transaction_id) else {
            return abandoned(server_transaction_id);
        };
        context.challenge_in_flight = false;
        if !context.phase.is_terminal() {
            context.fail(PhaseEvent::ProtocolError, reason(err.to_string()));
        }
        context.status()
    }

    /// Starts an authentication for a tokenized card.
    ///
    /// Runs the version check (unless the tokenizer already did), then either hands off
    /// to device fingerprinting or authenticates straight away. Protocol failures are
    /// reported as [`AuthenticationStatus::Failed`].
    pub async fn start(
        &self,
        card: TokenizedCard,
        inputs: AuthenticationInputs,
    ) -> AuthenticationStatus {
        let TokenizedCard {
            token,
            version_check,
        } = card;

        let version_check = match version_check {
            Some(embedded) => VersionCheck::from_response(&embedded),
            None => self
                .shared
                .client
                .supported_versions(&SupportedVersionsRequest {
                    data: token.clone(),
                })
                .await
                .and_then(|response| VersionCheck::from_response(&response)),
        };

        let mut context = TransactionContext::created(token, inputs);
        let check = match version_check {
            Ok(check) => check,
            Err(err) => {
                context.fail(
                    PhaseEvent::ProtocolError,
                    FailureReason::VersionCheck {
                        error: err.to_string(),
                    },
                );
                return context.status();
            }
        };
        if let Err(err) = context.record_version_check(&check) {
            context.fail(
                PhaseEvent::ProtocolError,
                FailureReason::VersionCheck {
                    error: err.to_string(),
                },
            );
            return context.status();
        }

        if !check.is_enrolled() {
            context.fail(
                PhaseEvent::NotEnrolled,
                FailureReason::NotEnrolled {
                    status_code: check.enrollment_status_code.clone(),
                },
            );
            let status = context.status();
            if !context.server_transaction_id.is_empty() {
                self.register(context);
            }
            return status;
        }

        if let Some(method_url) = check.method_url {
            return self.begin_fingerprinting(context, method_url);
        }

        context.fingerprint_required = false;
        context.fingerprint_success = false;
        if let Err(err) = context.advance(PhaseEvent::MethodUrlAbsent) {
            context.fail(
                PhaseEvent::ProtocolError,
                FailureReason::VersionCheck {
                    error: err.to_string(),
                },
            );
            return context.status();
        }
        let request = context.authentication_request(&self.shared.config);
        let server_transaction_id = context.server_transaction_id.clone();
        self.register(context);
        let task = self.spawn_authentication(&server_transaction_id, request);
        self.join(&server_transaction_id, task, |error| {
            FailureReason::Authentication { error }
        })
        .await
    }

    fn begin_fingerprinting(
        &self,
        mut context: TransactionContext,
        method_url: String,
    ) -> AuthenticationStatus {
        let method_data = encode_method_data(&MethodData {
            notification_url: self.shared.config.method_notification_url.clone(),
            server_transaction_id: context.server_transaction_id.clone(),
        })
        .and_then(|method_data| {
            context.advance(PhaseEvent::MethodUrlPresent)?;
            Ok(method_data)
        });
        match method_data {
            Ok(method_data) => {
                context.fingerprint_required = true;
                context.fingerprint_handoff = Some(FingerprintHandoff {
                    method_url,
                    method_data,
                    poll_interval_ms: millis(
                        self.shared
                            .config
                            .poll_policy(Milestone::Fingerprint)
                            .interval,
                    ),
                });
            }
            Err(err) => context.fail(
                PhaseEvent::ProtocolError,
                FailureReason::VersionCheck {
                    error: err.to_string(),
                },
            ),
        }
        let status = context.status();
        self.register(context);
        status
    }

    /// One polling tick for fingerprint completion.
    ///
    /// Returns [`AuthenticationStatus::Pending`] until the fingerprint notification for
    /// `server_transaction_id` arrived. Once it did, the record is consumed and the
    /// authentication request is sent; the returned status is its outcome. Polling a
    /// transaction that already moved past fingerprinting returns its current status,
    /// which stays `Pending` while the authentication request is in flight.
    ///
    /// # Errors
    ///
    /// [`ThreeDsError::UnknownTransaction`] if no transaction owns the identifier and
    /// [`ThreeDsError::InvalidTransition`] if it never awaited a fingerprint.
    pub async fn poll_fingerprint(
        &self,
        server_transaction_id: &str,
    ) -> Result<AuthenticationStatus, ThreeDsError> {
        let task = {
            let mut transactions = self.transactions();
            let context = transactions
                .get_mut(server_transaction_id)
                .ok_or_else(|| unknown(server_transaction_id))?;
            if let Some(status) =
                settled(context, Phase::AwaitingFingerprint, PhaseEvent::FingerprintReady)?
            {
                return Ok(status);
            }

            if PollingGate::check(&self.shared.stores.fingerprint, server_transaction_id)
                == PollOutcome::TimedOut
            {
                context.advance(PhaseEvent::FingerprintTimedOut)?;
                return Ok(context.pending());
            }

            self.shared.stores.fingerprint.remove(server_transaction_id);
            context.fingerprint_success = true;
            context.advance(PhaseEvent::FingerprintReady)?;
            let request = context.authentication_request(&self.shared.config);
            self.spawn_authentication(server_transaction_id, request)
        };

        Ok(self
            .join(server_transaction_id, task, |error| {
                FailureReason::Authentication { error }
            })
            .await)
    }

    /// One polling tick for challenge completion.
    ///
    /// Returns [`AuthenticationStatus::Pending`] until the challenge notification for
    /// `server_transaction_id` arrived and while its result is being fetched. The record
    /// is consumed when the result is applied; the returned status is then final.
    ///
    /// # Errors
    ///
    /// [`ThreeDsError::UnknownTransaction`] if no transaction owns the identifier and
    /// [`ThreeDsError::InvalidTransition`] if it has not reached the challenge yet.
    pub async fn poll_challenge(
        &self,
        server_transaction_id: &str,
    ) -> Result<AuthenticationStatus, ThreeDsError> {
        let task = {
            let mut transactions = self.transactions();
            let context = transactions
                .get_mut(server_transaction_id)
                .ok_or_else(|| unknown(server_transaction_id))?;
            if let Some(status) =
                settled(context, Phase::AwaitingChallenge, PhaseEvent::ChallengeReady)?
            {
                return Ok(status);
            }
            if context.challenge_in_flight {
                debug!(server_transaction_id, "challenge result already being fetched");
                return Ok(context.pending());
            }

            if PollingGate::check(&self.shared.stores.challenge, server_transaction_id)
                == PollOutcome::TimedOut
            {
                context.advance(PhaseEvent::ChallengeTimedOut)?;
                return Ok(context.pending());
            }

            context.challenge_in_flight = true;
            self.spawn_challenge_result(server_transaction_id)
        };

        Ok(self
            .join(server_transaction_id, task, |error| {
                FailureReason::ChallengeResult { error }
            })
            .await)
    }

    /// Copy of the transaction owning `server_transaction_id`.
    #[must_use]
    pub fn snapshot(&self, server_transaction_id: &str) -> Option<TransactionContext> {
        self.transactions().get(server_transaction_id).cloned()
    }

    /// Number of transactions in the registry, terminal ones included.
    #[must_use]
    pub fn transaction_count(&self) -> usize {
        self.transactions().len()
    }

    /// Gives up on a transaction, e.g. after the client disconnected.
    ///
    /// A non-terminal transaction moves to `Failed`; its correlation records are dropped.
    /// Abandoning a terminal transaction returns its status unchanged.
    ///
    /// # Errors
    ///
    /// [`ThreeDsError::UnknownTransaction`] if no transaction owns the identifier.
    pub fn abandon(
        &self,
        server_transaction_id: &str,
    ) -> Result<AuthenticationStatus, ThreeDsError> {
        let mut transactions = self.transactions();
        let context = transactions
            .get_mut(server_transaction_id)
            .ok_or_else(|| unknown(server_transaction_id))?;
        if !context.phase.is_terminal() {
            context.fail(PhaseEvent::Abandoned, FailureReason::Abandoned);
            self.stores().clear(server_transaction_id);
        }
        Ok(context.status())
    }

    /// Removes a transaction from the registry along with its correlation records.
    pub fn forget(&self, server_transaction_id: &str) -> Option<TransactionContext> {
        let context = self.transactions().remove(server_transaction_id);
        self.stores().clear(server_transaction_id);
        context
    }

    /// Drops transactions that reached a terminal phase at least `ttl` ago, along with
    /// their correlation records. Returns how many were dropped.
    pub fn expire_terminal_older_than(&self, ttl: Duration) -> usize {
        let mut transactions = self.transactions();
        let before = transactions.len();
        transactions.retain(|server_transaction_id, context| {
            let expired = context
                .finished_at
                .is_some_and(|finished_at| finished_at.elapsed() >= ttl);
            if expired {
                self.shared.stores.clear(server_transaction_id);
            }
            !expired
        });
        let expired = before - transactions.len();
        if expired > 0 {
            debug!(expired, remaining = transactions.len(), "expired finished transactions");
        }
        expired
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Decides whether a poll for `awaited` has nothing to do.
///
/// A transaction already past `awaited` reports its current status; one that never
/// reached it is an error.
fn settled(
    context: &TransactionContext,
    awaited: Phase,
    event: PhaseEvent,
) -> Result<Option<AuthenticationStatus>, ThreeDsError> {
    match context.phase.cmp(&awaited) {
        Ordering::Equal => Ok(None),
        Ordering::Greater => Ok(Some(match context.phase {
            Phase::Authenticating => context.pending(),
            _ => context.status(),
        })),
        Ordering::Less => Err(ThreeDsError::InvalidTransition {
            phase: context.phase,
            event: event.to_string(),
        }),
    }
}

fn unknown(server_transaction_id: &str) -> ThreeDsError {
    ThreeDsError::UnknownTransaction {
        server_transaction_id: server_transaction_id.to_string(),
    }
}

fn abandoned(server_transaction_id: &str) -> AuthenticationStatus {
    AuthenticationStatus::Failed {
        server_transaction_id: Some(server_transaction_id.to_string()),
        reason: FailureReason::Abandoned,
    }
}

#[cfg(test)]
mod tests {
    use strum::IntoEnumIterator;

    use super::*;

    fn inputs() -> AuthenticationInputs {
        AuthenticationInputs {
            message_category: MessageCategory::Payment,
            browser: BrowserDetails::default(),
            headers: RequestHeaders::default(),
            cardholder: CardholderInput::default(),
            purchase: None,
        }
    }

    fn expected_transitions(phase: Phase) -> Vec<(PhaseEvent, Phase)> {
        let mut transitions = match phase {
            Phase::Created => vec![(PhaseEvent::VersionCheckReceived, Phase::VersionChecked)],
            Phase::VersionChecked => vec![
                (PhaseEvent::NotEnrolled, Phase::Failed),
                (PhaseEvent::MethodUrlPresent, Phase::AwaitingFingerprint),
                (PhaseEvent::MethodUrlAbsent, Phase::Authenticating),
            ],
            Phase::AwaitingFingerprint => vec![
                (PhaseEvent::FingerprintReady, Phase::Authenticating),
                (PhaseEvent::FingerprintTimedOut, Phase::AwaitingFingerprint),
            ],
            Phase::Authenticating => vec![
                (PhaseEvent::ChallengeRequired, Phase::AwaitingChallenge),
                (PhaseEvent::Frictionless, Phase::Completed),
            ],
            Phase::AwaitingChallenge => vec![
                (PhaseEvent::ChallengeReady, Phase::Completed),
                (PhaseEvent::ChallengeTimedOut, Phase::AwaitingChallenge),
            ],
            Phase::Completed | Phase::Failed => vec![],
        };
        if !phase.is_terminal() {
            transitions.push((PhaseEvent::ProtocolError, Phase::Failed));
            transitions.push((PhaseEvent::Abandoned, Phase::Failed));
        }
        transitions
    }

    #[test]
    fn test_transition_table_is_total_and_deterministic() {
        for phase in Phase::iter() {
            let expected = expected_transitions(phase);
            for event in PhaseEvent::iter() {
                let result = phase.next(event);
                match expected.iter().find(|(e, _)| *e == event) {
                    Some((_, to)) => assert_eq!(result.unwrap(), *to, "{phase} + {event}"),
                    None => assert!(
                        matches!(result, Err(ThreeDsError::InvalidTransition { .. })),
                        "{phase} + {event} should be rejected"
                    ),
                }
            }
        }
    }

    #[test]
    fn test_phases_only_move_forward_except_failure() {
        for phase in Phase::iter() {
            for event in PhaseEvent::iter() {
                if let Ok(next) = phase.next(event) {
                    assert!(next >= phase, "{phase} -> {next} moved backwards");
                }
            }
        }
    }

    #[test]
    fn test_terminal_phases_admit_nothing() {
        for event in PhaseEvent::iter() {
            assert!(Phase::Completed.next(event).is_err());
            assert!(Phase::Failed.next(event).is_err());
        }
    }

    #[test]
    fn test_failed_status_omits_missing_identifier() {
        let mut context = TransactionContext::created("tok".to_string(), inputs());
        context.fail(
            PhaseEvent::ProtocolError,
            FailureReason::VersionCheck {
                error: "boom".to_string(),
            },
        );
        assert_eq!(
            context.status(),
            AuthenticationStatus::Failed {
                server_transaction_id: None,
                reason: FailureReason::VersionCheck {
                    error: "boom".to_string()
                },
            }
        );
    }

    #[test]
    fn test_challenge_without_acs_url_fails() {
        let mut context = TransactionContext::created("tok".to_string(), inputs());
        context.phase = Phase::Authenticating;
        let mut response = AuthenticationResponse::default();
        response.result.trans_status = "C".to_string();

        context.apply_authentication(Ok(response), Duration::from_secs(1));

        assert_eq!(context.phase(), Phase::Failed);
        assert!(matches!(
            context.failure(),
            Some(FailureReason::Authentication { .. })
        ));
    }

    #[test]
    fn test_status_serializes_with_tag() {
        let status = AuthenticationStatus::Pending {
            server_transaction_id: "tx-1".to_string(),
            phase: Phase::AwaitingChallenge,
        };
        assert_eq!(
            serde_json::to_value(status).unwrap(),
            serde_json::json!({
                "status": "pending",
                "serverTransactionId": "tx-1",
                "phase": "AwaitingChallenge"
            })
        );
    }
}
