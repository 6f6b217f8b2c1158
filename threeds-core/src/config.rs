//! Runtime configuration: vendor endpoints, credentials, notification URLs and timings.

use std::time::Duration;

use reqwest::Url;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::{
    error::ThreeDsError,
    models::{MerchantDetails, PurchaseAmount},
    polling::{PollPolicy, CHALLENGE_POLL_INTERVAL, FINGERPRINT_POLL_INTERVAL},
    store::Milestone,
    Environment,
};

const SUPPORTED_VERSIONS_PATH: &str = "/v2/ThreeDSecure/SupportedVersions";
const AUTHENTICATIONS_PATH: &str = "/v2/ThreeDSecure/Authentications";
const CHALLENGE_RESULTS_PATH: &str = "/v2/ThreeDSecure/ChallengeResults";

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_MAX_CONNECT_RETRIES: u32 = 3; // total attempts = 4
const DEFAULT_CORRELATION_TTL: Duration = Duration::from_secs(15 * 60);

/// The merchant on whose behalf authentications are requested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerchantProfile {
    /// BIN of the merchant's acquiring institution.
    pub acquirer_bin: String,
    /// Merchant identifier assigned by the acquirer.
    pub acquirer_merchant_id: String,
    /// Merchant category code.
    pub category_code: String,
    /// ISO 3166 numeric country code.
    pub country_code: String,
    /// Merchant name.
    pub name: String,
}

impl MerchantProfile {
    /// The `MerchantDetails` section of an authentication request.
    #[must_use]
    pub fn details(&self) -> MerchantDetails {
        MerchantDetails {
            acquirer_merchant_id: self.acquirer_merchant_id.clone(),
            category_code: self.category_code.clone(),
            country_code: self.country_code.clone(),
            name: self.name.clone(),
        }
    }
}

impl Default for MerchantProfile {
    // The vendor test environment accepts this merchant.
    fn default() -> Self {
        Self {
            acquirer_bin: "444444".to_string(),
            acquirer_merchant_id: "External_Test_Merchant".to_string(),
            category_code: "0001".to_string(),
            country_code: "840".to_string(),
            name: "Merchant Name".to_string(),
        }
    }
}

/// Configuration of the orchestrator and its protocol client.
#[derive(Debug)]
pub struct ThreeDsConfig {
    /// Version-check endpoint.
    pub supported_versions_url: String,
    /// Authentication endpoint.
    pub authentication_url: String,
    /// Challenge-result endpoint.
    pub challenge_results_url: String,
    /// Where the ACS posts the challenge response. Must be publicly reachable.
    pub challenge_notification_url: String,
    /// Where the ACS posts the 3DS method notification.
    pub method_notification_url: String,
    /// Vendor account identifier, sent as `tx-tokenex-id`.
    pub tokenex_id: String,
    /// Vendor API key, sent as `tx-apikey`.
    pub api_key: SecretString,
    /// Timeout of one outbound request.
    pub request_timeout: Duration,
    /// Retries after a connection failure. Responses are never retried.
    pub max_connect_retries: u32,
    /// Polling interval the UI should use while fingerprinting.
    pub fingerprint_poll_interval: Duration,
    /// Polling interval the UI should use while challenged.
    pub challenge_poll_interval: Duration,
    /// Age after which unconsumed correlation records are dropped.
    pub correlation_ttl: Duration,
    /// Merchant profile.
    pub merchant: MerchantProfile,
    /// Purchase used when the caller does not provide one.
    pub purchase: PurchaseAmount,
}

impl ThreeDsConfig {
    /// Builds the default configuration for `environment`.
    ///
    /// # Errors
    ///
    /// Returns [`ThreeDsError::InvalidInput`] if a credential is empty or a notification
    /// URL is not a valid, publicly reachable URL.
    pub fn from_environment(
        environment: Environment,
        tokenex_id: &str,
        api_key: &str,
        challenge_notification_url: &str,
        method_notification_url: &str,
    ) -> Result<Self, ThreeDsError> {
        let base_url = environment.base_url();
        let config = Self {
            supported_versions_url: format!("{base_url}{SUPPORTED_VERSIONS_PATH}"),
            authentication_url: format!("{base_url}{AUTHENTICATIONS_PATH}"),
            challenge_results_url: format!("{base_url}{CHALLENGE_RESULTS_PATH}"),
            challenge_notification_url: challenge_notification_url.to_string(),
            method_notification_url: method_notification_url.to_string(),
            tokenex_id: tokenex_id.to_string(),
            api_key: SecretString::from(api_key.to_string()),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_connect_retries: DEFAULT_MAX_CONNECT_RETRIES,
            fingerprint_poll_interval: FINGERPRINT_POLL_INTERVAL,
            challenge_poll_interval: CHALLENGE_POLL_INTERVAL,
            correlation_ttl: DEFAULT_CORRELATION_TTL,
            merchant: MerchantProfile::default(),
            purchase: PurchaseAmount::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Parses a JSON configuration document. See [`ConfigFile`] for the accepted keys.
    ///
    /// # Errors
    ///
    /// Returns [`ThreeDsError::SerializationError`] for malformed JSON and
    /// [`ThreeDsError::InvalidInput`] for invalid values.
    pub fn from_json(json: &str) -> Result<Self, ThreeDsError> {
        let file: ConfigFile =
            serde_json::from_str(json).map_err(|e| ThreeDsError::SerializationError {
                error: format!("invalid configuration json: {e}"),
            })?;
        file.into_config()
    }

    /// Points all three protocol endpoints at `base_url`. Used against mock servers.
    #[must_use]
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        let base_url = base_url.trim_end_matches('/');
        self.supported_versions_url = format!("{base_url}{SUPPORTED_VERSIONS_PATH}");
        self.authentication_url = format!("{base_url}{AUTHENTICATIONS_PATH}");
        self.challenge_results_url = format!("{base_url}{CHALLENGE_RESULTS_PATH}");
        self
    }

    /// Checks credentials and URLs.
    ///
    /// Protocol endpoints must use https unless they point at a loopback address.
    /// Notification URLs must be public: the ACS rejects localhost.
    ///
    /// # Errors
    ///
    /// Returns [`ThreeDsError::InvalidInput`] naming the first offending attribute.
    pub fn validate(&self) -> Result<(), ThreeDsError> {
        if self.tokenex_id.trim().is_empty() {
            return Err(invalid("tokenex_id", "must not be empty"));
        }
        if self.api_key.expose_secret().trim().is_empty() {
            return Err(invalid("api_key", "must not be empty"));
        }
        for (attribute, url) in [
            ("supported_versions_url", &self.supported_versions_url),
            ("authentication_url", &self.authentication_url),
            ("challenge_results_url", &self.challenge_results_url),
        ] {
            let url = parse_url(attribute, url)?;
            if url.scheme() != "https" && !is_loopback(&url) {
                return Err(invalid(attribute, "must use https"));
            }
        }
        for (attribute, url) in [
            ("challenge_notification_url", &self.challenge_notification_url),
            ("method_notification_url", &self.method_notification_url),
        ] {
            let url = parse_url(attribute, url)?;
            if is_loopback(&url) {
                return Err(invalid(attribute, "must be reachable by the ACS, not localhost"));
            }
        }
        if self.request_timeout.is_zero() {
            return Err(invalid("request_timeout", "must be positive"));
        }
        if self.fingerprint_poll_interval.is_zero() {
            return Err(invalid("fingerprint_poll_interval", "must be positive"));
        }
        if self.challenge_poll_interval.is_zero() {
            return Err(invalid("challenge_poll_interval", "must be positive"));
        }
        Ok(())
    }

    /// Polling cadence the UI is told to use for `milestone`.
    #[must_use]
    pub const fn poll_policy(&self, milestone: Milestone) -> PollPolicy {
        PollPolicy::every(match milestone {
            Milestone::Fingerprint => self.fingerprint_poll_interval,
            Milestone::Challenge => self.challenge_poll_interval,
        })
    }

    /// Origin of the challenge notification URL, e.g. `https://hooks.example.com`.
    ///
    /// # Errors
    ///
    /// Returns [`ThreeDsError::InvalidInput`] if the URL does not parse.
    pub fn challenge_notification_origin(&self) -> Result<String, ThreeDsError> {
        let url = parse_url("challenge_notification_url", &self.challenge_notification_url)?;
        Ok(url.origin().ascii_serialization())
    }
}

fn invalid(attribute: &str, reason: &str) -> ThreeDsError {
    ThreeDsError::InvalidInput {
        attribute: attribute.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_url(attribute: &str, url: &str) -> Result<Url, ThreeDsError> {
    Url::parse(url).map_err(|e| invalid(attribute, &format!("invalid url: {e}")))
}

fn is_loopback(url: &Url) -> bool {
    match url.host_str() {
        Some(host) => {
            host == "localhost"
                || host
                    .trim_start_matches('[')
                    .trim_end_matches(']')
                    .parse::<std::net::IpAddr>()
                    .is_ok_and(|ip| ip.is_loopback())
        }
        None => false,
    }
}

/// On-disk configuration document.
///
/// Only the credentials and the two notification URLs are required; everything else
/// falls back to the defaults of [`ThreeDsConfig::from_environment`].
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    /// `staging` (default) or `production`.
    #[serde(default)]
    pub environment: Option<String>,
    /// Overrides the base URL of all three protocol endpoints.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Vendor account identifier.
    pub tokenex_id: String,
    /// Vendor API key.
    pub api_key: String,
    /// Where the ACS posts the challenge response.
    pub challenge_notification_url: String,
    /// Where the ACS posts the 3DS method notification.
    pub method_notification_url: String,
    /// Outbound request timeout in milliseconds.
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
    /// Retries after a connection failure.
    #[serde(default)]
    pub max_connect_retries: Option<u32>,
    /// Fingerprint polling interval in milliseconds.
    #[serde(default)]
    pub fingerprint_poll_interval_ms: Option<u64>,
    /// Challenge polling interval in milliseconds.
    #[serde(default)]
    pub challenge_poll_interval_ms: Option<u64>,
    /// Correlation record lifetime in seconds.
    #[serde(default)]
    pub correlation_ttl_secs: Option<u64>,
    /// Merchant profile.
    #[serde(default)]
    pub merchant: Option<MerchantProfile>,
    /// Default purchase.
    #[serde(default)]
    pub purchase: Option<PurchaseAmount>,
}

impl ConfigFile {
    /// Resolves the document into a validated [`ThreeDsConfig`].
    ///
    /// # Errors
    ///
    /// Returns [`ThreeDsError::InvalidInput`] for an unknown environment or invalid values.
    pub fn into_config(self) -> Result<ThreeDsConfig, ThreeDsError> {
        let environment = match self.environment.as_deref() {
            None => Environment::Staging,
            Some(raw) => raw
                .parse::<Environment>()
                .map_err(|_| invalid("environment", &format!("unknown environment {raw}")))?,
        };
        let mut config = ThreeDsConfig::from_environment(
            environment,
            &self.tokenex_id,
            &self.api_key,
            &self.challenge_notification_url,
            &self.method_notification_url,
        )?;
        if let Some(base_url) = self.base_url {
            config = config.with_base_url(&base_url);
        }
        if let Some(ms) = self.request_timeout_ms {
            config.request_timeout = Duration::from_millis(ms);
        }
        if let Some(retries) = self.max_connect_retries {
            config.max_connect_retries = retries;
        }
        if let Some(ms) = self.fingerprint_poll_interval_ms {
            config.fingerprint_poll_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = self.challenge_poll_interval_ms {
            config.challenge_poll_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = self.correlation_ttl_secs {
            config.correlation_ttl = Duration::from_secs(secs);
        }
        if let Some(merchant) = self.merchant {
            config.merchant = merchant;
        }
        if let Some(purchase) = self.purchase {
            config.purchase = purchase;
        }
        config.validate()?;
        Ok(config)
    }
}
