//! Wire models for the vendor 3DS API and the out-of-band notifications.
//!
//! Field names follow the vendor's JSON casing, which differs between endpoints
//! (`camelCase` on responses, `PascalCase` on the authentication request).

use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ThreeDsError;

/// `thirdPartyStatusCode` of a version check for a card enrolled in 3DS.
pub const ENROLLED_STATUS_CODE: &str = "200";

/// `transStatus` of an authentication the ACS wants to challenge.
pub const CHALLENGE_TRANS_STATUS: &str = "C";

/// Body of the version-check (`SupportedVersions`) request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupportedVersionsRequest {
    /// The tokenized card number.
    pub data: String,
}

/// Per directory server entry of a version-check response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryServerResponse {
    /// Server transaction identifier assigned by the directory server.
    #[serde(rename = "threeDSServerTransID", default)]
    pub server_transaction_id: String,
    /// Identifier of the directory server.
    #[serde(rename = "dsIdentifier", default)]
    pub ds_identifier: String,
    /// Where the browser posts the 3DS method form, if the ACS fingerprints devices.
    #[serde(
        rename = "threeDSMethodURL",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub method_url: Option<String>,
}

/// Response of the version-check endpoint.
///
/// The tokenization iframe returns the same shape when it performs the version check
/// itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupportedVersionsResponse {
    /// `"200"` when the card is enrolled.
    #[serde(default)]
    pub third_party_status_code: String,
    /// The tokenized card number, echoed back.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Directory server entries. Only the first one is used.
    #[serde(rename = "threeDSecureResponse", default)]
    pub three_d_secure_response: Vec<DirectoryServerResponse>,
    /// Recommended message version keyed by directory server identifier.
    #[serde(rename = "recommended3dsVersion", default)]
    pub recommended_versions: HashMap<String, String>,
}

/// A version-check response reduced to the values the rest of the flow needs.
///
/// This is the single place the server transaction identifier is read from a response;
/// every later correlation uses the value captured here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionCheck {
    /// Raw `thirdPartyStatusCode`.
    pub enrollment_status_code: String,
    /// Correlation key for the remainder of the flow. Empty for non-enrolled cards that
    /// were not assigned one.
    pub server_transaction_id: String,
    /// Selected directory server.
    pub directory_server_identifier: String,
    /// Message version recommended for that directory server.
    pub message_version: String,
    /// 3DS method URL, when the ACS wants to fingerprint the device.
    pub method_url: Option<String>,
}

impl VersionCheck {
    /// Normalizes a version-check response.
    ///
    /// # Errors
    ///
    /// Returns [`ThreeDsError::SerializationError`] when an enrolled response lacks the
    /// transaction identifier, the directory server or its recommended version.
    pub fn from_response(response: &SupportedVersionsResponse) -> Result<Self, ThreeDsError> {
        let first = response.three_d_secure_response.first();
        let method_url = first
            .and_then(|entry| entry.method_url.clone())
            .filter(|url| !url.trim().is_empty());
        let mut check = Self {
            enrollment_status_code: response.third_party_status_code.clone(),
            server_transaction_id: first
                .map(|entry| entry.server_transaction_id.clone())
                .unwrap_or_default(),
            directory_server_identifier: first
                .map(|entry| entry.ds_identifier.clone())
                .unwrap_or_default(),
            message_version: String::new(),
            method_url,
        };
        if let Some(version) = response
            .recommended_versions
            .get(&check.directory_server_identifier)
        {
            check.message_version.clone_from(version);
        }

        if !check.is_enrolled() {
            return Ok(check);
        }
        if check.server_transaction_id.is_empty() {
            return Err(missing_field("threeDSecureResponse[0].threeDSServerTransID"));
        }
        if check.directory_server_identifier.is_empty() {
            return Err(missing_field("threeDSecureResponse[0].dsIdentifier"));
        }
        if check.message_version.is_empty() {
            return Err(missing_field("recommended3dsVersion[dsIdentifier]"));
        }
        Ok(check)
    }

    /// Whether the card is enrolled in 3DS.
    #[must_use]
    pub fn is_enrolled(&self) -> bool {
        self.enrollment_status_code == ENROLLED_STATUS_CODE
    }
}

fn missing_field(field: &str) -> ThreeDsError {
    ThreeDsError::SerializationError {
        error: format!("version check response is missing {field}"),
    }
}

/// What the tokenization collaborator hands over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenizedCard {
    /// The PAN token.
    pub token: String,
    /// Present when the tokenizer already ran the version check (and the device
    /// fingerprinting that follows it). No version-check call is made in that case.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_check: Option<SupportedVersionsResponse>,
}

/// Kind of authentication requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageCategory {
    /// Payment authentication.
    Payment,
    /// Non-payment authentication, e.g. adding a card on file.
    NonPayment,
}

impl MessageCategory {
    /// Protocol code of the category.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Payment => 1,
            Self::NonPayment => 2,
        }
    }

    /// Parses a protocol code.
    ///
    /// # Errors
    ///
    /// Returns [`ThreeDsError::InvalidInput`] for anything but `1` or `2`.
    pub fn from_code(code: u8) -> Result<Self, ThreeDsError> {
        match code {
            1 => Ok(Self::Payment),
            2 => Ok(Self::NonPayment),
            other => Err(ThreeDsError::InvalidInput {
                attribute: "message_category".to_string(),
                reason: format!("unknown message category {other}"),
            }),
        }
    }
}

impl Serialize for MessageCategory {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.code())
    }
}

impl<'de> Deserialize<'de> for MessageCategory {
    // Browser forms submit radio values as strings, API clients as numbers.
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u8),
            Text(String),
        }

        let code = match Raw::deserialize(deserializer)? {
            Raw::Number(code) => code,
            Raw::Text(text) => text.trim().parse::<u8>().map_err(serde::de::Error::custom)?,
        };
        Self::from_code(code).map_err(serde::de::Error::custom)
    }
}

/// Browser attributes captured by the UI.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserDetails {
    /// `navigator.language`.
    pub browser_language: String,
    /// `screen.colorDepth`.
    pub color_depth: u32,
    /// `screen.height`.
    pub screen_height: u32,
    /// `screen.width`.
    pub screen_width: u32,
    /// `Date.getTimezoneOffset()` in minutes.
    pub time_zone_offset: i32,
}

/// Browser attributes only the server sees, taken from the request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestHeaders {
    /// `Accept` header.
    pub accept: Option<String>,
    /// `X-Forwarded-For` or the peer address.
    pub ip_address: Option<String>,
    /// `User-Agent` header.
    pub user_agent: Option<String>,
}

/// Cardholder details captured by the UI.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardholderInput {
    /// Cardholder name.
    pub full_name: String,
    /// Cardholder email.
    pub email: String,
    /// Card expiry as `YYMM`.
    pub card_expiration: String,
}

/// Purchase amount in minor units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseAmount {
    /// Amount in the lowest unit of the currency, e.g. cents.
    pub amount: u64,
    /// ISO 4217 numeric currency code.
    pub currency: String,
    /// Decimal exponent of the currency.
    pub exponent: u8,
}

impl Default for PurchaseAmount {
    fn default() -> Self {
        Self {
            amount: 1000,
            currency: "840".to_string(),
            exponent: 2,
        }
    }
}

/// `BrowserInfo` section of the authentication request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct BrowserInfo {
    /// `Accept` header of the browser.
    pub accept_headers: Option<String>,
    /// IP address of the browser.
    pub ip_address: Option<String>,
    /// `User-Agent` header of the browser.
    pub user_agent: Option<String>,
    /// The UI runs JavaScript, so this is always true.
    pub javascript_enabled: bool,
    /// Browser language.
    pub language: String,
    /// Time-zone offset in minutes.
    pub time_zone: i32,
    /// Screen height in pixels.
    pub screen_height: u32,
    /// Screen width in pixels.
    pub screen_width: u32,
    /// Screen colour depth.
    pub color_depth: u32,
}

impl BrowserInfo {
    /// Combines UI-captured and request-level attributes.
    #[must_use]
    pub fn new(details: &BrowserDetails, headers: &RequestHeaders) -> Self {
        Self {
            accept_headers: headers.accept.clone(),
            ip_address: headers.ip_address.clone(),
            user_agent: headers.user_agent.clone(),
            javascript_enabled: true,
            language: details.browser_language.clone(),
            time_zone: details.time_zone_offset,
            screen_height: details.screen_height,
            screen_width: details.screen_width,
            color_depth: details.color_depth,
        }
    }
}

/// `CardholderDetails` section of the authentication request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CardholderDetails {
    /// Cardholder name.
    pub name: String,
    /// Cardholder email.
    pub email_address: String,
}

/// `CardDetails` section of the authentication request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CardDetails {
    /// The PAN token standing in for the card number.
    pub number: String,
    /// Card expiry as `YYMM`.
    pub card_expiry_date: String,
    /// 1 = not applicable, 2 = credit, 3 = debit.
    pub account_type: u8,
}

/// `MerchantDetails` section of the authentication request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MerchantDetails {
    /// Merchant identifier assigned by the acquirer.
    pub acquirer_merchant_id: String,
    /// Merchant category code.
    pub category_code: String,
    /// ISO 3166 numeric country code.
    pub country_code: String,
    /// Merchant name.
    pub name: String,
}

/// `PurchaseDetails` section of the authentication request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct PurchaseDetails {
    /// Amount in minor units.
    pub amount: u64,
    /// ISO 4217 numeric currency code.
    pub currency: String,
    /// Decimal exponent of the currency.
    pub exponent: u8,
    /// Purchase time as `yyyyMMddHHmmss`.
    pub date: String,
}

impl PurchaseDetails {
    /// Stamps `amount` with the purchase time.
    #[must_use]
    pub fn new(amount: &PurchaseAmount, date: String) -> Self {
        Self {
            amount: amount.amount,
            currency: amount.currency.clone(),
            exponent: amount.exponent,
            date,
        }
    }
}

/// Body of the authentication request: the projection of one transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct AuthenticationRequest {
    /// Correlation key from the version check.
    pub server_transaction_id: String,
    /// 1 = fingerprinting completed, 2 = it did not.
    pub method_completion_indicator: u8,
    /// Message version from the version check.
    pub message_version: String,
    /// Browser attributes.
    pub browser_info: BrowserInfo,
    /// BIN of the merchant's acquiring institution.
    pub acquirer_bin: String,
    /// Cardholder attributes.
    pub cardholder_details: CardholderDetails,
    /// Card attributes.
    pub card_details: CardDetails,
    /// 5 = full screen.
    pub challenge_window_size: u8,
    /// 2 = browser.
    pub device_channel: u8,
    /// Directory server from the version check.
    pub directory_server_identifier: String,
    /// Asks the ACS to return the challenge request when it challenges.
    pub generate_challenge_request: bool,
    /// Merchant attributes.
    pub merchant_details: MerchantDetails,
    /// Payment or non-payment.
    pub message_category: MessageCategory,
    /// Where the ACS posts the challenge result.
    pub notification_url: String,
    /// 1 = payment transaction.
    pub authentication_indicator: u8,
    /// Purchase attributes.
    pub purchase_details: PurchaseDetails,
    /// 1 = goods and services.
    pub transaction_type: u8,
}

/// Authentication outcome as reported by the ACS.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreeDSecureResult {
    /// `Y`, `N`, `U`, `A`, `C`, `R`...
    #[serde(default)]
    pub trans_status: String,
    /// Electronic commerce indicator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eci: Option<String>,
    /// Cryptogram proving the authentication.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication_value: Option<String>,
    /// ACS transaction identifier.
    #[serde(rename = "acsTransID", default, skip_serializing_if = "Option::is_none")]
    pub acs_trans_id: Option<String>,
    /// Server transaction identifier echoed back.
    #[serde(
        rename = "threeDSServerTransID",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub server_transaction_id: Option<String>,
    /// Protocol error code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    /// Protocol error detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    /// Where the browser posts the challenge request.
    #[serde(rename = "acsURL", default, skip_serializing_if = "Option::is_none")]
    pub acs_url: Option<String>,
    /// Base64 encoded challenge request.
    #[serde(rename = "encodedCReq", default, skip_serializing_if = "Option::is_none")]
    pub encoded_creq: Option<String>,
}

/// Response of the authentication and challenge-result endpoints.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticationResponse {
    /// The ACS verdict.
    #[serde(rename = "threeDSecureResponse")]
    pub result: ThreeDSecureResult,
}

impl AuthenticationResponse {
    /// Whether the ACS asks for an interactive challenge.
    #[must_use]
    pub fn requires_challenge(&self) -> bool {
        self.result.trans_status == CHALLENGE_TRANS_STATUS
    }
}

/// Body of the challenge-result request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeResultsRequest {
    /// Correlation key of the challenged transaction.
    #[serde(rename = "ServerTransactionId")]
    pub server_transaction_id: String,
}

/// Form body the ACS posts once device fingerprinting finished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodNotification {
    /// Base64 encoded JSON carrying the transaction identifier.
    #[serde(rename = "threeDSMethodData")]
    pub method_data: String,
}

/// Form body the ACS posts once the challenge finished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeNotification {
    /// Base64 encoded challenge response.
    pub cres: String,
}

/// Payload the browser posts to the 3DS method URL, before base64 encoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodData {
    /// Where the ACS posts the method notification.
    #[serde(rename = "threeDSMethodNotificationURL")]
    pub notification_url: String,
    /// Correlation key of the transaction.
    #[serde(rename = "threeDSServerTransID")]
    pub server_transaction_id: String,
}
