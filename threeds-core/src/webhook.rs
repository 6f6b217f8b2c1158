//! Ingestion of out-of-band notifications posted by the ACS.
//!
//! Both notifications carry a base64 encoded JSON document with the server transaction
//! identifier in `threeDSServerTransID`. Ingestion only records the identifier; it has
//! no notion of which identifiers are expected, so unmatched ones simply expire.

use base64::{
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
    Engine as _,
};
use serde::Deserialize;
use tracing::{info, warn};

use crate::{
    error::ThreeDsError,
    models::{ChallengeNotification, MethodData, MethodNotification},
    store::{CorrelationStores, Milestone},
};

#[derive(Debug, Deserialize)]
struct NotificationEnvelope {
    #[serde(rename = "threeDSServerTransID", default)]
    server_transaction_id: Option<String>,
}

/// Extracts the server transaction identifier from a notification payload.
///
/// Standard base64 is tried first, then the URL-safe alphabet with or without padding,
/// which is what EMV 3DS access control servers emit. Spaces are read as `+`, since a
/// form body that was not percent-encoded turns `+` into a space.
///
/// # Errors
///
/// Returns [`ThreeDsError::MalformedNotification`] when the payload is empty, not
/// base64, not JSON or lacks the identifier.
pub fn decode_notification(payload: &str) -> Result<String, ThreeDsError> {
    let payload = payload.trim().replace(' ', "+");
    if payload.is_empty() {
        return Err(malformed("empty payload"));
    }

    let bytes = STANDARD
        .decode(&payload)
        .or_else(|_| URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')))
        .map_err(|e| malformed(&format!("payload is not base64: {e}")))?;

    let envelope: NotificationEnvelope = serde_json::from_slice(&bytes)
        .map_err(|e| malformed(&format!("payload is not a json object: {e}")))?;

    envelope
        .server_transaction_id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .ok_or_else(|| malformed("missing threeDSServerTransID"))
}

/// Encodes the method data the browser posts to the 3DS method URL.
///
/// # Errors
///
/// Returns [`ThreeDsError::SerializationError`] if the data cannot be serialized.
pub fn encode_method_data(data: &MethodData) -> Result<String, ThreeDsError> {
    let json = serde_json::to_vec(data).map_err(|e| ThreeDsError::SerializationError {
        error: format!("critical unexpected error serializing method data: {e}"),
    })?;
    Ok(STANDARD.encode(json))
}

fn malformed(reason: &str) -> ThreeDsError {
    ThreeDsError::MalformedNotification {
        reason: reason.to_string(),
    }
}

/// Writes notified transaction identifiers into the matching correlation store.
#[derive(Debug, Clone)]
pub struct WebhookIngestion {
    stores: CorrelationStores,
}

impl WebhookIngestion {
    /// Creates an ingestion path writing into `stores`.
    #[must_use]
    pub const fn new(stores: CorrelationStores) -> Self {
        Self { stores }
    }

    /// Decodes `payload` and records its identifier for `milestone`.
    ///
    /// Recording an identifier twice is a no-op. Returns the identifier.
    ///
    /// # Errors
    ///
    /// Returns [`ThreeDsError::MalformedNotification`]; the notification is dropped and
    /// no store changes.
    pub fn notify(&self, milestone: Milestone, payload: &str) -> Result<String, ThreeDsError> {
        let server_transaction_id = decode_notification(payload).inspect_err(|err| {
            warn!(%milestone, %err, "dropping malformed notification");
        })?;
        let added = self.stores.get(milestone).add(&server_transaction_id);
        info!(
            %milestone,
            server_transaction_id = %server_transaction_id,
            duplicate = !added,
            "notification received"
        );
        Ok(server_transaction_id)
    }

    /// Handles the ACS notification that device fingerprinting finished.
    ///
    /// # Errors
    ///
    /// See [`WebhookIngestion::notify`].
    pub fn fingerprint_completed(
        &self,
        notification: &MethodNotification,
    ) -> Result<String, ThreeDsError> {
        self.notify(Milestone::Fingerprint, &notification.method_data)
    }

    /// Handles the ACS notification that the challenge finished.
    ///
    /// # Errors
    ///
    /// See [`WebhookIngestion::notify`].
    pub fn challenge_completed(
        &self,
        notification: &ChallengeNotification,
    ) -> Result<String, ThreeDsError> {
        self.notify(Milestone::Challenge, &notification.cres)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use test_case::test_case;

    use super::*;

    fn encode(value: &serde_json::Value) -> String {
        STANDARD.encode(value.to_string())
    }

    #[test]
    fn test_decode_standard_base64() {
        let payload = encode(&json!({
            "threeDSServerTransID": "8a880dc0-d2d2-4067-bcb1-b08d1690b26e",
            "threeDSMethodNotificationURL": "https://hooks.example.com"
        }));
        assert_eq!(
            decode_notification(&payload).unwrap(),
            "8a880dc0-d2d2-4067-bcb1-b08d1690b26e"
        );
    }

    #[test]
    fn test_decode_url_safe_unpadded() {
        let cres = json!({
            "threeDSServerTransID": "tx-1",
            "acsTransID": "acs-1",
            "messageType": "CRes",
            "transStatus": "Y"
        });
        let payload = URL_SAFE_NO_PAD.encode(cres.to_string());
        assert_eq!(decode_notification(&payload).unwrap(), "tx-1");
    }

    #[test]
    fn test_encode_method_data_round_trips_through_decoder() {
        let data = MethodData {
            notification_url: "https://hooks.example.com/deviceFingerprintNotification".to_string(),
            server_transaction_id: "tx-7".to_string(),
        };
        let encoded = encode_method_data(&data).unwrap();
        assert_eq!(decode_notification(&encoded).unwrap(), "tx-7");
    }

    #[test_case("" ; "empty")]
    #[test_case("!!!not-base64!!!" ; "not base64")]
    #[test_case("bm90IGpzb24" ; "base64 but not json")]
    #[test_case("eyJvdGhlciI6MX0=" ; "json without identifier")]
    #[test_case("eyJ0aHJlZURTU2VydmVyVHJhbnNJRCI6IiJ9" ; "blank identifier")]
    fn test_decode_rejects_malformed(payload: &str) {
        assert!(matches!(
            decode_notification(payload),
            Err(ThreeDsError::MalformedNotification { .. })
        ));
    }

    #[test]
    fn test_notify_twice_keeps_one_record() {
        let stores = CorrelationStores::new();
        let ingestion = WebhookIngestion::new(stores.clone());
        let payload = encode(&json!({ "threeDSServerTransID": "tx-1" }));

        ingestion.notify(Milestone::Challenge, &payload).unwrap();
        ingestion.notify(Milestone::Challenge, &payload).unwrap();

        assert_eq!(stores.challenge.all(), vec!["tx-1"]);
        assert!(stores.fingerprint.is_empty());
    }

    #[test]
    fn test_malformed_notification_changes_nothing() {
        let stores = CorrelationStores::new();
        let ingestion = WebhookIngestion::new(stores.clone());

        let result = ingestion.fingerprint_completed(&MethodNotification {
            method_data: "garbage".to_string(),
        });

        assert!(result.is_err());
        assert!(stores.fingerprint.is_empty());
    }
}
