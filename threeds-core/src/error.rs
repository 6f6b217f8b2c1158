use thiserror::Error;

use crate::orchestrator::Phase;

/// Error outputs from `threeds-core`
#[derive(Debug, Error)]
pub enum ThreeDsError {
    /// The presented input is not valid for the requested operation
    #[error("invalid_input_{attribute}: {reason}")]
    InvalidInput {
        /// The attribute that is invalid
        attribute: String,
        /// The reason the input is invalid
        reason: String,
    },
    /// Unexpected error serializing or deserializing information
    #[error("serialization_error: {error}")]
    SerializationError {
        /// The error message from the serialization
        error: String,
    },
    /// Transport failure or non-success response from a protocol endpoint
    #[error("network_error at {url}: {error}")]
    NetworkError {
        /// The URL of the request
        url: String,
        /// The HTTP status code of the response, if any
        status: Option<u16>,
        /// The error message
        error: String,
    },
    /// An out-of-band notification could not be decoded
    #[error("malformed_notification: {reason}")]
    MalformedNotification {
        /// Why the payload was rejected
        reason: String,
    },
    /// No authentication in flight owns the transaction identifier
    #[error("unknown_transaction: {server_transaction_id}")]
    UnknownTransaction {
        /// The identifier that was looked up
        server_transaction_id: String,
    },
    /// The transaction is in a phase that does not admit the requested event
    #[error("invalid_transition: {event} is not allowed in phase {phase}")]
    InvalidTransition {
        /// The phase the transaction was in
        phase: Phase,
        /// The rejected event
        event: String,
    },
    /// Unexpected internal error
    #[error("unexpected_error: {error}")]
    Generic {
        /// The details of the error
        error: String,
    },
}
