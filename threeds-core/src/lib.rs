#![deny(clippy::all, clippy::pedantic, clippy::nursery)]
//! Orchestration core for EMV 3-D Secure cardholder authentication.
//!
//! An authentication runs through version discovery, optional device fingerprinting,
//! risk-based authentication and an optional interactive challenge. Two of those steps
//! complete out-of-band: the access control server calls back on a webhook while the
//! browser can only poll. The server transaction identifier returned by the version check
//! is the sole key correlating the two channels.
//!
//! The building blocks, leaves first:
//!
//! - [`store::CorrelationStore`] records identifiers that reached a milestone.
//! - [`polling::PollingGate`] waits for an identifier to show up in a store.
//! - [`orchestrator::Orchestrator`] drives the phase state machine.
//! - [`webhook::WebhookIngestion`] decodes notifications and fills the stores.
use strum::{Display, EnumString};

/// The vendor environment the protocol endpoints are served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, Display)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Environment {
    /// Vendor test environment. Only test cards are accepted.
    Staging,
    /// Live environment.
    Production,
}

impl Environment {
    /// Base URL of the vendor API for this environment.
    #[must_use]
    pub const fn base_url(self) -> &'static str {
        match self {
            Self::Staging => "https://test-api.tokenex.com",
            Self::Production => "https://api.tokenex.com",
        }
    }
}

mod error;
pub use error::*;

pub mod client;
pub mod config;
pub mod logger;
pub mod models;
pub mod orchestrator;
pub mod polling;
pub mod store;
pub mod webhook;

// private modules
mod http_request;

pub use client::{ProtocolClient, TokenExClient};
pub use config::ThreeDsConfig;
pub use orchestrator::{AuthenticationStatus, Orchestrator, Phase, TransactionContext};
pub use polling::{PollOutcome, PollPolicy, PollingGate};
pub use store::{CorrelationStore, CorrelationStores, Milestone};
pub use webhook::WebhookIngestion;
