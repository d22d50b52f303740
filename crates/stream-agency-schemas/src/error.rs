//! Error kinds shared across the Stream Agency crates.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgencyError {
    /// Agent address absent; surfaced to the admin caller.
    #[error("agent not found: {0}")]
    NotFound(String),

    /// Malformed address, out-of-range fee, missing signature.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Epoch Oracle failed both endpoints.
    #[error("chain epoch unavailable: {0}")]
    EpochUnavailable(String),

    /// Non-success stream response that is not `already_streaming`.
    #[error("stream call failed: {0}")]
    StreamTransient(String),

    /// Non-zero exit from the settlement tool.
    #[error("settlement failed: {0}")]
    SettlementFailed(String),

    /// Billing requested without escrow/operator configuration.
    #[error("config missing: {0}")]
    ConfigMissing(String),

    /// Database open failures and other unrecoverable startup errors.
    #[error("fatal: {0}")]
    Fatal(String),
}
