//! Cashu wallet error types
//!
//! Typed error handling for better context preservation and error matching.

use cdk::Error as CdkError;
use std::fmt;

/// Cashu wallet error type
#[derive(Debug)]
pub enum CashuWalletError {
    // ==========================================================================
    // Mint Errors
    // ==========================================================================
    MintConnection { mint_url: String, message: String },
    /// The mint answered with data of the wrong shape (missing fields, bad types)
    MalformedResponse(String),

    // ==========================================================================
    // Token Errors
    // ==========================================================================
    InvalidToken { reason: String },
    TokenAlreadySpent,
    InsufficientFunds { available: u64, required: u64 },
    NoSpendableProofs,
    InvalidAmount { amount: u64 },

    // ==========================================================================
    // Quote Errors
    // ==========================================================================
    QuoteUnpaid { quote_id: String },
    QuoteFailed { message: String },

    // ==========================================================================
    // Nostr Errors
    // ==========================================================================
    NostrPublish(String),
    Encryption(String),
    Decryption(String),
    InvalidPubkey(String),

    // ==========================================================================
    // Storage Errors
    // ==========================================================================
    Storage(String),

    // ==========================================================================
    // CDK Errors
    // ==========================================================================
    Cdk(CdkError),

    // ==========================================================================
    // Internal Errors
    // ==========================================================================
    Internal(String),
    Cancelled,
}

impl fmt::Display for CashuWalletError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MintConnection { mint_url, message } => {
                write!(f, "Failed to connect to mint {}: {}", mint_url, message)
            }
            Self::MalformedResponse(msg) => write!(f, "Malformed mint response: {}", msg),

            Self::InvalidToken { reason } => write!(f, "Invalid token format: {}", reason),
            Self::TokenAlreadySpent => write!(f, "Token already spent"),
            Self::InsufficientFunds { available, required } => {
                write!(f, "Insufficient funds: available={}, required={}", available, required)
            }
            Self::NoSpendableProofs => write!(f, "No spendable proofs available"),
            Self::InvalidAmount { amount } => write!(f, "Invalid amount: {} sats", amount),

            Self::QuoteUnpaid { quote_id } => write!(f, "Quote unpaid: {}", quote_id),
            Self::QuoteFailed { message } => write!(f, "Quote failed: {}", message),

            Self::NostrPublish(msg) => write!(f, "Failed to publish Nostr event: {}", msg),
            Self::Encryption(msg) => write!(f, "Failed to encrypt content: {}", msg),
            Self::Decryption(msg) => write!(f, "Failed to decrypt content: {}", msg),
            Self::InvalidPubkey(msg) => write!(f, "Invalid pubkey format: {}", msg),

            Self::Storage(msg) => write!(f, "Storage error: {}", msg),

            Self::Cdk(err) => write!(f, "CDK error: {}", err),

            Self::Internal(msg) => write!(f, "Internal error: {}", msg),
            Self::Cancelled => write!(f, "Operation cancelled"),
        }
    }
}

impl std::error::Error for CashuWalletError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Cdk(err) => Some(err),
            _ => None,
        }
    }
}

impl From<CdkError> for CashuWalletError {
    fn from(err: CdkError) -> Self {
        let msg = err.to_string();
        if matches!(err, CdkError::TokenAlreadySpent) || is_token_spent_error_string(&msg) {
            return Self::TokenAlreadySpent;
        }
        if is_malformed_response_string(&msg) {
            return Self::MalformedResponse(msg);
        }
        Self::Cdk(err)
    }
}

impl From<serde_json::Error> for CashuWalletError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("JSON error: {}", err))
    }
}

/// Result type alias for cashu wallet operations
pub type CashuResult<T> = Result<T, CashuWalletError>;

impl CashuWalletError {
    /// Errors that stop invoice polling immediately instead of retrying
    ///
    /// Only shape/validation failures are fatal; "not paid yet", network
    /// blips and everything else keep the poll alive.
    pub fn is_fatal_for_polling(&self) -> bool {
        matches!(self, Self::MalformedResponse(_) | Self::Cancelled)
    }
}

/// Helper function to check if an error message indicates tokens are already spent
pub fn is_token_spent_error_string(error_msg: &str) -> bool {
    let msg = error_msg.to_lowercase();
    msg.contains("already spent")
        || msg.contains("already redeemed")
        || msg.contains("token pending")
}

/// Helper function to check if an error message describes a deserialization failure
///
/// Mints that return unexpected JSON surface through serde as "missing field",
/// "invalid type" and friends.
pub fn is_malformed_response_string(error_msg: &str) -> bool {
    let msg = error_msg.to_lowercase();
    msg.contains("missing field")
        || msg.contains("invalid type")
        || msg.contains("unknown variant")
        || msg.contains("invalid length")
        || msg.contains("expected value")
        || msg.contains("deserializ")
}

// =============================================================================
// Best-effort failures
// =============================================================================

/// A failure in a side call that must never block settlement
///
/// Auto-pay, fiat lookups and telemetry report through this so callers can
/// log and continue while tests can still observe the failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NonFatal {
    pub source: &'static str,
    pub message: String,
}

impl NonFatal {
    pub fn new(source: &'static str, message: impl Into<String>) -> Self {
        Self {
            source,
            message: message.into(),
        }
    }
}

impl fmt::Display for NonFatal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (non-fatal): {}", self.source, self.message)
    }
}

impl std::error::Error for NonFatal {}
