//! Error types for the Bridge-Me-Not resolver

use crate::codec::CodecError;

use thiserror::Error;

/// Main error type for the resolver
#[derive(Error, Debug)]
pub enum ResolverError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Chain connection error for chain {chain_id}: {message}")]
    ChainConnection { chain_id: u64, message: String },

    #[error("Subscription dropped on chain {chain_id}: {message}")]
    Subscription { chain_id: u64, message: String },

    #[error("Extension decode error: {0}")]
    Decode(#[from] CodecError),

    #[error("Event parsing error: {0}")]
    EventParsing(String),

    #[error("Transaction reverted on chain {chain_id}: {reason}")]
    Reverted { chain_id: u64, reason: String },

    #[error("Transaction submission is disabled: {0}")]
    SubmissionDisabled(String),

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Chain {chain_id} not found")]
    ChainNotFound { chain_id: u64 },

    #[error("Swap {order_hash} not found")]
    SwapNotFound { order_hash: String },

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Reported by a [`crate::tx::TransactionSubmitter`] whose signer cannot fund an action
    #[error("Insufficient balance on chain {chain_id}: have {have}, need {need}")]
    InsufficientBalance {
        chain_id: u64,
        have: String,
        need: String,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ResolverError {
    /// Check if error is transient infrastructure trouble that should be retried
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ResolverError::ChainConnection { .. }
                | ResolverError::Subscription { .. }
                | ResolverError::StoreUnavailable(_)
                | ResolverError::Database(_)
                | ResolverError::Timeout { .. }
                | ResolverError::SubmissionDisabled(_)
        )
    }

    /// Check if error should trigger an alert
    pub fn should_alert(&self) -> bool {
        matches!(
            self,
            ResolverError::InsufficientBalance { .. } | ResolverError::InvariantViolation(_)
        )
    }
}

/// Result type for resolver operations
pub type ResolverResult<T> = Result<T, ResolverError>;
