//! Outbound transaction seam
//!
//! Signing and submission live outside this service. The coordination engine only
//! decides that an action is due and hands it to a [`TransactionSubmitter`], which
//! returns once the transaction is mined.

use crate::error::{ResolverError, ResolverResult};
use crate::ledger::{Side, SwapRecord};
use crate::vault::hex_of;

use async_trait::async_trait;
use ethers::types::{Address, H256, U256};
use serde::Serialize;
use tracing::info;

/// Mined transaction for a submitted action
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmissionReceipt {
    pub chain_id: u64,
    pub tx_hash: H256,
    pub block_number: u64,
    pub gas_used: U256,
    /// Escrow deployed by the transaction, if any
    pub escrow: Option<Address>,
}

/// Sends due actions on behalf of the resolver
///
/// Errors follow [`ResolverError::is_retryable`]: transport trouble is retried on a
/// later scan, while a revert or [`ResolverError::InsufficientBalance`] fails the swap.
/// [`ResolverError::SubmissionDisabled`] means nothing was sent.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TransactionSubmitter: Send + Sync {
    /// Deploy and fund the destination escrow for a swap whose source side is funded
    async fn create_dst_escrow(&self, swap: &SwapRecord) -> ResolverResult<SubmissionReceipt>;

    /// Publish the secret on the destination chain
    async fn reveal_secret(&self, swap: &SwapRecord, secret: H256)
        -> ResolverResult<SubmissionReceipt>;

    /// Withdraw one side's escrow with the secret
    async fn withdraw(
        &self,
        swap: &SwapRecord,
        side: Side,
        secret: H256,
    ) -> ResolverResult<SubmissionReceipt>;
}

/// Submitter used when no signer is configured
///
/// Logs what would be sent and reports a retryable error, so due swaps stay untouched
/// and are offered again on the next scan.
#[derive(Debug, Default)]
pub struct DryRunSubmitter;

impl DryRunSubmitter {
    fn refuse(&self, action: &str, chain_id: u64, swap: &SwapRecord) -> ResolverError {
        info!(
            "Dry run: would {} on chain {} for swap {}",
            action,
            chain_id,
            hex_of(&swap.order_hash)
        );
        ResolverError::SubmissionDisabled(format!("{} on chain {}", action, chain_id))
    }
}

#[async_trait]
impl TransactionSubmitter for DryRunSubmitter {
    async fn create_dst_escrow(&self, swap: &SwapRecord) -> ResolverResult<SubmissionReceipt> {
        Err(self.refuse("create destination escrow", swap.dst.chain_id, swap))
    }

    async fn reveal_secret(
        &self,
        swap: &SwapRecord,
        _secret: H256,
    ) -> ResolverResult<SubmissionReceipt> {
        Err(self.refuse("reveal secret", swap.dst.chain_id, swap))
    }

    async fn withdraw(
        &self,
        swap: &SwapRecord,
        side: Side,
        _secret: H256,
    ) -> ResolverResult<SubmissionReceipt> {
        let chain_id = swap.side(side).chain_id;
        Err(self.refuse(&format!("withdraw {} escrow", side), chain_id, swap))
    }
}
