//! Reveal finality tracking for different L1/L2 networks
//!
//! Different chains have different finality models:
//! - Ethereum: Probabilistic (32 blocks for practical finality, ~6 min)
//! - Polygon: Probabilistic (128 blocks)
//! - Arbitrum / Optimism / Base: L1 finality, we use soft finality
//! - Avalanche: Instant finality (1 block)
//!
//! A reveal is final once it is still included, and succeeded, at the required depth.
//! A reveal whose receipt disappeared or reverted at that depth was dropped by a reorg.

use crate::chain::ChainClient;
use crate::error::ResolverResult;

use ethers::types::{H256, U64};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// A reveal transaction waiting for finality
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedReveal {
    pub tx_hash: H256,
    pub block_number: u64,
    pub hashlock: H256,
    pub order_hash: H256,
}

#[derive(Debug, Default)]
pub struct FinalityReport {
    pub finalized: Vec<TrackedReveal>,
    pub reorged: Vec<TrackedReveal>,
}

/// Tracks reveal transactions on a specific chain until they are final
pub struct FinalityTracker {
    chain_id: u64,
    /// Required confirmation blocks
    confirmation_blocks: u64,
    client: Arc<dyn ChainClient>,
    /// Pending reveals by transaction hash
    pending: RwLock<HashMap<H256, TrackedReveal>>,
}

impl FinalityTracker {
    pub fn new(chain_id: u64, confirmation_blocks: u64, client: Arc<dyn ChainClient>) -> Self {
        Self {
            chain_id,
            confirmation_blocks,
            client,
            pending: RwLock::new(HashMap::new()),
        }
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// Track a mined reveal until it reaches finality
    pub async fn track(&self, reveal: TrackedReveal) {
        debug!(
            "Tracking reveal {:?} for finality on chain {} (block {})",
            reveal.tx_hash, self.chain_id, reveal.block_number
        );
        self.pending.write().await.insert(reveal.tx_hash, reveal);
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.read().await.len()
    }

    /// Check every pending reveal that reached the confirmation depth
    ///
    /// Finalized and reorged reveals stop being tracked. A reveal re-included in a later
    /// block is kept and its depth counted again from the new block.
    pub async fn check_pending(&self) -> ResolverResult<FinalityReport> {
        let current_block = self.client.block_number().await?;
        let mut report = FinalityReport::default();

        let pending: Vec<TrackedReveal> = self.pending.read().await.values().cloned().collect();
        for mut reveal in pending {
            let confirmations = current_block.saturating_sub(reveal.block_number);
            if confirmations < self.confirmation_blocks {
                continue;
            }

            match self.client.transaction_receipt(reveal.tx_hash).await? {
                Some(receipt) if receipt.status == Some(U64::from(1)) => {
                    let included = receipt.block_number.map(|b| b.as_u64());
                    if included.map_or(false, |b| b != reveal.block_number) {
                        let moved_to = included.unwrap_or(reveal.block_number);
                        info!(
                            "Reveal {:?} on chain {} moved from block {} to {}",
                            reveal.tx_hash, self.chain_id, reveal.block_number, moved_to
                        );
                        reveal.block_number = moved_to;
                        self.pending.write().await.insert(reveal.tx_hash, reveal);
                        continue;
                    }

                    info!(
                        "Reveal {:?} finalized on chain {} ({} confirmations)",
                        reveal.tx_hash, self.chain_id, confirmations
                    );
                    self.pending.write().await.remove(&reveal.tx_hash);
                    report.finalized.push(reveal);
                }
                _ => {
                    warn!(
                        "Reorg detected: reveal {:?} no longer included on chain {}",
                        reveal.tx_hash, self.chain_id
                    );
                    crate::metrics::record_reorg(self.chain_id);
                    self.pending.write().await.remove(&reveal.tx_hash);
                    report.reorged.push(reveal);
                }
            }
        }

        Ok(report)
    }
}

/// Get recommended confirmation blocks for a chain
pub fn recommended_confirmations(chain_id: u64) -> u64 {
    match chain_id {
        // Ethereum mainnet
        1 => 32,
        // Ethereum testnets
        11155111 | 5 => 12,
        // Polygon mainnet
        137 => 128,
        // Polygon testnets
        80001 | 80002 => 32,
        // Arbitrum
        42161 | 421614 => 64,
        // Optimism
        10 | 11155420 => 64,
        // Base
        8453 | 84532 => 64,
        // Avalanche (instant finality)
        43114 | 43113 => 1,
        // Default conservative
        _ => 64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::fake::FakeChainClient;

    fn reveal(tx: u8, block: u64) -> TrackedReveal {
        TrackedReveal {
            tx_hash: H256::repeat_byte(tx),
            block_number: block,
            hashlock: H256::repeat_byte(0x11),
            order_hash: H256::repeat_byte(0xaa),
        }
    }

    #[tokio::test]
    async fn test_reveal_finalizes_at_depth() {
        let client = FakeChainClient::polling(1, 105);
        client.set_receipt(H256::repeat_byte(0x01), 100, true);
        let tracker = FinalityTracker::new(1, 12, client.clone());
        tracker.track(reveal(0x01, 100)).await;

        let report = tracker.check_pending().await.unwrap();
        assert!(report.finalized.is_empty());
        assert_eq!(tracker.pending_count().await, 1);

        client.set_head(112);
        let report = tracker.check_pending().await.unwrap();
        assert_eq!(report.finalized, vec![reveal(0x01, 100)]);
        assert!(report.reorged.is_empty());
        assert_eq!(tracker.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_missing_or_reverted_receipt_is_reorg() {
        let client = FakeChainClient::polling(1, 200);
        client.set_receipt(H256::repeat_byte(0x01), 100, true);
        client.set_receipt(H256::repeat_byte(0x02), 100, false);
        client.drop_receipt(&H256::repeat_byte(0x01));

        let tracker = FinalityTracker::new(1, 12, client.clone());
        tracker.track(reveal(0x01, 100)).await;
        tracker.track(reveal(0x02, 100)).await;

        let mut report = tracker.check_pending().await.unwrap();
        report.reorged.sort_by_key(|r| r.tx_hash);
        assert_eq!(report.reorged, vec![reveal(0x01, 100), reveal(0x02, 100)]);
        assert_eq!(tracker.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_reincluded_reveal_waits_again() {
        let client = FakeChainClient::polling(1, 120);
        client.set_receipt(H256::repeat_byte(0x01), 115, true);
        let tracker = FinalityTracker::new(1, 12, client.clone());
        tracker.track(reveal(0x01, 100)).await;

        let report = tracker.check_pending().await.unwrap();
        assert!(report.finalized.is_empty());
        assert!(report.reorged.is_empty());
        assert_eq!(tracker.pending_count().await, 1);

        client.set_head(127);
        let report = tracker.check_pending().await.unwrap();
        assert_eq!(report.finalized, vec![reveal(0x01, 115)]);
    }

    #[test]
    fn test_recommended_confirmations() {
        assert_eq!(recommended_confirmations(1), 32);
        assert_eq!(recommended_confirmations(11155111), 12);
        assert_eq!(recommended_confirmations(43114), 1);
        assert_eq!(recommended_confirmations(999_999), 64);
    }
}
