//! Swap ledger
//!
//! One durable [`SwapRecord`] per order hash, driven through the [`SwapStatus`] state
//! machine. Every read-modify-write of a record happens under that record's key lock,
//! so concurrent updates to one swap never lose each other's fields.
//!
//! Layout in the key-value store:
//! - `swap:<order hash>` - the record
//! - `swap_hashlock:<hashlock>` - order hash owning that hashlock

mod record;

pub use record::{SidePatch, Side, SwapPatch, SwapRecord, SwapSide, SwapStatus};

use crate::error::{ResolverError, ResolverResult};
use crate::store::{self, KeyedLocks, KvStore};
use crate::vault::hex_of;

use chrono::{DateTime, Duration, Utc};
use ethers::types::H256;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const SWAP_PREFIX: &str = "swap:";
const HASHLOCK_INDEX_PREFIX: &str = "swap_hashlock:";

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LedgerStats {
    pub total: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub expired: u64,
    /// completed / total, zero for an empty ledger
    pub success_rate: f64,
    pub by_status: BTreeMap<String, u64>,
}

/// How an update treats the requested status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// The requested status must be reachable from the current one
    Strict,
    /// Move forward if the requested status is ahead, otherwise only merge the patch
    Forward,
}

pub struct SwapLedger {
    store: Arc<dyn KvStore>,
    locks: KeyedLocks,
}

impl SwapLedger {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            locks: KeyedLocks::new(),
        }
    }

    /// Create a record in `CREATED` unless one exists
    ///
    /// An existing record is returned unchanged, whatever its progress.
    pub async fn track(&self, order_hash: H256, initial: SwapPatch) -> ResolverResult<SwapRecord> {
        let key = swap_key(&order_hash);
        let _guard = self.locks.lock(&key).await;

        if let Some(existing) = self.get(&order_hash).await? {
            debug!(
                "Swap {} already tracked in {}",
                hex_of(&order_hash),
                existing.status
            );
            return Ok(existing);
        }

        let mut record = SwapRecord::new(order_hash, Utc::now());
        record.merge(&initial).map_err(ResolverError::InvariantViolation)?;
        self.write(&record, None).await?;
        crate::metrics::record_swap_transition(record.status);

        info!("Tracking swap {}", hex_of(&order_hash));
        Ok(record)
    }

    pub async fn get(&self, order_hash: &H256) -> ResolverResult<Option<SwapRecord>> {
        store::load_json(self.store.as_ref(), &swap_key(order_hash)).await
    }

    pub async fn get_by_hashlock(&self, hashlock: &H256) -> ResolverResult<Option<SwapRecord>> {
        let order_hash: Option<H256> =
            store::load_json(self.store.as_ref(), &hashlock_key(hashlock)).await?;
        match order_hash {
            Some(order_hash) => self.get(&order_hash).await,
            None => Ok(None),
        }
    }

    /// Merge `patch` and move the swap to `status`
    ///
    /// A status the state machine does not allow from the current one is rejected and
    /// the record is left as it was. Updating an unknown order is logged and returns
    /// `Ok(None)`, since events may arrive before the order is tracked.
    pub async fn update_status(
        &self,
        order_hash: &H256,
        status: SwapStatus,
        patch: SwapPatch,
    ) -> ResolverResult<Option<SwapRecord>> {
        self.apply(order_hash, status, patch, Mode::Strict).await
    }

    /// Merge `patch` and move the swap forward to `status` if it is behind
    ///
    /// Used for facts observed on chain, which may arrive out of order: the data is
    /// always merged, the status never regresses. Terminal records are not touched.
    pub async fn advance(
        &self,
        order_hash: &H256,
        status: SwapStatus,
        patch: SwapPatch,
    ) -> ResolverResult<Option<SwapRecord>> {
        self.apply(order_hash, status, patch, Mode::Forward).await
    }

    /// Record a failed attempt at the swap's next action
    ///
    /// Retryable failures only bump `retry_count` and `last_error`; anything else
    /// fails the swap.
    pub async fn record_failure(
        &self,
        order_hash: &H256,
        reason: &str,
        retryable: bool,
    ) -> ResolverResult<Option<SwapRecord>> {
        let key = swap_key(order_hash);
        let _guard = self.locks.lock(&key).await;

        let Some(current) = self.get(order_hash).await? else {
            warn!("Failure reported for unknown swap {}", hex_of(order_hash));
            return Ok(None);
        };
        if current.status.is_terminal() {
            return Ok(Some(current));
        }

        let mut next = current.clone();
        next.last_error = Some(reason.to_string());
        if retryable {
            next.retry_count += 1;
        } else {
            next.status = SwapStatus::Failed;
        }
        next.last_update_at = Utc::now();
        self.write(&next, Some(&current)).await?;

        if next.status != current.status {
            crate::metrics::record_swap_transition(next.status);
            warn!("Swap {} failed: {}", hex_of(order_hash), reason);
        } else {
            debug!(
                "Swap {} attempt {} failed: {}",
                hex_of(order_hash),
                next.retry_count,
                reason
            );
        }
        Ok(Some(next))
    }

    /// Attach an operator-facing error without touching the status
    pub async fn annotate(
        &self,
        order_hash: &H256,
        message: &str,
    ) -> ResolverResult<Option<SwapRecord>> {
        let key = swap_key(order_hash);
        let _guard = self.locks.lock(&key).await;

        let Some(current) = self.get(order_hash).await? else {
            return Ok(None);
        };
        let mut next = current.clone();
        next.last_error = Some(message.to_string());
        next.last_update_at = Utc::now();
        self.write(&next, Some(&current)).await?;
        Ok(Some(next))
    }

    async fn apply(
        &self,
        order_hash: &H256,
        requested: SwapStatus,
        patch: SwapPatch,
        mode: Mode,
    ) -> ResolverResult<Option<SwapRecord>> {
        let key = swap_key(order_hash);
        let _guard = self.locks.lock(&key).await;

        let Some(current) = self.get(order_hash).await? else {
            info!(
                "Swap {} not tracked, ignoring update to {}",
                hex_of(order_hash),
                requested
            );
            return Ok(None);
        };

        if current.status.is_terminal() {
            if mode == Mode::Strict && requested != current.status {
                error!(
                    "Refusing {} for swap {} already {}",
                    requested,
                    hex_of(order_hash),
                    current.status
                );
                return Err(ResolverError::InvalidStateTransition {
                    from: current.status.to_string(),
                    to: requested.to_string(),
                });
            }
            debug!(
                "Swap {} is {}, ignoring {}",
                hex_of(order_hash),
                current.status,
                requested
            );
            return Ok(Some(current));
        }

        let target = if current.status.can_transition_to(requested) {
            requested
        } else if mode == Mode::Forward {
            current.status
        } else {
            error!(
                "Refusing transition {} -> {} for swap {}",
                current.status,
                requested,
                hex_of(order_hash)
            );
            return Err(ResolverError::InvalidStateTransition {
                from: current.status.to_string(),
                to: requested.to_string(),
            });
        };

        let mut next = current.clone();
        if let Err(conflict) = next.merge(&patch) {
            error!("Swap {} left untouched: {}", hex_of(order_hash), conflict);
            crate::metrics::record_invariant_violation("swap_patch_conflict");
            return Err(ResolverError::InvariantViolation(format!(
                "swap {}: {}",
                hex_of(order_hash),
                conflict
            )));
        }

        let now = Utc::now();
        next.status = target;
        if next.both_withdrawn() {
            next.status = SwapStatus::Completed;
            next.completed_at.get_or_insert(now);
        } else if target == SwapStatus::Completed {
            error!(
                "Swap {} cannot complete before both sides withdrew",
                hex_of(order_hash)
            );
            return Err(ResolverError::InvalidStateTransition {
                from: current.status.to_string(),
                to: target.to_string(),
            });
        }

        if next == current {
            return Ok(Some(current));
        }
        next.last_update_at = now;
        self.write(&next, Some(&current)).await?;

        if next.status != current.status {
            crate::metrics::record_swap_transition(next.status);
            info!(
                "Swap {} {} -> {}",
                hex_of(order_hash),
                current.status,
                next.status
            );
        }
        Ok(Some(next))
    }

    /// Persist the record, then its hashlock index when the hashlock became known
    ///
    /// A hashlock indexed for another tracked order is refused before anything is
    /// written. The index lock is always taken after the record's own lock.
    async fn write(
        &self,
        record: &SwapRecord,
        previous: Option<&SwapRecord>,
    ) -> ResolverResult<()> {
        let hashlock_changed = previous.map_or(true, |p| p.hashlock != record.hashlock);
        let claims_hashlock = !record.hashlock.is_zero() && hashlock_changed;

        let _index_guard = if claims_hashlock {
            let guard = self.locks.lock(&hashlock_key(&record.hashlock)).await;
            self.check_hashlock_owner(record).await?;
            Some(guard)
        } else {
            None
        };

        store::save_json(self.store.as_ref(), &swap_key(&record.order_hash), record).await?;
        if claims_hashlock {
            store::save_json(
                self.store.as_ref(),
                &hashlock_key(&record.hashlock),
                &record.order_hash,
            )
            .await?;
        }
        Ok(())
    }

    /// Fails when the record's hashlock already belongs to a different tracked order
    async fn check_hashlock_owner(&self, record: &SwapRecord) -> ResolverResult<()> {
        let owner: Option<H256> =
            store::load_json(self.store.as_ref(), &hashlock_key(&record.hashlock)).await?;
        let Some(owner) = owner else {
            return Ok(());
        };
        if owner == record.order_hash {
            return Ok(());
        }
        if self.get(&owner).await?.is_none() {
            // index left behind by a removed record
            return Ok(());
        }

        error!(
            "Hashlock {} already belongs to swap {}, refusing it for swap {}",
            hex_of(&record.hashlock),
            hex_of(&owner),
            hex_of(&record.order_hash)
        );
        crate::metrics::record_invariant_violation("hashlock_already_indexed");
        Err(ResolverError::InvariantViolation(format!(
            "hashlock {} already belongs to swap {}",
            hex_of(&record.hashlock),
            hex_of(&owner)
        )))
    }

    async fn list_all(&self) -> ResolverResult<Vec<SwapRecord>> {
        store::list_json(self.store.as_ref(), SWAP_PREFIX).await
    }

    /// Every non-terminal swap
    pub async fn list_active(&self) -> ResolverResult<Vec<SwapRecord>> {
        Ok(self
            .list_all()
            .await?
            .into_iter()
            .filter(|r| !r.status.is_terminal())
            .collect())
    }

    pub async fn awaiting_destination_escrow(&self) -> ResolverResult<Vec<SwapRecord>> {
        self.filtered(SwapRecord::is_awaiting_destination_escrow).await
    }

    pub async fn awaiting_secret_reveal(&self) -> ResolverResult<Vec<SwapRecord>> {
        self.filtered(SwapRecord::is_awaiting_secret_reveal).await
    }

    pub async fn awaiting_withdrawal(&self) -> ResolverResult<Vec<SwapRecord>> {
        self.filtered(SwapRecord::is_awaiting_withdrawal).await
    }

    async fn filtered(
        &self,
        predicate: fn(&SwapRecord) -> bool,
    ) -> ResolverResult<Vec<SwapRecord>> {
        Ok(self.list_all().await?.into_iter().filter(predicate).collect())
    }

    /// Sweep non-terminal swaps older than `timeout_secs` into `EXPIRED`
    pub async fn check_expired(&self, timeout_secs: u64) -> ResolverResult<Vec<SwapRecord>> {
        self.check_expired_at(Utc::now(), timeout_secs).await
    }

    pub async fn check_expired_at(
        &self,
        now: DateTime<Utc>,
        timeout_secs: u64,
    ) -> ResolverResult<Vec<SwapRecord>> {
        let cutoff = now - Duration::seconds(timeout_secs as i64);
        let mut expired = Vec::new();

        for candidate in self.list_active().await? {
            if candidate.created_at >= cutoff {
                continue;
            }

            let key = swap_key(&candidate.order_hash);
            let _guard = self.locks.lock(&key).await;

            // re-read under the lock, the swap may have moved on since the listing
            let Some(current) = self.get(&candidate.order_hash).await? else {
                continue;
            };
            if current.status.is_terminal() {
                continue;
            }

            let mut next = current.clone();
            next.status = SwapStatus::Expired;
            next.last_error = Some(format!(
                "swap expired after {}s without completing (last status {})",
                timeout_secs, current.status
            ));
            next.last_update_at = now;
            self.write(&next, Some(&current)).await?;
            crate::metrics::record_swap_transition(SwapStatus::Expired);

            warn!(
                "Swap {} expired in {}",
                hex_of(&current.order_hash),
                current.status
            );
            expired.push(next);
        }

        Ok(expired)
    }

    pub async fn statistics(&self) -> ResolverResult<LedgerStats> {
        let mut stats = LedgerStats::default();
        for record in self.list_all().await? {
            stats.total += 1;
            match record.status {
                SwapStatus::Completed => stats.completed += 1,
                SwapStatus::Failed => stats.failed += 1,
                SwapStatus::Expired => stats.expired += 1,
                _ => stats.active += 1,
            }
            *stats
                .by_status
                .entry(record.status.as_str().to_string())
                .or_default() += 1;
        }
        if stats.total > 0 {
            stats.success_rate = stats.completed as f64 / stats.total as f64;
        }
        Ok(stats)
    }

    /// Delete completed swaps older than the retention window
    pub async fn cleanup_old(&self, retention_days: u64) -> ResolverResult<usize> {
        self.cleanup_old_at(Utc::now(), retention_days).await
    }

    pub async fn cleanup_old_at(
        &self,
        now: DateTime<Utc>,
        retention_days: u64,
    ) -> ResolverResult<usize> {
        let cutoff = now - Duration::days(retention_days as i64);
        let mut removed = 0;

        for record in self.list_all().await? {
            let expired = record.status == SwapStatus::Completed
                && record.completed_at.map_or(false, |at| at < cutoff);
            if !expired {
                continue;
            }

            let key = swap_key(&record.order_hash);
            let _guard = self.locks.lock(&key).await;

            if !record.hashlock.is_zero() {
                let _index_guard = self.locks.lock(&hashlock_key(&record.hashlock)).await;
                let owner: Option<H256> =
                    store::load_json(self.store.as_ref(), &hashlock_key(&record.hashlock)).await?;
                if owner == Some(record.order_hash) {
                    self.store.delete(&hashlock_key(&record.hashlock)).await?;
                }
            }
            if self.store.delete(&key).await? {
                removed += 1;
            }
        }

        if removed > 0 {
            info!("Removed {} completed swaps past retention", removed);
        }
        self.locks.prune();
        Ok(removed)
    }
}

fn swap_key(order_hash: &H256) -> String {
    format!("{}{}", SWAP_PREFIX, hex_of(order_hash))
}

fn hashlock_key(hashlock: &H256) -> String {
    format!("{}{}", HASHLOCK_INDEX_PREFIX, hex_of(hashlock))
}
