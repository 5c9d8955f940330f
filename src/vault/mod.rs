//! Secret vault
//!
//! Durable map from hashlock to the pre-image that unlocks both escrows. This is the
//! only place a secret is persisted before it is revealed on chain.
//!
//! Layout in the key-value store:
//! - `secret:<hashlock>` - the [`SecretRecord`]
//! - `secret_order:<order hash>` - the hashlock recorded for that order
//!
//! The primary record is always written before the index, so an index entry never
//! points at a missing record.

use crate::error::{ResolverError, ResolverResult};
use crate::store::{self, KeyedLocks, KvStore};

use chrono::{DateTime, Utc};
use ethers::types::{Address, H256, U256};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const SECRET_PREFIX: &str = "secret:";
const ORDER_INDEX_PREFIX: &str = "secret_order:";

/// Hashlock committing to `secret`
pub fn hashlock_of(secret: &H256) -> H256 {
    H256::from_slice(&Keccak256::digest(secret.as_bytes()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecretStatus {
    Pending,
    Confirmed,
    Failed,
}

impl fmt::Display for SecretStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SecretStatus::Pending => "pending",
            SecretStatus::Confirmed => "confirmed",
            SecretStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Status changes the vault knows how to apply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretTransition {
    /// Reveal transaction mined
    Confirm,
    /// Reveal abandoned before it was mined
    Fail,
    /// A mined reveal was dropped by a chain reorganisation
    ReorgCorrection,
}

impl SecretTransition {
    /// Transition table. `None` means the move is not allowed.
    pub fn apply(self, from: SecretStatus) -> Option<SecretStatus> {
        match (self, from) {
            (SecretTransition::Confirm, SecretStatus::Pending) => Some(SecretStatus::Confirmed),
            (SecretTransition::Fail, SecretStatus::Pending) => Some(SecretStatus::Failed),
            (SecretTransition::ReorgCorrection, SecretStatus::Confirmed) => {
                Some(SecretStatus::Failed)
            }
            _ => None,
        }
    }

    fn target(self) -> SecretStatus {
        match self {
            SecretTransition::Confirm => SecretStatus::Confirmed,
            SecretTransition::Fail | SecretTransition::ReorgCorrection => SecretStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretRecord {
    pub hashlock: H256,
    pub secret: H256,
    pub order_hash: H256,
    pub escrow_address: Address,
    pub chain_id: u64,
    pub revealed_at: DateTime<Utc>,
    pub status: SecretStatus,
    pub tx_hash: Option<H256>,
    pub gas_used: Option<U256>,
    pub failure_reason: Option<String>,
    /// Set when a confirmed reveal was later rolled back by a reorg
    #[serde(default)]
    pub reorged: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SecretStats {
    pub total: u64,
    pub pending: u64,
    pub confirmed: u64,
    pub failed: u64,
}

/// Durable hashlock -> secret store
pub struct SecretVault {
    store: Arc<dyn KvStore>,
    locks: KeyedLocks,
}

impl SecretVault {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            locks: KeyedLocks::new(),
        }
    }

    /// Persist `secret` for an order
    ///
    /// Re-storing a known secret leaves its record untouched and only adds the order
    /// index entry. An order already bound to a different hashlock is rejected.
    ///
    /// Locks are taken order first, then hashlock.
    pub async fn store(
        &self,
        secret: H256,
        order_hash: H256,
        escrow_address: Address,
        chain_id: u64,
    ) -> ResolverResult<SecretRecord> {
        let hashlock = hashlock_of(&secret);
        let _order_guard = self.locks.lock(&order_key(&order_hash)).await;
        let _guard = self.locks.lock(&secret_key(&hashlock)).await;

        if let Some(indexed) = self.indexed_hashlock(&order_hash).await? {
            if indexed != hashlock {
                error!(
                    "Order {} already bound to hashlock {}, refusing secret for {}",
                    hex_of(&order_hash),
                    hex_of(&indexed),
                    hex_of(&hashlock)
                );
                crate::metrics::record_invariant_violation("order_hashlock_mismatch");
                return Err(ResolverError::InvariantViolation(format!(
                    "order {} is bound to a different hashlock",
                    hex_of(&order_hash)
                )));
            }
        }

        let record = match self.get_by_hashlock(&hashlock).await? {
            Some(existing) => {
                debug!("Secret for hashlock {} already stored", hex_of(&hashlock));
                existing
            }
            None => {
                let record = SecretRecord {
                    hashlock,
                    secret,
                    order_hash,
                    escrow_address,
                    chain_id,
                    revealed_at: Utc::now(),
                    status: SecretStatus::Pending,
                    tx_hash: None,
                    gas_used: None,
                    failure_reason: None,
                    reorged: false,
                };
                store::save_json(self.store.as_ref(), &secret_key(&hashlock), &record).await?;
                crate::metrics::record_secret_transition(SecretStatus::Pending);
                info!(
                    "Stored secret for hashlock {} (order {}, chain {})",
                    hex_of(&hashlock),
                    hex_of(&order_hash),
                    chain_id
                );
                record
            }
        };

        store::save_json(self.store.as_ref(), &order_key(&order_hash), &hashlock).await?;
        Ok(record)
    }

    /// Absence is `Ok(None)`: the secret is simply not known yet
    pub async fn get_by_hashlock(&self, hashlock: &H256) -> ResolverResult<Option<SecretRecord>> {
        store::load_json(self.store.as_ref(), &secret_key(hashlock)).await
    }

    pub async fn get_by_order_hash(
        &self,
        order_hash: &H256,
    ) -> ResolverResult<Option<SecretRecord>> {
        match self.indexed_hashlock(order_hash).await? {
            Some(hashlock) => self.get_by_hashlock(&hashlock).await,
            None => Ok(None),
        }
    }

    /// Record the mined reveal transaction, `pending -> confirmed`
    ///
    /// An unknown hashlock is a warning, not an error: the reveal may be observed
    /// before this process learned the secret.
    pub async fn confirm(
        &self,
        hashlock: &H256,
        tx_hash: H256,
        gas_used: U256,
    ) -> ResolverResult<Option<SecretRecord>> {
        self.transition(hashlock, SecretTransition::Confirm, |record| {
            record.tx_hash = Some(tx_hash);
            record.gas_used = Some(gas_used);
        })
        .await
    }

    /// Abandon a reveal that never confirmed, `pending -> failed`
    ///
    /// A confirmed secret cannot be failed this way; a dropped reveal goes through
    /// [`SecretVault::correct_reorg`].
    pub async fn mark_failed(
        &self,
        hashlock: &H256,
        reason: &str,
    ) -> ResolverResult<Option<SecretRecord>> {
        self.transition(hashlock, SecretTransition::Fail, |record| {
            record.failure_reason = Some(reason.to_string());
        })
        .await
    }

    /// Roll a confirmed reveal back after a reorg, `confirmed -> failed`
    pub async fn correct_reorg(
        &self,
        hashlock: &H256,
        reason: &str,
    ) -> ResolverResult<Option<SecretRecord>> {
        self.transition(hashlock, SecretTransition::ReorgCorrection, |record| {
            record.failure_reason = Some(reason.to_string());
            record.reorged = true;
        })
        .await
    }

    async fn transition(
        &self,
        hashlock: &H256,
        transition: SecretTransition,
        patch: impl FnOnce(&mut SecretRecord),
    ) -> ResolverResult<Option<SecretRecord>> {
        let key = secret_key(hashlock);
        let _guard = self.locks.lock(&key).await;

        let Some(mut record) = self.get_by_hashlock(hashlock).await? else {
            warn!(
                "No secret stored for hashlock {}, ignoring {:?}",
                hex_of(hashlock),
                transition
            );
            return Ok(None);
        };

        if record.status == transition.target() && transition != SecretTransition::ReorgCorrection
        {
            debug!(
                "Secret {} already {}, {:?} is a no-op",
                hex_of(hashlock),
                record.status,
                transition
            );
            return Ok(Some(record));
        }

        let Some(next) = transition.apply(record.status) else {
            error!(
                "Refusing {:?} for secret {} in status {}",
                transition,
                hex_of(hashlock),
                record.status
            );
            return Err(ResolverError::InvalidStateTransition {
                from: record.status.to_string(),
                to: transition.target().to_string(),
            });
        };

        patch(&mut record);
        record.status = next;
        store::save_json(self.store.as_ref(), &key, &record).await?;
        crate::metrics::record_secret_transition(next);

        info!("Secret {} is now {}", hex_of(hashlock), next);
        Ok(Some(record))
    }

    /// Secrets whose reveal has not been confirmed on chain yet
    pub async fn list_pending(&self) -> ResolverResult<Vec<SecretRecord>> {
        Ok(self
            .list_all()
            .await?
            .into_iter()
            .filter(|r| r.status == SecretStatus::Pending)
            .collect())
    }

    pub async fn stats(&self) -> ResolverResult<SecretStats> {
        let mut stats = SecretStats::default();
        for record in self.list_all().await? {
            stats.total += 1;
            match record.status {
                SecretStatus::Pending => stats.pending += 1,
                SecretStatus::Confirmed => stats.confirmed += 1,
                SecretStatus::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }

    async fn list_all(&self) -> ResolverResult<Vec<SecretRecord>> {
        store::list_json(self.store.as_ref(), SECRET_PREFIX).await
    }

    async fn indexed_hashlock(&self, order_hash: &H256) -> ResolverResult<Option<H256>> {
        store::load_json(self.store.as_ref(), &order_key(order_hash)).await
    }
}

pub(crate) fn hex_of(hash: &H256) -> String {
    format!("0x{}", hex::encode(hash.as_bytes()))
}

fn secret_key(hashlock: &H256) -> String {
    format!("{}{}", SECRET_PREFIX, hex_of(hashlock))
}

fn order_key(order_hash: &H256) -> String {
    format!("{}{}", ORDER_INDEX_PREFIX, hex_of(order_hash))
}
