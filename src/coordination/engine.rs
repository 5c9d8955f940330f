//! Main coordination engine for cross-chain swap orchestration

use super::action::Action;
use crate::chain::{FinalityTracker, TrackedReveal};
use crate::codec;
use crate::config::ResolverConfig;
use crate::error::{ResolverError, ResolverResult};
use crate::events::{EventKey, EventMeta, SwapEvent, SwapEventKind};
use crate::ledger::{LedgerStats, SidePatch, SwapLedger, SwapPatch, SwapRecord, SwapStatus};
use crate::store::KeyedLocks;
use crate::tx::{SubmissionReceipt, TransactionSubmitter};
use crate::vault::{hashlock_of, hex_of, SecretRecord, SecretStats, SecretStatus, SecretVault};

use chrono::Utc;
use dashmap::DashMap;
use ethers::types::{Address, H256, U256};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// How long a delivered log is remembered for de-duplication
const DEDUP_TTL: Duration = Duration::from_secs(3_600);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanSummary {
    /// Actions found due by the ledger queries
    pub due: usize,
    /// Actions handed to the submitter
    pub dispatched: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub swaps: LedgerStats,
    pub secrets: SecretStats,
    pub remembered_events: usize,
}

/// Cross-chain coordination engine
///
/// The event loop applies watcher facts to the ledger and vault; the scanner finds
/// swaps whose next action is due and hands it to the submitter. A per-order in-flight
/// lock keeps one order from having two submissions running at once, however many
/// scans overlap.
pub struct CoordinationEngine {
    ledger: Arc<SwapLedger>,
    vault: Arc<SecretVault>,
    submitter: Arc<dyn TransactionSubmitter>,
    /// Finality trackers indexed by chain ID
    finality: HashMap<u64, Arc<FinalityTracker>>,
    config: ResolverConfig,
    /// Delivered logs and when they were first seen
    seen: DashMap<EventKey, Instant>,
    in_flight: KeyedLocks,
    shutdown: watch::Sender<bool>,
}

impl CoordinationEngine {
    pub fn new(
        ledger: Arc<SwapLedger>,
        vault: Arc<SecretVault>,
        submitter: Arc<dyn TransactionSubmitter>,
        finality: HashMap<u64, Arc<FinalityTracker>>,
        config: ResolverConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            ledger,
            vault,
            submitter,
            finality,
            config,
            seen: DashMap::new(),
            in_flight: KeyedLocks::new(),
            shutdown,
        }
    }

    pub fn ledger(&self) -> &Arc<SwapLedger> {
        &self.ledger
    }

    pub fn vault(&self) -> &Arc<SecretVault> {
        &self.vault
    }

    /// Run the event loop and the scanner until [`CoordinationEngine::stop`]
    pub async fn run(&self, events: mpsc::Receiver<SwapEvent>) {
        info!("Coordination engine started");
        tokio::join!(self.run_events(events), self.run_scanner());
        info!("Coordination engine stopped");
    }

    /// Ask both loops to stop. Iterations already running finish first.
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }

    async fn run_events(&self, mut events: mpsc::Receiver<SwapEvent>) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = shutdown.changed() => break,
                event = events.recv() => match event {
                    Some(event) => {
                        let name = event.name();
                        if let Err(e) = self.handle_event(event).await {
                            error!("Error handling {} event: {}", name, e);
                        }
                    }
                    None => {
                        info!("Event channel closed");
                        break;
                    }
                },
            }
        }
    }

    async fn run_scanner(&self) {
        let mut shutdown = self.shutdown.subscribe();

        let mut scan = interval(Duration::from_millis(self.config.scan_interval_ms.max(1)));
        scan.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut expiry = interval(Duration::from_secs(
            self.config.expiry_check_interval_secs.max(1),
        ));
        let mut cleanup = interval(Duration::from_secs(self.config.cleanup_interval_secs.max(1)));

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = shutdown.changed() => break,

                _ = scan.tick() => {
                    if let Err(e) = self.scan_once().await {
                        error!("Scan failed: {}", e);
                    }
                    self.check_finality().await;
                }

                _ = expiry.tick() => {
                    if let Err(e) = self.expire().await {
                        error!("Expiry sweep failed: {}", e);
                    }
                }

                _ = cleanup.tick() => {
                    if let Err(e) = self.cleanup().await {
                        error!("Cleanup failed: {}", e);
                    }
                }
            }
        }
    }

    /// Start tracking an order seen at the API boundary
    pub async fn register_order(
        &self,
        order_hash: H256,
        initial: SwapPatch,
    ) -> ResolverResult<SwapRecord> {
        self.ledger.track(order_hash, initial).await
    }

    /// Start tracking an order from the escrow extension attached to it
    ///
    /// The extension must carry `factory` as its prefix; its hashlock, parties, tokens
    /// and amounts seed the record.
    pub async fn register_order_extension(
        &self,
        order_hash: H256,
        src_chain_id: u64,
        dst_chain_id: u64,
        factory: Address,
        extension: &[u8],
    ) -> ResolverResult<SwapRecord> {
        let params = codec::decode(factory, extension)?;
        let patch = SwapPatch {
            hashlock: Some(params.hashlock),
            alice: Some(params.maker),
            bob: Some(params.taker),
            src: SidePatch {
                chain_id: Some(src_chain_id),
                token: Some(params.src_token),
                amount: Some(params.src_amount),
                ..Default::default()
            },
            dst: SidePatch {
                chain_id: Some(dst_chain_id),
                token: Some(params.dst_token),
                amount: Some(params.dst_amount),
                ..Default::default()
            },
            ..Default::default()
        };
        self.register_order(order_hash, patch).await
    }

    /// Accept the maker's secret for a tracked swap
    ///
    /// The secret must hash to the swap's hashlock; anything else leaves both the vault
    /// and the ledger untouched.
    pub async fn register_secret(
        &self,
        order_hash: H256,
        secret: H256,
    ) -> ResolverResult<SecretRecord> {
        let swap = self
            .ledger
            .get(&order_hash)
            .await?
            .ok_or_else(|| ResolverError::SwapNotFound {
                order_hash: hex_of(&order_hash),
            })?;

        let hashlock = hashlock_of(&secret);
        if swap.hashlock != hashlock {
            error!(
                "Secret for swap {} hashes to {}, expected {}",
                hex_of(&order_hash),
                hex_of(&hashlock),
                hex_of(&swap.hashlock)
            );
            crate::metrics::record_invariant_violation("secret_hashlock_mismatch");
            return Err(ResolverError::InvariantViolation(format!(
                "secret does not match hashlock of swap {}",
                hex_of(&order_hash)
            )));
        }

        let escrow = swap.dst.escrow.or(swap.src.escrow).unwrap_or_default();
        let record = self
            .vault
            .store(secret, order_hash, escrow, swap.dst.chain_id)
            .await?;

        let patch = SwapPatch {
            secret: Some(secret),
            ..Default::default()
        };
        self.ledger.advance(&order_hash, swap.status, patch).await?;
        Ok(record)
    }

    /// Apply one watcher event. Returns false for a redelivered log.
    pub async fn handle_event(&self, event: SwapEvent) -> ResolverResult<bool> {
        let key = event.meta.key();
        if !self.first_delivery(key) {
            debug!(
                "Skipping duplicate {} on chain {} ({:?}/{})",
                event.name(),
                event.chain_id(),
                event.meta.tx_hash,
                event.meta.log_index
            );
            crate::metrics::record_duplicate_event(event.chain_id());
            return Ok(false);
        }

        debug!("Handling event: {}", event.name());
        let result = self.apply_event(&event).await;
        if let Err(ref e) = result {
            // a later redelivery may succeed
            if e.is_retryable() {
                self.seen.remove(&key);
            }
        }
        result.map(|_| true)
    }

    fn first_delivery(&self, key: EventKey) -> bool {
        match self.seen.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(Instant::now());
                true
            }
        }
    }

    async fn apply_event(&self, event: &SwapEvent) -> ResolverResult<()> {
        let meta = &event.meta;
        let now = Utc::now();

        match &event.kind {
            SwapEventKind::OrderFilled {
                order_hash,
                maker,
                taker,
                making_amount,
                taking_amount,
            } => {
                self.ledger.track(*order_hash, SwapPatch::default()).await?;
                let patch = SwapPatch {
                    alice: Some(*maker),
                    bob: Some(*taker),
                    src: SidePatch {
                        chain_id: Some(meta.chain_id),
                        amount: Some(*making_amount),
                        ..Default::default()
                    },
                    dst: SidePatch {
                        amount: Some(*taking_amount),
                        ..Default::default()
                    },
                    ..Default::default()
                };
                self.ledger
                    .advance(order_hash, SwapStatus::OrderFilled, patch)
                    .await?;
            }

            SwapEventKind::SrcEscrowCreated {
                order_hash,
                hashlock,
                escrow,
                maker,
                taker,
                token,
                amount,
            } => {
                self.ledger.track(*order_hash, SwapPatch::default()).await?;
                let patch = SwapPatch {
                    hashlock: Some(*hashlock),
                    alice: Some(*maker),
                    bob: Some(*taker),
                    src: SidePatch {
                        chain_id: Some(meta.chain_id),
                        token: Some(*token),
                        amount: Some(*amount),
                        escrow: Some(*escrow),
                        escrow_created_at: Some(now),
                        ..Default::default()
                    },
                    ..Default::default()
                };
                self.ledger
                    .advance(order_hash, SwapStatus::SourceEscrowCreated, patch)
                    .await?;
            }

            SwapEventKind::PostInteractionSucceeded { order_hash, escrow } => {
                let patch = SwapPatch {
                    src: SidePatch {
                        chain_id: Some(meta.chain_id),
                        escrow: Some(*escrow),
                        deposited_at: Some(now),
                        ..Default::default()
                    },
                    ..Default::default()
                };
                self.ledger
                    .advance(order_hash, SwapStatus::AliceDeposited, patch)
                    .await?;
            }

            SwapEventKind::PostInteractionFailed { order_hash, reason } => {
                self.ledger
                    .record_failure(
                        order_hash,
                        &format!("post-interaction failed on chain {}: {}", meta.chain_id, reason),
                        false,
                    )
                    .await?;
            }

            SwapEventKind::DstEscrowCreated {
                order_hash,
                hashlock,
                escrow,
                taker,
                token,
                amount,
            } => {
                let patch = SwapPatch {
                    hashlock: Some(*hashlock),
                    bob: Some(*taker),
                    dst: SidePatch {
                        chain_id: Some(meta.chain_id),
                        token: Some(*token),
                        amount: Some(*amount),
                        escrow: Some(*escrow),
                        escrow_created_at: Some(now),
                        deposited_at: Some(now),
                        ..Default::default()
                    },
                    ..Default::default()
                };
                self.ledger
                    .advance(order_hash, SwapStatus::BobDeposited, patch)
                    .await?;
            }

            SwapEventKind::EscrowWithdrawal { hashlock, secret } => {
                self.handle_withdrawal(meta, *hashlock, *secret).await?;
            }

            SwapEventKind::EscrowCancelled { hashlock } => {
                match self.ledger.get_by_hashlock(hashlock).await? {
                    Some(swap) if swap.side_of_escrow(meta.chain_id, meta.emitter).is_some() => {
                        let reason = format!(
                            "escrow {:?} cancelled on chain {}",
                            meta.emitter, meta.chain_id
                        );
                        self.ledger
                            .record_failure(&swap.order_hash, &reason, false)
                            .await?;
                    }
                    Some(swap) => warn!(
                        "Cancellation for swap {} from unknown escrow {:?}",
                        hex_of(&swap.order_hash),
                        meta.emitter
                    ),
                    None => debug!("Cancellation for unknown hashlock {}", hex_of(hashlock)),
                }
            }
        }

        Ok(())
    }

    /// A withdrawal publishes the secret; learn it and record the withdrawn side
    async fn handle_withdrawal(
        &self,
        meta: &EventMeta,
        hashlock: H256,
        secret: H256,
    ) -> ResolverResult<()> {
        if hashlock_of(&secret) != hashlock {
            error!(
                "Withdrawal {:?} on chain {} carries a secret that does not hash to {}",
                meta.tx_hash,
                meta.chain_id,
                hex_of(&hashlock)
            );
            crate::metrics::record_invariant_violation("secret_hashlock_mismatch");
            return Err(ResolverError::InvariantViolation(format!(
                "withdrawal secret does not match hashlock {}",
                hex_of(&hashlock)
            )));
        }

        let Some(swap) = self.ledger.get_by_hashlock(&hashlock).await? else {
            debug!("Withdrawal for unknown hashlock {}", hex_of(&hashlock));
            return Ok(());
        };
        let Some(side) = swap.side_of_escrow(meta.chain_id, meta.emitter) else {
            warn!(
                "Withdrawal for swap {} from unknown escrow {:?} on chain {}",
                hex_of(&swap.order_hash),
                meta.emitter,
                meta.chain_id
            );
            return Ok(());
        };

        let record = self
            .vault
            .store(secret, swap.order_hash, meta.emitter, meta.chain_id)
            .await?;
        if record.status == SecretStatus::Pending {
            self.vault
                .confirm(&hashlock, meta.tx_hash, U256::zero())
                .await?;
            self.track_reveal(meta.chain_id, meta.tx_hash, meta.block_number, &swap)
                .await;
        }

        let now = Utc::now();
        let mut patch = SwapPatch::withdrawn(side, now);
        patch.secret = Some(secret);
        patch.secret_revealed_at = Some(now);
        self.ledger
            .advance(&swap.order_hash, Action::Withdraw(side).target_status(), patch)
            .await?;

        info!(
            "Swap {} {} escrow withdrawn on chain {}",
            hex_of(&swap.order_hash),
            side,
            meta.chain_id
        );
        Ok(())
    }

    /// Run the next-action queries once and dispatch everything due
    pub async fn scan_once(&self) -> ResolverResult<ScanSummary> {
        let started = Instant::now();

        let mut due = Vec::new();
        for swap in self.ledger.awaiting_destination_escrow().await? {
            due.push((swap.order_hash, Action::CreateDstEscrow));
        }
        for swap in self.ledger.awaiting_secret_reveal().await? {
            due.push((swap.order_hash, Action::RevealSecret));
        }
        for swap in self.ledger.awaiting_withdrawal().await? {
            for side in swap.pending_withdrawals() {
                due.push((swap.order_hash, Action::Withdraw(side)));
            }
        }

        let mut summary = ScanSummary {
            due: due.len(),
            ..Default::default()
        };
        for (order_hash, action) in due {
            match self.dispatch(order_hash, action).await {
                Ok(true) => summary.dispatched += 1,
                Ok(false) => summary.skipped += 1,
                Err(e) => {
                    summary.skipped += 1;
                    error!("{} for swap {} failed: {}", action, hex_of(&order_hash), e);
                }
            }
        }

        crate::metrics::record_scan_duration(started.elapsed().as_secs_f64());
        if summary.due > 0 {
            debug!(
                "Scan: {} due, {} dispatched, {} skipped",
                summary.due, summary.dispatched, summary.skipped
            );
        }
        Ok(summary)
    }

    /// Submit one action for one swap
    ///
    /// Skips, returning false, when another action for the order is in flight or the
    /// freshly read record no longer needs the action.
    pub async fn dispatch(&self, order_hash: H256, action: Action) -> ResolverResult<bool> {
        let key = hex_of(&order_hash);
        let Some(_guard) = self.in_flight.try_lock(&key) else {
            debug!("Swap {} has an action in flight, skipping {}", key, action);
            return Ok(false);
        };

        // re-read under the lock, an event or an earlier dispatch may have moved it on
        let Some(swap) = self.ledger.get(&order_hash).await? else {
            return Ok(false);
        };
        if !action.is_due(&swap) {
            debug!("Swap {} no longer needs {}", key, action);
            return Ok(false);
        }

        let chain_id = action.chain_id(&swap);
        let result = match action {
            Action::CreateDstEscrow => self.submitter.create_dst_escrow(&swap).await,
            Action::RevealSecret => {
                let secret = self.verified_secret(&swap).await?;
                self.submitter.reveal_secret(&swap, secret).await
            }
            Action::Withdraw(side) => {
                let secret = self.verified_secret(&swap).await?;
                self.submitter.withdraw(&swap, side, secret).await
            }
        };

        match result {
            Ok(receipt) => {
                crate::metrics::record_submission(chain_id, action.name(), true);
                info!(
                    "{} for swap {} mined in {:?} on chain {}",
                    action, key, receipt.tx_hash, receipt.chain_id
                );
                self.apply_receipt(&swap, action, receipt).await?;
                Ok(true)
            }
            Err(ResolverError::SubmissionDisabled(message)) => {
                debug!("{} for swap {} not sent: {}", action, key, message);
                Ok(false)
            }
            Err(e) => {
                crate::metrics::record_submission(chain_id, action.name(), false);
                let retryable = e.is_retryable();
                if e.should_alert() {
                    error!("{} for swap {} failed: {}", action, key, e);
                } else {
                    warn!(
                        "{} for swap {} failed ({}): {}",
                        action,
                        key,
                        if retryable { "retryable" } else { "permanent" },
                        e
                    );
                }
                self.ledger
                    .record_failure(&order_hash, &format!("{}: {}", action, e), retryable)
                    .await?;
                if action == Action::RevealSecret && !retryable {
                    self.vault.mark_failed(&swap.hashlock, &e.to_string()).await?;
                }
                Ok(true)
            }
        }
    }

    /// Secret for a swap, checked against its hashlock before it leaves the process
    async fn verified_secret(&self, swap: &SwapRecord) -> ResolverResult<H256> {
        let secret = match self.vault.get_by_hashlock(&swap.hashlock).await? {
            Some(record) => record.secret,
            None => swap.secret.ok_or_else(|| {
                ResolverError::InvariantViolation(format!(
                    "no secret known for swap {}",
                    hex_of(&swap.order_hash)
                ))
            })?,
        };

        if hashlock_of(&secret) != swap.hashlock {
            error!(
                "Stored secret for swap {} does not hash to {}",
                hex_of(&swap.order_hash),
                hex_of(&swap.hashlock)
            );
            crate::metrics::record_invariant_violation("secret_hashlock_mismatch");
            return Err(ResolverError::InvariantViolation(format!(
                "stored secret does not match hashlock of swap {}",
                hex_of(&swap.order_hash)
            )));
        }
        Ok(secret)
    }

    async fn apply_receipt(
        &self,
        swap: &SwapRecord,
        action: Action,
        receipt: SubmissionReceipt,
    ) -> ResolverResult<()> {
        let now = Utc::now();
        let mut patch = SwapPatch::default();

        match action {
            Action::CreateDstEscrow => {
                patch.dst.chain_id = Some(receipt.chain_id);
                patch.dst.escrow = receipt.escrow;
                patch.dst.escrow_created_at = Some(now);
            }
            Action::RevealSecret => {
                self.vault
                    .confirm(&swap.hashlock, receipt.tx_hash, receipt.gas_used)
                    .await?;
                self.track_reveal(receipt.chain_id, receipt.tx_hash, receipt.block_number, swap)
                    .await;
                patch.secret_revealed_at = Some(now);
            }
            Action::Withdraw(side) => {
                patch.side_mut(side).withdrawn_at = Some(now);
            }
        }

        self.ledger
            .advance(&swap.order_hash, action.target_status(), patch)
            .await?;
        Ok(())
    }

    async fn track_reveal(
        &self,
        chain_id: u64,
        tx_hash: H256,
        block_number: u64,
        swap: &SwapRecord,
    ) {
        match self.finality.get(&chain_id) {
            Some(tracker) => {
                tracker
                    .track(TrackedReveal {
                        tx_hash,
                        block_number,
                        hashlock: swap.hashlock,
                        order_hash: swap.order_hash,
                    })
                    .await
            }
            None => warn!("No finality tracker for chain {}", chain_id),
        }
    }

    /// Check pending reveals and correct those dropped by a reorg
    pub async fn check_finality(&self) {
        for tracker in self.finality.values() {
            let report = match tracker.check_pending().await {
                Ok(report) => report,
                Err(e) => {
                    warn!("Finality check failed on chain {}: {}", tracker.chain_id(), e);
                    continue;
                }
            };

            for reveal in report.finalized {
                debug!(
                    "Reveal for swap {} final on chain {}",
                    hex_of(&reveal.order_hash),
                    tracker.chain_id()
                );
            }
            for reveal in report.reorged {
                if let Err(e) = self.correct_reorged_reveal(tracker.chain_id(), &reveal).await {
                    error!(
                        "Failed to record reorg for swap {}: {}",
                        hex_of(&reveal.order_hash),
                        e
                    );
                }
            }
        }
    }

    /// The swap keeps its status; an operator reconciles it
    async fn correct_reorged_reveal(
        &self,
        chain_id: u64,
        reveal: &TrackedReveal,
    ) -> ResolverResult<()> {
        let reason = format!(
            "reveal {:?} dropped by reorg on chain {} (block {})",
            reveal.tx_hash, chain_id, reveal.block_number
        );
        error!(
            "Swap {}: {}, manual reconciliation needed",
            hex_of(&reveal.order_hash),
            reason
        );
        self.vault.correct_reorg(&reveal.hashlock, &reason).await?;
        self.ledger.annotate(&reveal.order_hash, &reason).await?;
        Ok(())
    }

    /// Sweep swaps past the configured timeout
    pub async fn expire(&self) -> ResolverResult<usize> {
        let expired = self
            .ledger
            .check_expired(self.config.swap_timeout_secs)
            .await?;
        if !expired.is_empty() {
            warn!("{} swaps expired", expired.len());
        }
        Ok(expired.len())
    }

    /// Drop completed swaps past retention and forget old de-duplication entries
    pub async fn cleanup(&self) -> ResolverResult<usize> {
        let removed = self.ledger.cleanup_old(self.config.retention_days).await?;
        self.seen.retain(|_, seen_at| seen_at.elapsed() < DEDUP_TTL);
        self.in_flight.prune();
        Ok(removed)
    }

    pub async fn stats(&self) -> ResolverResult<EngineStats> {
        Ok(EngineStats {
            swaps: self.ledger.statistics().await?,
            secrets: self.vault.stats().await?,
            remembered_events: self.seen.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::fake::FakeChainClient;
    use crate::codec::EscrowParams;
    use crate::ledger::Side;
    use crate::store::MemoryStore;
    use crate::tx::{DryRunSubmitter, MockTransactionSubmitter};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const SRC: u64 = 1;
    const DST: u64 = 10;

    fn order() -> H256 {
        H256::repeat_byte(0xaa)
    }

    fn secret() -> H256 {
        H256::repeat_byte(0x5e)
    }

    fn src_escrow() -> Address {
        Address::repeat_byte(0xe1)
    }

    fn dst_escrow() -> Address {
        Address::repeat_byte(0xe2)
    }

    fn config() -> ResolverConfig {
        ResolverConfig {
            instance_id: "resolver-test".to_string(),
            scan_interval_ms: 10,
            swap_timeout_secs: 3_600,
            expiry_check_interval_secs: 60,
            retention_days: 7,
            cleanup_interval_secs: 3_600,
            retry_delay_ms: 5,
            max_retry_delay_ms: 20,
            health_check_interval_secs: 30,
            event_buffer: 16,
        }
    }

    fn engine_with<S: TransactionSubmitter + 'static>(
        submitter: S,
        config: ResolverConfig,
    ) -> (CoordinationEngine, Arc<FakeChainClient>) {
        let store = Arc::new(MemoryStore::new());
        let ledger = Arc::new(SwapLedger::new(store.clone()));
        let vault = Arc::new(SecretVault::new(store));
        let dst_client = FakeChainClient::polling(DST, 100);
        let mut finality = HashMap::new();
        finality.insert(
            DST,
            Arc::new(FinalityTracker::new(DST, 12, dst_client.clone())),
        );
        let engine = CoordinationEngine::new(ledger, vault, Arc::new(submitter), finality, config);
        (engine, dst_client)
    }

    fn event(chain_id: u64, block: u64, emitter: Address, kind: SwapEventKind) -> SwapEvent {
        SwapEvent {
            meta: EventMeta {
                chain_id,
                block_number: block,
                tx_hash: H256::from_low_u64_be(chain_id * 1_000_000 + block),
                log_index: 0,
                emitter,
            },
            kind,
        }
    }

    fn receipt(chain_id: u64, tx: u8, block: u64, escrow: Option<Address>) -> SubmissionReceipt {
        SubmissionReceipt {
            chain_id,
            tx_hash: H256::repeat_byte(tx),
            block_number: block,
            gas_used: U256::from(50_000u64),
            escrow,
        }
    }

    /// Drive a swap to ALICE_DEPOSITED through source chain events
    async fn funded_swap(engine: &CoordinationEngine) {
        let factory = Address::repeat_byte(0xfa);
        let events = vec![
            event(
                SRC,
                10,
                Address::repeat_byte(0x1f),
                SwapEventKind::OrderFilled {
                    order_hash: order(),
                    maker: Address::repeat_byte(0x0a),
                    taker: Address::repeat_byte(0x0b),
                    making_amount: U256::from(1_000u64),
                    taking_amount: U256::from(990u64),
                },
            ),
            event(
                SRC,
                11,
                factory,
                SwapEventKind::SrcEscrowCreated {
                    order_hash: order(),
                    hashlock: hashlock_of(&secret()),
                    escrow: src_escrow(),
                    maker: Address::repeat_byte(0x0a),
                    taker: Address::repeat_byte(0x0b),
                    token: Address::repeat_byte(0x70),
                    amount: U256::from(1_000u64),
                },
            ),
            event(
                SRC,
                12,
                factory,
                SwapEventKind::PostInteractionSucceeded {
                    order_hash: order(),
                    escrow: src_escrow(),
                },
            ),
        ];
        for e in events {
            assert!(engine.handle_event(e).await.unwrap());
        }
    }

    fn dst_escrow_created() -> SwapEvent {
        event(
            DST,
            50,
            Address::repeat_byte(0xfb),
            SwapEventKind::DstEscrowCreated {
                order_hash: order(),
                hashlock: hashlock_of(&secret()),
                escrow: dst_escrow(),
                taker: Address::repeat_byte(0x0b),
                token: Address::repeat_byte(0x71),
                amount: U256::from(990u64),
            },
        )
    }

    async fn status(engine: &CoordinationEngine) -> SwapStatus {
        engine.ledger().get(&order()).await.unwrap().unwrap().status
    }

    #[tokio::test]
    async fn test_full_swap_lifecycle() {
        let mut mock = MockTransactionSubmitter::new();
        mock.expect_create_dst_escrow()
            .times(1)
            .returning(|_| Ok(receipt(DST, 0x01, 101, Some(dst_escrow()))));
        mock.expect_reveal_secret()
            .withf(|_, s| *s == secret())
            .times(1)
            .returning(|_, _| Ok(receipt(DST, 0x02, 102, None)));
        mock.expect_withdraw()
            .times(2)
            .returning(|swap, side, _| Ok(receipt(swap.side(side).chain_id, 0x03, 103, None)));

        let (engine, _) = engine_with(mock, config());
        funded_swap(&engine).await;
        assert_eq!(status(&engine).await, SwapStatus::AliceDeposited);

        let summary = engine.scan_once().await.unwrap();
        assert_eq!(summary.dispatched, 1);
        assert_eq!(status(&engine).await, SwapStatus::DestEscrowCreated);

        engine.handle_event(dst_escrow_created()).await.unwrap();
        assert_eq!(status(&engine).await, SwapStatus::BobDeposited);

        // nothing is due until the secret is known
        assert_eq!(engine.scan_once().await.unwrap().due, 0);

        let stored = engine.register_secret(order(), secret()).await.unwrap();
        assert_eq!(stored.hashlock, hashlock_of(&secret()));

        engine.scan_once().await.unwrap();
        assert_eq!(status(&engine).await, SwapStatus::SecretRevealed);
        let vaulted = engine
            .vault()
            .get_by_hashlock(&hashlock_of(&secret()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(vaulted.status, SecretStatus::Confirmed);
        assert_eq!(vaulted.tx_hash, Some(H256::repeat_byte(0x02)));

        let summary = engine.scan_once().await.unwrap();
        assert_eq!(summary.dispatched, 2);
        let done = engine.ledger().get(&order()).await.unwrap().unwrap();
        assert_eq!(done.status, SwapStatus::Completed);
        assert!(done.completed_at.is_some());

        assert_eq!(engine.scan_once().await.unwrap().due, 0);
    }

    #[tokio::test]
    async fn test_withdrawal_event_teaches_secret() {
        let mut mock = MockTransactionSubmitter::new();
        mock.expect_withdraw()
            .withf(|_, side, s| *side == Side::Source && *s == secret())
            .times(1)
            .returning(|_, _, _| Ok(receipt(SRC, 0x04, 30, None)));

        let (engine, _) = engine_with(mock, config());
        funded_swap(&engine).await;
        engine.handle_event(dst_escrow_created()).await.unwrap();

        // the maker withdraws on the destination chain first
        let withdrawal = event(
            DST,
            60,
            dst_escrow(),
            SwapEventKind::EscrowWithdrawal {
                hashlock: hashlock_of(&secret()),
                secret: secret(),
            },
        );
        engine.handle_event(withdrawal).await.unwrap();

        let swap = engine.ledger().get(&order()).await.unwrap().unwrap();
        assert_eq!(swap.status, SwapStatus::DestWithdrawn);
        assert_eq!(swap.secret, Some(secret()));
        assert!(swap.secret_revealed_at.is_some());
        let vaulted = engine.vault().get_by_order_hash(&order()).await.unwrap().unwrap();
        assert_eq!(vaulted.secret, secret());

        engine.scan_once().await.unwrap();
        assert_eq!(status(&engine).await, SwapStatus::Completed);
    }

    #[tokio::test]
    async fn test_withdrawal_with_wrong_secret_is_refused() {
        let (engine, _) = engine_with(MockTransactionSubmitter::new(), config());
        funded_swap(&engine).await;
        engine.handle_event(dst_escrow_created()).await.unwrap();

        let forged = event(
            DST,
            60,
            dst_escrow(),
            SwapEventKind::EscrowWithdrawal {
                hashlock: hashlock_of(&secret()),
                secret: H256::repeat_byte(0x01),
            },
        );
        let err = engine.handle_event(forged).await.unwrap_err();
        assert!(matches!(err, ResolverError::InvariantViolation(_)));

        let swap = engine.ledger().get(&order()).await.unwrap().unwrap();
        assert_eq!(swap.status, SwapStatus::BobDeposited);
        assert!(swap.secret.is_none());
        assert!(engine.vault().get_by_order_hash(&order()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reused_hashlock_does_not_hijack_withdrawals() {
        let (engine, _) = engine_with(MockTransactionSubmitter::new(), config());
        funded_swap(&engine).await;
        engine.handle_event(dst_escrow_created()).await.unwrap();

        let other = H256::repeat_byte(0xbb);
        let reuse = event(
            SRC,
            70,
            Address::repeat_byte(0xfa),
            SwapEventKind::SrcEscrowCreated {
                order_hash: other,
                hashlock: hashlock_of(&secret()),
                escrow: Address::repeat_byte(0xe9),
                maker: Address::repeat_byte(0x0c),
                taker: Address::repeat_byte(0x0b),
                token: Address::repeat_byte(0x70),
                amount: U256::from(5u64),
            },
        );
        let err = engine.handle_event(reuse).await.unwrap_err();
        assert!(matches!(err, ResolverError::InvariantViolation(_)));

        let withdrawal = event(
            DST,
            71,
            dst_escrow(),
            SwapEventKind::EscrowWithdrawal {
                hashlock: hashlock_of(&secret()),
                secret: secret(),
            },
        );
        engine.handle_event(withdrawal).await.unwrap();
        assert_eq!(status(&engine).await, SwapStatus::DestWithdrawn);
        assert!(engine
            .ledger()
            .get(&other)
            .await
            .unwrap()
            .unwrap()
            .hashlock
            .is_zero());
    }

    #[tokio::test]
    async fn test_duplicate_events_are_applied_once() {
        let (engine, _) = engine_with(MockTransactionSubmitter::new(), config());
        funded_swap(&engine).await;
        let before = engine.ledger().get(&order()).await.unwrap().unwrap();

        let replay = event(
            SRC,
            12,
            Address::repeat_byte(0xfa),
            SwapEventKind::PostInteractionSucceeded {
                order_hash: order(),
                escrow: src_escrow(),
            },
        );
        assert!(!engine.handle_event(replay).await.unwrap());
        assert_eq!(engine.ledger().get(&order()).await.unwrap().unwrap(), before);
    }

    #[tokio::test]
    async fn test_out_of_order_events_do_not_regress() {
        let (engine, _) = engine_with(MockTransactionSubmitter::new(), config());
        funded_swap(&engine).await;
        engine.handle_event(dst_escrow_created()).await.unwrap();

        // a late order fill from another log position
        let late = event(
            SRC,
            9,
            Address::repeat_byte(0x1f),
            SwapEventKind::OrderFilled {
                order_hash: order(),
                maker: Address::repeat_byte(0x0a),
                taker: Address::repeat_byte(0x0b),
                making_amount: U256::from(1_000u64),
                taking_amount: U256::from(990u64),
            },
        );
        engine.handle_event(late).await.unwrap();
        assert_eq!(status(&engine).await, SwapStatus::BobDeposited);
    }

    #[tokio::test]
    async fn test_submission_failures() {
        let mut calls = 0;
        let mut mock = MockTransactionSubmitter::new();
        mock.expect_create_dst_escrow().times(2).returning(move |_| {
            calls += 1;
            if calls == 1 {
                Err(ResolverError::Timeout {
                    operation: "receipt".to_string(),
                })
            } else {
                Err(ResolverError::InsufficientBalance {
                    chain_id: DST,
                    have: "0".to_string(),
                    need: "990".to_string(),
                })
            }
        });

        let (engine, _) = engine_with(mock, config());
        funded_swap(&engine).await;

        engine.scan_once().await.unwrap();
        let swap = engine.ledger().get(&order()).await.unwrap().unwrap();
        assert_eq!(swap.status, SwapStatus::AliceDeposited);
        assert_eq!(swap.retry_count, 1);
        assert!(swap.last_error.unwrap().contains("receipt"));

        engine.scan_once().await.unwrap();
        let swap = engine.ledger().get(&order()).await.unwrap().unwrap();
        assert_eq!(swap.status, SwapStatus::Failed);
        assert!(swap.last_error.unwrap().contains("Insufficient balance on chain"));

        // failed swaps are no longer due
        assert_eq!(engine.scan_once().await.unwrap().due, 0);
    }

    #[tokio::test]
    async fn test_dry_run_leaves_swaps_untouched() {
        let (engine, _) = engine_with(DryRunSubmitter, config());
        funded_swap(&engine).await;
        let before = engine.ledger().get(&order()).await.unwrap().unwrap();

        let summary = engine.scan_once().await.unwrap();
        assert_eq!(summary.due, 1);
        assert_eq!(summary.dispatched, 0);
        assert_eq!(engine.ledger().get(&order()).await.unwrap().unwrap(), before);
    }

    struct SlowSubmitter {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TransactionSubmitter for SlowSubmitter {
        async fn create_dst_escrow(&self, _swap: &SwapRecord) -> ResolverResult<SubmissionReceipt> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(receipt(DST, 0x01, 101, Some(dst_escrow())))
        }

        async fn reveal_secret(
            &self,
            _swap: &SwapRecord,
            _secret: H256,
        ) -> ResolverResult<SubmissionReceipt> {
            Err(ResolverError::Internal("unexpected".to_string()))
        }

        async fn withdraw(
            &self,
            _swap: &SwapRecord,
            _side: Side,
            _secret: H256,
        ) -> ResolverResult<SubmissionReceipt> {
            Err(ResolverError::Internal("unexpected".to_string()))
        }
    }

    #[tokio::test]
    async fn test_overlapping_scans_submit_once() {
        let submitter = SlowSubmitter {
            calls: AtomicUsize::new(0),
        };
        let store = Arc::new(MemoryStore::new());
        let submitter = Arc::new(submitter);
        let engine = CoordinationEngine::new(
            Arc::new(SwapLedger::new(store.clone())),
            Arc::new(SecretVault::new(store)),
            submitter.clone(),
            HashMap::new(),
            config(),
        );
        funded_swap(&engine).await;

        let (a, b) = tokio::join!(engine.scan_once(), engine.scan_once());
        a.unwrap();
        b.unwrap();
        assert_eq!(submitter.calls.load(Ordering::SeqCst), 1);
        assert_eq!(status(&engine).await, SwapStatus::DestEscrowCreated);
    }

    #[tokio::test]
    async fn test_register_order_from_extension() {
        let (engine, _) = engine_with(MockTransactionSubmitter::new(), config());
        let factory = Address::repeat_byte(0xfa);
        let params = EscrowParams {
            src_escrow_impl: Address::repeat_byte(0x01),
            dst_escrow_impl: Address::repeat_byte(0x02),
            timelocks: codec::pack_timelocks_at(1_700_000_000, 3_600, 1_800),
            hashlock: hashlock_of(&secret()),
            maker: Address::repeat_byte(0x0a),
            taker: Address::repeat_byte(0x0b),
            receiver: Address::repeat_byte(0x0a),
            src_token: Address::repeat_byte(0x70),
            src_amount: U256::from(1_000u64),
            dst_token: Address::repeat_byte(0x71),
            dst_amount: U256::from(990u64),
            src_safety_deposit: U256::from(10u64),
            dst_safety_deposit: U256::from(10u64),
            nonce: U256::one(),
        };
        let extension = codec::encode(factory, &params);

        let err = engine
            .register_order_extension(order(), SRC, DST, Address::repeat_byte(0xfb), &extension)
            .await
            .unwrap_err();
        assert!(matches!(err, ResolverError::Decode(_)));

        let swap = engine
            .register_order_extension(order(), SRC, DST, factory, &extension)
            .await
            .unwrap();
        assert_eq!(swap.status, SwapStatus::Created);
        assert_eq!(swap.hashlock, hashlock_of(&secret()));
        assert_eq!(swap.src.chain_id, SRC);
        assert_eq!(swap.dst.amount, U256::from(990u64));

        // the secret can be registered as soon as the hashlock is known
        engine.register_secret(order(), secret()).await.unwrap();
        let found = engine
            .ledger()
            .get_by_hashlock(&hashlock_of(&secret()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.secret, Some(secret()));
    }

    #[tokio::test]
    async fn test_register_secret_checks_hashlock() {
        let (engine, _) = engine_with(MockTransactionSubmitter::new(), config());

        let err = engine.register_secret(order(), secret()).await.unwrap_err();
        assert!(matches!(err, ResolverError::SwapNotFound { .. }));

        funded_swap(&engine).await;
        let err = engine
            .register_secret(order(), H256::repeat_byte(0x01))
            .await
            .unwrap_err();
        assert!(matches!(err, ResolverError::InvariantViolation(_)));
        assert!(engine.vault().get_by_order_hash(&order()).await.unwrap().is_none());
        assert!(engine
            .ledger()
            .get(&order())
            .await
            .unwrap()
            .unwrap()
            .secret
            .is_none());
    }

    #[tokio::test]
    async fn test_reorged_reveal_is_flagged() {
        let mut mock = MockTransactionSubmitter::new();
        mock.expect_reveal_secret()
            .times(1)
            .returning(|_, _| Ok(receipt(DST, 0x02, 102, None)));

        let (engine, dst_client) = engine_with(mock, config());
        funded_swap(&engine).await;
        engine.handle_event(dst_escrow_created()).await.unwrap();
        engine.register_secret(order(), secret()).await.unwrap();

        // reveal only; the withdrawals are not due yet in this scan
        engine
            .dispatch(order(), Action::RevealSecret)
            .await
            .unwrap();
        dst_client.set_receipt(H256::repeat_byte(0x02), 102, true);
        engine.check_finality().await;
        assert_eq!(
            engine.vault().get_by_order_hash(&order()).await.unwrap().unwrap().status,
            SecretStatus::Confirmed
        );

        // the reveal vanishes and the chain moves past the confirmation depth
        dst_client.drop_receipt(&H256::repeat_byte(0x02));
        dst_client.set_head(200);
        engine.check_finality().await;

        let vaulted = engine.vault().get_by_order_hash(&order()).await.unwrap().unwrap();
        assert_eq!(vaulted.status, SecretStatus::Failed);
        assert!(vaulted.reorged);
        let swap = engine.ledger().get(&order()).await.unwrap().unwrap();
        assert_eq!(swap.status, SwapStatus::SecretRevealed);
        assert!(swap.last_error.unwrap().contains("reorg"));
    }

    #[tokio::test]
    async fn test_failure_events() {
        let (engine, _) = engine_with(MockTransactionSubmitter::new(), config());
        funded_swap(&engine).await;

        let cancelled = event(
            SRC,
            90,
            src_escrow(),
            SwapEventKind::EscrowCancelled {
                hashlock: hashlock_of(&secret()),
            },
        );
        engine.handle_event(cancelled).await.unwrap();
        let swap = engine.ledger().get(&order()).await.unwrap().unwrap();
        assert_eq!(swap.status, SwapStatus::Failed);
        assert!(swap.last_error.unwrap().contains("cancelled"));

        let other = H256::repeat_byte(0xbb);
        engine.register_order(other, SwapPatch::default()).await.unwrap();
        let failed = event(
            SRC,
            91,
            Address::repeat_byte(0xfa),
            SwapEventKind::PostInteractionFailed {
                order_hash: other,
                reason: "transfer failed".to_string(),
            },
        );
        engine.handle_event(failed).await.unwrap();
        assert_eq!(
            engine.ledger().get(&other).await.unwrap().unwrap().status,
            SwapStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_expire_and_stats() {
        let mut config = config();
        config.swap_timeout_secs = 0;
        let (engine, _) = engine_with(MockTransactionSubmitter::new(), config);
        engine.register_order(order(), SwapPatch::default()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert_eq!(engine.expire().await.unwrap(), 1);
        assert_eq!(status(&engine).await, SwapStatus::Expired);

        let stats = engine.stats().await.unwrap();
        assert_eq!(stats.swaps.expired, 1);
        assert_eq!(stats.secrets.total, 0);
        assert_eq!(engine.cleanup().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_run_stops_gracefully() {
        let (engine, _) = engine_with(DryRunSubmitter, config());
        let engine = Arc::new(engine);
        let (tx, rx) = mpsc::channel(16);

        let handle = tokio::spawn({
            let engine = engine.clone();
            async move { engine.run(rx).await }
        });

        tx.send(event(
            SRC,
            10,
            Address::repeat_byte(0x1f),
            SwapEventKind::OrderFilled {
                order_hash: order(),
                maker: Address::repeat_byte(0x0a),
                taker: Address::repeat_byte(0x0b),
                making_amount: U256::from(1_000u64),
                taking_amount: U256::from(990u64),
            },
        ))
        .await
        .unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while engine.ledger().get(&order()).await.unwrap().is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("event applied");

        engine.stop();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("engine stops")
            .unwrap();
    }
}
