//! Chain module - handles multi-chain connections and event watching
//!
//! This module provides:
//! - The [`ChainClient`] seam the watcher and finality tracker run against
//! - Multi-RPC provider management with automatic failover
//! - Per-chain watchers merging catch-up and live logs onto one event channel
//! - Reveal finality tracking with reorg detection

pub mod finality;
pub mod provider;
pub mod watcher;

pub use finality::{FinalityReport, FinalityTracker, TrackedReveal};
pub use provider::ChainProvider;
pub use watcher::{ChainWatcher, WatcherOptions, WatcherState};

use crate::config::Settings;
use crate::error::{ResolverError, ResolverResult};
use crate::events::{EventParser, SwapEvent};
use crate::store::KvStore;

use async_trait::async_trait;
use dashmap::DashMap;
use ethers::types::{Filter, Log, TransactionReceipt, H256};
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Read access to one chain
#[async_trait]
pub trait ChainClient: Send + Sync {
    fn chain_id(&self) -> u64;

    async fn block_number(&self) -> ResolverResult<u64>;

    /// Historical logs for the filter's block range
    async fn get_logs(&self, filter: &Filter) -> ResolverResult<Vec<Log>>;

    /// Live logs matching `filter`, or `None` when no streaming transport is available
    ///
    /// Dropping the stream releases the subscription.
    async fn subscribe_logs(&self, filter: &Filter)
        -> ResolverResult<Option<BoxStream<'static, Log>>>;

    async fn transaction_receipt(&self, tx_hash: H256)
        -> ResolverResult<Option<TransactionReceipt>>;

    async fn health_check(&self) -> bool;
}

/// Manages connections and watchers for all configured chains
pub struct ChainManager {
    /// Chain clients indexed by chain ID
    clients: DashMap<u64, Arc<dyn ChainClient>>,
    /// Chain watchers indexed by chain ID
    watchers: DashMap<u64, Arc<ChainWatcher>>,
    /// Finality trackers indexed by chain ID
    finality_trackers: DashMap<u64, Arc<FinalityTracker>>,
    /// Holds the watchers' block cursors
    store: Arc<dyn KvStore>,
}

impl ChainManager {
    /// Create a new chain manager with all configured chains
    pub async fn new(settings: &Settings, store: Arc<dyn KvStore>) -> ResolverResult<Self> {
        let manager = Self::empty(store);

        for (name, chain_config) in settings.enabled_chains() {
            info!(
                "Initializing chain {} (ID: {})",
                chain_config.name, chain_config.chain_id
            );

            let factory = chain_config
                .factory()
                .map_err(|e| ResolverError::Config(format!("{:#}", e)))?;
            let limit_order_protocol = chain_config
                .limit_order_protocol()
                .map_err(|e| ResolverError::Config(format!("{:#}", e)))?;

            let client: Arc<dyn ChainClient> =
                Arc::new(ChainProvider::new(chain_config.clone()).await?);
            let parser = EventParser::new(chain_config.chain_id, factory, limit_order_protocol);
            let options = WatcherOptions::from_config(chain_config, &settings.resolver);

            manager.add_chain(client, parser, options, chain_config.confirmation_blocks());
            info!("Chain {} initialized successfully", name);
        }

        Ok(manager)
    }

    pub(crate) fn empty(store: Arc<dyn KvStore>) -> Self {
        Self {
            clients: DashMap::new(),
            watchers: DashMap::new(),
            finality_trackers: DashMap::new(),
            store,
        }
    }

    /// Register a chain served by `client`
    pub fn add_chain(
        &self,
        client: Arc<dyn ChainClient>,
        parser: EventParser,
        options: WatcherOptions,
        confirmation_blocks: u64,
    ) {
        let chain_id = client.chain_id();
        let watcher = ChainWatcher::new(client.clone(), parser, options, self.store.clone());
        let finality = FinalityTracker::new(chain_id, confirmation_blocks, client.clone());

        self.watchers.insert(chain_id, Arc::new(watcher));
        self.finality_trackers.insert(chain_id, Arc::new(finality));
        self.clients.insert(chain_id, client);
    }

    /// Start every watcher, all feeding `events`
    pub fn start_watchers(&self, events: mpsc::Sender<SwapEvent>) {
        for entry in self.watchers.iter() {
            entry.value().start(events.clone());
        }
    }

    /// Stop every watcher and release its subscriptions. Safe to call more than once.
    pub async fn stop(&self) {
        let watchers: Vec<Arc<ChainWatcher>> =
            self.watchers.iter().map(|e| e.value().clone()).collect();
        futures::future::join_all(watchers.iter().map(|w| w.stop())).await;
        info!("Chain manager stopped");
    }

    pub fn client(&self, chain_id: u64) -> ResolverResult<Arc<dyn ChainClient>> {
        self.clients
            .get(&chain_id)
            .map(|c| c.clone())
            .ok_or(ResolverError::ChainNotFound { chain_id })
    }

    /// Finality trackers by chain ID, for the coordination engine
    pub fn finality_trackers(&self) -> HashMap<u64, Arc<FinalityTracker>> {
        self.finality_trackers
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect()
    }

    /// Health check for all chains
    pub async fn health_check(&self) -> Vec<(u64, bool)> {
        let clients: Vec<(u64, Arc<dyn ChainClient>)> = self
            .clients
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();

        let mut results = Vec::new();
        for (chain_id, client) in clients {
            let healthy = client.health_check().await;
            if !healthy {
                warn!("Chain {} health check failed", chain_id);
            }
            crate::metrics::record_chain_health(chain_id, healthy);
            results.push((chain_id, healthy));
        }
        results.sort_by_key(|(id, _)| *id);
        results
    }

    pub fn watcher_states(&self) -> Vec<(u64, WatcherState)> {
        let mut states: Vec<_> = self
            .watchers
            .iter()
            .map(|e| (*e.key(), e.value().state()))
            .collect();
        states.sort_by_key(|(id, _)| *id);
        states
    }

    /// Get all connected chain IDs
    pub fn connected_chains(&self) -> Vec<u64> {
        let mut chains: Vec<u64> = self.clients.iter().map(|e| *e.key()).collect();
        chains.sort_unstable();
        chains
    }
}


#[cfg(test)]
mod tests {
    use super::fake::FakeChainClient;
    use super::*;
    use crate::store::MemoryStore;
    use ethers::types::Address;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn options() -> WatcherOptions {
        WatcherOptions {
            catch_up_blocks: 100,
            poll_interval: Duration::from_millis(10),
            retry_initial: Duration::from_millis(5),
            retry_max: Duration::from_millis(20),
        }
    }

    #[tokio::test]
    async fn test_manager_health_and_lookup() {
        let manager = ChainManager::empty(Arc::new(MemoryStore::new()));
        let healthy = FakeChainClient::polling(1, 10);
        let broken = FakeChainClient::polling(10, 10);
        broken.healthy.store(false, Ordering::SeqCst);

        for client in [healthy, broken] {
            let chain_id = client.chain_id();
            let parser =
                EventParser::new(chain_id, Address::repeat_byte(0xfa), Address::repeat_byte(0x1f));
            manager.add_chain(client, parser, options(), 1);
        }

        assert_eq!(manager.connected_chains(), vec![1, 10]);
        assert_eq!(manager.health_check().await, vec![(1, true), (10, false)]);
        assert!(manager.client(1).is_ok());
        assert!(matches!(
            manager.client(5),
            Err(ResolverError::ChainNotFound { chain_id: 5 })
        ));
        assert_eq!(manager.finality_trackers().len(), 2);
        assert!(manager
            .watcher_states()
            .iter()
            .all(|(_, s)| *s == WatcherState::Stopped));

        // stopping watchers that never started is fine
        manager.stop().await;
        manager.stop().await;
    }
}
