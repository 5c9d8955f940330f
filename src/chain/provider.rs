//! Chain provider with multi-RPC support and automatic failover

use crate::chain::ChainClient;
use crate::config::ChainConfig;
use crate::error::{ResolverError, ResolverResult};

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::providers::{Http, Provider, Ws};
use futures::stream::BoxStream;
use futures::StreamExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, error, info, warn};

/// Buffered live logs per subscription
const SUBSCRIPTION_BUFFER: usize = 1_024;

/// Multi-provider wrapper with automatic failover
pub struct ChainProvider {
    /// Chain configuration
    config: ChainConfig,
    /// HTTP providers (multiple for failover)
    http_providers: Vec<Provider<Http>>,
    /// Current active provider index
    current_provider: AtomicUsize,
    /// WebSocket provider (optional, for log subscriptions)
    ws_provider: RwLock<Option<Provider<Ws>>>,
}

impl ChainProvider {
    /// Create a new chain provider
    pub async fn new(config: ChainConfig) -> ResolverResult<Self> {
        let mut http_providers = Vec::new();

        // Initialize HTTP providers
        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    let provider = provider.interval(Duration::from_millis(100));
                    http_providers.push(provider);
                    debug!("Added HTTP provider for chain {}: {}", config.chain_id, url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if http_providers.is_empty() {
            return Err(ResolverError::ChainConnection {
                chain_id: config.chain_id,
                message: "No valid RPC providers".to_string(),
            });
        }

        let provider = Self {
            config,
            http_providers,
            current_provider: AtomicUsize::new(0),
            ws_provider: RwLock::new(None),
        };

        // Websocket failures are not fatal here; subscribe_logs reconnects
        if let Err(e) = provider.reconnect_ws().await {
            warn!("{}", e);
        }

        Ok(provider)
    }

    /// Get the active HTTP provider
    fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Switch to next available provider
    fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("Chain {} failover to provider {}", self.config.chain_id, next);
    }

    /// Reconnect WebSocket
    pub async fn reconnect_ws(&self) -> ResolverResult<()> {
        let Some(ws_url) = self.config.ws_url() else {
            return Ok(());
        };
        match Provider::<Ws>::connect(ws_url).await {
            Ok(provider) => {
                *self.ws_provider.write().await = Some(provider);
                info!("WebSocket connected for chain {}", self.config.chain_id);
                Ok(())
            }
            Err(e) => Err(ResolverError::Subscription {
                chain_id: self.config.chain_id,
                message: format!("WebSocket connection failed: {}", e),
            }),
        }
    }

    fn connection_error(&self, message: impl ToString) -> ResolverError {
        ResolverError::ChainConnection {
            chain_id: self.config.chain_id,
            message: message.to_string(),
        }
    }
}

#[async_trait]
impl ChainClient for ChainProvider {
    fn chain_id(&self) -> u64 {
        self.config.chain_id
    }

    /// Get current block number with failover
    async fn block_number(&self) -> ResolverResult<u64> {
        for _ in 0..self.http_providers.len() {
            match self.http().get_block_number().await {
                Ok(block) => return Ok(block.as_u64()),
                Err(e) => {
                    warn!(
                        "Failed to get block number from chain {}: {}",
                        self.config.chain_id, e
                    );
                    self.failover();
                }
            }
        }

        Err(self.connection_error("All providers failed"))
    }

    async fn get_logs(&self, filter: &Filter) -> ResolverResult<Vec<Log>> {
        for _ in 0..self.http_providers.len() {
            match self.http().get_logs(filter).await {
                Ok(logs) => return Ok(logs),
                Err(e) => {
                    warn!("Failed to get logs from chain {}: {}", self.config.chain_id, e);
                    self.failover();
                }
            }
        }

        Err(self.connection_error("All providers failed to get logs"))
    }

    /// Forward a websocket log subscription through a channel
    ///
    /// The subscription lives in its own task so the returned stream is `'static`. The
    /// task ends, and the node-side subscription is dropped, once the stream is dropped
    /// or the socket closes.
    async fn subscribe_logs(
        &self,
        filter: &Filter,
    ) -> ResolverResult<Option<BoxStream<'static, Log>>> {
        if self.config.ws_url().is_none() {
            return Ok(None);
        }
        if self.ws_provider.read().await.is_none() {
            self.reconnect_ws().await?;
        }
        let Some(ws) = self.ws_provider.read().await.clone() else {
            return Ok(None);
        };

        let chain_id = self.config.chain_id;
        let filter = filter.clone();
        let (log_tx, log_rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let (ready_tx, ready_rx) = oneshot::channel();

        tokio::spawn(async move {
            let mut stream = match ws.subscribe_logs(&filter).await {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    stream
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e.to_string()));
                    return;
                }
            };

            loop {
                tokio::select! {
                    _ = log_tx.closed() => break,
                    next = stream.next() => match next {
                        Some(log) => {
                            if log_tx.send(log).await.is_err() {
                                break;
                            }
                        }
                        None => {
                            warn!("Log subscription on chain {} ended", chain_id);
                            break;
                        }
                    },
                }
            }
            debug!("Log subscription on chain {} released", chain_id);
        });

        match ready_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(message)) => {
                // drop the stale socket so the next attempt reconnects
                *self.ws_provider.write().await = None;
                return Err(ResolverError::Subscription { chain_id, message });
            }
            Err(_) => {
                return Err(ResolverError::Subscription {
                    chain_id,
                    message: "subscription task ended".to_string(),
                })
            }
        }

        let stream = futures::stream::unfold(log_rx, |mut rx| async move {
            rx.recv().await.map(|log| (log, rx))
        });
        Ok(Some(stream.boxed()))
    }

    async fn transaction_receipt(
        &self,
        tx_hash: H256,
    ) -> ResolverResult<Option<TransactionReceipt>> {
        self.http()
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(|e| self.connection_error(e))
    }

    async fn health_check(&self) -> bool {
        match self.block_number().await {
            Ok(block) => {
                crate::metrics::record_blocks_processed(self.config.chain_id, block);
                true
            }
            Err(e) => {
                error!("Health check failed for chain {}: {}", self.config.chain_id, e);
                false
            }
        }
    }
}
