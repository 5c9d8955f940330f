//! Chain event watcher
//!
//! One watcher per chain, moving through `Stopped -> CatchingUp -> Live`. Each watch
//! cycle opens the live subscription first, then replays the last `catch_up_blocks`
//! blocks, so nothing mined between the head query and the subscription is missed.
//! The same log may therefore be delivered twice; de-duplication is left to the
//! consumer. A failed cycle is logged and retried with backoff until stopped.
//!
//! Every watcher keeps a block cursor in the store (`watcher_cursor:<chain id>`), the
//! last block whose logs were all delivered. Catch-up starts at whichever is older,
//! the block after the cursor or the start of the catch-up window, so an outage of
//! any length is replayed in full.

use crate::chain::ChainClient;
use crate::config::{ChainConfig, ResolverConfig};
use crate::error::{ResolverError, ResolverResult};
use crate::events::{self, EventParser, SwapEvent};
use crate::retry::RetryPolicy;
use crate::store::{self, KvStore};

use ethers::types::Log;
use futures::StreamExt;
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Largest block range requested in one log query
const MAX_POLL_RANGE: u64 = 1_000;

const CURSOR_PREFIX: &str = "watcher_cursor:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WatcherState {
    Stopped,
    CatchingUp,
    Live,
}

impl WatcherState {
    fn gauge(self) -> u8 {
        match self {
            WatcherState::Stopped => 0,
            WatcherState::CatchingUp => 1,
            WatcherState::Live => 2,
        }
    }
}

impl fmt::Display for WatcherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WatcherState::Stopped => "stopped",
            WatcherState::CatchingUp => "catching_up",
            WatcherState::Live => "live",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct WatcherOptions {
    pub catch_up_blocks: u64,
    /// Used when the client has no streaming transport
    pub poll_interval: Duration,
    pub retry_initial: Duration,
    pub retry_max: Duration,
}

impl WatcherOptions {
    pub fn from_config(chain: &ChainConfig, resolver: &ResolverConfig) -> Self {
        Self {
            catch_up_blocks: chain.catch_up_blocks,
            poll_interval: chain.poll_interval(),
            retry_initial: Duration::from_millis(resolver.retry_delay_ms),
            retry_max: Duration::from_millis(resolver.max_retry_delay_ms),
        }
    }
}

/// Why a watch cycle ended without an error
enum CycleEnd {
    Shutdown,
    /// The consumer dropped its receiver
    ConsumerGone,
}

pub struct ChainWatcher {
    chain_id: u64,
    client: Arc<dyn ChainClient>,
    parser: EventParser,
    options: WatcherOptions,
    store: Arc<dyn KvStore>,
    state: watch::Sender<WatcherState>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ChainWatcher {
    pub fn new(
        client: Arc<dyn ChainClient>,
        parser: EventParser,
        options: WatcherOptions,
        store: Arc<dyn KvStore>,
    ) -> Self {
        let (state, _) = watch::channel(WatcherState::Stopped);
        let (shutdown, _) = watch::channel(false);
        Self {
            chain_id: client.chain_id(),
            client,
            parser,
            options,
            store,
            state,
            shutdown,
            task: Mutex::new(None),
        }
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn state(&self) -> WatcherState {
        *self.state.borrow()
    }

    pub fn is_running(&self) -> bool {
        match self.task.lock() {
            Ok(task) => task.as_ref().map_or(false, |t| !t.is_finished()),
            Err(_) => false,
        }
    }

    /// Follow state changes
    pub fn subscribe_state(&self) -> watch::Receiver<WatcherState> {
        self.state.subscribe()
    }

    /// Spawn the watch loop. A watcher that is already running is left alone.
    pub fn start(self: &Arc<Self>, events: mpsc::Sender<SwapEvent>) {
        let mut task = match self.task.lock() {
            Ok(task) => task,
            Err(poisoned) => poisoned.into_inner(),
        };
        if task.as_ref().map_or(false, |t| !t.is_finished()) {
            debug!("Watcher for chain {} already running", self.chain_id);
            return;
        }

        self.shutdown.send_replace(false);
        let shutdown = self.shutdown.subscribe();
        let watcher = self.clone();
        *task = Some(tokio::spawn(async move {
            watcher.run(events, shutdown).await;
        }));
    }

    /// Stop the watch loop and wait for it to release its subscription
    ///
    /// Idempotent: stopping a stopped watcher returns immediately.
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);
        let task = match self.task.lock() {
            Ok(mut task) => task.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("Watcher task for chain {} panicked: {}", self.chain_id, e);
            }
            info!("Watcher for chain {} stopped", self.chain_id);
        }
        self.set_state(WatcherState::Stopped);
    }

    async fn run(&self, events: mpsc::Sender<SwapEvent>, mut shutdown: watch::Receiver<bool>) {
        let mut retry = RetryPolicy::new(self.options.retry_initial, self.options.retry_max);

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.watch_cycle(&events, &mut shutdown, &mut retry).await {
                Ok(CycleEnd::Shutdown) => break,
                Ok(CycleEnd::ConsumerGone) => {
                    info!("Event consumer gone, watcher for chain {} exiting", self.chain_id);
                    break;
                }
                Err(e) => {
                    let delay = retry.next_delay();
                    warn!(
                        "Watcher for chain {} failed: {}, retrying in {:?}",
                        self.chain_id, e, delay
                    );
                    crate::metrics::record_chain_health(self.chain_id, false);
                    self.set_state(WatcherState::CatchingUp);

                    tokio::select! {
                        _ = shutdown.changed() => {}
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        self.set_state(WatcherState::Stopped);
    }

    async fn watch_cycle(
        &self,
        events: &mpsc::Sender<SwapEvent>,
        shutdown: &mut watch::Receiver<bool>,
        retry: &mut RetryPolicy,
    ) -> ResolverResult<CycleEnd> {
        self.set_state(WatcherState::CatchingUp);

        let filter = events::watch_filter();
        let head = self.client.block_number().await?;
        let live = self.client.subscribe_logs(&filter).await?;

        let window_start = head.saturating_sub(self.options.catch_up_blocks);
        let from = match self.cursor().await? {
            Some(cursor) if cursor < window_start => {
                warn!(
                    "Chain {} resuming from block {}, {} blocks before the catch-up window",
                    self.chain_id,
                    cursor + 1,
                    window_start - cursor - 1
                );
                cursor + 1
            }
            _ => window_start,
        };
        info!(
            "Chain {} catching up blocks {} to {}",
            self.chain_id, from, head
        );
        if let Some(end) = self.deliver_range(events, shutdown, from, head).await? {
            return Ok(end);
        }

        self.set_state(WatcherState::Live);
        crate::metrics::record_chain_health(self.chain_id, true);
        retry.reset();

        match live {
            Some(mut stream) => {
                info!("Chain {} live via subscription", self.chain_id);
                let mut cursor = head;
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => return Ok(CycleEnd::Shutdown),
                        next = stream.next() => match next {
                            Some(log) => {
                                // logs arrive in block order, so earlier blocks are done
                                let done = log
                                    .block_number
                                    .map_or(0, |b| b.as_u64())
                                    .saturating_sub(1);
                                if !self.emit(events, log).await {
                                    return Ok(CycleEnd::ConsumerGone);
                                }
                                if done > cursor {
                                    self.save_cursor(done).await?;
                                    cursor = done;
                                }
                            }
                            None => {
                                return Err(ResolverError::Subscription {
                                    chain_id: self.chain_id,
                                    message: "log stream ended".to_string(),
                                })
                            }
                        },
                    }
                }
            }
            None => {
                info!("Chain {} live via polling", self.chain_id);
                self.poll(events, shutdown, head).await
            }
        }
    }

    async fn poll(
        &self,
        events: &mpsc::Sender<SwapEvent>,
        shutdown: &mut watch::Receiver<bool>,
        mut last_block: u64,
    ) -> ResolverResult<CycleEnd> {
        loop {
            tokio::select! {
                _ = shutdown.changed() => return Ok(CycleEnd::Shutdown),
                _ = tokio::time::sleep(self.options.poll_interval) => {}
            }

            let current = self.client.block_number().await?;
            if current <= last_block {
                continue;
            }

            let from = last_block + 1;
            if let Some(end) = self.deliver_range(events, shutdown, from, current).await? {
                return Ok(end);
            }
            last_block = current;
        }
    }

    /// Deliver the logs of blocks `from..=to` in chunks, moving the cursor after each
    ///
    /// Returns early with the reason when the watcher should stop.
    async fn deliver_range(
        &self,
        events: &mpsc::Sender<SwapEvent>,
        shutdown: &watch::Receiver<bool>,
        from: u64,
        to: u64,
    ) -> ResolverResult<Option<CycleEnd>> {
        let filter = events::watch_filter();
        let mut start = from;
        while start <= to {
            if *shutdown.borrow() {
                return Ok(Some(CycleEnd::Shutdown));
            }

            let end = to.min(start.saturating_add(MAX_POLL_RANGE - 1));
            debug!("Chain {}: fetching blocks {} to {}", self.chain_id, start, end);
            let logs = self
                .client
                .get_logs(&filter.clone().from_block(start).to_block(end))
                .await?;
            for log in logs {
                if !self.emit(events, log).await {
                    return Ok(Some(CycleEnd::ConsumerGone));
                }
            }

            self.save_cursor(end).await?;
            crate::metrics::record_blocks_processed(self.chain_id, end);
            start = end + 1;
        }
        Ok(None)
    }

    /// Last block whose logs were all delivered, if any
    pub async fn cursor(&self) -> ResolverResult<Option<u64>> {
        store::load_json(self.store.as_ref(), &cursor_key(self.chain_id)).await
    }

    /// Move the cursor forward; it never moves back
    async fn save_cursor(&self, block: u64) -> ResolverResult<()> {
        if self.cursor().await?.map_or(false, |current| current >= block) {
            return Ok(());
        }
        store::save_json(self.store.as_ref(), &cursor_key(self.chain_id), &block).await
    }

    /// Normalise and forward one log. Returns false once the consumer is gone.
    async fn emit(&self, events: &mpsc::Sender<SwapEvent>, log: Log) -> bool {
        let event = match self.parser.parse_log(&log) {
            Ok(event) => event,
            Err(e) => {
                warn!("Chain {}: skipping log: {}", self.chain_id, e);
                return true;
            }
        };

        debug!(
            "Chain {} event {} at block {}",
            self.chain_id,
            event.name(),
            event.meta.block_number
        );
        crate::metrics::record_event(self.chain_id, event.name());
        events.send(event).await.is_ok()
    }

    fn set_state(&self, state: WatcherState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Watcher for chain {}: {} -> {}", self.chain_id, previous, state);
            crate::metrics::record_watcher_state(self.chain_id, state.gauge());
        }
    }
}

fn cursor_key(chain_id: u64) -> String {
    format!("{}{}", CURSOR_PREFIX, chain_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::fake::FakeChainClient;
    use crate::events::test_logs;
    use crate::events::SwapEventKind;
    use crate::store::MemoryStore;
    use ethers::types::{Address, H256};
    use std::sync::atomic::Ordering;
    use tokio::time::timeout;

    const CHAIN: u64 = 1;

    fn lop() -> Address {
        Address::repeat_byte(0x1f)
    }

    fn parser() -> EventParser {
        EventParser::new(CHAIN, Address::repeat_byte(0xfa), lop())
    }

    fn options() -> WatcherOptions {
        WatcherOptions {
            catch_up_blocks: 100,
            poll_interval: Duration::from_millis(10),
            retry_initial: Duration::from_millis(5),
            retry_max: Duration::from_millis(20),
        }
    }

    fn store() -> Arc<dyn KvStore> {
        Arc::new(MemoryStore::new())
    }

    async fn next_order(rx: &mut mpsc::Receiver<SwapEvent>) -> H256 {
        let event = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("event in time")
            .expect("channel open");
        match event.kind {
            SwapEventKind::OrderFilled { order_hash, .. } => order_hash,
            other => panic!("unexpected event {:?}", other),
        }
    }

    async fn wait_for(watcher: &ChainWatcher, wanted: WatcherState) {
        let mut states = watcher.subscribe_state();
        timeout(Duration::from_secs(2), states.wait_for(|s| *s == wanted))
            .await
            .expect("state in time")
            .expect("watcher alive");
    }

    #[tokio::test]
    async fn test_catch_up_window_then_live() {
        let (client, live) = FakeChainClient::streaming(CHAIN, 200);
        client.add_log(test_logs::order_filled(lop(), H256::repeat_byte(0x01), 50, 0));
        client.add_log(test_logs::order_filled(lop(), H256::repeat_byte(0x02), 150, 0));

        let watcher = Arc::new(ChainWatcher::new(client.clone(), parser(), options(), store()));
        assert_eq!(watcher.state(), WatcherState::Stopped);

        let (tx, mut rx) = mpsc::channel(16);
        watcher.start(tx);

        // block 50 is outside the 100 block window
        assert_eq!(next_order(&mut rx).await, H256::repeat_byte(0x02));
        wait_for(&watcher, WatcherState::Live).await;

        live.send(test_logs::order_filled(lop(), H256::repeat_byte(0x03), 201, 0))
            .unwrap();
        assert_eq!(next_order(&mut rx).await, H256::repeat_byte(0x03));

        watcher.stop().await;
        assert_eq!(watcher.state(), WatcherState::Stopped);
        // the subscription was released with the stream
        assert!(live.is_closed());

        // stop is idempotent
        watcher.stop().await;
        assert_eq!(watcher.state(), WatcherState::Stopped);
    }

    #[tokio::test]
    async fn test_redelivery_is_not_deduplicated() {
        let (client, live) = FakeChainClient::streaming(CHAIN, 200);
        let log = test_logs::order_filled(lop(), H256::repeat_byte(0x07), 199, 3);
        client.add_log(log.clone());

        let watcher = Arc::new(ChainWatcher::new(client, parser(), options(), store()));
        let (tx, mut rx) = mpsc::channel(16);
        watcher.start(tx);

        assert_eq!(next_order(&mut rx).await, H256::repeat_byte(0x07));
        live.send(log).unwrap();
        assert_eq!(next_order(&mut rx).await, H256::repeat_byte(0x07));

        watcher.stop().await;
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let (client, _live) = FakeChainClient::streaming(CHAIN, 200);
        client.fail_block_number(3);
        client.add_log(test_logs::order_filled(lop(), H256::repeat_byte(0x01), 180, 0));

        let watcher = Arc::new(ChainWatcher::new(client.clone(), parser(), options(), store()));
        let (tx, mut rx) = mpsc::channel(16);
        watcher.start(tx);

        assert_eq!(next_order(&mut rx).await, H256::repeat_byte(0x01));
        wait_for(&watcher, WatcherState::Live).await;
        assert_eq!(client.subscriptions.load(Ordering::SeqCst), 1);

        watcher.stop().await;
    }

    #[tokio::test]
    async fn test_polling_fallback_picks_up_new_blocks() {
        let client = FakeChainClient::polling(CHAIN, 100);
        let watcher = Arc::new(ChainWatcher::new(client.clone(), parser(), options(), store()));
        let (tx, mut rx) = mpsc::channel(16);
        watcher.start(tx);
        wait_for(&watcher, WatcherState::Live).await;

        client.add_log(test_logs::order_filled(lop(), H256::repeat_byte(0x09), 105, 0));
        client.set_head(110);
        assert_eq!(next_order(&mut rx).await, H256::repeat_byte(0x09));

        watcher.stop().await;
        assert_eq!(watcher.state(), WatcherState::Stopped);
    }

    #[tokio::test]
    async fn test_outage_longer_than_window_is_replayed() {
        let client = FakeChainClient::polling(CHAIN, 100);
        let watcher = Arc::new(ChainWatcher::new(client.clone(), parser(), options(), store()));
        let (tx, mut rx) = mpsc::channel(16);
        watcher.start(tx);
        wait_for(&watcher, WatcherState::Live).await;
        assert_eq!(watcher.cursor().await.unwrap(), Some(100));

        // the next poll fails while the chain moves well past the catch-up window
        client.fail_block_number(1);
        client.add_log(test_logs::order_filled(lop(), H256::repeat_byte(0x15), 150, 0));
        client.set_head(500);

        assert_eq!(next_order(&mut rx).await, H256::repeat_byte(0x15));
        watcher.stop().await;
        assert_eq!(watcher.cursor().await.unwrap(), Some(500));
    }

    #[tokio::test]
    async fn test_restart_resumes_from_stored_cursor() {
        let store = store();
        let client = FakeChainClient::polling(CHAIN, 100);
        let first = Arc::new(ChainWatcher::new(client.clone(), parser(), options(), store.clone()));
        let (tx, _rx) = mpsc::channel(16);
        first.start(tx);
        wait_for(&first, WatcherState::Live).await;
        first.stop().await;

        // already behind the cursor, never replayed
        client.add_log(test_logs::order_filled(lop(), H256::repeat_byte(0x01), 20, 0));
        // several query chunks behind the new head
        client.add_log(test_logs::order_filled(lop(), H256::repeat_byte(0x02), 1_700, 0));
        client.add_log(test_logs::order_filled(lop(), H256::repeat_byte(0x03), 2_450, 0));
        client.set_head(2_500);

        let second = Arc::new(ChainWatcher::new(client, parser(), options(), store));
        let (tx, mut rx) = mpsc::channel(16);
        second.start(tx);

        assert_eq!(next_order(&mut rx).await, H256::repeat_byte(0x02));
        assert_eq!(next_order(&mut rx).await, H256::repeat_byte(0x03));
        second.stop().await;
        assert_eq!(second.cursor().await.unwrap(), Some(2_500));
    }

    #[tokio::test]
    async fn test_unparseable_logs_are_skipped() {
        let (client, _live) = FakeChainClient::streaming(CHAIN, 200);
        // order fill emitted by an unknown contract
        client.add_log(test_logs::order_filled(
            Address::repeat_byte(0x99),
            H256::repeat_byte(0x01),
            190,
            0,
        ));
        client.add_log(test_logs::order_filled(lop(), H256::repeat_byte(0x02), 191, 0));

        let watcher = Arc::new(ChainWatcher::new(client, parser(), options(), store()));
        let (tx, mut rx) = mpsc::channel(16);
        watcher.start(tx);

        assert_eq!(next_order(&mut rx).await, H256::repeat_byte(0x02));
        watcher.stop().await;
    }

    #[tokio::test]
    async fn test_watcher_exits_when_consumer_dropped() {
        let (client, _live) = FakeChainClient::streaming(CHAIN, 200);
        client.add_log(test_logs::order_filled(lop(), H256::repeat_byte(0x01), 190, 0));

        let watcher = Arc::new(ChainWatcher::new(client, parser(), options(), store()));
        let (tx, rx) = mpsc::channel(16);
        drop(rx);
        watcher.start(tx);

        timeout(Duration::from_secs(2), async {
            while watcher.is_running() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("watcher exits");
        assert_eq!(watcher.state(), WatcherState::Stopped);
        watcher.stop().await;
    }
}
