//! Swap event types and log parsing
//!
//! Every log the watcher receives is normalised here into one [`SwapEvent`]: the
//! position of the log on its chain plus a tagged [`SwapEventKind`] with every required
//! field resolved. Nothing loosely typed travels past the watcher.

use crate::error::{ResolverError, ResolverResult};

use ethers::abi::{self, ParamType, Token};
use ethers::types::{Address, Filter, Log, ValueOrArray, H256, U256};
use serde::{Deserialize, Serialize};

/// Where a log sits on its chain. `(chain_id, tx_hash, log_index)` identifies it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMeta {
    pub chain_id: u64,
    pub block_number: u64,
    pub tx_hash: H256,
    pub log_index: u64,
    /// Contract that emitted the log
    pub emitter: Address,
}

/// De-duplication key for a delivered log
pub type EventKey = (u64, H256, u64);

impl EventMeta {
    pub fn key(&self) -> EventKey {
        (self.chain_id, self.tx_hash, self.log_index)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SwapEventKind {
    /// Limit order filled by the resolver
    OrderFilled {
        order_hash: H256,
        maker: Address,
        taker: Address,
        making_amount: U256,
        taking_amount: U256,
    },

    /// Factory deployed the source escrow during the post-interaction
    SrcEscrowCreated {
        order_hash: H256,
        hashlock: H256,
        escrow: Address,
        maker: Address,
        taker: Address,
        token: Address,
        amount: U256,
    },

    /// Factory deployed and funded the destination escrow
    DstEscrowCreated {
        order_hash: H256,
        hashlock: H256,
        escrow: Address,
        taker: Address,
        token: Address,
        amount: U256,
    },

    /// Post-interaction finished and the maker's tokens are in the source escrow
    PostInteractionSucceeded { order_hash: H256, escrow: Address },

    PostInteractionFailed { order_hash: H256, reason: String },

    /// An escrow released funds against the secret
    EscrowWithdrawal { hashlock: H256, secret: H256 },

    /// An escrow refunded after its cancellation deadline
    EscrowCancelled { hashlock: H256 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapEvent {
    pub meta: EventMeta,
    pub kind: SwapEventKind,
}

impl SwapEvent {
    pub fn chain_id(&self) -> u64 {
        self.meta.chain_id
    }

    /// Get event name for metrics
    pub fn name(&self) -> &'static str {
        match self.kind {
            SwapEventKind::OrderFilled { .. } => "order_filled",
            SwapEventKind::SrcEscrowCreated { .. } => "src_escrow_created",
            SwapEventKind::DstEscrowCreated { .. } => "dst_escrow_created",
            SwapEventKind::PostInteractionSucceeded { .. } => "post_interaction_succeeded",
            SwapEventKind::PostInteractionFailed { .. } => "post_interaction_failed",
            SwapEventKind::EscrowWithdrawal { .. } => "escrow_withdrawal",
            SwapEventKind::EscrowCancelled { .. } => "escrow_cancelled",
        }
    }
}

/// Event signatures and their topic hashes (keccak256 of the signature)
pub mod topics {
    use ethers::types::H256;
    use ethers::utils::keccak256;
    use lazy_static::lazy_static;

    pub const ORDER_FILLED_SIG: &str = "OrderFilled(bytes32,address,address,uint256,uint256)";
    pub const SRC_ESCROW_CREATED_SIG: &str =
        "SrcEscrowCreated(bytes32,bytes32,address,address,address,address,uint256)";
    pub const DST_ESCROW_CREATED_SIG: &str =
        "DstEscrowCreated(bytes32,bytes32,address,address,address,uint256)";
    pub const POST_INTERACTION_SUCCEEDED_SIG: &str = "PostInteractionSucceeded(bytes32,address)";
    pub const POST_INTERACTION_FAILED_SIG: &str = "PostInteractionFailed(bytes32,string)";
    pub const ESCROW_WITHDRAWAL_SIG: &str = "EscrowWithdrawal(bytes32,bytes32)";
    pub const ESCROW_CANCELLED_SIG: &str = "EscrowCancelled(bytes32)";

    lazy_static! {
        pub static ref ORDER_FILLED: H256 = topic(ORDER_FILLED_SIG);
        pub static ref SRC_ESCROW_CREATED: H256 = topic(SRC_ESCROW_CREATED_SIG);
        pub static ref DST_ESCROW_CREATED: H256 = topic(DST_ESCROW_CREATED_SIG);
        pub static ref POST_INTERACTION_SUCCEEDED: H256 = topic(POST_INTERACTION_SUCCEEDED_SIG);
        pub static ref POST_INTERACTION_FAILED: H256 = topic(POST_INTERACTION_FAILED_SIG);
        pub static ref ESCROW_WITHDRAWAL: H256 = topic(ESCROW_WITHDRAWAL_SIG);
        pub static ref ESCROW_CANCELLED: H256 = topic(ESCROW_CANCELLED_SIG);
    }

    fn topic(signature: &str) -> H256 {
        H256::from(keccak256(signature.as_bytes()))
    }

    /// Every topic the watcher subscribes to
    pub fn all() -> Vec<H256> {
        vec![
            *ORDER_FILLED,
            *SRC_ESCROW_CREATED,
            *DST_ESCROW_CREATED,
            *POST_INTERACTION_SUCCEEDED,
            *POST_INTERACTION_FAILED,
            *ESCROW_WITHDRAWAL,
            *ESCROW_CANCELLED,
        ]
    }
}

/// Log filter matching the watched event set
///
/// Escrow clones have no fixed address, so the filter selects by topic only and
/// [`EventParser`] checks the emitter of factory and order-protocol events.
pub fn watch_filter() -> Filter {
    let topic0 = ValueOrArray::Array(topics::all().into_iter().map(Some).collect());
    Filter::new().topic0(topic0)
}

/// Parses raw logs of one chain into [`SwapEvent`]s
#[derive(Debug, Clone)]
pub struct EventParser {
    chain_id: u64,
    factory: Address,
    limit_order_protocol: Address,
}

impl EventParser {
    pub fn new(chain_id: u64, factory: Address, limit_order_protocol: Address) -> Self {
        Self {
            chain_id,
            factory,
            limit_order_protocol,
        }
    }

    /// Parse a log entry into a SwapEvent
    pub fn parse_log(&self, log: &Log) -> ResolverResult<SwapEvent> {
        let meta = self.meta(log)?;
        let topic = *log
            .topics
            .first()
            .ok_or_else(|| parse_error(&meta, "log has no topics"))?;

        let kind = if topic == *topics::ORDER_FILLED {
            self.expect_emitter(&meta, self.limit_order_protocol)?;
            let data = decode_data(&meta, &[ParamType::Uint(256), ParamType::Uint(256)], log)?;
            SwapEventKind::OrderFilled {
                order_hash: indexed(&meta, log, 1)?,
                maker: indexed_address(&meta, log, 2)?,
                taker: indexed_address(&meta, log, 3)?,
                making_amount: uint(&meta, &data[0])?,
                taking_amount: uint(&meta, &data[1])?,
            }
        } else if topic == *topics::SRC_ESCROW_CREATED {
            self.expect_emitter(&meta, self.factory)?;
            let data = decode_data(
                &meta,
                &[
                    ParamType::Address,
                    ParamType::Address,
                    ParamType::Address,
                    ParamType::Address,
                    ParamType::Uint(256),
                ],
                log,
            )?;
            SwapEventKind::SrcEscrowCreated {
                order_hash: indexed(&meta, log, 1)?,
                hashlock: indexed(&meta, log, 2)?,
                escrow: address(&meta, &data[0])?,
                maker: address(&meta, &data[1])?,
                taker: address(&meta, &data[2])?,
                token: address(&meta, &data[3])?,
                amount: uint(&meta, &data[4])?,
            }
        } else if topic == *topics::DST_ESCROW_CREATED {
            self.expect_emitter(&meta, self.factory)?;
            let data = decode_data(
                &meta,
                &[
                    ParamType::Address,
                    ParamType::Address,
                    ParamType::Address,
                    ParamType::Uint(256),
                ],
                log,
            )?;
            SwapEventKind::DstEscrowCreated {
                order_hash: indexed(&meta, log, 1)?,
                hashlock: indexed(&meta, log, 2)?,
                escrow: address(&meta, &data[0])?,
                taker: address(&meta, &data[1])?,
                token: address(&meta, &data[2])?,
                amount: uint(&meta, &data[3])?,
            }
        } else if topic == *topics::POST_INTERACTION_SUCCEEDED {
            self.expect_emitter(&meta, self.factory)?;
            let data = decode_data(&meta, &[ParamType::Address], log)?;
            SwapEventKind::PostInteractionSucceeded {
                order_hash: indexed(&meta, log, 1)?,
                escrow: address(&meta, &data[0])?,
            }
        } else if topic == *topics::POST_INTERACTION_FAILED {
            self.expect_emitter(&meta, self.factory)?;
            let data = decode_data(&meta, &[ParamType::String], log)?;
            let reason = data[0]
                .clone()
                .into_string()
                .ok_or_else(|| parse_error(&meta, "expected string reason"))?;
            SwapEventKind::PostInteractionFailed {
                order_hash: indexed(&meta, log, 1)?,
                reason,
            }
        } else if topic == *topics::ESCROW_WITHDRAWAL {
            let data = decode_data(&meta, &[ParamType::FixedBytes(32)], log)?;
            SwapEventKind::EscrowWithdrawal {
                hashlock: indexed(&meta, log, 1)?,
                secret: bytes32(&meta, &data[0])?,
            }
        } else if topic == *topics::ESCROW_CANCELLED {
            SwapEventKind::EscrowCancelled {
                hashlock: indexed(&meta, log, 1)?,
            }
        } else {
            return Err(parse_error(&meta, &format!("unknown topic {:?}", topic)));
        };

        Ok(SwapEvent { meta, kind })
    }

    fn meta(&self, log: &Log) -> ResolverResult<EventMeta> {
        let missing = |field: &str| {
            ResolverError::EventParsing(format!(
                "chain {}: log from {:?} has no {}",
                self.chain_id, log.address, field
            ))
        };

        Ok(EventMeta {
            chain_id: self.chain_id,
            block_number: log
                .block_number
                .ok_or_else(|| missing("block number"))?
                .as_u64(),
            tx_hash: log.transaction_hash.ok_or_else(|| missing("transaction hash"))?,
            log_index: log.log_index.ok_or_else(|| missing("log index"))?.as_u64(),
            emitter: log.address,
        })
    }

    fn expect_emitter(&self, meta: &EventMeta, expected: Address) -> ResolverResult<()> {
        if meta.emitter != expected {
            return Err(parse_error(
                meta,
                &format!("unexpected emitter, wanted {:?}", expected),
            ));
        }
        Ok(())
    }
}

fn parse_error(meta: &EventMeta, message: &str) -> ResolverError {
    ResolverError::EventParsing(format!(
        "chain {} tx {:?} log {}: {}",
        meta.chain_id, meta.tx_hash, meta.log_index, message
    ))
}

fn decode_data(meta: &EventMeta, types: &[ParamType], log: &Log) -> ResolverResult<Vec<Token>> {
    abi::decode(types, &log.data).map_err(|e| parse_error(meta, &e.to_string()))
}

fn indexed(meta: &EventMeta, log: &Log, position: usize) -> ResolverResult<H256> {
    log.topics
        .get(position)
        .copied()
        .ok_or_else(|| parse_error(meta, &format!("missing indexed topic {}", position)))
}

fn indexed_address(meta: &EventMeta, log: &Log, position: usize) -> ResolverResult<Address> {
    indexed(meta, log, position).map(|t| Address::from_slice(&t.as_bytes()[12..]))
}

fn address(meta: &EventMeta, token: &Token) -> ResolverResult<Address> {
    token
        .clone()
        .into_address()
        .ok_or_else(|| parse_error(meta, "expected address"))
}

fn uint(meta: &EventMeta, token: &Token) -> ResolverResult<U256> {
    token
        .clone()
        .into_uint()
        .ok_or_else(|| parse_error(meta, "expected uint256"))
}

fn bytes32(meta: &EventMeta, token: &Token) -> ResolverResult<H256> {
    token
        .clone()
        .into_fixed_bytes()
        .filter(|b| b.len() == 32)
        .map(|b| H256::from_slice(&b))
        .ok_or_else(|| parse_error(meta, "expected bytes32"))
}
