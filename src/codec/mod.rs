//! Escrow extension codec
//!
//! Encodes the escrow creation parameters that ride inside a limit order's extension
//! data and are consumed by the escrow factory's post-interaction hook. The layout is
//! the 20-byte factory address followed by fourteen 32-byte ABI words, in this order:
//!
//! | # | field                 | # | field              |
//! |---|-----------------------|---|--------------------|
//! | 1 | src escrow template   | 8 | src token          |
//! | 2 | dst escrow template   | 9 | src amount         |
//! | 3 | packed timelocks      | 10| dst token          |
//! | 4 | hashlock              | 11| dst amount         |
//! | 5 | maker                 | 12| src safety deposit |
//! | 6 | taker                 | 13| dst safety deposit |
//! | 7 | receiver              | 14| nonce              |
//!
//! Encoding is a pure function of its inputs so escrow addresses derived from it are
//! deterministic and retries are idempotent.

use ethers::abi::{self, ParamType, Token};
use ethers::types::{Address, H256, U256};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of ABI words following the factory prefix
pub const FIELD_COUNT: usize = 14;

/// Length of the factory address prefix
pub const FACTORY_PREFIX_LEN: usize = 20;

/// Minimum extension length accepted by [`decode`]
pub const MIN_EXTENSION_LEN: usize = FACTORY_PREFIX_LEN + FIELD_COUNT * 32;

/// Extension decoding errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("extension too short: expected at least {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },

    #[error("factory prefix mismatch: expected {expected:?}, found {actual:?}")]
    FactoryMismatch { expected: Address, actual: Address },

    #[error("malformed ABI payload: {0}")]
    Abi(String),
}

/// Escrow creation parameters embedded in an order extension
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowParams {
    pub src_escrow_impl: Address,
    pub dst_escrow_impl: Address,
    /// `(srcCancellationDeadline << 128) | dstWithdrawalDeadline`, see [`pack_timelocks`]
    pub timelocks: U256,
    pub hashlock: H256,
    pub maker: Address,
    pub taker: Address,
    pub receiver: Address,
    pub src_token: Address,
    pub src_amount: U256,
    pub dst_token: Address,
    pub dst_amount: U256,
    pub src_safety_deposit: U256,
    pub dst_safety_deposit: U256,
    /// Only used to make the derived escrow address unique
    pub nonce: U256,
}

/// Absolute deadlines carried in a packed timelock word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timelocks {
    pub src_cancellation: u128,
    pub dst_withdrawal: u128,
}

/// Encode `params` behind the factory address
pub fn encode(factory: Address, params: &EscrowParams) -> Vec<u8> {
    let tokens = [
        Token::Address(params.src_escrow_impl),
        Token::Address(params.dst_escrow_impl),
        Token::Uint(params.timelocks),
        Token::FixedBytes(params.hashlock.as_bytes().to_vec()),
        Token::Address(params.maker),
        Token::Address(params.taker),
        Token::Address(params.receiver),
        Token::Address(params.src_token),
        Token::Uint(params.src_amount),
        Token::Address(params.dst_token),
        Token::Uint(params.dst_amount),
        Token::Uint(params.src_safety_deposit),
        Token::Uint(params.dst_safety_deposit),
        Token::Uint(params.nonce),
    ];

    let mut out = Vec::with_capacity(MIN_EXTENSION_LEN);
    out.extend_from_slice(factory.as_bytes());
    out.extend_from_slice(&abi::encode(&tokens));
    out
}

/// Decode an extension produced by [`encode`]
///
/// Bytes beyond the fourteenth word are ignored so extensions carrying trailing
/// protocol data still decode.
pub fn decode(expected_factory: Address, data: &[u8]) -> Result<EscrowParams, CodecError> {
    if data.len() < MIN_EXTENSION_LEN {
        return Err(CodecError::TooShort {
            expected: MIN_EXTENSION_LEN,
            actual: data.len(),
        });
    }

    let factory = Address::from_slice(&data[..FACTORY_PREFIX_LEN]);
    if factory != expected_factory {
        return Err(CodecError::FactoryMismatch {
            expected: expected_factory,
            actual: factory,
        });
    }

    let types = [
        ParamType::Address,
        ParamType::Address,
        ParamType::Uint(256),
        ParamType::FixedBytes(32),
        ParamType::Address,
        ParamType::Address,
        ParamType::Address,
        ParamType::Address,
        ParamType::Uint(256),
        ParamType::Address,
        ParamType::Uint(256),
        ParamType::Uint(256),
        ParamType::Uint(256),
        ParamType::Uint(256),
    ];
    let tokens = abi::decode(&types, &data[FACTORY_PREFIX_LEN..MIN_EXTENSION_LEN])
        .map_err(|e| CodecError::Abi(e.to_string()))?;
    let mut fields = tokens.into_iter();

    Ok(EscrowParams {
        src_escrow_impl: next_address(&mut fields)?,
        dst_escrow_impl: next_address(&mut fields)?,
        timelocks: next_uint(&mut fields)?,
        hashlock: next_bytes32(&mut fields)?,
        maker: next_address(&mut fields)?,
        taker: next_address(&mut fields)?,
        receiver: next_address(&mut fields)?,
        src_token: next_address(&mut fields)?,
        src_amount: next_uint(&mut fields)?,
        dst_token: next_address(&mut fields)?,
        dst_amount: next_uint(&mut fields)?,
        src_safety_deposit: next_uint(&mut fields)?,
        dst_safety_deposit: next_uint(&mut fields)?,
        nonce: next_uint(&mut fields)?,
    })
}

fn next_address(fields: &mut impl Iterator<Item = Token>) -> Result<Address, CodecError> {
    fields
        .next()
        .and_then(Token::into_address)
        .ok_or_else(|| CodecError::Abi("expected address word".to_string()))
}

fn next_uint(fields: &mut impl Iterator<Item = Token>) -> Result<U256, CodecError> {
    fields
        .next()
        .and_then(Token::into_uint)
        .ok_or_else(|| CodecError::Abi("expected uint256 word".to_string()))
}

fn next_bytes32(fields: &mut impl Iterator<Item = Token>) -> Result<H256, CodecError> {
    fields
        .next()
        .and_then(Token::into_fixed_bytes)
        .filter(|b| b.len() == 32)
        .map(|b| H256::from_slice(&b))
        .ok_or_else(|| CodecError::Abi("expected bytes32 word".to_string()))
}

/// Pack timelocks relative to the current wall clock
pub fn pack_timelocks(src_delay_secs: u64, dst_delay_secs: u64) -> U256 {
    let now = chrono::Utc::now().timestamp().max(0) as u64;
    pack_timelocks_at(now, src_delay_secs, dst_delay_secs)
}

/// Pack `(now + srcDelay) << 128 | (now + dstDelay)`
pub fn pack_timelocks_at(now: u64, src_delay_secs: u64, dst_delay_secs: u64) -> U256 {
    pack_pair(
        now as u128 + src_delay_secs as u128,
        now as u128 + dst_delay_secs as u128,
    )
}

pub fn unpack_timelocks(word: U256) -> Timelocks {
    let (src_cancellation, dst_withdrawal) = unpack_pair(word);
    Timelocks {
        src_cancellation,
        dst_withdrawal,
    }
}

/// Pack safety deposits as `(dstDeposit << 128) | srcDeposit`
pub fn pack_deposits(src_deposit: u128, dst_deposit: u128) -> U256 {
    pack_pair(dst_deposit, src_deposit)
}

/// Returns `(srcDeposit, dstDeposit)`
pub fn unpack_deposits(word: U256) -> (u128, u128) {
    let (dst, src) = unpack_pair(word);
    (src, dst)
}

fn pack_pair(high: u128, low: u128) -> U256 {
    (U256::from(high) << 128) | U256::from(low)
}

fn unpack_pair(word: U256) -> (u128, u128) {
    ((word >> 128).low_u128(), word.low_u128())
}
