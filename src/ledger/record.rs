//! Swap record, lifecycle states and patches

use chrono::{DateTime, Utc};
use ethers::types::{Address, H256, U256};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of a swap
///
/// Transient states advance in declaration order except the two withdrawal states,
/// which share a rank because either side may withdraw first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SwapStatus {
    Created,
    OrderFilled,
    SourceEscrowCreated,
    AliceDeposited,
    DestEscrowCreated,
    BobDeposited,
    SecretRevealed,
    SourceWithdrawn,
    DestWithdrawn,
    Completed,
    Failed,
    Expired,
}

impl SwapStatus {
    pub const ALL: [SwapStatus; 12] = [
        SwapStatus::Created,
        SwapStatus::OrderFilled,
        SwapStatus::SourceEscrowCreated,
        SwapStatus::AliceDeposited,
        SwapStatus::DestEscrowCreated,
        SwapStatus::BobDeposited,
        SwapStatus::SecretRevealed,
        SwapStatus::SourceWithdrawn,
        SwapStatus::DestWithdrawn,
        SwapStatus::Completed,
        SwapStatus::Failed,
        SwapStatus::Expired,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SwapStatus::Completed | SwapStatus::Failed | SwapStatus::Expired
        )
    }

    /// Position on the happy path. Terminal failure states have no rank.
    pub fn rank(self) -> Option<u8> {
        match self {
            SwapStatus::Created => Some(0),
            SwapStatus::OrderFilled => Some(1),
            SwapStatus::SourceEscrowCreated => Some(2),
            SwapStatus::AliceDeposited => Some(3),
            SwapStatus::DestEscrowCreated => Some(4),
            SwapStatus::BobDeposited => Some(5),
            SwapStatus::SecretRevealed => Some(6),
            SwapStatus::SourceWithdrawn | SwapStatus::DestWithdrawn => Some(7),
            SwapStatus::Completed => Some(8),
            SwapStatus::Failed | SwapStatus::Expired => None,
        }
    }

    /// Whether `self -> to` is allowed. Re-entering the current state is allowed so a
    /// patch can be applied without moving.
    pub fn can_transition_to(self, to: SwapStatus) -> bool {
        if self == to {
            return true;
        }
        if self.is_terminal() {
            return false;
        }
        match (self.rank(), to.rank()) {
            (_, None) => true,
            (Some(from), Some(to)) => to >= from,
            (None, Some(_)) => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SwapStatus::Created => "CREATED",
            SwapStatus::OrderFilled => "ORDER_FILLED",
            SwapStatus::SourceEscrowCreated => "SOURCE_ESCROW_CREATED",
            SwapStatus::AliceDeposited => "ALICE_DEPOSITED",
            SwapStatus::DestEscrowCreated => "DEST_ESCROW_CREATED",
            SwapStatus::BobDeposited => "BOB_DEPOSITED",
            SwapStatus::SecretRevealed => "SECRET_REVEALED",
            SwapStatus::SourceWithdrawn => "SOURCE_WITHDRAWN",
            SwapStatus::DestWithdrawn => "DEST_WITHDRAWN",
            SwapStatus::Completed => "COMPLETED",
            SwapStatus::Failed => "FAILED",
            SwapStatus::Expired => "EXPIRED",
        }
    }
}

impl fmt::Display for SwapStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Source,
    Destination,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Source => f.write_str("source"),
            Side::Destination => f.write_str("destination"),
        }
    }
}

/// One chain's half of a swap
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapSide {
    pub chain_id: u64,
    pub token: Address,
    pub amount: U256,
    pub escrow: Option<Address>,
    pub escrow_created_at: Option<DateTime<Utc>>,
    pub deposited_at: Option<DateTime<Utc>>,
    pub withdrawn_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapRecord {
    pub order_hash: H256,
    pub hashlock: H256,
    pub status: SwapStatus,
    /// Maker
    pub alice: Address,
    /// Taker
    pub bob: Address,
    pub src: SwapSide,
    pub dst: SwapSide,
    pub secret: Option<H256>,
    pub secret_revealed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub last_update_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl SwapRecord {
    /// New record in `CREATED`; unknown fields are zero
    pub fn new(order_hash: H256, now: DateTime<Utc>) -> Self {
        Self {
            order_hash,
            hashlock: H256::zero(),
            status: SwapStatus::Created,
            alice: Address::zero(),
            bob: Address::zero(),
            src: SwapSide::default(),
            dst: SwapSide::default(),
            secret: None,
            secret_revealed_at: None,
            last_error: None,
            retry_count: 0,
            created_at: now,
            last_update_at: now,
            completed_at: None,
        }
    }

    pub fn side(&self, side: Side) -> &SwapSide {
        match side {
            Side::Source => &self.src,
            Side::Destination => &self.dst,
        }
    }

    /// Which side an escrow on `chain_id` belongs to
    pub fn side_of_escrow(&self, chain_id: u64, escrow: Address) -> Option<Side> {
        if self.src.escrow == Some(escrow) && self.src.chain_id == chain_id {
            Some(Side::Source)
        } else if self.dst.escrow == Some(escrow) && self.dst.chain_id == chain_id {
            Some(Side::Destination)
        } else {
            None
        }
    }

    pub fn both_withdrawn(&self) -> bool {
        self.src.withdrawn_at.is_some() && self.dst.withdrawn_at.is_some()
    }

    /// Source escrow is funded and the destination escrow still has to be created
    pub fn is_awaiting_destination_escrow(&self) -> bool {
        self.status == SwapStatus::AliceDeposited
            && self.src.escrow.is_some()
            && self.dst.escrow.is_none()
    }

    /// Both escrows are funded and the known secret has not been revealed yet
    pub fn is_awaiting_secret_reveal(&self) -> bool {
        self.status == SwapStatus::BobDeposited
            && self.dst.escrow.is_some()
            && self.secret.is_some()
            && self.secret_revealed_at.is_none()
    }

    /// Sides that can be withdrawn now
    ///
    /// The source side opens once the secret is revealed, and stays open when the
    /// maker withdrew on the destination chain first.
    pub fn pending_withdrawals(&self) -> Vec<Side> {
        let mut sides = Vec::new();
        if self.status.is_terminal() {
            return sides;
        }
        if matches!(
            self.status,
            SwapStatus::SecretRevealed | SwapStatus::DestWithdrawn
        )
            && self.src.escrow.is_some()
            && self.secret.is_some()
            && self.src.withdrawn_at.is_none()
        {
            sides.push(Side::Source);
        }
        if self.secret_revealed_at.is_some()
            && self.dst.escrow.is_some()
            && self.dst.withdrawn_at.is_none()
        {
            sides.push(Side::Destination);
        }
        sides
    }

    pub fn is_awaiting_withdrawal(&self) -> bool {
        !self.pending_withdrawals().is_empty()
    }

    /// Merge a patch into this record
    ///
    /// Identity fields fill in zero values; milestone timestamps are set once and keep
    /// the first observation. A conflicting escrow, hashlock or secret is an error and
    /// leaves the record half-merged, so callers merge into a copy.
    pub fn merge(&mut self, patch: &SwapPatch) -> Result<(), String> {
        if let Some(hashlock) = patch.hashlock {
            if self.hashlock.is_zero() {
                self.hashlock = hashlock;
            } else if self.hashlock != hashlock {
                return Err(format!(
                    "hashlock {:?} conflicts with recorded {:?}",
                    hashlock, self.hashlock
                ));
            }
        }
        fill_address(&mut self.alice, patch.alice);
        fill_address(&mut self.bob, patch.bob);
        self.src.merge(&patch.src, "source")?;
        self.dst.merge(&patch.dst, "destination")?;

        if let Some(secret) = patch.secret {
            match self.secret {
                None => self.secret = Some(secret),
                Some(known) if known != secret => {
                    return Err("secret conflicts with the recorded secret".to_string())
                }
                Some(_) => {}
            }
        }
        set_once(&mut self.secret_revealed_at, patch.secret_revealed_at);

        if let Some(ref error) = patch.last_error {
            self.last_error = Some(error.clone());
        }
        if let Some(count) = patch.retry_count {
            self.retry_count = count;
        }
        Ok(())
    }
}

impl SwapSide {
    fn merge(&mut self, patch: &SidePatch, label: &str) -> Result<(), String> {
        if let Some(chain_id) = patch.chain_id {
            if self.chain_id == 0 {
                self.chain_id = chain_id;
            }
        }
        fill_address(&mut self.token, patch.token);
        if let Some(amount) = patch.amount {
            if self.amount.is_zero() {
                self.amount = amount;
            }
        }
        if let Some(escrow) = patch.escrow {
            match self.escrow {
                None => self.escrow = Some(escrow),
                Some(known) if known != escrow => {
                    return Err(format!(
                        "{} escrow {:?} conflicts with recorded {:?}",
                        label, escrow, known
                    ))
                }
                Some(_) => {}
            }
        }
        set_once(&mut self.escrow_created_at, patch.escrow_created_at);
        set_once(&mut self.deposited_at, patch.deposited_at);
        set_once(&mut self.withdrawn_at, patch.withdrawn_at);
        Ok(())
    }
}

fn fill_address(field: &mut Address, value: Option<Address>) {
    if let Some(value) = value {
        if field.is_zero() {
            *field = value;
        }
    }
}

fn set_once(field: &mut Option<DateTime<Utc>>, value: Option<DateTime<Utc>>) {
    if field.is_none() {
        *field = value;
    }
}

/// Partial update for one side of a swap
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SidePatch {
    pub chain_id: Option<u64>,
    pub token: Option<Address>,
    pub amount: Option<U256>,
    pub escrow: Option<Address>,
    pub escrow_created_at: Option<DateTime<Utc>>,
    pub deposited_at: Option<DateTime<Utc>>,
    pub withdrawn_at: Option<DateTime<Utc>>,
}

/// Partial update for a swap record; `None` leaves a field alone
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SwapPatch {
    pub hashlock: Option<H256>,
    pub alice: Option<Address>,
    pub bob: Option<Address>,
    pub src: SidePatch,
    pub dst: SidePatch,
    pub secret: Option<H256>,
    pub secret_revealed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub retry_count: Option<u32>,
}

impl SwapPatch {
    pub fn side_mut(&mut self, side: Side) -> &mut SidePatch {
        match side {
            Side::Source => &mut self.src,
            Side::Destination => &mut self.dst,
        }
    }

    /// Patch recording a withdrawal on `side`
    pub fn withdrawn(side: Side, at: DateTime<Utc>) -> Self {
        let mut patch = Self::default();
        patch.side_mut(side).withdrawn_at = Some(at);
        patch
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_rules() {
        use SwapStatus::*;
        assert!(Created.can_transition_to(OrderFilled));
        assert!(Created.can_transition_to(AliceDeposited));
        assert!(SourceWithdrawn.can_transition_to(DestWithdrawn));
        assert!(DestWithdrawn.can_transition_to(SourceWithdrawn));
        assert!(BobDeposited.can_transition_to(Failed));
        assert!(OrderFilled.can_transition_to(Expired));
        assert!(!AliceDeposited.can_transition_to(OrderFilled));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Created));
        assert!(!Expired.can_transition_to(Completed));
        assert!(Completed.can_transition_to(Completed));
    }

    #[test]
    fn test_status_serialises_screaming_snake() {
        let json = serde_json::to_string(&SwapStatus::SourceEscrowCreated).unwrap();
        assert_eq!(json, "\"SOURCE_ESCROW_CREATED\"");
        for status in SwapStatus::ALL {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json.trim_matches('"'), status.as_str());
        }
    }

    #[test]
    fn test_merge_fills_zero_fields_and_keeps_first_timestamps() {
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::seconds(5);
        let mut record = SwapRecord::new(H256::repeat_byte(0xaa), t0);

        let mut patch = SwapPatch {
            alice: Some(Address::repeat_byte(0x0a)),
            ..Default::default()
        };
        patch.src.withdrawn_at = Some(t0);
        record.merge(&patch).unwrap();

        let mut later = SwapPatch {
            alice: Some(Address::repeat_byte(0x0f)),
            ..Default::default()
        };
        later.src.withdrawn_at = Some(t1);
        record.merge(&later).unwrap();

        assert_eq!(record.alice, Address::repeat_byte(0x0a));
        assert_eq!(record.src.withdrawn_at, Some(t0));
    }

    #[test]
    fn test_merge_rejects_conflicting_escrow_and_secret() {
        let mut record = SwapRecord::new(H256::repeat_byte(0xaa), Utc::now());
        let mut patch = SwapPatch::default();
        patch.dst.escrow = Some(Address::repeat_byte(0xe1));
        patch.secret = Some(H256::repeat_byte(0x01));
        record.merge(&patch).unwrap();

        let mut conflicting = SwapPatch::default();
        conflicting.dst.escrow = Some(Address::repeat_byte(0xe2));
        assert!(record.clone().merge(&conflicting).is_err());

        let other_secret = SwapPatch {
            secret: Some(H256::repeat_byte(0x02)),
            ..Default::default()
        };
        assert!(record.merge(&other_secret).is_err());
    }

    #[test]
    fn test_withdrawal_predicates() {
        let now = Utc::now();
        let mut record = SwapRecord::new(H256::repeat_byte(0xaa), now);
        record.status = SwapStatus::SecretRevealed;
        record.src.escrow = Some(Address::repeat_byte(0xe1));
        record.dst.escrow = Some(Address::repeat_byte(0xe2));
        record.secret = Some(H256::repeat_byte(0x5e));
        record.secret_revealed_at = Some(now);
        assert_eq!(
            record.pending_withdrawals(),
            vec![Side::Source, Side::Destination]
        );

        record.status = SwapStatus::DestWithdrawn;
        record.dst.withdrawn_at = Some(now);
        assert_eq!(record.pending_withdrawals(), vec![Side::Source]);

        record.status = SwapStatus::BobDeposited;
        assert!(record.pending_withdrawals().is_empty());

        record.status = SwapStatus::SourceWithdrawn;
        record.dst.withdrawn_at = None;
        record.src.withdrawn_at = Some(now);
        assert_eq!(record.pending_withdrawals(), vec![Side::Destination]);

        record.status = SwapStatus::Failed;
        assert!(record.pending_withdrawals().is_empty());
    }
}
