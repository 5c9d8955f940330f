//! Next actions the scan loop can dispatch

use crate::ledger::{Side, SwapRecord, SwapStatus};

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    CreateDstEscrow,
    RevealSecret,
    Withdraw(Side),
}

impl Action {
    pub fn name(self) -> &'static str {
        match self {
            Action::CreateDstEscrow => "create_dst_escrow",
            Action::RevealSecret => "reveal_secret",
            Action::Withdraw(Side::Source) => "withdraw_source",
            Action::Withdraw(Side::Destination) => "withdraw_destination",
        }
    }

    /// Chain the action's transaction goes to
    pub fn chain_id(self, swap: &SwapRecord) -> u64 {
        match self {
            Action::CreateDstEscrow | Action::RevealSecret => swap.dst.chain_id,
            Action::Withdraw(side) => swap.side(side).chain_id,
        }
    }

    /// Whether the swap, as currently recorded, still needs this action
    pub fn is_due(self, swap: &SwapRecord) -> bool {
        match self {
            Action::CreateDstEscrow => swap.is_awaiting_destination_escrow(),
            Action::RevealSecret => swap.is_awaiting_secret_reveal(),
            Action::Withdraw(side) => swap.pending_withdrawals().contains(&side),
        }
    }

    /// Status a swap reaches once the action is mined
    pub fn target_status(self) -> SwapStatus {
        match self {
            Action::CreateDstEscrow => SwapStatus::DestEscrowCreated,
            Action::RevealSecret => SwapStatus::SecretRevealed,
            Action::Withdraw(Side::Source) => SwapStatus::SourceWithdrawn,
            Action::Withdraw(Side::Destination) => SwapStatus::DestWithdrawn,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
