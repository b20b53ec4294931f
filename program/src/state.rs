// Raffle Ticket Allocation - Records
use borsh::{BorshDeserialize, BorshSerialize};
use solana_program::{clock::UnixTimestamp, hash::Hash, pubkey::Pubkey};
use std::convert::TryFrom;

pub type UserId = Pubkey;
pub type RaffleId = u64;
pub type TicketNumber = u32;
pub type BindingId = u64;
pub type CreditBatchId = u64;

/// One pre-generated number of the global pool
#[derive(BorshSerialize, BorshDeserialize, Debug, Clone, PartialEq)]
pub struct Ticket {
    /// Sequential number, starting at 0
    pub number: TicketNumber,
    /// Zero-padded display form of the number
    pub label: String,
    /// When the pool was seeded
    pub created_at: UnixTimestamp,
    /// Administrative soft-delete marker
    pub deleted_at: Option<UnixTimestamp>,
}

/// Status of a raffle binding
#[derive(BorshSerialize, BorshDeserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum BindingStatus {
    /// Reserved but not settled
    Pending,
    /// Settled and taking part in the draw
    Confirmed,
    /// Drawn as the raffle winner
    Winner,
    /// Released back to the pool
    Cancelled,
}

impl BindingStatus {
    /// Holder may still release the binding
    pub fn is_cancellable(self) -> bool {
        matches!(self, BindingStatus::Pending | BindingStatus::Confirmed)
    }

    /// Binding still occupies its ticket number within the raffle
    pub fn is_held(self) -> bool {
        self != BindingStatus::Cancelled
    }
}

impl TryFrom<u8> for BindingStatus {
    type Error = &'static str;

    fn try_from(val: u8) -> Result<Self, Self::Error> {
        match val {
            0 => Ok(BindingStatus::Pending),
            1 => Ok(BindingStatus::Confirmed),
            2 => Ok(BindingStatus::Winner),
            3 => Ok(BindingStatus::Cancelled),
            _ => Err("Invalid binding status"),
        }
    }
}

impl From<BindingStatus> for u8 {
    fn from(status: BindingStatus) -> Self {
        match status {
            BindingStatus::Pending => 0,
            BindingStatus::Confirmed => 1,
            BindingStatus::Winner => 2,
            BindingStatus::Cancelled => 3,
        }
    }
}

/// What paid for a binding, so a cancellation can refund it exactly
#[derive(BorshSerialize, BorshDeserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Funding {
    /// One credit taken from this ticket-credit batch
    TicketCredits { batch_id: CreditBatchId },
    /// Paid from the currency wallet at this unit price
    Currency { unit_price: u64 },
}

/// User U holds ticket T in raffle R
#[derive(BorshSerialize, BorshDeserialize, Debug, Clone, PartialEq)]
pub struct RaffleTicket {
    /// Internal sequential id
    pub id: BindingId,
    /// Identifier handed out to clients
    pub external_id: Hash,
    /// Holder of the ticket
    pub user: UserId,
    /// Raffle the ticket is bound to
    pub raffle_id: RaffleId,
    /// Number drawn from the pool
    pub ticket_number: TicketNumber,
    /// Lifecycle status
    pub status: BindingStatus,
    /// Source of funds
    pub funding: Funding,
    /// Creation time
    pub created_at: UnixTimestamp,
    /// Tombstone set on cancellation
    pub deleted_at: Option<UnixTimestamp>,
}

impl RaffleTicket {
    pub fn is_held(&self) -> bool {
        self.status.is_held()
    }
}

/// A batch of ticket credits bought through a plan
#[derive(BorshSerialize, BorshDeserialize, Debug, Clone, PartialEq)]
pub struct WalletTicket {
    pub id: CreditBatchId,
    pub user: UserId,
    /// Eligibility level of the batch
    pub level: u8,
    /// Credits granted by the plan
    pub total: u64,
    /// Credits consumed so far, normal credits first, then bonus
    pub used: u64,
    /// Extra credits granted on top of the plan
    pub bonus: u64,
    pub created_at: UnixTimestamp,
}

impl WalletTicket {
    /// `total - used + bonus`
    pub fn available(&self) -> u64 {
        self.total.saturating_add(self.bonus).saturating_sub(self.used)
    }

    /// Normal (non-bonus) credits still unused
    pub fn normal_remaining(&self) -> u64 {
        self.total.saturating_sub(self.used)
    }

    /// Bonus credits still unused
    pub fn bonus_remaining(&self) -> u64 {
        self.available() - self.normal_remaining()
    }

    /// Take up to `wanted` credits, normal before bonus. Returns how many were taken.
    pub fn consume(&mut self, wanted: u64) -> u64 {
        let normal = wanted.min(self.normal_remaining());
        let bonus = (wanted - normal).min(self.bonus_remaining());
        self.used += normal + bonus;
        normal + bonus
    }

    /// Give back up to `count` consumed credits. Returns how many were restored.
    pub fn restore(&mut self, count: u64) -> u64 {
        let restored = count.min(self.used);
        self.used -= restored;
        restored
    }
}

/// Currency wallet, amounts in minor units
#[derive(BorshSerialize, BorshDeserialize, Debug, Clone, Default, PartialEq)]
pub struct Wallet {
    pub user: UserId,
    pub balance: u64,
    /// Funds held by pending withdrawals and orders
    pub blocked: u64,
}

impl Wallet {
    pub fn new(user: UserId) -> Self {
        Self {
            user,
            balance: 0,
            blocked: 0,
        }
    }

    /// `balance - blocked`
    pub fn available_balance(&self) -> u64 {
        self.balance.saturating_sub(self.blocked)
    }
}
