use borsh::{BorshDeserialize, BorshSerialize};
use solana_program::{clock::UnixTimestamp, hash::Hash, msg, pubkey::Pubkey};
use std::convert::TryFrom;
use std::fmt;

use crate::cancellation::{self, RaffleRelease};
use crate::error::AllocError;
use crate::ledger::{Ledger, LockMode};
use crate::state::{BindingStatus, RaffleId, RaffleTicket, TicketNumber};
use crate::utils;

/// Status of a raffle
#[derive(BorshSerialize, BorshDeserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum RaffleStatus {
    /// Being prepared by an administrator
    Draft,
    /// Announced, not yet open
    Pending,
    /// Open for applications
    Active,
    /// Closed for applications
    Inactive,
    /// Called off; bindings were released
    Cancelled,
}

impl RaffleStatus {
    /// Allowed lifecycle moves
    pub fn can_transition_to(self, next: RaffleStatus) -> bool {
        use RaffleStatus::*;
        matches!(
            (self, next),
            (Draft, Pending)
                | (Draft, Active)
                | (Pending, Active)
                | (Pending, Inactive)
                | (Active, Inactive)
                | (Inactive, Active)
                | (Draft, Cancelled)
                | (Pending, Cancelled)
                | (Active, Cancelled)
                | (Inactive, Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RaffleStatus::Draft => "draft",
            RaffleStatus::Pending => "pending",
            RaffleStatus::Active => "active",
            RaffleStatus::Inactive => "inactive",
            RaffleStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RaffleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<u8> for RaffleStatus {
    type Error = &'static str;

    fn try_from(val: u8) -> Result<Self, Self::Error> {
        match val {
            0 => Ok(RaffleStatus::Draft),
            1 => Ok(RaffleStatus::Pending),
            2 => Ok(RaffleStatus::Active),
            3 => Ok(RaffleStatus::Inactive),
            4 => Ok(RaffleStatus::Cancelled),
            _ => Err("Invalid raffle status"),
        }
    }
}

impl From<RaffleStatus> for u8 {
    fn from(status: RaffleStatus) -> Self {
        match status {
            RaffleStatus::Draft => 0,
            RaffleStatus::Pending => 1,
            RaffleStatus::Active => 2,
            RaffleStatus::Inactive => 3,
            RaffleStatus::Cancelled => 4,
        }
    }
}

/// Raffle row
#[derive(BorshSerialize, BorshDeserialize, Debug, Clone, PartialEq)]
pub struct Raffle {
    pub id: RaffleId,
    pub title: String,
    pub description: String,
    /// Value of the prize in minor currency units
    pub prize_value: u64,
    /// Cost of running the raffle in minor currency units
    pub operation_cost: u64,
    /// Price of one ticket when paid from the currency wallet
    pub unit_ticket_price: u64,
    /// Tickets the raffle needs before the draw, 0 for no target
    pub tickets_required: u64,
    /// Non-cancelled bindings
    pub tickets_sold: u64,
    /// Smallest application accepted
    pub min_tickets_per_application: u32,
    /// Credit batches below this level cannot fund applications
    pub min_ticket_level: u8,
    /// Cap on non-cancelled bindings per user, 0 for unlimited
    pub max_tickets_per_user: u32,
    pub draw_date: UnixTimestamp,
    pub status: RaffleStatus,
    pub creator: Pubkey,
    pub winner: Option<Pubkey>,
    pub winning_ticket: Option<TicketNumber>,
    pub created_at: UnixTimestamp,
    pub deleted_at: Option<UnixTimestamp>,
}

/// Parameters of a new raffle
#[derive(Debug, Clone)]
pub struct NewRaffle {
    pub title: String,
    pub description: String,
    pub prize_value: u64,
    pub operation_cost: u64,
    pub unit_ticket_price: u64,
    pub tickets_required: u64,
    pub min_tickets_per_application: u32,
    pub min_ticket_level: u8,
    pub max_tickets_per_user: u32,
    pub draw_date: UnixTimestamp,
    pub creator: Pubkey,
}

impl Raffle {
    /// Create a new raffle in `Draft`
    pub fn new(id: RaffleId, params: NewRaffle, now: UnixTimestamp) -> Self {
        Self {
            id,
            title: params.title,
            description: params.description,
            prize_value: params.prize_value,
            operation_cost: params.operation_cost,
            unit_ticket_price: params.unit_ticket_price,
            tickets_required: params.tickets_required,
            tickets_sold: 0,
            min_tickets_per_application: params.min_tickets_per_application,
            min_ticket_level: params.min_ticket_level,
            max_tickets_per_user: params.max_tickets_per_user,
            draw_date: params.draw_date,
            status: RaffleStatus::Draft,
            creator: params.creator,
            winner: None,
            winning_ticket: None,
            created_at: now,
            deleted_at: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Only active, undeleted raffles take new bindings
    pub fn accepts_bindings(&self) -> bool {
        self.status == RaffleStatus::Active && !self.is_deleted()
    }

    /// `RaffleNotAvailable` for this raffle; deleted raffles read as missing
    pub fn not_available(&self) -> AllocError {
        AllocError::RaffleNotAvailable {
            raffle_id: self.id,
            status: if self.is_deleted() {
                None
            } else {
                Some(self.status)
            },
        }
    }

    /// Smallest application accepted, never below one ticket
    pub fn minimum_quantity(&self) -> u32 {
        self.min_tickets_per_application.max(1)
    }

    /// Tickets `user` may still add when holding `held`, None if uncapped
    pub fn remaining_allowance(&self, held: u64) -> Option<u64> {
        match self.max_tickets_per_user {
            0 => None,
            cap => Some(u64::from(cap).saturating_sub(held)),
        }
    }

    /// Tickets still needed to reach the target, None without a target
    pub fn remaining_required(&self) -> Option<u64> {
        match self.tickets_required {
            0 => None,
            required => Some(required.saturating_sub(self.tickets_sold)),
        }
    }

    /// Price of `quantity` tickets from the currency wallet
    pub fn ticket_cost(&self, quantity: u64) -> Result<u64, AllocError> {
        utils::calculate_cost(quantity, self.unit_ticket_price)
            .ok_or(AllocError::ArithmeticOverflow)
    }

    /// Move to `next` if the lifecycle allows it
    pub fn transition(&mut self, next: RaffleStatus) -> Result<RaffleStatus, AllocError> {
        let previous = self.status;
        if !previous.can_transition_to(next) {
            return Err(AllocError::InvalidStatusTransition {
                from: previous,
                to: next,
            });
        }
        self.status = next;
        Ok(previous)
    }
}

impl Ledger {
    /// Register a raffle in `Draft`
    pub fn create_raffle(&self, params: NewRaffle) -> Result<RaffleId, AllocError> {
        let now = utils::now();
        let raffle_id = self.insert_raffle(|id| Raffle::new(id, params, now))?;
        msg!("Raffle {} created", raffle_id);
        Ok(raffle_id)
    }

    /// Change the raffle status. Moving to `Cancelled` releases every
    /// binding, see [`cancellation::cancel_raffle`].
    pub fn transition_raffle(
        &self,
        raffle_id: RaffleId,
        next: RaffleStatus,
    ) -> Result<RaffleStatus, AllocError> {
        if next == RaffleStatus::Cancelled {
            let previous = self.raffle(raffle_id)?.status;
            let release: RaffleRelease = cancellation::cancel_raffle(self, raffle_id)?;
            msg!("Raffle {} cancelled, {} bindings released", raffle_id, release.released);
            return Ok(previous);
        }

        let entry = self.raffle_entry(raffle_id)?;
        // Book first so no allocation is mid-flight while the status moves
        let _book = entry.lock_book(LockMode::ForUpdate)?;
        let mut raffle = entry.write_raffle()?;
        let previous = raffle.transition(next)?;
        msg!("Raffle {}: {} -> {}", raffle_id, previous, next);
        Ok(previous)
    }

    /// Soft-delete; the raffle stops accepting applications and reads as missing
    pub fn soft_delete_raffle(&self, raffle_id: RaffleId) -> Result<(), AllocError> {
        let entry = self.raffle_entry(raffle_id)?;
        let _book = entry.lock_book(LockMode::ForUpdate)?;
        let mut raffle = entry.write_raffle()?;
        if raffle.deleted_at.is_none() {
            raffle.deleted_at = Some(utils::now());
            msg!("Raffle {} deleted", raffle_id);
        }
        Ok(())
    }

    pub fn restore_raffle(&self, raffle_id: RaffleId) -> Result<(), AllocError> {
        let entry = self.raffle_entry(raffle_id)?;
        let _book = entry.lock_book(LockMode::ForUpdate)?;
        let mut raffle = entry.write_raffle()?;
        if raffle.deleted_at.take().is_some() {
            msg!("Raffle {} restored", raffle_id);
        }
        Ok(())
    }

    /// Mark a confirmed binding as the raffle winner
    pub fn record_winner(
        &self,
        raffle_id: RaffleId,
        external_id: &Hash,
    ) -> Result<RaffleTicket, AllocError> {
        let entry = self.raffle_entry(raffle_id)?;
        let mut guard = entry.lock_book(LockMode::ForUpdate)?;
        let mut raffle = entry.write_raffle()?;
        if raffle.status == RaffleStatus::Cancelled || raffle.is_deleted() {
            return Err(raffle.not_available());
        }
        if raffle.winner.is_some() {
            return Err(AllocError::WinnerAlreadyRecorded { raffle_id });
        }

        let book = guard
            .for_update()
            .ok_or(AllocError::LockPoisoned { resource: "raffle book" })?;
        let binding = book
            .binding_by_external(external_id)
            .filter(|b| b.status == BindingStatus::Confirmed)
            .cloned()
            .ok_or(AllocError::BindingNotFound)?;
        book.set_status(binding.id, BindingStatus::Winner);

        raffle.winner = Some(binding.user);
        raffle.winning_ticket = Some(binding.ticket_number);
        msg!(
            "Raffle {} won by {} with ticket {}",
            raffle_id,
            binding.user,
            self.pool().label(binding.ticket_number)
        );

        Ok(RaffleTicket {
            status: BindingStatus::Winner,
            ..binding
        })
    }
}
