// Raffle Ticket Allocation - Allocator
use solana_program::{hash::Hash, msg};
use std::time::Instant;

use crate::config::ReapplyPolicy;
use crate::error::AllocError;
use crate::ledger::{eligible_balance, Ledger, LockMode, RaffleBook, Transaction};
use crate::raffle_state::Raffle;
use crate::state::{
    BindingId, CreditBatchId, Funding, RaffleId, RaffleTicket, TicketNumber, UserId, WalletTicket,
};
use crate::utils;

/// One ticket bound by an application
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedBinding {
    pub binding_id: BindingId,
    pub external_id: Hash,
    pub ticket_number: TicketNumber,
    /// Zero-padded display form of the number
    pub label: String,
}

/// Result of a successful application
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedTickets {
    pub raffle_id: RaffleId,
    pub user: UserId,
    pub bindings: Vec<AppliedBinding>,
    /// Ticket-credit balance across all batches after the call
    pub remaining_credits: u64,
    /// Currency taken from the wallet, 0 for credit-funded applications
    pub currency_charged: u64,
    /// Available wallet balance after the call
    pub remaining_balance: u64,
}

pub struct Allocator;

impl Allocator {
    /// Apply `quantity` tickets of `user` to a raffle, paid with ticket
    /// credits. `None` applies the raffle minimum.
    ///
    /// Preconditions are checked in a fixed order, each with its own error.
    /// Drawing, the credit decrement and the new bindings commit together
    /// under the raffle's `ForUpdate` lock or not at all.
    pub fn apply_tickets(
        ledger: &Ledger,
        user: &UserId,
        raffle_id: RaffleId,
        quantity: Option<u32>,
    ) -> Result<AppliedTickets, AllocError> {
        let entry = ledger.raffle_entry(raffle_id)?;
        let mut guard = entry.lock_book(LockMode::ForUpdate)?;
        let mut raffle = entry.write_raffle()?;
        let book = guard
            .for_update()
            .ok_or(AllocError::LockPoisoned { resource: "raffle book" })?;

        let quantity = Self::check_application(ledger, &raffle, book, user, quantity)?;
        let wanted = u64::from(quantity);

        let account = ledger.account(user)?;
        let mut credits = account.lock_credits()?;
        let held = eligible_balance(&credits, raffle.min_ticket_level);
        if held < wanted {
            msg!(
                "Insufficient ticket credits for raffle {}: held {}, required {}",
                raffle_id,
                held,
                wanted
            );
            return Err(AllocError::InsufficientTicketCredits {
                held,
                required: wanted,
            });
        }

        let numbers = ledger.pool().draw_available(book, quantity)?;

        let mut staged_credits = credits.clone();
        let sources =
            Self::decrement_credits(&mut staged_credits, raffle.min_ticket_level, wanted)?;

        let now = utils::now();
        let mut txn = Transaction::new(raffle_id);
        for (number, batch_id) in numbers.iter().zip(sources) {
            txn.stage_binding(ledger.new_binding(
                user,
                raffle_id,
                *number,
                Funding::TicketCredits { batch_id },
                now,
            ));
        }

        let created = txn.commit(ledger.pool(), book, &mut raffle, now)?;
        *credits = staged_credits;
        let remaining_credits = eligible_balance(&credits, 0);
        drop(credits);
        let remaining_balance = account.lock_wallet()?.available_balance();

        msg!(
            "Applied {} tickets of {} to raffle {}, {} credits left",
            created.len(),
            user,
            raffle_id,
            remaining_credits
        );

        Ok(AppliedTickets {
            raffle_id,
            user: *user,
            bindings: Self::describe(ledger, &created),
            remaining_credits,
            currency_charged: 0,
            remaining_balance,
        })
    }

    /// Body of the asynchronous purchase path: same preconditions, paid from
    /// the currency wallet at `quantity * unit_ticket_price`.
    ///
    /// The pool must also hold `quantity` numbers unbound to any raffle. If
    /// `deadline` passes before commit the call aborts with
    /// `DeadlineExceeded` and nothing is written.
    pub fn apply_tickets_with_wallet(
        ledger: &Ledger,
        user: &UserId,
        raffle_id: RaffleId,
        quantity: Option<u32>,
        deadline: Option<Instant>,
    ) -> Result<AppliedTickets, AllocError> {
        let entry = ledger.raffle_entry(raffle_id)?;
        let mut guard = entry.lock_book(LockMode::ForUpdate)?;
        let mut raffle = entry.write_raffle()?;
        let book = guard
            .for_update()
            .ok_or(AllocError::LockPoisoned { resource: "raffle book" })?;

        let quantity = Self::check_application(ledger, &raffle, book, user, quantity)?;
        let wanted = u64::from(quantity);
        let cost = raffle.ticket_cost(wanted)?;

        let account = ledger.account(user)?;
        let mut wallet = account.lock_wallet()?;
        let available = wallet.available_balance();
        if available < cost {
            msg!(
                "Insufficient balance for raffle {}: available {}, required {}",
                raffle_id,
                available,
                cost
            );
            return Err(AllocError::InsufficientCurrencyBalance {
                available,
                required: cost,
            });
        }

        let unbound = ledger.pool().unbound_anywhere()?;
        if unbound < wanted {
            msg!("Pool has {} unbound numbers, {} requested", unbound, wanted);
            return Err(AllocError::PoolExhausted {
                requested: wanted,
                available: unbound,
            });
        }

        let numbers = ledger.pool().draw_available(book, quantity)?;

        let now = utils::now();
        let mut txn = Transaction::new(raffle_id);
        for number in &numbers {
            txn.stage_binding(ledger.new_binding(
                user,
                raffle_id,
                *number,
                Funding::Currency {
                    unit_price: raffle.unit_ticket_price,
                },
                now,
            ));
        }

        if deadline.map_or(false, |d| Instant::now() >= d) {
            msg!("Deadline passed before commit, rolling back raffle {}", raffle_id);
            return Err(AllocError::DeadlineExceeded);
        }

        let created = txn.commit(ledger.pool(), book, &mut raffle, now)?;
        wallet.balance -= cost;
        let remaining_balance = wallet.available_balance();
        drop(wallet);
        let remaining_credits = eligible_balance(&account.lock_credits()?, 0);

        msg!(
            "Purchased {} tickets of {} for raffle {} at {} total",
            created.len(),
            user,
            raffle_id,
            cost
        );

        Ok(AppliedTickets {
            raffle_id,
            user: *user,
            bindings: Self::describe(ledger, &created),
            remaining_credits,
            currency_charged: cost,
            remaining_balance,
        })
    }

    /// Raffle-side preconditions shared by both paths. Returns the quantity
    /// to allocate.
    fn check_application(
        ledger: &Ledger,
        raffle: &Raffle,
        book: &RaffleBook,
        user: &UserId,
        quantity: Option<u32>,
    ) -> Result<u32, AllocError> {
        if !raffle.accepts_bindings() {
            msg!("Raffle {} is not active ({})", raffle.id, raffle.status);
            return Err(raffle.not_available());
        }

        let minimum = raffle.minimum_quantity();
        let quantity = quantity.unwrap_or(minimum);
        if quantity < minimum {
            msg!("Requested {} tickets, minimum is {}", quantity, minimum);
            return Err(AllocError::BelowMinimumQuantity {
                requested: quantity,
                minimum,
            });
        }
        let wanted = u64::from(quantity);

        let held = book.held_by(user);
        if let Some(remaining) = raffle.remaining_allowance(held) {
            if wanted > remaining {
                msg!(
                    "Per-user cap on raffle {}: held {}, requested {}, remaining {}",
                    raffle.id,
                    held,
                    wanted,
                    remaining
                );
                return Err(AllocError::PerUserCapExceeded {
                    requested: wanted,
                    held,
                    cap: u64::from(raffle.max_tickets_per_user),
                    remaining,
                });
            }
        }

        if ledger.config().reapply_policy == ReapplyPolicy::SingleApplication && held > 0 {
            msg!("User {} already applied to raffle {}", user, raffle.id);
            return Err(AllocError::AlreadyApplied {
                raffle_id: raffle.id,
                held,
            });
        }

        if let Some(remaining) = raffle.remaining_required() {
            if wanted > remaining {
                msg!("Raffle {} needs {} more tickets, requested {}", raffle.id, remaining, wanted);
                return Err(AllocError::RaffleSoldOut {
                    requested: wanted,
                    remaining,
                });
            }
        }

        Ok(quantity)
    }

    /// Take `wanted` credits from batches at or above `min_level`, lowest
    /// level first. Returns the funding batch of each credit taken.
    fn decrement_credits(
        rows: &mut [WalletTicket],
        min_level: u8,
        wanted: u64,
    ) -> Result<Vec<CreditBatchId>, AllocError> {
        let mut eligible: Vec<&mut WalletTicket> =
            rows.iter_mut().filter(|row| row.level >= min_level).collect();
        eligible.sort_by_key(|row| (row.level, row.id));

        let mut sources = Vec::with_capacity(wanted as usize);
        for row in eligible {
            let still_needed = wanted - sources.len() as u64;
            if still_needed == 0 {
                break;
            }
            let taken = row.consume(still_needed);
            sources.extend(std::iter::repeat(row.id).take(taken as usize));
        }

        let decremented = sources.len() as u64;
        if decremented != wanted {
            msg!("Credit decrement mismatch: requested {}, decremented {}", wanted, decremented);
            return Err(AllocError::WalletDecrementMismatch {
                requested: wanted,
                decremented,
            });
        }
        Ok(sources)
    }

    fn describe(ledger: &Ledger, created: &[RaffleTicket]) -> Vec<AppliedBinding> {
        created
            .iter()
            .map(|binding| AppliedBinding {
                binding_id: binding.id,
                external_id: binding.external_id,
                ticket_number: binding.ticket_number,
                label: ledger.pool().label(binding.ticket_number),
            })
            .collect()
    }
}
