// Raffle Ticket Allocation - Cancellation
use solana_program::{hash::Hash, msg};
use std::collections::{BTreeMap, HashSet};

use crate::error::AllocError;
use crate::ledger::{Ledger, LockMode, Transaction};
use crate::raffle_state::RaffleStatus;
use crate::state::{Funding, RaffleId, RaffleTicket, UserId, Wallet, WalletTicket};
use crate::utils;

/// Result of cancelling a user's bindings
#[derive(Debug, Clone, PartialEq)]
pub struct CancelOutcome {
    pub raffle_id: RaffleId,
    /// External ids actually cancelled, in request order
    pub cancelled: Vec<Hash>,
    pub cancelled_count: u64,
    /// Ticket credits given back to their batches
    pub credits_returned: u64,
    /// Currency given back to the wallet
    pub currency_refunded: u64,
}

/// Result of cancelling a whole raffle
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RaffleRelease {
    pub released: u64,
    pub credits_returned: u64,
    pub currency_refunded: u64,
}

#[derive(Default)]
struct Refund {
    credits: u64,
    currency: u64,
}

/// Give the funds behind `binding` back to its source: one credit to the
/// batch that paid for it, or the unit price to the wallet balance.
fn refund(
    binding: &RaffleTicket,
    credits: &mut [WalletTicket],
    wallet: &mut Wallet,
    totals: &mut Refund,
) -> Result<(), AllocError> {
    match binding.funding {
        Funding::TicketCredits { batch_id } => {
            let batch = credits
                .iter_mut()
                .find(|row| row.id == batch_id)
                .ok_or(AllocError::CreditBatchMissing { batch_id })?;
            totals.credits += batch.restore(1);
        }
        Funding::Currency { unit_price } => {
            wallet.balance = wallet
                .balance
                .checked_add(unit_price)
                .ok_or(AllocError::ArithmeticOverflow)?;
            totals.currency += unit_price;
        }
    }
    Ok(())
}

/// Cancel the caller's bindings in a raffle.
///
/// Only `pending` and `confirmed` bindings owned by `user` are cancelled;
/// anything else in `external_ids` is skipped. Fails with `NothingToCancel`
/// when nothing qualifies.
pub fn cancel_tickets(
    ledger: &Ledger,
    user: &UserId,
    raffle_id: RaffleId,
    external_ids: &[Hash],
) -> Result<CancelOutcome, AllocError> {
    let entry = ledger.raffle_entry(raffle_id)?;
    let mut guard = entry.lock_book(LockMode::ForUpdate)?;
    let mut raffle = entry.write_raffle()?;
    let book = guard
        .for_update()
        .ok_or(AllocError::LockPoisoned { resource: "raffle book" })?;

    let mut seen = HashSet::new();
    let selected: Vec<RaffleTicket> = external_ids
        .iter()
        .filter(|id| seen.insert(**id))
        .filter_map(|id| book.binding_by_external(id))
        .filter(|binding| binding.user == *user && binding.status.is_cancellable())
        .cloned()
        .collect();

    if selected.is_empty() {
        msg!("Nothing to cancel for {} in raffle {}", user, raffle_id);
        return Err(AllocError::NothingToCancel {
            requested: external_ids.len() as u64,
        });
    }

    let account = ledger.account(user)?;
    let mut credits = account.lock_credits()?;
    let mut wallet = account.lock_wallet()?;
    let mut staged_credits = credits.clone();
    let mut staged_wallet = wallet.clone();

    let mut totals = Refund::default();
    let mut txn = Transaction::new(raffle_id);
    for binding in &selected {
        refund(binding, &mut staged_credits, &mut staged_wallet, &mut totals)?;
        txn.stage_release(binding.id);
    }

    txn.commit(ledger.pool(), book, &mut raffle, utils::now())?;
    *credits = staged_credits;
    *wallet = staged_wallet;

    msg!(
        "Cancelled {} of {} tickets for {} in raffle {}, {} credits and {} currency returned",
        selected.len(),
        external_ids.len(),
        user,
        raffle_id,
        totals.credits,
        totals.currency
    );

    Ok(CancelOutcome {
        raffle_id,
        cancelled: selected.iter().map(|b| b.external_id).collect(),
        cancelled_count: selected.len() as u64,
        credits_returned: totals.credits,
        currency_refunded: totals.currency,
    })
}

/// Move a raffle to `Cancelled` and release every pending or confirmed
/// binding, refunding each holder. All holders are locked in user order and
/// updated together.
pub fn cancel_raffle(ledger: &Ledger, raffle_id: RaffleId) -> Result<RaffleRelease, AllocError> {
    let entry = ledger.raffle_entry(raffle_id)?;
    let mut guard = entry.lock_book(LockMode::ForUpdate)?;
    let mut raffle = entry.write_raffle()?;
    if !raffle.status.can_transition_to(RaffleStatus::Cancelled) {
        return Err(AllocError::InvalidStatusTransition {
            from: raffle.status,
            to: RaffleStatus::Cancelled,
        });
    }
    let book = guard
        .for_update()
        .ok_or(AllocError::LockPoisoned { resource: "raffle book" })?;

    let mut by_user: BTreeMap<UserId, Vec<RaffleTicket>> = BTreeMap::new();
    for binding in book.bindings().filter(|b| b.status.is_cancellable()) {
        by_user.entry(binding.user).or_default().push(binding.clone());
    }

    let accounts = by_user
        .keys()
        .map(|user| ledger.account(user))
        .collect::<Result<Vec<_>, _>>()?;
    let mut locked = Vec::with_capacity(accounts.len());
    for account in &accounts {
        locked.push((account.lock_credits()?, account.lock_wallet()?));
    }

    let mut totals = Refund::default();
    let mut staged = Vec::with_capacity(locked.len());
    let mut txn = Transaction::new(raffle_id);
    for ((credits, wallet), bindings) in locked.iter().zip(by_user.values()) {
        let mut staged_credits: Vec<WalletTicket> = credits.to_vec();
        let mut staged_wallet: Wallet = (**wallet).clone();
        for binding in bindings {
            refund(binding, &mut staged_credits, &mut staged_wallet, &mut totals)?;
            txn.stage_release(binding.id);
        }
        staged.push((staged_credits, staged_wallet));
    }

    txn.commit(ledger.pool(), book, &mut raffle, utils::now())?;
    let released: u64 = by_user.values().map(|b| b.len() as u64).sum();
    for ((credits, wallet), (staged_credits, staged_wallet)) in locked.iter_mut().zip(staged) {
        **credits = staged_credits;
        **wallet = staged_wallet;
    }
    raffle.status = RaffleStatus::Cancelled;

    msg!(
        "Raffle {} cancelled: released {}, {} credits and {} currency returned",
        raffle_id,
        released,
        totals.credits,
        totals.currency
    );

    Ok(RaffleRelease {
        released,
        credits_returned: totals.credits,
        currency_refunded: totals.currency,
    })
}
