// Raffle Ticket Allocation - Ticket Pool
use solana_program::{clock::UnixTimestamp, msg};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, RwLock};

use crate::error::AllocError;
use crate::ledger::RaffleBook;
use crate::state::{Ticket, TicketNumber};
use crate::utils::{self, RandomStream};

/// Rejection-sampling attempts allowed per requested ticket before the
/// draw falls back to enumerating free numbers
const SAMPLING_ATTEMPTS_PER_TICKET: u64 = 16;

/// Global reservoir of pre-generated ticket numbers `0..size`.
///
/// Numbers are never mutated; the pool only remembers which ones were
/// retired and how many raffles currently hold each number.
pub struct TicketPool {
    size: TicketNumber,
    digits: usize,
    created_at: UnixTimestamp,
    retired: RwLock<BTreeMap<TicketNumber, UnixTimestamp>>,
    /// Number -> count of raffles holding it, only entries above zero
    bound_anywhere: Mutex<HashMap<TicketNumber, u32>>,
}

impl TicketPool {
    /// Seed a pool of `size` numbers labelled with `digits` digits
    pub fn seed(size: TicketNumber, digits: usize, created_at: UnixTimestamp) -> Self {
        msg!("Seeding ticket pool with {} numbers", size);
        Self {
            size,
            digits,
            created_at,
            retired: RwLock::new(BTreeMap::new()),
            bound_anywhere: Mutex::new(HashMap::new()),
        }
    }

    pub fn size(&self) -> TicketNumber {
        self.size
    }

    pub fn label(&self, number: TicketNumber) -> String {
        utils::format_ticket_number(number, self.digits)
    }

    pub fn contains(&self, number: TicketNumber) -> bool {
        number < self.size
    }

    /// Materialize the ticket record for `number`
    pub fn ticket(&self, number: TicketNumber) -> Result<Option<Ticket>, AllocError> {
        if !self.contains(number) {
            return Ok(None);
        }
        let retired = self.read_retired()?;
        Ok(Some(Ticket {
            number,
            label: self.label(number),
            created_at: self.created_at,
            deleted_at: retired.get(&number).copied(),
        }))
    }

    /// Administratively soft-delete a number so it is never drawn again.
    /// Existing bindings keep it. Returns false if it was already retired.
    pub fn retire(&self, number: TicketNumber, now: UnixTimestamp) -> Result<bool, AllocError> {
        if !self.contains(number) {
            return Ok(false);
        }
        let mut retired = self
            .retired
            .write()
            .map_err(|_| AllocError::LockPoisoned { resource: "ticket pool" })?;
        if retired.contains_key(&number) {
            return Ok(false);
        }
        retired.insert(number, now);
        msg!("Retired ticket {}", self.label(number));
        Ok(true)
    }

    /// Numbers not retired
    pub fn live_count(&self) -> Result<u64, AllocError> {
        let retired = self.read_retired()?;
        Ok(u64::from(self.size) - retired.len() as u64)
    }

    /// Live numbers not held by any raffle at all
    pub fn unbound_anywhere(&self) -> Result<u64, AllocError> {
        let retired = self.read_retired()?;
        let bound = self.lock_bound_anywhere()?;
        let bound_live = bound.keys().filter(|n| !retired.contains_key(n)).count() as u64;
        Ok(u64::from(self.size) - retired.len() as u64 - bound_live)
    }

    /// Live numbers the raffle behind `book` could still take
    pub fn available_for(&self, book: &RaffleBook) -> Result<u64, AllocError> {
        let retired = self.read_retired()?;
        Ok(Self::available_in(self.size, &retired, book))
    }

    /// Draw `quantity` distinct live numbers not bound to the raffle behind
    /// `book`, in random order.
    ///
    /// The caller must hold `book` under `LockMode::ForUpdate` until the drawn
    /// numbers are committed, which keeps concurrent draws on one raffle from
    /// overlapping.
    pub fn draw_available(
        &self,
        book: &RaffleBook,
        quantity: u32,
    ) -> Result<Vec<TicketNumber>, AllocError> {
        let retired = self.read_retired()?;
        let available = Self::available_in(self.size, &retired, book);
        let wanted = u64::from(quantity);
        if available < wanted {
            msg!(
                "Pool exhausted for raffle {}: requested {}, available {}",
                book.raffle_id(),
                wanted,
                available
            );
            return Err(AllocError::PoolExhausted {
                requested: wanted,
                available,
            });
        }

        let seed = utils::entropy_seed(&[b"draw", &book.raffle_id().to_le_bytes()]);
        let mut stream = RandomStream::new(seed);
        let is_free = |n: TicketNumber| !retired.contains_key(&n) && !book.is_bound(n);

        let mut chosen: Vec<TicketNumber> = Vec::with_capacity(quantity as usize);
        let mut picked: HashSet<TicketNumber> = HashSet::with_capacity(quantity as usize);
        let mut attempts = wanted * SAMPLING_ATTEMPTS_PER_TICKET + 64;
        while chosen.len() < quantity as usize && attempts > 0 {
            attempts -= 1;
            let candidate = stream.next_below(u64::from(self.size)) as TicketNumber;
            if is_free(candidate) && picked.insert(candidate) {
                chosen.push(candidate);
            }
        }

        if chosen.len() < quantity as usize {
            // Dense raffle: enumerate what is left and shuffle-pick from it
            let mut free: Vec<TicketNumber> = (0..self.size)
                .filter(|n| is_free(*n) && !picked.contains(n))
                .collect();
            while chosen.len() < quantity as usize {
                let index = stream.next_below(free.len() as u64) as usize;
                chosen.push(free.swap_remove(index));
            }
        }

        Ok(chosen)
    }

    pub(crate) fn lock_bound_anywhere(
        &self,
    ) -> Result<MutexGuard<'_, HashMap<TicketNumber, u32>>, AllocError> {
        self.bound_anywhere
            .lock()
            .map_err(|_| AllocError::LockPoisoned { resource: "ticket pool" })
    }

    pub(crate) fn retired_numbers(&self) -> Result<Vec<(TicketNumber, UnixTimestamp)>, AllocError> {
        let retired = self.read_retired()?;
        Ok(retired.iter().map(|(n, at)| (*n, *at)).collect())
    }

    fn read_retired(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, BTreeMap<TicketNumber, UnixTimestamp>>, AllocError>
    {
        self.retired
            .read()
            .map_err(|_| AllocError::LockPoisoned { resource: "ticket pool" })
    }

    fn available_in(
        size: TicketNumber,
        retired: &BTreeMap<TicketNumber, UnixTimestamp>,
        book: &RaffleBook,
    ) -> u64 {
        let retired_and_bound = retired.keys().filter(|n| book.is_bound(**n)).count() as u64;
        let bound_live = book.bound_count() - retired_and_bound;
        u64::from(size) - retired.len() as u64 - bound_live
    }
}

/// Record that `numbers` were bound to one more raffle
pub(crate) fn mark_bound(bound: &mut HashMap<TicketNumber, u32>, numbers: &[TicketNumber]) {
    for number in numbers {
        *bound.entry(*number).or_insert(0) += 1;
    }
}

/// Record that `numbers` were released by one raffle
pub(crate) fn mark_released(bound: &mut HashMap<TicketNumber, u32>, numbers: &[TicketNumber]) {
    for number in numbers {
        if let Some(count) = bound.get_mut(number) {
            *count -= 1;
            if *count == 0 {
                bound.remove(number);
            }
        }
    }
}
