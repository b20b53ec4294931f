// Raffle Ticket Allocation - Ledger
use borsh::{BorshDeserialize, BorshSerialize};
use solana_program::{clock::UnixTimestamp, hash::Hash, msg};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::config::EngineConfig;
use crate::error::AllocError;
use crate::pool::{self, TicketPool};
use crate::raffle_state::Raffle;
use crate::state::{
    BindingId, BindingStatus, CreditBatchId, Funding, RaffleId, RaffleTicket, TicketNumber,
    UserId, Wallet, WalletTicket,
};
use crate::utils;

/// How a raffle's bindings are locked for the duration of a call
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockMode {
    /// Concurrent readers, no writes
    Shared,
    /// Exclusive; required to draw numbers and to write bindings
    ForUpdate,
}

/// Bindings of one raffle plus the indexes the allocator checks against
#[derive(Debug, Default)]
pub struct RaffleBook {
    raffle_id: RaffleId,
    bindings: BTreeMap<BindingId, RaffleTicket>,
    by_external: HashMap<Hash, BindingId>,
    /// Numbers held by a non-cancelled binding
    bound: HashSet<TicketNumber>,
    /// Non-cancelled bindings per user
    held_by_user: HashMap<UserId, u64>,
}

impl RaffleBook {
    fn new(raffle_id: RaffleId) -> Self {
        Self {
            raffle_id,
            ..Self::default()
        }
    }

    pub fn raffle_id(&self) -> RaffleId {
        self.raffle_id
    }

    pub fn is_bound(&self, number: TicketNumber) -> bool {
        self.bound.contains(&number)
    }

    pub fn bound_count(&self) -> u64 {
        self.bound.len() as u64
    }

    /// Non-cancelled bindings held by `user`
    pub fn held_by(&self, user: &UserId) -> u64 {
        self.held_by_user.get(user).copied().unwrap_or(0)
    }

    pub fn binding(&self, id: BindingId) -> Option<&RaffleTicket> {
        self.bindings.get(&id)
    }

    pub fn binding_by_external(&self, external_id: &Hash) -> Option<&RaffleTicket> {
        self.by_external
            .get(external_id)
            .and_then(|id| self.bindings.get(id))
    }

    /// All bindings including cancelled tombstones, in creation order
    pub fn bindings(&self) -> impl Iterator<Item = &RaffleTicket> {
        self.bindings.values()
    }

    fn insert(&mut self, binding: RaffleTicket) {
        if binding.is_held() {
            self.bound.insert(binding.ticket_number);
            *self.held_by_user.entry(binding.user).or_insert(0) += 1;
        }
        self.by_external.insert(binding.external_id, binding.id);
        self.bindings.insert(binding.id, binding);
    }

    /// Tombstone a binding and free its number. Returns the released number.
    fn release(&mut self, id: BindingId, now: UnixTimestamp) -> Option<TicketNumber> {
        let binding = self.bindings.get_mut(&id)?;
        if !binding.is_held() {
            return None;
        }
        binding.status = BindingStatus::Cancelled;
        binding.deleted_at = Some(now);
        self.bound.remove(&binding.ticket_number);
        if let Some(held) = self.held_by_user.get_mut(&binding.user) {
            *held -= 1;
            if *held == 0 {
                self.held_by_user.remove(&binding.user);
            }
        }
        Some(binding.ticket_number)
    }

    pub(crate) fn set_status(&mut self, id: BindingId, status: BindingStatus) -> bool {
        match self.bindings.get_mut(&id) {
            Some(binding) if binding.is_held() && status.is_held() => {
                binding.status = status;
                true
            }
            _ => false,
        }
    }
}

/// Lock held on a raffle book
pub enum BookGuard<'a> {
    Shared(RwLockReadGuard<'a, RaffleBook>),
    ForUpdate(RwLockWriteGuard<'a, RaffleBook>),
}

impl<'a> BookGuard<'a> {
    /// Mutable access, only granted under `LockMode::ForUpdate`
    pub fn for_update(&mut self) -> Option<&mut RaffleBook> {
        match self {
            BookGuard::Shared(_) => None,
            BookGuard::ForUpdate(guard) => Some(&mut **guard),
        }
    }
}

impl<'a> Deref for BookGuard<'a> {
    type Target = RaffleBook;

    fn deref(&self) -> &RaffleBook {
        match self {
            BookGuard::Shared(guard) => &**guard,
            BookGuard::ForUpdate(guard) => &**guard,
        }
    }
}

/// A raffle row together with its bindings.
///
/// Lock order: book, then raffle row, then user accounts sorted by user id,
/// then the pool's global bound counter.
pub struct RaffleEntry {
    raffle: RwLock<Raffle>,
    book: RwLock<RaffleBook>,
}

impl RaffleEntry {
    pub fn lock_book(&self, mode: LockMode) -> Result<BookGuard<'_>, AllocError> {
        let poisoned = AllocError::LockPoisoned { resource: "raffle book" };
        Ok(match mode {
            LockMode::Shared => BookGuard::Shared(self.book.read().map_err(|_| poisoned)?),
            LockMode::ForUpdate => BookGuard::ForUpdate(self.book.write().map_err(|_| poisoned)?),
        })
    }

    pub fn read_raffle(&self) -> Result<RwLockReadGuard<'_, Raffle>, AllocError> {
        self.raffle
            .read()
            .map_err(|_| AllocError::LockPoisoned { resource: "raffle" })
    }

    pub fn write_raffle(&self) -> Result<RwLockWriteGuard<'_, Raffle>, AllocError> {
        self.raffle
            .write()
            .map_err(|_| AllocError::LockPoisoned { resource: "raffle" })
    }
}

/// Ticket-credit rows and currency wallet of one user
pub struct UserAccount {
    credits: Mutex<Vec<WalletTicket>>,
    wallet: Mutex<Wallet>,
}

impl UserAccount {
    fn new(user: UserId) -> Self {
        Self {
            credits: Mutex::new(Vec::new()),
            wallet: Mutex::new(Wallet::new(user)),
        }
    }

    pub fn lock_credits(&self) -> Result<MutexGuard<'_, Vec<WalletTicket>>, AllocError> {
        self.credits
            .lock()
            .map_err(|_| AllocError::LockPoisoned { resource: "ticket credits" })
    }

    pub fn lock_wallet(&self) -> Result<MutexGuard<'_, Wallet>, AllocError> {
        self.wallet
            .lock()
            .map_err(|_| AllocError::LockPoisoned { resource: "wallet" })
    }
}

/// Ticket-credit balance over rows at or above `min_level`
pub fn eligible_balance(rows: &[WalletTicket], min_level: u8) -> u64 {
    rows.iter()
        .filter(|row| row.level >= min_level)
        .map(WalletTicket::available)
        .fold(0, u64::saturating_add)
}

/// Writes staged against one raffle, applied together by `commit`.
///
/// Nothing is written before `commit`, so dropping a transaction is a
/// rollback.
#[derive(Debug)]
pub struct Transaction {
    raffle_id: RaffleId,
    created: Vec<RaffleTicket>,
    released: Vec<BindingId>,
}

impl Transaction {
    pub fn new(raffle_id: RaffleId) -> Self {
        Self {
            raffle_id,
            created: Vec::new(),
            released: Vec::new(),
        }
    }

    pub fn stage_binding(&mut self, binding: RaffleTicket) {
        self.created.push(binding);
    }

    pub fn stage_release(&mut self, id: BindingId) {
        self.released.push(id);
    }

    pub fn created(&self) -> &[RaffleTicket] {
        &self.created
    }

    /// Apply staged bindings and releases to the book, the raffle counters
    /// and the pool. The only fallible step runs before any write.
    pub fn commit(
        self,
        pool: &TicketPool,
        book: &mut RaffleBook,
        raffle: &mut Raffle,
        now: UnixTimestamp,
    ) -> Result<Vec<RaffleTicket>, AllocError> {
        debug_assert_eq!(self.raffle_id, book.raffle_id());
        let mut bound_anywhere = pool.lock_bound_anywhere()?;

        let mut freed = Vec::with_capacity(self.released.len());
        for id in &self.released {
            if let Some(number) = book.release(*id, now) {
                freed.push(number);
            }
        }
        pool::mark_released(&mut bound_anywhere, &freed);

        let taken: Vec<TicketNumber> = self.created.iter().map(|b| b.ticket_number).collect();
        for binding in &self.created {
            book.insert(binding.clone());
        }
        pool::mark_bound(&mut bound_anywhere, &taken);

        raffle.tickets_sold =
            (raffle.tickets_sold + taken.len() as u64).saturating_sub(freed.len() as u64);
        Ok(self.created)
    }
}

/// Deterministic dump of the ledger, compared byte for byte by callers
#[derive(BorshSerialize, BorshDeserialize, Debug, PartialEq)]
pub struct LedgerSnapshot {
    pub raffles: Vec<Raffle>,
    pub bindings: Vec<RaffleTicket>,
    pub credits: Vec<WalletTicket>,
    pub wallets: Vec<Wallet>,
    pub retired: Vec<(TicketNumber, UnixTimestamp)>,
}

/// In-memory store behind the allocator
pub struct Ledger {
    config: EngineConfig,
    pool: TicketPool,
    raffles: RwLock<HashMap<RaffleId, Arc<RaffleEntry>>>,
    users: RwLock<HashMap<UserId, Arc<UserAccount>>>,
    next_raffle_id: AtomicU64,
    next_binding_id: AtomicU64,
    next_batch_id: AtomicU64,
}

impl Ledger {
    pub fn new(config: EngineConfig) -> Self {
        let pool = TicketPool::seed(config.pool_size, config.ticket_digits, utils::now());
        Self {
            config,
            pool,
            raffles: RwLock::new(HashMap::new()),
            users: RwLock::new(HashMap::new()),
            next_raffle_id: AtomicU64::new(1),
            next_binding_id: AtomicU64::new(1),
            next_batch_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn pool(&self) -> &TicketPool {
        &self.pool
    }

    /// Raffle row and bindings; fails with `RaffleNotAvailable` if unknown
    pub fn raffle_entry(&self, raffle_id: RaffleId) -> Result<Arc<RaffleEntry>, AllocError> {
        let raffles = self
            .raffles
            .read()
            .map_err(|_| AllocError::LockPoisoned { resource: "raffles" })?;
        raffles
            .get(&raffle_id)
            .cloned()
            .ok_or(AllocError::RaffleNotAvailable {
                raffle_id,
                status: None,
            })
    }

    /// Copy of the raffle row
    pub fn raffle(&self, raffle_id: RaffleId) -> Result<Raffle, AllocError> {
        let entry = self.raffle_entry(raffle_id)?;
        let raffle = entry.read_raffle()?;
        Ok(raffle.clone())
    }

    pub(crate) fn insert_raffle(
        &self,
        build: impl FnOnce(RaffleId) -> Raffle,
    ) -> Result<RaffleId, AllocError> {
        let raffle_id = self.next_raffle_id.fetch_add(1, Ordering::Relaxed);
        let entry = Arc::new(RaffleEntry {
            raffle: RwLock::new(build(raffle_id)),
            book: RwLock::new(RaffleBook::new(raffle_id)),
        });
        let mut raffles = self
            .raffles
            .write()
            .map_err(|_| AllocError::LockPoisoned { resource: "raffles" })?;
        raffles.insert(raffle_id, entry);
        Ok(raffle_id)
    }

    /// Account of `user`, created empty on first use
    pub fn account(&self, user: &UserId) -> Result<Arc<UserAccount>, AllocError> {
        {
            let users = self
                .users
                .read()
                .map_err(|_| AllocError::LockPoisoned { resource: "users" })?;
            if let Some(account) = users.get(user) {
                return Ok(account.clone());
            }
        }
        let mut users = self
            .users
            .write()
            .map_err(|_| AllocError::LockPoisoned { resource: "users" })?;
        Ok(users
            .entry(*user)
            .or_insert_with(|| Arc::new(UserAccount::new(*user)))
            .clone())
    }

    /// Build a confirmed binding with fresh ids; nothing is stored
    pub(crate) fn new_binding(
        &self,
        user: &UserId,
        raffle_id: RaffleId,
        ticket_number: TicketNumber,
        funding: Funding,
        now: UnixTimestamp,
    ) -> RaffleTicket {
        let id = self.next_binding_id.fetch_add(1, Ordering::Relaxed);
        RaffleTicket {
            id,
            external_id: utils::binding_external_id(raffle_id, ticket_number, id, user),
            user: *user,
            raffle_id,
            ticket_number,
            status: BindingStatus::Confirmed,
            funding,
            created_at: now,
            deleted_at: None,
        }
    }

    /// Record a ticket-credit batch bought through a plan
    pub fn grant_ticket_credits(
        &self,
        user: &UserId,
        level: u8,
        total: u64,
        bonus: u64,
    ) -> Result<CreditBatchId, AllocError> {
        total
            .checked_add(bonus)
            .ok_or(AllocError::ArithmeticOverflow)?;
        let account = self.account(user)?;
        let mut credits = account.lock_credits()?;
        let id = self.next_batch_id.fetch_add(1, Ordering::Relaxed);
        credits.push(WalletTicket {
            id,
            user: *user,
            level,
            total,
            used: 0,
            bonus,
            created_at: utils::now(),
        });
        msg!("Granted {} (+{} bonus) level {} credits to {}", total, bonus, level, user);
        Ok(id)
    }

    /// Copy of the user's credit batches
    pub fn credit_batches(&self, user: &UserId) -> Result<Vec<WalletTicket>, AllocError> {
        let account = self.account(user)?;
        let credits = account.lock_credits()?;
        Ok(credits.clone())
    }

    /// Ticket-credit balance across every batch
    pub fn ticket_credit_balance(&self, user: &UserId) -> Result<u64, AllocError> {
        let account = self.account(user)?;
        let credits = account.lock_credits()?;
        Ok(eligible_balance(&credits, 0))
    }

    pub fn deposit(&self, user: &UserId, amount: u64) -> Result<u64, AllocError> {
        let account = self.account(user)?;
        let mut wallet = account.lock_wallet()?;
        wallet.balance = wallet
            .balance
            .checked_add(amount)
            .ok_or(AllocError::ArithmeticOverflow)?;
        Ok(wallet.balance)
    }

    /// Hold funds out of the available balance
    pub fn block_funds(&self, user: &UserId, amount: u64) -> Result<u64, AllocError> {
        let account = self.account(user)?;
        let mut wallet = account.lock_wallet()?;
        let available = wallet.available_balance();
        if available < amount {
            return Err(AllocError::InsufficientCurrencyBalance {
                available,
                required: amount,
            });
        }
        wallet.blocked += amount;
        Ok(wallet.available_balance())
    }

    pub fn release_funds(&self, user: &UserId, amount: u64) -> Result<u64, AllocError> {
        let account = self.account(user)?;
        let mut wallet = account.lock_wallet()?;
        wallet.blocked = wallet.blocked.saturating_sub(amount);
        Ok(wallet.available_balance())
    }

    pub fn wallet(&self, user: &UserId) -> Result<Wallet, AllocError> {
        let account = self.account(user)?;
        let wallet = account.lock_wallet()?;
        Ok(wallet.clone())
    }

    /// The user's bindings in a raffle, cancelled ones included
    pub fn user_bindings(
        &self,
        user: &UserId,
        raffle_id: RaffleId,
    ) -> Result<Vec<RaffleTicket>, AllocError> {
        let entry = self.raffle_entry(raffle_id)?;
        let book = entry.lock_book(LockMode::Shared)?;
        Ok(book
            .bindings()
            .filter(|binding| binding.user == *user)
            .cloned()
            .collect())
    }

    /// Every binding of a raffle, cancelled ones included
    pub fn raffle_bindings(&self, raffle_id: RaffleId) -> Result<Vec<RaffleTicket>, AllocError> {
        let entry = self.raffle_entry(raffle_id)?;
        let book = entry.lock_book(LockMode::Shared)?;
        Ok(book.bindings().cloned().collect())
    }

    /// Borsh-encoded snapshot of every table
    pub fn snapshot(&self) -> Result<Vec<u8>, AllocError> {
        let entries: Vec<(RaffleId, Arc<RaffleEntry>)> = {
            let raffles = self
                .raffles
                .read()
                .map_err(|_| AllocError::LockPoisoned { resource: "raffles" })?;
            let mut entries: Vec<_> = raffles.iter().map(|(id, e)| (*id, e.clone())).collect();
            entries.sort_by_key(|(id, _)| *id);
            entries
        };
        let accounts: Vec<(UserId, Arc<UserAccount>)> = {
            let users = self
                .users
                .read()
                .map_err(|_| AllocError::LockPoisoned { resource: "users" })?;
            let mut accounts: Vec<_> = users.iter().map(|(u, a)| (*u, a.clone())).collect();
            accounts.sort_by_key(|(user, _)| *user);
            accounts
        };

        let mut snapshot = LedgerSnapshot {
            raffles: Vec::new(),
            bindings: Vec::new(),
            credits: Vec::new(),
            wallets: Vec::new(),
            retired: self.pool.retired_numbers()?,
        };
        for (_, entry) in &entries {
            let book = entry.lock_book(LockMode::Shared)?;
            snapshot.raffles.push(entry.read_raffle()?.clone());
            snapshot.bindings.extend(book.bindings().cloned());
        }
        for (_, account) in &accounts {
            snapshot.credits.extend(account.lock_credits()?.iter().cloned());
            snapshot.wallets.push(account.lock_wallet()?.clone());
        }

        snapshot
            .try_to_vec()
            .map_err(|e| AllocError::Codec(e.to_string()))
    }
}
