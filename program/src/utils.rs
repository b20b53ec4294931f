// Raffle Ticket Allocation - Utility Functions
use solana_program::{clock::UnixTimestamp, hash::{hashv, Hash}, pubkey::Pubkey};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::state::{BindingId, RaffleId, TicketNumber};

static ENTROPY_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a pseudo-random value based on seed data and a maximum value
pub fn generate_random_value(seed: &[u8], max: u64) -> u64 {
    if max == 0 {
        return 0;
    }

    // Use the first 8 bytes of the seed as a u64
    let mut bytes = [0u8; 8];
    let len = std::cmp::min(seed.len(), 8);
    bytes[..len].copy_from_slice(&seed[..len]);

    let random_value = u64::from_le_bytes(bytes);
    random_value % max
}

/// Fresh seed mixing wall-clock nanos, a process-wide counter and caller salt
pub fn entropy_seed(salt: &[&[u8]]) -> Hash {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let counter = ENTROPY_COUNTER.fetch_add(1, Ordering::Relaxed);

    let nanos_bytes = nanos.to_le_bytes();
    let counter_bytes = counter.to_le_bytes();
    let mut parts: Vec<&[u8]> = vec![&nanos_bytes, &counter_bytes];
    parts.extend_from_slice(salt);
    hashv(&parts)
}

/// Hash-chained stream of random values derived from one seed
pub struct RandomStream {
    seed: Hash,
    counter: u64,
}

impl RandomStream {
    pub fn new(seed: Hash) -> Self {
        Self { seed, counter: 0 }
    }

    /// Next value in `[0, max)`
    pub fn next_below(&mut self, max: u64) -> u64 {
        let block = hashv(&[self.seed.as_ref(), &self.counter.to_le_bytes()]);
        self.counter = self.counter.wrapping_add(1);
        generate_random_value(block.as_ref(), max)
    }
}

/// Zero-padded display label for a ticket number, e.g. `0000042`
pub fn format_ticket_number(number: TicketNumber, digits: usize) -> String {
    format!("{:0width$}", number, width = digits)
}

/// Price of `quantity` tickets at `unit_price`, None on overflow
pub fn calculate_cost(quantity: u64, unit_price: u64) -> Option<u64> {
    quantity.checked_mul(unit_price)
}

/// Current unix time in seconds
pub fn now() -> UnixTimestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as UnixTimestamp)
        .unwrap_or_default()
}

/// External identifier of a binding, stable for its lifetime
pub fn binding_external_id(
    raffle_id: RaffleId,
    ticket_number: TicketNumber,
    binding_id: BindingId,
    user: &Pubkey,
) -> Hash {
    hashv(&[
        b"binding",
        &raffle_id.to_le_bytes(),
        &ticket_number.to_le_bytes(),
        &binding_id.to_le_bytes(),
        user.as_ref(),
    ])
}
