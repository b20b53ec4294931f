// Raffle Ticket Allocation - Instructions
use borsh::{BorshDeserialize, BorshSerialize};
use solana_program::hash::Hash;

use crate::error::AllocError;
use crate::state::RaffleId;

/// Requests accepted at the synchronous boundary. The caller identity is
/// supplied by the embedding service, never by the payload.
#[derive(BorshSerialize, BorshDeserialize, Clone, Debug, PartialEq)]
pub enum RaffleInstruction {
    /// Bind tickets paid with ticket credits
    ApplyTickets {
        raffle_id: RaffleId,
        /// None applies the raffle minimum
        quantity: Option<u32>,
    },

    /// Queue a purchase paid from the currency wallet
    QueueTicketPurchase {
        /// Idempotency key of the purchase
        request_id: u64,
        raffle_id: RaffleId,
        quantity: Option<u32>,
    },

    /// Cancel the caller's bindings by external id
    CancelTickets {
        raffle_id: RaffleId,
        tickets: Vec<Hash>,
    },

    /// List the caller's bindings in a raffle
    ListTickets { raffle_id: RaffleId },
}

impl RaffleInstruction {
    /// Unpacks a byte buffer into a RaffleInstruction
    pub fn unpack(input: &[u8]) -> Result<Self, AllocError> {
        if input.is_empty() {
            return Err(AllocError::Codec("empty instruction".to_string()));
        }
        Self::try_from_slice(input).map_err(|e| AllocError::Codec(e.to_string()))
    }

    pub fn pack(&self) -> Result<Vec<u8>, AllocError> {
        self.try_to_vec().map_err(|e| AllocError::Codec(e.to_string()))
    }
}
