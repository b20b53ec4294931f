use arrayref::{array_mut_ref, array_ref, array_refs, mut_array_refs};
use solana_program::{
    program_error::ProgramError,
    program_pack::{Pack, Sealed},
    pubkey::Pubkey,
};

use crate::error::AllocError;
use crate::state::{RaffleId, UserId};

/// Queued request to buy raffle tickets from the currency wallet
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ApplyTicketsJob {
    /// Caller-chosen id; a request id is processed at most once
    pub request_id: u64,
    pub user: UserId,
    pub raffle_id: RaffleId,
    /// Tickets wanted, None for the raffle minimum
    pub quantity: Option<u32>,
}

impl ApplyTicketsJob {
    pub fn new(request_id: u64, user: UserId, raffle_id: RaffleId, quantity: Option<u32>) -> Self {
        Self {
            request_id,
            user,
            raffle_id,
            quantity,
        }
    }

    /// Wire form pushed onto the queue
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut dst = vec![0u8; Self::LEN];
        self.pack_into_slice(&mut dst);
        dst
    }

    pub fn from_bytes(src: &[u8]) -> Result<Self, AllocError> {
        Self::unpack_unchecked(src).map_err(|e| AllocError::Codec(e.to_string()))
    }
}

impl Sealed for ApplyTicketsJob {}

impl Pack for ApplyTicketsJob {
    const LEN: usize = 8 + 32 + 8 + 1 + 4;

    fn unpack_from_slice(src: &[u8]) -> Result<Self, ProgramError> {
        let src = array_ref![src, 0, ApplyTicketsJob::LEN];
        let (request_id, user, raffle_id, has_quantity, quantity) =
            array_refs![src, 8, 32, 8, 1, 4];

        let quantity = match has_quantity[0] {
            0 => None,
            1 => Some(u32::from_le_bytes(*quantity)),
            _ => return Err(ProgramError::InvalidAccountData),
        };

        Ok(ApplyTicketsJob {
            request_id: u64::from_le_bytes(*request_id),
            user: Pubkey::new_from_array(*user),
            raffle_id: u64::from_le_bytes(*raffle_id),
            quantity,
        })
    }

    fn pack_into_slice(&self, dst: &mut [u8]) {
        let dst = array_mut_ref![dst, 0, ApplyTicketsJob::LEN];
        let (request_id_dst, user_dst, raffle_id_dst, has_quantity_dst, quantity_dst) =
            mut_array_refs![dst, 8, 32, 8, 1, 4];

        *request_id_dst = self.request_id.to_le_bytes();
        user_dst.copy_from_slice(self.user.as_ref());
        *raffle_id_dst = self.raffle_id.to_le_bytes();
        has_quantity_dst[0] = u8::from(self.quantity.is_some());
        *quantity_dst = self.quantity.unwrap_or(0).to_le_bytes();
    }
}
