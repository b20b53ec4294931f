// Raffle Ticket Allocation - Instruction Processor
use solana_program::msg;

use crate::{
    allocator::{AppliedTickets, Allocator},
    cancellation::{self, CancelOutcome},
    error::AllocError,
    instruction::RaffleInstruction,
    job::ApplyTicketsJob,
    ledger::Ledger,
    state::{RaffleTicket, UserId},
    worker::JobQueue,
};

pub const STATUS_OK: u16 = 200;
pub const STATUS_CREATED: u16 = 201;
pub const STATUS_ACCEPTED: u16 = 202;

/// Payload returned to the caller
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Applied(AppliedTickets),
    Queued { request_id: u64 },
    Cancelled(CancelOutcome),
    Tickets(Vec<RaffleTicket>),
    Failure {
        reason: &'static str,
        message: String,
        details: Vec<(&'static str, u64)>,
    },
}

/// HTTP-equivalent status with its body
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: u16,
    pub body: ResponseBody,
}

impl Response {
    fn ok(status: u16, body: ResponseBody) -> Self {
        Self { status, body }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

impl From<AllocError> for Response {
    fn from(error: AllocError) -> Self {
        Self {
            status: error.http_status(),
            body: ResponseBody::Failure {
                reason: error.reason(),
                message: error.to_string(),
                details: error.details(),
            },
        }
    }
}

/// Synchronous request handler.
pub struct Processor {}

impl Processor {
    /// Decode and run one instruction for `user`. Failures come back as a
    /// `Failure` body; infrastructure faults are not retried here.
    pub fn process(
        ledger: &Ledger,
        queue: Option<&JobQueue>,
        user: &UserId,
        instruction_data: &[u8],
    ) -> Response {
        match Self::process_instruction(ledger, queue, user, instruction_data) {
            Ok(response) => response,
            Err(error) => {
                msg!("Request from {} failed: {}", user, error);
                Response::from(error)
            }
        }
    }

    fn process_instruction(
        ledger: &Ledger,
        queue: Option<&JobQueue>,
        user: &UserId,
        instruction_data: &[u8],
    ) -> Result<Response, AllocError> {
        let instruction = RaffleInstruction::unpack(instruction_data)?;

        match instruction {
            RaffleInstruction::ApplyTickets {
                raffle_id,
                quantity,
            } => {
                msg!("Instruction: ApplyTickets");
                let applied = Allocator::apply_tickets(ledger, user, raffle_id, quantity)?;
                Ok(Response::ok(STATUS_CREATED, ResponseBody::Applied(applied)))
            }
            RaffleInstruction::QueueTicketPurchase {
                request_id,
                raffle_id,
                quantity,
            } => {
                msg!("Instruction: QueueTicketPurchase");
                Self::process_queue_purchase(ledger, queue, user, request_id, raffle_id, quantity)
            }
            RaffleInstruction::CancelTickets { raffle_id, tickets } => {
                msg!("Instruction: CancelTickets");
                let outcome = cancellation::cancel_tickets(ledger, user, raffle_id, &tickets)?;
                Ok(Response::ok(STATUS_OK, ResponseBody::Cancelled(outcome)))
            }
            RaffleInstruction::ListTickets { raffle_id } => {
                msg!("Instruction: ListTickets");
                let tickets = ledger.user_bindings(user, raffle_id)?;
                Ok(Response::ok(STATUS_OK, ResponseBody::Tickets(tickets)))
            }
        }
    }

    fn process_queue_purchase(
        ledger: &Ledger,
        queue: Option<&JobQueue>,
        user: &UserId,
        request_id: u64,
        raffle_id: u64,
        quantity: Option<u32>,
    ) -> Result<Response, AllocError> {
        let queue = queue.ok_or(AllocError::QueueClosed)?;

        // Unknown raffles and malformed quantities are rejected up front;
        // every other rule is checked by the worker
        let raffle = ledger.raffle(raffle_id)?;
        if raffle.is_deleted() {
            return Err(raffle.not_available());
        }
        if let Some(requested) = quantity {
            let minimum = raffle.minimum_quantity();
            if requested < minimum {
                msg!("Requested {} tickets, minimum is {}", requested, minimum);
                return Err(AllocError::BelowMinimumQuantity { requested, minimum });
            }
        }

        let job = ApplyTicketsJob::new(request_id, *user, raffle_id, quantity);
        queue.try_enqueue(&job)?;
        msg!("Queued purchase {} for raffle {}", request_id, raffle_id);
        Ok(Response::ok(
            STATUS_ACCEPTED,
            ResponseBody::Queued { request_id },
        ))
    }
}
