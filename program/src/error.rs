use thiserror::Error;

use crate::raffle_state::RaffleStatus;
use crate::state::RaffleId;

/// Errors that may be returned by the ticket allocation engine
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AllocError {
    /// Raffle is missing, deleted or not accepting applications
    #[error("Raffle {raffle_id} is not available for applications")]
    RaffleNotAvailable {
        raffle_id: RaffleId,
        /// None when the raffle does not exist
        status: Option<RaffleStatus>,
    },

    /// Fewer tickets requested than the raffle minimum
    #[error("Requested {requested} tickets, the raffle minimum is {minimum}")]
    BelowMinimumQuantity { requested: u32, minimum: u32 },

    /// Application would take the user over the per-user cap
    #[error("Requested {requested} tickets but only {remaining} of {cap} remain for this user")]
    PerUserCapExceeded {
        requested: u64,
        held: u64,
        cap: u64,
        remaining: u64,
    },

    /// User already holds tickets and only one application is allowed
    #[error("User already holds {held} tickets in raffle {raffle_id}")]
    AlreadyApplied { raffle_id: RaffleId, held: u64 },

    /// Application would exceed the tickets the raffle requires
    #[error("Raffle needs only {remaining} more tickets, requested {requested}")]
    RaffleSoldOut { requested: u64, remaining: u64 },

    /// Not enough eligible ticket credits
    #[error("Insufficient ticket credits: held {held}, required {required}")]
    InsufficientTicketCredits { held: u64, required: u64 },

    /// Not enough available currency balance
    #[error("Insufficient balance: available {available}, required {required}")]
    InsufficientCurrencyBalance { available: u64, required: u64 },

    /// Not enough free numbers left in the pool
    #[error("Ticket pool exhausted: requested {requested}, available {available}")]
    PoolExhausted { requested: u64, available: u64 },

    /// No requested binding could be cancelled
    #[error("None of the {requested} tickets could be cancelled")]
    NothingToCancel { requested: u64 },

    /// Binding does not exist in this raffle
    #[error("Ticket binding not found")]
    BindingNotFound,

    /// Raffle already has a winner
    #[error("Raffle {raffle_id} already has a winner")]
    WinnerAlreadyRecorded { raffle_id: RaffleId },

    /// Status change not allowed by the raffle lifecycle
    #[error("Raffle cannot move from {from} to {to}")]
    InvalidStatusTransition { from: RaffleStatus, to: RaffleStatus },

    /// Credit rows supplied less than the checked balance
    #[error("Credit decrement mismatch: requested {requested}, decremented {decremented}")]
    WalletDecrementMismatch { requested: u64, decremented: u64 },

    /// Binding refers to a credit batch that no longer exists
    #[error("Credit batch {batch_id} is missing")]
    CreditBatchMissing { batch_id: u64 },

    #[error("Arithmetic overflow")]
    ArithmeticOverflow,

    #[error("Lock on {resource} is poisoned")]
    LockPoisoned { resource: &'static str },

    /// Asynchronous attempt ran past its execution timeout
    #[error("Attempt exceeded the {seconds}s execution timeout")]
    Timeout { seconds: u64 },

    /// Attempt still running after its grace period; its outcome is unknown
    #[error("Attempt abandoned after {seconds}s, outcome unknown")]
    AttemptAbandoned { seconds: u64 },

    /// Deadline passed before the transaction could commit
    #[error("Allocation deadline passed before commit")]
    DeadlineExceeded,

    #[error("Job queue is full")]
    QueueFull,

    #[error("Job queue is closed")]
    QueueClosed,

    #[error("Invalid payload: {0}")]
    Codec(String),

    #[error("Worker task failed: {0}")]
    Worker(String),
}

impl AllocError {
    /// Stable machine-readable reason
    pub fn reason(&self) -> &'static str {
        match self {
            AllocError::RaffleNotAvailable { .. } => "raffle_not_available",
            AllocError::BelowMinimumQuantity { .. } => "below_minimum_quantity",
            AllocError::PerUserCapExceeded { .. } => "per_user_cap_exceeded",
            AllocError::AlreadyApplied { .. } => "already_applied",
            AllocError::RaffleSoldOut { .. } => "raffle_sold_out",
            AllocError::InsufficientTicketCredits { .. } => "insufficient_ticket_credits",
            AllocError::InsufficientCurrencyBalance { .. } => "insufficient_currency_balance",
            AllocError::PoolExhausted { .. } => "pool_exhausted",
            AllocError::NothingToCancel { .. } => "nothing_to_cancel",
            AllocError::BindingNotFound => "binding_not_found",
            AllocError::WinnerAlreadyRecorded { .. } => "winner_already_recorded",
            AllocError::InvalidStatusTransition { .. } => "invalid_status_transition",
            AllocError::WalletDecrementMismatch { .. } => "wallet_decrement_mismatch",
            AllocError::CreditBatchMissing { .. } => "credit_batch_missing",
            AllocError::ArithmeticOverflow => "arithmetic_overflow",
            AllocError::LockPoisoned { .. } => "lock_poisoned",
            AllocError::Timeout { .. } => "timeout",
            AllocError::AttemptAbandoned { .. } => "attempt_abandoned",
            AllocError::DeadlineExceeded => "deadline_exceeded",
            AllocError::QueueFull => "queue_full",
            AllocError::QueueClosed => "queue_closed",
            AllocError::Codec(_) => "invalid_payload",
            AllocError::Worker(_) => "worker_failed",
        }
    }

    /// Quantities and thresholds a client needs to render the failure
    pub fn details(&self) -> Vec<(&'static str, u64)> {
        match *self {
            AllocError::RaffleNotAvailable { raffle_id, .. } => vec![("raffle_id", raffle_id)],
            AllocError::BelowMinimumQuantity { requested, minimum } => {
                vec![("requested", u64::from(requested)), ("minimum", u64::from(minimum))]
            }
            AllocError::PerUserCapExceeded {
                requested,
                held,
                cap,
                remaining,
            } => vec![
                ("requested", requested),
                ("held", held),
                ("cap", cap),
                ("remaining", remaining),
            ],
            AllocError::AlreadyApplied { raffle_id, held } => {
                vec![("raffle_id", raffle_id), ("held", held)]
            }
            AllocError::RaffleSoldOut {
                requested,
                remaining,
            } => vec![("requested", requested), ("remaining", remaining)],
            AllocError::InsufficientTicketCredits { held, required } => {
                vec![("held", held), ("required", required)]
            }
            AllocError::InsufficientCurrencyBalance {
                available,
                required,
            } => vec![("available", available), ("required", required)],
            AllocError::PoolExhausted {
                requested,
                available,
            } => vec![("requested", requested), ("available", available)],
            AllocError::NothingToCancel { requested } => vec![("requested", requested)],
            AllocError::WinnerAlreadyRecorded { raffle_id } => vec![("raffle_id", raffle_id)],
            AllocError::WalletDecrementMismatch {
                requested,
                decremented,
            } => vec![("requested", requested), ("decremented", decremented)],
            AllocError::CreditBatchMissing { batch_id } => vec![("batch_id", batch_id)],
            AllocError::Timeout { seconds } | AllocError::AttemptAbandoned { seconds } => {
                vec![("seconds", seconds)]
            }
            _ => Vec::new(),
        }
    }

    /// User-facing rule violation, as opposed to an engine or infrastructure fault
    pub fn is_business_rule(&self) -> bool {
        matches!(
            self,
            AllocError::RaffleNotAvailable { .. }
                | AllocError::BelowMinimumQuantity { .. }
                | AllocError::PerUserCapExceeded { .. }
                | AllocError::AlreadyApplied { .. }
                | AllocError::RaffleSoldOut { .. }
                | AllocError::InsufficientTicketCredits { .. }
                | AllocError::InsufficientCurrencyBalance { .. }
                | AllocError::PoolExhausted { .. }
                | AllocError::NothingToCancel { .. }
                | AllocError::BindingNotFound
                | AllocError::WinnerAlreadyRecorded { .. }
                | AllocError::InvalidStatusTransition { .. }
        )
    }

    /// Retrying cannot change the outcome
    pub fn is_permanent(&self) -> bool {
        self.is_business_rule() || matches!(self, AllocError::Codec(_))
    }

    /// HTTP-equivalent status for the synchronous boundary
    pub fn http_status(&self) -> u16 {
        match self {
            AllocError::RaffleNotAvailable { status: None, .. } | AllocError::BindingNotFound => {
                404
            }
            AllocError::Codec(_) => 400,
            AllocError::QueueFull => 503,
            e if e.is_business_rule() => 400,
            _ => 500,
        }
    }
}
