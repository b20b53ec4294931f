// Raffle Ticket Allocation Engine
// Binds numbers from a shared ticket pool to raffle participants

// Core modules
pub mod config;
pub mod error;
pub mod state;
pub mod utils;

// Ticket storage
pub mod ledger;
pub mod pool;
pub mod raffle_state;

// Allocation and cancellation
pub mod allocator;
pub mod cancellation;

// Boundaries
pub mod instruction;
pub mod job;
pub mod processor;
pub mod worker;

pub use allocator::{Allocator, AppliedBinding, AppliedTickets};
pub use config::{EngineConfig, ReapplyPolicy, WorkerConfig};
pub use error::AllocError;
pub use ledger::Ledger;
pub use processor::Processor;
