// Raffle Ticket Allocation - Configuration
use std::time::Duration;

/// Whether a user may apply to the same raffle more than once
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReapplyPolicy {
    /// Further applications top up the holding, bounded by the per-user cap
    TopUp,
    /// Any second application is rejected with `AlreadyApplied`
    SingleApplication,
}

/// Engine-wide settings
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Numbers seeded into the global pool, 0..pool_size
    pub pool_size: u32,
    /// Width of the zero-padded ticket label
    pub ticket_digits: usize,
    /// Re-application rule shared by the sync and async paths
    pub reapply_policy: ReapplyPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pool_size: 10_000_000,
            ticket_digits: 7,
            reapply_policy: ReapplyPolicy::TopUp,
        }
    }
}

/// Settings of the asynchronous purchase queue
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    /// Concurrent worker tasks draining the queue
    pub workers: usize,
    /// Attempts per job, including the first one
    pub max_attempts: u32,
    /// Fixed pause between attempts
    pub backoff: Duration,
    /// Hard limit on a single attempt
    pub job_timeout: Duration,
    /// Extra wait for an attempt that outlived `job_timeout` before it is abandoned
    pub grace_period: Duration,
    /// Buffered messages before enqueueing fails with `QueueFull`
    pub queue_capacity: usize,
    /// Records kept in the journal, and request ids remembered for dedup
    pub journal_capacity: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_attempts: 3,
            backoff: Duration::from_secs(10),
            job_timeout: Duration::from_secs(120),
            grace_period: Duration::from_secs(30),
            queue_capacity: 1024,
            journal_capacity: 10_000,
        }
    }
}
