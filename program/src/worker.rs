// Raffle Ticket Allocation - Purchase Queue
use solana_program::msg;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

use crate::allocator::{Allocator, AppliedTickets};
use crate::config::WorkerConfig;
use crate::error::AllocError;
use crate::job::ApplyTicketsJob;
use crate::ledger::Ledger;

/// Runs one attempt of a queued job
pub trait JobExecutor: Send + Sync + 'static {
    /// Must not commit anything once `deadline` has passed
    fn execute(
        &self,
        job: &ApplyTicketsJob,
        deadline: Instant,
    ) -> Result<AppliedTickets, AllocError>;
}

impl JobExecutor for Ledger {
    fn execute(
        &self,
        job: &ApplyTicketsJob,
        deadline: Instant,
    ) -> Result<AppliedTickets, AllocError> {
        Allocator::apply_tickets_with_wallet(
            self,
            &job.user,
            job.raffle_id,
            job.quantity,
            Some(deadline),
        )
    }
}

/// Final state of a job
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed { attempts: u32, tickets: Vec<u32> },
    /// Permanent business-rule failure, not retried
    Discarded { attempts: u32, error: AllocError },
    /// Retries exhausted or outcome unknown; kept for operator inspection
    Failed { attempts: u32, error: AllocError },
    /// Request id already processed
    Duplicate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobRecord {
    pub job: ApplyTicketsJob,
    pub outcome: JobOutcome,
}

/// Request ids seen recently, oldest first
#[derive(Default)]
struct DedupWindow {
    ids: HashSet<u64>,
    order: VecDeque<u64>,
}

/// What happened to the jobs the queue took.
///
/// Both the record log and the dedup window hold at most `capacity` entries
/// and drop the oldest first. Operators should `drain` the log regularly to
/// keep failed jobs; a request id that left the window is processed again.
pub struct JobJournal {
    capacity: usize,
    seen: Mutex<DedupWindow>,
    records: Mutex<VecDeque<JobRecord>>,
    undecodable: AtomicU64,
}

impl JobJournal {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            seen: Mutex::new(DedupWindow::default()),
            records: Mutex::new(VecDeque::new()),
            undecodable: AtomicU64::new(0),
        }
    }

    /// True the first time a request id is claimed within the window
    fn claim(&self, request_id: u64) -> Result<bool, AllocError> {
        let mut seen = self
            .seen
            .lock()
            .map_err(|_| AllocError::LockPoisoned { resource: "job journal" })?;
        if !seen.ids.insert(request_id) {
            return Ok(false);
        }
        seen.order.push_back(request_id);
        while seen.order.len() > self.capacity {
            if let Some(oldest) = seen.order.pop_front() {
                seen.ids.remove(&oldest);
            }
        }
        Ok(true)
    }

    fn record(&self, job: ApplyTicketsJob, outcome: JobOutcome) {
        match self.records.lock() {
            Ok(mut records) => {
                records.push_back(JobRecord { job, outcome });
                while records.len() > self.capacity {
                    records.pop_front();
                }
            }
            Err(_) => msg!(
                "Journal lock poisoned, request {} outcome lost: {:?}",
                job.request_id,
                outcome
            ),
        }
    }

    fn record_undecodable(&self) {
        self.undecodable.fetch_add(1, Ordering::SeqCst);
    }

    pub fn records(&self) -> Vec<JobRecord> {
        self.records
            .lock()
            .map(|records| records.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Take every record out of the log
    pub fn drain(&self) -> Vec<JobRecord> {
        self.records
            .lock()
            .map(|mut records| records.drain(..).collect())
            .unwrap_or_default()
    }

    /// Jobs that exhausted their retries or were abandoned
    pub fn failed(&self) -> Vec<JobRecord> {
        self.records()
            .into_iter()
            .filter(|r| matches!(r.outcome, JobOutcome::Failed { .. }))
            .collect()
    }

    /// Outcome of the first processing of `request_id`
    pub fn outcome(&self, request_id: u64) -> Option<JobOutcome> {
        self.records()
            .into_iter()
            .find(|r| r.job.request_id == request_id && r.outcome != JobOutcome::Duplicate)
            .map(|r| r.outcome)
    }

    /// Messages dropped because they did not decode to a job
    pub fn undecodable(&self) -> u64 {
        self.undecodable.load(Ordering::SeqCst)
    }
}

/// Bounded queue drained by a pool of tokio workers
pub struct JobQueue {
    sender: mpsc::Sender<Vec<u8>>,
    journal: Arc<JobJournal>,
    workers: Vec<JoinHandle<()>>,
}

impl JobQueue {
    /// Spawn `config.workers` workers on the current runtime
    pub fn start<E: JobExecutor>(executor: Arc<E>, config: WorkerConfig) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let journal = Arc::new(JobJournal::new(config.journal_capacity));

        let workers = (0..config.workers.max(1))
            .map(|worker_id| {
                tokio::spawn(run_worker(
                    worker_id,
                    receiver.clone(),
                    executor.clone(),
                    config.clone(),
                    journal.clone(),
                ))
            })
            .collect();

        msg!("Purchase queue started with {} workers", config.workers.max(1));
        Self {
            sender,
            journal,
            workers,
        }
    }

    pub async fn enqueue(&self, job: &ApplyTicketsJob) -> Result<(), AllocError> {
        self.sender
            .send(job.to_bytes())
            .await
            .map_err(|_| AllocError::QueueClosed)
    }

    /// Non-blocking enqueue for synchronous callers
    pub fn try_enqueue(&self, job: &ApplyTicketsJob) -> Result<(), AllocError> {
        self.try_enqueue_bytes(job.to_bytes())
    }

    /// Enqueue a packed job as received from an external producer
    pub fn try_enqueue_bytes(&self, payload: Vec<u8>) -> Result<(), AllocError> {
        self.sender.try_send(payload).map_err(|e| match e {
            TrySendError::Full(_) => AllocError::QueueFull,
            TrySendError::Closed(_) => AllocError::QueueClosed,
        })
    }

    pub fn journal(&self) -> Arc<JobJournal> {
        self.journal.clone()
    }

    /// Stop accepting jobs, drain what is queued and wait for the workers
    pub async fn shutdown(self) -> Arc<JobJournal> {
        drop(self.sender);
        for worker in self.workers {
            if let Err(e) = worker.await {
                msg!("Worker ended abnormally: {}", e);
            }
        }
        self.journal
    }
}

async fn run_worker<E: JobExecutor>(
    worker_id: usize,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>>,
    executor: Arc<E>,
    config: WorkerConfig,
    journal: Arc<JobJournal>,
) {
    loop {
        let payload = {
            let mut receiver = receiver.lock().await;
            receiver.recv().await
        };
        let payload = match payload {
            Some(payload) => payload,
            None => break,
        };

        let job = match ApplyTicketsJob::from_bytes(&payload) {
            Ok(job) => job,
            Err(e) => {
                msg!("Worker {}: dropping undecodable job: {}", worker_id, e);
                journal.record_undecodable();
                continue;
            }
        };

        match journal.claim(job.request_id) {
            Ok(true) => {}
            Ok(false) => {
                msg!("Worker {}: request {} already processed", worker_id, job.request_id);
                journal.record(job, JobOutcome::Duplicate);
                continue;
            }
            Err(error) => {
                msg!("Worker {}: request {} not claimed: {}", worker_id, job.request_id, error);
                journal.record(job, JobOutcome::Failed { attempts: 0, error });
                continue;
            }
        }

        let outcome = process_job(worker_id, &executor, &config, &job).await;
        journal.record(job, outcome);
    }
}

async fn process_job<E: JobExecutor>(
    worker_id: usize,
    executor: &Arc<E>,
    config: &WorkerConfig,
    job: &ApplyTicketsJob,
) -> JobOutcome {
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        msg!(
            "Worker {}: request {} attempt {}/{}",
            worker_id,
            job.request_id,
            attempt,
            max_attempts
        );

        let error = match run_attempt(executor, config, job).await {
            Ok(applied) => {
                msg!(
                    "Worker {}: request {} bound {} tickets",
                    worker_id,
                    job.request_id,
                    applied.bindings.len()
                );
                return JobOutcome::Completed {
                    attempts: attempt,
                    tickets: applied.bindings.iter().map(|b| b.ticket_number).collect(),
                };
            }
            Err(error) => error,
        };

        if let AllocError::AttemptAbandoned { .. } = error {
            msg!(
                "Worker {}: request {} abandoned, not retried: {}",
                worker_id,
                job.request_id,
                error
            );
            return JobOutcome::Failed {
                attempts: attempt,
                error,
            };
        }
        if error.is_permanent() {
            msg!(
                "Worker {}: request {} discarded: {}",
                worker_id,
                job.request_id,
                error
            );
            return JobOutcome::Discarded {
                attempts: attempt,
                error,
            };
        }
        if attempt >= max_attempts {
            msg!(
                "Worker {}: request {} failed after {} attempts: {}",
                worker_id,
                job.request_id,
                attempt,
                error
            );
            return JobOutcome::Failed {
                attempts: attempt,
                error,
            };
        }

        msg!(
            "Worker {}: request {} will retry in {:?}: {}",
            worker_id,
            job.request_id,
            config.backoff,
            error
        );
        tokio::time::sleep(config.backoff).await;
    }
}

/// One attempt under the hard timeout.
///
/// The blocking task cannot be killed, so on timeout it is awaited for up to
/// `grace_period` more: past the deadline it aborts before committing, and if
/// it committed just in time its result is kept rather than retried. A task
/// still running after the grace period is abandoned and its job is never
/// retried, since it may yet commit.
async fn run_attempt<E: JobExecutor>(
    executor: &Arc<E>,
    config: &WorkerConfig,
    job: &ApplyTicketsJob,
) -> Result<AppliedTickets, AllocError> {
    let deadline = Instant::now() + config.job_timeout;
    let task_executor = executor.clone();
    let task_job = *job;
    let mut handle =
        tokio::task::spawn_blocking(move || task_executor.execute(&task_job, deadline));

    let joined = match tokio::time::timeout(config.job_timeout, &mut handle).await {
        Ok(joined) => joined,
        Err(_) => match tokio::time::timeout(config.grace_period, handle).await {
            Ok(Ok(Ok(applied))) => return Ok(applied),
            Ok(Ok(Err(_))) | Ok(Err(_)) => {
                return Err(AllocError::Timeout {
                    seconds: config.job_timeout.as_secs(),
                })
            }
            Err(_) => {
                return Err(AllocError::AttemptAbandoned {
                    seconds: (config.job_timeout + config.grace_period).as_secs(),
                })
            }
        },
    };

    match joined {
        Ok(result) => result,
        Err(e) => Err(AllocError::Worker(e.to_string())),
    }
}
