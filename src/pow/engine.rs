//! Parallel proof-of-work race
//!
//! Workers search disjoint nonce spaces on a dedicated rayon pool. The first
//! worker to find a solution claims the win, stops its siblings, assembles
//! the sealed broadcast and hands it to the completion callback. Losers exit
//! without side effects.

use crate::pow::work_proof::{assemble, WorkProof};
use bytes::Bytes;
use parking_lot::Mutex;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Default number of proof-of-work workers
pub const DEFAULT_WORKERS: usize = 4;

/// Receives the sealed broadcast frame from the winning worker
pub type SolvedCallback = Box<dyn FnOnce(Bytes) + Send + 'static>;

/// Proof-of-work errors
#[derive(Error, Debug)]
pub enum PowError {
    #[error("Invalid worker count {0} (must be 1..=256)")]
    InvalidWorkers(usize),
    #[error("Failed to build proof-of-work pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
    #[error("Proof-of-work engine is shut down")]
    ShutDown,
}

/// Shared state of one race
struct Race {
    claimed: AtomicBool,
    finished: AtomicBool,
    cancel: CancellationToken,
    on_solved: Mutex<Option<SolvedCallback>>,
}

impl Race {
    fn should_stop(&self) -> bool {
        self.finished.load(Ordering::Acquire) || self.cancel.is_cancelled()
    }

    /// The single mutually-exclusive step that elects the winner
    fn claim(&self) -> bool {
        self.claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Runs broadcast proof-of-work races on a lazily created pool
pub struct ProofOfWorkEngine {
    workers: usize,
    pool: Mutex<Option<Arc<ThreadPool>>>,
    cancel: CancellationToken,
}

impl ProofOfWorkEngine {
    /// Create an engine; the pool itself is built on first use
    pub fn new(workers: usize, cancel: CancellationToken) -> Result<Self, PowError> {
        if workers == 0 || workers > u8::MAX as usize + 1 {
            return Err(PowError::InvalidWorkers(workers));
        }

        Ok(Self {
            workers,
            pool: Mutex::new(None),
            cancel,
        })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Whether the pool has been created yet
    pub fn is_started(&self) -> bool {
        self.pool.lock().is_some()
    }

    /// Get the pool, creating it exactly once
    fn pool(&self) -> Result<Arc<ThreadPool>, PowError> {
        if self.cancel.is_cancelled() {
            return Err(PowError::ShutDown);
        }

        let mut slot = self.pool.lock();
        if let Some(pool) = slot.as_ref() {
            return Ok(Arc::clone(pool));
        }

        let pool = Arc::new(
            ThreadPoolBuilder::new()
                .num_threads(self.workers)
                .thread_name(|i| format!("pow-worker-{}", i))
                .build()?,
        );
        log::debug!("Started proof-of-work pool with {} workers", self.workers);
        *slot = Some(Arc::clone(&pool));
        Ok(pool)
    }

    /// Start a race for `source` at `difficulty`
    ///
    /// Returns as soon as the workers are queued. `on_solved` runs on the
    /// winning worker's thread with `source ‖ len ‖ nonce`, and never runs if
    /// the engine is shut down first.
    pub fn solve(
        &self,
        source: Bytes,
        difficulty: u32,
        on_solved: SolvedCallback,
    ) -> Result<(), PowError> {
        let pool = self.pool()?;
        let race = Arc::new(Race {
            claimed: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            cancel: self.cancel.child_token(),
            on_solved: Mutex::new(Some(on_solved)),
        });
        let started = Instant::now();

        for worker in 0..self.workers {
            let race = Arc::clone(&race);
            let source = source.clone();

            pool.spawn(move || {
                let proof = WorkProof::new(&source, worker as u8, difficulty);
                let Some(result) = proof.run(|| race.should_stop()) else {
                    return;
                };
                if !race.claim() {
                    return;
                }
                race.finished.store(true, Ordering::Release);

                log::debug!(
                    "Worker {} solved difficulty {} in {}ms ({} attempts)",
                    worker,
                    difficulty,
                    started.elapsed().as_millis(),
                    result.attempts
                );

                let frame = assemble(&source, &result.nonce);
                if let Some(callback) = race.on_solved.lock().take() {
                    callback(frame);
                }
            });
        }

        Ok(())
    }

    /// Cancel running races and dispose of the pool
    pub fn shutdown(&self) {
        self.cancel.cancel();
        if self.pool.lock().take().is_some() {
            log::debug!("Proof-of-work pool disposed");
        }
    }
}
