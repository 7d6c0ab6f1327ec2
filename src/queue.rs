//! In-memory job queue for vectorization tasks.
//!
//! The queue also owns the generation table: for every output path it
//! records the latest generation handed out and whether that generation has
//! already been settled (delivered or cancelled). Both live under one lock so
//! that superseding a pending job and assigning its generation are atomic.

use crate::error::SubmitError;
use crate::job::ConversionJob;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Default)]
struct Slot {
    /// Highest generation assigned for this output. Never reset.
    latest: u64,
    /// The latest generation was delivered or cancelled.
    settled: bool,
    /// Job waiting for a worker; always carries `latest`.
    pending: Option<ConversionJob>,
}

#[derive(Debug, Default)]
struct QueueState {
    slots: HashMap<PathBuf, Slot>,
    /// Output paths with a pending job, in arrival order.
    order: VecDeque<PathBuf>,
    closed: bool,
}

/// Job queue keyed by output path.
///
/// Holds at most one pending job per output path. A newer submission for the
/// same path replaces the pending one in place and bumps the generation, so
/// superseded jobs are never claimed.
///
/// The generation table keeps one small entry for every output path ever
/// submitted, settled or not, so a late result can never match a reused
/// generation. Memory therefore grows with the number of distinct outputs
/// over the queue's lifetime.
#[derive(Debug, Default)]
pub struct JobQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a job for `job.output_path`.
    ///
    /// Never blocks beyond the table lock.
    ///
    /// # Arguments
    ///
    /// * `job` - Job to enqueue; its `generation` is overwritten
    ///
    /// # Returns
    ///
    /// The generation assigned to the job
    ///
    /// # Errors
    ///
    /// Returns [`SubmitError::ShutDown`] once the queue is closed
    pub fn submit(&self, mut job: ConversionJob) -> Result<u64, SubmitError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.closed {
            return Err(SubmitError::ShutDown);
        }

        let slot = state.slots.entry(job.output_path.clone()).or_default();
        slot.latest += 1;
        slot.settled = false;
        job.generation = slot.latest;
        let generation = slot.latest;
        let output_path = job.output_path.clone();

        match slot.pending.replace(job) {
            Some(previous) => {
                debug!(
                    output_path = %output_path.display(),
                    superseded = previous.generation,
                    generation,
                    "Replaced pending job"
                );
            }
            None => state.order.push_back(output_path),
        }
        drop(guard);

        self.notify.notify_one();
        Ok(generation)
    }

    /// Takes the oldest pending job, if any. Returns `None` once closed.
    pub fn claim(&self) -> Option<ConversionJob> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.closed {
            return None;
        }
        while let Some(path) = state.order.pop_front() {
            if let Some(job) = state.slots.get_mut(&path).and_then(|slot| slot.pending.take()) {
                return Some(job);
            }
        }
        None
    }

    /// Waits for the next job. Returns `None` when the queue is closed or
    /// `shutdown` fires.
    pub async fn next(&self, shutdown: &CancellationToken) -> Option<ConversionJob> {
        loop {
            // Register interest before checking so a submit in between is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(job) = self.claim() {
                return Some(job);
            }
            if shutdown.is_cancelled() || self.is_closed() {
                return None;
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = shutdown.cancelled() => return None,
            }
        }
    }

    /// Returns `true` if `generation` is no longer reportable for `output_path`.
    pub fn is_stale(&self, output_path: &Path, generation: u64) -> bool {
        let state = self.state.lock();
        match state.slots.get(output_path) {
            Some(slot) => slot.latest != generation || slot.settled,
            None => true,
        }
    }

    /// Settles `generation` and runs `deliver` while still holding the lock.
    ///
    /// Returns `false` without calling `deliver` if the generation is stale.
    /// Running `deliver` under the lock keeps deliveries for one output in
    /// generation order.
    pub fn settle<F>(&self, output_path: &Path, generation: u64, deliver: F) -> bool
    where
        F: FnOnce(),
    {
        let mut state = self.state.lock();
        match state.slots.get_mut(output_path) {
            Some(slot) if slot.latest == generation && !slot.settled => {
                slot.settled = true;
                deliver();
                true
            }
            _ => false,
        }
    }

    /// Settles the latest generation of `output_path` without a result.
    ///
    /// Drops the pending job if there is one and calls `notify` with the
    /// cancelled generation. Returns that generation, or `None` if nothing
    /// was outstanding.
    pub fn cancel<F>(&self, output_path: &Path, notify: F) -> Option<u64>
    where
        F: FnOnce(u64),
    {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let slot = state.slots.get_mut(output_path)?;
        if slot.settled {
            return None;
        }

        slot.settled = true;
        if slot.pending.take().is_some() {
            state.order.retain(|path| path != output_path);
        }
        let generation = slot.latest;
        notify(generation);
        Some(generation)
    }

    /// Stops all further claims and submissions and hands back the jobs
    /// that never reached a worker. Idempotent.
    pub fn close(&self) -> Vec<ConversionJob> {
        let abandoned = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            state.closed = true;
            let order = std::mem::take(&mut state.order);
            order
                .into_iter()
                .filter_map(|path| state.slots.get_mut(&path).and_then(|slot| slot.pending.take()))
                .collect::<Vec<_>>()
        };
        self.notify.notify_waiters();
        abandoned
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Number of jobs waiting for a worker.
    pub fn pending_len(&self) -> usize {
        self.state.lock().order.len()
    }

    /// Latest generation assigned for `output_path`, if any.
    pub fn latest_generation(&self, output_path: &Path) -> Option<u64> {
        self.state.lock().slots.get(output_path).map(|slot| slot.latest)
    }
}
