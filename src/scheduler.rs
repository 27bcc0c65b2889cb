//! Bounded worker pool that runs one mirror session per account.
//!
//! Workers are spawned on demand while fewer than `max_workers` are alive and
//! exit as soon as they find the queue empty. Enqueueing blocks while the
//! queue is full, which throttles the producer to the pace of the pool.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::accounts::Account;
use crate::cancel::CancellationToken;
use crate::connection::{Connector, MailboxConnection};
use crate::error::{MigrateError, Result};
use crate::folders::FolderMap;
use crate::mirror::{MailboxMirror, MirrorReport, LOG_SYSTEM};
use crate::runlog::RunLog;
use crate::store::TrackingStore;

/// Queue slots per worker.
const QUEUE_FACTOR: usize = 15;

#[derive(Debug, Clone)]
pub struct Job {
    pub account: Account,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Every folder was walked; the account is now marked done.
    Completed,
    /// A shutdown request stopped the session early.
    Interrupted,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct JobSummary {
    pub account_id: String,
    pub copied: u64,
    pub skipped: u64,
    pub elapsed: Duration,
    pub outcome: JobOutcome,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScheduleStats {
    pub scheduled: usize,
    pub already_done: usize,
    /// Accounts not queued because a shutdown was in progress.
    pub rejected: usize,
}

#[derive(Default)]
struct PoolState {
    queue: VecDeque<Job>,
    live: HashSet<u64>,
    next_worker_id: u64,
    peak_live: usize,
    closing: bool,
    summaries: Vec<JobSummary>,
}

struct Shared {
    state: Mutex<PoolState>,
    not_full: Condvar,
    drained: Condvar,
    max_workers: usize,
    capacity: usize,
    cancel: CancellationToken,
    store: Arc<dyn TrackingStore>,
    connector: Arc<dyn Connector>,
    folder_map: FolderMap,
    run_log: Arc<RunLog>,
}

#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl Scheduler {
    pub fn new(
        max_workers: usize,
        store: Arc<dyn TrackingStore>,
        connector: Arc<dyn Connector>,
        folder_map: FolderMap,
        run_log: Arc<RunLog>,
    ) -> Self {
        let max_workers = max_workers.max(1);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(PoolState::default()),
                not_full: Condvar::new(),
                drained: Condvar::new(),
                max_workers,
                capacity: max_workers * QUEUE_FACTOR,
                cancel: CancellationToken::new(),
                store,
                connector,
                folder_map,
                run_log,
            }),
        }
    }

    /// Queues a job per account that is not yet done, optionally restricted
    /// to `only`. Unknown ids in `only` fail before anything is queued.
    pub fn schedule(
        &self,
        accounts: &[Account],
        only: Option<&HashSet<String>>,
    ) -> Result<ScheduleStats> {
        if let Some(only) = only {
            let known: HashSet<&str> = accounts.iter().map(|a| a.canonical_id.as_str()).collect();
            let mut unknown: Vec<String> = only
                .iter()
                .filter(|id| !known.contains(id.as_str()))
                .cloned()
                .collect();
            if !unknown.is_empty() {
                unknown.sort();
                return Err(MigrateError::UnknownAccounts(unknown));
            }
            self.shared.run_log.info(&format!(
                "MAIN: Restricting migration to {} account(s)",
                only.len()
            ));
        }

        self.shared.run_log.info("MAIN: Scheduling migrations ...");
        let mut stats = ScheduleStats::default();

        // Jobs already queued must not be killed by the caller bailing out.
        if let Err(e) = self.enqueue_all(accounts, only, &mut stats) {
            self.shared.run_log.error(&format!(
                "MAIN: Scheduling failed after {} accounts: {}. Shutting down.",
                stats.scheduled, e
            ));
            self.request_shutdown();
            self.wait_for_drain();
            return Err(e);
        }

        self.shared.run_log.info(&format!(
            "MAIN: Finished scheduling {} accounts ({} already done, {} rejected)",
            stats.scheduled, stats.already_done, stats.rejected
        ));
        Ok(stats)
    }

    fn enqueue_all(
        &self,
        accounts: &[Account],
        only: Option<&HashSet<String>>,
        stats: &mut ScheduleStats,
    ) -> Result<()> {
        for account in accounts {
            if let Some(only) = only {
                if !only.contains(&account.canonical_id) {
                    continue;
                }
            }

            if self.shared.store.is_done(&account.canonical_id)? {
                log::debug!("Account {} is already done, skipping", account.canonical_id);
                stats.already_done += 1;
                continue;
            }

            if self.enqueue(Job {
                account: account.clone(),
            }) {
                stats.scheduled += 1;
            } else {
                stats.rejected += 1;
            }
        }
        Ok(())
    }

    /// Blocks while the queue is full. Returns false if the pool is shutting
    /// down and the job was dropped.
    pub fn enqueue(&self, job: Job) -> bool {
        let shared = &self.shared;
        let mut state = shared.lock();
        while state.queue.len() >= shared.capacity && !state.closing {
            state = match shared.not_full.wait(state) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
        if state.closing {
            log::debug!("Rejecting {}: shutting down", job.account.canonical_id);
            return false;
        }

        state.queue.push_back(job);
        if state.live.len() < shared.max_workers {
            Shared::spawn_worker(shared, &mut state);
        }
        true
    }

    /// Blocks until every worker has exited.
    pub fn wait_for_drain(&self) {
        let shared = &self.shared;
        let mut state = shared.lock();
        while !state.live.is_empty() {
            state = match shared.drained.wait(state) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }

    /// Stops accepting work and asks running sessions to stop at their next
    /// checkpoint. Safe to call more than once.
    pub fn request_shutdown(&self) {
        let shared = &self.shared;
        {
            let mut state = shared.lock();
            if !state.closing {
                state.closing = true;
                shared.run_log.info("MAIN: Shutdown requested, draining workers");
            }
        }
        shared.cancel.cancel();
        shared.not_full.notify_all();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.lock().closing
    }

    pub fn live_workers(&self) -> usize {
        self.shared.lock().live.len()
    }

    pub fn peak_workers(&self) -> usize {
        self.shared.lock().peak_live
    }

    pub fn queued(&self) -> usize {
        self.shared.lock().queue.len()
    }

    /// Summaries of finished jobs, in completion order.
    pub fn summaries(&self) -> Vec<JobSummary> {
        self.shared.lock().summaries.clone()
    }
}

/// Deregisters a worker when its thread ends, panics included.
struct WorkerGuard {
    shared: Arc<Shared>,
    id: u64,
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        state.live.remove(&self.id);
        self.shared.drained.notify_all();
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn spawn_worker(shared: &Arc<Shared>, state: &mut PoolState) {
        let id = state.next_worker_id;
        state.next_worker_id += 1;
        state.live.insert(id);
        state.peak_live = state.peak_live.max(state.live.len());

        let worker_shared = shared.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("migrate-worker-{}", id))
            .spawn(move || worker_loop(worker_shared, id));

        if let Err(e) = spawned {
            state.live.remove(&id);
            let message = format!("[{}] Could not start worker thread: {}", id, e);
            shared.run_log.error(&message);
        }
    }

    /// A worker that gets `None` has already been deregistered, so a
    /// concurrent `enqueue` will spawn a replacement.
    fn next_job(&self, id: u64) -> Option<Job> {
        let mut state = self.lock();
        let reason = if state.closing {
            "shutdown requested"
        } else if let Some(job) = state.queue.pop_front() {
            self.not_full.notify_one();
            return Some(job);
        } else {
            "found no jobs"
        };

        state.live.remove(&id);
        self.drained.notify_all();
        self.run_log.info(&format!("[{}] Worker spinning down: {}.", id, reason));
        None
    }

    fn execute(&self, id: u64, job: &Job) -> JobSummary {
        let account_id = &job.account.canonical_id;
        self.run_log.info(&format!("[{}] Starting migration for {}", id, account_id));
        self.log_event(account_id, "INFO: Starting migration");

        let started = Instant::now();
        let mut report = MirrorReport::default();
        let result = self.run_job(job, &mut report);
        let elapsed = started.elapsed();
        let seconds = elapsed.as_secs_f64();

        let outcome = match result {
            Ok(()) => {
                let (verb, ending) = if report.completed_fully {
                    ("finished", "terminated normally")
                } else {
                    ("interrupted", "interrupted by shutdown")
                };
                self.run_log.info(&format!(
                    "[{}] {} {} copied {} skipped {} took {:.1} seconds",
                    id, verb, account_id, report.copied, report.skipped, seconds
                ));
                self.log_event(
                    account_id,
                    &format!(
                        "INFO: Migration {}, copied {} skipped {} took {:.1} seconds",
                        ending, report.copied, report.skipped, seconds
                    ),
                );
                if report.completed_fully {
                    JobOutcome::Completed
                } else {
                    JobOutcome::Interrupted
                }
            }
            Err(e) => {
                if let Some(summary) = &report.error_summary {
                    self.run_log.error(&format!("[{}] For user {}: {}", id, account_id, summary));
                }
                self.run_log.error(&format!(
                    "[{}] For user {}: {} -- Aborting after {:.1} seconds",
                    id, account_id, e, seconds
                ));
                self.log_event(
                    account_id,
                    &format!(
                        "ERROR: Migration terminated abnormally, copied {} skipped {}, aborted after {:.1} seconds: {}",
                        report.copied, report.skipped, seconds, e
                    ),
                );
                JobOutcome::Failed(e.to_string())
            }
        };

        JobSummary {
            account_id: account_id.clone(),
            copied: report.copied,
            skipped: report.skipped,
            elapsed,
            outcome,
        }
    }

    fn run_job(&self, job: &Job, report: &mut MirrorReport) -> Result<()> {
        let account_id = &job.account.canonical_id;
        let done = self.store.migrated_fingerprints(account_id)?;

        let mut source = self.connector.connect(&job.account.source)?;
        let mut destination = match self.connector.connect(&job.account.destination) {
            Ok(destination) => destination,
            Err(e) => {
                close_quietly(account_id, source.as_mut());
                return Err(e);
            }
        };

        let result = {
            let mut mirror = MailboxMirror::new(
                account_id,
                source.as_mut(),
                destination.as_mut(),
                self.store.as_ref(),
                done,
                &self.folder_map,
                self.cancel.clone(),
            );
            let result = mirror.run();
            *report = mirror.report();
            result
        };

        close_quietly(account_id, source.as_mut());
        close_quietly(account_id, destination.as_mut());

        if result?.completed_fully {
            self.log_event(account_id, "INFO: Marking user as done");
            self.store.mark_done(account_id)?;
        }
        Ok(())
    }

    fn log_event(&self, account_id: &str, message: &str) {
        if let Err(e) = self.store.append_log(LOG_SYSTEM, account_id, message) {
            self.run_log.warn(&format!(
                "Could not write to tracking store log for {}: {}",
                account_id, e
            ));
        }
    }
}

fn worker_loop(shared: Arc<Shared>, id: u64) {
    let _guard = WorkerGuard {
        shared: shared.clone(),
        id,
    };
    shared.run_log.info(&format!("[{}] Worker spinning up.", id));

    while let Some(job) = shared.next_job(id) {
        let summary = shared.execute(id, &job);
        shared.lock().summaries.push(summary);
    }
}

fn close_quietly(account_id: &str, connection: &mut dyn MailboxConnection) {
    if let Err(e) = connection.logout() {
        log::debug!("[{}] Logout failed: {}", account_id, e);
    }
}
