// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//! upw-scheduler
//!
//! The process-wide background scheduler: one job per enabled monitor,
//! persisted through the store's `scheduler_jobs` collection so cadences
//! survive restarts. Fires submit pipeline runs to a semaphore-bounded
//! worker pool. A job never runs concurrently with itself: overlapping
//! fires are skipped, and two consecutive skips record a single `degraded`
//! result with message `overlapped`.

/// Interval and cron triggers.
pub mod trigger;

pub use trigger::{parse_cron, Trigger};

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use upw_core::{CheckResult, CheckStatus};
use upw_engine::Engine;
use upw_store::{MonitorStore, SchedulerJob, StoreError};

/// Scheduler tuning knobs.
#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    /// Worker-pool bound for concurrently running pipeline checks.
    pub max_concurrent_checks: usize,
    /// How long shutdown waits for in-flight checks before aborting them.
    pub shutdown_grace: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_checks: 32,
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

enum Command {
    Sync(String),
    Remove(String),
    Shutdown(oneshot::Sender<()>),
}

/// Cheap cloneable handle used by the API layer to react to monitor CRUD
/// and to stop the scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<Command>,
}

impl SchedulerHandle {
    /// Re-register the job for a created or updated monitor (replaces any
    /// previous job atomically; disabled or deleted monitors unschedule).
    pub async fn sync_monitor(&self, monitor_id: &str) {
        let _ = self.tx.send(Command::Sync(monitor_id.to_string())).await;
    }

    /// Unschedule a monitor's job.
    pub async fn remove_monitor(&self, monitor_id: &str) {
        let _ = self.tx.send(Command::Remove(monitor_id.to_string())).await;
    }

    /// Cooperative shutdown: stop submitting, wait for in-flight checks up
    /// to the configured grace period, then abort the rest.
    pub async fn shutdown(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(Command::Shutdown(ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }
    }
}

/// The background scheduler. Constructed via [`Scheduler::start`], which
/// reconciles persisted jobs against the monitor collection and spawns the
/// scheduling loop.
pub struct Scheduler;

impl Scheduler {
    /// Reconcile persisted jobs with the monitor collection, spawn the
    /// scheduling loop, and hand back its control handle.
    ///
    /// # Errors
    ///
    /// [`StoreError`] when the initial reconciliation cannot read or write
    /// job state.
    pub async fn start(
        engine: Arc<Engine>,
        store: Arc<dyn MonitorStore>,
        config: SchedulerConfig,
    ) -> Result<SchedulerHandle, StoreError> {
        let (tx, rx) = mpsc::channel(64);
        let mut inner = SchedulerLoop {
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_checks.max(1))),
            engine,
            store,
            config,
            jobs: HashMap::new(),
            tasks: JoinSet::new(),
            rx,
        };
        inner.reconcile().await?;
        info!(
            target: "upw.scheduler",
            jobs = inner.jobs.len(),
            "scheduler started"
        );
        tokio::spawn(inner.run());
        Ok(SchedulerHandle { tx })
    }
}

struct JobEntry {
    trigger: Trigger,
    next_run_at: DateTime<Utc>,
    running: Arc<AtomicBool>,
    overlap_streak: u32,
}

enum FireAction {
    Run(Arc<AtomicBool>),
    Skip,
    RecordOverlap,
}

struct SchedulerLoop {
    engine: Arc<Engine>,
    store: Arc<dyn MonitorStore>,
    config: SchedulerConfig,
    semaphore: Arc<Semaphore>,
    jobs: HashMap<String, JobEntry>,
    tasks: JoinSet<()>,
    rx: mpsc::Receiver<Command>,
}

impl SchedulerLoop {
    /// Startup reconciliation: enabled monitors get a job (resuming a
    /// persisted next-fire hint when the trigger is unchanged, catching up
    /// immediately when it was missed); persisted jobs for unknown or
    /// disabled monitors are removed.
    async fn reconcile(&mut self) -> Result<(), StoreError> {
        let monitors = self.store.list_monitors(None).await?;
        let persisted: HashMap<String, SchedulerJob> = self
            .store
            .list_jobs()
            .await?
            .into_iter()
            .map(|j| (j.monitor_id.clone(), j))
            .collect();
        let now = Utc::now();

        for monitor in &monitors {
            if !monitor.enabled {
                continue;
            }
            let trigger = match Trigger::for_monitor(monitor) {
                Ok(t) => t,
                Err(e) => {
                    warn!(
                        target: "upw.scheduler",
                        monitor_id = %monitor.id,
                        error = %e,
                        "skipping monitor with unusable trigger"
                    );
                    continue;
                }
            };
            let next = persisted
                .get(&monitor.id)
                .filter(|j| j.trigger_kind == trigger.kind() && j.trigger_spec == trigger.spec())
                .and_then(|j| j.next_run_at)
                .map(|hint| if hint <= now { now } else { hint })
                .or_else(|| trigger.next_fire(now));
            let Some(next) = next else { continue };

            self.jobs.insert(
                monitor.id.clone(),
                JobEntry {
                    trigger,
                    next_run_at: next,
                    running: Arc::new(AtomicBool::new(false)),
                    overlap_streak: 0,
                },
            );
            self.persist_job(&monitor.id).await;
        }

        for monitor_id in persisted.keys() {
            if !self.jobs.contains_key(monitor_id) {
                self.store.delete_job(monitor_id).await?;
            }
        }
        Ok(())
    }

    async fn run(mut self) {
        let ack = loop {
            let wait = self
                .jobs
                .values()
                .map(|j| j.next_run_at)
                .min()
                .map(|next| (next - Utc::now()).to_std().unwrap_or(Duration::ZERO));

            tokio::select! {
                cmd = self.rx.recv() => match cmd {
                    Some(Command::Sync(id)) => self.sync_monitor(&id).await,
                    Some(Command::Remove(id)) => self.remove_job(&id).await,
                    Some(Command::Shutdown(ack)) => break Some(ack),
                    None => break None,
                },
                () = sleep_or_park(wait) => self.fire_due().await,
                Some(_) = self.tasks.join_next(), if !self.tasks.is_empty() => {}
            }
        };

        info!(
            target: "upw.scheduler",
            in_flight = self.tasks.len(),
            "scheduler stopping"
        );
        let drained = tokio::time::timeout(self.config.shutdown_grace, async {
            while self.tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                target: "upw.scheduler",
                aborted = self.tasks.len(),
                "grace period elapsed, aborting in-flight checks"
            );
            self.tasks.abort_all();
        }
        if let Some(ack) = ack {
            let _ = ack.send(());
        }
    }

    async fn fire_due(&mut self) {
        let now = Utc::now();
        let due: Vec<String> = self
            .jobs
            .iter()
            .filter(|(_, job)| job.next_run_at <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for monitor_id in due {
            self.fire(&monitor_id, now).await;
        }
    }

    async fn fire(&mut self, monitor_id: &str, now: DateTime<Utc>) {
        let (next, action) = {
            let Some(job) = self.jobs.get_mut(monitor_id) else {
                return;
            };
            let next = job.trigger.next_fire(now);
            let action = if job.running.load(Ordering::SeqCst) {
                job.overlap_streak += 1;
                debug!(
                    target: "upw.scheduler",
                    monitor_id,
                    streak = job.overlap_streak,
                    "previous run still in flight, skipping fire"
                );
                if job.overlap_streak == 2 {
                    FireAction::RecordOverlap
                } else {
                    FireAction::Skip
                }
            } else {
                job.overlap_streak = 0;
                job.running.store(true, Ordering::SeqCst);
                FireAction::Run(job.running.clone())
            };
            (next, action)
        };

        match action {
            FireAction::Skip => {}
            FireAction::RecordOverlap => self.record_overlap(monitor_id, now).await,
            FireAction::Run(running) => {
                let engine = self.engine.clone();
                let store = self.store.clone();
                let semaphore = self.semaphore.clone();
                let id = monitor_id.to_string();
                self.tasks.spawn(async move {
                    let _permit = match semaphore.acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => {
                            running.store(false, Ordering::SeqCst);
                            return;
                        }
                    };
                    match store.get_monitor(&id).await {
                        Ok(Some(monitor)) if monitor.enabled => {
                            if let Err(e) = engine.run_and_record(&monitor, false).await {
                                // Do not crash the worker; the single result
                                // is dropped.
                                error!(
                                    target: "upw.scheduler",
                                    monitor_id = %id,
                                    error = %e,
                                    "scheduled result dropped"
                                );
                            }
                        }
                        Ok(_) => warn!(
                            target: "upw.scheduler",
                            monitor_id = %id,
                            "monitor vanished or disabled before its fire"
                        ),
                        Err(e) => error!(
                            target: "upw.scheduler",
                            monitor_id = %id,
                            error = %e,
                            "monitor load failed"
                        ),
                    }
                    running.store(false, Ordering::SeqCst);
                });
            }
        }

        match next {
            Some(next) => {
                if let Some(job) = self.jobs.get_mut(monitor_id) {
                    job.next_run_at = next;
                }
                self.persist_job(monitor_id).await;
            }
            None => {
                // Cron expressions can run out of future occurrences.
                self.remove_job(monitor_id).await;
            }
        }
    }

    async fn record_overlap(&self, monitor_id: &str, now: DateTime<Utc>) {
        let result = CheckResult {
            id: CheckResult::new_id(),
            monitor_id: monitor_id.to_string(),
            checked_at: now,
            status: CheckStatus::Degraded,
            message: "overlapped".into(),
            elapsed_ms: 0.0,
            details: serde_json::Map::new(),
        };
        if let Err(e) = self.store.append_result(&result).await {
            error!(
                target: "upw.scheduler",
                monitor_id,
                error = %e,
                "overlap result dropped"
            );
            return;
        }
        if let Err(e) = self
            .store
            .update_monitor_mirror(monitor_id, now, CheckStatus::Degraded)
            .await
        {
            warn!(
                target: "upw.scheduler",
                monitor_id,
                error = %e,
                "monitor mirror update failed"
            );
        }
    }

    async fn sync_monitor(&mut self, monitor_id: &str) {
        let monitor = match self.store.get_monitor(monitor_id).await {
            Ok(Some(monitor)) if monitor.enabled => monitor,
            Ok(_) => {
                self.remove_job(monitor_id).await;
                return;
            }
            Err(e) => {
                error!(
                    target: "upw.scheduler",
                    monitor_id,
                    error = %e,
                    "monitor load failed during sync"
                );
                return;
            }
        };

        let trigger = match Trigger::for_monitor(&monitor) {
            Ok(t) => t,
            Err(e) => {
                warn!(
                    target: "upw.scheduler",
                    monitor_id,
                    error = %e,
                    "unschedulable trigger, removing job"
                );
                self.remove_job(monitor_id).await;
                return;
            }
        };
        let Some(next) = trigger.next_fire(Utc::now()) else {
            self.remove_job(monitor_id).await;
            return;
        };

        // Replacing a job keeps its in-flight marker so overlap detection
        // survives re-registration.
        match self.jobs.get_mut(monitor_id) {
            Some(job) => {
                job.trigger = trigger;
                job.next_run_at = next;
            }
            None => {
                self.jobs.insert(
                    monitor_id.to_string(),
                    JobEntry {
                        trigger,
                        next_run_at: next,
                        running: Arc::new(AtomicBool::new(false)),
                        overlap_streak: 0,
                    },
                );
            }
        }
        self.persist_job(monitor_id).await;
        debug!(target: "upw.scheduler", monitor_id, "job (re)registered");
    }

    async fn remove_job(&mut self, monitor_id: &str) {
        self.jobs.remove(monitor_id);
        if let Err(e) = self.store.delete_job(monitor_id).await {
            warn!(
                target: "upw.scheduler",
                monitor_id,
                error = %e,
                "job record delete failed"
            );
        }
    }

    async fn persist_job(&self, monitor_id: &str) {
        let Some(job) = self.jobs.get(monitor_id) else {
            return;
        };
        let record = SchedulerJob {
            monitor_id: monitor_id.to_string(),
            trigger_kind: job.trigger.kind().to_string(),
            trigger_spec: job.trigger.spec(),
            next_run_at: Some(job.next_run_at),
            last_updated: Utc::now(),
        };
        if let Err(e) = self.store.upsert_job(&record).await {
            warn!(
                target: "upw.scheduler",
                monitor_id,
                error = %e,
                "job record upsert failed"
            );
        }
    }
}

async fn sleep_or_park(wait: Option<Duration>) {
    match wait {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending().await,
    }
}
