//! Convergence driver.
//!
//! Each pass reads a snapshot of desired LRPs, actual LRPs and tasks and
//! issues independent compare-and-swap corrections. A correction that loses
//! a race is skipped; the next pass sees the new state.
//!
//! Tasks left `RESOLVING` longer than the kick duration are put back to
//! `COMPLETED`, so a callback lost to a crash or an abandoned job is
//! delivered again.

use crate::core::error::{BulletinError, BulletinResult};
use crate::core::time::unix_nanos;
use crate::models::{ActualLrp, ActualLrpState, DesiredLrp, Record, Task, TaskState};
use crate::storage::{RecordSet, RecordStore, Versioned};
use crate::workpool::{CallbackJob, CallbackWorkPool};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Default time a task may stay resolving before it is kicked.
pub const DEFAULT_KICK_TASK_DURATION: Duration = Duration::from_secs(30);

/// What one pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConvergenceReport {
    pub desired_scanned: usize,
    pub actual_scanned: usize,
    pub tasks_scanned: usize,
    /// Unclaimed actuals created for missing indices.
    pub created_missing: usize,
    /// Actuals started for an older desired revision, reset to unclaimed.
    pub reset_stale: usize,
    /// Actuals beyond the desired count or without a desired LRP.
    pub retired: usize,
    /// Completed tasks moved to resolving and handed to the work pool.
    pub tasks_resolving: usize,
    /// Resolving tasks overdue for their callback, put back to completed.
    pub tasks_kicked: usize,
    /// Corrections skipped because a concurrent writer got there first.
    pub conflicts: usize,
    /// Records that could not be decoded or written.
    pub errors: usize,
}

impl ConvergenceReport {
    /// Total corrections applied.
    pub fn corrections(&self) -> usize {
        self.created_missing
            + self.reset_stale
            + self.retired
            + self.tasks_resolving
            + self.tasks_kicked
    }
}

/// Runs convergence passes on a fixed interval.
pub struct ConvergenceDriver {
    store: RecordStore,
    pool: Option<Arc<CallbackWorkPool>>,
    interval: Duration,
    kick_task_duration: Duration,
}

impl ConvergenceDriver {
    pub fn new(store: RecordStore, interval: Duration) -> Self {
        Self {
            store,
            pool: None,
            interval,
            kick_task_duration: DEFAULT_KICK_TASK_DURATION,
        }
    }

    /// How long a task may stay resolving before it is put back to completed.
    pub fn with_kick_task_duration(mut self, duration: Duration) -> Self {
        self.kick_task_duration = duration;
        self
    }

    /// Submit completed task callbacks to `pool`.
    pub fn with_work_pool(mut self, pool: Arc<CallbackWorkPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run passes until shutdown. A failed pass is logged and retried on
    /// the next tick.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> BulletinResult<()> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tracing::info!(interval_ms = self.interval.as_millis() as u64, "convergence started");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    match self.converge_once().await {
                        Ok(report) if report.corrections() > 0 || report.errors > 0 => {
                            tracing::info!(?report, "convergence pass applied corrections");
                        }
                        Ok(_) => tracing::debug!("convergence pass found nothing to do"),
                        Err(e) => tracing::warn!(error = %e, "convergence pass failed"),
                    }
                }
            }
        }
        tracing::info!("convergence stopped");
        Ok(())
    }

    fn decode_all<T: Record>(
        set: &RecordSet<T>,
        report: &mut ConvergenceReport,
    ) -> Vec<Versioned<T>> {
        let namespace = T::NAMESPACE;
        set.iter()
            .filter_map(|item| match item {
                Ok(v) => Some(v),
                Err(e) => {
                    report.errors += 1;
                    tracing::warn!(namespace = %namespace, error = %e, "skipping undecodable record");
                    None
                }
            })
            .collect()
    }

    fn tally(report: &mut ConvergenceReport, result: BulletinResult<()>, what: &str, key: &str) -> bool {
        match result {
            Ok(()) => true,
            Err(
                BulletinError::Conflict { .. }
                | BulletinError::NotFound { .. }
                | BulletinError::AlreadyExists { .. },
            ) => {
                report.conflicts += 1;
                tracing::debug!(key, correction = what, "lost race, skipping");
                false
            }
            Err(e) => {
                report.errors += 1;
                tracing::warn!(key, correction = what, error = %e, "correction failed");
                false
            }
        }
    }

    /// One reconciliation pass.
    pub async fn converge_once(&self) -> BulletinResult<ConvergenceReport> {
        let mut report = ConvergenceReport::default();

        let desired_set = self.store.get_all::<DesiredLrp>().await?;
        let actual_set = self.store.get_all::<ActualLrp>().await?;
        let desired = Self::decode_all(&desired_set, &mut report);
        let actual = Self::decode_all(&actual_set, &mut report);
        report.desired_scanned = desired.len();
        report.actual_scanned = actual.len();

        let desired_by_guid: HashMap<&str, &DesiredLrp> = desired
            .iter()
            .map(|d| (d.record.process_guid.as_str(), &d.record))
            .collect();
        let actual_by_index: HashMap<(&str, u32), &Versioned<ActualLrp>> = actual
            .iter()
            .map(|a| ((a.record.process_guid.as_str(), a.record.index), a))
            .collect();

        for d in desired.iter().map(|d| &d.record) {
            for index in 0..d.instances {
                match actual_by_index.get(&(d.process_guid.as_str(), index)) {
                    None => {
                        let lrp = ActualLrp::unclaimed(d, index, unix_nanos());
                        let result = self.store.create(&lrp).await.map(|_| ());
                        if Self::tally(&mut report, result, "create-missing", &lrp.key()) {
                            report.created_missing += 1;
                        }
                    }
                    Some(a) if Self::is_stale(&a.record, d) => {
                        let mut lrp = a.record.clone();
                        lrp.state = ActualLrpState::Unclaimed;
                        lrp.cell_id.clear();
                        lrp.desired_modification_tag = d.modification_tag.clone();
                        lrp.since = unix_nanos();
                        let result = self.store.compare_and_swap(a.version, &lrp).await.map(|_| ());
                        if Self::tally(&mut report, result, "reset-stale", &lrp.key()) {
                            report.reset_stale += 1;
                        }
                    }
                    Some(_) => {}
                }
            }
        }

        for a in &actual {
            let extra = match desired_by_guid.get(a.record.process_guid.as_str()) {
                Some(d) => a.record.index >= d.instances,
                None => true,
            };
            if !extra {
                continue;
            }
            let key = a.record.key();
            let result = self.store.delete::<ActualLrp>(&key, a.version).await;
            if Self::tally(&mut report, result, "retire", &key) {
                report.retired += 1;
            }
        }

        self.resolve_tasks(&mut report).await?;
        Ok(report)
    }

    fn is_stale(actual: &ActualLrp, desired: &DesiredLrp) -> bool {
        actual.desired_modification_tag != desired.modification_tag
            && actual
                .desired_modification_tag
                .succeeded_by(&desired.modification_tag)
    }

    async fn resolve_tasks(&self, report: &mut ConvergenceReport) -> BulletinResult<()> {
        let task_set = self.store.get_all::<Task>().await?;
        let tasks = Self::decode_all(&task_set, report);
        report.tasks_scanned = tasks.len();
        let now = unix_nanos();

        for Versioned {
            record: mut task,
            mut version,
        } in tasks
        {
            if task.state == TaskState::Resolving
                && task.unchanged_for(self.kick_task_duration, now)
            {
                task.transition(TaskState::Completed);
                match self.store.compare_and_swap(version, &task).await {
                    Ok(v) => {
                        version = v;
                        report.tasks_kicked += 1;
                        tracing::info!(task_guid = %task.task_guid, "kicked task stuck resolving");
                    }
                    Err(e) => {
                        Self::tally(report, Err(e), "kick-task", &task.task_guid);
                        continue;
                    }
                }
            }

            let Some(pool) = &self.pool else {
                continue;
            };
            if task.state != TaskState::Completed {
                continue;
            }
            let Some(url) = task.callback_url.clone() else {
                continue;
            };

            task.transition(TaskState::Resolving);
            let version = match self.store.compare_and_swap(version, &task).await {
                Ok(version) => version,
                Err(e) => {
                    Self::tally(report, Err(e), "resolve-task", &task.task_guid);
                    continue;
                }
            };

            let job = CallbackJob::new(task.task_guid.clone(), url, task.callback_payload());
            match pool.submit(job).await {
                Ok(()) => report.tasks_resolving += 1,
                Err(e) => {
                    report.errors += 1;
                    tracing::warn!(task_guid = %task.task_guid, error = %e, "callback not queued, reverting task");
                    task.transition(TaskState::Completed);
                    let result = self.store.compare_and_swap(version, &task).await.map(|_| ());
                    Self::tally(report, result, "revert-task", &task.task_guid);
                }
            }
        }
        Ok(())
    }
}
