//! Final step of task resolution once its callback has run.

use crate::core::error::BulletinError;
use crate::models::{Task, TaskState};
use crate::storage::RecordStore;
use crate::workpool::{CallbackJob, CompletionHandler, DeliveryError};
use async_trait::async_trait;

/// Deletes resolved tasks after their callback is delivered.
///
/// A callback that exhausted its retries on transient errors puts the task
/// back to `COMPLETED` so the next convergence pass retries it; a permanent
/// failure resolves the task anyway. Jobs that never report back (a crash,
/// or a pool shutdown that abandoned them) leave the task `RESOLVING` until
/// convergence kicks it.
pub struct TaskResolver {
    store: RecordStore,
}

impl TaskResolver {
    pub fn new(store: RecordStore) -> Self {
        Self { store }
    }

    async fn delete_resolving(&self, task_guid: &str) {
        let task = match self.store.get::<Task>(task_guid).await {
            Ok(task) => task,
            Err(BulletinError::NotFound { .. }) => return,
            Err(e) => {
                tracing::warn!(task_guid, error = %e, "failed to read resolving task");
                return;
            }
        };
        if task.record.state != TaskState::Resolving {
            return;
        }
        match self.store.delete::<Task>(task_guid, task.version).await {
            Ok(()) => tracing::debug!(task_guid, "task resolved"),
            Err(e) => tracing::debug!(task_guid, error = %e, "task changed during resolution"),
        }
    }
}

#[async_trait]
impl CompletionHandler for TaskResolver {
    async fn on_delivered(&self, job: &CallbackJob) {
        self.delete_resolving(&job.task_guid).await;
    }

    async fn on_failed(&self, job: &CallbackJob, error: &DeliveryError) {
        if !error.is_transient() {
            self.delete_resolving(&job.task_guid).await;
            return;
        }
        let Ok(mut task) = self.store.get::<Task>(&job.task_guid).await else {
            return;
        };
        if task.record.state != TaskState::Resolving {
            return;
        }
        task.record.transition(TaskState::Completed);
        if let Err(e) = self.store.compare_and_swap(task.version, &task.record).await {
            tracing::debug!(task_guid = %job.task_guid, error = %e, "task changed before retry");
        }
    }
}
