//! Task scheduler — poll, select, process, confirm.
//!
//! At most one task pipeline runs per worker process. The scheduler's state
//! machine is claimed before the queue is read and released when the attempt
//! settles, so a poll that fires while another is in flight is a no-op.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::DEFAULT_POLL_INTERVAL;
use crate::error::{Error, QueueError};
use crate::publish::ArtifactPublisher;
use crate::queue::QueueClient;
use crate::runtime::ExecutionEnvironment;
use crate::task::{ExecutionResult, Submission, Task, TaskId, WorkerId, select_task};
use crate::workspace::WorkspaceStore;

/// What the scheduler is doing right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    /// Reading the queue snapshot.
    Polling,
    Processing(TaskId),
}

/// Result of a single poll.
#[derive(Debug)]
pub enum PollOutcome {
    /// Another attempt was in flight; nothing was fetched.
    Busy,
    /// The queue read failed.
    QueueUnavailable(QueueError),
    /// Every task in the snapshot is already confirmed by this worker.
    NoEligibleTask,
    /// The task ran to completion and the confirmation was recorded.
    Completed(ExecutionResult),
    /// A pipeline stage failed; the task stays unconfirmed.
    Failed { task_id: TaskId, error: Error },
}

/// Holds the single-flight claim; returns the state to `Idle` on drop.
struct InFlight<'a> {
    state: &'a Mutex<SchedulerState>,
}

impl<'a> InFlight<'a> {
    fn try_claim(state: &'a Mutex<SchedulerState>) -> Option<Self> {
        let mut current = state.lock().unwrap_or_else(PoisonError::into_inner);
        if *current != SchedulerState::Idle {
            return None;
        }
        *current = SchedulerState::Polling;
        Some(Self { state })
    }

    fn processing(&self, task_id: &TaskId) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) =
            SchedulerState::Processing(task_id.clone());
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = SchedulerState::Idle;
    }
}

/// Drives the worker's poll → process → confirm cycle.
pub struct Scheduler {
    identity: WorkerId,
    queue: Arc<dyn QueueClient>,
    workspaces: WorkspaceStore,
    runtime: ExecutionEnvironment,
    publisher: ArtifactPublisher,
    poll_interval: Duration,
    retain_workspaces: bool,
    state: Mutex<SchedulerState>,
}

impl Scheduler {
    pub fn new(
        identity: WorkerId,
        queue: Arc<dyn QueueClient>,
        workspaces: WorkspaceStore,
        runtime: ExecutionEnvironment,
        publisher: ArtifactPublisher,
    ) -> Self {
        Self {
            identity,
            queue,
            workspaces,
            runtime,
            publisher,
            poll_interval: DEFAULT_POLL_INTERVAL,
            retain_workspaces: false,
            state: Mutex::new(SchedulerState::Idle),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Keep workspaces on disk after a confirmed task.
    pub fn retain_workspaces(mut self, retain: bool) -> Self {
        self.retain_workspaces = retain;
        self
    }

    pub fn identity(&self) -> &WorkerId {
        &self.identity
    }

    pub fn state(&self) -> SchedulerState {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Poll the queue once and process the first eligible task.
    pub async fn poll_once(&self) -> PollOutcome {
        self.poll(&CancellationToken::new()).await
    }

    /// Poll at a fixed interval until `shutdown` is cancelled.
    ///
    /// Cancelling `shutdown` also stops whatever command the in-flight
    /// attempt is running.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            identity = %self.identity,
            interval = ?self.poll_interval,
            "Scheduler started"
        );

        loop {
            // Outcomes are logged inside `poll`.
            self.poll(&shutdown).await;

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = shutdown.cancelled() => break,
            }
        }

        info!("Scheduler stopped");
    }

    async fn poll(&self, cancel: &CancellationToken) -> PollOutcome {
        debug!(identity = %self.identity, "Polling task queue");
        let Some(guard) = InFlight::try_claim(&self.state) else {
            debug!("Task already in progress, skipping poll");
            return PollOutcome::Busy;
        };

        let tasks = match self.queue.list_pending().await {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(error = %e, "Queue read failed");
                return PollOutcome::QueueUnavailable(e);
            }
        };

        let Some(task) = select_task(&tasks, &self.identity) else {
            debug!(tasks = tasks.len(), "No eligible task");
            return PollOutcome::NoEligibleTask;
        };

        guard.processing(&task.id);
        let attempt = Uuid::new_v4();
        info!(task_id = %task.id, attempt = %attempt, url = %task.repository_url, "Processing task");

        let outcome = match self.process(task, attempt, cancel).await {
            Ok(result) => PollOutcome::Completed(result),
            Err(error) => {
                error!(
                    task_id = %task.id,
                    attempt = %attempt,
                    stage = error.stage(),
                    error = %error,
                    "Task attempt failed"
                );
                PollOutcome::Failed {
                    task_id: task.id.clone(),
                    error,
                }
            }
        };

        drop(guard);
        outcome
    }

    /// Run every pipeline stage in order; the first failure ends the attempt.
    async fn process(
        &self,
        task: &Task,
        attempt: Uuid,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, Error> {
        let workspace = until_cancelled(
            cancel,
            "fetch",
            self.workspaces.fetch_and_extract(&task.repository_url, &task.id),
        )
        .await?;
        debug!(task_id = %task.id, attempt = %attempt, stage = "extract", files = workspace.files, "Stage succeeded");

        self.runtime.prepare(workspace.path(), cancel).await?;
        debug!(task_id = %task.id, attempt = %attempt, stage = "prepare", "Stage succeeded");

        let output = self
            .runtime
            .run(workspace.path(), self.runtime.entry_script(), cancel)
            .await?;
        debug!(task_id = %task.id, attempt = %attempt, stage = "execute", exit_code = output.exit_code, "Stage succeeded");

        let artifact = until_cancelled(
            cancel,
            "upload",
            self.publisher.package_and_upload(workspace.path()),
        )
        .await?;
        debug!(task_id = %task.id, attempt = %attempt, stage = "upload", locator = %artifact.locator, "Stage succeeded");

        let submission = Submission::from_receipt(&task.id, &artifact);
        until_cancelled(cancel, "confirm", self.queue.submit_confirmation(&submission)).await?;
        info!(
            task_id = %task.id,
            attempt = %attempt,
            result_hash = %submission.result_hash,
            result_url = %submission.result_url,
            "Confirmation submitted"
        );

        if !self.retain_workspaces {
            if let Err(e) = self.workspaces.dispose(&task.id).await {
                warn!(task_id = %task.id, error = %e, "Failed to remove workspace");
            }
        }

        Ok(ExecutionResult {
            task_id: task.id.clone(),
            output,
            artifact,
        })
    }
}

/// Drive a network stage unless `cancel` fires first.
async fn until_cancelled<T, E>(
    cancel: &CancellationToken,
    stage: &'static str,
    work: impl Future<Output = Result<T, E>>,
) -> Result<T, Error>
where
    Error: From<E>,
{
    tokio::select! {
        result = work => Ok(result?),
        _ = cancel.cancelled() => Err(Error::Cancelled { stage }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_is_exclusive_and_released_on_drop() {
        let state = Mutex::new(SchedulerState::Idle);

        let guard = InFlight::try_claim(&state).unwrap();
        assert_eq!(*state.lock().unwrap(), SchedulerState::Polling);
        assert!(InFlight::try_claim(&state).is_none());

        guard.processing(&TaskId::new("t1"));
        assert_eq!(
            *state.lock().unwrap(),
            SchedulerState::Processing(TaskId::new("t1"))
        );
        assert!(InFlight::try_claim(&state).is_none());

        drop(guard);
        assert_eq!(*state.lock().unwrap(), SchedulerState::Idle);
        assert!(InFlight::try_claim(&state).is_some());
    }

    #[tokio::test]
    async fn cancelled_stage_stops_waiting() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = until_cancelled(
            &cancel,
            "upload",
            std::future::pending::<Result<(), QueueError>>(),
        )
        .await;
        assert!(matches!(result, Err(Error::Cancelled { stage: "upload" })));
    }

    #[tokio::test]
    async fn finished_stage_passes_through() {
        let cancel = CancellationToken::new();
        let err = until_cancelled(&cancel, "confirm", async {
            Err::<(), _>(QueueError::Write("rejected".into()))
        })
        .await
        .unwrap_err();
        assert_eq!(err.stage(), "confirm");
    }
}
