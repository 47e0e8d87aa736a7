//! In-memory queue with ledger-like confirmation semantics.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::QueueClient;
use crate::error::QueueError;
use crate::task::{Confirmation, Submission, Task, WorkerId};

/// In-memory task queue.
///
/// Confirmations are keyed by the configured signer, mirroring how the
/// contract keys them by the transaction signer.
pub struct MemoryQueue {
    signer: WorkerId,
    tasks: RwLock<Vec<Task>>,
    submissions: RwLock<Vec<Submission>>,
    reads: AtomicUsize,
    failing_reads: AtomicUsize,
    failing_writes: AtomicUsize,
}

impl MemoryQueue {
    /// Create an empty queue whose writes are signed by `signer`.
    pub fn new(signer: WorkerId) -> Arc<Self> {
        Arc::new(Self {
            signer,
            tasks: RwLock::new(Vec::new()),
            submissions: RwLock::new(Vec::new()),
            reads: AtomicUsize::new(0),
            failing_reads: AtomicUsize::new(0),
            failing_writes: AtomicUsize::new(0),
        })
    }

    /// Append a task to the end of the queue.
    pub async fn push(&self, task: Task) {
        debug!(task_id = %task.id, "Task added to memory queue");
        self.tasks.write().await.push(task);
    }

    /// Make the next `n` reads fail with `QueueError::Read`.
    pub fn fail_next_reads(&self, n: usize) {
        self.failing_reads.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` writes fail with `QueueError::Write`.
    pub fn fail_next_writes(&self, n: usize) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    /// Every accepted submission, in order.
    pub async fn submissions(&self) -> Vec<Submission> {
        self.submissions.read().await.clone()
    }

    /// Current snapshot without counting as a read.
    pub async fn snapshot(&self) -> Vec<Task> {
        self.tasks.read().await.clone()
    }

    /// Number of `list_pending` calls served (including failed ones).
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

/// Consume one scheduled failure, if any.
fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl QueueClient for MemoryQueue {
    async fn list_pending(&self) -> Result<Vec<Task>, QueueError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.failing_reads) {
            return Err(QueueError::Read("injected read failure".to_string()));
        }
        Ok(self.tasks.read().await.clone())
    }

    async fn submit_confirmation(&self, submission: &Submission) -> Result<(), QueueError> {
        if take_failure(&self.failing_writes) {
            return Err(QueueError::Write("injected write failure".to_string()));
        }

        let mut tasks = self.tasks.write().await;
        let task = tasks
            .iter_mut()
            .find(|t| t.id == submission.task_id)
            .ok_or_else(|| QueueError::Write(format!("task {} not found", submission.task_id)))?;

        if task.confirmations.contains_key(&self.signer) {
            info!(task_id = %task.id, "Result already submitted for this task");
        } else {
            task.confirmations.insert(
                self.signer.clone(),
                Confirmation {
                    result_hash: Some(submission.result_hash.clone()),
                    result_url: Some(submission.result_url.clone()),
                },
            );
        }
        drop(tasks);

        self.submissions.write().await.push(submission.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskId;

    fn submission(id: &str) -> Submission {
        Submission {
            task_id: TaskId::new(id),
            result_hash: "Qm1".into(),
            result_url: "https://gw/ipfs/Qm1".into(),
        }
    }

    #[tokio::test]
    async fn confirmation_makes_task_ineligible() {
        let me = WorkerId::new("W1");
        let queue = MemoryQueue::new(me.clone());
        queue.push(Task::new("t1", "u")).await;

        queue.submit_confirmation(&submission("t1")).await.unwrap();

        let tasks = queue.list_pending().await.unwrap();
        assert!(!tasks[0].is_eligible_for(&me));
        assert_eq!(
            tasks[0].confirmations[&me].result_hash.as_deref(),
            Some("Qm1")
        );
        assert_eq!(queue.submissions().await.len(), 1);
    }

    #[tokio::test]
    async fn unknown_task_is_write_error() {
        let queue = MemoryQueue::new(WorkerId::new("W1"));
        let err = queue.submit_confirmation(&submission("nope")).await.unwrap_err();
        assert!(matches!(err, QueueError::Write(_)));
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let queue = MemoryQueue::new(WorkerId::new("W1"));
        queue.push(Task::new("t1", "u")).await;
        queue.fail_next_reads(1);
        queue.fail_next_writes(1);

        assert!(queue.list_pending().await.is_err());
        assert!(queue.list_pending().await.is_ok());
        assert_eq!(queue.read_count(), 2);

        assert!(queue.submit_confirmation(&submission("t1")).await.is_err());
        assert!(queue.submit_confirmation(&submission("t1")).await.is_ok());
    }
}
