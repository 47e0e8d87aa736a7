//! Task records as published on the ledger, plus the eligibility rule.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque task identifier assigned by the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Worker identity (the ledger account that signs confirmations).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A prior submission recorded on the ledger for one worker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Confirmation {
    #[serde(default)]
    pub result_hash: Option<String>,
    #[serde(default)]
    pub result_url: Option<String>,
}

/// A unit of work visible on the shared queue.
///
/// `bounty` is kept as raw JSON: the contract serializes balances either as
/// numbers or strings and the worker never interprets it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub repository_url: String,
    #[serde(default)]
    pub bounty: serde_json::Value,
    /// Older contract builds call this map `confirmations`, newer ones `results`.
    #[serde(default, alias = "results")]
    pub confirmations: HashMap<WorkerId, Confirmation>,
    #[serde(default)]
    pub submitter_account_id: Option<String>,
}

impl Task {
    pub fn new(id: impl Into<String>, repository_url: impl Into<String>) -> Self {
        Self {
            id: TaskId::new(id),
            repository_url: repository_url.into(),
            bounty: serde_json::Value::Null,
            confirmations: HashMap::new(),
            submitter_account_id: None,
        }
    }

    /// Record a confirmation for `worker` (builder style, mostly for tests).
    pub fn with_confirmation(mut self, worker: &WorkerId, confirmation: Confirmation) -> Self {
        self.confirmations.insert(worker.clone(), confirmation);
        self
    }

    /// A task is eligible for a worker iff that worker has not confirmed it yet.
    pub fn is_eligible_for(&self, worker: &WorkerId) -> bool {
        !self.confirmations.contains_key(worker)
    }
}

/// Pick the first task in snapshot order that `worker` has not confirmed.
///
/// Ledger order is treated as advisory FIFO and never reordered.
pub fn select_task<'a>(tasks: &'a [Task], worker: &WorkerId) -> Option<&'a Task> {
    tasks.iter().find(|task| {
        let eligible = task.is_eligible_for(worker);
        if !eligible {
            tracing::debug!(task_id = %task.id, "Result already submitted for task, skipping");
        }
        eligible
    })
}

/// Captured output of a successful entry-script run.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Where a packaged result ended up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactReceipt {
    /// Retrieval URL for the archive.
    pub locator: String,
    /// Content identifier assigned by the store.
    pub content_hash: String,
    /// Hex SHA-256 of the uploaded bytes.
    pub sha256: String,
    pub size: u64,
}

/// Outcome of one fully successful task attempt.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub task_id: TaskId,
    pub output: ExecutionOutput,
    pub artifact: ArtifactReceipt,
}

/// Arguments of the ledger's `submit_result` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Submission {
    pub task_id: TaskId,
    pub result_hash: String,
    pub result_url: String,
}

impl Submission {
    pub fn from_receipt(task_id: &TaskId, receipt: &ArtifactReceipt) -> Self {
        Self {
            task_id: task_id.clone(),
            result_hash: receipt.content_hash.clone(),
            result_url: receipt.locator.clone(),
        }
    }
}
