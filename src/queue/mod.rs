//! Task queue access — the ledger boundary.
//!
//! - `QueueClient` — read the pending snapshot, submit confirmations
//! - `NearQueueClient` — NEAR JSON-RPC implementation against the contract
//! - `MemoryQueue` — in-process ledger for tests and dry runs

pub mod memory;
pub mod rpc;
pub mod signer;
pub mod transaction;

use async_trait::async_trait;

use crate::error::QueueError;
use crate::task::{Submission, Task};

pub use memory::MemoryQueue;
pub use rpc::NearQueueClient;
pub use signer::Signer;

/// Read/write access to the shared task queue.
///
/// `list_pending` returns the full current snapshot in ledger order.
/// Snapshots are eventually consistent; other workers may see different ones.
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Fetch every task currently on the queue.
    async fn list_pending(&self) -> Result<Vec<Task>, QueueError>;

    /// Record a completion claim for this worker.
    ///
    /// Submitting twice for the same task is accepted by the ledger but
    /// wasteful; callers check eligibility first.
    async fn submit_confirmation(&self, submission: &Submission) -> Result<(), QueueError>;
}
