//! Obrigado worker — pulls tasks from a NEAR task queue, runs them in
//! isolated Python workspaces and publishes the results to IPFS.

pub mod archive;
pub mod config;
pub mod error;
pub mod publish;
pub mod queue;
pub mod runtime;
pub mod scheduler;
pub mod task;
pub mod workspace;
