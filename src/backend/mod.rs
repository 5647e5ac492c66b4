//! External collaborators
//!
//! The orchestrator never interprets what an operation does or how a query is
//! answered; it only sees the outcome. [`ClusterBackend`] is that seam.

mod command;
mod kube_api;

pub use command::{CommandBackend, CommandBackendConfig, ExitCodes};
pub use kube_api::{is_node_ready, KubeProbe};

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use crate::phase::Operation;
use crate::probe::{Answer, Query};
use crate::Error;

/// How a successful operation ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ActionOutcome {
    /// The operation changed external state
    Done,
    /// The operation found its work already done (e.g. cluster already initialized)
    AlreadyDone(String),
}

/// Runs operations and answers queries against the node and the cluster
///
/// Errors must be classified: [`Error::Transient`] for failures worth retrying,
/// [`Error::UnrecoverableAction`] for failures that are not.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterBackend: Send + Sync {
    /// Run a side-effecting operation
    async fn run(&self, operation: &Operation) -> Result<ActionOutcome, Error>;

    /// Answer a read-only query
    async fn query(&self, query: &Query) -> Result<Answer, Error>;
}
