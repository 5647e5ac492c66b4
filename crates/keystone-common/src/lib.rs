//! Common types for keystone: errors, retry/backoff, polling and telemetry

#![deny(missing_docs)]

pub mod error;
pub mod polling;
pub mod retry;
pub mod telemetry;

pub use error::Error;
pub use polling::{wait_until, VerifyError};
pub use retry::{retry_classified, retry_with_backoff, BackoffKind, RetryError, RetryPolicy};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Default location of the run lock file
pub const DEFAULT_LOCK_FILE: &str = "/var/lock/keystone.lock";

/// Default Kubernetes version installed by the package phase
pub const DEFAULT_KUBE_VERSION: &str = "1.32.0";

/// Default pod network CIDR handed to cluster init and the network add-on
pub const DEFAULT_POD_CIDR: &str = "192.168.0.0/16";
