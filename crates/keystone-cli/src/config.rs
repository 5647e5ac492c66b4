//! Run configuration
//!
//! Flags and their environment fallbacks are parsed once into a [`Config`];
//! nothing below the CLI reads the environment.

use std::time::Duration;

use clap::Args;
use keystone::catalog::CatalogSettings;
use keystone::topology::resolve;
use keystone::Topology;
use keystone_common::{BackoffKind, RetryPolicy, DEFAULT_KUBE_VERSION, DEFAULT_POD_CIDR};

use crate::{Error, Result};

/// Topology and tunables shared by every subcommand
#[derive(Args, Debug, Clone)]
pub struct ClusterArgs {
    /// Deployment size class: single, limited-ha or full-ha
    #[arg(short, long, env = "KEYSTONE_ENVIRONMENT")]
    pub environment: String,

    /// Members as `hostname=address` or `address`, comma separated; the first initializes the cluster
    #[arg(short, long, env = "KEYSTONE_MEMBERS", value_delimiter = ',', required = true)]
    pub members: Vec<String>,

    /// Floating API endpoint address (required with more than one member)
    #[arg(long, env = "KEYSTONE_FLOATING_ENDPOINT")]
    pub floating_endpoint: Option<String>,

    /// Kubernetes version to install
    #[arg(long, env = "KUBE_VERSION", default_value = DEFAULT_KUBE_VERSION)]
    pub kube_version: String,

    /// Pod network CIDR
    #[arg(long, env = "POD_CIDR", default_value = DEFAULT_POD_CIDR)]
    pub pod_cidr: String,

    #[command(flatten)]
    pub retry: RetryArgs,
}

/// Retry and verification tunables
#[derive(Args, Debug, Clone)]
pub struct RetryArgs {
    /// Attempts per retryable action
    #[arg(long, env = "RETRY_MAX_ATTEMPTS", default_value_t = 5)]
    pub retry_max_attempts: u32,

    /// Delay after the first failed attempt, in milliseconds
    #[arg(long, env = "RETRY_INITIAL_DELAY_MS", default_value_t = 1000)]
    pub retry_initial_delay_ms: u64,

    /// Upper bound for a single retry delay, in milliseconds
    #[arg(long, env = "RETRY_MAX_DELAY_MS", default_value_t = 30_000)]
    pub retry_max_delay_ms: u64,

    /// Delay growth: fixed, linear or exponential
    #[arg(long, env = "RETRY_BACKOFF", default_value = "exponential", value_parser = parse_backoff)]
    pub retry_backoff: BackoffKind,

    /// Randomize retry delays
    #[arg(long, env = "RETRY_JITTER")]
    pub retry_jitter: bool,

    /// Wait budget for cluster-level verifications, in seconds
    #[arg(long, env = "VERIFY_TIMEOUT_SECS", default_value_t = 300)]
    pub verify_timeout_secs: u64,

    /// Interval between verification probes, in seconds
    #[arg(long, env = "VERIFY_POLL_INTERVAL_SECS", default_value_t = 5)]
    pub verify_poll_interval_secs: u64,
}

fn parse_backoff(s: &str) -> std::result::Result<BackoffKind, String> {
    s.parse()
}

/// Everything a run needs, built once
#[derive(Debug, Clone)]
pub struct Config {
    /// Resolved topology
    pub topology: Topology,
    /// Catalog inputs
    pub catalog: CatalogSettings,
}

impl RetryArgs {
    /// Build the retry policy
    pub fn policy(&self) -> Result<RetryPolicy> {
        if self.retry_max_attempts == 0 {
            return Err(Error::validation("--retry-max-attempts must be at least 1"));
        }
        if self.retry_max_delay_ms < self.retry_initial_delay_ms {
            return Err(Error::validation(
                "--retry-max-delay-ms must not be smaller than --retry-initial-delay-ms",
            ));
        }
        Ok(RetryPolicy {
            max_attempts: self.retry_max_attempts,
            initial_delay: Duration::from_millis(self.retry_initial_delay_ms),
            backoff: self.retry_backoff,
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            jitter: self.retry_jitter,
        })
    }
}

impl ClusterArgs {
    /// Resolve the topology only
    pub fn topology(&self) -> Result<Topology> {
        Ok(resolve(&self.environment, &self.members)?)
    }

    /// Resolve the topology and build the catalog settings
    pub fn to_config(&self) -> Result<Config> {
        let topology = self.topology()?;
        if self.retry.verify_poll_interval_secs == 0 {
            return Err(Error::validation("--verify-poll-interval-secs must be at least 1"));
        }

        let catalog = CatalogSettings {
            kube_version: self.kube_version.clone(),
            pod_cidr: self.pod_cidr.clone(),
            floating_endpoint: self.floating_endpoint.clone(),
            retry_policy: self.retry.policy()?,
            verify_timeout: Duration::from_secs(self.retry.verify_timeout_secs),
            poll_interval: Duration::from_secs(self.retry.verify_poll_interval_secs),
            ..Default::default()
        };

        Ok(Config { topology, catalog })
    }
}
