//! Bootstrap command - run the control-plane catalog against this host
//!
//! Takes the host run lock, builds the command backend from its YAML file,
//! runs every phase in order, and prints the summary. Ctrl-C stops the run
//! with exit code 130; the lock is released either way.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use keystone::backend::{CommandBackend, CommandBackendConfig};
use keystone::{catalog, Orchestrator, StateTracker};
use keystone_common::DEFAULT_LOCK_FILE;
use tracing::{info, warn};

use crate::config::ClusterArgs;
use crate::lock::RunLock;
use crate::Result;

/// Exit code after an interrupt (128 + SIGINT)
pub const INTERRUPTED_EXIT_CODE: u8 = 130;

/// Bootstrap the control plane
#[derive(Args, Debug)]
pub struct BootstrapArgs {
    #[command(flatten)]
    pub cluster: ClusterArgs,

    /// Backend configuration mapping operations and queries to commands
    #[arg(
        long,
        env = "KEYSTONE_BACKEND_CONFIG",
        default_value = "/etc/keystone/backend.yaml"
    )]
    pub backend_config: PathBuf,

    /// Kubeconfig for answering cluster queries through the API
    #[arg(long, env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Lock file preventing concurrent runs on this host
    #[arg(long, env = "KEYSTONE_LOCK_FILE", default_value = DEFAULT_LOCK_FILE)]
    pub lock_file: PathBuf,

    /// Abort the whole run after this many seconds
    #[arg(long, env = "KEYSTONE_DEADLINE_SECS")]
    pub deadline_secs: Option<u64>,

    /// Print the plan without evaluating or running anything
    #[arg(long)]
    pub dry_run: bool,
}

pub async fn run(args: BootstrapArgs) -> Result<u8> {
    let config = args.cluster.to_config()?;
    let phases = catalog::control_plane(&config.topology, &config.catalog)?;

    if args.dry_run {
        print!("{}", super::render_plan(&config.topology, &phases));
        return Ok(0);
    }

    let _lock = RunLock::acquire(&args.lock_file)?;

    let mut backend = CommandBackend::new(CommandBackendConfig::load(&args.backend_config)?);
    if let Some(kubeconfig) = args.kubeconfig {
        backend = backend.with_kubeconfig(kubeconfig);
    }

    let mut orchestrator = Orchestrator::new(config.topology, phases, Arc::new(backend))?;
    if let Some(secs) = args.deadline_secs {
        orchestrator = orchestrator.with_deadline(Duration::from_secs(secs));
    }

    info!(
        environment = %orchestrator.topology().environment(),
        members = orchestrator.topology().size(),
        "Bootstrapping control plane"
    );

    let tracker = tokio::select! {
        tracker = orchestrator.run() => tracker,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, stopping bootstrap");
            eprintln!("bootstrap interrupted");
            return Ok(INTERRUPTED_EXIT_CODE);
        }
    };

    report(&tracker);
    Ok(exit_code(&tracker))
}

/// Print the summary table, then the failing phase or any warnings
fn report(tracker: &StateTracker) {
    println!();
    print!("{}", tracker.render());

    if let Some((phase, error)) = tracker.failure() {
        eprintln!();
        eprintln!("bootstrap aborted in phase '{}': {}", phase, error);
        return;
    }
    for (phase, warning) in tracker.warnings() {
        eprintln!("warning [{}]: {}", phase, warning);
    }
}

fn exit_code(tracker: &StateTracker) -> u8 {
    u8::try_from(tracker.exit_code()).unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryArgs;
    use keystone::RunState;
    use keystone_common::BackoffKind;

    fn args(dir: &std::path::Path, dry_run: bool) -> BootstrapArgs {
        BootstrapArgs {
            cluster: ClusterArgs {
                environment: "single".to_string(),
                members: vec!["cp-1=10.0.0.1".to_string()],
                floating_endpoint: None,
                kube_version: "1.32.0".to_string(),
                pod_cidr: "192.168.0.0/16".to_string(),
                retry: RetryArgs {
                    retry_max_attempts: 1,
                    retry_initial_delay_ms: 10,
                    retry_max_delay_ms: 10,
                    retry_backoff: BackoffKind::Fixed,
                    retry_jitter: false,
                    verify_timeout_secs: 1,
                    verify_poll_interval_secs: 1,
                },
            },
            backend_config: dir.join("missing.yaml"),
            kubeconfig: None,
            lock_file: dir.join("keystone.lock"),
            deadline_secs: None,
            dry_run,
        }
    }

    #[test]
    fn exit_code_follows_run_state() {
        let mut tracker = StateTracker::new(["preflight"]);
        assert_eq!(exit_code(&tracker), 1);

        tracker.start_run();
        tracker.mark_skipped("preflight", "already satisfied", None).unwrap();
        tracker.complete_run();
        assert_eq!(tracker.run_state(), RunState::Completed);
        assert_eq!(exit_code(&tracker), 0);
    }

    #[tokio::test]
    async fn dry_run_touches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(run(args(dir.path(), true)).await.unwrap(), 0);
        assert!(!dir.path().join("keystone.lock").exists());
    }

    #[tokio::test]
    async fn missing_backend_config_fails_and_releases_lock() {
        let dir = tempfile::tempdir().unwrap();
        let err = run(args(dir.path(), false)).await.unwrap_err();
        assert!(err.to_string().contains("cannot read backend config"));
        assert!(!dir.path().join("keystone.lock").exists());
    }
}
