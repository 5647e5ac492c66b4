//! Phase executor
//!
//! Drives an ordered phase list one phase at a time:
//!
//! 1. applicability (non-applicable phases are skipped, never failed)
//! 2. precondition (false aborts the run)
//! 3. idempotency guard (skip, repair, or run)
//! 4. action, wrapped in the retry controller when declared retryable
//! 5. verification via the health verifier
//!
//! This is the only place that decides between aborting and continuing. Every
//! error from below is returned here and recorded in the [`StateTracker`].

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use keystone_common::{retry_classified, wait_until, RetryError};
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::backend::{ActionOutcome, ClusterBackend};
use crate::guard::{should_run, Decision};
use crate::phase::{Operation, Phase, Severity};
use crate::probe::{Probe, ProbeContext};
use crate::state::StateTracker;
use crate::topology::Topology;
use crate::Error;

/// Runs a phase list against a topology
pub struct Orchestrator {
    topology: Topology,
    phases: Vec<Phase>,
    backend: Arc<dyn ClusterBackend>,
    deadline: Option<Duration>,
}

impl Orchestrator {
    /// Create an orchestrator. Phase names must be unique.
    pub fn new(
        topology: Topology,
        phases: Vec<Phase>,
        backend: Arc<dyn ClusterBackend>,
    ) -> Result<Self, Error> {
        let mut seen = HashSet::new();
        for phase in &phases {
            if !seen.insert(phase.name.as_str()) {
                return Err(Error::configuration("duplicate phase name", phase.name.clone()));
            }
        }
        Ok(Self {
            topology,
            phases,
            backend,
            deadline: None,
        })
    }

    /// Bound the whole run. Retry sleeps and verification waits never pass it.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// The topology this orchestrator runs against
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// The phases in execution order
    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    /// Execute every phase in order and return the final state.
    ///
    /// A fresh tracker is created for every run; nothing is resumed.
    pub async fn run(self) -> StateTracker {
        let mut tracker = StateTracker::new(self.phases.iter().map(|p| p.name.clone()));
        let deadline = self.deadline.map(|d| Instant::now() + d);
        let backend = self.backend.as_ref();

        info!(
            environment = %self.topology.environment(),
            members = self.topology.size(),
            quorum = self.topology.quorum(),
            phases = self.phases.len(),
            "Starting bootstrap"
        );
        tracker.start_run();

        for phase in &self.phases {
            let result = execute_phase(phase, &self.topology, backend, &mut tracker, deadline).await;

            if let Err(e) = result {
                error!(phase = %phase.name, error = %e, "Phase failed, aborting run");
                if let Err(state_err) = tracker.mark_failed(&phase.name, e.to_string()) {
                    error!(error = %state_err, "Could not record phase failure");
                }
                tracker.abort_run();
                return tracker;
            }
        }

        tracker.complete_run();
        let warnings = tracker.warnings().len();
        info!(warnings, "Bootstrap completed");
        tracker
    }
}

/// Run one phase. `Err` means the run must abort; the caller records it.
async fn execute_phase(
    phase: &Phase,
    topology: &Topology,
    backend: &dyn ClusterBackend,
    tracker: &mut StateTracker,
    deadline: Option<Instant>,
) -> Result<(), Error> {
    let name = phase.name.as_str();

    if !phase.applicability.applies_to(topology) {
        let reason = format!(
            "not applicable to {} topology ({})",
            topology.environment(),
            phase.applicability
        );
        return tracker.mark_skipped(name, reason, None);
    }

    if let Some(deadline) = deadline {
        if Instant::now() >= deadline {
            return Err(Error::DeadlineExceeded {
                context: name.to_string(),
                message: "run deadline reached before phase started".to_string(),
            });
        }
    }

    let decision = {
        let ctx = ProbeContext {
            backend,
            tracker: &*tracker,
        };
        if !phase.precondition.evaluate(ctx).await? {
            return Err(Error::configuration(
                format!("precondition not met: {}", phase.precondition),
                name,
            ));
        }
        should_run(phase, ctx).await
    };

    let repair = match decision {
        Decision::Skip { reason, warning } => {
            return tracker.mark_skipped(name, reason, warning);
        }
        Decision::Repair => phase.repair.as_ref(),
        Decision::Run => None,
    };

    info!(phase = %name, description = %phase.description, "Running phase");
    tracker.mark_running(name)?;

    if let Some(repair) = repair {
        warn!(phase = %name, operation = %repair, "Repairing partial state");
        invoke(phase, repair, backend, deadline).await?;
    }

    let mut note = None;
    if let Some(action) = &phase.action {
        let (outcome, attempts) = invoke(phase, action, backend, deadline).await?;
        tracker.set_attempts(name, attempts)?;
        if let ActionOutcome::AlreadyDone(detail) = outcome {
            info!(phase = %name, operation = %action, detail = %detail, "Action reported already done");
            note = Some(detail);
        }
    }

    let warning = match verify(phase, backend, tracker, deadline).await {
        Ok(()) => None,
        Err(e) if phase.severity == Severity::Soft && !e.is_fatal() => {
            warn!(phase = %name, error = %e, "Soft verification failed, continuing");
            Some(e.to_string())
        }
        Err(e) => return Err(e),
    };

    tracker.mark_completed(name, warning, note)
}

/// Run an operation, through the retry controller when the phase allows it.
/// Returns the outcome and the number of attempts made.
async fn invoke(
    phase: &Phase,
    operation: &Operation,
    backend: &dyn ClusterBackend,
    deadline: Option<Instant>,
) -> Result<(ActionOutcome, u32), Error> {
    if !phase.action_retryable {
        return backend.run(operation).await.map(|outcome| (outcome, 1));
    }

    let operation_name = operation.name();
    let mut attempts = 0u32;
    let result = retry_classified(
        &phase.retry_policy,
        &operation_name,
        deadline,
        Error::is_retryable,
        || {
            attempts += 1;
            backend.run(operation)
        },
    )
    .await;

    match result {
        Ok(outcome) => Ok((outcome, attempts)),
        Err(e) => Err(action_error(&operation_name, e)),
    }
}

fn action_error(operation: &str, e: RetryError<Error>) -> Error {
    match e {
        RetryError::DeadlineExceeded { attempts, last } => Error::DeadlineExceeded {
            context: operation.to_string(),
            message: format!("{} (after {} attempts)", last, attempts),
        },
        other => other.into_inner(),
    }
}

/// Wait for the phase's verification probe, capped by the run deadline.
async fn verify(
    phase: &Phase,
    backend: &dyn ClusterBackend,
    tracker: &StateTracker,
    deadline: Option<Instant>,
) -> Result<(), Error> {
    let probe = &phase.verification.probe;
    if *probe == Probe::Always {
        return Ok(());
    }

    let budget = phase.verify_timeout();
    let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
    let capped = remaining.is_some_and(|r| r < budget);
    let timeout = remaining.map_or(budget, |r| r.min(budget));

    let ctx = ProbeContext { backend, tracker };
    let description = format!("{} ({})", probe, phase.name);
    match wait_until(&description, timeout, phase.poll_interval(), || probe.evaluate(ctx)).await {
        Ok(()) => Ok(()),
        Err(e) if capped => Err(Error::DeadlineExceeded {
            context: phase.name.clone(),
            message: format!("run deadline reached while verifying: {}", e),
        }),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockClusterBackend;
    use crate::probe::{Answer, Query};
    use crate::state::{PhaseStatus, RunState};
    use crate::topology::resolve;
    use keystone_common::RetryPolicy;
    use mockall::Sequence;

    fn orchestrator(phases: Vec<Phase>, backend: MockClusterBackend) -> Orchestrator {
        let topology = resolve("single", &["cp-1=10.0.0.1"]).unwrap();
        Orchestrator::new(topology, phases, Arc::new(backend)).unwrap()
    }

    #[test]
    fn duplicate_phase_names_are_rejected() {
        let topology = resolve("single", &["10.0.0.1"]).unwrap();
        let phases = vec![Phase::new("preflight"), Phase::new("preflight")];
        let result = Orchestrator::new(topology, phases, Arc::new(MockClusterBackend::new()));
        assert!(matches!(result, Err(Error::Configuration { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_precondition_aborts_before_later_phases() {
        let mut backend = MockClusterBackend::new();
        backend.expect_query().returning(|_| Ok(Answer::Flag(false)));
        backend.expect_run().never();

        let phases = vec![
            Phase::new("preflight")
                .with_precondition(Probe::Holds(Query::tool("kubeadm")))
                .with_action(Operation::invoke("prepare-node")),
            Phase::new("cluster-init").with_action(Operation::invoke("init-cluster")),
        ];
        let tracker = orchestrator(phases, backend).run().await;

        assert_eq!(tracker.run_state(), RunState::Aborted);
        assert_eq!(tracker.status("preflight"), Some(PhaseStatus::Failed));
        assert_eq!(tracker.status("cluster-init"), Some(PhaseStatus::Pending));
        let (phase, error) = tracker.failure().unwrap();
        assert_eq!(phase, "preflight");
        assert!(error.contains("precondition not met: tool-present(kubeadm)"));
    }

    #[tokio::test(start_paused = true)]
    async fn repair_runs_before_action() {
        let mut backend = MockClusterBackend::new();
        let mut seq = Sequence::new();
        backend.expect_query().returning(|q| match q {
            Query::ClusterInitialized => Ok(Answer::Flag(false)),
            _ => Ok(Answer::Flag(true)),
        });
        backend
            .expect_run()
            .withf(|op| op.name() == "reset-cluster")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(ActionOutcome::Done));
        backend
            .expect_run()
            .withf(|op| op.name() == "init-cluster")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(ActionOutcome::Done));

        let phases = vec![Phase::new("cluster-init")
            .skip_when(Probe::Holds(Query::ClusterInitialized))
            .repair_when(Probe::Holds(Query::PartialInit), Operation::invoke("reset-cluster"))
            .with_action(Operation::invoke("init-cluster"))];
        let tracker = orchestrator(phases, backend).run().await;

        assert_eq!(tracker.status("cluster-init"), Some(PhaseStatus::Completed));
        assert_eq!(tracker.exit_code(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unrecoverable_action_skips_verification() {
        let mut backend = MockClusterBackend::new();
        backend.expect_query().never();
        backend
            .expect_run()
            .times(1)
            .returning(|op| Err(Error::unrecoverable(op.name(), "disk full")));

        let phases = vec![Phase::new("kubernetes-packages")
            .with_action(Operation::invoke("install-kubernetes-packages"))
            .retryable()
            .verify(Probe::Holds(Query::ApiServerReady))];
        let tracker = orchestrator(phases, backend).run().await;

        assert_eq!(tracker.run_state(), RunState::Aborted);
        let (_, error) = tracker.failure().unwrap();
        assert!(error.contains("disk full"));
    }

    #[tokio::test(start_paused = true)]
    async fn already_done_counts_as_success() {
        let mut backend = MockClusterBackend::new();
        backend
            .expect_run()
            .returning(|_| Ok(ActionOutcome::AlreadyDone("cluster already initialized".to_string())));

        let phases = vec![Phase::new("cluster-init").with_action(Operation::invoke("init-cluster"))];
        let tracker = orchestrator(phases, backend).run().await;

        let state = tracker.get("cluster-init").unwrap();
        assert_eq!(state.status, PhaseStatus::Completed);
        assert_eq!(state.note.as_deref(), Some("cluster already initialized"));
        assert_eq!(state.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_stops_retries_early() {
        let mut backend = MockClusterBackend::new();
        backend
            .expect_run()
            .times(3)
            .returning(|op| Err(Error::transient(op.name(), "connection reset")));

        let phases = vec![Phase::new("kubernetes-packages")
            .with_action(Operation::invoke("install-kubernetes-packages"))
            .retryable()
            .with_retry_policy(RetryPolicy::fixed(10, Duration::from_secs(4)))];
        let start = Instant::now();
        let tracker = orchestrator(phases, backend)
            .with_deadline(Duration::from_secs(10))
            .run()
            .await;

        assert!(start.elapsed() <= Duration::from_secs(10));
        let (_, error) = tracker.failure().unwrap();
        assert!(error.contains("deadline exceeded"));
        assert!(error.contains("connection reset"));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_cut_verification_is_not_a_soft_warning() {
        let mut backend = MockClusterBackend::new();
        backend.expect_query().returning(|_| Ok(Answer::Flag(false)));
        backend.expect_run().returning(|_| Ok(ActionOutcome::Done));

        let phases = vec![
            Phase::new("monitoring")
                .with_action(Operation::invoke("apply-monitoring"))
                .verify_within(
                    Probe::Holds(Query::ApiServerReady),
                    Duration::from_secs(60),
                    Duration::from_secs(2),
                )
                .soft(),
            Phase::new("storage").with_action(Operation::invoke("apply-storage")),
        ];
        let tracker = orchestrator(phases, backend)
            .with_deadline(Duration::from_secs(10))
            .run()
            .await;

        assert_eq!(tracker.run_state(), RunState::Aborted);
        let (phase, error) = tracker.failure().unwrap();
        assert_eq!(phase, "monitoring");
        assert!(error.contains("deadline exceeded"));
        assert!(error.contains("api-server-ready"));
        assert!(tracker.warnings().is_empty());
    }
}
