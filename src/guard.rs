//! Idempotency guard
//!
//! Decides, before a phase's action runs, whether the work is already done,
//! half done, or not started. Only read-only probes are evaluated here.

use tracing::{debug, warn};

use crate::phase::Phase;
use crate::probe::ProbeContext;

/// What the executor should do with a phase
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    /// The phase's postcondition already holds, or the guard could not tell
    /// and the action is not safe to repeat
    Skip {
        /// Why the phase is skipped
        reason: String,
        /// Set when the skip is a conservative guess rather than an observation
        warning: Option<String>,
    },
    /// A previous attempt left partial state: run the repair operation, then the action
    Repair,
    /// Not started
    Run,
}

/// Decide whether `phase` should run. Never mutates external state.
pub async fn should_run(phase: &Phase, ctx: ProbeContext<'_>) -> Decision {
    match phase.idempotency_check.evaluate(ctx).await {
        Ok(true) => {
            return Decision::Skip {
                reason: format!("already satisfied: {}", phase.idempotency_check),
                warning: None,
            }
        }
        Ok(false) => {}
        Err(e) => return uncertain(phase, "idempotency check", &e.to_string()),
    }

    let partial = match (&phase.partial_state, &phase.repair) {
        (Some(probe), Some(_)) => probe,
        _ => return Decision::Run,
    };

    match partial.evaluate(ctx).await {
        Ok(true) => {
            debug!(phase = %phase.name, state = %partial, "Partial state detected");
            Decision::Repair
        }
        Ok(false) => Decision::Run,
        Err(e) => uncertain(phase, "partial-state check", &e.to_string()),
    }
}

/// The check errored. Running is only acceptable if the action tolerates a
/// second attempt.
fn uncertain(phase: &Phase, check: &str, error: &str) -> Decision {
    if phase.action_idempotent || phase.action.is_none() {
        warn!(
            phase = %phase.name,
            error = %error,
            "{} failed, running idempotent action anyway", check
        );
        return Decision::Run;
    }

    let warning = format!(
        "{} failed ({}); not running an action that is unsafe to repeat",
        check, error
    );
    warn!(phase = %phase.name, error = %error, "{} failed, skipping", check);
    Decision::Skip {
        reason: format!("{} inconclusive", check),
        warning: Some(warning),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockClusterBackend;
    use crate::phase::Operation;
    use crate::probe::{Answer, Probe, Query};
    use crate::state::StateTracker;
    use crate::Error;

    fn init_phase() -> Phase {
        Phase::new("cluster-init")
            .skip_when(Probe::Holds(Query::ClusterInitialized))
            .repair_when(Probe::Holds(Query::PartialInit), Operation::invoke("reset-cluster"))
            .with_action(Operation::invoke("init-cluster"))
    }

    fn backend_answering(initialized: Result<bool, ()>, partial: bool) -> MockClusterBackend {
        let mut backend = MockClusterBackend::new();
        backend.expect_query().returning(move |q| match q {
            Query::ClusterInitialized => initialized
                .map(Answer::Flag)
                .map_err(|_| Error::transient("cluster-initialized", "admin.conf unreadable")),
            Query::PartialInit => Ok(Answer::Flag(partial)),
            other => panic!("unexpected query {}", other),
        });
        backend
    }

    async fn decide(phase: &Phase, backend: &MockClusterBackend) -> Decision {
        let tracker = StateTracker::new([phase.name.clone()]);
        should_run(phase, ProbeContext { backend, tracker: &tracker }).await
    }

    #[tokio::test]
    async fn satisfied_check_skips() {
        let backend = backend_answering(Ok(true), false);
        let decision = decide(&init_phase(), &backend).await;
        assert!(matches!(decision, Decision::Skip { warning: None, .. }));
    }

    #[tokio::test]
    async fn partial_state_repairs() {
        let backend = backend_answering(Ok(false), true);
        assert_eq!(decide(&init_phase(), &backend).await, Decision::Repair);
    }

    #[tokio::test]
    async fn clean_state_runs() {
        let backend = backend_answering(Ok(false), false);
        assert_eq!(decide(&init_phase(), &backend).await, Decision::Run);
    }

    #[tokio::test]
    async fn inconclusive_check_skips_unsafe_action_with_warning() {
        let backend = backend_answering(Err(()), false);
        match decide(&init_phase(), &backend).await {
            Decision::Skip { warning: Some(w), .. } => assert!(w.contains("admin.conf unreadable")),
            other => panic!("expected conservative skip, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn inconclusive_check_runs_idempotent_action() {
        let backend = backend_answering(Err(()), false);
        let phase = init_phase().idempotent();
        assert_eq!(decide(&phase, &backend).await, Decision::Run);
    }
}
