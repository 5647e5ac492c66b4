//! Phase descriptors
//!
//! A [`Phase`] is one named unit of bootstrap work: a precondition, an
//! idempotency check, an optional action, and a post-action verification,
//! each expressed declaratively so the executor can log and report them.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use keystone_common::RetryPolicy;
use serde::Serialize;

use crate::probe::Probe;
use crate::topology::Topology;

/// Whether a verification failure aborts the run
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Verification timeout fails the phase and aborts the run
    Fatal,
    /// Verification timeout is recorded as a warning; the run continues
    Soft,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Fatal => write!(f, "fatal"),
            Severity::Soft => write!(f, "soft"),
        }
    }
}

/// Which topologies a phase applies to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Applicability {
    /// Every topology
    Always,
    /// Only topologies with a floating endpoint
    FloatingEndpoint,
    /// Only topologies with more than one member
    MultiMember,
}

impl Applicability {
    /// Whether a phase with this applicability runs for `topology`
    pub fn applies_to(&self, topology: &Topology) -> bool {
        match self {
            Applicability::Always => true,
            Applicability::FloatingEndpoint => topology.has_floating_endpoint(),
            Applicability::MultiMember => topology.size() > 1,
        }
    }
}

impl fmt::Display for Applicability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Applicability::Always => write!(f, "always"),
            Applicability::FloatingEndpoint => write!(f, "floating-endpoint"),
            Applicability::MultiMember => write!(f, "multi-member"),
        }
    }
}

/// Typed configuration for an add-on handed to the backend's apply operation.
///
/// The orchestrator never renders manifests; the backend decides how this
/// becomes cluster state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AddonConfig {
    /// Add-on name (e.g. "calico", "metrics-server")
    pub name: String,
    /// Version to install
    pub version: String,
    /// Target namespace
    pub namespace: String,
    /// Add-on specific settings
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub settings: BTreeMap<String, String>,
}

impl AddonConfig {
    /// Create an add-on config with no settings
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            namespace: namespace.into(),
            settings: BTreeMap::new(),
        }
    }

    /// Add a setting
    pub fn with_setting(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.settings.insert(key.into(), value.into());
        self
    }
}

/// A side-effecting external operation
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Operation {
    /// Run a named external operation with string arguments
    Invoke {
        /// Operation name, the key the backend dispatches on
        name: String,
        /// Named arguments
        args: BTreeMap<String, String>,
    },
    /// Apply a typed add-on configuration
    Apply(AddonConfig),
}

impl Operation {
    /// Create an invoke operation with no arguments
    pub fn invoke(name: impl Into<String>) -> Self {
        Operation::Invoke {
            name: name.into(),
            args: BTreeMap::new(),
        }
    }

    /// Create an apply operation
    pub fn apply(config: AddonConfig) -> Self {
        Operation::Apply(config)
    }

    /// Add an argument (ignored for apply operations)
    pub fn with_arg(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        if let Operation::Invoke { args, .. } = &mut self {
            args.insert(key.into(), value.into());
        }
        self
    }

    /// Name used in logs and as the backend dispatch key
    pub fn name(&self) -> String {
        match self {
            Operation::Invoke { name, .. } => name.clone(),
            Operation::Apply(config) => format!("apply:{}", config.name),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Invoke { name, args } if args.is_empty() => write!(f, "{}", name),
            Operation::Invoke { name, args } => {
                let rendered: Vec<String> =
                    args.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
                write!(f, "{}({})", name, rendered.join(", "))
            }
            Operation::Apply(config) => {
                write!(f, "apply {}@{} in {}", config.name, config.version, config.namespace)
            }
        }
    }
}

/// Post-action check with its own wait budget
#[derive(Clone, Debug, PartialEq)]
pub struct Verification {
    /// Condition that must become true
    pub probe: Probe,
    /// Wait budget; derived from the retry policy when unset
    pub timeout: Option<Duration>,
    /// Time between probes; the retry policy's initial delay when unset
    pub poll_interval: Option<Duration>,
}

/// One ordered, named unit of bootstrap work
#[derive(Clone, Debug)]
pub struct Phase {
    /// Unique name, used for logs and state keys
    pub name: String,
    /// One-line human description
    pub description: String,
    /// Topologies this phase runs on
    pub applicability: Applicability,
    /// Must hold before anything else happens; false is always fatal
    pub precondition: Probe,
    /// When true the phase is skipped without running its action
    pub idempotency_check: Probe,
    /// Leftover partial state that calls for the repair operation first
    pub partial_state: Option<Probe>,
    /// Operation that clears partial state before the action reruns
    pub repair: Option<Operation>,
    /// The side-effecting operation, if any
    pub action: Option<Operation>,
    /// Wrap the action in the retry controller
    pub action_retryable: bool,
    /// The action is safe to attempt twice
    pub action_idempotent: bool,
    /// Post-action verification
    pub verification: Verification,
    /// Policy for action retries and verification polling
    pub retry_policy: RetryPolicy,
    /// Whether verification failure aborts the run
    pub severity: Severity,
}

impl Phase {
    /// Create a phase that always runs, does nothing, and verifies trivially
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            applicability: Applicability::Always,
            precondition: Probe::Always,
            idempotency_check: Probe::Never,
            partial_state: None,
            repair: None,
            action: None,
            action_retryable: false,
            action_idempotent: false,
            verification: Verification {
                probe: Probe::Always,
                timeout: None,
                poll_interval: None,
            },
            retry_policy: RetryPolicy::default(),
            severity: Severity::Fatal,
        }
    }

    /// Set the description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the precondition
    pub fn with_precondition(mut self, probe: Probe) -> Self {
        self.precondition = probe;
        self
    }

    /// Skip the phase when `probe` already holds
    pub fn skip_when(mut self, probe: Probe) -> Self {
        self.idempotency_check = probe;
        self
    }

    /// Run `repair` before the action when `partial` holds
    pub fn repair_when(mut self, partial: Probe, repair: Operation) -> Self {
        self.partial_state = Some(partial);
        self.repair = Some(repair);
        self
    }

    /// Set the action
    pub fn with_action(mut self, operation: Operation) -> Self {
        self.action = Some(operation);
        self
    }

    /// Retry transient action failures per the retry policy
    pub fn retryable(mut self) -> Self {
        self.action_retryable = true;
        self
    }

    /// Declare the action safe to attempt twice
    pub fn idempotent(mut self) -> Self {
        self.action_idempotent = true;
        self
    }

    /// Verify with a policy-derived budget
    pub fn verify(mut self, probe: Probe) -> Self {
        self.verification = Verification {
            probe,
            timeout: None,
            poll_interval: None,
        };
        self
    }

    /// Verify with an explicit budget
    pub fn verify_within(mut self, probe: Probe, timeout: Duration, poll_interval: Duration) -> Self {
        self.verification = Verification {
            probe,
            timeout: Some(timeout),
            poll_interval: Some(poll_interval),
        };
        self
    }

    /// Set the retry policy
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Downgrade verification failures to warnings
    pub fn soft(mut self) -> Self {
        self.severity = Severity::Soft;
        self
    }

    /// Restrict to topologies with a floating endpoint
    pub fn only_with_floating_endpoint(mut self) -> Self {
        self.applicability = Applicability::FloatingEndpoint;
        self
    }

    /// Restrict to multi-member topologies
    pub fn only_multi_member(mut self) -> Self {
        self.applicability = Applicability::MultiMember;
        self
    }

    /// Interval between verification probes
    pub fn poll_interval(&self) -> Duration {
        self.verification
            .poll_interval
            .unwrap_or(self.retry_policy.initial_delay)
    }

    /// Verification wait budget
    pub fn verify_timeout(&self) -> Duration {
        self.verification.timeout.unwrap_or_else(|| {
            self.retry_policy
                .total_delay()
                .max(self.poll_interval())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::Query;
    use crate::topology::resolve;
    use keystone_common::BackoffKind;

    #[test]
    fn builder_defaults_are_conservative() {
        let phase = Phase::new("noop");
        assert_eq!(phase.severity, Severity::Fatal);
        assert_eq!(phase.idempotency_check, Probe::Never);
        assert!(!phase.action_retryable);
        assert!(!phase.action_idempotent);
        assert!(phase.action.is_none());
    }

    #[test]
    fn verification_budget_derives_from_policy() {
        let phase = Phase::new("network")
            .with_retry_policy(RetryPolicy {
                max_attempts: 4,
                initial_delay: Duration::from_secs(2),
                backoff: BackoffKind::Fixed,
                max_delay: Duration::from_secs(2),
                jitter: false,
            })
            .verify(Probe::Holds(Query::ApiServerReady));
        assert_eq!(phase.poll_interval(), Duration::from_secs(2));
        assert_eq!(phase.verify_timeout(), Duration::from_secs(6));

        let phase = phase.verify_within(
            Probe::Holds(Query::ApiServerReady),
            Duration::from_secs(60),
            Duration::from_secs(3),
        );
        assert_eq!(phase.verify_timeout(), Duration::from_secs(60));
        assert_eq!(phase.poll_interval(), Duration::from_secs(3));
    }

    #[test]
    fn single_attempt_policy_still_probes_once() {
        let phase = Phase::new("quick").with_retry_policy(RetryPolicy::fixed(1, Duration::from_secs(5)));
        assert_eq!(phase.verify_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn applicability_follows_topology() {
        let single = resolve("single", &["cp-1=10.0.0.1"]).unwrap();
        let pair = resolve("limited-ha", &["cp-1=10.0.0.1", "cp-2=10.0.0.2"]).unwrap();

        assert!(Applicability::Always.applies_to(&single));
        assert!(!Applicability::FloatingEndpoint.applies_to(&single));
        assert!(!Applicability::MultiMember.applies_to(&single));
        assert!(Applicability::FloatingEndpoint.applies_to(&pair));
        assert!(Applicability::MultiMember.applies_to(&pair));
    }

    #[test]
    fn operation_names_and_display() {
        let op = Operation::invoke("install-kubernetes-packages").with_arg("version", "1.32.0");
        assert_eq!(op.name(), "install-kubernetes-packages");
        assert_eq!(op.to_string(), "install-kubernetes-packages(version=1.32.0)");

        let op = Operation::apply(
            AddonConfig::new("calico", "3.29.1", "kube-system").with_setting("podCidr", "10.244.0.0/16"),
        );
        assert_eq!(op.name(), "apply:calico");
        assert_eq!(op.to_string(), "apply calico@3.29.1 in kube-system");
        // with_arg is a no-op on apply operations
        assert_eq!(op.clone().with_arg("x", "y"), op);
    }

    #[test]
    fn apply_operation_serializes_typed_config() {
        let op = Operation::apply(AddonConfig::new("metrics-server", "0.7.2", "kube-system"));
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["kind"], "apply");
        assert_eq!(json["name"], "metrics-server");
        assert!(json.get("settings").is_none());
    }
}
