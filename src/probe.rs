//! Read-only predicates over external state
//!
//! A [`Query`] is one question the backend can answer about the node or the
//! cluster; a [`Probe`] combines queries (and the progress of the current run)
//! into the boolean conditions phases are gated on.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;

use serde::Serialize;

use crate::backend::ClusterBackend;
use crate::state::{PhaseStatus, StateTracker};
use crate::Error;

/// A question about external state. Answering it must not change that state.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "query", rename_all = "kebab-case")]
pub enum Query {
    /// An executable is on the PATH
    ToolPresent {
        /// Executable name
        tool: String,
    },
    /// A file or directory exists
    PathExists {
        /// Absolute path
        path: String,
    },
    /// A system service is active
    ServiceActive {
        /// Service unit name
        service: String,
    },
    /// Kernel modules, sysctls and swap are configured for Kubernetes
    NodePrepared,
    /// Kubernetes node packages are installed at the given version
    PackagesInstalled {
        /// Kubernetes version
        version: String,
    },
    /// The cluster has been initialized on this node
    ClusterInitialized,
    /// A previous initialization left state behind without finishing
    PartialInit,
    /// The API server answers requests
    ApiServerReady,
    /// The floating endpoint address is bound to a member
    FloatingEndpointBound {
        /// Floating endpoint address
        address: String,
    },
    /// Count of members that joined the control plane
    JoinedMembers,
    /// Count of members reporting Ready
    ReadyMembers,
    /// Count of healthy datastore (etcd) members
    HealthyDatastoreMembers,
    /// A named API object exists
    ResourceExists {
        /// Resource kind, e.g. "customresourcedefinition" or "daemonset"
        kind: String,
        /// Object name
        name: String,
        /// Namespace for namespaced kinds
        #[serde(skip_serializing_if = "Option::is_none")]
        namespace: Option<String>,
    },
    /// An add-on reports healthy
    AddonHealthy {
        /// Add-on name
        name: String,
        /// Add-on namespace
        namespace: String,
    },
}

/// Shape of a query's answer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AnswerKind {
    /// true / false
    Flag,
    /// A non-negative count
    Count,
}

/// Answer returned by the backend
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Answer {
    /// Boolean answer
    Flag(bool),
    /// Count answer
    Count(usize),
}

impl Query {
    /// Create a tool-present query
    pub fn tool(tool: impl Into<String>) -> Self {
        Query::ToolPresent { tool: tool.into() }
    }

    /// Create a CRD-exists query
    pub fn crd(name: impl Into<String>) -> Self {
        Query::ResourceExists {
            kind: "customresourcedefinition".to_string(),
            name: name.into(),
            namespace: None,
        }
    }

    /// Create a namespaced resource-exists query
    pub fn resource(kind: impl Into<String>, name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Query::ResourceExists {
            kind: kind.into(),
            name: name.into(),
            namespace: Some(namespace.into()),
        }
    }

    /// Dispatch key for the backend
    pub fn name(&self) -> &'static str {
        match self {
            Query::ToolPresent { .. } => "tool-present",
            Query::PathExists { .. } => "path-exists",
            Query::ServiceActive { .. } => "service-active",
            Query::NodePrepared => "node-prepared",
            Query::PackagesInstalled { .. } => "packages-installed",
            Query::ClusterInitialized => "cluster-initialized",
            Query::PartialInit => "partial-init",
            Query::ApiServerReady => "api-server-ready",
            Query::FloatingEndpointBound { .. } => "floating-endpoint-bound",
            Query::JoinedMembers => "joined-members",
            Query::ReadyMembers => "ready-members",
            Query::HealthyDatastoreMembers => "healthy-datastore-members",
            Query::ResourceExists { .. } => "resource-exists",
            Query::AddonHealthy { .. } => "addon-healthy",
        }
    }

    /// Whether the answer is a flag or a count
    pub fn answer_kind(&self) -> AnswerKind {
        match self {
            Query::JoinedMembers | Query::ReadyMembers | Query::HealthyDatastoreMembers => {
                AnswerKind::Count
            }
            _ => AnswerKind::Flag,
        }
    }

    /// Named parameters, used to render backend command templates
    pub fn vars(&self) -> BTreeMap<&'static str, String> {
        let mut vars = BTreeMap::new();
        match self {
            Query::ToolPresent { tool } => {
                vars.insert("tool", tool.clone());
            }
            Query::PathExists { path } => {
                vars.insert("path", path.clone());
            }
            Query::ServiceActive { service } => {
                vars.insert("service", service.clone());
            }
            Query::PackagesInstalled { version } => {
                vars.insert("version", version.clone());
            }
            Query::FloatingEndpointBound { address } => {
                vars.insert("address", address.clone());
            }
            Query::ResourceExists {
                kind,
                name,
                namespace,
            } => {
                vars.insert("kind", kind.clone());
                vars.insert("name", name.clone());
                vars.insert("namespace", namespace.clone().unwrap_or_default());
            }
            Query::AddonHealthy { name, namespace } => {
                vars.insert("name", name.clone());
                vars.insert("namespace", namespace.clone());
            }
            Query::NodePrepared
            | Query::ClusterInitialized
            | Query::PartialInit
            | Query::ApiServerReady
            | Query::JoinedMembers
            | Query::ReadyMembers
            | Query::HealthyDatastoreMembers => {}
        }
        vars
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let vars = self.vars();
        if vars.is_empty() {
            return f.write_str(self.name());
        }
        let rendered: Vec<&str> = vars.values().filter(|v| !v.is_empty()).map(|v| v.as_str()).collect();
        write!(f, "{}({})", self.name(), rendered.join(", "))
    }
}

/// Boolean condition gating a phase
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Probe {
    /// Always true
    Always,
    /// Always false
    Never,
    /// A flag query answers true
    Holds(Query),
    /// A count query answers at least `n`
    AtLeast(Query, usize),
    /// The named phase already completed in this run
    PhaseCompleted(String),
    /// Every probe holds (true when empty)
    All(Vec<Probe>),
    /// Some probe holds (false when empty)
    Any(Vec<Probe>),
    /// The inner probe does not hold
    Not(Box<Probe>),
}

/// What a probe may look at while it is evaluated
#[derive(Clone, Copy)]
pub struct ProbeContext<'a> {
    /// External state
    pub backend: &'a dyn ClusterBackend,
    /// Progress of the current run
    pub tracker: &'a StateTracker,
}

type ProbeFuture<'a> = Pin<Box<dyn Future<Output = Result<bool, Error>> + Send + 'a>>;

impl Probe {
    /// Evaluate against the backend and the run's state. Never mutates either.
    pub fn evaluate<'a>(&'a self, ctx: ProbeContext<'a>) -> ProbeFuture<'a> {
        Box::pin(async move {
            match self {
                Probe::Always => Ok(true),
                Probe::Never => Ok(false),
                Probe::Holds(query) => match ctx.backend.query(query).await? {
                    Answer::Flag(value) => Ok(value),
                    Answer::Count(_) => Err(Error::backend(
                        query.name(),
                        "expected a flag answer, got a count",
                    )),
                },
                Probe::AtLeast(query, n) => match ctx.backend.query(query).await? {
                    Answer::Count(count) => Ok(count >= *n),
                    Answer::Flag(_) => Err(Error::backend(
                        query.name(),
                        "expected a count answer, got a flag",
                    )),
                },
                Probe::PhaseCompleted(name) => {
                    Ok(ctx.tracker.status(name) == Some(PhaseStatus::Completed))
                }
                Probe::All(probes) => {
                    for probe in probes {
                        if !probe.evaluate(ctx).await? {
                            return Ok(false);
                        }
                    }
                    Ok(true)
                }
                Probe::Any(probes) => {
                    for probe in probes {
                        if probe.evaluate(ctx).await? {
                            return Ok(true);
                        }
                    }
                    Ok(false)
                }
                Probe::Not(inner) => Ok(!inner.evaluate(ctx).await?),
            }
        })
    }
}

impl fmt::Display for Probe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Probe::Always => write!(f, "always"),
            Probe::Never => write!(f, "never"),
            Probe::Holds(query) => write!(f, "{}", query),
            Probe::AtLeast(query, n) => write!(f, "{} >= {}", query, n),
            Probe::PhaseCompleted(name) => write!(f, "phase {} completed", name),
            Probe::All(probes) => write_joined(f, probes, " and "),
            Probe::Any(probes) => write_joined(f, probes, " or "),
            Probe::Not(inner) => write!(f, "not ({})", inner),
        }
    }
}

fn write_joined(f: &mut fmt::Formatter<'_>, probes: &[Probe], sep: &str) -> fmt::Result {
    let parts: Vec<String> = probes.iter().map(|p| p.to_string()).collect();
    write!(f, "{}", parts.join(sep))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockClusterBackend;

    fn tracker() -> StateTracker {
        StateTracker::new(["prepare", "init"])
    }

    #[tokio::test]
    async fn holds_reads_flag_answers() {
        let mut backend = MockClusterBackend::new();
        backend
            .expect_query()
            .withf(|q| *q == Query::ApiServerReady)
            .times(1)
            .returning(|_| Ok(Answer::Flag(true)));

        let tracker = tracker();
        let ctx = ProbeContext { backend: &backend, tracker: &tracker };
        assert!(Probe::Holds(Query::ApiServerReady).evaluate(ctx).await.unwrap());
    }

    #[tokio::test]
    async fn at_least_compares_counts() {
        let mut backend = MockClusterBackend::new();
        backend
            .expect_query()
            .returning(|_| Ok(Answer::Count(2)));

        let tracker = tracker();
        let ctx = ProbeContext { backend: &backend, tracker: &tracker };
        assert!(Probe::AtLeast(Query::ReadyMembers, 2).evaluate(ctx).await.unwrap());
        assert!(!Probe::AtLeast(Query::ReadyMembers, 3).evaluate(ctx).await.unwrap());
    }

    #[tokio::test]
    async fn mismatched_answer_shape_is_an_error() {
        let mut backend = MockClusterBackend::new();
        backend.expect_query().returning(|_| Ok(Answer::Count(1)));

        let tracker = tracker();
        let ctx = ProbeContext { backend: &backend, tracker: &tracker };
        let err = Probe::Holds(Query::ClusterInitialized)
            .evaluate(ctx)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cluster-initialized"));
    }

    #[tokio::test]
    async fn combinators_short_circuit() {
        // Never queried: All stops at the first false, Any at the first true
        let backend = MockClusterBackend::new();
        let tracker = tracker();
        let ctx = ProbeContext { backend: &backend, tracker: &tracker };

        let all = Probe::All(vec![Probe::Never, Probe::Holds(Query::ApiServerReady)]);
        assert!(!all.evaluate(ctx).await.unwrap());

        let any = Probe::Any(vec![Probe::Always, Probe::Holds(Query::ApiServerReady)]);
        assert!(any.evaluate(ctx).await.unwrap());

        assert!(Probe::All(vec![]).evaluate(ctx).await.unwrap());
        assert!(!Probe::Any(vec![]).evaluate(ctx).await.unwrap());
        assert!(Probe::Not(Box::new(Probe::Never)).evaluate(ctx).await.unwrap());
    }

    #[tokio::test]
    async fn phase_completed_reads_tracker() {
        let backend = MockClusterBackend::new();
        let mut tracker = tracker();
        let probe = Probe::PhaseCompleted("prepare".to_string());

        {
            let ctx = ProbeContext { backend: &backend, tracker: &tracker };
            assert!(!probe.evaluate(ctx).await.unwrap());
        }

        tracker.mark_running("prepare").unwrap();
        tracker.mark_completed("prepare", None, None).unwrap();

        let ctx = ProbeContext { backend: &backend, tracker: &tracker };
        assert!(probe.evaluate(ctx).await.unwrap());
    }

    #[test]
    fn display_is_readable() {
        let probe = Probe::All(vec![
            Probe::Holds(Query::crd("ippools.crd.projectcalico.org")),
            Probe::AtLeast(Query::ReadyMembers, 3),
        ]);
        assert_eq!(
            probe.to_string(),
            "resource-exists(customresourcedefinition, ippools.crd.projectcalico.org) and ready-members >= 3"
        );
        assert_eq!(Query::tool("kubeadm").to_string(), "tool-present(kubeadm)");
    }

    #[test]
    fn query_vars_feed_templates() {
        let q = Query::resource("daemonset", "calico-node", "kube-system");
        let vars = q.vars();
        assert_eq!(vars["kind"], "daemonset");
        assert_eq!(vars["namespace"], "kube-system");
        assert_eq!(q.answer_kind(), AnswerKind::Flag);
        assert_eq!(Query::HealthyDatastoreMembers.answer_kind(), AnswerKind::Count);
    }
}
