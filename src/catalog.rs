//! Standard control-plane phase catalog
//!
//! The ordered phase list that takes a bare node to a verified control plane:
//! node preparation, runtime and packages, the floating endpoint, cluster
//! init and joins, the network add-on, a datastore quorum check, and the
//! storage and monitoring add-ons.

use std::time::Duration;

use keystone_common::polling::{DEFAULT_POLL_INTERVAL, DEFAULT_VERIFY_TIMEOUT};
use keystone_common::{RetryPolicy, DEFAULT_KUBE_VERSION, DEFAULT_POD_CIDR};

use crate::phase::{AddonConfig, Operation, Phase};
use crate::probe::{Probe, Query};
use crate::topology::Topology;
use crate::Error;

/// Phase names, in execution order
pub mod names {
    /// Node preparation
    pub const PREFLIGHT: &str = "preflight";
    /// Container runtime install
    pub const CONTAINER_RUNTIME: &str = "container-runtime";
    /// Kubernetes packages install
    pub const KUBERNETES_PACKAGES: &str = "kubernetes-packages";
    /// Floating endpoint setup
    pub const FLOATING_ENDPOINT: &str = "floating-endpoint";
    /// Cluster initialization on the first member
    pub const CLUSTER_INIT: &str = "cluster-init";
    /// Remaining members join
    pub const JOIN_MEMBERS: &str = "join-members";
    /// Network add-on
    pub const CLUSTER_NETWORK: &str = "cluster-network";
    /// Datastore quorum check
    pub const CONTROL_PLANE_QUORUM: &str = "control-plane-quorum";
    /// Storage add-on
    pub const STORAGE: &str = "storage";
    /// Monitoring add-on
    pub const MONITORING: &str = "monitoring";
}

/// Network add-on and the CRDs it must register before the network is usable
#[derive(Clone, Debug, PartialEq)]
pub struct NetworkSettings {
    /// Add-on handed to the backend's apply operation
    pub addon: AddonConfig,
    /// CRDs that must exist before the phase is verified
    pub required_crds: Vec<String>,
}

/// Inputs to the catalog, built once by the caller
#[derive(Clone, Debug, PartialEq)]
pub struct CatalogSettings {
    /// Kubernetes version to install
    pub kube_version: String,
    /// Pod network CIDR
    pub pod_cidr: String,
    /// Floating endpoint address; required for multi-member topologies
    pub floating_endpoint: Option<String>,
    /// API server port
    pub api_port: u16,
    /// Container runtime service name
    pub container_runtime: String,
    /// Tools that must be present before anything runs
    pub required_tools: Vec<String>,
    /// Policy for every retryable action and for derived verification budgets
    pub retry_policy: RetryPolicy,
    /// Wait budget for cluster-level verifications
    pub verify_timeout: Duration,
    /// Poll interval for cluster-level verifications
    pub poll_interval: Duration,
    /// Network add-on
    pub network: NetworkSettings,
    /// Storage add-on
    pub storage: AddonConfig,
    /// Monitoring add-on
    pub monitoring: AddonConfig,
}

impl Default for CatalogSettings {
    fn default() -> Self {
        Self {
            kube_version: DEFAULT_KUBE_VERSION.to_string(),
            pod_cidr: DEFAULT_POD_CIDR.to_string(),
            floating_endpoint: None,
            api_port: 6443,
            container_runtime: "containerd".to_string(),
            required_tools: vec![
                "curl".to_string(),
                "systemctl".to_string(),
                "modprobe".to_string(),
            ],
            retry_policy: RetryPolicy::default(),
            verify_timeout: DEFAULT_VERIFY_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            network: NetworkSettings {
                addon: AddonConfig::new("calico", "3.29.1", "kube-system"),
                required_crds: vec![
                    "ippools.crd.projectcalico.org".to_string(),
                    "felixconfigurations.crd.projectcalico.org".to_string(),
                ],
            },
            storage: AddonConfig::new("local-path-provisioner", "0.0.30", "local-path-storage"),
            monitoring: AddonConfig::new("metrics-server", "0.7.2", "kube-system"),
        }
    }
}

/// Build the control-plane phase list for `topology`.
///
/// Every phase is fatal except the storage and monitoring add-ons.
pub fn control_plane(topology: &Topology, settings: &CatalogSettings) -> Result<Vec<Phase>, Error> {
    let floating = match (&settings.floating_endpoint, topology.has_floating_endpoint()) {
        (Some(address), true) => Some(address.clone()),
        (None, true) => {
            return Err(Error::configuration(
                format!(
                    "{} topology requires a floating endpoint address",
                    topology.environment()
                ),
                "",
            ))
        }
        (_, false) => None,
    };

    let first = topology.first_member();
    let endpoint_host = floating.clone().unwrap_or_else(|| first.address.clone());
    let control_plane_endpoint = format!("{}:{}", endpoint_host, settings.api_port);
    let policy = settings.retry_policy.clone();
    let api_ready = Probe::Holds(Query::ApiServerReady);
    let all_members = topology.size();

    let tools = settings
        .required_tools
        .iter()
        .map(|t| Probe::Holds(Query::tool(t.as_str())))
        .collect();

    let mut phases = vec![
        Phase::new(names::PREFLIGHT)
            .with_description("Disable swap, load kernel modules and set sysctls")
            .with_precondition(Probe::All(tools))
            .skip_when(Probe::Holds(Query::NodePrepared))
            .with_action(Operation::invoke("prepare-node"))
            .idempotent()
            .verify(Probe::Holds(Query::NodePrepared))
            .with_retry_policy(policy.clone()),
        Phase::new(names::CONTAINER_RUNTIME)
            .with_description("Install and start the container runtime")
            .skip_when(service_active(&settings.container_runtime))
            .with_action(
                Operation::invoke("install-container-runtime")
                    .with_arg("runtime", settings.container_runtime.clone()),
            )
            .retryable()
            .idempotent()
            .verify(service_active(&settings.container_runtime))
            .with_retry_policy(policy.clone()),
        Phase::new(names::KUBERNETES_PACKAGES)
            .with_description("Install kubeadm, kubelet and kubectl")
            .skip_when(packages_installed(&settings.kube_version))
            .with_action(
                Operation::invoke("install-kubernetes-packages")
                    .with_arg("version", settings.kube_version.clone()),
            )
            .retryable()
            .idempotent()
            .verify(packages_installed(&settings.kube_version))
            .with_retry_policy(policy.clone()),
    ];

    if let Some(address) = &floating {
        let bound = Probe::Holds(Query::FloatingEndpointBound {
            address: address.clone(),
        });
        let holder = topology.endpoint_holder().unwrap_or(first);
        phases.push(
            Phase::new(names::FLOATING_ENDPOINT)
                .with_description("Bind the floating API endpoint")
                .only_with_floating_endpoint()
                .skip_when(bound.clone())
                .with_action(
                    Operation::invoke("configure-floating-endpoint")
                        .with_arg("address", address.clone())
                        .with_arg("holder", holder.hostname.clone())
                        .with_arg("port", settings.api_port.to_string()),
                )
                .idempotent()
                .verify_within(bound, settings.verify_timeout, settings.poll_interval)
                .with_retry_policy(policy.clone()),
        );
    }

    phases.push(
        Phase::new(names::CLUSTER_INIT)
            .with_description("Initialize the cluster on the first member")
            .with_precondition(Probe::Holds(Query::tool("kubeadm")))
            .skip_when(Probe::Holds(Query::ClusterInitialized))
            .repair_when(
                Probe::Holds(Query::PartialInit),
                Operation::invoke("reset-cluster"),
            )
            .with_action(
                Operation::invoke("init-cluster")
                    .with_arg("control_plane_endpoint", control_plane_endpoint)
                    .with_arg("advertise_address", first.address.clone())
                    .with_arg("node_name", first.hostname.clone())
                    .with_arg("pod_cidr", settings.pod_cidr.clone())
                    .with_arg("version", settings.kube_version.clone()),
            )
            .verify_within(api_ready.clone(), settings.verify_timeout, settings.poll_interval)
            .with_retry_policy(policy.clone()),
    );

    if topology.size() > 1 {
        let joined = Probe::AtLeast(Query::JoinedMembers, all_members);
        let others: Vec<String> = topology.members()[1..]
            .iter()
            .map(|m| format!("{}={}", m.hostname, m.address))
            .collect();
        phases.push(
            Phase::new(names::JOIN_MEMBERS)
                .with_description("Join the remaining members to the control plane")
                .only_multi_member()
                .with_precondition(api_ready.clone())
                .skip_when(joined.clone())
                .with_action(
                    Operation::invoke("join-members").with_arg("members", others.join(",")),
                )
                .retryable()
                .idempotent()
                .verify_within(joined, settings.verify_timeout, settings.poll_interval)
                .with_retry_policy(policy.clone()),
        );
    }

    let network = &settings.network;
    let network_addon = network
        .addon
        .clone()
        .with_setting("podCidr", settings.pod_cidr.clone());
    let mut network_ready: Vec<Probe> = network
        .required_crds
        .iter()
        .map(|crd| Probe::Holds(Query::crd(crd.as_str())))
        .collect();
    network_ready.push(Probe::AtLeast(Query::ReadyMembers, all_members));

    phases.push(
        Phase::new(names::CLUSTER_NETWORK)
            .with_description("Install the pod network and wait for its CRDs and ready members")
            .with_precondition(api_ready.clone())
            .skip_when(addon_healthy(&network.addon))
            .with_action(Operation::apply(network_addon))
            .retryable()
            .idempotent()
            .verify_within(
                Probe::All(network_ready),
                settings.verify_timeout,
                settings.poll_interval,
            )
            .with_retry_policy(policy.clone()),
    );

    phases.push(
        Phase::new(names::CONTROL_PLANE_QUORUM)
            .with_description("Wait for a datastore quorum")
            .with_precondition(api_ready.clone())
            .verify_within(
                Probe::AtLeast(Query::HealthyDatastoreMembers, topology.quorum()),
                settings.verify_timeout,
                settings.poll_interval,
            )
            .with_retry_policy(policy.clone()),
    );

    for (name, description, addon) in [
        (names::STORAGE, "Install the storage add-on", &settings.storage),
        (names::MONITORING, "Install the monitoring add-on", &settings.monitoring),
    ] {
        phases.push(
            Phase::new(name)
                .with_description(description)
                .with_precondition(api_ready.clone())
                .skip_when(addon_healthy(addon))
                .with_action(Operation::apply(addon.clone()))
                .retryable()
                .idempotent()
                .verify_within(addon_healthy(addon), settings.verify_timeout, settings.poll_interval)
                .with_retry_policy(policy.clone())
                .soft(),
        );
    }

    Ok(phases)
}

fn service_active(service: &str) -> Probe {
    Probe::Holds(Query::ServiceActive {
        service: service.to_string(),
    })
}

fn packages_installed(version: &str) -> Probe {
    Probe::Holds(Query::PackagesInstalled {
        version: version.to_string(),
    })
}

fn addon_healthy(addon: &AddonConfig) -> Probe {
    Probe::Holds(Query::AddonHealthy {
        name: addon.name.clone(),
        namespace: addon.namespace.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::{Applicability, Severity};
    use crate::topology::resolve;

    fn phase_names(phases: &[Phase]) -> Vec<&str> {
        phases.iter().map(|p| p.name.as_str()).collect()
    }

    #[test]
    fn single_member_has_no_endpoint_or_join_phase() {
        let topology = resolve("single", &["cp-1=10.0.0.1"]).unwrap();
        let phases = control_plane(&topology, &CatalogSettings::default()).unwrap();
        assert_eq!(
            phase_names(&phases),
            vec![
                "preflight",
                "container-runtime",
                "kubernetes-packages",
                "cluster-init",
                "cluster-network",
                "control-plane-quorum",
                "storage",
                "monitoring",
            ]
        );
    }

    #[test]
    fn full_ha_includes_every_phase_in_order() {
        let topology = resolve(
            "full-ha",
            &["cp-1=10.0.0.1", "cp-2=10.0.0.2", "cp-3=10.0.0.3", "cp-4=10.0.0.4"],
        )
        .unwrap();
        let settings = CatalogSettings {
            floating_endpoint: Some("10.0.0.100".to_string()),
            ..Default::default()
        };
        let phases = control_plane(&topology, &settings).unwrap();
        assert_eq!(
            phase_names(&phases),
            vec![
                "preflight",
                "container-runtime",
                "kubernetes-packages",
                "floating-endpoint",
                "cluster-init",
                "join-members",
                "cluster-network",
                "control-plane-quorum",
                "storage",
                "monitoring",
            ]
        );

        let endpoint = &phases[3];
        assert_eq!(endpoint.applicability, Applicability::FloatingEndpoint);

        let init = &phases[4];
        match &init.action {
            Some(Operation::Invoke { args, .. }) => {
                assert_eq!(args["control_plane_endpoint"], "10.0.0.100:6443");
                assert_eq!(args["node_name"], "cp-1");
            }
            other => panic!("unexpected action {:?}", other),
        }

        // 4 members: quorum 3
        let quorum = &phases[7];
        assert_eq!(
            quorum.verification.probe,
            Probe::AtLeast(Query::HealthyDatastoreMembers, 3)
        );
    }

    #[test]
    fn only_addons_are_soft() {
        let topology = resolve("single", &["10.0.0.1"]).unwrap();
        let phases = control_plane(&topology, &CatalogSettings::default()).unwrap();
        let soft: Vec<&str> = phases
            .iter()
            .filter(|p| p.severity == Severity::Soft)
            .map(|p| p.name.as_str())
            .collect();
        assert_eq!(soft, vec!["storage", "monitoring"]);
    }

    #[test]
    fn cluster_init_is_guarded_and_not_repeatable() {
        let topology = resolve("single", &["10.0.0.1"]).unwrap();
        let phases = control_plane(&topology, &CatalogSettings::default()).unwrap();
        let init = phases.iter().find(|p| p.name == names::CLUSTER_INIT).unwrap();
        assert!(!init.action_idempotent);
        assert!(!init.action_retryable);
        assert_eq!(init.idempotency_check, Probe::Holds(Query::ClusterInitialized));
        assert!(init.repair.is_some());
    }

    #[test]
    fn multi_member_without_endpoint_address_is_rejected() {
        let topology = resolve("limited-ha", &["10.0.0.1", "10.0.0.2"]).unwrap();
        let err = control_plane(&topology, &CatalogSettings::default()).unwrap_err();
        assert!(err.to_string().contains("floating endpoint"));
    }
}
