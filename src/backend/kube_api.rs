//! Cluster queries answered through the Kubernetes API

use std::path::Path;
use std::time::Duration;

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::{Namespace, Node};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::ListParams;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::Error;

/// Connection timeout; the API server is local or one hop away
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Read timeout for a single request
const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Read-only view of the cluster through the API server
#[derive(Clone)]
pub struct KubeProbe {
    client: Client,
}

impl KubeProbe {
    /// Connect using a kubeconfig file
    pub async fn connect(kubeconfig: &Path) -> Result<Self, Error> {
        let kubeconfig_file = Kubeconfig::read_from(kubeconfig).map_err(|e| {
            Error::transient(
                "kubeconfig",
                format!("failed to read {}: {}", kubeconfig.display(), e),
            )
        })?;
        let mut config = Config::from_custom_kubeconfig(kubeconfig_file, &KubeConfigOptions::default())
            .await
            .map_err(|e| Error::transient("kubeconfig", format!("failed to load kubeconfig: {}", e)))?;
        config.connect_timeout = Some(CONNECT_TIMEOUT);
        config.read_timeout = Some(READ_TIMEOUT);

        let client = Client::try_from(config)
            .map_err(|e| Error::backend("kubeconfig", format!("failed to create client: {}", e)))?;
        Ok(Self { client })
    }

    /// Whether the API server answers a version request
    pub async fn api_ready(&self) -> Result<bool, Error> {
        match self.client.apiserver_version().await {
            Ok(_) => Ok(true),
            Err(e) => {
                debug!(error = %e, "API server not answering");
                Ok(false)
            }
        }
    }

    /// Number of nodes whose Ready condition is True
    pub async fn ready_nodes(&self) -> Result<usize, Error> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let list = nodes
            .list(&ListParams::default())
            .await
            .map_err(|e| Error::transient("ready-members", format!("failed to list nodes: {}", e)))?;
        Ok(list.items.iter().filter(|n| is_node_ready(n)).count())
    }

    /// Whether a named object exists. 404 means no.
    pub async fn resource_exists(
        &self,
        kind: &str,
        name: &str,
        namespace: Option<&str>,
    ) -> Result<bool, Error> {
        match (kind.to_lowercase().as_str(), namespace) {
            ("customresourcedefinition" | "crd", _) => {
                self.exists(Api::<CustomResourceDefinition>::all(self.client.clone()), name)
                    .await
            }
            ("namespace", _) => self.exists(Api::<Namespace>::all(self.client.clone()), name).await,
            ("daemonset", Some(ns)) => {
                self.exists(Api::<DaemonSet>::namespaced(self.client.clone(), ns), name)
                    .await
            }
            ("deployment", Some(ns)) => {
                self.exists(Api::<Deployment>::namespaced(self.client.clone(), ns), name)
                    .await
            }
            (other, _) => Err(Error::backend(
                "resource-exists",
                format!("unsupported kind {} for the API fallback", other),
            )),
        }
    }

    async fn exists<K>(&self, api: Api<K>, name: &str) -> Result<bool, Error>
    where
        K: kube::Resource + Clone + DeserializeOwned + std::fmt::Debug,
    {
        match api.get(name).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(false),
            Err(e) => Err(Error::transient(
                "resource-exists",
                format!("failed to get {}: {}", name, e),
            )),
        }
    }
}

/// Check if a node has the Ready condition set to True
pub fn is_node_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{NodeCondition, NodeStatus};

    fn node_with(condition: &str, status: &str) -> Node {
        Node {
            status: Some(NodeStatus {
                conditions: Some(vec![NodeCondition {
                    type_: condition.to_string(),
                    status: status.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn ready_condition_must_be_true() {
        assert!(is_node_ready(&node_with("Ready", "True")));
        assert!(!is_node_ready(&node_with("Ready", "False")));
        assert!(!is_node_ready(&node_with("MemoryPressure", "True")));
        assert!(!is_node_ready(&Node::default()));
    }

    #[tokio::test]
    async fn missing_kubeconfig_is_transient() {
        let dir = tempfile::tempdir().unwrap();
        let err = KubeProbe::connect(&dir.path().join("admin.conf"))
            .await
            .err()
            .unwrap();
        assert!(err.is_retryable());
    }
}
