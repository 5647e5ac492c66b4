//! Backend that runs external commands
//!
//! Operation and query names map to argv templates in a YAML file. Each argv
//! element is rendered with minijinja from the operation's arguments (or the
//! query's parameters) plus the file's global variables. Exit codes carry the
//! outcome:
//!
//! - `0`: success, or `true` for flag queries
//! - `1`: `false` for flag queries
//! - `exit_codes.already_done`: the operation found its work done
//! - any of `exit_codes.transient`: retryable failure
//! - anything else: unrecoverable failure
//!
//! Count queries print the count on stdout. Apply operations receive the
//! add-on configuration as JSON on stdin.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use minijinja::{Environment, UndefinedBehavior};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::debug;

use super::kube_api::KubeProbe;
use super::{ActionOutcome, ClusterBackend};
use crate::phase::Operation;
use crate::probe::{Answer, AnswerKind, Query};
use crate::Error;

/// Apply operations without an `apply:<addon>` entry use this one
const APPLY_FALLBACK: &str = "apply";

fn default_already_done() -> i32 {
    10
}

fn default_transient() -> Vec<i32> {
    // EX_TEMPFAIL, and timeout(1)'s exit code
    vec![75, 124]
}

fn default_command_timeout_secs() -> u64 {
    600
}

/// Exit-code conventions beyond 0 and 1
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct ExitCodes {
    /// The operation found its work already done
    #[serde(default = "default_already_done")]
    pub already_done: i32,
    /// Retryable failures
    #[serde(default = "default_transient")]
    pub transient: Vec<i32>,
}

impl Default for ExitCodes {
    fn default() -> Self {
        Self {
            already_done: default_already_done(),
            transient: default_transient(),
        }
    }
}

/// Command backend configuration, read from YAML
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandBackendConfig {
    /// Operation name (or `apply:<addon>`, or `apply`) to argv template
    #[serde(default)]
    pub operations: BTreeMap<String, Vec<String>>,
    /// Query name to argv template
    #[serde(default)]
    pub queries: BTreeMap<String, Vec<String>>,
    /// Exit-code conventions
    #[serde(default)]
    pub exit_codes: ExitCodes,
    /// Kubeconfig used to answer cluster queries that have no command
    #[serde(default)]
    pub kubeconfig: Option<PathBuf>,
    /// Extra template variables available to every command
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    /// Upper bound on a single command's run time
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
}

impl CommandBackendConfig {
    /// Parse a YAML document
    pub fn from_yaml(yaml: &str) -> Result<Self, Error> {
        serde_yaml::from_str(yaml).map_err(|e| {
            Error::configuration(format!("invalid backend config: {}", e), yaml.lines().next().unwrap_or(""))
        })
    }

    /// Read and parse a YAML file
    pub fn load(path: &Path) -> Result<Self, Error> {
        let yaml = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration(
                format!("cannot read backend config: {}", e),
                path.display().to_string(),
            )
        })?;
        serde_yaml::from_str(&yaml).map_err(|e| {
            Error::configuration(
                format!("invalid backend config: {}", e),
                path.display().to_string(),
            )
        })
    }
}

/// [`ClusterBackend`] that shells out
pub struct CommandBackend {
    config: CommandBackendConfig,
    templates: Environment<'static>,
    kube: OnceCell<KubeProbe>,
}

impl CommandBackend {
    /// Create a backend from its configuration
    pub fn new(config: CommandBackendConfig) -> Self {
        let mut templates = Environment::new();
        templates.set_undefined_behavior(UndefinedBehavior::Strict);
        Self {
            config,
            templates,
            kube: OnceCell::new(),
        }
    }

    /// Override the kubeconfig used for API fallbacks
    pub fn with_kubeconfig(mut self, kubeconfig: PathBuf) -> Self {
        self.config.kubeconfig = Some(kubeconfig);
        self
    }

    fn context(&self, vars: impl IntoIterator<Item = (String, Value)>) -> Value {
        let mut ctx: Map<String, Value> = self
            .config
            .variables
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        ctx.extend(vars);
        Value::Object(ctx)
    }

    fn render(&self, name: &str, argv: &[String], ctx: &Value) -> Result<Vec<String>, Error> {
        if argv.is_empty() {
            return Err(Error::backend(name, "empty command"));
        }
        argv.iter()
            .map(|arg| {
                self.templates
                    .render_str(arg, ctx)
                    .map_err(|e| Error::backend(name, format!("cannot render {:?}: {}", arg, e)))
            })
            .collect()
    }

    async fn execute(&self, name: &str, argv: &[String], stdin: Option<Vec<u8>>) -> Result<Output, Error> {
        debug!(command = %name, argv = ?argv, "Running command");

        let mut child = Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::backend(name, format!("failed to spawn {}: {}", argv[0], e)))?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(&input)
                .await
                .map_err(|e| Error::backend(name, format!("failed to write stdin: {}", e)))?;
        }

        let limit = Duration::from_secs(self.config.command_timeout_secs);
        match tokio::time::timeout(limit, child.wait_with_output()).await {
            Ok(output) => output.map_err(Error::from),
            Err(_) => Err(Error::transient(name, format!("timed out after {:?}", limit))),
        }
    }

    fn failure(&self, name: &str, output: &Output) -> Error {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        match output.status.code() {
            Some(code) if self.config.exit_codes.transient.contains(&code) => {
                Error::transient(name, format!("exit code {}: {}", code, stderr))
            }
            Some(code) => Error::unrecoverable(name, format!("exit code {}: {}", code, stderr)),
            None => Error::unrecoverable(name, format!("terminated by signal: {}", stderr)),
        }
    }

    async fn kube(&self) -> Result<Option<&KubeProbe>, Error> {
        let Some(path) = &self.config.kubeconfig else {
            return Ok(None);
        };
        let probe = self
            .kube
            .get_or_try_init(|| KubeProbe::connect(path))
            .await?;
        Ok(Some(probe))
    }

    async fn query_api(&self, query: &Query) -> Result<Answer, Error> {
        let unmapped = || Error::backend(query.name(), "no command configured for query");
        let fallback = matches!(
            query,
            Query::ApiServerReady | Query::ReadyMembers | Query::ResourceExists { .. }
        );
        if !fallback {
            return Err(unmapped());
        }
        let Some(kube) = self.kube().await? else {
            return Err(unmapped());
        };

        match query {
            Query::ApiServerReady => kube.api_ready().await.map(Answer::Flag),
            Query::ReadyMembers => kube.ready_nodes().await.map(Answer::Count),
            Query::ResourceExists {
                kind,
                name,
                namespace,
            } => kube
                .resource_exists(kind, name, namespace.as_deref())
                .await
                .map(Answer::Flag),
            _ => Err(unmapped()),
        }
    }
}

#[async_trait]
impl ClusterBackend for CommandBackend {
    async fn run(&self, operation: &Operation) -> Result<ActionOutcome, Error> {
        let name = operation.name();
        let (argv, ctx, stdin) = match operation {
            Operation::Invoke { args, .. } => {
                let argv = self.config.operations.get(&name);
                let vars = args.iter().map(|(k, v)| (k.clone(), Value::String(v.clone())));
                (argv, self.context(vars), None)
            }
            Operation::Apply(addon) => {
                let argv = self
                    .config
                    .operations
                    .get(&name)
                    .or_else(|| self.config.operations.get(APPLY_FALLBACK));
                let vars = [
                    ("name".to_string(), json!(addon.name)),
                    ("version".to_string(), json!(addon.version)),
                    ("namespace".to_string(), json!(addon.namespace)),
                    ("settings".to_string(), json!(addon.settings)),
                ];
                let payload = serde_json::to_vec(addon)
                    .map_err(|e| Error::backend(name.as_str(), format!("cannot encode add-on: {}", e)))?;
                (argv, self.context(vars), Some(payload))
            }
        };

        let argv = argv.ok_or_else(|| Error::backend(name.as_str(), "no command configured for operation"))?;
        let argv = self.render(&name, argv, &ctx)?;
        let output = self.execute(&name, &argv, stdin).await?;

        match output.status.code() {
            Some(0) => Ok(ActionOutcome::Done),
            Some(code) if code == self.config.exit_codes.already_done => {
                let detail = String::from_utf8_lossy(&output.stdout).trim().to_string();
                Ok(ActionOutcome::AlreadyDone(if detail.is_empty() {
                    format!("{} already done", name)
                } else {
                    detail
                }))
            }
            _ => Err(self.failure(&name, &output)),
        }
    }

    async fn query(&self, query: &Query) -> Result<Answer, Error> {
        let name = query.name();
        let Some(argv) = self.config.queries.get(name) else {
            return self.query_api(query).await;
        };

        let vars = query
            .vars()
            .into_iter()
            .map(|(k, v)| (k.to_string(), Value::String(v)));
        let ctx = self.context(vars);
        let argv = self.render(name, argv, &ctx)?;
        let output = self.execute(name, &argv, None).await?;

        match (query.answer_kind(), output.status.code()) {
            (AnswerKind::Flag, Some(0)) => Ok(Answer::Flag(true)),
            (AnswerKind::Flag, Some(1)) => Ok(Answer::Flag(false)),
            (AnswerKind::Count, Some(0)) => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                stdout.trim().parse().map(Answer::Count).map_err(|_| {
                    Error::backend(name, format!("expected a count on stdout, got {:?}", stdout.trim()))
                })
            }
            _ => Err(self.failure(name, &output)),
        }
    }
}
