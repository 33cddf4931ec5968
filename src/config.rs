//! Cluster connection configuration
//!
//! Resolves API server address, credentials, and the default namespace.
//!
//! Resolution chain (highest priority first):
//! 1. Explicit `--kubeconfig` path
//! 2. `KUBECONFIG` environment variable / `~/.kube/config` (kube defaults,
//!    including multi-file merging)
//! 3. In-cluster service account, when running inside a pod

use std::path::Path;
use std::time::Duration;

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Config;
use tracing::debug;

use crate::request::ExecCommand;
use crate::{Error, Result};

/// Namespace used when neither the flag nor the kubeconfig context sets one
pub const DEFAULT_NAMESPACE: &str = "default";

/// Credentials and endpoint for talking to the API server
#[derive(Debug, Clone)]
pub struct ConnectionCredentials {
    config: Config,
}

impl ConnectionCredentials {
    /// Wrap a resolved kube client config
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// The underlying kube client config
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// API server URL
    pub fn cluster_url(&self) -> String {
        self.config.cluster_url.to_string()
    }
}

/// A resolved cluster connection
#[derive(Debug, Clone)]
pub struct ClusterConnection {
    /// Credentials used by the transport
    pub credentials: ConnectionCredentials,
    /// Namespace of the selected context
    pub default_namespace: String,
}

/// Everything one invocation needs, parsed once from the command line
#[derive(Debug, Clone)]
pub struct ExecConfig {
    /// Pod to exec into
    pub pod: String,
    /// Container; empty lets the API server pick the only container
    pub container: String,
    /// Namespace override; `None` uses the context's namespace
    pub namespace: Option<String>,
    /// Command to run
    pub command: ExecCommand,
    /// Explicit kubeconfig path
    pub kubeconfig: Option<String>,
    /// Kubeconfig context to use instead of the current one
    pub context: Option<String>,
    /// How long to wait for output to flush once the session ends
    pub drain_grace: Duration,
}

impl ExecConfig {
    /// Namespace to use: the explicit override, else the connection default
    pub fn namespace_for(&self, connection: &ClusterConnection) -> Result<String> {
        match self.namespace.as_deref() {
            Some(ns) if !ns.is_empty() => Ok(ns.to_string()),
            _ if connection.default_namespace.is_empty() => {
                Err(Error::config("no namespace given and no default namespace configured"))
            }
            _ => Ok(connection.default_namespace.clone()),
        }
    }
}

/// Resolve cluster connection details.
///
/// `explicit` is a kubeconfig path that overrides the default lookup;
/// `context` selects a kubeconfig context other than the current one.
pub async fn resolve(explicit: Option<&str>, context: Option<&str>) -> Result<ClusterConnection> {
    let options = KubeConfigOptions {
        context: context.map(str::to_string),
        ..Default::default()
    };

    let config = match explicit {
        Some(path) => from_path(Path::new(path), &options).await?,
        None => match Config::from_kubeconfig(&options).await {
            Ok(config) => config,
            Err(kubeconfig_err) if context.is_none() => {
                debug!(error = %kubeconfig_err, "No usable kubeconfig, trying in-cluster config");
                Config::incluster().map_err(|incluster_err| {
                    Error::config(format!(
                        "no usable kubeconfig ({}) and not running in a cluster ({})",
                        kubeconfig_err, incluster_err
                    ))
                })?
            }
            Err(e) => return Err(Error::config(format!("failed to load kubeconfig: {}", e))),
        },
    };

    debug!(
        server = %config.cluster_url,
        namespace = %config.default_namespace,
        "Resolved cluster connection"
    );

    Ok(ClusterConnection {
        default_namespace: config.default_namespace.clone(),
        credentials: ConnectionCredentials::new(config),
    })
}

async fn from_path(path: &Path, options: &KubeConfigOptions) -> Result<Config> {
    let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
        Error::config(format!("failed to read kubeconfig {}: {}", path.display(), e))
    })?;
    Config::from_custom_kubeconfig(kubeconfig, options)
        .await
        .map_err(|e| {
            Error::config(format!(
                "failed to load kubeconfig {}: {}",
                path.display(),
                e
            ))
        })
}
