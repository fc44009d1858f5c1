//! Deployment driver
//!
//! Installs and uninstalls the packaged store bundle. The orchestrator only
//! depends on the [`DeploymentDriver`] trait; the default implementation
//! shells out to the `helm` binary, handing it the base values file plus a
//! rendered per-store override document (helm deep-merges the two).

use std::io::Write;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::process::Command;
use tracing::{info, warn};

#[cfg(test)]
use mockall::automock;

use crate::cluster::ClusterProbe;
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::naming::random_string;
use crate::store::{Store, StoreKind};

/// Ceiling helm itself gets for one install
const INSTALL_TIMEOUT: Duration = Duration::from_secs(15 * 60);
const SECRET_LEN: usize = 24;

/// Per-store inputs fixed at admission time
#[derive(Clone, Debug)]
pub struct InstallParams {
    /// Host label under the base domain
    pub subdomain: String,
    /// Admin password for kinds that need one; empty otherwise
    pub admin_password: String,
}

/// Installs and removes store releases
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DeploymentDriver: Send + Sync {
    /// Install the bundle for a store; blocks until the release is rolled out
    async fn install(&self, store: &Store, params: &InstallParams) -> Result<()>;
    /// Remove a store's release; missing releases are not an error
    async fn uninstall(&self, id: &str, namespace: &str, timeout: Duration) -> Result<()>;
}

/// [`DeploymentDriver`] backed by the `helm` CLI
pub struct HelmDriver {
    settings: Arc<Settings>,
    probe: Arc<ClusterProbe>,
}

impl HelmDriver {
    /// Create a driver using the given configuration and cluster probe
    pub fn new(settings: Arc<Settings>, probe: Arc<ClusterProbe>) -> Self {
        Self { settings, probe }
    }

    async fn resolve_storage_class(&self) -> Result<String> {
        if !self.settings.storage_class.is_empty() {
            return Ok(self.settings.storage_class.clone());
        }
        if let Ok(Some(detected)) = self.probe.detect_default_storage_class().await {
            return Ok(detected);
        }
        Err(Error::driver(
            "no default StorageClass found; set STORAGE_CLASS env var",
        ))
    }
}

#[async_trait]
impl DeploymentDriver for HelmDriver {
    async fn install(&self, store: &Store, params: &InstallParams) -> Result<()> {
        let ingress_class = self
            .probe
            .resolve_ingress_class(&self.settings.ingress_class)
            .await;
        let ingress_namespace = ClusterProbe::resolve_ingress_namespace(&ingress_class);
        let storage_class = self.resolve_storage_class().await?;

        let secrets = GeneratedSecrets {
            mysql_root_password: random_string(SECRET_LEN),
            mysql_password: random_string(SECRET_LEN),
            admin_password: params.admin_password.clone(),
        };
        let host = format!("{}.{}", params.subdomain, self.settings.base_domain);
        let overrides = build_overrides(
            store.kind,
            &host,
            &ingress_class,
            ingress_namespace,
            &self.settings.admin_user,
            &self.settings.admin_email,
            &secrets,
            &storage_class,
            &self.settings.plugin_list(),
        );
        let override_yaml = serde_yaml::to_string(&overrides)
            .map_err(|e| Error::driver(format!("render overrides: {e}")))?;
        let mut override_file = tempfile::NamedTempFile::new()
            .map_err(|e| Error::driver(format!("override file: {e}")))?;
        override_file
            .write_all(override_yaml.as_bytes())
            .map_err(|e| Error::driver(format!("override file: {e}")))?;

        let release = Store::release_name(&store.id);
        let mut command = Command::new("helm");
        command
            .arg("upgrade")
            .arg("--install")
            .arg(&release)
            .arg(&self.settings.chart_path)
            .arg("--namespace")
            .arg(&store.namespace)
            .arg("--create-namespace")
            .arg("--wait")
            .arg("--wait-for-jobs")
            .arg("--timeout")
            .arg(format!("{}s", INSTALL_TIMEOUT.as_secs()));
        if self.settings.values_file.is_file() {
            command.arg("-f").arg(&self.settings.values_file);
        }
        command.arg("-f").arg(override_file.path());

        info!(release = %release, namespace = %store.namespace, "helm install");
        run_helm(command, "helm install").await
    }

    async fn uninstall(&self, id: &str, namespace: &str, timeout: Duration) -> Result<()> {
        let release = Store::release_name(id);
        let mut command = Command::new("helm");
        command
            .arg("uninstall")
            .arg(&release)
            .arg("--namespace")
            .arg(namespace)
            .arg("--wait")
            .arg("--timeout")
            .arg(format!("{}s", timeout.as_secs()));

        info!(release = %release, namespace = %namespace, "helm uninstall");
        match run_helm(command, "helm uninstall").await {
            Ok(()) => Ok(()),
            Err(Error::Driver(message)) if is_release_missing(&message) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

async fn run_helm(mut command: Command, context: &str) -> Result<()> {
    command.stdin(Stdio::null()).kill_on_drop(true);
    let output = command
        .output()
        .await
        .map_err(|e| Error::driver(format!("{context}: {e}")))?;
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    let reason = stderr.lines().last().unwrap_or("unknown failure").trim();
    warn!(context, reason, "helm command failed");
    Err(Error::driver(format!("{context}: {reason}")))
}

fn is_release_missing(message: &str) -> bool {
    let message = message.to_lowercase();
    message.contains("release") && message.contains("not found")
}

struct GeneratedSecrets {
    mysql_root_password: String,
    mysql_password: String,
    admin_password: String,
}

#[allow(clippy::too_many_arguments)]
fn build_overrides(
    kind: StoreKind,
    host: &str,
    ingress_class: &str,
    ingress_namespace: &str,
    admin_user: &str,
    admin_email: &str,
    secrets: &GeneratedSecrets,
    storage_class: &str,
    plugins: &[String],
) -> serde_json::Value {
    let mut overrides = json!({
        "kind": kind,
        "ingress": {
            "enabled": true,
            "className": ingress_class,
            "hosts": [{
                "host": host,
                "paths": [{"path": "/", "pathType": "Prefix"}],
            }],
        },
        "admin": {
            "username": admin_user,
            "email": admin_email,
        },
        "secrets": {
            "mysqlRootPassword": secrets.mysql_root_password,
            "mysqlPassword": secrets.mysql_password,
            "wpAdminPassword": secrets.admin_password,
        },
        "wordpress": {"persistence": {"storageClass": storage_class}},
        "mysql": {"persistence": {"storageClass": storage_class}},
    });
    if !ingress_namespace.is_empty() {
        overrides["networkPolicy"] = json!({
            "allowIngressFromNamespace": ingress_namespace,
        });
    }
    if !plugins.is_empty() {
        overrides["wpcli"] = json!({
            "autoInstallPlugins": true,
            "plugins": plugins.join(","),
        });
    }
    overrides
}
