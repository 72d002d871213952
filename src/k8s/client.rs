//! Kubernetes client builder from a kubeconfig file.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;

/// Build a Kubernetes client for the cluster being upgraded.
///
/// Reads the given kubeconfig file, or falls back to the default
/// discovery (`KUBECONFIG`, `~/.kube/config`, in-cluster).
pub async fn build_kube_client(kubeconfig: Option<&Path>) -> Result<kube::Client> {
    let client = match kubeconfig {
        Some(path) => {
            debug!("Using kubeconfig: {}", path.display());
            let kubeconfig = kube::config::Kubeconfig::read_from(path)
                .with_context(|| format!("Failed to read kubeconfig {}", path.display()))?;
            let config = kube::Config::from_custom_kubeconfig(
                kubeconfig,
                &kube::config::KubeConfigOptions::default(),
            )
            .await
            .context("Failed to load kubeconfig")?;
            kube::Client::try_from(config).context("Failed to build Kubernetes client")?
        }
        None => {
            debug!("Using default kubeconfig");
            kube::Client::try_default()
                .await
                .context("Failed to build Kubernetes client from default config")?
        }
    };

    Ok(client)
}
