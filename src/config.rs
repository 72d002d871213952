//! CLI configuration and argument parsing.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use serde_json::{Map, Value};
use uuid::Uuid;

use nodeup::{UpgradeOptions, UpgradeRequest};
use nodeup::api::ContainerService;
use nodeup::upgrade::template::check_template;
use nodeup::upgrade::{DEFAULT_AGENT_PARALLELISM, VersionGate};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const COMMIT: &str = env!("BUILD_COMMIT");
pub const BUILD_DATE: &str = env!("BUILD_DATE");

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

/// In-place node upgrade for Kubernetes clusters on Azure VMs.
///
/// Replaces every master and the selected agent pools' VMs with VMs
/// deployed from the rendered template at the target version.
#[derive(Parser, Debug, Clone)]
#[command(name = "nodeup")]
#[command(about = "In-place node upgrade for Kubernetes clusters on Azure VMs")]
#[command(version = const_format::formatcp!(
    "{} (commit: {}, build date: {})",
    VERSION, COMMIT, BUILD_DATE
))]
pub struct Args {
    /// Azure subscription ID
    #[arg(long, env = "AZURE_SUBSCRIPTION_ID")]
    pub subscription_id: Uuid,

    /// ARM access token (defaults to `az account get-access-token`)
    #[arg(long, env = "AZURE_ACCESS_TOKEN", hide_env_values = true, hide = true)]
    pub access_token: Option<String>,

    /// Resource group containing the cluster VMs
    #[arg(short = 'g', long)]
    pub resource_group: String,

    /// Cluster api model (JSON)
    #[arg(long, value_name = "FILE")]
    pub api_model: PathBuf,

    /// Rendered ARM template used to redeploy nodes
    #[arg(long, value_name = "FILE")]
    pub template: PathBuf,

    /// ARM template parameters
    #[arg(long, value_name = "FILE")]
    pub parameters: PathBuf,

    /// Cluster name suffix (defaults to the `nameSuffix` template parameter)
    #[arg(long)]
    pub name_suffix: Option<String>,

    /// Agent pool to upgrade (repeatable; masters are always upgraded)
    #[arg(long = "agent-pool", value_name = "NAME")]
    pub agent_pools: Vec<String>,

    /// Target Kubernetes version (overrides the api model)
    #[arg(long)]
    pub upgrade_version: Option<String>,

    /// Tool version recorded on redeployed nodes
    #[arg(long, default_value = VERSION)]
    pub engine_version: String,

    /// Kubeconfig for the drain hook (defaults to the standard discovery)
    #[arg(long, value_name = "FILE")]
    pub kubeconfig: Option<PathBuf>,

    /// Cordon and drain nodes before deletion and wait for Ready after provisioning
    #[arg(long, default_value = "false")]
    pub drain: bool,

    /// Maximum agent nodes replaced concurrently
    #[arg(long, default_value_t = DEFAULT_AGENT_PARALLELISM)]
    pub max_parallel: usize,

    /// Maximum minor versions a single upgrade may skip forward
    #[arg(long, default_value_t = VersionGate::DEFAULT_MAX_MINOR_SKEW)]
    pub max_minor_skew: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "NODEUP_LOG_LEVEL")]
    pub log_level: String,

    /// Log output format
    #[arg(long, value_enum, default_value = "text")]
    pub log_format: LogFormat,
}

/// Application configuration derived from CLI args and the files they name.
#[derive(Debug, Clone)]
pub struct Config {
    pub subscription_id: Uuid,
    pub access_token: Option<String>,
    pub resource_group: String,
    pub cluster: ContainerService,
    pub template: Value,
    pub parameters: Map<String, Value>,
    pub name_suffix: String,
    pub agent_pools: Vec<String>,
    pub engine_version: String,
    pub kubeconfig: Option<PathBuf>,
    pub options: UpgradeOptions,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Config {
    /// Create config from CLI arguments, loading the api model, template
    /// and parameters files.
    pub fn from_args(args: Args) -> Result<Self> {
        let mut cluster = load_api_model(&args.api_model)?;
        if let Some(version) = args.upgrade_version {
            cluster = cluster.with_orchestrator_version(version);
        }

        let template = read_json(&args.template)?;
        check_template(&template)
            .with_context(|| format!("Unusable template {}", args.template.display()))?;
        let parameters = load_parameters(&args.parameters)?;

        let name_suffix = match args.name_suffix {
            Some(suffix) => suffix,
            None => parameter_string(&parameters, "nameSuffix")
                .context("--name-suffix not given and the parameters have no nameSuffix")?,
        };
        if name_suffix.is_empty() || !name_suffix.bytes().all(|b| b.is_ascii_alphanumeric()) {
            bail!("Name suffix must be non-empty and ASCII alphanumeric, got {name_suffix:?}");
        }

        Ok(Self {
            subscription_id: args.subscription_id,
            access_token: args.access_token,
            resource_group: args.resource_group,
            cluster,
            template,
            parameters,
            name_suffix,
            agent_pools: args.agent_pools,
            engine_version: args.engine_version,
            kubeconfig: args.kubeconfig,
            options: UpgradeOptions {
                drain: args.drain,
                max_parallel: args.max_parallel.max(1),
                max_minor_skew: args.max_minor_skew,
            },
            log_level: args.log_level,
            log_format: args.log_format,
        })
    }

    pub fn build_request(&self) -> UpgradeRequest {
        let request = UpgradeRequest::new(
            self.subscription_id,
            &self.resource_group,
            self.cluster.clone(),
            &self.name_suffix,
            &self.agent_pools,
            &self.engine_version,
        )
        .with_template(self.template.clone(), self.parameters.clone());

        match &self.kubeconfig {
            Some(path) => request.with_kube_config(path),
            None => request,
        }
    }
}

fn read_json(path: &Path) -> Result<Value> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Invalid JSON in {}", path.display()))
}

fn load_api_model(path: &Path) -> Result<ContainerService> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read api model {}", path.display()))?;
    ContainerService::from_json(&content)
        .with_context(|| format!("Invalid api model {}", path.display()))
}

/// Accepts a bare parameter map or a full deployment parameters file
/// with a top-level `parameters` object.
fn load_parameters(path: &Path) -> Result<Map<String, Value>> {
    match read_json(path)? {
        Value::Object(mut doc) => match doc.remove("parameters") {
            Some(Value::Object(inner)) => Ok(inner),
            Some(_) => bail!("`parameters` in {} is not an object", path.display()),
            None => Ok(doc),
        },
        _ => bail!("Parameters file {} is not a JSON object", path.display()),
    }
}

/// Reads `{"name": {"value": "..."}}` or a bare `{"name": "..."}`.
fn parameter_string(parameters: &Map<String, Value>, name: &str) -> Option<String> {
    let value = parameters.get(name)?;
    value
        .get("value")
        .unwrap_or(value)
        .as_str()
        .map(ToString::to_string)
}
