//! Per-node ARM deployment name and parameters.

use serde_json::{Map, Value, json};

use super::node::UpgradeContext;
use super::topology::PoolRole;
use crate::error::UpgradeError;

/// ARM rejects deployment names longer than this.
pub const MAX_DEPLOYMENT_NAME_LEN: usize = 64;

/// `<pool>-<suffix>-<slot>-upgrade`, shortening the pool label to fit.
pub fn deployment_name(pool: &str, name_suffix: &str, slot: usize) -> String {
    let tail = format!("-{name_suffix}-{slot}-upgrade");
    let budget = MAX_DEPLOYMENT_NAME_LEN.saturating_sub(tail.len());
    let mut name = format!("{}{tail}", truncate_on_char_boundary(pool, budget));
    let len = truncate_on_char_boundary(&name, MAX_DEPLOYMENT_NAME_LEN).len();
    name.truncate(len);
    name
}

/// Longest prefix of `s` that is at most `max_len` bytes.
fn truncate_on_char_boundary(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        return s;
    }
    let end = (0..=max_len).rev().find(|&i| s.is_char_boundary(i)).unwrap_or(0);
    &s[..end]
}

/// Reject a template that would deploy nothing in place of a deleted VM.
pub fn check_template(template: &Value) -> Result<(), UpgradeError> {
    match template.get("resources").and_then(Value::as_array) {
        Some(resources) if !resources.is_empty() => Ok(()),
        Some(_) => Err(UpgradeError::InvalidTemplate(
            "no resources to deploy".to_string(),
        )),
        None => Err(UpgradeError::InvalidTemplate(
            "missing `resources` array".to_string(),
        )),
    }
}

/// Base parameters overlaid with the values that select one node.
///
/// The pool's offset is the node's slot and its count is `slot + 1`, so the
/// template renders exactly the VM being replaced.
pub fn deployment_parameters(ctx: &UpgradeContext, role: &PoolRole, slot: usize) -> Value {
    let mut parameters: Map<String, Value> = ctx.parameters.clone();
    let mut set = |key: String, value: Value| {
        parameters.insert(key, json!({ "value": value }));
    };

    set("orchestratorVersion".to_string(), json!(ctx.target_version));
    set("nameSuffix".to_string(), json!(ctx.name_suffix));
    set("engineVersion".to_string(), json!(ctx.engine_version));

    let prefix = match role {
        PoolRole::Master => "master".to_string(),
        PoolRole::Agent(pool) => pool.clone(),
    };
    set(format!("{prefix}Offset"), json!(slot));
    set(format!("{prefix}Count"), json!(slot + 1));

    Value::Object(parameters)
}
