//! Errors returned by the Azure Resource Manager collaborator.

use std::fmt;

use thiserror::Error;

/// A cloud operation the upgrade core can ask the collaborator to perform.
///
/// The display form is the operation's literal name so that every error
/// message can be mapped back to a concrete resource action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    ListVirtualMachines,
    GetVirtualMachine,
    DeleteVirtualMachine,
    DeleteNetworkInterface,
    DeleteManagedDisk,
    GetStorageClient,
    DeleteBlob,
    ListRoleAssignmentsForPrincipal,
    DeleteRoleAssignmentByID,
    DeployTemplate,
}

impl Operation {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ListVirtualMachines => "ListVirtualMachines",
            Self::GetVirtualMachine => "GetVirtualMachine",
            Self::DeleteVirtualMachine => "DeleteVirtualMachine",
            Self::DeleteNetworkInterface => "DeleteNetworkInterface",
            Self::DeleteManagedDisk => "DeleteManagedDisk",
            Self::GetStorageClient => "GetStorageClient",
            Self::DeleteBlob => "DeleteBlob",
            Self::ListRoleAssignmentsForPrincipal => "ListRoleAssignmentsForPrincipal",
            Self::DeleteRoleAssignmentByID => "DeleteRoleAssignmentByID",
            Self::DeployTemplate => "DeployTemplate",
        }
    }

    /// Returns true if the operation changes cloud state.
    pub const fn is_mutation(self) -> bool {
        matches!(
            self,
            Self::DeleteVirtualMachine
                | Self::DeleteNetworkInterface
                | Self::DeleteManagedDisk
                | Self::DeleteBlob
                | Self::DeleteRoleAssignmentByID
                | Self::DeployTemplate
        )
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur while talking to ARM.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ArmError {
    #[error("{0} failed")]
    Failed(Operation),

    #[error("{operation} failed: Azure credentials error: {message}")]
    Credentials {
        operation: Operation,
        message: String,
    },

    #[error("{operation} failed: resource not found: {message}")]
    NotFound {
        operation: Operation,
        message: String,
    },

    #[error("{operation} failed: [{status}] {code}: {message}")]
    Api {
        operation: Operation,
        status: u16,
        code: String,
        message: String,
    },

    #[error("{operation} failed: {message}")]
    Transport {
        operation: Operation,
        message: String,
    },

    #[error("{operation} failed: unexpected state: {message}")]
    UnexpectedState {
        operation: Operation,
        message: String,
    },
}

impl ArmError {
    /// Build an error from a non-success ARM response.
    ///
    /// Looks at the HTTP status and the `error.code` of the ARM error body
    /// to pick a more specific variant.
    pub fn from_response(operation: Operation, status: u16, body: &str) -> Self {
        let (code, message) = extract_error_details(body);
        let code_lower = code.to_lowercase();

        if status == 401
            || status == 403
            || code_lower.contains("authorizationfailed")
            || code_lower.contains("invalidauthenticationtoken")
            || code_lower.contains("expiredauthenticationtoken")
            || code_lower.contains("authenticationfailed")
        {
            return Self::Credentials { operation, message };
        }

        if status == 404
            || code_lower == "notfound"
            || code_lower.ends_with("notfound")
        {
            return Self::NotFound { operation, message };
        }

        Self::Api {
            operation,
            status,
            code,
            message,
        }
    }

    /// Wrap a transport-level failure (connection, TLS, decoding).
    pub fn transport<E: fmt::Display>(operation: Operation, err: E) -> Self {
        Self::Transport {
            operation,
            message: err.to_string(),
        }
    }

    pub const fn operation(&self) -> Operation {
        match self {
            Self::Failed(operation)
            | Self::Credentials { operation, .. }
            | Self::NotFound { operation, .. }
            | Self::Api { operation, .. }
            | Self::Transport { operation, .. }
            | Self::UnexpectedState { operation, .. } => *operation,
        }
    }

    /// Returns true if ARM reported that the resource does not exist.
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Pull `error.code` and `error.message` out of an ARM error body.
/// Returns single-line strings.
fn extract_error_details(body: &str) -> (String, String) {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        let error = value.get("error").unwrap_or(&value);
        let code = error
            .get("code")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("Unknown")
            .to_string();
        if let Some(message) = error.get("message").and_then(serde_json::Value::as_str) {
            return (code, first_line(message));
        }
        return (code, "ARM request failed".to_string());
    }

    let trimmed = body.trim();
    if trimmed.is_empty() {
        ("Unknown".to_string(), "ARM request failed".to_string())
    } else {
        ("Unknown".to_string(), first_line(trimmed))
    }
}

fn first_line(s: &str) -> String {
    s.lines().next().unwrap_or_default().trim().to_string()
}
