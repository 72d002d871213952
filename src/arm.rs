//! Azure Resource Manager collaborator.
//!
//! The upgrade core only talks to the cloud through [`ArmClient`].
//! [`ArmRestClient`] is the production implementation and
//! [`MockArmClient`] an in-memory cluster with fault injection.

pub mod client;
pub mod error;
pub mod mock;
pub mod rest;
pub mod types;

pub use client::{ArmClient, StorageClient, resource_group_scope};
pub use error::{ArmError, Operation};
pub use mock::{MockArmClient, MockCall};
pub use rest::{ArmRestClient, AzureCliTokenSource, StaticTokenSource, TokenSource};
pub use types::{OsDisk, RoleAssignment, VirtualMachine};
