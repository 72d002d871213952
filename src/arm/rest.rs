//! ARM REST client backed by reqwest.
//!
//! Authenticates with bearer tokens (Azure CLI by default), follows
//! `nextLink` pagination and waits for long-running operations through the
//! `Azure-AsyncOperation` or `Location` headers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::header::{HeaderMap, LOCATION};
use reqwest::{RequestBuilder, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::client::{ArmClient, StorageClient};
use super::error::{ArmError, Operation};
use super::types::{RoleAssignment, VirtualMachine};

pub const MANAGEMENT_ENDPOINT: &str = "https://management.azure.com";
const MANAGEMENT_RESOURCE: &str = "https://management.azure.com/";
const STORAGE_RESOURCE: &str = "https://storage.azure.com/";

const COMPUTE_API_VERSION: &str = "2023-09-01";
const NETWORK_API_VERSION: &str = "2023-09-01";
const RESOURCES_API_VERSION: &str = "2021-04-01";
const AUTHORIZATION_API_VERSION: &str = "2022-04-01";
const BLOB_SERVICE_VERSION: &str = "2021-08-06";

const ASYNC_OPERATION_HEADER: &str = "azure-asyncoperation";
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Tokens are refreshed this long before they expire.
const TOKEN_REFRESH_MARGIN_SECS: i64 = 300;

#[derive(Error, Debug)]
pub enum TokenError {
    #[error("Failed to execute 'az account get-access-token'. Is the Azure CLI installed? {0}")]
    Command(String),

    #[error("az account get-access-token failed: {0}")]
    Cli(String),

    #[error("Invalid access token response: {0}")]
    Parse(String),
}

/// Supplies bearer tokens for an AAD resource.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn token(&self, resource: &str) -> Result<SecretString, TokenError>;
}

/// A fixed token, e.g. from `AZURE_ACCESS_TOKEN`.
pub struct StaticTokenSource(SecretString);

impl StaticTokenSource {
    pub fn new(token: impl Into<String>) -> Self {
        Self(SecretString::from(token.into()))
    }
}

#[async_trait]
impl TokenSource for StaticTokenSource {
    async fn token(&self, _resource: &str) -> Result<SecretString, TokenError> {
        Ok(self.0.clone())
    }
}

struct CachedToken {
    token: SecretString,
    expires_at: DateTime<Utc>,
}

/// Tokens from `az account get-access-token`, cached per resource.
#[derive(Default)]
pub struct AzureCliTokenSource {
    cache: Mutex<HashMap<String, CachedToken>>,
}

impl AzureCliTokenSource {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenSource for AzureCliTokenSource {
    async fn token(&self, resource: &str) -> Result<SecretString, TokenError> {
        let mut cache = self.cache.lock().await;
        let now = Utc::now();

        if let Some(cached) = cache.get(resource)
            && (cached.expires_at - now).num_seconds() > TOKEN_REFRESH_MARGIN_SECS
        {
            return Ok(cached.token.clone());
        }

        debug!("Running: az account get-access-token --resource {}", resource);
        let output = tokio::process::Command::new("az")
            .args([
                "account",
                "get-access-token",
                "--resource",
                resource,
                "--output",
                "json",
            ])
            .output()
            .await
            .map_err(|e| TokenError::Command(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TokenError::Cli(stderr.trim().to_string()));
        }

        let cached = parse_cli_token(&output.stdout, now)?;
        let token = cached.token.clone();
        cache.insert(resource.to_string(), cached);
        Ok(token)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CliToken {
    access_token: String,
    #[serde(default, rename = "expires_on")]
    expires_on: Option<i64>,
}

fn parse_cli_token(stdout: &[u8], now: DateTime<Utc>) -> Result<CachedToken, TokenError> {
    let parsed: CliToken =
        serde_json::from_slice(stdout).map_err(|e| TokenError::Parse(e.to_string()))?;
    if parsed.access_token.is_empty() {
        return Err(TokenError::Parse("empty accessToken".to_string()));
    }

    // Older CLI releases only report a local-time `expiresOn`.
    let expires_at = parsed
        .expires_on
        .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
        .unwrap_or_else(|| now + chrono::Duration::seconds(TOKEN_REFRESH_MARGIN_SECS * 2));

    Ok(CachedToken {
        token: SecretString::from(parsed.access_token),
        expires_at,
    })
}

#[derive(Deserialize)]
struct Page<T> {
    #[serde(default = "Vec::new")]
    value: Vec<T>,
    #[serde(default, rename = "nextLink")]
    next_link: Option<String>,
}

/// ARM client for one subscription.
pub struct ArmRestClient {
    http: reqwest::Client,
    endpoint: String,
    blob_endpoint: Option<String>,
    subscription_id: String,
    tokens: Arc<dyn TokenSource>,
    poll_interval: Duration,
    operation_timeout: Duration,
}

impl ArmRestClient {
    pub fn new(
        subscription_id: impl Into<String>,
        tokens: Arc<dyn TokenSource>,
    ) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            http,
            endpoint: MANAGEMENT_ENDPOINT.to_string(),
            blob_endpoint: None,
            subscription_id: subscription_id.into(),
            tokens,
            poll_interval: DEFAULT_POLL_INTERVAL,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
        })
    }

    /// Point the client at a different management endpoint (sovereign clouds, tests).
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into().trim_end_matches('/').to_string();
        self
    }

    /// Serve every storage account from one blob endpoint instead of
    /// `https://<account>.blob.core.windows.net`.
    #[must_use]
    pub fn with_blob_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.blob_endpoint = Some(endpoint.into().trim_end_matches('/').to_string());
        self
    }

    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    #[must_use]
    pub const fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    fn resource_group_url(&self, resource_group: &str, path: &str, api_version: &str) -> String {
        format!(
            "{}/subscriptions/{}/resourceGroups/{}{}?api-version={}",
            self.endpoint, self.subscription_id, resource_group, path, api_version
        )
    }

    async fn bearer(&self, operation: Operation, resource: &str) -> Result<SecretString, ArmError> {
        self.tokens
            .token(resource)
            .await
            .map_err(|e| ArmError::Credentials {
                operation,
                message: e.to_string(),
            })
    }

    /// Send an authenticated request and turn non-success statuses into errors.
    async fn send(
        &self,
        operation: Operation,
        request: RequestBuilder,
    ) -> Result<Response, ArmError> {
        let token = self.bearer(operation, MANAGEMENT_RESOURCE).await?;
        let response = request
            .bearer_auth(token.expose_secret())
            .send()
            .await
            .map_err(|e| ArmError::transport(operation, e))?;

        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        debug!(operation = %operation, status, body = %body, "ARM returned error response");
        Err(ArmError::from_response(operation, status, &body))
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        operation: Operation,
        url: &str,
    ) -> Result<T, ArmError> {
        let response = self.send(operation, self.http.get(url)).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| ArmError::transport(operation, e))
    }

    async fn list_pages<T: DeserializeOwned>(
        &self,
        operation: Operation,
        request: RequestBuilder,
    ) -> Result<Vec<T>, ArmError> {
        let response = self.send(operation, request).await?;
        let mut page: Page<T> = response
            .json()
            .await
            .map_err(|e| ArmError::transport(operation, e))?;

        let mut items = std::mem::take(&mut page.value);
        while let Some(next) = page.next_link.take() {
            page = self.get_json(operation, &next).await?;
            items.append(&mut page.value);
        }
        Ok(items)
    }

    /// Issue a mutating request and block until ARM reports a terminal state.
    async fn send_and_wait(
        &self,
        operation: Operation,
        request: RequestBuilder,
    ) -> Result<(), ArmError> {
        let response = self.send(operation, request).await?;
        let accepted = matches!(
            response.status(),
            StatusCode::ACCEPTED | StatusCode::CREATED
        );

        match monitor_url(response.headers()) {
            Some(Monitor::AsyncOperation(url)) => self.poll_async_operation(operation, &url).await,
            Some(Monitor::Location(url)) if accepted => self.poll_location(operation, &url).await,
            None if response.status() == StatusCode::ACCEPTED => Err(ArmError::UnexpectedState {
                operation,
                message: "accepted without an operation status URL".to_string(),
            }),
            _ => Ok(()),
        }
    }

    async fn poll_async_operation(&self, operation: Operation, url: &str) -> Result<(), ArmError> {
        let deadline = tokio::time::Instant::now() + self.operation_timeout;
        loop {
            tokio::time::sleep(self.poll_interval).await;
            let body: Value = self.get_json(operation, url).await?;
            let state = body
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or("InProgress");
            debug!(operation = %operation, state, "Polled long-running operation");

            match state {
                "Succeeded" => return Ok(()),
                "Failed" | "Canceled" => {
                    let detail = body
                        .pointer("/error/message")
                        .and_then(Value::as_str)
                        .unwrap_or("no error details");
                    return Err(ArmError::UnexpectedState {
                        operation,
                        message: format!("operation {state}: {detail}"),
                    });
                }
                _ => {}
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(timeout_error(operation, self.operation_timeout));
            }
        }
    }

    async fn poll_location(&self, operation: Operation, url: &str) -> Result<(), ArmError> {
        let deadline = tokio::time::Instant::now() + self.operation_timeout;
        loop {
            tokio::time::sleep(self.poll_interval).await;
            let response = self.send(operation, self.http.get(url)).await?;
            if response.status() != StatusCode::ACCEPTED {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(timeout_error(operation, self.operation_timeout));
            }
        }
    }
}

enum Monitor {
    AsyncOperation(String),
    Location(String),
}

fn monitor_url(headers: &HeaderMap) -> Option<Monitor> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    header(ASYNC_OPERATION_HEADER)
        .map(Monitor::AsyncOperation)
        .or_else(|| header(LOCATION.as_str()).map(Monitor::Location))
}

fn timeout_error(operation: Operation, timeout: Duration) -> ArmError {
    ArmError::UnexpectedState {
        operation,
        message: format!("operation did not finish within {}s", timeout.as_secs()),
    }
}

#[async_trait]
impl ArmClient for ArmRestClient {
    async fn list_virtual_machines(
        &self,
        resource_group: &str,
    ) -> Result<Vec<VirtualMachine>, ArmError> {
        let url = self.resource_group_url(
            resource_group,
            "/providers/Microsoft.Compute/virtualMachines",
            COMPUTE_API_VERSION,
        );
        debug!(resource_group, "Listing virtual machines");
        self.list_pages(Operation::ListVirtualMachines, self.http.get(&url))
            .await
    }

    async fn get_virtual_machine(
        &self,
        resource_group: &str,
        name: &str,
    ) -> Result<VirtualMachine, ArmError> {
        let url = self.resource_group_url(
            resource_group,
            &format!("/providers/Microsoft.Compute/virtualMachines/{name}"),
            COMPUTE_API_VERSION,
        );
        self.get_json(Operation::GetVirtualMachine, &url).await
    }

    async fn delete_virtual_machine(
        &self,
        resource_group: &str,
        name: &str,
    ) -> Result<(), ArmError> {
        let url = self.resource_group_url(
            resource_group,
            &format!("/providers/Microsoft.Compute/virtualMachines/{name}"),
            COMPUTE_API_VERSION,
        );
        debug!(resource_group, vm = name, "Deleting virtual machine");
        self.send_and_wait(Operation::DeleteVirtualMachine, self.http.delete(&url))
            .await
    }

    async fn delete_network_interface(
        &self,
        resource_group: &str,
        name: &str,
    ) -> Result<(), ArmError> {
        let url = self.resource_group_url(
            resource_group,
            &format!("/providers/Microsoft.Network/networkInterfaces/{name}"),
            NETWORK_API_VERSION,
        );
        debug!(resource_group, nic = name, "Deleting network interface");
        self.send_and_wait(Operation::DeleteNetworkInterface, self.http.delete(&url))
            .await
    }

    async fn delete_managed_disk(&self, resource_group: &str, name: &str) -> Result<(), ArmError> {
        let url = self.resource_group_url(
            resource_group,
            &format!("/providers/Microsoft.Compute/disks/{name}"),
            COMPUTE_API_VERSION,
        );
        debug!(resource_group, disk = name, "Deleting managed disk");
        self.send_and_wait(Operation::DeleteManagedDisk, self.http.delete(&url))
            .await
    }

    async fn get_storage_client(
        &self,
        _resource_group: &str,
        account: &str,
    ) -> Result<Box<dyn StorageClient>, ArmError> {
        let token = self
            .bearer(Operation::GetStorageClient, STORAGE_RESOURCE)
            .await?;
        let base_url = self
            .blob_endpoint
            .clone()
            .unwrap_or_else(|| format!("https://{account}.blob.core.windows.net"));

        Ok(Box::new(BlobStorageClient {
            http: self.http.clone(),
            base_url,
            token,
        }))
    }

    async fn list_role_assignments_for_principal(
        &self,
        scope: &str,
        principal_id: &str,
    ) -> Result<Vec<RoleAssignment>, ArmError> {
        let url = format!(
            "{}{}/providers/Microsoft.Authorization/roleAssignments?api-version={}",
            self.endpoint, scope, AUTHORIZATION_API_VERSION
        );
        let filter = format!("principalId eq '{principal_id}'");
        self.list_pages(
            Operation::ListRoleAssignmentsForPrincipal,
            self.http.get(&url).query(&[("$filter", filter.as_str())]),
        )
        .await
    }

    async fn delete_role_assignment_by_id(
        &self,
        role_assignment_id: &str,
    ) -> Result<(), ArmError> {
        let url = format!(
            "{}{}?api-version={}",
            self.endpoint, role_assignment_id, AUTHORIZATION_API_VERSION
        );
        debug!(role_assignment = role_assignment_id, "Deleting role assignment");
        self.send(Operation::DeleteRoleAssignmentByID, self.http.delete(&url))
            .await
            .map(|_| ())
    }

    async fn deploy_template(
        &self,
        resource_group: &str,
        deployment_name: &str,
        template: &Value,
        parameters: &Value,
    ) -> Result<(), ArmError> {
        let url = self.resource_group_url(
            resource_group,
            &format!("/providers/Microsoft.Resources/deployments/{deployment_name}"),
            RESOURCES_API_VERSION,
        );
        let body = json!({
            "properties": {
                "mode": "Incremental",
                "template": template,
                "parameters": parameters,
            }
        });
        debug!(resource_group, deployment = deployment_name, "Deploying template");
        self.send_and_wait(Operation::DeployTemplate, self.http.put(&url).json(&body))
            .await
    }
}

/// Blob data-plane client authenticated with an AAD token.
struct BlobStorageClient {
    http: reqwest::Client,
    base_url: String,
    token: SecretString,
}

#[async_trait]
impl StorageClient for BlobStorageClient {
    async fn delete_blob(&self, container: &str, blob: &str) -> Result<(), ArmError> {
        let url = format!("{}/{container}/{blob}", self.base_url);
        let response = self
            .http
            .delete(&url)
            .bearer_auth(self.token.expose_secret())
            .header("x-ms-version", BLOB_SERVICE_VERSION)
            .header("x-ms-delete-snapshots", "include")
            .send()
            .await
            .map_err(|e| ArmError::transport(Operation::DeleteBlob, e))?;

        if response.status().is_success() {
            return Ok(());
        }

        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        if status == 404 {
            warn!(container, blob, "Blob already absent");
        }
        Err(ArmError::from_response(Operation::DeleteBlob, status, &body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const SUB: &str = "sub-1";

    fn client(server: &MockServer) -> ArmRestClient {
        ArmRestClient::new(SUB, Arc::new(StaticTokenSource::new("t0ken")))
            .unwrap()
            .with_endpoint(server.uri())
            .with_poll_interval(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_list_virtual_machines_follows_next_link() {
        let server = MockServer::start().await;
        let base = "/subscriptions/sub-1/resourceGroups/rg/providers/Microsoft.Compute/virtualMachines";

        Mock::given(method("GET"))
            .and(path(base))
            .and(query_param("api-version", COMPUTE_API_VERSION))
            .and(header("authorization", "Bearer t0ken"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [{"name": "k8s-master-1-0", "tags": {"poolName": "master"}}],
                "nextLink": format!("{}/page2", server.uri()),
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/page2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [{"name": "k8s-agentpool1-1-0"}]
            })))
            .mount(&server)
            .await;

        let vms = client(&server).list_virtual_machines("rg").await.unwrap();
        let names: Vec<&str> = vms.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["k8s-master-1-0", "k8s-agentpool1-1-0"]);
        assert_eq!(vms[0].tag("poolName"), Some("master"));
    }

    #[tokio::test]
    async fn test_forbidden_maps_to_credentials() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403).set_body_json(json!({
                "error": {"code": "AuthorizationFailed", "message": "no access"}
            })))
            .mount(&server)
            .await;

        let err = client(&server)
            .get_virtual_machine("rg", "vm-0")
            .await
            .unwrap_err();
        assert!(matches!(err, ArmError::Credentials { .. }));
        assert_eq!(err.operation(), Operation::GetVirtualMachine);
    }

    #[tokio::test]
    async fn test_delete_polls_location_until_done() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path(
                "/subscriptions/sub-1/resourceGroups/rg/providers/Microsoft.Network/networkInterfaces/nic-0",
            ))
            .respond_with(
                ResponseTemplate::new(202)
                    .insert_header("Location", format!("{}/operations/1", server.uri()).as_str()),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/operations/1"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        client(&server)
            .delete_network_interface("rg", "nic-0")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_deploy_template_reports_failed_operation() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path(
                "/subscriptions/sub-1/resourceGroups/rg/providers/Microsoft.Resources/deployments/agentpool1-1234-0-upgrade",
            ))
            .respond_with(ResponseTemplate::new(201).insert_header(
                "Azure-AsyncOperation",
                format!("{}/asyncops/9", server.uri()).as_str(),
            ))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/asyncops/9"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "Failed",
                "error": {"code": "DeploymentFailed", "message": "quota exceeded"}
            })))
            .mount(&server)
            .await;

        let err = client(&server)
            .deploy_template(
                "rg",
                "agentpool1-1234-0-upgrade",
                &json!({}),
                &json!({}),
            )
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "DeployTemplate failed: unexpected state: operation Failed: quota exceeded"
        );
    }

    #[tokio::test]
    async fn test_role_assignment_filter_and_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("$filter", "principalId eq 'p-1'"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "error": {"code": "PrincipalNotFound", "message": "principal gone"}
            })))
            .mount(&server)
            .await;

        let err = client(&server)
            .list_role_assignments_for_principal("/subscriptions/sub-1/resourceGroups/rg", "p-1")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_blob_delete_uses_storage_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/osdisk/vm-0.vhd"))
            .and(header("x-ms-version", BLOB_SERVICE_VERSION))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let storage = client(&server)
            .with_blob_endpoint(server.uri())
            .get_storage_client("rg", "acct")
            .await
            .unwrap();
        storage.delete_blob("osdisk", "vm-0.vhd").await.unwrap();
    }

    #[test]
    fn test_parse_cli_token() {
        let now = Utc::now();
        let cached = parse_cli_token(
            br#"{"accessToken": "abc", "expiresOn": "2030-01-01 00:00:00.000000", "expires_on": 1893456000, "tokenType": "Bearer"}"#,
            now,
        )
        .unwrap();
        assert_eq!(cached.token.expose_secret(), "abc");
        assert_eq!(cached.expires_at.timestamp(), 1_893_456_000);
    }

    #[test]
    fn test_parse_cli_token_without_epoch() {
        let now = Utc::now();
        let cached = parse_cli_token(br#"{"accessToken": "abc"}"#, now).unwrap();
        assert!(cached.expires_at > now);
        assert!(parse_cli_token(br#"{"accessToken": ""}"#, now).is_err());
        assert!(parse_cli_token(b"not json", now).is_err());
    }
}
