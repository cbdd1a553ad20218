//! Azure / AKS Connector
//!
//! Credential precedence: service principal (client ID + secret + tenant),
//! managed identity when `AZURE_USE_MSI=true`, then the Azure CLI login.
//! Cluster metadata and credentials come from the Azure Resource Manager
//! REST API. The API server CA is extracted from the admin kubeconfig,
//! falling back to the user kubeconfig; TLS verification is only disabled
//! when explicitly allowed.

use super::http::{self, with_timeout};
use super::session::{ClusterConnector, CredentialSource, ProviderAdapter};
use super::types::{CaMaterial, ClusterDescriptor, ErrorClass, ProbeError, ProbeSummary, Provider};
use crate::config::{AksAuthMode, EnvSource, ProbeOptions};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

pub const AKS_DEFAULT_CLUSTER_NAME: &str = "my-aks-cluster";
/// Scope of the AKS AAD server application
pub const AKS_SERVER_SCOPE: &str = "6dae42f8-4368-4678-94ff-3960e28e3630/.default";
pub const MANAGEMENT_SCOPE: &str = "https://management.azure.com/.default";

const RESOURCE_MANAGER_ENDPOINT: &str = "https://management.azure.com";
const AUTHORITY_HOST: &str = "https://login.microsoftonline.com";
const IMDS_TOKEN_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";
const IMDS_API_VERSION: &str = "2018-02-01";
const AKS_API_VERSION: &str = "2024-02-01";
const READY_POWER_STATE: &str = "Running";

// ============================================================================
// Configuration
// ============================================================================

/// Azure credential inputs
#[derive(Clone)]
pub struct AzureCredentialConfig {
    pub tenant_id: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub use_msi: bool,
    pub timeout: Duration,
    pub authority_host: String,
    pub imds_endpoint: String,
}

impl AzureCredentialConfig {
    pub fn from_env(env: &dyn EnvSource, timeout: Duration) -> Self {
        Self {
            tenant_id: env.value("AZURE_TENANT_ID"),
            client_id: env.value("AZURE_CLIENT_ID"),
            client_secret: env.value("AZURE_CLIENT_SECRET"),
            use_msi: env.flag("AZURE_USE_MSI"),
            timeout,
            authority_host: env
                .value("AZURE_AUTHORITY_HOST")
                .unwrap_or_else(|| AUTHORITY_HOST.to_string()),
            imds_endpoint: IMDS_TOKEN_ENDPOINT.to_string(),
        }
    }
}

impl fmt::Debug for AzureCredentialConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AzureCredentialConfig")
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "<set>"))
            .field("use_msi", &self.use_msi)
            .finish()
    }
}

/// Target AKS cluster
#[derive(Debug, Clone)]
pub struct AksClusterConfig {
    pub cluster_name: String,
    pub resource_group: String,
    pub subscription_id: String,
    pub auth_mode: AksAuthMode,
    pub allow_insecure_tls: bool,
    pub credentials: AzureCredentialConfig,
}

impl AksClusterConfig {
    pub fn from_env(env: &dyn EnvSource, options: &ProbeOptions) -> Result<Self, ProbeError> {
        let cluster_name = env.value("AKS_CLUSTER_NAME").unwrap_or_else(|| {
            info!("AKS_CLUSTER_NAME not set, defaulting to {}", AKS_DEFAULT_CLUSTER_NAME);
            AKS_DEFAULT_CLUSTER_NAME.to_string()
        });

        let resource_group = env
            .value("AZURE_RESOURCE_GROUP")
            .ok_or_else(|| ProbeError::config("AZURE_RESOURCE_GROUP environment variable must be set"))?;
        let subscription_id = env
            .value("AZURE_SUBSCRIPTION_ID")
            .ok_or_else(|| ProbeError::config("AZURE_SUBSCRIPTION_ID environment variable must be set"))?;

        Ok(Self {
            cluster_name,
            resource_group,
            subscription_id,
            auth_mode: options.aks_auth_mode,
            allow_insecure_tls: options.allow_insecure_aks,
            credentials: AzureCredentialConfig::from_env(env, options.timeout),
        })
    }
}

// ============================================================================
// Credential resolution
// ============================================================================

#[derive(Clone)]
pub enum AzureCredentialSource {
    ServicePrincipal {
        tenant_id: String,
        client_id: String,
        client_secret: String,
    },
    ManagedIdentity {
        client_id: Option<String>,
    },
    AzureCli,
}

#[derive(Debug, Deserialize)]
struct OAuthToken {
    access_token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CliToken {
    access_token: String,
}

/// Resolved Azure credential, able to mint tokens for any scope
pub struct AzureCredential {
    source: AzureCredentialSource,
    http: reqwest::Client,
    authority_host: String,
    imds_endpoint: String,
}

impl AzureCredential {
    /// Fetch an access token for `scope`; failures are reported as `class`
    pub async fn access_token(&self, scope: &str, stage: &'static str, class: ErrorClass) -> Result<String, ProbeError> {
        match &self.source {
            AzureCredentialSource::ServicePrincipal {
                tenant_id,
                client_id,
                client_secret,
            } => {
                let url = format!(
                    "{}/{}/oauth2/v2.0/token",
                    self.authority_host.trim_end_matches('/'),
                    tenant_id
                );
                let params = [
                    ("grant_type", "client_credentials"),
                    ("client_id", client_id.as_str()),
                    ("client_secret", client_secret.as_str()),
                    ("scope", scope),
                ];
                let token: OAuthToken = http::send_json(self.http.post(url).form(&params), stage, class).await?;
                Ok(token.access_token)
            }
            AzureCredentialSource::ManagedIdentity { client_id } => {
                // IMDS takes a resource URI rather than a v2 scope
                let resource = scope.trim_end_matches("/.default");
                let mut query = vec![("api-version", IMDS_API_VERSION), ("resource", resource)];
                if let Some(client_id) = client_id {
                    query.push(("client_id", client_id.as_str()));
                }
                let request = self
                    .http
                    .get(&self.imds_endpoint)
                    .query(&query)
                    .header("Metadata", "true");
                let token: OAuthToken = http::send_json(request, stage, class).await?;
                Ok(token.access_token)
            }
            AzureCredentialSource::AzureCli => {
                let output = cli_token_command("az", scope)
                    .output()
                    .await
                    .map_err(|e| class.at(stage, format!("failed to run az CLI: {}", e)))?;

                if !output.status.success() {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    return Err(class.at(stage, format!("az account get-access-token failed: {}", stderr.trim())));
                }

                let token: CliToken = serde_json::from_slice(&output.stdout)
                    .map_err(|e| class.at(stage, format!("invalid az CLI output: {}", e)))?;
                Ok(token.access_token)
            }
        }
    }
}

/// `az account get-access-token`; the child is killed if the caller gives up on it
fn cli_token_command(program: &str, scope: &str) -> Command {
    let mut command = Command::new(program);
    command
        .args(["account", "get-access-token", "--scope", scope, "--output", "json"])
        .kill_on_drop(true);
    command
}

#[async_trait]
impl CredentialSource for AzureCredentialSource {
    type Config = AzureCredentialConfig;
    type Credential = AzureCredential;

    fn select(config: &AzureCredentialConfig) -> Self {
        match (&config.tenant_id, &config.client_id, &config.client_secret) {
            (Some(tenant_id), Some(client_id), Some(client_secret)) => AzureCredentialSource::ServicePrincipal {
                tenant_id: tenant_id.clone(),
                client_id: client_id.clone(),
                client_secret: client_secret.clone(),
            },
            _ if config.use_msi => AzureCredentialSource::ManagedIdentity {
                client_id: config.client_id.clone(),
            },
            _ => AzureCredentialSource::AzureCli,
        }
    }

    fn describe(&self) -> &'static str {
        match self {
            AzureCredentialSource::ServicePrincipal { .. } => "service principal",
            AzureCredentialSource::ManagedIdentity { .. } => "managed identity",
            AzureCredentialSource::AzureCli => "Azure CLI login",
        }
    }

    /// Construction only; the first authenticated resource-manager call proves the credential
    async fn resolve(&self, config: &AzureCredentialConfig) -> Result<AzureCredential, ProbeError> {
        let http = http::build_client(config.timeout).map_err(|e| ProbeError::credential("create Azure credential", e))?;
        Ok(AzureCredential {
            source: self.clone(),
            http,
            authority_host: config.authority_host.clone(),
            imds_endpoint: config.imds_endpoint.clone(),
        })
    }
}

// ============================================================================
// Resource manager types
// ============================================================================

#[derive(Debug, Deserialize)]
struct ManagedCluster {
    name: Option<String>,
    location: Option<String>,
    properties: Option<ManagedClusterProperties>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManagedClusterProperties {
    provisioning_state: Option<String>,
    power_state: Option<PowerState>,
    kubernetes_version: Option<String>,
    fqdn: Option<String>,
    #[serde(default)]
    agent_pool_profiles: Vec<AgentPoolProfile>,
    network_profile: Option<NetworkProfile>,
}

#[derive(Debug, Deserialize)]
struct PowerState {
    code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AgentPoolProfile {
    count: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NetworkProfile {
    network_plugin: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CredentialResults {
    #[serde(default)]
    kubeconfigs: Vec<CredentialResult>,
}

#[derive(Debug, Deserialize)]
struct CredentialResult {
    value: Option<String>,
}

impl ManagedCluster {
    fn into_descriptor(self, requested_name: &str, resource_group: &str) -> ClusterDescriptor {
        let properties = self.properties;
        let status = properties
            .as_ref()
            .and_then(|p| p.power_state.as_ref())
            .and_then(|s| s.code.clone())
            .unwrap_or_else(|| "Unknown".to_string());

        let (fqdn, version, nodes, plugin, provisioning) = match properties {
            Some(p) => {
                let nodes = if p.agent_pool_profiles.is_empty() {
                    None
                } else {
                    Some(p.agent_pool_profiles.iter().filter_map(|pool| pool.count).sum::<i64>())
                };
                (
                    p.fqdn,
                    p.kubernetes_version,
                    nodes,
                    p.network_profile.and_then(|n| n.network_plugin),
                    p.provisioning_state,
                )
            }
            None => (None, None, None, None, None),
        };

        ClusterDescriptor::new(self.name.unwrap_or_else(|| requested_name.to_string()), status)
            .with_endpoint(fqdn.filter(|f| !f.is_empty()).map(|f| format!("https://{}", f)))
            .with_version(version)
            .with_node_count(nodes)
            .detail("resource_group", Some(resource_group))
            .detail("location", self.location)
            .detail("network_plugin", plugin)
            .detail("provisioning_state", provisioning)
    }
}

// ============================================================================
// CA extraction
// ============================================================================

/// Minimal view of a kubeconfig: only the CA fields are read
#[derive(Debug, Deserialize)]
struct KubeconfigClusters {
    #[serde(default)]
    clusters: Vec<NamedClusterEntry>,
}

#[derive(Debug, Deserialize)]
struct NamedClusterEntry {
    cluster: Option<ClusterEntry>,
}

#[derive(Debug, Deserialize)]
struct ClusterEntry {
    #[serde(rename = "certificate-authority-data")]
    certificate_authority_data: Option<String>,
}

/// Source of the cluster's admin and user kubeconfig documents
#[async_trait]
pub trait KubeconfigSource: Send + Sync {
    async fn admin_kubeconfig(&self) -> Result<String, ProbeError>;
    async fn user_kubeconfig(&self) -> Result<String, ProbeError>;
}

/// First non-empty `certificate-authority-data` in the document, decoded
pub fn ca_from_kubeconfig(document: &str) -> Result<Vec<u8>, ProbeError> {
    const STAGE: &str = "extract CA certificate";

    let kubeconfig: KubeconfigClusters =
        serde_yaml::from_str(document).map_err(|e| ProbeError::session(STAGE, format!("invalid kubeconfig: {}", e)))?;

    let data = kubeconfig
        .clusters
        .into_iter()
        .filter_map(|named| named.cluster)
        .filter_map(|cluster| cluster.certificate_authority_data)
        .find(|data| !data.trim().is_empty())
        .ok_or_else(|| ProbeError::session(STAGE, "kubeconfig has no certificate-authority-data"))?;

    STANDARD
        .decode(data.trim())
        .map_err(|e| ProbeError::session(STAGE, format!("invalid certificate-authority-data: {}", e)))
}

/// Extract the CA from the admin kubeconfig, then the user kubeconfig.
///
/// The user kubeconfig is only requested when the admin one yields nothing.
/// With neither available the session is insecure if `allow_insecure`,
/// otherwise construction fails.
pub async fn extract_ca_with_fallback(
    source: &dyn KubeconfigSource,
    cluster_name: &str,
    allow_insecure: bool,
) -> Result<CaMaterial, ProbeError> {
    match source.admin_kubeconfig().await.and_then(|doc| ca_from_kubeconfig(&doc)) {
        Ok(ca) => return Ok(CaMaterial::Verified(ca)),
        Err(e) => debug!(error = %e, "No CA from admin credentials, trying user credentials"),
    }

    match source.user_kubeconfig().await.and_then(|doc| ca_from_kubeconfig(&doc)) {
        Ok(ca) => return Ok(CaMaterial::Verified(ca)),
        Err(e) => debug!(error = %e, "No CA from user credentials"),
    }

    if allow_insecure {
        warn!(
            cluster = %cluster_name,
            "⚠️  No CA certificate found in cluster credentials, continuing without TLS verification"
        );
        Ok(CaMaterial::Insecure)
    } else {
        Err(ProbeError::session(
            "extract CA certificate",
            "no CA certificate found in admin or user credentials; pass --allow-insecure-aks to connect without TLS verification",
        ))
    }
}

// ============================================================================
// AKS adapter
// ============================================================================

pub struct AksAdapter {
    config: AksClusterConfig,
    credential: AzureCredential,
    http: reqwest::Client,
    management_endpoint: String,
}

impl AksAdapter {
    pub fn new(config: AksClusterConfig, credential: AzureCredential, timeout: Duration) -> Result<Self, ProbeError> {
        let http = http::build_client(timeout).map_err(|e| ProbeError::control_plane("create AKS client", e))?;
        Ok(Self {
            config,
            credential,
            http,
            management_endpoint: RESOURCE_MANAGER_ENDPOINT.to_string(),
        })
    }

    /// Override the resource manager base URL
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.management_endpoint = endpoint.into();
        self
    }

    fn cluster_url(&self) -> String {
        format!(
            "{}/subscriptions/{}/resourceGroups/{}/providers/Microsoft.ContainerService/managedClusters/{}",
            self.management_endpoint.trim_end_matches('/'),
            self.config.subscription_id,
            self.config.resource_group,
            self.config.cluster_name
        )
    }

    async fn management_token(&self, stage: &'static str) -> Result<String, ProbeError> {
        self.credential
            .access_token(MANAGEMENT_SCOPE, stage, ErrorClass::Credential)
            .await
    }

    /// POST one of the list*Credential actions and decode the first kubeconfig
    async fn list_credential(&self, action: &str, stage: &'static str) -> Result<String, ProbeError> {
        let token = self.management_token(stage).await?;
        let url = format!("{}/{}", self.cluster_url(), action);

        let results: CredentialResults = http::send_json(
            self.http
                .post(url)
                .query(&[("api-version", AKS_API_VERSION)])
                .bearer_auth(token)
                .header(reqwest::header::CONTENT_LENGTH, "0"),
            stage,
            ErrorClass::ControlPlane,
        )
        .await?;

        let encoded = results
            .kubeconfigs
            .into_iter()
            .find_map(|k| k.value)
            .ok_or_else(|| ProbeError::control_plane(stage, "no kubeconfig returned"))?;

        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| ProbeError::control_plane(stage, format!("invalid kubeconfig encoding: {}", e)))?;

        String::from_utf8(bytes).map_err(|e| ProbeError::control_plane(stage, e))
    }
}

#[async_trait]
impl KubeconfigSource for AksAdapter {
    async fn admin_kubeconfig(&self) -> Result<String, ProbeError> {
        self.list_credential("listClusterAdminCredential", "list cluster admin credentials")
            .await
    }

    async fn user_kubeconfig(&self) -> Result<String, ProbeError> {
        self.list_credential("listClusterUserCredential", "list cluster user credentials")
            .await
    }
}

#[async_trait]
impl ProviderAdapter for AksAdapter {
    fn provider(&self) -> Provider {
        Provider::Azure
    }

    fn cluster_name(&self) -> &str {
        &self.config.cluster_name
    }

    fn identity(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("subscription".to_string(), self.config.subscription_id.clone()),
            ("resource_group".to_string(), self.config.resource_group.clone()),
        ])
    }

    async fn fetch_descriptor(&self) -> Result<ClusterDescriptor, ProbeError> {
        const STAGE: &str = "get AKS cluster";

        let token = self.management_token(STAGE).await?;
        debug!(cluster = %self.config.cluster_name, "Fetching AKS cluster");

        let cluster: ManagedCluster = http::send_json(
            self.http
                .get(self.cluster_url())
                .query(&[("api-version", AKS_API_VERSION)])
                .bearer_auth(token),
            STAGE,
            ErrorClass::ControlPlane,
        )
        .await?;

        Ok(cluster.into_descriptor(&self.config.cluster_name, &self.config.resource_group))
    }

    fn is_ready(&self, descriptor: &ClusterDescriptor) -> bool {
        descriptor.status == READY_POWER_STATE
    }

    async fn obtain_bearer_token(&self, _descriptor: &ClusterDescriptor) -> Result<String, ProbeError> {
        self.credential
            .access_token(AKS_SERVER_SCOPE, "obtain AKS access token", ErrorClass::Session)
            .await
    }

    async fn obtain_ca_material(&self, _descriptor: &ClusterDescriptor) -> Result<CaMaterial, ProbeError> {
        extract_ca_with_fallback(self, &self.config.cluster_name, self.config.allow_insecure_tls).await
    }

    async fn obtain_kubeconfig(&self, _descriptor: &ClusterDescriptor) -> Result<Option<String>, ProbeError> {
        match self.config.auth_mode {
            AksAuthMode::AzureAd => Ok(None),
            AksAuthMode::Kubeconfig => self.admin_kubeconfig().await.map(Some),
        }
    }
}

// ============================================================================
// Entry point
// ============================================================================

/// Resolve Azure credentials from `env` and probe the configured AKS cluster
pub async fn probe(env: &dyn EnvSource, options: &ProbeOptions) -> Result<ProbeSummary, ProbeError> {
    let config = AksClusterConfig::from_env(env, options)?;
    info!(
        "🔍 Connecting to AKS cluster '{}' in resource group {}",
        config.cluster_name, config.resource_group
    );

    let source = AzureCredentialSource::select(&config.credentials);
    info!("Using Azure {}", source.describe());
    let credential = with_timeout(
        "create Azure credential",
        options.timeout,
        source.resolve(&config.credentials),
    )
    .await?;

    let adapter = AksAdapter::new(config, credential, options.timeout)?;
    ClusterConnector::new(adapter, options).probe().await
}
