//! GCP / GKE Connector
//!
//! Credential precedence: inline service-account JSON (base64 in
//! `GCP_CREDENTIALS_JSON`), a service-account file
//! (`GOOGLE_APPLICATION_CREDENTIALS`), then Application Default Credentials.
//! The same OAuth2 token provider authorizes the GKE REST call and is asked
//! again for a fresh access token when the session is built.

use super::http::{self, with_timeout};
use super::session::{ClusterConnector, CredentialSource, ProviderAdapter};
use super::types::{CaMaterial, ClusterDescriptor, ErrorClass, ProbeError, ProbeSummary, Provider};
use crate::config::{EnvSource, ProbeOptions};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use gcp_auth::{CustomServiceAccount, TokenProvider};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub const GCP_DEFAULT_ZONE: &str = "us-central1";
pub const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

const CONTAINER_ENDPOINT: &str = "https://container.googleapis.com";
const STORAGE_ENDPOINT: &str = "https://storage.googleapis.com";
const MIN_PROJECT_ID_LEN: usize = 6;
const READY_STATUS: &str = "RUNNING";

// ============================================================================
// Configuration
// ============================================================================

/// Reject project IDs that are empty, contain whitespace, or are too short
pub fn validate_project_id(project_id: &str) -> Result<(), ProbeError> {
    if project_id.is_empty() {
        return Err(ProbeError::config("project ID is required"));
    }
    if project_id.chars().any(char::is_whitespace) || project_id.len() < MIN_PROJECT_ID_LEN {
        return Err(ProbeError::config(format!("invalid project ID format: {}", project_id)));
    }
    Ok(())
}

/// Decode `GCP_CREDENTIALS_JSON`: base64 text whose payload must be a JSON object
pub fn decode_credentials_json(encoded: &str) -> Result<Vec<u8>, ProbeError> {
    let json = STANDARD
        .decode(encoded.trim())
        .map_err(|e| ProbeError::config(format!("failed to decode GCP_CREDENTIALS_JSON: {}", e)))?;

    serde_json::from_slice::<serde_json::Map<String, serde_json::Value>>(&json)
        .map_err(|e| ProbeError::config(format!("invalid JSON in GCP_CREDENTIALS_JSON: {}", e)))?;

    Ok(json)
}

/// GCP credential inputs
#[derive(Clone)]
pub struct GcpCredentialConfig {
    pub project_id: String,
    pub zone: String,
    /// Decoded service-account JSON
    pub credentials_json: Option<Vec<u8>>,
    pub credentials_path: Option<PathBuf>,
    /// Prove the credential with a storage listing before returning it
    pub validate: bool,
    pub timeout: Duration,
    pub storage_endpoint: String,
}

impl GcpCredentialConfig {
    pub fn from_env(env: &dyn EnvSource, options: &ProbeOptions) -> Result<Self, ProbeError> {
        let project_id = env.value("GOOGLE_CLOUD_PROJECT").ok_or_else(|| {
            ProbeError::config("GOOGLE_CLOUD_PROJECT environment variable must be set")
        })?;

        let zone = env.value("GKE_ZONE").unwrap_or_else(|| {
            info!("GKE_ZONE not set, defaulting to {}", GCP_DEFAULT_ZONE);
            GCP_DEFAULT_ZONE.to_string()
        });

        let credentials_json = env
            .value("GCP_CREDENTIALS_JSON")
            .map(|encoded| decode_credentials_json(&encoded))
            .transpose()?;

        Ok(Self {
            project_id,
            zone,
            credentials_json,
            credentials_path: env.value("GOOGLE_APPLICATION_CREDENTIALS").map(PathBuf::from),
            validate: options.validate_gcp_credentials,
            timeout: options.timeout,
            storage_endpoint: STORAGE_ENDPOINT.to_string(),
        })
    }
}

impl fmt::Debug for GcpCredentialConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GcpCredentialConfig")
            .field("project_id", &self.project_id)
            .field("zone", &self.zone)
            .field("credentials_json", &self.credentials_json.as_ref().map(|_| "<set>"))
            .field("credentials_path", &self.credentials_path)
            .field("validate", &self.validate)
            .finish()
    }
}

/// Target GKE cluster
#[derive(Debug, Clone)]
pub struct GkeClusterConfig {
    pub cluster_name: String,
    pub credentials: GcpCredentialConfig,
}

impl GkeClusterConfig {
    pub fn from_env(env: &dyn EnvSource, options: &ProbeOptions) -> Result<Self, ProbeError> {
        let cluster_name = env.require("GKE_CLUSTER_NAME")?;
        Ok(Self {
            cluster_name,
            credentials: GcpCredentialConfig::from_env(env, options)?,
        })
    }
}

// ============================================================================
// Credential resolution
// ============================================================================

pub enum GcpCredentialSource {
    InlineJson(Vec<u8>),
    File(PathBuf),
    ApplicationDefault,
}

enum TokenSource {
    Provider(Arc<dyn TokenProvider>),
    #[cfg(test)]
    Fixed(String),
}

/// Resolved GCP credential: an OAuth2 token provider bound to a project
pub struct GcpCredential {
    tokens: TokenSource,
    project_id: String,
    zone: String,
}

impl GcpCredential {
    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn zone(&self) -> &str {
        &self.zone
    }

    /// Fetch a cloud-platform access token; failures are reported as `class`
    pub async fn access_token(&self, stage: &'static str, class: ErrorClass) -> Result<String, ProbeError> {
        match &self.tokens {
            TokenSource::Provider(provider) => {
                let token = provider
                    .token(&[CLOUD_PLATFORM_SCOPE])
                    .await
                    .map_err(|e| class.at(stage, e))?;
                Ok(token.as_str().to_string())
            }
            #[cfg(test)]
            TokenSource::Fixed(token) => Ok(token.clone()),
        }
    }

    #[cfg(test)]
    pub(crate) fn fixed(token: &str, project_id: &str, zone: &str) -> Self {
        Self {
            tokens: TokenSource::Fixed(token.to_string()),
            project_id: project_id.to_string(),
            zone: zone.to_string(),
        }
    }
}

impl fmt::Debug for GcpCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GcpCredential")
            .field("project_id", &self.project_id)
            .field("zone", &self.zone)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl CredentialSource for GcpCredentialSource {
    type Config = GcpCredentialConfig;
    type Credential = GcpCredential;

    fn select(config: &GcpCredentialConfig) -> Self {
        if let Some(json) = &config.credentials_json {
            GcpCredentialSource::InlineJson(json.clone())
        } else if let Some(path) = &config.credentials_path {
            GcpCredentialSource::File(path.clone())
        } else {
            GcpCredentialSource::ApplicationDefault
        }
    }

    fn describe(&self) -> &'static str {
        match self {
            GcpCredentialSource::InlineJson(_) => "inline service account JSON",
            GcpCredentialSource::File(_) => "service account file",
            GcpCredentialSource::ApplicationDefault => "application default credentials",
        }
    }

    async fn resolve(&self, config: &GcpCredentialConfig) -> Result<GcpCredential, ProbeError> {
        validate_project_id(&config.project_id)?;

        let provider: Arc<dyn TokenProvider> = match self {
            GcpCredentialSource::InlineJson(json) => {
                let text = std::str::from_utf8(json).map_err(|e| ProbeError::credential("load service account JSON", e))?;
                let account =
                    CustomServiceAccount::from_json(text).map_err(|e| ProbeError::credential("load service account JSON", e))?;
                Arc::new(account)
            }
            GcpCredentialSource::File(path) => {
                let account =
                    CustomServiceAccount::from_file(path).map_err(|e| ProbeError::credential("load service account file", e))?;
                Arc::new(account)
            }
            GcpCredentialSource::ApplicationDefault => {
                with_timeout("discover application default credentials", config.timeout, async {
                    gcp_auth::provider()
                        .await
                        .map_err(|e| ProbeError::credential("discover application default credentials", e))
                })
                .await?
            }
        };

        let credential = GcpCredential {
            tokens: TokenSource::Provider(provider),
            project_id: config.project_id.clone(),
            zone: config.zone.clone(),
        };

        if config.validate {
            with_timeout("validate credentials", config.timeout, validate_storage_access(&credential, config)).await?;
            info!("🔑 GCP credentials validated for project {}", config.project_id);
        } else {
            debug!("Skipping GCP credential validation call");
        }

        Ok(credential)
    }
}

/// Prove the credential by listing at most one storage bucket in the project
async fn validate_storage_access(credential: &GcpCredential, config: &GcpCredentialConfig) -> Result<(), ProbeError> {
    const STAGE: &str = "validate credentials";

    let token = credential.access_token(STAGE, ErrorClass::Credential).await?;
    let client = http::build_client(config.timeout).map_err(|e| ProbeError::credential(STAGE, e))?;
    let url = format!("{}/storage/v1/b", config.storage_endpoint.trim_end_matches('/'));

    let _: serde_json::Value = http::send_json(
        client
            .get(url)
            .query(&[("project", config.project_id.as_str()), ("maxResults", "1")])
            .bearer_auth(token),
        STAGE,
        ErrorClass::Credential,
    )
    .await?;

    Ok(())
}

// ============================================================================
// GKE REST types
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GkeCluster {
    name: String,
    #[serde(default)]
    status: String,
    endpoint: Option<String>,
    master_auth: Option<MasterAuth>,
    current_master_version: Option<String>,
    current_node_count: Option<i64>,
    location: Option<String>,
    create_time: Option<String>,
    network: Option<String>,
    subnetwork: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MasterAuth {
    cluster_ca_certificate: Option<String>,
}

impl GkeCluster {
    fn into_descriptor(self) -> ClusterDescriptor {
        ClusterDescriptor::new(self.name, self.status)
            .with_endpoint(self.endpoint.filter(|e| !e.is_empty()).map(|e| format!("https://{}", e)))
            .with_ca_data(self.master_auth.and_then(|auth| auth.cluster_ca_certificate))
            .with_version(self.current_master_version)
            .with_node_count(self.current_node_count)
            .with_created(self.create_time)
            .detail("location", self.location)
            .detail("network", self.network)
            .detail("subnetwork", self.subnetwork)
    }
}

// ============================================================================
// GKE adapter
// ============================================================================

pub struct GkeAdapter {
    cluster_name: String,
    credential: GcpCredential,
    http: reqwest::Client,
    container_endpoint: String,
}

impl GkeAdapter {
    pub fn new(cluster_name: impl Into<String>, credential: GcpCredential, timeout: Duration) -> Result<Self, ProbeError> {
        let http = http::build_client(timeout).map_err(|e| ProbeError::control_plane("create GKE client", e))?;
        Ok(Self {
            cluster_name: cluster_name.into(),
            credential,
            http,
            container_endpoint: CONTAINER_ENDPOINT.to_string(),
        })
    }

    /// Override the Container API base URL
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.container_endpoint = endpoint.into();
        self
    }

    fn cluster_path(&self) -> String {
        format!(
            "projects/{}/locations/{}/clusters/{}",
            self.credential.project_id, self.credential.zone, self.cluster_name
        )
    }
}

#[async_trait]
impl ProviderAdapter for GkeAdapter {
    fn provider(&self) -> Provider {
        Provider::Gcp
    }

    fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    fn identity(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("project".to_string(), self.credential.project_id.clone()),
            ("location".to_string(), self.credential.zone.clone()),
        ])
    }

    async fn fetch_descriptor(&self) -> Result<ClusterDescriptor, ProbeError> {
        const STAGE: &str = "get GKE cluster";

        let token = self.credential.access_token(STAGE, ErrorClass::Credential).await?;
        let path = self.cluster_path();
        debug!(path = %path, "Fetching GKE cluster");

        let url = format!("{}/v1/{}", self.container_endpoint.trim_end_matches('/'), path);
        let cluster: GkeCluster =
            http::send_json(self.http.get(url).bearer_auth(token), STAGE, ErrorClass::ControlPlane).await?;

        Ok(cluster.into_descriptor())
    }

    fn is_ready(&self, descriptor: &ClusterDescriptor) -> bool {
        descriptor.status == READY_STATUS
    }

    async fn obtain_bearer_token(&self, _descriptor: &ClusterDescriptor) -> Result<String, ProbeError> {
        self.credential
            .access_token("obtain GKE access token", ErrorClass::Session)
            .await
    }

    async fn obtain_ca_material(&self, descriptor: &ClusterDescriptor) -> Result<CaMaterial, ProbeError> {
        CaMaterial::decode(descriptor.ca_data.as_deref())
    }
}

// ============================================================================
// Entry point
// ============================================================================

/// Resolve GCP credentials from `env` and probe the configured GKE cluster
pub async fn probe(env: &dyn EnvSource, options: &ProbeOptions) -> Result<ProbeSummary, ProbeError> {
    let config = GkeClusterConfig::from_env(env, options)?;
    info!(
        "🔍 Connecting to GKE cluster '{}' in {}/{}",
        config.cluster_name, config.credentials.project_id, config.credentials.zone
    );

    let source = GcpCredentialSource::select(&config.credentials);
    info!("Using GCP {}", source.describe());
    let credential = source.resolve(&config.credentials).await?;

    let adapter = GkeAdapter::new(config.cluster_name, credential, options.timeout)?;
    ClusterConnector::new(adapter, options).probe().await
}
