//! Cluster Probe Types
//!
//! Data model shared by the provider connectors and the stage-tagged
//! error taxonomy every connector reports through.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use k8s_openapi::api::core::v1::Pod;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Managed Kubernetes provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Aws,
    Gcp,
    Azure,
}

impl Provider {
    /// Every provider, in dispatch order
    pub const ALL: [Provider; 3] = [Provider::Aws, Provider::Gcp, Provider::Azure];

    /// Name of the managed Kubernetes service
    pub fn service_name(&self) -> &'static str {
        match self {
            Provider::Aws => "EKS",
            Provider::Gcp => "GKE",
            Provider::Azure => "AKS",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provider::Aws => write!(f, "aws"),
            Provider::Gcp => write!(f, "gcp"),
            Provider::Azure => write!(f, "azure"),
        }
    }
}

impl FromStr for Provider {
    type Err = ProbeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "aws" | "eks" => Ok(Provider::Aws),
            "gcp" | "gke" | "google" => Ok(Provider::Gcp),
            "azure" | "aks" => Ok(Provider::Azure),
            other => Err(ProbeError::config(format!(
                "unknown provider '{}', expected one of: aws, gcp, azure",
                other
            ))),
        }
    }
}

/// Control-plane metadata about the target cluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterDescriptor {
    /// Cluster name as reported by the provider
    pub name: String,
    /// Raw provider status / power state (e.g. "ACTIVE", "RUNNING", "Running")
    pub status: String,
    /// Kubernetes API endpoint URL
    pub endpoint: Option<String>,
    /// Base64 CA certificate attached to the descriptor, when the provider has one
    #[serde(skip_serializing)]
    pub ca_data: Option<String>,
    /// Kubernetes version
    pub version: Option<String>,
    /// Node count, where the provider reports one
    pub node_count: Option<i64>,
    /// Creation time (RFC 3339 where the provider allows it)
    pub created: Option<String>,
    /// Provider-specific fields (location, network, platform version, ...)
    pub details: BTreeMap<String, String>,
}

impl ClusterDescriptor {
    pub fn new(name: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: status.into(),
            endpoint: None,
            ca_data: None,
            version: None,
            node_count: None,
            created: None,
            details: BTreeMap::new(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: Option<String>) -> Self {
        self.endpoint = endpoint.filter(|e| !e.is_empty());
        self
    }

    pub fn with_ca_data(mut self, ca_data: Option<String>) -> Self {
        self.ca_data = ca_data;
        self
    }

    pub fn with_version(mut self, version: Option<String>) -> Self {
        self.version = version.filter(|v| !v.is_empty());
        self
    }

    pub fn with_node_count(mut self, node_count: Option<i64>) -> Self {
        self.node_count = node_count;
        self
    }

    pub fn with_created(mut self, created: Option<String>) -> Self {
        self.created = created.filter(|c| !c.is_empty());
        self
    }

    /// Add a provider-specific field; empty values are dropped
    pub fn detail(mut self, key: &str, value: Option<impl Into<String>>) -> Self {
        if let Some(value) = value.map(Into::into).filter(|v: &String| !v.is_empty()) {
            self.details.insert(key.to_string(), value);
        }
        self
    }
}

/// Certificate-authority material for the cluster's API server
#[derive(Clone, PartialEq, Eq)]
pub enum CaMaterial {
    /// Decoded CA bytes (PEM) used to verify the server certificate
    Verified(Vec<u8>),
    /// TLS verification disabled (explicit opt-in only)
    Insecure,
}

impl CaMaterial {
    pub fn is_insecure(&self) -> bool {
        matches!(self, CaMaterial::Insecure)
    }

    /// Decode the base64 CA field attached to a cluster descriptor.
    ///
    /// Missing or malformed data is fatal; there is no insecure fallback here.
    pub fn decode(data: Option<&str>) -> Result<Self, ProbeError> {
        let data = data
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .ok_or_else(|| {
                ProbeError::session(
                    "decode certificate authority data",
                    "cluster descriptor carries no certificate authority data",
                )
            })?;

        let bytes = STANDARD
            .decode(data)
            .map_err(|e| ProbeError::session("decode certificate authority data", e))?;

        Ok(CaMaterial::Verified(bytes))
    }
}

impl fmt::Debug for CaMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaMaterial::Verified(bytes) => write!(f, "Verified({} bytes)", bytes.len()),
            CaMaterial::Insecure => write!(f, "Insecure"),
        }
    }
}

/// One record per pod in the probed namespace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodSummary {
    pub name: String,
    pub phase: String,
    pub node: Option<String>,
    pub created: Option<String>,
}

impl From<&Pod> for PodSummary {
    fn from(pod: &Pod) -> Self {
        Self {
            name: pod.metadata.name.clone().unwrap_or_default(),
            phase: pod
                .status
                .as_ref()
                .and_then(|s| s.phase.clone())
                .unwrap_or_else(|| "Unknown".to_string()),
            node: pod.spec.as_ref().and_then(|s| s.node_name.clone()),
            created: pod
                .metadata
                .creation_timestamp
                .as_ref()
                .map(|t| t.0.to_rfc3339()),
        }
    }
}

/// Outcome of a successful connector run
#[derive(Debug, Clone, Serialize)]
pub struct ProbeSummary {
    pub provider: Provider,
    pub cluster_name: String,
    pub endpoint: String,
    /// True when the session was built without TLS verification
    pub insecure_tls: bool,
    /// Provider-side identity (account, project, subscription, ...)
    pub identity: BTreeMap<String, String>,
    /// Cluster information fetched after connecting
    pub cluster: Option<ClusterDescriptor>,
    pub namespace: String,
    /// None when the pod listing failed
    pub pods: Option<Vec<PodSummary>>,
    /// Best-effort calls that failed after the session was established
    pub warnings: Vec<String>,
}

/// Result of running one connector
#[derive(Debug)]
pub struct ConnectorReport {
    pub provider: Provider,
    pub outcome: Result<ProbeSummary, ProbeError>,
    pub elapsed: Duration,
}

impl ConnectorReport {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Errors raised while resolving credentials or building a cluster session
#[derive(Debug, Error)]
pub enum ProbeError {
    /// Required input missing or malformed
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The selected credential source failed to construct or validate
    #[error("credential resolution failed at {stage}: {message}")]
    CredentialResolution { stage: &'static str, message: String },

    /// A provider control-plane request failed
    #[error("control plane request failed at {stage}: {message}")]
    ControlPlane { stage: &'static str, message: String },

    /// Cluster metadata was fetched but the cluster is not running
    #[error("cluster {cluster} is not ready, current status: {status}")]
    ClusterNotReady { cluster: String, status: String },

    /// Token, CA material or Kubernetes client could not be produced
    #[error("session construction failed at {stage}: {message}")]
    SessionConstruction { stage: &'static str, message: String },

    /// A best-effort call after the session was established failed
    #[error("operation failed at {stage}: {message}")]
    Operation { stage: &'static str, message: String },

    /// An external call exceeded its time budget
    #[error("{stage} timed out after {}s", .timeout.as_secs())]
    Timeout { stage: &'static str, timeout: Duration },
}

impl ProbeError {
    pub fn config(message: impl Into<String>) -> Self {
        ProbeError::Configuration(message.into())
    }

    pub fn credential(stage: &'static str, err: impl fmt::Display) -> Self {
        ProbeError::CredentialResolution {
            stage,
            message: err.to_string(),
        }
    }

    pub fn control_plane(stage: &'static str, err: impl fmt::Display) -> Self {
        ProbeError::ControlPlane {
            stage,
            message: err.to_string(),
        }
    }

    pub fn session(stage: &'static str, err: impl fmt::Display) -> Self {
        ProbeError::SessionConstruction {
            stage,
            message: err.to_string(),
        }
    }

    pub fn operation(stage: &'static str, err: impl fmt::Display) -> Self {
        ProbeError::Operation {
            stage,
            message: err.to_string(),
        }
    }

    /// Stable class name, used in structured output
    pub fn kind(&self) -> &'static str {
        match self {
            ProbeError::Configuration(_) => "configuration",
            ProbeError::CredentialResolution { .. } => "credential_resolution",
            ProbeError::ControlPlane { .. } => "control_plane",
            ProbeError::ClusterNotReady { .. } => "cluster_not_ready",
            ProbeError::SessionConstruction { .. } => "session_construction",
            ProbeError::Operation { .. } => "operation",
            ProbeError::Timeout { .. } => "timeout",
        }
    }

    /// Stage at which the error occurred, if it carries one
    pub fn stage(&self) -> Option<&'static str> {
        match self {
            ProbeError::CredentialResolution { stage, .. }
            | ProbeError::ControlPlane { stage, .. }
            | ProbeError::SessionConstruction { stage, .. }
            | ProbeError::Operation { stage, .. }
            | ProbeError::Timeout { stage, .. } => Some(stage),
            ProbeError::Configuration(_) => None,
            ProbeError::ClusterNotReady { .. } => Some("readiness check"),
        }
    }
}

/// Error class a shared helper should report failures as
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Credential,
    ControlPlane,
    Session,
    Operation,
}

impl ErrorClass {
    pub fn at(self, stage: &'static str, err: impl fmt::Display) -> ProbeError {
        match self {
            ErrorClass::Credential => ProbeError::credential(stage, err),
            ErrorClass::ControlPlane => ProbeError::control_plane(stage, err),
            ErrorClass::Session => ProbeError::session(stage, err),
            ErrorClass::Operation => ProbeError::operation(stage, err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PodSpec, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};

    #[test]
    fn test_provider_parsing() {
        assert_eq!("aws".parse::<Provider>().unwrap(), Provider::Aws);
        assert_eq!("EKS".parse::<Provider>().unwrap(), Provider::Aws);
        assert_eq!("gke".parse::<Provider>().unwrap(), Provider::Gcp);
        assert_eq!(" Azure ".parse::<Provider>().unwrap(), Provider::Azure);

        let err = "openstack".parse::<Provider>().unwrap_err();
        assert!(matches!(err, ProbeError::Configuration(_)));
    }

    #[test]
    fn test_provider_display() {
        assert_eq!(Provider::Aws.to_string(), "aws");
        assert_eq!(Provider::Azure.service_name(), "AKS");
    }

    #[test]
    fn test_ca_decode_valid() {
        let encoded = STANDARD.encode("-----BEGIN CERTIFICATE-----\nabc\n-----END CERTIFICATE-----\n");
        let ca = CaMaterial::decode(Some(&encoded)).unwrap();
        match ca {
            CaMaterial::Verified(bytes) => assert!(bytes.starts_with(b"-----BEGIN CERTIFICATE-----")),
            CaMaterial::Insecure => panic!("expected verified CA material"),
        }
    }

    #[test]
    fn test_ca_decode_malformed_is_session_error() {
        let err = CaMaterial::decode(Some("not*base64!")).unwrap_err();
        assert!(matches!(err, ProbeError::SessionConstruction { .. }));
        assert_eq!(err.kind(), "session_construction");
    }

    #[test]
    fn test_ca_decode_missing_is_session_error() {
        assert!(matches!(
            CaMaterial::decode(None),
            Err(ProbeError::SessionConstruction { .. })
        ));
        assert!(matches!(
            CaMaterial::decode(Some("  ")),
            Err(ProbeError::SessionConstruction { .. })
        ));
    }

    #[test]
    fn test_descriptor_drops_empty_fields() {
        let descriptor = ClusterDescriptor::new("demo", "RUNNING")
            .with_endpoint(Some(String::new()))
            .with_version(Some("1.29".to_string()))
            .detail("network", Some(""))
            .detail("location", Some("us-central1"))
            .detail("subnetwork", None::<String>);

        assert_eq!(descriptor.endpoint, None);
        assert_eq!(descriptor.version.as_deref(), Some("1.29"));
        assert_eq!(descriptor.details.len(), 1);
        assert_eq!(
            descriptor.details.get("location").map(String::as_str),
            Some("us-central1")
        );
    }

    #[test]
    fn test_pod_summary_from_pod() {
        let created = chrono::DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z")
            .unwrap()
            .with_timezone(&chrono::Utc);

        let pod = Pod {
            metadata: ObjectMeta {
                name: Some("coredns-5d78c9869d-abcde".to_string()),
                creation_timestamp: Some(Time(created)),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: Some("node-1".to_string()),
                ..Default::default()
            }),
            status: Some(PodStatus {
                phase: Some("Running".to_string()),
                ..Default::default()
            }),
        };

        let summary = PodSummary::from(&pod);
        assert_eq!(summary.name, "coredns-5d78c9869d-abcde");
        assert_eq!(summary.phase, "Running");
        assert_eq!(summary.node.as_deref(), Some("node-1"));
        assert_eq!(summary.created.as_deref(), Some("2024-05-01T10:00:00+00:00"));
    }

    #[test]
    fn test_pod_summary_without_status() {
        let summary = PodSummary::from(&Pod::default());
        assert_eq!(summary.phase, "Unknown");
        assert_eq!(summary.node, None);
    }

    #[test]
    fn test_error_stage_and_kind() {
        let err = ProbeError::ClusterNotReady {
            cluster: "demo".to_string(),
            status: "CREATING".to_string(),
        };
        assert_eq!(err.kind(), "cluster_not_ready");
        assert_eq!(
            err.to_string(),
            "cluster demo is not ready, current status: CREATING"
        );

        let err = ErrorClass::ControlPlane.at("describe EKS cluster", "boom");
        assert_eq!(err.stage(), Some("describe EKS cluster"));

        let err = ProbeError::Timeout {
            stage: "list pods",
            timeout: Duration::from_secs(30),
        };
        assert_eq!(err.to_string(), "list pods timed out after 30s");
    }
}
