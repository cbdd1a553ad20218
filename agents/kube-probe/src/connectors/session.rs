//! Cluster Session Builder
//!
//! Every provider connects the same way:
//! fetch descriptor -> readiness check -> bearer token -> CA material -> session.
//! Providers plug in through [`ProviderAdapter`]; the sequence itself lives
//! once, in [`ClusterConnector`].

use super::http::with_timeout;
use super::types::{CaMaterial, ClusterDescriptor, PodSummary, ProbeError, ProbeSummary, Provider};
use crate::config::ProbeOptions;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use serde_json::json;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A provider-specific way of producing a validated credential
#[async_trait]
pub trait CredentialSource: Sized + Send + Sync {
    /// Inputs the source is selected from
    type Config: Send + Sync;
    /// Validated credential handed to the provider adapter
    type Credential: Send + Sync;

    /// Choose a source from the configured inputs, first match wins
    fn select(config: &Self::Config) -> Self;

    /// Short name of the source, safe to log
    fn describe(&self) -> &'static str;

    async fn resolve(&self, config: &Self::Config) -> Result<Self::Credential, ProbeError>;
}

/// The provider-specific steps of the connection sequence
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn provider(&self) -> Provider;

    fn cluster_name(&self) -> &str;

    /// Provider-side identity details surfaced in the report
    fn identity(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    async fn fetch_descriptor(&self) -> Result<ClusterDescriptor, ProbeError>;

    fn is_ready(&self, descriptor: &ClusterDescriptor) -> bool;

    async fn obtain_bearer_token(&self, descriptor: &ClusterDescriptor) -> Result<String, ProbeError>;

    async fn obtain_ca_material(&self, descriptor: &ClusterDescriptor) -> Result<CaMaterial, ProbeError>;

    /// A complete kubeconfig to use instead of token + CA, when the
    /// provider is configured to hand one out
    async fn obtain_kubeconfig(&self, _descriptor: &ClusterDescriptor) -> Result<Option<String>, ProbeError> {
        Ok(None)
    }
}

/// How the session authenticates to the API server
#[derive(Clone)]
pub enum SessionAuth {
    Bearer { token: String, ca: CaMaterial },
    Kubeconfig(String),
}

impl fmt::Debug for SessionAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionAuth::Bearer { ca, .. } => f
                .debug_struct("Bearer")
                .field("token", &"<redacted>")
                .field("ca", ca)
                .finish(),
            SessionAuth::Kubeconfig(_) => write!(f, "Kubeconfig(<redacted>)"),
        }
    }
}

/// An authenticated connection to one cluster's API server
pub struct ClusterSession {
    pub provider: Provider,
    pub cluster_name: String,
    pub endpoint: String,
    auth: SessionAuth,
    client: Client,
}

impl ClusterSession {
    /// Build the Kubernetes client for `auth`.
    ///
    /// No request is sent; this only validates the assembled configuration.
    pub async fn establish(
        provider: Provider,
        cluster_name: impl Into<String>,
        endpoint: impl Into<String>,
        auth: SessionAuth,
    ) -> Result<Self, ProbeError> {
        let cluster_name = cluster_name.into();
        let endpoint = endpoint.into();

        let kubeconfig = match &auth {
            SessionAuth::Bearer { token, ca } => bearer_kubeconfig(provider, &cluster_name, &endpoint, token, ca)?,
            SessionAuth::Kubeconfig(document) => {
                Kubeconfig::from_yaml(document).map_err(|e| ProbeError::session("parse kubeconfig", e))?
            }
        };

        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| ProbeError::session("load kubeconfig", e))?;

        let client = Client::try_from(config).map_err(|e| ProbeError::session("create Kubernetes client", e))?;

        Ok(Self {
            provider,
            cluster_name,
            endpoint,
            auth,
            client,
        })
    }

    pub fn auth(&self) -> &SessionAuth {
        &self.auth
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    /// True when the API server certificate is not verified
    pub fn is_insecure(&self) -> bool {
        matches!(&self.auth, SessionAuth::Bearer { ca, .. } if ca.is_insecure())
    }

    /// List pods in `namespace`
    pub async fn list_pods(&self, namespace: &str) -> Result<Vec<PodSummary>, ProbeError> {
        let pods: Api<Pod> = Api::namespaced(self.client(), namespace);
        let list = pods
            .list(&ListParams::default())
            .await
            .map_err(|e| ProbeError::operation("list pods", e))?;

        Ok(list.items.iter().map(PodSummary::from).collect())
    }
}

impl fmt::Debug for ClusterSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterSession")
            .field("provider", &self.provider)
            .field("cluster_name", &self.cluster_name)
            .field("endpoint", &self.endpoint)
            .field("auth", &self.auth)
            .finish()
    }
}

/// Assemble an in-memory kubeconfig for token authentication
fn bearer_kubeconfig(
    provider: Provider,
    cluster_name: &str,
    endpoint: &str,
    token: &str,
    ca: &CaMaterial,
) -> Result<Kubeconfig, ProbeError> {
    let name = format!("{}-{}", provider, cluster_name);

    let mut cluster = json!({ "server": endpoint });
    match ca {
        CaMaterial::Verified(bytes) => {
            cluster["certificate-authority-data"] = json!(STANDARD.encode(bytes));
        }
        CaMaterial::Insecure => {
            cluster["insecure-skip-tls-verify"] = json!(true);
        }
    }

    let document = json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{ "name": name, "cluster": cluster }],
        "users": [{ "name": name, "user": { "token": token } }],
        "contexts": [{ "name": name, "context": { "cluster": name, "user": name } }],
        "current-context": name,
    });

    // JSON is a subset of YAML
    Kubeconfig::from_yaml(&document.to_string()).map_err(|e| ProbeError::session("assemble kubeconfig", e))
}

/// Runs the connection sequence for one provider adapter
pub struct ClusterConnector<A> {
    adapter: A,
    timeout: Duration,
    namespace: String,
}

impl<A: ProviderAdapter> ClusterConnector<A> {
    pub fn new(adapter: A, options: &ProbeOptions) -> Self {
        Self {
            adapter,
            timeout: options.timeout,
            namespace: options.namespace.clone(),
        }
    }

    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    /// Produce an authenticated session, or the first failure
    pub async fn connect(&self) -> Result<ClusterSession, ProbeError> {
        let provider = self.adapter.provider();
        let cluster_name = self.adapter.cluster_name().to_string();

        let descriptor = with_timeout(
            "fetch cluster descriptor",
            self.timeout,
            self.adapter.fetch_descriptor(),
        )
        .await?;

        if !self.adapter.is_ready(&descriptor) {
            return Err(ProbeError::ClusterNotReady {
                cluster: cluster_name,
                status: descriptor.status,
            });
        }
        debug!(cluster = %cluster_name, status = %descriptor.status, "Cluster is ready");

        let endpoint = descriptor
            .endpoint
            .clone()
            .ok_or_else(|| ProbeError::session("resolve API endpoint", "cluster descriptor has no API endpoint"))?;

        if let Some(document) = with_timeout(
            "fetch kubeconfig",
            self.timeout,
            self.adapter.obtain_kubeconfig(&descriptor),
        )
        .await?
        {
            debug!(cluster = %cluster_name, "Using provider-issued kubeconfig");
            return ClusterSession::establish(provider, cluster_name, endpoint, SessionAuth::Kubeconfig(document)).await;
        }

        let token = with_timeout(
            "obtain bearer token",
            self.timeout,
            self.adapter.obtain_bearer_token(&descriptor),
        )
        .await?;

        let ca = with_timeout(
            "obtain CA material",
            self.timeout,
            self.adapter.obtain_ca_material(&descriptor),
        )
        .await?;

        if ca.is_insecure() {
            warn!(
                cluster = %cluster_name,
                "⚠️  TLS verification disabled for this session"
            );
        }

        ClusterSession::establish(provider, cluster_name, endpoint, SessionAuth::Bearer { token, ca }).await
    }

    /// Connect, then run the best-effort cluster-info and pod-listing calls.
    ///
    /// Failures after the session exists are recorded as warnings on the
    /// summary rather than failing the run.
    pub async fn probe(&self) -> Result<ProbeSummary, ProbeError> {
        let provider = self.adapter.provider();
        let session = self.connect().await?;

        info!(
            "✅ Connected to {} cluster '{}' at {}",
            provider.service_name(),
            session.cluster_name,
            session.endpoint
        );

        let mut summary = ProbeSummary {
            provider,
            cluster_name: session.cluster_name.clone(),
            endpoint: session.endpoint.clone(),
            insecure_tls: session.is_insecure(),
            identity: self.adapter.identity(),
            cluster: None,
            namespace: self.namespace.clone(),
            pods: None,
            warnings: Vec::new(),
        };

        match with_timeout("fetch cluster info", self.timeout, self.adapter.fetch_descriptor()).await {
            Ok(descriptor) => summary.cluster = Some(descriptor),
            Err(e) => {
                let e = ProbeError::operation("fetch cluster info", e);
                warn!(error = %e, "Failed to fetch cluster info");
                summary.warnings.push(e.to_string());
            }
        }

        match with_timeout("list pods", self.timeout, session.list_pods(&self.namespace)).await {
            Ok(pods) => {
                info!("📦 Found {} pods in namespace '{}'", pods.len(), self.namespace);
                summary.pods = Some(pods);
            }
            Err(e) => {
                let e = match e {
                    ProbeError::Operation { .. } => e,
                    other => ProbeError::operation("list pods", other),
                };
                warn!(error = %e, "Failed to list pods");
                summary.warnings.push(e.to_string());
            }
        }

        Ok(summary)
    }
}
