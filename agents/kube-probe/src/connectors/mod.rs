//! Cloud Kubernetes Connectors
//!
//! One connector per managed Kubernetes service, all built on the shared
//! session builder:
//! - AWS: EKS via STS-validated credentials and presigned IAM tokens
//! - GCP: GKE via service-account or ADC OAuth2 tokens
//! - Azure: AKS via service principal, managed identity or CLI tokens

pub mod aws;
pub mod azure;
pub mod dispatcher;
pub mod gcp;
pub mod http;
pub mod session;
pub mod types;

pub use dispatcher::{detect_providers, Dispatcher};
pub use session::{ClusterConnector, ClusterSession, CredentialSource, ProviderAdapter, SessionAuth};
pub use types::{
    CaMaterial, ClusterDescriptor, ConnectorReport, PodSummary, ProbeError, ProbeSummary, Provider,
};
