//! kube-probe
//!
//! Resolves cloud credentials for EKS, GKE and AKS, builds an authenticated
//! Kubernetes session for the target cluster and proves it by listing pods.

pub mod config;
pub mod connectors;
pub mod report;

pub use config::{EnvSource, ProbeOptions, ProcessEnv};
pub use connectors::{ConnectorReport, Dispatcher, ProbeError, Provider};
