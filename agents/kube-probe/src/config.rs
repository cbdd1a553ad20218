//! Probe Configuration
//!
//! Environment access and the run-wide options shared by every connector.
//! Provider-specific inputs are read by each connector from an [`EnvSource`]
//! so tests can supply a plain map instead of mutating the process environment.

use crate::connectors::types::ProbeError;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_NAMESPACE: &str = "kube-system";

/// Read-only view of environment variables
pub trait EnvSource: Send + Sync {
    /// Raw value of `key`
    fn get(&self, key: &str) -> Option<String>;

    /// Trimmed value of `key`; blank values count as unset
    fn value(&self, key: &str) -> Option<String> {
        self.get(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn is_set(&self, key: &str) -> bool {
        self.value(key).is_some()
    }

    fn require(&self, key: &str) -> Result<String, ProbeError> {
        self.value(key)
            .ok_or_else(|| ProbeError::config(format!("{} environment variable is required", key)))
    }

    /// Boolean flag; accepts true/1/yes/on in any case
    fn flag(&self, key: &str) -> bool {
        self.value(key)
            .map(|v| matches!(v.to_ascii_lowercase().as_str(), "true" | "1" | "yes" | "on"))
            .unwrap_or(false)
    }
}

/// The process environment
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

impl EnvSource for HashMap<String, String> {
    fn get(&self, key: &str) -> Option<String> {
        HashMap::get(self, key).cloned()
    }
}

/// Load a `.env` file into the process environment.
///
/// Returns the loaded path, or `None` when there is no such file. Existing
/// variables are never overridden.
pub fn load_dotenv(path: Option<&Path>) -> Result<Option<PathBuf>, dotenvy::Error> {
    let result = match path {
        Some(path) => dotenvy::from_path(path).map(|_| path.to_path_buf()),
        None => dotenvy::dotenv(),
    };

    match result {
        Ok(loaded) => Ok(Some(loaded)),
        Err(e) if e.not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

/// Log what [`load_dotenv`] did; a missing file is only worth a warning when it was asked for
pub fn log_dotenv(requested: Option<&Path>, outcome: &Result<Option<PathBuf>, dotenvy::Error>) {
    match (outcome, requested) {
        (Ok(Some(loaded)), _) => debug!(path = %loaded.display(), "Loaded environment file"),
        (Ok(None), Some(path)) => warn!(path = %path.display(), "Environment file not found"),
        (Ok(None), None) => debug!("No .env file found"),
        (Err(e), _) => warn!(error = %e, "Ignoring unreadable environment file"),
    }
}

/// How the AKS session authenticates to the API server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AksAuthMode {
    /// Azure AD bearer token for the AKS server application
    #[default]
    AzureAd,
    /// Admin kubeconfig fetched from the resource manager
    Kubeconfig,
}

impl FromStr for AksAuthMode {
    type Err = ProbeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "azure-ad" | "azuread" | "aad" | "token" => Ok(AksAuthMode::AzureAd),
            "kubeconfig" | "admin-kubeconfig" => Ok(AksAuthMode::Kubeconfig),
            other => Err(ProbeError::config(format!(
                "unknown AKS auth mode '{}', expected azure-ad or kubeconfig",
                other
            ))),
        }
    }
}

/// Run-wide options
#[derive(Debug, Clone)]
pub struct ProbeOptions {
    /// Upper bound for each external call
    pub timeout: Duration,
    /// Namespace whose pods are listed
    pub namespace: String,
    /// Stop after the first failed connector
    pub fail_fast: bool,
    /// Allow the AKS connector to disable TLS verification when no CA is found
    pub allow_insecure_aks: bool,
    /// Prove GCP credentials with a storage listing before the cluster call
    pub validate_gcp_credentials: bool,
    pub aks_auth_mode: AksAuthMode,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            namespace: DEFAULT_NAMESPACE.to_string(),
            fail_fast: false,
            allow_insecure_aks: false,
            validate_gcp_credentials: false,
            aks_auth_mode: AksAuthMode::AzureAd,
        }
    }
}
