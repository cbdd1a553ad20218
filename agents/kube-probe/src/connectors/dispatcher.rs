//! Connector Dispatcher
//!
//! Picks which providers to probe (an explicit choice, or every provider whose
//! environment is configured) and runs them one after another.

use super::types::{ConnectorReport, ProbeError, ProbeSummary, Provider};
use super::{aws, azure, gcp};
use crate::config::{EnvSource, ProbeOptions};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

impl Provider {
    /// Environment variables whose presence marks the provider as configured
    pub fn detection_keys(&self) -> &'static [&'static str] {
        match self {
            Provider::Aws => &["EKS_CLUSTER_NAME"],
            Provider::Gcp => &["GKE_CLUSTER_NAME"],
            Provider::Azure => &["AKS_CLUSTER_NAME", "AZURE_RESOURCE_GROUP"],
        }
    }
}

/// Providers configured in `env`, in dispatch order
pub fn detect_providers(env: &dyn EnvSource) -> Vec<Provider> {
    Provider::ALL
        .into_iter()
        .filter(|provider| provider.detection_keys().iter().any(|key| env.is_set(key)))
        .collect()
}

pub struct Dispatcher {
    env: Arc<dyn EnvSource>,
    options: ProbeOptions,
}

impl Dispatcher {
    pub fn new(env: Arc<dyn EnvSource>, options: ProbeOptions) -> Self {
        Self { env, options }
    }

    /// Providers to run. An explicit choice is never replaced by detection.
    pub fn select(&self, requested: Option<Provider>) -> Result<Vec<Provider>, ProbeError> {
        if let Some(provider) = requested {
            return Ok(vec![provider]);
        }

        let detected = detect_providers(self.env.as_ref());
        if detected.is_empty() {
            return Err(ProbeError::config(
                "no provider configured; set EKS_CLUSTER_NAME, GKE_CLUSTER_NAME or AZURE_RESOURCE_GROUP, or name a provider explicitly",
            ));
        }
        Ok(detected)
    }

    /// Run the selected connectors sequentially.
    ///
    /// Each connector's failure is recorded in its report; only a failed
    /// selection is returned as an error.
    pub async fn run(&self, requested: Option<Provider>) -> Result<Vec<ConnectorReport>, ProbeError> {
        let providers = self.select(requested)?;
        info!(
            "🚀 Probing {} provider(s): {}",
            providers.len(),
            providers.iter().map(Provider::to_string).collect::<Vec<_>>().join(", ")
        );

        let mut reports = Vec::with_capacity(providers.len());
        for provider in providers {
            let report = self.run_one(provider).await;
            let failed = !report.is_success();
            reports.push(report);

            if failed && self.options.fail_fast {
                info!("Stopping after first failure (fail-fast)");
                break;
            }
        }

        Ok(reports)
    }

    pub async fn run_one(&self, provider: Provider) -> ConnectorReport {
        let started = Instant::now();
        let outcome = self.probe(provider).await;
        let elapsed = started.elapsed();

        if let Err(e) = &outcome {
            error!(provider = %provider, kind = e.kind(), "❌ {} probe failed: {}", provider.service_name(), e);
        }

        ConnectorReport {
            provider,
            outcome,
            elapsed,
        }
    }

    async fn probe(&self, provider: Provider) -> Result<ProbeSummary, ProbeError> {
        let env = self.env.as_ref();
        match provider {
            Provider::Aws => aws::probe(env, &self.options).await,
            Provider::Gcp => gcp::probe(env, &self.options).await,
            Provider::Azure => azure::probe(env, &self.options).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> Arc<dyn EnvSource> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Arc::new(map)
    }

    #[test]
    fn test_detection_order() {
        let env = env(&[
            ("AZURE_RESOURCE_GROUP", "rg"),
            ("EKS_CLUSTER_NAME", "eks"),
            ("GKE_CLUSTER_NAME", "gke"),
        ]);
        assert_eq!(
            detect_providers(env.as_ref()),
            vec![Provider::Aws, Provider::Gcp, Provider::Azure]
        );
    }

    #[test]
    fn test_detection_ignores_blank_values() {
        let env = env(&[("EKS_CLUSTER_NAME", " "), ("AKS_CLUSTER_NAME", "aks")]);
        assert_eq!(detect_providers(env.as_ref()), vec![Provider::Azure]);
    }

    #[test]
    fn test_nothing_detected_is_configuration_error() {
        let dispatcher = Dispatcher::new(env(&[]), ProbeOptions::default());
        assert!(matches!(dispatcher.select(None), Err(ProbeError::Configuration(_))));
    }

    #[test]
    fn test_explicit_choice_is_kept() {
        let dispatcher = Dispatcher::new(env(&[("GKE_CLUSTER_NAME", "gke")]), ProbeOptions::default());
        assert_eq!(dispatcher.select(Some(Provider::Aws)).unwrap(), vec![Provider::Aws]);
    }

    #[tokio::test]
    async fn test_explicit_aws_without_environment() {
        let dispatcher = Dispatcher::new(env(&[("GKE_CLUSTER_NAME", "gke")]), ProbeOptions::default());
        let reports = dispatcher.run(Some(Provider::Aws)).await.unwrap();

        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].provider, Provider::Aws);
        match &reports[0].outcome {
            Err(ProbeError::Configuration(message)) => assert!(message.contains("EKS_CLUSTER_NAME")),
            other => panic!("expected configuration error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failures_continue_without_fail_fast() {
        // Both connectors fail on configuration before any network call
        let env = env(&[("GKE_CLUSTER_NAME", "gke"), ("AKS_CLUSTER_NAME", "aks")]);
        let reports = Dispatcher::new(env, ProbeOptions::default()).run(None).await.unwrap();

        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|r| !r.is_success()));
        assert_eq!(reports[0].provider, Provider::Gcp);
        assert_eq!(reports[1].provider, Provider::Azure);
    }

    #[tokio::test]
    async fn test_fail_fast_stops_after_first_failure() {
        let env = env(&[("GKE_CLUSTER_NAME", "gke"), ("AKS_CLUSTER_NAME", "aks")]);
        let options = ProbeOptions {
            fail_fast: true,
            ..ProbeOptions::default()
        };
        let reports = Dispatcher::new(env, options).run(None).await.unwrap();

        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].provider, Provider::Gcp);
    }
}
