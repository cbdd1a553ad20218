//! Probe report rendering (text table or JSON)

use crate::connectors::types::{ClusterDescriptor, ConnectorReport, ProbeSummary, Provider};
use serde::Serialize;
use std::fmt::Write;

#[derive(Serialize)]
struct ReportRecord<'a> {
    provider: Provider,
    success: bool,
    elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    summary: Option<&'a ProbeSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorRecord>,
}

#[derive(Serialize)]
struct ErrorRecord {
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    stage: Option<&'static str>,
    message: String,
}

/// Render reports as a pretty-printed JSON array
pub fn render_json(reports: &[ConnectorReport]) -> serde_json::Result<String> {
    let records: Vec<ReportRecord<'_>> = reports
        .iter()
        .map(|report| ReportRecord {
            provider: report.provider,
            success: report.is_success(),
            elapsed_ms: report.elapsed.as_millis() as u64,
            summary: report.outcome.as_ref().ok(),
            error: report.outcome.as_ref().err().map(|e| ErrorRecord {
                kind: e.kind(),
                stage: e.stage(),
                message: e.to_string(),
            }),
        })
        .collect();

    serde_json::to_string_pretty(&records)
}

/// Render reports as human-readable text
pub fn render_text(reports: &[ConnectorReport]) -> String {
    let mut out = String::new();

    for report in reports {
        let _ = writeln!(
            out,
            "\n=== {} ({}) ===",
            report.provider.to_string().to_uppercase(),
            report.provider.service_name()
        );

        match &report.outcome {
            Ok(summary) => write_summary(&mut out, summary),
            Err(e) => {
                let _ = writeln!(out, "❌ Failed: {}", e);
            }
        }
        let _ = writeln!(out, "Elapsed: {:.2}s", report.elapsed.as_secs_f64());
    }

    let succeeded = reports.iter().filter(|r| r.is_success()).count();
    let _ = writeln!(
        out,
        "\nSummary: {} succeeded, {} failed",
        succeeded,
        reports.len() - succeeded
    );

    out
}

fn write_summary(out: &mut String, summary: &ProbeSummary) {
    let _ = writeln!(
        out,
        "✅ Connected to cluster '{}' at {}",
        summary.cluster_name, summary.endpoint
    );
    if summary.insecure_tls {
        let _ = writeln!(out, "⚠️  TLS verification disabled");
    }
    for (key, value) in &summary.identity {
        let _ = writeln!(out, "  {}: {}", label(key), value);
    }

    if let Some(cluster) = &summary.cluster {
        write_cluster(out, cluster);
    }

    if let Some(pods) = &summary.pods {
        let _ = writeln!(
            out,
            "\nPods in namespace '{}' ({} total):",
            summary.namespace,
            pods.len()
        );
        let _ = writeln!(out, "{:<48} {:<10} {:<32} {:<25}", "NAME", "PHASE", "NODE", "CREATED");
        let _ = writeln!(out, "{}", "-".repeat(118));
        for pod in pods {
            let _ = writeln!(
                out,
                "{:<48} {:<10} {:<32} {:<25}",
                truncate(&pod.name, 48),
                pod.phase,
                truncate(pod.node.as_deref().unwrap_or("-"), 32),
                pod.created.as_deref().unwrap_or("-")
            );
        }
    }

    for warning in &summary.warnings {
        let _ = writeln!(out, "⚠️  {}", warning);
    }
}

fn write_cluster(out: &mut String, cluster: &ClusterDescriptor) {
    let _ = writeln!(out, "\nCluster Information:");
    let _ = writeln!(out, "  Name: {}", cluster.name);
    let _ = writeln!(out, "  Status: {}", cluster.status);
    if let Some(version) = &cluster.version {
        let _ = writeln!(out, "  Version: {}", version);
    }
    if let Some(endpoint) = &cluster.endpoint {
        let _ = writeln!(out, "  Endpoint: {}", endpoint);
    }
    if let Some(nodes) = cluster.node_count {
        let _ = writeln!(out, "  Nodes: {}", nodes);
    }
    if let Some(created) = &cluster.created {
        let _ = writeln!(out, "  Created: {}", created);
    }
    for (key, value) in &cluster.details {
        let _ = writeln!(out, "  {}: {}", label(key), value);
    }
}

/// "resource_group" -> "Resource Group"
fn label(key: &str) -> String {
    key.split('_')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        let short: String = s.chars().take(max - 3).collect();
        format!("{}...", short)
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::types::{PodSummary, ProbeError};
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn success() -> ConnectorReport {
        ConnectorReport {
            provider: Provider::Gcp,
            outcome: Ok(ProbeSummary {
                provider: Provider::Gcp,
                cluster_name: "demo".to_string(),
                endpoint: "https://34.123.45.67".to_string(),
                insecure_tls: false,
                identity: BTreeMap::from([("project".to_string(), "demo-project".to_string())]),
                cluster: Some(
                    ClusterDescriptor::new("demo", "RUNNING")
                        .with_version(Some("1.29.4".to_string()))
                        .detail("network", Some("default")),
                ),
                namespace: "kube-system".to_string(),
                pods: Some(vec![PodSummary {
                    name: "coredns-abc".to_string(),
                    phase: "Running".to_string(),
                    node: Some("node-1".to_string()),
                    created: None,
                }]),
                warnings: vec![],
            }),
            elapsed: Duration::from_millis(1500),
        }
    }

    fn failure() -> ConnectorReport {
        ConnectorReport {
            provider: Provider::Aws,
            outcome: Err(ProbeError::ClusterNotReady {
                cluster: "eks-demo".to_string(),
                status: "CREATING".to_string(),
            }),
            elapsed: Duration::from_millis(200),
        }
    }

    #[test]
    fn test_render_text() {
        let text = render_text(&[success(), failure()]);

        assert!(text.contains("=== GCP (GKE) ==="));
        assert!(text.contains("Connected to cluster 'demo' at https://34.123.45.67"));
        assert!(text.contains("  Project: demo-project"));
        assert!(text.contains("  Version: 1.29.4"));
        assert!(text.contains("  Network: default"));
        assert!(text.contains("coredns-abc"));
        assert!(text.contains("Pods in namespace 'kube-system' (1 total)"));
        assert!(text.contains("❌ Failed: cluster eks-demo is not ready, current status: CREATING"));
        assert!(text.contains("Summary: 1 succeeded, 1 failed"));
    }

    #[test]
    fn test_render_json() {
        let json = render_json(&[success(), failure()]).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value[0]["provider"], "gcp");
        assert_eq!(value[0]["success"], true);
        assert_eq!(value[0]["elapsed_ms"], 1500);
        assert_eq!(value[0]["summary"]["pods"][0]["name"], "coredns-abc");
        assert!(value[0].get("error").is_none());

        assert_eq!(value[1]["success"], false);
        assert_eq!(value[1]["error"]["kind"], "cluster_not_ready");
        assert_eq!(value[1]["error"]["stage"], "readiness check");
    }

    #[test]
    fn test_label() {
        assert_eq!(label("resource_group"), "Resource Group");
        assert_eq!(label("arn"), "Arn");
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("a-very-long-pod-name", 10), "a-very-...");
    }
}
