//! Kube Probe Agent
//!
//! Connects to managed Kubernetes clusters on AWS (EKS), GCP (GKE) and
//! Azure (AKS) using the credentials found in the environment, and proves
//! each connection by listing pods.
//!
//! # Usage
//! ```bash
//! # Probe every provider configured in the environment
//! kube-probe
//!
//! # Probe one provider, JSON output
//! kube-probe gke --output json
//!
//! # AKS without a retrievable CA certificate
//! kube-probe aks --allow-insecure-aks
//! ```

use anyhow::{Context, Result};
use clap::builder::BoolishValueParser;
use clap::{Parser, ValueEnum};
use kube_probe::config::{self, AksAuthMode, ProbeOptions, ProcessEnv};
use kube_probe::connectors::{Dispatcher, Provider};
use kube_probe::report;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

// ============================================================
// CLI Definition
// ============================================================

#[derive(Parser)]
#[command(name = "kube-probe")]
#[command(about = "Lornu AI multi-cloud Kubernetes connectivity probe", long_about = None)]
#[command(version)]
struct Cli {
    /// Provider to probe: aws|eks, gcp|gke, azure|aks (auto-detected when omitted)
    provider: Option<String>,

    /// Upper bound in seconds for each external call
    #[arg(long, env = "PROBE_TIMEOUT_SECS", default_value_t = config::DEFAULT_TIMEOUT_SECS)]
    timeout_secs: u64,

    /// Namespace whose pods are listed
    #[arg(long, env = "PROBE_NAMESPACE", default_value = config::DEFAULT_NAMESPACE)]
    namespace: String,

    /// Stop after the first failed provider
    #[arg(long, env = "PROBE_FAIL_FAST", value_parser = BoolishValueParser::new())]
    fail_fast: bool,

    /// Continue without TLS verification when no AKS CA certificate can be found
    #[arg(long, env = "AKS_ALLOW_INSECURE_TLS", value_parser = BoolishValueParser::new())]
    allow_insecure_aks: bool,

    /// Prove GCP credentials with a storage bucket listing first
    #[arg(long, env = "GCP_VALIDATE_CREDENTIALS", value_parser = BoolishValueParser::new())]
    validate_gcp_credentials: bool,

    /// AKS authentication: azure-ad (bearer token) or kubeconfig (admin kubeconfig)
    #[arg(long, env = "AKS_AUTH_MODE", default_value = "azure-ad")]
    aks_auth_mode: String,

    /// Report format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    output: OutputFormat,

    /// Log format
    #[arg(long, value_enum, env = "PROBE_LOG_FORMAT", default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Additional .env file; it may also set the PROBE_* and provider variables above
    #[arg(long)]
    env_file: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

// ============================================================
// Main Entry Point
// ============================================================

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let default_env = config::load_dotenv(None);
    let (cli, env_file) = parse_cli(std::env::args_os()).unwrap_or_else(|e| e.exit());

    init_tracing(cli.verbose, cli.log_format)?;

    config::log_dotenv(None, &default_env);
    if let Some((path, outcome)) = &env_file {
        config::log_dotenv(Some(path), outcome);
    }

    let provider = cli
        .provider
        .as_deref()
        .map(str::parse::<Provider>)
        .transpose()
        .context("Invalid provider argument")?;

    let aks_auth_mode: AksAuthMode = cli.aks_auth_mode.parse().context("Invalid --aks-auth-mode")?;

    let options = ProbeOptions {
        timeout: Duration::from_secs(cli.timeout_secs),
        namespace: cli.namespace,
        fail_fast: cli.fail_fast,
        allow_insecure_aks: cli.allow_insecure_aks,
        validate_gcp_credentials: cli.validate_gcp_credentials,
        aks_auth_mode,
    };

    info!("🚀 Kube probe starting...");

    let dispatcher = Dispatcher::new(Arc::new(ProcessEnv), options);
    let reports = dispatcher.run(provider).await?;

    match cli.output {
        OutputFormat::Text => print!("{}", report::render_text(&reports)),
        OutputFormat::Json => println!("{}", report::render_json(&reports).context("Failed to render report")?),
    }

    let failed = reports.iter().filter(|r| !r.is_success()).count();
    if failed > 0 {
        info!("❌ {} of {} provider(s) failed", failed, reports.len());
        Ok(ExitCode::FAILURE)
    } else {
        info!("✅ All {} provider(s) connected", reports.len());
        Ok(ExitCode::SUCCESS)
    }
}

type EnvFileLoad = (PathBuf, Result<Option<PathBuf>, dotenvy::Error>);

/// Parse the command line. With `--env-file`, the file is loaded and the
/// arguments parsed again so the file can supply option defaults.
fn parse_cli<I, T>(args: I) -> Result<(Cli, Option<EnvFileLoad>), clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let args: Vec<T> = args.into_iter().collect();
    let cli = Cli::try_parse_from(args.clone())?;

    let Some(path) = cli.env_file.clone() else {
        return Ok((cli, None));
    };
    let outcome = config::load_dotenv(Some(&path));
    let cli = Cli::try_parse_from(args)?;
    Ok((cli, Some((path, outcome))))
}

fn init_tracing(verbose: bool, format: LogFormat) -> Result<()> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Json => tracing::subscriber::set_global_default(builder.json().finish())?,
        LogFormat::Text => tracing::subscriber::set_global_default(builder.finish())?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_flags_accept_boolish_values() {
        std::env::set_var("AKS_ALLOW_INSECURE_TLS", "1");
        std::env::set_var("PROBE_FAIL_FAST", "yes");
        std::env::set_var("GCP_VALIDATE_CREDENTIALS", "off");

        let cli = Cli::try_parse_from(["kube-probe", "aks"]).unwrap();
        assert!(cli.allow_insecure_aks);
        assert!(cli.fail_fast);
        assert!(!cli.validate_gcp_credentials);
        assert_eq!(cli.provider.as_deref(), Some("aks"));
    }

    #[test]
    fn test_env_file_supplies_option_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("probe.env");
        std::fs::write(&path, "PROBE_NAMESPACE=from-env-file\nPROBE_TIMEOUT_SECS=7\n").unwrap();
        let path_arg = path.to_str().unwrap();

        let (cli, loaded) = parse_cli(["kube-probe", "--env-file", path_arg]).unwrap();
        assert_eq!(cli.namespace, "from-env-file");
        assert_eq!(cli.timeout_secs, 7);
        let (loaded_path, outcome) = loaded.unwrap();
        assert_eq!(loaded_path, path);
        assert!(outcome.is_ok());

        let (cli, _) = parse_cli(["kube-probe", "--env-file", path_arg, "--namespace", "default"]).unwrap();
        assert_eq!(cli.namespace, "default");
    }
}
