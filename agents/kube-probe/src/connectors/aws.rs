//! AWS / EKS Connector
//!
//! Credentials come from static keys, a shared profile, or the SDK default
//! chain, in that order of precedence. They are proven with STS
//! GetCallerIdentity before EKS is asked about the cluster. The API server
//! bearer token is a presigned GetCallerIdentity URL, the same scheme
//! aws-iam-authenticator uses.

use super::http::with_timeout;
use super::session::{ClusterConnector, CredentialSource, ProviderAdapter};
use super::types::{CaMaterial, ClusterDescriptor, ProbeError, ProbeSummary, Provider};
use crate::config::{EnvSource, ProbeOptions};
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region, SdkConfig};
use aws_credential_types::provider::ProvideCredentials;
use aws_credential_types::Credentials;
use aws_sdk_eks::error::DisplayErrorContext;
use aws_sigv4::http_request::{sign, SignableBody, SignableRequest, SignatureLocation, SigningSettings};
use aws_sigv4::sign::v4;
use aws_smithy_runtime_api::client::identity::Identity;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, SystemTime};
use tracing::{debug, info};
use url::Url;

pub const AWS_DEFAULT_REGION: &str = "us-east-1";

const TOKEN_PREFIX: &str = "k8s-aws-v1.";
const CLUSTER_ID_HEADER: &str = "x-k8s-aws-id";
const TOKEN_EXPIRY: Duration = Duration::from_secs(60);
const READY_STATUS: &str = "ACTIVE";

// ============================================================================
// Configuration
// ============================================================================

/// AWS credential inputs
#[derive(Clone)]
pub struct AwsCredentialConfig {
    pub region: String,
    pub profile: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub session_token: Option<String>,
    pub timeout: Duration,
}

impl AwsCredentialConfig {
    pub fn from_env(env: &dyn EnvSource, timeout: Duration) -> Self {
        let region = env.value("AWS_REGION").unwrap_or_else(|| {
            info!("AWS_REGION not set, defaulting to {}", AWS_DEFAULT_REGION);
            AWS_DEFAULT_REGION.to_string()
        });

        Self {
            region,
            profile: env.value("AWS_PROFILE"),
            access_key_id: env.value("AWS_ACCESS_KEY_ID"),
            secret_access_key: env.value("AWS_SECRET_ACCESS_KEY"),
            session_token: env.value("AWS_SESSION_TOKEN"),
            timeout,
        }
    }
}

impl fmt::Debug for AwsCredentialConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AwsCredentialConfig")
            .field("region", &self.region)
            .field("profile", &self.profile)
            .field("access_key_id", &self.access_key_id.as_ref().map(|_| "<set>"))
            .field("secret_access_key", &self.secret_access_key.as_ref().map(|_| "<set>"))
            .finish()
    }
}

/// Target EKS cluster
#[derive(Debug, Clone)]
pub struct EksClusterConfig {
    pub cluster_name: String,
    pub credentials: AwsCredentialConfig,
}

impl EksClusterConfig {
    pub fn from_env(env: &dyn EnvSource, options: &ProbeOptions) -> Result<Self, ProbeError> {
        Ok(Self {
            cluster_name: env.require("EKS_CLUSTER_NAME")?,
            credentials: AwsCredentialConfig::from_env(env, options.timeout),
        })
    }
}

// ============================================================================
// Credential resolution
// ============================================================================

pub enum AwsCredentialSource {
    StaticKeys {
        access_key_id: String,
        secret_access_key: String,
        session_token: Option<String>,
    },
    Profile(String),
    DefaultChain,
}

/// Identity returned by STS for the resolved credentials
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallerIdentity {
    pub account: String,
    pub user_id: String,
    pub arn: String,
}

impl CallerIdentity {
    /// All three fields must be present for the identity to count as valid
    pub fn from_parts(account: Option<&str>, user_id: Option<&str>, arn: Option<&str>) -> Result<Self, ProbeError> {
        match (account, user_id, arn) {
            (Some(account), Some(user_id), Some(arn)) => Ok(Self {
                account: account.to_string(),
                user_id: user_id.to_string(),
                arn: arn.to_string(),
            }),
            _ => Err(ProbeError::credential(
                "validate caller identity",
                "incomplete AWS caller identity information",
            )),
        }
    }
}

/// Validated AWS credentials plus the SDK configuration built from them
#[derive(Clone)]
pub struct AwsCredential {
    sdk_config: SdkConfig,
    identity: CallerIdentity,
    region: String,
}

impl AwsCredential {
    pub fn identity(&self) -> &CallerIdentity {
        &self.identity
    }

    pub fn region(&self) -> &str {
        &self.region
    }
}

#[async_trait]
impl CredentialSource for AwsCredentialSource {
    type Config = AwsCredentialConfig;
    type Credential = AwsCredential;

    fn select(config: &AwsCredentialConfig) -> Self {
        match (&config.access_key_id, &config.secret_access_key) {
            (Some(access_key_id), Some(secret_access_key)) => AwsCredentialSource::StaticKeys {
                access_key_id: access_key_id.clone(),
                secret_access_key: secret_access_key.clone(),
                session_token: config.session_token.clone(),
            },
            _ => match &config.profile {
                Some(profile) => AwsCredentialSource::Profile(profile.clone()),
                None => AwsCredentialSource::DefaultChain,
            },
        }
    }

    fn describe(&self) -> &'static str {
        match self {
            AwsCredentialSource::StaticKeys { .. } => "static access keys",
            AwsCredentialSource::Profile(_) => "shared credentials profile",
            AwsCredentialSource::DefaultChain => "default credential chain",
        }
    }

    async fn resolve(&self, config: &AwsCredentialConfig) -> Result<AwsCredential, ProbeError> {
        let loader = aws_config::defaults(BehaviorVersion::latest()).region(Region::new(config.region.clone()));

        let loader = match self {
            AwsCredentialSource::StaticKeys {
                access_key_id,
                secret_access_key,
                session_token,
            } => loader.credentials_provider(Credentials::new(
                access_key_id,
                secret_access_key,
                session_token.clone(),
                None,
                "kube-probe-static",
            )),
            AwsCredentialSource::Profile(profile) => loader.profile_name(profile),
            AwsCredentialSource::DefaultChain => loader,
        };

        let sdk_config = with_timeout("load AWS configuration", config.timeout, async { Ok(loader.load().await) }).await?;

        let identity = with_timeout(
            "validate caller identity",
            config.timeout,
            get_caller_identity(&sdk_config),
        )
        .await?;

        info!(
            "🔑 AWS credentials validated: account={} arn={}",
            identity.account, identity.arn
        );

        Ok(AwsCredential {
            sdk_config,
            identity,
            region: config.region.clone(),
        })
    }
}

async fn get_caller_identity(sdk_config: &SdkConfig) -> Result<CallerIdentity, ProbeError> {
    let sts = aws_sdk_sts::Client::new(sdk_config);
    let output = sts
        .get_caller_identity()
        .send()
        .await
        .map_err(|e| ProbeError::credential("validate caller identity", DisplayErrorContext(&e)))?;

    CallerIdentity::from_parts(output.account(), output.user_id(), output.arn())
}

// ============================================================================
// EKS adapter
// ============================================================================

pub struct EksAdapter {
    cluster_name: String,
    credential: AwsCredential,
    eks: aws_sdk_eks::Client,
}

impl EksAdapter {
    pub fn new(cluster_name: impl Into<String>, credential: AwsCredential) -> Self {
        let eks = aws_sdk_eks::Client::new(&credential.sdk_config);
        Self {
            cluster_name: cluster_name.into(),
            credential,
            eks,
        }
    }
}

#[async_trait]
impl ProviderAdapter for EksAdapter {
    fn provider(&self) -> Provider {
        Provider::Aws
    }

    fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    fn identity(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("account".to_string(), self.credential.identity.account.clone()),
            ("arn".to_string(), self.credential.identity.arn.clone()),
            ("region".to_string(), self.credential.region.clone()),
        ])
    }

    async fn fetch_descriptor(&self) -> Result<ClusterDescriptor, ProbeError> {
        debug!(cluster = %self.cluster_name, "Describing EKS cluster");

        let output = self
            .eks
            .describe_cluster()
            .name(&self.cluster_name)
            .send()
            .await
            .map_err(|e| ProbeError::control_plane("describe EKS cluster", DisplayErrorContext(&e)))?;

        let cluster = output
            .cluster()
            .ok_or_else(|| ProbeError::control_plane("describe EKS cluster", "response contained no cluster"))?;

        Ok(descriptor_from_cluster(&self.cluster_name, cluster))
    }

    fn is_ready(&self, descriptor: &ClusterDescriptor) -> bool {
        descriptor.status == READY_STATUS
    }

    async fn obtain_bearer_token(&self, _descriptor: &ClusterDescriptor) -> Result<String, ProbeError> {
        let provider = self
            .credential
            .sdk_config
            .credentials_provider()
            .ok_or_else(|| ProbeError::session("generate EKS token", "no AWS credentials provider configured"))?;

        let credentials = provider
            .provide_credentials()
            .await
            .map_err(|e| ProbeError::session("generate EKS token", DisplayErrorContext(&e)))?;

        presign_token(&self.cluster_name, &self.credential.region, credentials, SystemTime::now())
    }

    async fn obtain_ca_material(&self, descriptor: &ClusterDescriptor) -> Result<CaMaterial, ProbeError> {
        CaMaterial::decode(descriptor.ca_data.as_deref())
    }
}

fn descriptor_from_cluster(requested_name: &str, cluster: &aws_sdk_eks::types::Cluster) -> ClusterDescriptor {
    let created = cluster
        .created_at()
        .and_then(|t| chrono::DateTime::<chrono::Utc>::from_timestamp(t.secs(), t.subsec_nanos()))
        .map(|t| t.to_rfc3339());

    ClusterDescriptor::new(
        cluster.name().unwrap_or(requested_name),
        cluster.status().map(|s| s.as_str()).unwrap_or("UNKNOWN"),
    )
    .with_endpoint(cluster.endpoint().map(str::to_string))
    .with_ca_data(
        cluster
            .certificate_authority()
            .and_then(|ca| ca.data())
            .map(str::to_string),
    )
    .with_version(cluster.version().map(str::to_string))
    .with_created(created)
    .detail("platform_version", cluster.platform_version())
    .detail("arn", cluster.arn())
}

/// Build an EKS bearer token: a presigned STS GetCallerIdentity URL bound to
/// the cluster name through the signed `x-k8s-aws-id` header.
pub fn presign_token(
    cluster_name: &str,
    region: &str,
    credentials: Credentials,
    time: SystemTime,
) -> Result<String, ProbeError> {
    const STAGE: &str = "presign EKS token";

    let identity: Identity = credentials.into();

    let mut settings = SigningSettings::default();
    settings.signature_location = SignatureLocation::QueryParams;
    settings.expires_in = Some(TOKEN_EXPIRY);

    let params = v4::SigningParams::builder()
        .identity(&identity)
        .region(region)
        .name("sts")
        .time(time)
        .settings(settings)
        .build()
        .map_err(|e| ProbeError::session(STAGE, e))?
        .into();

    let base = format!(
        "https://sts.{}.amazonaws.com/?Action=GetCallerIdentity&Version=2011-06-15",
        region
    );

    let signable = SignableRequest::new(
        "GET",
        &base,
        [(CLUSTER_ID_HEADER, cluster_name)].into_iter(),
        SignableBody::Bytes(&[]),
    )
    .map_err(|e| ProbeError::session(STAGE, e))?;

    let (instructions, _signature) = sign(signable, &params)
        .map_err(|e| ProbeError::session(STAGE, e))?
        .into_parts();

    let mut url = Url::parse(&base).map_err(|e| ProbeError::session(STAGE, e))?;
    {
        let mut query = url.query_pairs_mut();
        for (name, value) in instructions.params() {
            query.append_pair(name, value);
        }
    }

    Ok(format!("{}{}", TOKEN_PREFIX, URL_SAFE_NO_PAD.encode(url.as_str())))
}

// ============================================================================
// Entry point
// ============================================================================

/// Resolve AWS credentials from `env` and probe the configured EKS cluster
pub async fn probe(env: &dyn EnvSource, options: &ProbeOptions) -> Result<ProbeSummary, ProbeError> {
    let config = EksClusterConfig::from_env(env, options)?;
    info!(
        "🔍 Connecting to EKS cluster '{}' in {}",
        config.cluster_name, config.credentials.region
    );

    let source = AwsCredentialSource::select(&config.credentials);
    info!("Using AWS {}", source.describe());
    let credential = source.resolve(&config.credentials).await?;

    let connector = ClusterConnector::new(EksAdapter::new(config.cluster_name, credential), options);
    connector.probe().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::session::tests::TEST_CA_PEM;
    use aws_credential_types::provider::SharedCredentialsProvider;
    use base64::engine::general_purpose::STANDARD;
    use std::collections::HashMap;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn test_credentials() -> Credentials {
        Credentials::new("AKIDEXAMPLE", "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY", None, None, "test")
    }

    fn test_adapter(endpoint: &str, cluster_name: &str) -> EksAdapter {
        let sdk_config = SdkConfig::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new("us-east-1"))
            .credentials_provider(SharedCredentialsProvider::new(test_credentials()))
            .endpoint_url(endpoint)
            .build();

        EksAdapter::new(
            cluster_name,
            AwsCredential {
                sdk_config,
                identity: CallerIdentity {
                    account: "123456789012".to_string(),
                    user_id: "AIDAEXAMPLE".to_string(),
                    arn: "arn:aws:iam::123456789012:user/probe".to_string(),
                },
                region: "us-east-1".to_string(),
            },
        )
    }

    async fn mock_cluster(server: &MockServer, cluster: serde_json::Value) {
        Mock::given(method("GET"))
            .and(path("/clusters/demo"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "application/json")
                    .set_body_json(serde_json::json!({ "cluster": cluster })),
            )
            .mount(server)
            .await;
    }

    #[test]
    fn test_static_keys_win_over_profile() {
        let config = AwsCredentialConfig::from_env(
            &env(&[
                ("AWS_ACCESS_KEY_ID", "AKIDEXAMPLE"),
                ("AWS_SECRET_ACCESS_KEY", "secret"),
                ("AWS_PROFILE", "dev"),
            ]),
            Duration::from_secs(30),
        );

        assert!(matches!(
            AwsCredentialSource::select(&config),
            AwsCredentialSource::StaticKeys { .. }
        ));
    }

    #[test]
    fn test_partial_keys_fall_back_to_profile() {
        let config = AwsCredentialConfig::from_env(
            &env(&[("AWS_ACCESS_KEY_ID", "AKIDEXAMPLE"), ("AWS_PROFILE", "dev")]),
            Duration::from_secs(30),
        );

        match AwsCredentialSource::select(&config) {
            AwsCredentialSource::Profile(profile) => assert_eq!(profile, "dev"),
            _ => panic!("expected profile source"),
        }
    }

    #[test]
    fn test_default_chain_when_nothing_set() {
        let config = AwsCredentialConfig::from_env(&env(&[]), Duration::from_secs(30));
        assert_eq!(config.region, AWS_DEFAULT_REGION);
        assert!(matches!(
            AwsCredentialSource::select(&config),
            AwsCredentialSource::DefaultChain
        ));
    }

    #[test]
    fn test_cluster_name_required() {
        let err = EksClusterConfig::from_env(&env(&[("AWS_REGION", "eu-west-1")]), &ProbeOptions::default()).unwrap_err();
        assert!(matches!(err, ProbeError::Configuration(_)));
        assert!(err.to_string().contains("EKS_CLUSTER_NAME"));
    }

    #[test]
    fn test_incomplete_caller_identity_rejected() {
        let err = CallerIdentity::from_parts(Some("123456789012"), None, Some("arn:aws:iam::123456789012:root")).unwrap_err();
        assert!(matches!(err, ProbeError::CredentialResolution { .. }));

        let identity = CallerIdentity::from_parts(Some("1"), Some("2"), Some("3")).unwrap();
        assert_eq!(identity.account, "1");
    }

    #[test]
    fn test_presigned_token_shape() {
        let token = presign_token("demo", "us-west-2", test_credentials(), SystemTime::UNIX_EPOCH).unwrap();
        assert!(token.starts_with(TOKEN_PREFIX));

        let url = String::from_utf8(URL_SAFE_NO_PAD.decode(&token[TOKEN_PREFIX.len()..]).unwrap()).unwrap();
        assert!(url.starts_with("https://sts.us-west-2.amazonaws.com/?Action=GetCallerIdentity&Version=2011-06-15"));
        assert!(url.contains("X-Amz-Signature="));
        assert!(url.contains("X-Amz-Expires=60"));
        assert!(url.contains("x-k8s-aws-id"));
        assert!(!url.contains("wJalrXUtnFEMI"));
    }

    #[test]
    fn test_presigned_token_is_bound_to_cluster() {
        let time = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let a = presign_token("alpha", "us-east-1", test_credentials(), time).unwrap();
        let b = presign_token("beta", "us-east-1", test_credentials(), time).unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_creating_cluster_is_not_ready() {
        let server = MockServer::start().await;
        mock_cluster(
            &server,
            serde_json::json!({ "name": "demo", "status": "CREATING" }),
        )
        .await;

        let connector = ClusterConnector::new(test_adapter(&server.uri(), "demo"), &ProbeOptions::default());
        let err = connector.connect().await.unwrap_err();

        match err {
            ProbeError::ClusterNotReady { status, .. } => assert_eq!(status, "CREATING"),
            other => panic!("expected ClusterNotReady, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_malformed_ca_is_session_error() {
        let server = MockServer::start().await;
        mock_cluster(
            &server,
            serde_json::json!({
                "name": "demo",
                "status": "ACTIVE",
                "endpoint": "https://ABC.gr7.us-east-1.eks.amazonaws.com",
                "certificateAuthority": { "data": "%%%not-base64%%%" }
            }),
        )
        .await;

        let connector = ClusterConnector::new(test_adapter(&server.uri(), "demo"), &ProbeOptions::default());
        let err = connector.connect().await.unwrap_err();
        assert!(matches!(err, ProbeError::SessionConstruction { .. }));
    }

    #[tokio::test]
    async fn test_active_cluster_descriptor_and_session() {
        let server = MockServer::start().await;
        mock_cluster(
            &server,
            serde_json::json!({
                "name": "demo",
                "arn": "arn:aws:eks:us-east-1:123456789012:cluster/demo",
                "status": "ACTIVE",
                "version": "1.29",
                "platformVersion": "eks.7",
                "endpoint": "https://ABC.gr7.us-east-1.eks.amazonaws.com",
                "createdAt": 1700000000,
                "certificateAuthority": { "data": STANDARD.encode(TEST_CA_PEM) }
            }),
        )
        .await;

        let adapter = test_adapter(&server.uri(), "demo");
        let descriptor = adapter.fetch_descriptor().await.unwrap();
        assert_eq!(descriptor.version.as_deref(), Some("1.29"));
        assert_eq!(descriptor.created.as_deref(), Some("2023-11-14T22:13:20+00:00"));
        assert_eq!(
            descriptor.details.get("platform_version").map(String::as_str),
            Some("eks.7")
        );

        let session = ClusterConnector::new(adapter, &ProbeOptions::default())
            .connect()
            .await
            .unwrap();
        assert_eq!(session.endpoint, "https://ABC.gr7.us-east-1.eks.amazonaws.com");
        assert!(!session.is_insecure());
    }
}
