//! Control-plane HTTP helpers
//!
//! Shared reqwest client construction, JSON request execution and the
//! timeout wrapper applied around every external call.

use super::types::{ErrorClass, ProbeError};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use std::future::Future;
use std::time::Duration;

pub const USER_AGENT: &str = concat!("kube-probe/", env!("CARGO_PKG_VERSION"));

const MAX_ERROR_BODY: usize = 512;

/// Build an HTTP client whose requests are bounded by `timeout`
pub fn build_client(timeout: Duration) -> reqwest::Result<Client> {
    Client::builder()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .build()
}

/// Run `fut`, failing with a timeout error tagged with `stage` when it
/// takes longer than `timeout`.
pub async fn with_timeout<T, F>(stage: &'static str, timeout: Duration, fut: F) -> Result<T, ProbeError>
where
    F: Future<Output = Result<T, ProbeError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(ProbeError::Timeout { stage, timeout }),
    }
}

/// Send a request and decode its JSON body.
///
/// Transport failures, non-2xx statuses and undecodable bodies are all
/// reported as `class` errors at `stage`.
pub async fn send_json<T>(request: RequestBuilder, stage: &'static str, class: ErrorClass) -> Result<T, ProbeError>
where
    T: DeserializeOwned,
{
    let response = request.send().await.map_err(|e| class.at(stage, e))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(class.at(stage, format!("HTTP {}: {}", status, truncate(&body))));
    }

    response
        .json::<T>()
        .await
        .map_err(|e| class.at(stage, format!("invalid response body: {}", e)))
}

fn truncate(body: &str) -> String {
    let body = body.trim();
    if body.chars().count() <= MAX_ERROR_BODY {
        body.to_string()
    } else {
        let mut short: String = body.chars().take(MAX_ERROR_BODY).collect();
        short.push_str("...");
        short
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Debug, Deserialize)]
    struct Echo {
        value: String,
    }

    #[tokio::test]
    async fn test_with_timeout_expires() {
        let result: Result<(), ProbeError> = with_timeout("slow call", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        match result {
            Err(ProbeError::Timeout { stage, .. }) => assert_eq!(stage, "slow call"),
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_with_timeout_passes_through() {
        let value = with_timeout("fast call", Duration::from_secs(5), async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_send_json_decodes_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/echo"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"value": "ok"})))
            .mount(&server)
            .await;

        let client = build_client(Duration::from_secs(5)).unwrap();
        let echo: Echo = send_json(
            client.get(format!("{}/echo", server.uri())),
            "echo",
            ErrorClass::ControlPlane,
        )
        .await
        .unwrap();

        assert_eq!(echo.value, "ok");
    }

    #[tokio::test]
    async fn test_send_json_maps_status_to_class() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/denied"))
            .respond_with(ResponseTemplate::new(403).set_body_string("forbidden"))
            .mount(&server)
            .await;

        let client = build_client(Duration::from_secs(5)).unwrap();
        let err = send_json::<Echo>(
            client.get(format!("{}/denied", server.uri())),
            "denied call",
            ErrorClass::Credential,
        )
        .await
        .unwrap_err();

        match err {
            ProbeError::CredentialResolution { stage, message } => {
                assert_eq!(stage, "denied call");
                assert!(message.contains("403"));
                assert!(message.contains("forbidden"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_truncate_long_body() {
        let body = "x".repeat(2000);
        let short = truncate(&body);
        assert!(short.ends_with("..."));
        assert_eq!(short.len(), MAX_ERROR_BODY + 3);
    }
}
