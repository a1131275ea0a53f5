//! HTTP client for the OpenCost allocation API

use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::{AllocationQuery, AllocationResponse, AllocationSource};
use crate::error::ExportError;

/// Default bound on a single allocation query
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(90);

/// Configuration for the allocation client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the cost model API (e.g., "http://opencost.opencost:9003")
    pub base_url: String,
    /// Request timeout
    pub timeout: Duration,
    /// User agent sent with every request
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:9003".to_string(),
            timeout: DEFAULT_FETCH_TIMEOUT,
            user_agent: concat!("opencost-export/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Allocation API client
pub struct AllocationClient {
    client: Client,
    base_url: Url,
    timeout: Duration,
}

impl AllocationClient {
    /// Create a new allocation client
    pub fn new(config: ClientConfig) -> Result<Self, ExportError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent)
            .build()
            .map_err(|e| ExportError::Config(format!("failed to create HTTP client: {}", e)))?;

        let mut base_url = Url::parse(&config.base_url).map_err(|e| {
            ExportError::Config(format!("invalid API URL '{}': {}", config.base_url, e))
        })?;
        // Keep any path prefix (e.g. "/model") when joining "allocation"
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        Ok(Self {
            client,
            base_url,
            timeout: config.timeout,
        })
    }

    /// Create a client with the default timeout
    pub fn with_defaults(base_url: &str) -> Result<Self, ExportError> {
        Self::new(ClientConfig {
            base_url: base_url.to_string(),
            ..ClientConfig::default()
        })
    }

    /// Full request URL for a query
    pub fn allocation_url(&self, query: &AllocationQuery) -> Result<Url, ExportError> {
        let mut url = self
            .base_url
            .join("allocation")
            .map_err(|e| ExportError::Config(format!("invalid allocation path: {}", e)))?;
        url.query_pairs_mut().extend_pairs(query.query_pairs());
        Ok(url)
    }

    fn classify(&self, err: reqwest::Error) -> ExportError {
        if err.is_timeout() {
            ExportError::Timeout {
                operation: "allocation query",
                after: self.timeout,
            }
        } else {
            ExportError::from(err)
        }
    }
}

#[async_trait]
impl AllocationSource for AllocationClient {
    async fn fetch(&self, query: &AllocationQuery) -> Result<AllocationResponse, ExportError> {
        query.validate()?;
        let url = self.allocation_url(query)?;
        debug!(url = %url, "Querying allocation API");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status();
        let body = response.bytes().await.map_err(|e| self.classify(e))?;

        if !status.is_success() {
            // Surface the upstream message when the error body is a proper envelope
            return Err(match AllocationResponse::decode(&body) {
                Ok(envelope) => ExportError::Api {
                    code: if envelope.code == 200 {
                        i64::from(status.as_u16())
                    } else {
                        envelope.code
                    },
                    message: envelope
                        .message
                        .unwrap_or_else(|| status.to_string()),
                },
                Err(_) => ExportError::Transport(format!("allocation API returned HTTP {}", status)),
            });
        }

        AllocationResponse::from_slice(&body)
    }

    fn endpoint(&self) -> String {
        self.base_url.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    #[test]
    fn test_allocation_url_keeps_path_prefix() {
        let client = AllocationClient::with_defaults("http://opencost:9090/model").unwrap();
        let query = AllocationQuery::new("7d", vec!["namespace".into(), "pod".into()]);
        let url = client.allocation_url(&query).unwrap();

        assert_eq!(url.path(), "/model/allocation");
        assert_eq!(
            url.query(),
            Some("window=7d&aggregate=namespace%2Cpod&accumulate=true&includeIdle=false")
        );
    }

    #[test]
    fn test_invalid_base_url() {
        assert!(matches!(
            AllocationClient::with_defaults("not a url"),
            Err(ExportError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_fetch_sends_query_parameters() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/allocation")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("window".into(), "yesterday".into()),
                Matcher::UrlEncoded("aggregate".into(), "namespace".into()),
                Matcher::UrlEncoded("accumulate".into(), "true".into()),
                Matcher::UrlEncoded("includeIdle".into(), "true".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"code":200,"data":[{}]}"#)
            .create_async()
            .await;

        let client = AllocationClient::with_defaults(&server.url()).unwrap();
        let query =
            AllocationQuery::new("yesterday", vec!["namespace".into()]).with_include_idle(true);
        let response = client.fetch(&query).await.unwrap();

        assert_eq!(response.code, 200);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_fetch_surfaces_upstream_message() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/allocation")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"code":500,"message":"internal error"}"#)
            .create_async()
            .await;

        let client = AllocationClient::with_defaults(&server.url()).unwrap();
        let query = AllocationQuery::new("7d", vec!["namespace".into()]);
        let err = client.fetch(&query).await.unwrap_err();

        assert!(matches!(err, ExportError::Api { code: 500, ref message } if message == "internal error"));
    }

    #[tokio::test]
    async fn test_gateway_error_is_transport() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/allocation")
            .match_query(Matcher::Any)
            .with_status(502)
            .with_body("<html>Bad Gateway</html>")
            .create_async()
            .await;

        let client = AllocationClient::with_defaults(&server.url()).unwrap();
        let query = AllocationQuery::new("7d", vec!["namespace".into()]);
        let err = client.fetch(&query).await.unwrap_err();

        assert!(matches!(err, ExportError::Transport(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_fetch_rejects_invalid_query_without_network() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/allocation")
            .match_query(Matcher::Any)
            .expect(0)
            .create_async()
            .await;

        let client = AllocationClient::with_defaults(&server.url()).unwrap();
        let err = client
            .fetch(&AllocationQuery::new("7d", vec![]))
            .await
            .unwrap_err();

        assert!(matches!(err, ExportError::InvalidQuery(_)));
        mock.assert_async().await;
    }
}
