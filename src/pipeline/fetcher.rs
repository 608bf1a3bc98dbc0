//! HTTP fetching with retry

use std::sync::Arc;

use reqwest::{Client, StatusCode, Url};
use thiserror::Error;

use super::retry::RetryPolicy;
use crate::extractors::{DocumentExtractor, ExtractError};

/// Errors raised while fetching one target
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid target URL {target}: {source}")]
    InvalidTarget {
        target: String,
        #[source]
        source: url::ParseError,
    },

    #[error("request to {target} failed: {source}")]
    Transport {
        target: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{target} answered with status {status}")]
    Status { target: String, status: StatusCode },

    #[error("could not extract {target}: {source}")]
    Extract {
        target: String,
        #[source]
        source: ExtractError,
    },

    #[error("giving up on {target} after {attempts} attempts: {last}")]
    Exhausted {
        target: String,
        attempts: u32,
        last: Box<FetchError>,
    },
}

impl FetchError {
    /// Whether another attempt could succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. } | Self::Status { .. } | Self::Extract { .. } => true,
            Self::InvalidTarget { .. } | Self::Exhausted { .. } => false,
        }
    }
}

/// Fetches documents over a shared client under a retry policy
#[derive(Debug, Clone)]
pub struct BoundedFetcher {
    client: Arc<Client>,
    policy: RetryPolicy,
}

impl BoundedFetcher {
    pub fn new(client: Arc<Client>, policy: RetryPolicy) -> Self {
        Self { client, policy }
    }

    /// GET `target` and run `extractor` over the body.
    ///
    /// Any non-2xx status, transport failure or extraction failure counts as
    /// a failed attempt.
    pub async fn fetch_document<X>(&self, target: &str, extractor: &X) -> Result<X::Output, FetchError>
    where
        X: DocumentExtractor,
    {
        let url = parse_target(target)?;
        self.policy
            .run(target, |attempt| {
                let url = url.clone();
                async move {
                    tracing::debug!(url = %target, attempt, "fetching document");
                    let body = self.get(target, url).await?.text().await.map_err(|source| {
                        FetchError::Transport {
                            target: target.to_string(),
                            source,
                        }
                    })?;
                    extractor
                        .extract(&body)
                        .map_err(|source| FetchError::Extract {
                            target: target.to_string(),
                            source,
                        })
                }
            })
            .await
    }

    /// GET `target` and return the whole body
    pub async fn fetch_bytes(&self, target: &str) -> Result<Vec<u8>, FetchError> {
        let url = parse_target(target)?;
        self.policy
            .run(target, |attempt| {
                let url = url.clone();
                async move {
                    tracing::debug!(url = %target, attempt, "downloading");
                    let bytes = self.get(target, url).await?.bytes().await.map_err(|source| {
                        FetchError::Transport {
                            target: target.to_string(),
                            source,
                        }
                    })?;
                    Ok(bytes.to_vec())
                }
            })
            .await
    }

    async fn get(&self, target: &str, url: Url) -> Result<reqwest::Response, FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|source| FetchError::Transport {
                target: target.to_string(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                target: target.to_string(),
                status,
            });
        }
        Ok(response)
    }
}

fn parse_target(target: &str) -> Result<Url, FetchError> {
    Url::parse(target).map_err(|source| FetchError::InvalidTarget {
        target: target.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractors::NvdDetailExtractor;
    use crate::http_client::{HttpClientOptions, create_shared_client};
    use crate::pipeline::retry::RetryDelay;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const PAGE: &str = r#"<html><body>
        <p data-testid="vuln-description">Heap overflow in example</p>
    </body></html>"#;

    fn fetcher(max_attempts: u32) -> BoundedFetcher {
        let client = create_shared_client(&HttpClientOptions::scraping()).unwrap();
        let policy = RetryPolicy::scraping()
            .with_max_attempts(max_attempts)
            .with_delay(RetryDelay::Fixed(Duration::ZERO));
        BoundedFetcher::new(client, policy)
    }

    #[tokio::test]
    async fn test_retries_server_errors_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/vuln/detail/CVE-2024-0001"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/vuln/detail/CVE-2024-0001"))
            .respond_with(ResponseTemplate::new(200).set_body_string(PAGE))
            .expect(1)
            .mount(&server)
            .await;

        let target = format!("{}/vuln/detail/CVE-2024-0001", server.uri());
        let detail = fetcher(5)
            .fetch_document(&target, &NvdDetailExtractor::new().unwrap())
            .await
            .unwrap();
        assert_eq!(detail.description, "Heap overflow in example");
    }

    #[tokio::test]
    async fn test_empty_body_exhausts_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(""))
            .expect(3)
            .mount(&server)
            .await;

        let target = format!("{}/vuln/detail/CVE-2024-0002", server.uri());
        let err = fetcher(3)
            .fetch_document(&target, &NvdDetailExtractor::new().unwrap())
            .await
            .unwrap_err();

        assert!(matches!(
            &err,
            FetchError::Exhausted { target: failed, attempts: 3, .. } if *failed == target
        ));
        assert!(err.to_string().contains("CVE-2024-0002"));
    }

    #[tokio::test]
    async fn test_status_error_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let target = format!("{}/missing", server.uri());
        let err = fetcher(1).fetch_bytes(&target).await.unwrap_err();
        match err {
            FetchError::Exhausted { last, .. } => assert!(matches!(
                *last,
                FetchError::Status {
                    status: StatusCode::NOT_FOUND,
                    ..
                }
            )),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_invalid_target_is_not_retried() {
        let err = fetcher(5)
            .fetch_bytes("vuln/detail/not-a-url")
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::InvalidTarget { .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_fetch_bytes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/files/export.zip"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0x50, 0x4b, 0x03, 0x04]))
            .mount(&server)
            .await;

        let bytes = fetcher(2)
            .fetch_bytes(&format!("{}/files/export.zip", server.uri()))
            .await
            .unwrap();
        assert_eq!(bytes, vec![0x50, 0x4b, 0x03, 0x04]);
    }
}
