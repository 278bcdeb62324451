//! Cloud Storage object fetcher
//!
//! Downloads object media through the JSON API. A 404 means the object
//! is gone for good; every other failure is worth another try.

use async_trait::async_trait;
use reqwest::StatusCode;
use sealnote_core::{FetchError, ObjectFetcher};

pub struct GcsFetcher {
    client: reqwest::Client,
    endpoint: String,
    access_token: Option<String>,
}

impl GcsFetcher {
    pub fn new(endpoint: impl Into<String>, access_token: Option<String>) -> Self {
        Self::with_client(reqwest::Client::new(), endpoint, access_token)
    }

    pub fn with_client(
        client: reqwest::Client,
        endpoint: impl Into<String>,
        access_token: Option<String>,
    ) -> Self {
        Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            access_token,
        }
    }

    /// Media download URL for an object
    pub fn object_url(&self, bucket: &str, name: &str) -> String {
        format!(
            "{}/storage/v1/b/{}/o/{}?alt=media",
            self.endpoint,
            urlencoding::encode(bucket),
            urlencoding::encode(name)
        )
    }
}

/// Map a non-success status to a fetch error; `None` for success.
fn status_error(status: StatusCode, bucket: &str, name: &str) -> Option<FetchError> {
    if status.is_success() {
        None
    } else if status == StatusCode::NOT_FOUND {
        Some(FetchError::not_found(bucket, name))
    } else {
        Some(FetchError::TransientIo(format!("storage returned HTTP {status}")))
    }
}

#[async_trait]
impl ObjectFetcher for GcsFetcher {
    async fn fetch(&self, container: &str, key: &str) -> Result<Vec<u8>, FetchError> {
        let mut request = self.client.get(self.object_url(container, key));
        if let Some(token) = &self.access_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| FetchError::TransientIo(e.to_string()))?;

        if let Some(err) = status_error(response.status(), container, key) {
            return Err(err);
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| FetchError::TransientIo(e.to_string()))?;

        tracing::debug!(bucket = container, object = key, bytes = body.len(), "downloaded object");
        Ok(body.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_url_encodes_name() {
        let fetcher = GcsFetcher::new("http://localhost:4443/", None);
        assert_eq!(
            fetcher.object_url("private-notes", "inbox/2b1f 0c9e.json"),
            "http://localhost:4443/storage/v1/b/private-notes/o/inbox%2F2b1f%200c9e.json?alt=media"
        );
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_error(StatusCode::OK, "b", "k"), None);
        assert_eq!(
            status_error(StatusCode::NOT_FOUND, "b", "k"),
            Some(FetchError::not_found("b", "k"))
        );

        for status in [
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::SERVICE_UNAVAILABLE,
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::UNAUTHORIZED,
        ] {
            assert!(matches!(
                status_error(status, "b", "k"),
                Some(FetchError::TransientIo(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_transient() {
        // Nothing listens on the discard port
        let fetcher = GcsFetcher::new("http://127.0.0.1:9", None);
        assert!(matches!(
            fetcher.fetch("b", "k").await,
            Err(FetchError::TransientIo(_))
        ));
    }
}
