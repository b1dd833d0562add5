//! Descriptor extraction over HTTP.

use rollcall_core::Descriptor;
use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExtractError {
    #[error("network error: {0}")]
    Network(String),
    #[error("extractor returned {0}: {1}")]
    Api(u16, String),
    #[error("unreadable extractor response: {0}")]
    Parse(String),
}

/// Turns an image into a face descriptor. `Ok(None)` means no face was found.
pub trait DescriptorExtractor: Send + Sync + 'static {
    fn extract(
        &self,
        image: Vec<u8>,
    ) -> impl Future<Output = Result<Option<Descriptor>, ExtractError>> + Send;
}

#[derive(Debug, Deserialize)]
struct DescriptorResponse {
    descriptor: Option<Vec<f32>>,
}

/// Client for an extraction service that accepts a raw image on
/// `POST {base}/descriptor` and answers `{"descriptor": [...] | null}`.
pub struct HttpExtractor {
    http_client: reqwest::Client,
    endpoint: String,
}

impl HttpExtractor {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ExtractError> {
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("rollcalld/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| ExtractError::Network(e.to_string()))?;

        Ok(Self {
            http_client,
            endpoint: endpoint_for(base_url),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

fn endpoint_for(base_url: &str) -> String {
    format!("{}/descriptor", base_url.trim_end_matches('/'))
}

fn parse_response(body: &str) -> Result<Option<Descriptor>, ExtractError> {
    let response: DescriptorResponse =
        serde_json::from_str(body).map_err(|e| ExtractError::Parse(e.to_string()))?;
    Ok(response
        .descriptor
        .filter(|values| !values.is_empty())
        .map(Descriptor::new))
}

impl DescriptorExtractor for HttpExtractor {
    async fn extract(&self, image: Vec<u8>) -> Result<Option<Descriptor>, ExtractError> {
        let bytes = image.len();
        let response = self
            .http_client
            .post(&self.endpoint)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(image)
            .send()
            .await
            .map_err(|e| ExtractError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(ExtractError::Api(status.as_u16(), error_text));
        }

        let body = response
            .text()
            .await
            .map_err(|e| ExtractError::Network(e.to_string()))?;
        let descriptor = parse_response(&body)?;
        tracing::debug!(
            bytes,
            face = descriptor.is_some(),
            dims = descriptor.as_ref().map(|d| d.len()).unwrap_or(0),
            "descriptor extracted"
        );
        Ok(descriptor)
    }
}
