//! Remote background removal through the remove.bg HTTP API

use crate::config::{PipelineConfig, RemoteConfig};
use crate::error::{BgRemovalError, Result};
use crate::strategy::{RemovalRequest, RemovalStrategy};
use crate::types::{Credential, OutputImage, StrategyKind};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::Client;

/// Header carrying the API credential
pub const API_KEY_HEADER: &str = "X-Api-Key";

/// Multipart field holding the uploaded file
pub const IMAGE_FIELD: &str = "image_file";

/// Longest error body kept from a failed response
pub const MAX_ERROR_BODY_BYTES: usize = 4096;

/// Sends the original upload to the remote service
#[derive(Debug, Clone)]
pub struct RemoteRemovalStrategy {
    client: Client,
    config: RemoteConfig,
    default_credential: Option<Credential>,
}

impl RemoteRemovalStrategy {
    /// # Errors
    /// - HTTP client construction failure
    pub fn new(config: &PipelineConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.remote.timeout)
            .build()
            .map_err(|e| BgRemovalError::network("Failed to create HTTP client", e))?;

        Ok(Self {
            client,
            config: config.remote.clone(),
            default_credential: config
                .default_credential
                .as_deref()
                .and_then(Credential::parse),
        })
    }

    /// Caller override first, then the configured default
    fn resolve_credential(&self, request: &RemovalRequest<'_>) -> Result<Credential> {
        request
            .credential
            .cloned()
            .or_else(|| self.default_credential.clone())
            .ok_or(BgRemovalError::MissingCredential)
    }

    fn transport_error(&self, error: reqwest::Error) -> BgRemovalError {
        if error.is_timeout() {
            BgRemovalError::Timeout(self.config.timeout)
        } else {
            BgRemovalError::network("Remote request failed", error)
        }
    }
}

/// Cut `body` to at most [`MAX_ERROR_BODY_BYTES`] on a char boundary
fn truncate_body(mut body: String) -> String {
    if body.len() > MAX_ERROR_BODY_BYTES {
        let mut end = MAX_ERROR_BODY_BYTES;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        body.truncate(end);
    }
    body
}

#[async_trait]
impl RemovalStrategy for RemoteRemovalStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Remote
    }

    async fn remove(&self, request: &RemovalRequest<'_>) -> Result<OutputImage> {
        let credential = self.resolve_credential(request)?;

        let mut part = Part::bytes(request.file.bytes.clone())
            .file_name(request.file.file_name.clone());
        if let Some(mime) = &request.file.mime {
            part = part.mime_str(mime).map_err(|e| {
                BgRemovalError::internal(format!("Invalid MIME type '{mime}': {e}"))
            })?;
        }
        let form = Form::new().part(IMAGE_FIELD, part);

        log::debug!(
            "POST {} ({} bytes, {})",
            self.config.endpoint,
            request.file.len(),
            request.file.file_name
        );

        let response = self
            .client
            .post(&self.config.endpoint)
            .header(API_KEY_HEADER, credential.as_str())
            .multipart(form)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BgRemovalError::Remote {
                status: status.as_u16(),
                body: truncate_body(body),
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| self.transport_error(e))?;
        if bytes.is_empty() {
            return Err(BgRemovalError::Remote {
                status: status.as_u16(),
                body: "empty response body".to_string(),
            });
        }

        let output = OutputImage::from_encoded(bytes.to_vec(), StrategyKind::Remote);
        log::debug!(
            "Remote service returned {} bytes ({:?}, {:?})",
            output.bytes.len(),
            output.format,
            output.dimensions
        );
        Ok(output)
    }
}
