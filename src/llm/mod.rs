//! LLM provider pool (LP, §1): out of scope as an implementation ("the LLM
//! provider clients themselves... treated as opaque async RPC endpoints with
//! rate limits"), but the pipeline still needs *something* behind
//! [`crate::pipeline::LlmProvider`] to run against. `HttpLlmProvider` is that
//! something: a thin JSON-over-HTTP client, one base URL per provider name,
//! with rate limiting (§5/§6) applied at the call site so every stage gets
//! it for free.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{PipelineError, Result};
use crate::pipeline::{LlmProvider, PageOcrResult};
use crate::rate_limit::RateLimiterRegistry;

#[derive(Serialize)]
struct OcrRequest {
    page_start: u32,
    page_end: u32,
    pdf_base64: String,
}

#[derive(Deserialize)]
struct OcrResponse {
    pages: Vec<PageOcrResult>,
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    texts: &'a [String],
}

#[derive(Deserialize)]
struct EmbedResponse {
    vectors: Vec<Vec<f32>>,
}

#[derive(Serialize)]
struct ExtractRequest<'a> {
    prompt: &'a str,
    context: &'a str,
}

#[derive(Deserialize)]
struct ExtractResponse {
    output: String,
}

/// HTTP-backed [`LlmProvider`]. `endpoints` maps a provider name (as stored
/// on documents/jobs, e.g. `"ocr-vendor-a"`) to its base URL; a provider not
/// present in the map is a configuration error, surfaced as
/// [`PipelineError::Validation`].
pub struct HttpLlmProvider {
    client: reqwest::Client,
    endpoints: HashMap<String, String>,
    limiters: Mutex<RateLimiterRegistry>,
}

impl HttpLlmProvider {
    pub fn new(endpoints: HashMap<String, String>, provider_limits: &HashMap<String, crate::config::ProviderLimitConfig>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoints,
            limiters: Mutex::new(RateLimiterRegistry::new(provider_limits)),
        }
    }

    fn base_url(&self, provider: &str) -> Result<&str> {
        self.endpoints
            .get(provider)
            .map(String::as_str)
            .ok_or_else(|| PipelineError::TransientExternal(format!("no endpoint configured for provider {provider}")))
    }

    async fn limiter_for(&self, provider: &str) -> Arc<crate::rate_limit::ProviderLimiter> {
        self.limiters.lock().await.get_or_default(provider)
    }

    fn map_status(provider: &str, status: reqwest::StatusCode, body: &str) -> PipelineError {
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            PipelineError::RateLimit { provider: provider.to_string(), retry_after: None }
        } else {
            PipelineError::TransientExternal(format!("provider {provider} returned {status}: {body}"))
        }
    }
}

#[async_trait]
impl LlmProvider for HttpLlmProvider {
    async fn ocr_pdf_range(&self, provider: &str, pdf_bytes: &[u8], page_start: u32, page_end: u32) -> Result<Vec<PageOcrResult>> {
        let base = self.base_url(provider)?;
        let limiter = self.limiter_for(provider).await;
        let _permit = limiter.acquire().await;

        let body = OcrRequest {
            page_start,
            page_end,
            pdf_base64: base64::engine::general_purpose::STANDARD.encode(pdf_bytes),
        };

        let response = self
            .client
            .post(format!("{base}/ocr"))
            .json(&body)
            .send()
            .await
            .map_err(|e| PipelineError::TransientExternal(format!("OCR request to {provider} failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Self::map_status(provider, status, &text));
        }

        let parsed: OcrResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::TransientExternal(format!("malformed OCR response from {provider}: {e}")))?;
        Ok(parsed.pages)
    }

    async fn embed_batch(&self, provider: &str, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let base = self.base_url(provider)?;
        let limiter = self.limiter_for(provider).await;
        let _permit = limiter.acquire().await;

        let response = self
            .client
            .post(format!("{base}/embed"))
            .json(&EmbedRequest { texts })
            .send()
            .await
            .map_err(|e| PipelineError::TransientExternal(format!("embed request to {provider} failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Self::map_status(provider, status, &text));
        }

        let parsed: EmbedResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::TransientExternal(format!("malformed embed response from {provider}: {e}")))?;
        Ok(parsed.vectors)
    }

    async fn extract_structured(&self, provider: &str, prompt: &str, context: &str) -> Result<String> {
        let base = self.base_url(provider)?;
        let limiter = self.limiter_for(provider).await;
        let _permit = limiter.acquire().await;

        let response = self
            .client
            .post(format!("{base}/extract"))
            .json(&ExtractRequest { prompt, context })
            .send()
            .await
            .map_err(|e| PipelineError::TransientExternal(format!("extract request to {provider} failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Self::map_status(provider, status, &text));
        }

        let parsed: ExtractResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::TransientExternal(format!("malformed extract response from {provider}: {e}")))?;
        Ok(parsed.output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_endpoint_is_a_transient_error_not_a_panic() {
        let provider = HttpLlmProvider::new(HashMap::new(), &HashMap::new());
        assert!(provider.base_url("unknown-provider").is_err());
    }

    #[test]
    fn rate_limit_status_maps_to_rate_limit_error() {
        let err = HttpLlmProvider::map_status("ocr-vendor-a", reqwest::StatusCode::TOO_MANY_REQUESTS, "slow down");
        assert!(matches!(err, PipelineError::RateLimit { .. }));
    }

    #[test]
    fn server_error_status_maps_to_transient_external() {
        let err = HttpLlmProvider::map_status("ocr-vendor-a", reqwest::StatusCode::INTERNAL_SERVER_ERROR, "boom");
        assert!(matches!(err, PipelineError::TransientExternal(_)));
    }
}
