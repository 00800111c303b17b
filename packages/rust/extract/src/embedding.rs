//! OpenAI-compatible `/embeddings` client.

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use graphloom_shared::{EmbeddingConfig, PipelineError, Result};

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
    encoding_format: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

/// Embedding client, present only when `[embedding].endpoint` is set.
pub struct EmbeddingClient {
    client: Client,
    url: String,
    model: String,
    api_key: Option<String>,
}

impl EmbeddingClient {
    pub fn from_config(config: &EmbeddingConfig) -> Result<Option<Self>> {
        let Some(endpoint) = config.endpoint.as_deref() else {
            return Ok(None);
        };
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| PipelineError::config(format!("failed to build embedding client: {e}")))?;
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|k| !k.is_empty());

        Ok(Some(Self {
            client,
            url: format!("{}/embeddings", endpoint.trim_end_matches('/')),
            model: config.model.clone(),
            api_key,
        }))
    }

    /// Embed `texts` in one request. Output order matches input order.
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let request = EmbeddingRequest {
            model: &self.model,
            input: texts,
            encoding_format: "float",
        };
        let mut req = self.client.post(&self.url).json(&request);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let response = req
            .send()
            .await
            .map_err(|e| PipelineError::Extraction(format!("embedding request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::Extraction(format!(
                "embedding endpoint returned {status}"
            )));
        }

        let mut body: EmbeddingResponse = response.json().await.map_err(|e| {
            PipelineError::Extraction(format!("failed to parse embedding response: {e}"))
        })?;
        if body.data.len() != texts.len() {
            return Err(PipelineError::Extraction(format!(
                "embedding endpoint returned {} vectors for {} inputs",
                body.data.len(),
                texts.len()
            )));
        }

        body.data.sort_by_key(|d| d.index);
        debug!(count = body.data.len(), model = %self.model, "embedded batch");
        Ok(body.data.into_iter().map(|d| d.embedding).collect())
    }
}
