//! Entity extraction through the Anthropic Messages API.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::time::Duration;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, instrument};

use graphloom_shared::{
    EntityType, ExtractionMethod, LlmConfig, PipelineError, Result, normalize_name,
};

use crate::draft::{DraftKey, EntityDraft, StrategyOutput};
use crate::text::truncate_chars;

const ANTHROPIC_VERSION: &str = "2023-06-01";

const SYSTEM_PROMPT: &str = "You extract a knowledge graph from web page text. \
Reply with a single JSON object and nothing else, shaped as \
{\"entities\": [{\"name\": str, \"type\": str, \"description\": str?, \"properties\": object?}], \
\"relationships\": [{\"source\": str, \"target\": str, \"type\": str}]}. \
Entity types: person, organization, location, event, product, concept, document, date. \
Relationship source and target must be entity names from the entities list. \
Relationship types are short snake_case verbs such as works_for, located_in, founded, authored.";

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: Vec<Message<'a>>,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'a str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

/// The JSON document the model is asked to produce.
#[derive(Debug, Default, Deserialize)]
struct LlmPayload {
    #[serde(default)]
    entities: Vec<LlmEntity>,
    #[serde(default)]
    relationships: Vec<LlmRelationship>,
}

#[derive(Debug, Deserialize)]
struct LlmEntity {
    name: String,
    #[serde(rename = "type", default)]
    entity_type: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    properties: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct LlmRelationship {
    source: String,
    target: String,
    #[serde(rename = "type", default = "default_relationship_type")]
    relationship_type: String,
}

fn default_relationship_type() -> String {
    "related_to".into()
}

// ---------------------------------------------------------------------------
// Extractor
// ---------------------------------------------------------------------------

/// Rate-limited Messages API client shared by every job.
pub struct LlmExtractor {
    client: Client,
    endpoint: String,
    model: String,
    api_key: String,
    max_tokens: u32,
    max_input_chars: usize,
    limiter: DefaultDirectRateLimiter,
}

impl LlmExtractor {
    /// Build from config, or `None` when no API key is set.
    pub fn from_config(config: &LlmConfig) -> Result<Option<Self>> {
        match config.api_key() {
            Some(key) => Self::new(config, key).map(Some),
            None => Ok(None),
        }
    }

    pub fn new(config: &LlmConfig, api_key: impl Into<String>) -> Result<Self> {
        let per_minute = NonZeroU32::new(config.requests_per_minute)
            .ok_or_else(|| PipelineError::config("llm.requests_per_minute must be positive"))?;
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| PipelineError::config(format!("failed to build LLM client: {e}")))?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            api_key: api_key.into(),
            max_tokens: config.max_tokens,
            max_input_chars: config.max_input_chars,
            limiter: RateLimiter::direct(Quota::per_minute(per_minute)),
        })
    }

    /// Ask the model for the entities and relationships in `text`.
    #[instrument(skip_all, fields(model = %self.model, text_len = text.len()))]
    pub async fn extract(&self, text: &str, confidence: f64) -> Result<StrategyOutput> {
        if text.trim().is_empty() {
            return Ok(StrategyOutput::default());
        }
        let input = truncate_chars(text, self.max_input_chars);

        self.limiter.until_ready().await;

        let request = MessagesRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            system: SYSTEM_PROMPT,
            messages: vec![Message {
                role: "user",
                content: format!("Page text:\n\n{input}"),
            }],
        };

        let response = self
            .client
            .post(&self.endpoint)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&request)
            .send()
            .await
            .map_err(|e| PipelineError::Extraction(format!("LLM request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .json::<ErrorResponse>()
                .await
                .map(|body| body.error.message)
                .unwrap_or_else(|_| "unknown error".into());
            return Err(PipelineError::Extraction(format!(
                "LLM returned {status}: {message}"
            )));
        }

        let body: MessagesResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::Extraction(format!("failed to parse LLM response: {e}")))?;

        let reply: String = body
            .content
            .into_iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text)
            .collect();

        let payload = parse_payload(&reply)?;
        debug!(
            entities = payload.entities.len(),
            relationships = payload.relationships.len(),
            "LLM extraction complete"
        );
        Ok(into_output(payload, confidence))
    }
}

/// Pull the JSON object out of a reply that may carry prose or code fences.
fn parse_payload(reply: &str) -> Result<LlmPayload> {
    let (Some(start), Some(end)) = (reply.find('{'), reply.rfind('}')) else {
        return Err(PipelineError::Extraction(
            "LLM reply contained no JSON object".into(),
        ));
    };
    if end < start {
        return Err(PipelineError::Extraction(
            "LLM reply contained no JSON object".into(),
        ));
    }
    serde_json::from_str(&reply[start..=end])
        .map_err(|e| PipelineError::Extraction(format!("LLM reply is not valid JSON: {e}")))
}

fn into_output(payload: LlmPayload, confidence: f64) -> StrategyOutput {
    let mut out = StrategyOutput::default();
    let mut by_name: HashMap<String, DraftKey> = HashMap::new();

    for entity in payload.entities {
        let mut draft = EntityDraft::new(
            entity.name,
            EntityType::from_label(&entity.entity_type),
            ExtractionMethod::LlmClaude,
            confidence,
        )
        .with_description(entity.description);
        draft.properties = entity.properties;
        if let Some(key) = out.push_entity(draft) {
            by_name.entry(key.normalized_name.clone()).or_insert(key);
        }
    }

    for rel in payload.relationships {
        let source = by_name.get(&normalize_name(&rel.source));
        let target = by_name.get(&normalize_name(&rel.target));
        if let (Some(source), Some(target)) = (source, target) {
            let kind = rel
                .relationship_type
                .trim()
                .to_lowercase()
                .replace([' ', '-'], "_");
            out.relate(source, target, kind, confidence);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn config(server: &MockServer) -> LlmConfig {
        LlmConfig {
            endpoint: format!("{}/v1/messages", server.uri()),
            ..LlmConfig::default()
        }
    }

    fn reply(text: &str) -> serde_json::Value {
        serde_json::json!({
            "id": "msg_1",
            "type": "message",
            "role": "assistant",
            "content": [{"type": "text", "text": text}],
            "stop_reason": "end_turn"
        })
    }

    #[tokio::test]
    async fn extracts_entities_and_relationships() {
        let server = MockServer::start().await;
        let text = "```json\n{\"entities\": [\
            {\"name\": \"Jane Doe\", \"type\": \"Person\", \"description\": \"Engineer\"},\
            {\"name\": \"Acme Corp\", \"type\": \"organisation\"}],\
          \"relationships\": [{\"source\": \"jane doe\", \"target\": \"Acme Corp\", \"type\": \"Works For\"},\
            {\"source\": \"Jane Doe\", \"target\": \"Nobody\", \"type\": \"knows\"}]}\n```";
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "test-key"))
            .and(header("anthropic-version", ANTHROPIC_VERSION))
            .respond_with(ResponseTemplate::new(200).set_body_json(reply(text)))
            .expect(1)
            .mount(&server)
            .await;

        let llm = LlmExtractor::new(&config(&server), "test-key").unwrap();
        let out = llm
            .extract("Jane Doe is an engineer at Acme Corp.", 0.8)
            .await
            .unwrap();

        assert_eq!(out.entities.len(), 2);
        assert_eq!(out.entities[0].entity_type, EntityType::Person);
        assert_eq!(out.entities[0].method, ExtractionMethod::LlmClaude);
        assert_eq!(out.entities[1].entity_type, EntityType::Organization);
        assert_eq!(out.relationships.len(), 1);
        assert_eq!(out.relationships[0].relationship_type, "works_for");
    }

    #[tokio::test]
    async fn api_errors_surface_as_extraction_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(529).set_body_json(serde_json::json!({
                "type": "error",
                "error": {"type": "overloaded_error", "message": "Overloaded"}
            })))
            .mount(&server)
            .await;

        let llm = LlmExtractor::new(&config(&server), "test-key").unwrap();
        let err = llm.extract("Some text", 0.8).await.unwrap_err();
        assert!(matches!(err, PipelineError::Extraction(_)));
        assert!(err.to_string().contains("Overloaded"));
    }

    #[tokio::test]
    async fn empty_text_skips_the_call() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;
        let llm = LlmExtractor::new(&config(&server), "k").unwrap();
        assert!(llm.extract("   ", 0.8).await.unwrap().is_empty());
    }

    #[test]
    fn payload_parsing() {
        assert!(parse_payload("no json here").is_err());
        assert!(parse_payload("} backwards {").is_err());
        let payload = parse_payload("Sure! {\"entities\": []} Hope that helps.").unwrap();
        assert!(payload.entities.is_empty());
    }

    #[test]
    fn zero_rate_is_a_config_error() {
        let config = LlmConfig {
            requests_per_minute: 0,
            ..LlmConfig::default()
        };
        assert!(matches!(
            LlmExtractor::new(&config, "k"),
            Err(PipelineError::Config { .. })
        ));
    }
}
