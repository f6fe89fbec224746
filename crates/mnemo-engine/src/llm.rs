//! [`LlmDriver`] – OpenAI-compatible LLM interface.
//!
//! Talks to any server exposing `/v1/chat/completions` and `/v1/embeddings`
//! (Ollama at `http://localhost:11434`, OpenAI, a self-hosted gateway).  The
//! driver is the default provider of the [`Embedder`], [`Reranker`] and
//! [`MemoryExtractor`] capabilities.
//!
//! # Example
//!
//! ```rust,no_run
//! use mnemo_engine::llm::LlmDriver;
//!
//! let driver = LlmDriver::new("http://localhost:11434", "llama3")
//!     .with_embedding_model("nomic-embed-text");
//! // Requires a running model server – skipped in unit tests.
//! // let vector = driver.embed_text("max drawdown breached").await.unwrap();
//! ```

use async_trait::async_trait;
use mnemo_types::{Memory, MemoryType, MnemoError, ProtectionLevel};
use schemars::{JsonSchema, schema_for};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::capability::{Embedder, MemoryExtractor, Reranker, SessionActivity};

/// Instructions sent with every extraction request.
pub const EXTRACTION_GUIDELINES: &str = "\
You maintain the long-term memory of a trading assistant.
Read the session transcript and extract durable knowledge worth remembering.
- Prefer lessons learned from losses, rule violations and surprising results.
- One memory per distinct idea; `summary` is a single short sentence.
- importance is in [0, 1]; protection_level is 0 (never forget) to 3 (ephemeral).
- Put realized P&L attached to a lesson in financial_impact (negative for losses).
- Return an empty list when nothing is worth keeping.";

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

/// Errors that can arise from LLM driver operations.
#[derive(Error, Debug)]
pub enum LlmError {
    /// The HTTP request to the model server failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    /// The response from the model server could not be parsed.
    #[error("Unexpected response format: {0}")]
    BadResponse(String),
    /// No model server is configured for this capability.
    #[error("LLM capability not configured: {0}")]
    NotConfigured(&'static str),
}

impl From<LlmError> for MnemoError {
    fn from(err: LlmError) -> Self {
        MnemoError::EmbeddingUnavailable(err.to_string())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Message types (OpenAI-compatible)
// ─────────────────────────────────────────────────────────────────────────────

/// The role of a participant in a chat conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single message in a chat conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Internal request / response shapes
// ─────────────────────────────────────────────────────────────────────────────

/// `response_format` field that enforces structured JSON Schema output.
#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
    json_schema: serde_json::Value,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChatMessage,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Extraction schema
// ─────────────────────────────────────────────────────────────────────────────

/// A memory as proposed by the model, before validation.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ExtractedMemory {
    pub content: String,
    pub summary: String,
    pub memory_type: MemoryType,
    pub importance: f64,
    pub protection_level: u8,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub financial_impact: Option<f64>,
}

/// Top-level shape of an extraction reply.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ExtractionResponse {
    pub memories: Vec<ExtractedMemory>,
}

impl ExtractedMemory {
    /// Convert into a [`Memory`] of `workspace_id`, clamping importance into
    /// `[0, 1]` and mapping unknown protection levels to `STANDARD`.
    pub fn into_memory(self, workspace_id: &str) -> Memory {
        let level = ProtectionLevel::try_from(self.protection_level).unwrap_or_else(|_| {
            warn!(level = self.protection_level, "model proposed an unknown protection level");
            ProtectionLevel::Standard
        });
        let importance = if self.importance.is_finite() {
            self.importance.clamp(0.0, 1.0)
        } else {
            0.5
        };
        let mut memory = Memory::new(workspace_id, self.memory_type, self.content, self.summary)
            .with_importance(importance)
            .with_protection(level)
            .with_tags(self.tags);
        memory.category = self.category;
        memory.financial_impact = self.financial_impact;
        memory
    }
}

/// Parse a rerank reply (a JSON array of 1-based candidate numbers) into a
/// permutation of `0..n`.  Unknown or repeated numbers are ignored and any
/// candidate the model left out keeps its relative position at the end.
pub fn parse_rerank_order(reply: &str, n: usize) -> Vec<usize> {
    let numbers: Vec<usize> = match (reply.find('['), reply.rfind(']')) {
        (Some(start), Some(end)) if start < end => {
            serde_json::from_str(&reply[start..=end]).unwrap_or_default()
        }
        _ => Vec::new(),
    };
    let mut seen = vec![false; n];
    let mut order = Vec::with_capacity(n);
    for number in numbers {
        if (1..=n).contains(&number) && !seen[number - 1] {
            seen[number - 1] = true;
            order.push(number - 1);
        }
    }
    order.extend((0..n).filter(|i| !seen[*i]));
    order
}

fn rerank_prompt(query: &str, candidates: &[Memory]) -> String {
    let mut prompt = format!(
        "Query: {query}\n\nOrder these memories from most to least useful for the query. \
         Reply with a JSON array of their numbers only.\n\n"
    );
    for (i, m) in candidates.iter().enumerate() {
        prompt.push_str(&format!("{}. {}\n", i + 1, m.display_text()));
    }
    prompt
}

// ─────────────────────────────────────────────────────────────────────────────
// LlmDriver
// ─────────────────────────────────────────────────────────────────────────────

/// An async client for an OpenAI-compatible model server.
///
/// Construct once and share behind an `Arc` across the engine.
pub struct LlmDriver {
    base_url: String,
    model: String,
    embedding_model: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl LlmDriver {
    /// Create a new driver pointing at `base_url` (e.g. `"http://localhost:11434"`)
    /// and using `model` for chat.  Embeddings use the same model until
    /// [`with_embedding_model`][Self::with_embedding_model] is called.
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        let model = model.into();
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            embedding_model: model.clone(),
            model,
            api_key: None,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_embedding_model(mut self, model: impl Into<String>) -> Self {
        self.embedding_model = model.into();
        self
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        let key = key.into();
        self.api_key = (!key.is_empty()).then_some(key);
        self
    }

    fn ensure_configured(&self) -> Result<(), LlmError> {
        if self.base_url.is_empty() {
            return Err(LlmError::NotConfigured("model server url"));
        }
        Ok(())
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let builder = self.client.post(format!("{}{}", self.base_url, path));
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    /// Send `messages` to the model and return the assistant's reply text.
    ///
    /// When `schema` is given it is forwarded as a `json_schema`
    /// `response_format` so the model is forced into that shape.
    ///
    /// # Errors
    ///
    /// Returns [`LlmError::Http`] if the request fails, or
    /// [`LlmError::BadResponse`] if the response shape is unexpected.
    pub async fn complete(
        &self,
        messages: &[ChatMessage],
        schema: Option<serde_json::Value>,
    ) -> Result<String, LlmError> {
        self.ensure_configured()?;
        let body = ChatRequest {
            model: &self.model,
            messages,
            stream: false,
            response_format: schema.map(|json_schema| ResponseFormat {
                kind: "json_schema",
                json_schema,
            }),
        };

        let response: ChatResponse = self
            .post("/v1/chat/completions")
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| LlmError::BadResponse("empty choices array".into()))
    }

    /// Embed `text` with the configured embedding model.
    pub async fn embed_text(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        self.ensure_configured()?;
        let response: EmbeddingResponse = self
            .post("/v1/embeddings")
            .json(&EmbeddingRequest {
                model: &self.embedding_model,
                input: text,
            })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        match response.data.into_iter().next() {
            Some(d) if !d.embedding.is_empty() => Ok(d.embedding),
            _ => Err(LlmError::BadResponse("empty embedding data".into())),
        }
    }
}

#[async_trait]
impl Embedder for LlmDriver {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        self.embed_text(text).await
    }
}

#[async_trait]
impl Reranker for LlmDriver {
    async fn rerank(&self, query: &str, candidates: Vec<Memory>) -> Result<Vec<Memory>, LlmError> {
        if candidates.len() < 2 {
            return Ok(candidates);
        }
        let messages = [
            ChatMessage::system("You rank stored trading memories by relevance."),
            ChatMessage::user(rerank_prompt(query, &candidates)),
        ];
        let reply = self.complete(&messages, None).await?;
        let order = parse_rerank_order(&reply, candidates.len());
        let mut slots: Vec<Option<Memory>> = candidates.into_iter().map(Some).collect();
        Ok(order.into_iter().filter_map(|i| slots[i].take()).collect())
    }
}

#[async_trait]
impl MemoryExtractor for LlmDriver {
    async fn extract(&self, activity: &SessionActivity) -> Result<Vec<Memory>, LlmError> {
        let schema = serde_json::to_value(schema_for!(ExtractionResponse))
            .map_err(|e| LlmError::BadResponse(e.to_string()))?;
        let messages = [
            ChatMessage::system(EXTRACTION_GUIDELINES),
            ChatMessage::user(format!(
                "Session {}:\n\n{}",
                activity.session_id, activity.transcript
            )),
        ];
        let reply = self.complete(&messages, Some(schema)).await?;
        let parsed: ExtractionResponse = serde_json::from_str(reply.trim())
            .map_err(|e| LlmError::BadResponse(format!("extraction reply is not valid JSON: {e}")))?;

        let mut memories = Vec::with_capacity(parsed.memories.len());
        for extracted in parsed.memories {
            let mut memory = extracted.into_memory(&activity.workspace_id);
            match self.embed_text(&memory.content).await {
                Ok(vector) => memory.embedding = Some(vector),
                Err(e) => debug!(error = %e, "storing extracted memory without embedding"),
            }
            memories.push(memory);
        }
        Ok(memories)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_message_serializes_role() {
        let json = serde_json::to_string(&ChatMessage::system("hello")).unwrap();
        assert!(json.contains("\"system\""));
    }

    #[test]
    fn chat_request_omits_missing_response_format() {
        let messages = [ChatMessage::user("hi")];
        let body = ChatRequest {
            model: "llama3",
            messages: &messages,
            stream: false,
            response_format: None,
        };
        let json = serde_json::to_string(&body).unwrap();
        assert!(!json.contains("response_format"));
    }

    #[test]
    fn extraction_schema_describes_memory_fields() {
        let schema = serde_json::to_value(schema_for!(ExtractionResponse)).unwrap();
        let schema_str = schema.to_string();
        assert!(schema_str.contains("memories"));
        assert!(schema_str.contains("protection_level"));
        assert!(schema_str.contains("lesson"));
    }

    #[test]
    fn extracted_memory_is_clamped_and_validated() {
        let extracted = ExtractedMemory {
            content: "Slippage on thin books ate the edge".into(),
            summary: "thin books kill edge".into(),
            memory_type: MemoryType::Lesson,
            importance: 1.7,
            protection_level: 9,
            category: Some("execution".into()),
            tags: vec!["slippage".into()],
            financial_impact: Some(-320.0),
        };
        let memory = extracted.into_memory("ws");
        assert_eq!(memory.importance_score, 1.0);
        assert_eq!(memory.protection_level, ProtectionLevel::Standard);
        assert_eq!(memory.financial_impact, Some(-320.0));
        assert!(memory.validate().is_ok());
    }

    #[test]
    fn extraction_reply_parses_with_defaults() {
        let reply = r#"{"memories":[{"content":"c","summary":"s","memory_type":"fact","importance":0.4,"protection_level":2}]}"#;
        let parsed: ExtractionResponse = serde_json::from_str(reply).unwrap();
        assert_eq!(parsed.memories.len(), 1);
        assert!(parsed.memories[0].tags.is_empty());
    }

    #[test]
    fn rerank_order_follows_model_reply() {
        assert_eq!(parse_rerank_order("[3, 1, 2]", 3), vec![2, 0, 1]);
    }

    #[test]
    fn rerank_order_tolerates_noise_and_gaps() {
        // Prose around the array, an out-of-range number and a duplicate.
        let order = parse_rerank_order("Sure: [2, 9, 2] done", 3);
        assert_eq!(order, vec![1, 0, 2]);
    }

    #[test]
    fn rerank_order_falls_back_to_identity() {
        assert_eq!(parse_rerank_order("no idea", 3), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn empty_base_url_is_not_configured() {
        let driver = LlmDriver::new("", "llama3");
        let err = driver.embed_text("anything").await.unwrap_err();
        assert!(matches!(err, LlmError::NotConfigured(_)));
    }

    #[test]
    fn api_key_empty_string_is_ignored() {
        let driver = LlmDriver::new("http://localhost:11434/", "llama3").with_api_key("");
        assert!(driver.api_key.is_none());
        assert_eq!(driver.base_url, "http://localhost:11434");
    }
}
