use crate::embeddings::Embedder;
use crate::traits::Generator;
use crate::SearchError;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;
use url::Url;

pub const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_GENERATION_MODEL: &str = "gemini-flash-latest";
pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-004";
pub const GEMINI_EMBEDDING_DIMENSIONS: usize = 768;

const BACKEND: &str = "gemini";
const API_KEY_HEADER: &str = "x-goog-api-key";
const MAX_EMBED_BATCH: usize = 100;

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
}

impl GeminiConfig {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Result<Self, SearchError> {
        let api_key = api_key.into().trim().to_string();
        if api_key.is_empty() {
            return Err(SearchError::Config(
                "GEMINI_API_KEY is missing or empty".to_string(),
            ));
        }

        let model = model.into().trim().to_string();
        if model.is_empty() {
            return Err(SearchError::Config("gemini model name is empty".to_string()));
        }

        let base_url = base_url.into().trim().to_string();
        Url::parse(&base_url)?;

        Ok(Self {
            base_url,
            api_key,
            model,
        })
    }

    /// `{base}/v1beta/models/{model}:{method}`
    pub fn endpoint(&self, method: &str) -> Result<Url, SearchError> {
        let mut base = self.base_url.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        let url = Url::parse(&base)?.join(&format!("v1beta/models/{}:{method}", self.model))?;
        Ok(url)
    }
}

/// `generateContent` client. One prompt per call, no retries, no timeout.
pub struct GeminiClient {
    config: GeminiConfig,
    client: Client,
}

impl GeminiClient {
    pub fn new(config: GeminiConfig) -> Self {
        Self {
            config,
            client: Client::new(),
        }
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }
}

#[async_trait]
impl Generator for GeminiClient {
    async fn generate(&self, prompt: &str) -> Result<String, SearchError> {
        let url = self.config.endpoint("generateContent")?;
        debug!(model = %self.config.model, prompt_chars = prompt.chars().count(), "gemini generate");

        let response = self
            .client
            .post(url)
            .header(API_KEY_HEADER, &self.config.api_key)
            .json(&json!({
                "contents": [
                    { "role": "user", "parts": [ { "text": prompt } ] }
                ]
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SearchError::BackendResponse {
                backend: BACKEND.to_string(),
                details: format!("{status}: {}", snippet(&body)),
            });
        }

        let payload: GenerateContentResponse = response.json().await?;
        answer_text(payload)
    }
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default, rename = "promptFeedback")]
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PromptFeedback {
    #[serde(default, rename = "blockReason")]
    block_reason: Option<String>,
}

/// Concatenates the text parts of the first candidate.
fn answer_text(payload: GenerateContentResponse) -> Result<String, SearchError> {
    let Some(candidate) = payload.candidates.into_iter().next() else {
        let reason = payload
            .prompt_feedback
            .and_then(|feedback| feedback.block_reason)
            .unwrap_or_else(|| "no candidates returned".to_string());
        return Err(SearchError::BackendResponse {
            backend: BACKEND.to_string(),
            details: reason,
        });
    };

    Ok(candidate
        .content
        .map(|content| {
            content
                .parts
                .into_iter()
                .filter_map(|part| part.text)
                .collect::<String>()
        })
        .unwrap_or_default())
}

/// Hosted embeddings through `batchEmbedContents`.
pub struct GeminiEmbedder {
    config: GeminiConfig,
    client: Client,
    dimensions: usize,
}

impl GeminiEmbedder {
    pub fn new(config: GeminiConfig) -> Self {
        Self {
            config,
            client: Client::new(),
            dimensions: GEMINI_EMBEDDING_DIMENSIONS,
        }
    }
}

#[derive(Debug, Deserialize)]
struct BatchEmbedResponse {
    #[serde(default)]
    embeddings: Vec<EmbeddingValues>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingValues {
    #[serde(default)]
    values: Vec<f32>,
}

#[async_trait]
impl Embedder for GeminiEmbedder {
    fn name(&self) -> String {
        format!("{BACKEND}:{}", self.config.model)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, SearchError> {
        let url = self.config.endpoint("batchEmbedContents")?;
        let model = format!("models/{}", self.config.model);
        let mut vectors = Vec::with_capacity(texts.len());

        for batch in texts.chunks(MAX_EMBED_BATCH) {
            let requests = batch
                .iter()
                .map(|text| json!({ "model": model, "content": { "parts": [ { "text": text } ] } }))
                .collect::<Vec<_>>();

            let response = self
                .client
                .post(url.clone())
                .header(API_KEY_HEADER, &self.config.api_key)
                .json(&json!({ "requests": requests }))
                .send()
                .await?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(SearchError::BackendResponse {
                    backend: BACKEND.to_string(),
                    details: format!("{status}: {}", snippet(&body)),
                });
            }

            let payload: BatchEmbedResponse = response.json().await?;
            vectors.extend(embedding_values(payload, batch.len(), self.dimensions)?);
        }

        Ok(vectors)
    }
}

fn embedding_values(
    payload: BatchEmbedResponse,
    expected_count: usize,
    dimensions: usize,
) -> Result<Vec<Vec<f32>>, SearchError> {
    if payload.embeddings.len() != expected_count {
        return Err(SearchError::BackendResponse {
            backend: BACKEND.to_string(),
            details: format!(
                "asked for {expected_count} embeddings, received {}",
                payload.embeddings.len()
            ),
        });
    }

    payload
        .embeddings
        .into_iter()
        .map(|embedding| {
            if embedding.values.len() == dimensions {
                Ok(embedding.values)
            } else {
                Err(SearchError::DimensionMismatch {
                    expected: dimensions,
                    actual: embedding.values.len(),
                })
            }
        })
        .collect()
}

fn snippet(body: &str) -> String {
    const LIMIT: usize = 300;
    let trimmed = body.trim();
    if trimmed.chars().count() <= LIMIT {
        trimmed.to_string()
    } else {
        let cut = trimmed.chars().take(LIMIT).collect::<String>();
        format!("{cut}…")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> GeminiConfig {
        GeminiConfig::new(DEFAULT_GEMINI_BASE_URL, "key", DEFAULT_GENERATION_MODEL)
            .expect("valid config")
    }

    #[test]
    fn endpoint_targets_model_method() -> Result<(), SearchError> {
        let url = config().endpoint("generateContent")?;
        assert_eq!(
            url.as_str(),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-flash-latest:generateContent"
        );
        Ok(())
    }

    #[test]
    fn endpoint_keeps_base_path_prefix() -> Result<(), SearchError> {
        let config = GeminiConfig::new("http://localhost:9000/proxy", "key", "m")?;
        let url = config.endpoint("generateContent")?;
        assert_eq!(url.as_str(), "http://localhost:9000/proxy/v1beta/models/m:generateContent");
        Ok(())
    }

    #[test]
    fn missing_api_key_is_a_config_error() {
        let result = GeminiConfig::new(DEFAULT_GEMINI_BASE_URL, "  ", DEFAULT_GENERATION_MODEL);
        assert!(matches!(result, Err(SearchError::Config(_))));
    }

    #[test]
    fn answer_joins_text_parts_of_first_candidate() -> Result<(), SearchError> {
        let payload: GenerateContentResponse = serde_json::from_value(json!({
            "candidates": [
                { "content": { "role": "model", "parts": [ { "text": "La pompe " }, { "text": "débite 5 L/s." } ] } },
                { "content": { "parts": [ { "text": "ignored" } ] } }
            ]
        }))?;

        assert_eq!(answer_text(payload)?, "La pompe débite 5 L/s.");
        Ok(())
    }

    #[test]
    fn blocked_prompt_is_a_backend_error() -> Result<(), SearchError> {
        let payload: GenerateContentResponse = serde_json::from_value(json!({
            "promptFeedback": { "blockReason": "SAFETY" }
        }))?;

        match answer_text(payload) {
            Err(SearchError::BackendResponse { details, .. }) => assert_eq!(details, "SAFETY"),
            other => panic!("expected backend error, got {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn embedding_values_are_checked() -> Result<(), SearchError> {
        let payload: BatchEmbedResponse = serde_json::from_value(json!({
            "embeddings": [ { "values": [0.1, 0.2] }, { "values": [0.3, 0.4] } ]
        }))?;
        let vectors = embedding_values(payload, 2, 2)?;
        assert_eq!(vectors, vec![vec![0.1, 0.2], vec![0.3, 0.4]]);

        let short: BatchEmbedResponse = serde_json::from_value(json!({
            "embeddings": [ { "values": [0.1] } ]
        }))?;
        assert!(matches!(
            embedding_values(short, 1, 2),
            Err(SearchError::DimensionMismatch { expected: 2, actual: 1 })
        ));
        Ok(())
    }

    #[test]
    fn long_error_bodies_are_truncated() {
        let body = "x".repeat(1_000);
        assert_eq!(snippet(&body).chars().count(), 301);
    }

    mod over_http {
        use super::super::*;
        use crate::embeddings::Embedder;
        use crate::traits::Generator;
        use axum::http::{HeaderMap, StatusCode, Uri};
        use axum::{Json, Router};
        use serde_json::Value;
        use std::sync::{Arc, Mutex};

        #[derive(Debug, Clone)]
        struct RecordedCall {
            path: String,
            api_key: Option<String>,
            body: Value,
        }

        type Reply = Arc<dyn Fn(&Value) -> (StatusCode, Value) + Send + Sync>;

        /// Local stand-in for the Gemini API; records every request it receives.
        async fn stub_server(reply: Reply) -> (String, Arc<Mutex<Vec<RecordedCall>>>) {
            let calls = Arc::new(Mutex::new(Vec::new()));
            let recorded = Arc::clone(&calls);
            let app = Router::new().fallback(
                move |uri: Uri, headers: HeaderMap, Json(body): Json<Value>| {
                    let calls = Arc::clone(&recorded);
                    let reply = Arc::clone(&reply);
                    async move {
                        let (status, payload) = reply(&body);
                        calls.lock().expect("lock").push(RecordedCall {
                            path: uri.path().to_string(),
                            api_key: headers
                                .get(API_KEY_HEADER)
                                .and_then(|value| value.to_str().ok())
                                .map(str::to_string),
                            body,
                        });
                        (status, Json(payload))
                    }
                },
            );

            let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
                .await
                .expect("bind stub");
            let address = listener.local_addr().expect("stub address");
            tokio::spawn(async move {
                let _ = axum::serve(listener, app).await;
            });
            (format!("http://{address}"), calls)
        }

        fn recorded(calls: &Arc<Mutex<Vec<RecordedCall>>>) -> Vec<RecordedCall> {
            calls.lock().expect("lock").clone()
        }

        #[tokio::test]
        async fn generate_sends_prompt_with_api_key_header() -> Result<(), SearchError> {
            let (base_url, calls) = stub_server(Arc::new(|_: &Value| {
                (
                    StatusCode::OK,
                    json!({ "candidates": [ { "content": { "parts": [
                        { "text": "La pression " },
                        { "text": "est de 8 bar." }
                    ] } } ] }),
                )
            }))
            .await;
            let client = GeminiClient::new(GeminiConfig::new(base_url, "test-key", DEFAULT_GENERATION_MODEL)?);

            let answer = client.generate("Contexte: ...\nQuestion: pression ?\n").await?;

            assert_eq!(answer, "La pression est de 8 bar.");
            let calls = recorded(&calls);
            assert_eq!(calls.len(), 1);
            assert_eq!(calls[0].path, "/v1beta/models/gemini-flash-latest:generateContent");
            assert_eq!(calls[0].api_key.as_deref(), Some("test-key"));
            assert_eq!(calls[0].body["contents"][0]["role"], "user");
            assert_eq!(
                calls[0].body["contents"][0]["parts"][0]["text"],
                "Contexte: ...\nQuestion: pression ?\n"
            );
            Ok(())
        }

        #[tokio::test]
        async fn generate_maps_error_status_to_backend_error() -> Result<(), SearchError> {
            let (base_url, _calls) = stub_server(Arc::new(|_: &Value| {
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    json!({ "error": { "message": "quota exhausted" } }),
                )
            }))
            .await;
            let client = GeminiClient::new(GeminiConfig::new(base_url, "test-key", DEFAULT_GENERATION_MODEL)?);

            let result = client.generate("anything").await;

            match result {
                Err(SearchError::BackendResponse { backend, details }) => {
                    assert_eq!(backend, "gemini");
                    assert!(details.contains("429"), "{details}");
                    assert!(details.contains("quota exhausted"), "{details}");
                }
                other => panic!("expected backend error, got {other:?}"),
            }
            Ok(())
        }

        #[tokio::test]
        async fn embed_batch_posts_requests_in_batches_of_one_hundred() -> Result<(), SearchError> {
            let (base_url, calls) = stub_server(Arc::new(|body: &Value| {
                let count = body["requests"].as_array().map(Vec::len).unwrap_or(0);
                let embeddings = (0..count)
                    .map(|_| json!({ "values": vec![0.5f32; GEMINI_EMBEDDING_DIMENSIONS] }))
                    .collect::<Vec<_>>();
                (StatusCode::OK, json!({ "embeddings": embeddings }))
            }))
            .await;
            let embedder = GeminiEmbedder::new(GeminiConfig::new(base_url, "test-key", DEFAULT_EMBEDDING_MODEL)?);
            let texts = (0..150).map(|index| format!("chunk {index}")).collect::<Vec<_>>();

            let vectors = embedder.embed_batch(&texts).await?;

            assert_eq!(vectors.len(), 150);
            assert!(vectors.iter().all(|vector| vector.len() == GEMINI_EMBEDDING_DIMENSIONS));
            let calls = recorded(&calls);
            assert_eq!(calls.len(), 2);
            for call in &calls {
                assert_eq!(call.path, "/v1beta/models/text-embedding-004:batchEmbedContents");
                assert_eq!(call.api_key.as_deref(), Some("test-key"));
            }
            let first = &calls[0].body["requests"];
            assert_eq!(first.as_array().map(Vec::len), Some(100));
            assert_eq!(calls[1].body["requests"].as_array().map(Vec::len), Some(50));
            assert_eq!(first[0]["model"], "models/text-embedding-004");
            assert_eq!(first[0]["content"]["parts"][0]["text"], "chunk 0");
            Ok(())
        }

        #[tokio::test]
        async fn embed_batch_rejects_short_vectors() -> Result<(), SearchError> {
            let (base_url, _calls) = stub_server(Arc::new(|_: &Value| {
                (StatusCode::OK, json!({ "embeddings": [ { "values": [0.1, 0.2] } ] }))
            }))
            .await;
            let embedder = GeminiEmbedder::new(GeminiConfig::new(base_url, "test-key", DEFAULT_EMBEDDING_MODEL)?);

            let result = embedder.embed("question").await;

            assert!(matches!(
                result,
                Err(SearchError::DimensionMismatch { expected: GEMINI_EMBEDDING_DIMENSIONS, actual: 2 })
            ));
            Ok(())
        }
    }
}
