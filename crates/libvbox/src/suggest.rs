//! AI code suggestions.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::error::{VboxError, upstream};

const SYSTEM_PROMPT: &str = "You are an expert coding assistant who reads from an existing code file, and suggests code to add to the file. You may be given instructions on what to generate, which you should follow. You should generate code that is correct, efficient, and follows best practices. You should also generate code that is clear and easy to read.";

/// Everything the model needs to propose an insertion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuggestionRequest {
    pub file_name: String,
    pub code: String,
    pub line: u32,
    pub instructions: String,
}

#[async_trait]
pub trait SuggestionService: Send + Sync {
    /// Code to insert at the requested line.
    async fn suggest(&self, request: &SuggestionRequest) -> Result<String, VboxError>;
}

/// Chat-completion client for a hosted instruct model.
pub struct HttpSuggestionClient {
    client: reqwest::Client,
    url: String,
    token: String,
}

impl HttpSuggestionClient {
    pub fn new(client: reqwest::Client, url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
            token: token.into(),
        }
    }
}

#[derive(Deserialize)]
struct CompletionEnvelope {
    #[serde(default)]
    result: Option<CompletionResult>,
}

#[derive(Deserialize)]
struct CompletionResult {
    #[serde(default)]
    response: String,
}

#[async_trait]
impl SuggestionService for HttpSuggestionClient {
    async fn suggest(&self, request: &SuggestionRequest) -> Result<String, VboxError> {
        let envelope: CompletionEnvelope = self
            .client
            .post(&self.url)
            .bearer_auth(&self.token)
            .json(&json!({ "messages": build_messages(request) }))
            .send()
            .await
            .map_err(|e| upstream("code generation", e))?
            .error_for_status()
            .map_err(|e| upstream("code generation", e))?
            .json()
            .await
            .map_err(|e| upstream("code generation", e))?;
        envelope
            .result
            .map(|r| r.response)
            .ok_or_else(|| VboxError::UpstreamUnavailable("code generation: empty result".into()))
    }
}

/// Chat transcript sent to the model.
pub fn build_messages(request: &SuggestionRequest) -> Value {
    json!([
        { "role": "system", "content": SYSTEM_PROMPT },
        { "role": "user", "content": format!("The file is called {}.", request.file_name) },
        {
            "role": "user",
            "content": format!(
                "Here are my instructions on what to generate: {}.",
                request.instructions
            )
        },
        {
            "role": "user",
            "content": format!(
                "Suggest me code to insert at line {} in my file. Give only the code, and NOTHING else. DO NOT include backticks in your response. My code file content is as follows \n\n{}",
                request.line, request.code
            )
        }
    ])
}
