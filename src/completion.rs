//! Completion client for specialist and companion invocations
//!
//! Specialist prompt execution is an opaque capability call: either an HTTP
//! backend or a deterministic local stub used for development and tests.

use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// HTTP completion backend
#[derive(Clone)]
pub struct HttpCompletionClient {
    client: Client,
    base_url: String,
}

impl HttpCompletionClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
        }
    }

    pub async fn complete(&self, system_prompt: &str, user_input: &str) -> Result<String> {
        let response = self
            .client
            .post(format!("{}/complete", self.base_url))
            .json(&CompletionRequest {
                system_prompt,
                user_input,
            })
            .send()
            .await
            .map_err(|e| AppError::Completion(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(AppError::Completion(format!(
                "Completion request failed: {} - {}",
                status, text
            )));
        }

        let body: CompletionResponse = response
            .json()
            .await
            .map_err(|e| AppError::Completion(e.to_string()))?;
        Ok(body.output)
    }
}

/// Backend selection for completion calls
#[derive(Clone)]
pub enum CompletionClient {
    Http(HttpCompletionClient),
    /// Deterministic echo used for development and tests
    Stub,
}

impl CompletionClient {
    pub fn http(base_url: impl Into<String>) -> Self {
        CompletionClient::Http(HttpCompletionClient::new(base_url))
    }

    pub async fn complete(&self, system_prompt: &str, user_input: &str) -> Result<String> {
        match self {
            CompletionClient::Http(client) => client.complete(system_prompt, user_input).await,
            CompletionClient::Stub => Ok(format!("[{}] {}", system_prompt, user_input)),
        }
    }
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    system_prompt: &'a str,
    user_input: &'a str,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    output: String,
}
