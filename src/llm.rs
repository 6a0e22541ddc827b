//! Ollama text generation behind the core [`LanguageModel`] trait.
//!
//! Used for answer generation in `arag ask` and by the LLM judge.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use adaptive_rag_core::judge::LanguageModel;
use adaptive_rag_core::RetrievalError;

use crate::config::LlmConfig;

const OLLAMA_DEFAULT_URL: &str = "http://localhost:11434";

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

pub struct OllamaModel {
    url: String,
    model: String,
    client: reqwest::Client,
}

impl OllamaModel {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .context("llm.model required for Ollama provider")?;
        let base = config.url.as_deref().unwrap_or(OLLAMA_DEFAULT_URL);
        Ok(Self {
            url: format!("{}/api/generate", base.trim_end_matches('/')),
            model,
            client: crate::http::client(config.timeout_secs)?,
        })
    }

    async fn call(&self, prompt: &str) -> Result<String> {
        let req = GenerateRequest {
            model: &self.model,
            prompt,
            stream: false,
        };

        let resp = self
            .client
            .post(&self.url)
            .json(&req)
            .send()
            .await
            .context("Failed to call Ollama generate API")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!("Ollama generate API returned {status}: {body}");
        }

        let body: GenerateResponse = resp.json().await?;
        Ok(body.response)
    }
}

#[async_trait]
impl LanguageModel for OllamaModel {
    fn name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str) -> Result<String, RetrievalError> {
        self.call(prompt)
            .await
            .map_err(|e| RetrievalError::provider("ollama", format!("{:#}", e)))
    }
}

/// Build the configured model; `None` when disabled.
pub fn create_language_model(config: &LlmConfig) -> Result<Option<Arc<dyn LanguageModel>>> {
    match config.provider.as_str() {
        "disabled" => Ok(None),
        "ollama" => Ok(Some(Arc::new(OllamaModel::new(config)?))),
        other => bail!("Unknown LLM provider: {}", other),
    }
}
