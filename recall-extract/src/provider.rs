//! LLM provider abstraction for memory extraction.
//!
//! Selected via `EXTRACT_PROVIDER` (`anthropic`, `openai`, `ollama`; empty
//! disables extraction) and `EXTRACT_MODEL`. Anthropic accepts both standard
//! API keys and OAuth subscription tokens (`sk-ant-oat01-`), the latter
//! refreshed against a fixed grant endpoint and sent as Bearer auth with the
//! required beta headers.

use async_trait::async_trait;
use recall_core::{RecallError, Result, env_str};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";

const OAUTH_CLIENT_ID: &str = "9d1c250a-e61b-44d9-88ed-5944d1962f5e";
const OAUTH_TOKEN_URL: &str = "https://console.anthropic.com/v1/oauth/token";
const OAUTH_BETAS: &str = "oauth-2025-04-20,interleaved-thinking-2025-05-14";

const MAX_COMPLETION_TOKENS: u32 = 1024;

/// Result from an LLM completion, including token usage.
#[derive(Debug, Clone, Default)]
pub struct Completion {
    pub text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Capability contract for extraction providers.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn provider_name(&self) -> &str;

    fn model(&self) -> &str;

    /// Whether the provider can run the AUDN decision call. Providers
    /// reporting `false` fall back to the engine's novelty check.
    fn supports_audn(&self) -> bool {
        true
    }

    /// Send a completion request.
    async fn complete(&self, system: &str, user: &str) -> Result<Completion>;

    /// Check if the provider is reachable and working.
    async fn health_check(&self) -> bool {
        self.complete("Reply with OK", "health check").await.is_ok()
    }
}

/// Factory: create a provider from environment variables. `None` when
/// `EXTRACT_PROVIDER` is unset (extraction disabled).
pub fn provider_from_env() -> Result<Option<Arc<dyn LlmProvider>>> {
    let Some(name) = env_str("EXTRACT_PROVIDER") else {
        return Ok(None);
    };
    let model = env_str("EXTRACT_MODEL");

    let provider: Arc<dyn LlmProvider> = match name.to_lowercase().as_str() {
        "anthropic" => {
            let api_key = env_str("ANTHROPIC_API_KEY").ok_or_else(|| {
                RecallError::config("ANTHROPIC_API_KEY required when EXTRACT_PROVIDER=anthropic")
            })?;
            Arc::new(AnthropicProvider::new(api_key, model))
        }
        "openai" => {
            let api_key = env_str("OPENAI_API_KEY").ok_or_else(|| {
                RecallError::config("OPENAI_API_KEY required when EXTRACT_PROVIDER=openai")
            })?;
            Arc::new(OpenAiProvider::new(api_key, model))
        }
        "ollama" => Arc::new(OllamaProvider::new(env_str("OLLAMA_URL"), model)?),
        other => {
            return Err(RecallError::config(format!(
                "Unknown EXTRACT_PROVIDER: {other:?}. Use: anthropic, openai, or ollama"
            )));
        }
    };
    info!(
        provider = provider.provider_name(),
        model = provider.model(),
        "Extraction enabled"
    );
    Ok(Some(provider))
}

// ---------------------------------------------------------------------------
// Anthropic
// ---------------------------------------------------------------------------

/// Tracks OAuth access/refresh tokens and expiry for subscription tokens.
struct OAuthState {
    access_token: String,
    refresh_token: Option<String>,
    expires_at: Option<Instant>,
}

impl OAuthState {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

pub struct AnthropicProvider {
    model: String,
    api_key: String,
    oauth: Option<Mutex<OAuthState>>,
    client: Client,
}

#[derive(Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContent>,
    #[serde(default)]
    usage: AnthropicUsage,
}

#[derive(Deserialize)]
struct AnthropicContent {
    #[serde(default)]
    text: String,
}

#[derive(Deserialize, Default)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[derive(Deserialize)]
struct OAuthTokenResponse {
    access_token: String,
    refresh_token: String,
    expires_in: u64,
}

impl AnthropicProvider {
    pub fn new(api_key: String, model: Option<String>) -> Self {
        let oauth = api_key.starts_with("sk-ant-oat01-").then(|| {
            info!("Using OAuth subscription token with Bearer transport");
            Mutex::new(OAuthState {
                access_token: api_key.clone(),
                refresh_token: None,
                expires_at: None,
            })
        });
        Self {
            model: model.unwrap_or_else(|| "claude-haiku-4-5-20251001".to_string()),
            api_key,
            oauth,
            client: Client::new(),
        }
    }

    async fn refresh_oauth(&self, state: &mut OAuthState) -> bool {
        let Some(refresh_token) = state.refresh_token.clone() else {
            return false;
        };
        let response = self
            .client
            .post(OAUTH_TOKEN_URL)
            .json(&json!({
                "grant_type": "refresh_token",
                "refresh_token": refresh_token,
                "client_id": OAUTH_CLIENT_ID,
            }))
            .timeout(Duration::from_secs(10))
            .send()
            .await;
        match response {
            Ok(response) if response.status().is_success() => {
                match response.json::<OAuthTokenResponse>().await {
                    Ok(tokens) => {
                        state.access_token = tokens.access_token;
                        state.refresh_token = Some(tokens.refresh_token);
                        state.expires_at =
                            Some(Instant::now() + Duration::from_secs(tokens.expires_in));
                        info!("OAuth token refreshed successfully");
                        true
                    }
                    Err(e) => {
                        warn!("OAuth token refresh decode failed: {e}");
                        false
                    }
                }
            }
            Ok(response) => {
                warn!("OAuth token refresh failed: {}", response.status());
                false
            }
            Err(e) => {
                warn!("OAuth token refresh failed: {e}");
                false
            }
        }
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn provider_name(&self) -> &str {
        "anthropic"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, system: &str, user: &str) -> Result<Completion> {
        let body = json!({
            "model": self.model,
            "max_tokens": MAX_COMPLETION_TOKENS,
            "system": system,
            "messages": [{"role": "user", "content": user}],
        });

        let mut request = match &self.oauth {
            Some(oauth) => {
                let mut state = oauth.lock().await;
                if state.is_expired() {
                    self.refresh_oauth(&mut state).await;
                }
                self.client
                    .post(format!("{ANTHROPIC_API_URL}?beta=true"))
                    .bearer_auth(&state.access_token)
                    .header("anthropic-beta", OAUTH_BETAS)
            }
            None => self
                .client
                .post(ANTHROPIC_API_URL)
                .header("x-api-key", &self.api_key),
        };
        request = request
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body);

        let response = request
            .send()
            .await
            .map_err(|e| RecallError::provider(format!("anthropic request: {e}")))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(RecallError::provider(format!(
                "anthropic API error {status}: {}",
                body.chars().take(300).collect::<String>()
            )));
        }

        let parsed: AnthropicResponse = response
            .json()
            .await
            .map_err(|e| RecallError::provider(format!("anthropic decode: {e}")))?;
        let text = parsed
            .content
            .first()
            .map(|content| content.text.clone())
            .unwrap_or_default();
        Ok(Completion {
            text,
            input_tokens: parsed.usage.input_tokens,
            output_tokens: parsed.usage.output_tokens,
        })
    }
}

// ---------------------------------------------------------------------------
// OpenAI
// ---------------------------------------------------------------------------

pub struct OpenAiProvider {
    model: String,
    api_key: String,
    client: Client,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: ChatUsage,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: String,
}

#[derive(Deserialize, Default)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

impl OpenAiProvider {
    pub fn new(api_key: String, model: Option<String>) -> Self {
        Self {
            model: model.unwrap_or_else(|| "gpt-4.1-nano".to_string()),
            api_key,
            client: Client::new(),
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn provider_name(&self) -> &str {
        "openai"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, system: &str, user: &str) -> Result<Completion> {
        let response = self
            .client
            .post(OPENAI_API_URL)
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": self.model,
                "messages": [
                    {"role": "system", "content": system},
                    {"role": "user", "content": user},
                ],
                "max_tokens": MAX_COMPLETION_TOKENS,
            }))
            .send()
            .await
            .map_err(|e| RecallError::provider(format!("openai request: {e}")))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(RecallError::provider(format!(
                "openai API error {status}: {}",
                body.chars().take(300).collect::<String>()
            )));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| RecallError::provider(format!("openai decode: {e}")))?;
        let text = parsed
            .choices
            .first()
            .map(|choice| choice.message.content.clone())
            .unwrap_or_default();
        Ok(Completion {
            text,
            input_tokens: parsed.usage.prompt_tokens,
            output_tokens: parsed.usage.completion_tokens,
        })
    }
}

// ---------------------------------------------------------------------------
// Ollama
// ---------------------------------------------------------------------------

pub struct OllamaProvider {
    base_url: String,
    model: String,
    client: Client,
}

#[derive(Deserialize)]
struct OllamaResponse {
    #[serde(default)]
    response: String,
    #[serde(default)]
    prompt_eval_count: u64,
    #[serde(default)]
    eval_count: u64,
}

impl OllamaProvider {
    pub fn new(base_url: Option<String>, model: Option<String>) -> Result<Self> {
        let base_url = base_url
            .unwrap_or_else(|| "http://host.docker.internal:11434".to_string())
            .trim_end_matches('/')
            .to_string();
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(RecallError::config(format!(
                "Invalid OLLAMA_URL scheme in {base_url:?} (must be http or https)"
            )));
        }
        Ok(Self {
            base_url,
            model: model.unwrap_or_else(|| "gemma3:4b".to_string()),
            client: Client::new(),
        })
    }
}

#[async_trait]
impl LlmProvider for OllamaProvider {
    fn provider_name(&self) -> &str {
        "ollama"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, system: &str, user: &str) -> Result<Completion> {
        let response = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .timeout(Duration::from_secs(60))
            .json(&json!({
                "model": self.model,
                "system": system,
                "prompt": user,
                "stream": false,
                "format": "json",
            }))
            .send()
            .await
            .map_err(|e| RecallError::provider(format!("ollama request: {e}")))?;
        if !response.status().is_success() {
            return Err(RecallError::provider(format!(
                "ollama API error {}",
                response.status()
            )));
        }
        let parsed: OllamaResponse = response
            .json()
            .await
            .map_err(|e| RecallError::provider(format!("ollama decode: {e}")))?;
        Ok(Completion {
            text: parsed.response,
            input_tokens: parsed.prompt_eval_count,
            output_tokens: parsed.eval_count,
        })
    }

    async fn health_check(&self) -> bool {
        self.client
            .get(format!("{}/api/tags", self.base_url))
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map(|response| response.status().is_success())
            .unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// Mock (tests and local harnesses)
// ---------------------------------------------------------------------------

/// Scripted provider: pops one canned response per `complete` call.
pub struct MockProvider {
    model: String,
    supports_audn: bool,
    responses: Mutex<VecDeque<String>>,
}

impl MockProvider {
    pub fn new(responses: Vec<&str>, supports_audn: bool) -> Self {
        Self {
            model: "mock-model".to_string(),
            supports_audn,
            responses: Mutex::new(responses.into_iter().map(str::to_owned).collect()),
        }
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    fn provider_name(&self) -> &str {
        "mock"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn supports_audn(&self) -> bool {
        self.supports_audn
    }

    async fn complete(&self, _system: &str, _user: &str) -> Result<Completion> {
        let text = self
            .responses
            .lock()
            .await
            .pop_front()
            .ok_or_else(|| RecallError::provider("mock provider exhausted"))?;
        Ok(Completion {
            text,
            input_tokens: 10,
            output_tokens: 5,
        })
    }

    async fn health_check(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ollama_rejects_bad_scheme() {
        assert!(OllamaProvider::new(Some("ftp://nope".to_string()), None).is_err());
        assert!(OllamaProvider::new(Some("http://localhost:11434/".to_string()), None).is_ok());
    }

    #[tokio::test]
    async fn test_mock_provider_scripts() {
        let provider = MockProvider::new(vec!["first", "second"], true);
        assert_eq!(provider.complete("s", "u").await.unwrap().text, "first");
        assert_eq!(provider.complete("s", "u").await.unwrap().text, "second");
        assert!(provider.complete("s", "u").await.is_err());
    }

    #[test]
    fn test_anthropic_oauth_detection() {
        let plain = AnthropicProvider::new("sk-ant-api03-abc".to_string(), None);
        assert!(plain.oauth.is_none());
        let oauth = AnthropicProvider::new("sk-ant-oat01-abc".to_string(), None);
        assert!(oauth.oauth.is_some());
    }
}
