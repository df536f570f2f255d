use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::{error_message, ImageInput, KeyedClient, ProviderKind, VisionProvider};
use crate::error::ProviderError;
use crate::models::{DescriptionResult, Prompt, TokenUsage};

const API_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 1024;

/// Anthropic Messages API
#[derive(Debug)]
pub struct ClaudeProvider {
    api_url: String,
    credentials: KeyedClient,
}

impl ClaudeProvider {
    pub fn new(api_key: Option<String>, timeout: Duration) -> Self {
        Self {
            api_url: API_URL.to_string(),
            credentials: KeyedClient::new(ProviderKind::Claude, api_key, timeout),
        }
    }
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    usage: Option<MessagesUsage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessagesUsage {
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
}

impl MessagesResponse {
    fn text(&self) -> String {
        self.content
            .iter()
            .filter(|b| b.kind == "text")
            .filter_map(|b| b.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_string()
    }
}

#[async_trait]
impl VisionProvider for ClaudeProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Claude
    }

    async fn is_available(&self) -> bool {
        self.credentials.is_ready()
    }

    async fn describe(
        &self,
        image: &ImageInput,
        prompt: &Prompt,
        model: &str,
    ) -> Result<DescriptionResult, ProviderError> {
        let (api_key, client) = self.credentials.ready_client()?;
        let started = Instant::now();

        debug!("正在调用 Claude API，模型: {}，图片: {}", model, image.file_name);

        let body = json!({
            "model": model,
            "max_tokens": MAX_TOKENS,
            "messages": [{
                "role": "user",
                "content": [
                    {
                        "type": "image",
                        "source": {
                            "type": "base64",
                            "media_type": image.mime_type,
                            "data": image.base64(),
                        }
                    },
                    { "type": "text", "text": prompt.text }
                ]
            }]
        });

        let response = client
            .post(&self.api_url)
            .header("x-api-key", api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            warn!("Claude API 调用失败: {} {}", status, image.file_name);
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message: error_message(&text),
            });
        }

        let parsed: MessagesResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;

        let text = parsed.text();
        if text.is_empty() {
            return Err(ProviderError::EmptyResponse);
        }

        let mut result = DescriptionResult::new(self.name(), model, prompt, text);
        result.duration_ms = started.elapsed().as_millis() as u64;
        result.usage = parsed.usage.map(|u| TokenUsage {
            prompt_tokens: u.input_tokens,
            completion_tokens: u.output_tokens,
        });
        Ok(result)
    }

    fn current_api_key(&self) -> Option<String> {
        self.credentials.api_key()
    }

    fn reload_credentials(&self, api_key: Option<String>) {
        self.credentials.reload(api_key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_text_joins_text_blocks() {
        let raw = r#"{"content":[{"type":"text","text":"A mug "},{"type":"tool_use","id":"x"},{"type":"text","text":"on a desk."}],
                      "usage":{"input_tokens":1500,"output_tokens":20}}"#;
        let parsed: MessagesResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.text(), "A mug \non a desk.");
        assert_eq!(parsed.usage.unwrap().output_tokens, Some(20));
    }

    #[tokio::test]
    async fn test_key_lifecycle() {
        let provider = ClaudeProvider::new(Some("sk-ant".into()), Duration::from_secs(5));
        assert!(provider.is_available().await);
        provider.reload_credentials(Some(String::new()));
        assert!(!provider.is_available().await);
        assert_eq!(provider.current_api_key(), None);
    }
}
