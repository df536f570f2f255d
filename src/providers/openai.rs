use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::{error_message, ImageInput, KeyedClient, ProviderKind, VisionProvider};
use crate::error::ProviderError;
use crate::models::{DescriptionResult, Prompt, TokenUsage};

// OpenAI 默认参数
pub const API_BASE_URL: &str = "https://api.openai.com/v1";
const MAX_TOKENS: u32 = 1000;
const IMAGE_DETAIL: &str = "auto";

/// OpenAI chat completions 视觉接口
#[derive(Debug)]
pub struct OpenAiProvider {
    /// API 基础 URL，兼容 OpenAI 协议的网关也可以
    api_base_url: String,
    credentials: KeyedClient,
    max_tokens: u32,
}

impl OpenAiProvider {
    pub fn new(api_key: Option<String>, api_base_url: Option<&str>, timeout: Duration) -> Self {
        Self {
            api_base_url: api_base_url
                .unwrap_or(API_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            credentials: KeyedClient::new(ProviderKind::OpenAi, api_key, timeout),
            max_tokens: MAX_TOKENS,
        }
    }

    pub fn reload_count(&self) -> u64 {
        self.credentials.reload_count()
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
}

#[async_trait]
impl VisionProvider for OpenAiProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAi
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

        debug!("正在调用 OpenAI API，模型: {}，图片: {}", model, image.file_name);

        let body = json!({
            "model": model,
            "max_tokens": self.max_tokens,
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": prompt.text },
                    {
                        "type": "image_url",
                        "image_url": {
                            "url": format!("data:{};base64,{}", image.mime_type, image.base64()),
                            "detail": IMAGE_DETAIL,
                        }
                    }
                ]
            }]
        });

        let response = client
            .post(format!("{}/chat/completions", self.api_base_url))
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            warn!("OpenAI API 调用失败: {} {}", status, image.file_name);
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message: error_message(&text),
            });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .ok_or(ProviderError::EmptyResponse)?;

        debug!("OpenAI API 调用成功: {}", image.file_name);

        let mut result = DescriptionResult::new(self.name(), model, prompt, content);
        result.duration_ms = started.elapsed().as_millis() as u64;
        result.usage = parsed.usage.map(|u| TokenUsage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
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

    fn sample_image() -> ImageInput {
        ImageInput {
            file_name: "a.jpg".into(),
            mime_type: "image/jpeg",
            data: vec![0xff, 0xd8, 0xff],
        }
    }

    fn prompt() -> Prompt {
        Prompt {
            style: "concise".into(),
            text: "Describe.".into(),
        }
    }

    #[tokio::test]
    async fn test_without_key_is_unavailable() {
        let provider = OpenAiProvider::new(None, None, Duration::from_secs(5));
        assert!(!provider.is_available().await);
        let err = provider
            .describe(&sample_image(), &prompt(), "gpt-4o-mini")
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Unavailable { .. }));
    }

    #[tokio::test]
    async fn test_reload_makes_available() {
        let provider = OpenAiProvider::new(None, Some("http://localhost:9/v1/"), Duration::from_secs(5));
        provider.reload_credentials(Some("sk-test".into()));
        assert!(provider.is_available().await);
        assert_eq!(provider.current_api_key().as_deref(), Some("sk-test"));
        assert_eq!(provider.api_base_url, "http://localhost:9/v1");
        assert_eq!(provider.reload_count(), 1);
    }

    #[test]
    fn test_parse_chat_response() {
        let raw = r#"{"choices":[{"message":{"role":"assistant","content":" A cat. "}}],
                      "usage":{"prompt_tokens":812,"completion_tokens":14,"total_tokens":826}}"#;
        let parsed: ChatResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.choices[0].message.content.as_deref(), Some(" A cat. "));
        assert_eq!(parsed.usage.unwrap().prompt_tokens, Some(812));
    }
}
