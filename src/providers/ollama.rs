use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::{error_message, ImageInput, ProviderKind, VisionProvider};
use crate::error::ProviderError;
use crate::models::{DescriptionResult, Prompt, TokenUsage};

pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// 本地 Ollama 运行时，不需要密钥
#[derive(Debug)]
pub struct OllamaProvider {
    base_url: String,
    client: Result<reqwest::Client, String>,
}

impl OllamaProvider {
    pub fn new(base_url: Option<&str>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| e.to_string());
        Self {
            base_url: base_url
                .unwrap_or(DEFAULT_OLLAMA_URL)
                .trim_end_matches('/')
                .to_string(),
            client,
        }
    }

    fn unavailable(&self, reason: impl Into<String>) -> ProviderError {
        ProviderError::Unavailable {
            provider: ProviderKind::Ollama.to_string(),
            reason: reason.into(),
        }
    }

    fn client(&self) -> Result<&reqwest::Client, ProviderError> {
        self.client
            .as_ref()
            .map_err(|e| self.unavailable(format!("构造客户端失败: {}", e)))
    }
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
    prompt_eval_count: Option<u64>,
    eval_count: Option<u64>,
}

#[async_trait]
impl VisionProvider for OllamaProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Ollama
    }

    async fn is_available(&self) -> bool {
        let Ok(client) = self.client() else {
            return false;
        };
        match client
            .get(format!("{}/api/tags", self.base_url))
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!("Ollama 探活失败 {}: {}", self.base_url, e);
                false
            }
        }
    }

    async fn describe(
        &self,
        image: &ImageInput,
        prompt: &Prompt,
        model: &str,
    ) -> Result<DescriptionResult, ProviderError> {
        let client = self.client()?;
        let started = Instant::now();

        debug!("正在调用 Ollama，模型: {}，图片: {}", model, image.file_name);

        let body = json!({
            "model": model,
            "prompt": prompt.text,
            "images": [image.base64()],
            "stream": false,
        });

        let response = client
            .post(format!("{}/api/generate", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    self.unavailable(format!("无法连接 {}", self.base_url))
                } else {
                    ProviderError::from(e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            warn!("Ollama 调用失败: {} {}", status, image.file_name);
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message: error_message(&text),
            });
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;

        let text = parsed.response.trim().to_string();
        if text.is_empty() {
            return Err(ProviderError::EmptyResponse);
        }

        let mut result = DescriptionResult::new(self.name(), model, prompt, text);
        result.duration_ms = started.elapsed().as_millis() as u64;
        if parsed.prompt_eval_count.is_some() || parsed.eval_count.is_some() {
            result.usage = Some(TokenUsage {
                prompt_tokens: parsed.prompt_eval_count,
                completion_tokens: parsed.eval_count,
            });
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_normalized() {
        let provider = OllamaProvider::new(Some("http://gpu-box:11434/"), Duration::from_secs(5));
        assert_eq!(provider.base_url, "http://gpu-box:11434");
        assert_eq!(provider.max_concurrency(), 4);
        assert_eq!(provider.current_api_key(), None);
    }

    #[test]
    fn test_parse_generate_response() {
        let raw = r#"{"model":"moondream","response":" A red barn. ","done":true,"prompt_eval_count":740,"eval_count":12}"#;
        let parsed: GenerateResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.response.trim(), "A red barn.");
        assert_eq!(parsed.eval_count, Some(12));
    }

    #[tokio::test]
    async fn test_unreachable_runtime_is_unavailable() {
        // 端口 9 (discard) 在测试环境下不会有 Ollama
        let provider = OllamaProvider::new(Some("http://127.0.0.1:9"), Duration::from_secs(2));
        assert!(!provider.is_available().await);
    }
}
