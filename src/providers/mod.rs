//! AI 提供方抽象
//!
//! 本地 Ollama 运行时不需要密钥；OpenAI、Claude 等云端提供方需要 API 密钥，
//! 密钥统一通过 [`crate::app::ResolvedConfig`] 分层解析。

mod claude;
mod credentials;
#[cfg(test)]
pub(crate) mod fake;
mod ollama;
mod openai;
mod registry;

pub use claude::ClaudeProvider;
pub use credentials::KeyedClient;
pub use ollama::OllamaProvider;
pub use openai::OpenAiProvider;
pub use registry::ProviderRegistry;

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::app::ResolvedConfig;
use crate::error::{ItemError, ProviderError};
use crate::models::{DescriptionResult, Prompt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Ollama,
    OpenAi,
    Claude,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 3] = [ProviderKind::Ollama, ProviderKind::OpenAi, ProviderKind::Claude];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Ollama => "ollama",
            ProviderKind::OpenAi => "openai",
            ProviderKind::Claude => "claude",
        }
    }

    pub fn requires_api_key(&self) -> bool {
        !matches!(self, ProviderKind::Ollama)
    }

    /// 本地模型可以开更多并发，云端接口有速率限制
    pub fn default_concurrency(&self) -> usize {
        match self {
            ProviderKind::Ollama => 4,
            ProviderKind::OpenAi | ProviderKind::Claude => 2,
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = ProviderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ollama" => Ok(ProviderKind::Ollama),
            "openai" => Ok(ProviderKind::OpenAi),
            "claude" | "anthropic" => Ok(ProviderKind::Claude),
            other => Err(ProviderError::Unsupported(other.to_string())),
        }
    }
}

/// 某次运行选定的提供方配置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    /// `None` 表示没有可用密钥（本地提供方本来就不需要）
    pub api_key: Option<String>,
    pub model: String,
    /// 有值即表示使用自定义提示词
    pub custom_prompt: Option<String>,
}

impl ProviderConfig {
    /// 通过同一个分层配置解析模型和密钥
    pub fn resolve(
        config: &ResolvedConfig,
        kind: ProviderKind,
        model: Option<&str>,
        explicit_key: Option<&str>,
        custom_prompt: Option<&str>,
    ) -> Self {
        let model = model
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| config.default_model(kind.as_str()));
        let api_key = if kind.requires_api_key() {
            config.api_key(kind.as_str(), explicit_key)
        } else {
            None
        };
        Self {
            kind,
            api_key,
            model,
            custom_prompt: custom_prompt
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string),
        }
    }
}

/// 交给提供方的图片
#[derive(Debug, Clone)]
pub struct ImageInput {
    pub file_name: String,
    pub mime_type: &'static str,
    pub data: Vec<u8>,
}

impl ImageInput {
    /// 识别图片格式，只接受各提供方都支持的 JPEG / PNG / GIF / WebP
    pub fn from_bytes(file_name: &str, data: Vec<u8>) -> Result<Self, ItemError> {
        let format = image::guess_format(&data)
            .map_err(|_| ItemError::UnsupportedFormat(file_name.to_string()))?;
        match format {
            image::ImageFormat::Jpeg
            | image::ImageFormat::Png
            | image::ImageFormat::Gif
            | image::ImageFormat::WebP => Ok(Self {
                file_name: file_name.to_string(),
                mime_type: format.to_mime_type(),
                data,
            }),
            other => Err(ItemError::UnsupportedFormat(format!(
                "{} ({:?}，请先运行 convert 步骤)",
                file_name, other
            ))),
        }
    }

    pub fn base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.data)
    }
}

/// 视觉描述提供方
#[async_trait]
pub trait VisionProvider: Send + Sync + fmt::Debug {
    fn kind(&self) -> ProviderKind;

    fn name(&self) -> &'static str {
        self.kind().as_str()
    }

    /// 云端：已解析到非空密钥且客户端已构造；本地：运行时探活成功
    async fn is_available(&self) -> bool;

    /// 为一张图片生成描述；不可用时返回 `ProviderError::Unavailable`
    async fn describe(
        &self,
        image: &ImageInput,
        prompt: &Prompt,
        model: &str,
    ) -> Result<DescriptionResult, ProviderError>;

    fn current_api_key(&self) -> Option<String> {
        None
    }

    /// 密钥变化时重新构造客户端
    fn reload_credentials(&self, _api_key: Option<String>) {}

    fn max_concurrency(&self) -> usize {
        self.kind().default_concurrency()
    }
}

/// 从错误响应体中提取可读信息
pub(crate) fn error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message")
                .or_else(|| v.get("error"))
                .and_then(|m| m.as_str().map(str::to_string))
        })
        .unwrap_or_else(|| body.chars().take(300).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::config::test_support::resolver;

    #[test]
    fn test_provider_kind_parse() {
        assert_eq!("Ollama".parse::<ProviderKind>().unwrap(), ProviderKind::Ollama);
        assert_eq!("anthropic".parse::<ProviderKind>().unwrap(), ProviderKind::Claude);
        assert!(matches!(
            "gemini".parse::<ProviderKind>(),
            Err(ProviderError::Unsupported(name)) if name == "gemini"
        ));
    }

    #[test]
    fn test_provider_config_uses_resolver_defaults() {
        let cfg = resolver(&[("OPENAI_API_KEY", "sk-env")], None).load();
        let pc = ProviderConfig::resolve(&cfg, ProviderKind::OpenAi, None, None, Some("  "));
        assert_eq!(pc.model, "gpt-4o-mini");
        assert_eq!(pc.api_key.as_deref(), Some("sk-env"));
        assert_eq!(pc.custom_prompt, None);

        let pc = ProviderConfig::resolve(&cfg, ProviderKind::Ollama, Some("llava:13b"), Some("sk-x"), None);
        assert_eq!(pc.model, "llava:13b");
        assert_eq!(pc.api_key, None);
    }

    #[test]
    fn test_image_input_detects_format() {
        let mut png = Vec::new();
        image::RgbImage::from_pixel(2, 2, image::Rgb([1, 2, 3]))
            .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();
        let input = ImageInput::from_bytes("x.png", png).unwrap();
        assert_eq!(input.mime_type, "image/png");
        assert!(!input.base64().is_empty());

        assert!(matches!(
            ImageInput::from_bytes("notes.jpg", b"hello".to_vec()),
            Err(ItemError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_error_message_extraction() {
        assert_eq!(error_message(r#"{"error":{"message":"bad key"}}"#), "bad key");
        assert_eq!(error_message(r#"{"error":"model not found"}"#), "model not found");
        assert_eq!(error_message("plain"), "plain");
    }
}
