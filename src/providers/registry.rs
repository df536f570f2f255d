use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

use super::{
    ClaudeProvider, OllamaProvider, OpenAiProvider, ProviderConfig, ProviderKind, VisionProvider,
};
use crate::app::ResolvedConfig;
use crate::error::ProviderError;

/// 按名称查找提供方；同一次运行中共享同一个实例
#[derive(Debug, Clone, Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<ProviderKind, Arc<dyn VisionProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 根据配置构造所有内置提供方
    pub fn from_config(config: &ResolvedConfig) -> Self {
        let timeout = config.item_timeout();
        let mut registry = Self::new();
        registry.register(Arc::new(OllamaProvider::new(
            Some(&config.ollama_url()),
            timeout,
        )));
        registry.register(Arc::new(OpenAiProvider::new(
            config.api_key(ProviderKind::OpenAi.as_str(), None),
            Some(&config.openai_base_url()),
            timeout,
        )));
        registry.register(Arc::new(ClaudeProvider::new(
            config.api_key(ProviderKind::Claude.as_str(), None),
            timeout,
        )));
        registry
    }

    /// 同类提供方后注册的覆盖先注册的
    pub fn register(&mut self, provider: Arc<dyn VisionProvider>) {
        self.providers.insert(provider.kind(), provider);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn VisionProvider>, ProviderError> {
        let kind: ProviderKind = name.parse()?;
        self.get_kind(kind)
    }

    pub fn get_kind(&self, kind: ProviderKind) -> Result<Arc<dyn VisionProvider>, ProviderError> {
        self.providers
            .get(&kind)
            .cloned()
            .ok_or_else(|| ProviderError::Unsupported(kind.to_string()))
    }

    pub fn providers(&self) -> impl Iterator<Item = &Arc<dyn VisionProvider>> {
        self.providers.values()
    }

    /// 重新解析所有云端提供方的密钥，与当前不同即重建客户端
    ///
    /// 选中的提供方使用 `selected.api_key`（可能来自命令行），其余只看配置层。
    /// 返回重建的数量。
    pub fn refresh_credentials(&self, config: &ResolvedConfig, selected: &ProviderConfig) -> usize {
        let mut reloaded = 0;
        for provider in self.providers.values() {
            let kind = provider.kind();
            if !kind.requires_api_key() {
                continue;
            }
            let resolved = if kind == selected.kind {
                selected.api_key.clone()
            } else {
                config.api_key(kind.as_str(), None)
            };
            if provider.current_api_key() != resolved {
                info!(
                    "🔑 {} 的密钥已变化，重建客户端（{}）",
                    kind,
                    if resolved.is_some() { "已配置" } else { "已移除" }
                );
                provider.reload_credentials(resolved);
                reloaded += 1;
            }
        }
        reloaded
    }

    /// 并发探测所有提供方
    pub async fn availability(&self) -> Vec<(ProviderKind, bool)> {
        let checks = self
            .providers
            .values()
            .map(|p| async move { (p.kind(), p.is_available().await) });
        futures::future::join_all(checks).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::config::test_support::resolver;
    use crate::models::Prompt;
    use crate::providers::fake::FakeProvider;
    use crate::providers::ImageInput;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// 本地假接口：接受一个请求，原样返回请求文本，回复固定 JSON
    async fn stub_endpoint(body: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                let n = socket.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
                let text = String::from_utf8_lossy(&buf);
                if let Some(end) = text.find("\r\n\r\n") {
                    let length = text[..end]
                        .lines()
                        .filter_map(|l| l.split_once(':'))
                        .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
                        .and_then(|(_, v)| v.trim().parse::<usize>().ok())
                        .unwrap_or(0);
                    if buf.len() >= end + 4 + length {
                        break;
                    }
                }
            }
            let response = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            String::from_utf8_lossy(&buf).into_owned()
        });
        (format!("http://{}/v1", addr), handle)
    }

    #[test]
    fn test_unknown_name_is_unsupported() {
        let registry = ProviderRegistry::from_config(&resolver(&[], None).load());
        assert!(matches!(registry.get("gemini"), Err(ProviderError::Unsupported(_))));
        assert_eq!(registry.get("OLLAMA").unwrap().kind(), ProviderKind::Ollama);
        assert_eq!(registry.providers().count(), 3);
    }

    #[test]
    fn test_missing_registration_is_unsupported() {
        let registry = ProviderRegistry::new();
        assert!(matches!(registry.get("claude"), Err(ProviderError::Unsupported(name)) if name == "claude"));
    }

    #[tokio::test]
    async fn test_user_layer_key_makes_cloud_available() {
        let dir = crate::utils::files::test_support::temp_dir("registry-user");
        std::fs::write(dir.join("claude_api_key.txt"), "sk-ant-user\n").unwrap();
        let config = resolver(&[], Some(&dir)).load();

        let registry = ProviderRegistry::from_config(&config);
        let claude = registry.get("claude").unwrap();
        assert!(claude.is_available().await);
        assert!(!registry.get("openai").unwrap().is_available().await);
        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn test_user_layer_key_describes_with_openai() {
        let (base_url, request) = stub_endpoint(
            r#"{"choices":[{"message":{"role":"assistant","content":" A red square. "}}],"usage":{"prompt_tokens":85,"completion_tokens":4}}"#,
        )
        .await;
        let dir = crate::utils::files::test_support::temp_dir("registry-openai");
        std::fs::write(dir.join("openai_api_key.txt"), "sk-user-layer\n").unwrap();
        let config = resolver(&[("OPENAI_BASE_URL", base_url.as_str())], Some(&dir)).load();

        let registry = ProviderRegistry::from_config(&config);
        let openai = registry.get("openai").unwrap();
        assert!(openai.is_available().await);

        let mut png = Vec::new();
        image::RgbImage::from_pixel(4, 4, image::Rgb([255, 0, 0]))
            .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();
        let image = ImageInput::from_bytes("red.png", png).unwrap();
        let prompt = Prompt {
            style: "concise".into(),
            text: "Describe this image.".into(),
        };
        let result = openai.describe(&image, &prompt, "gpt-4o-mini").await.unwrap();

        assert_eq!(result.provider, "openai");
        assert_eq!(result.model, "gpt-4o-mini");
        assert_eq!(result.description, "A red square.");
        assert_eq!(result.prompt_style, "concise");
        assert_eq!(result.usage.unwrap().completion_tokens, Some(4));

        let request = request.await.unwrap();
        assert!(request.starts_with("POST /v1/chat/completions "));
        assert!(request
            .to_ascii_lowercase()
            .contains("authorization: bearer sk-user-layer"));
        assert!(request.contains(r#""model":"gpt-4o-mini""#));
        assert!(request.contains("Describe this image."));
        assert!(request.contains("data:image/png;base64,"));
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_refresh_reloads_only_on_change() {
        let config = resolver(&[("OPENAI_API_KEY", "sk-env")], None).load();
        let openai = Arc::new(FakeProvider::new(ProviderKind::OpenAi).with_api_key("sk-env"));
        let claude = Arc::new(FakeProvider::new(ProviderKind::Claude).with_api_key("sk-old"));
        let mut registry = ProviderRegistry::new();
        registry.register(openai.clone());
        registry.register(claude.clone());
        registry.register(Arc::new(FakeProvider::new(ProviderKind::Ollama)));

        // openai 不变，claude 在配置中已移除
        let selected = ProviderConfig::resolve(&config, ProviderKind::OpenAi, None, None, None);
        assert_eq!(registry.refresh_credentials(&config, &selected), 1);
        assert_eq!(openai.reloads(), 0);
        assert_eq!(claude.reloads(), 1);
        assert_eq!(claude.current_api_key(), None);

        // 命令行显式密钥只作用于选中的提供方
        let selected = ProviderConfig::resolve(&config, ProviderKind::OpenAi, None, Some("sk-cli"), None);
        assert_eq!(registry.refresh_credentials(&config, &selected), 1);
        assert_eq!(openai.current_api_key().as_deref(), Some("sk-cli"));
        assert_eq!(claude.reloads(), 1);
    }
}
