use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use crate::models::Prompt;

pub const CONFIG_FILE_NAME: &str = "image_describer.toml";
pub const APP_DIR_NAME: &str = "image_describer";

/// 编译时嵌入的模板配置，所有文件层都缺失时兜底
const EMBEDDED_TEMPLATE: &str = include_str!("../../config/image_describer.toml");

const FALLBACK_PROMPT_TEXT: &str = "Describe this image in detail.";

// ============================================================================
// 部署形态
// ============================================================================

/// 运行形态：从源码树运行（cargo run / 测试）还是作为安装后的独立程序运行
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeploymentMode {
    Source,
    Bundled,
}

impl DeploymentMode {
    pub fn detect() -> Self {
        let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
        match std::env::current_exe() {
            Ok(exe) if manifest_dir.is_dir() && exe.starts_with(manifest_dir) => {
                DeploymentMode::Source
            }
            _ => DeploymentMode::Bundled,
        }
    }

    /// 模板配置所在目录：源码模式在仓库的 config/，安装模式在可执行文件旁的 config/
    pub fn template_dir(&self) -> Option<PathBuf> {
        match self {
            DeploymentMode::Source => Some(Path::new(env!("CARGO_MANIFEST_DIR")).join("config")),
            DeploymentMode::Bundled => std::env::current_exe()
                .ok()
                .and_then(|exe| exe.parent().map(|dir| dir.join("config"))),
        }
    }
}

// ============================================================================
// 单层配置文件
// ============================================================================

/// 一层配置，所有字段都可缺省，缺省时由下一层补齐
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ConfigFile {
    pub default_provider: Option<String>,
    pub default_model: Option<String>,
    pub default_prompt_style: Option<String>,
    pub models: BTreeMap<String, String>,
    pub prompt_variations: BTreeMap<String, String>,
    pub api_keys: BTreeMap<String, String>,
    pub max_workers: Option<usize>,
    pub item_timeout_secs: Option<u64>,
    pub download_delay_ms: Option<u64>,
    pub video_frame_interval_secs: Option<f64>,
    pub max_image_dimension: Option<u32>,
    pub jpeg_quality: Option<u8>,
    pub output_root: Option<PathBuf>,
    pub ollama_url: Option<String>,
    pub openai_base_url: Option<String>,
    pub ffmpeg_path: Option<PathBuf>,
}

impl ConfigFile {
    pub fn parse(raw: &str) -> Result<Self> {
        toml::from_str(raw).context("解析配置内容失败")
    }

    /// 读取配置文件，文件不存在时返回 `Ok(None)`
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("读取配置文件失败: {}", path.display()))?;
        let cfg: ConfigFile = toml::from_str(&raw)
            .with_context(|| format!("解析配置文件失败: {}", path.display()))?;
        Ok(Some(cfg))
    }

    /// 由环境变量构造一层配置
    pub fn from_env(vars: &HashMap<String, String>) -> Self {
        let get = |name: &str| {
            vars.get(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let mut cfg = ConfigFile {
            default_provider: get("IDT_DEFAULT_PROVIDER"),
            default_model: get("IDT_DEFAULT_MODEL"),
            default_prompt_style: get("IDT_PROMPT_STYLE"),
            max_workers: get("IDT_MAX_WORKERS").and_then(|v| v.parse().ok()),
            ollama_url: get("OLLAMA_HOST").map(|host| {
                if host.starts_with("http://") || host.starts_with("https://") {
                    host
                } else {
                    format!("http://{}", host)
                }
            }),
            openai_base_url: get("OPENAI_BASE_URL"),
            ffmpeg_path: get("FFMPEG_PATH").map(PathBuf::from),
            ..Default::default()
        };
        if let Some(key) = get("OPENAI_API_KEY") {
            cfg.api_keys.insert("openai".to_string(), key);
        }
        if let Some(key) = get("ANTHROPIC_API_KEY").or_else(|| get("CLAUDE_API_KEY")) {
            cfg.api_keys.insert("claude".to_string(), key);
        }
        cfg
    }
}

// ============================================================================
// 分层解析
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayerSource {
    Environment,
    Explicit(PathBuf),
    User(PathBuf),
    Template(PathBuf),
    Embedded,
}

#[derive(Debug, Clone)]
pub struct ConfigLayer {
    pub source: LayerSource,
    pub file: ConfigFile,
}

/// 环境变量来源：真实进程环境（可叠加 .env）或测试用的固定表
#[derive(Debug, Clone)]
pub enum EnvSource {
    Process { dotenv: bool },
    Fixed(HashMap<String, String>),
}

impl EnvSource {
    fn snapshot(&self) -> HashMap<String, String> {
        match self {
            EnvSource::Fixed(vars) => vars.clone(),
            EnvSource::Process { dotenv } => {
                let mut vars = HashMap::new();
                // .env 只补充进程环境中没有的变量，且不修改进程环境
                if *dotenv {
                    if let Ok(iter) = dotenvy::dotenv_iter() {
                        for item in iter.flatten() {
                            vars.insert(item.0, item.1);
                        }
                    }
                }
                vars.extend(std::env::vars());
                vars
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConfigSources {
    pub mode: DeploymentMode,
    pub env: EnvSource,
    /// 命令行 --config 指定的文件，位于环境层之后、用户层之前
    pub explicit_file: Option<PathBuf>,
    pub user_dir: Option<PathBuf>,
    pub template_dir: Option<PathBuf>,
}

/// 唯一的配置解析入口：模型默认值、提示词风格、API 密钥都从这里读取
#[derive(Debug, Clone)]
pub struct ConfigResolver {
    sources: ConfigSources,
}

impl ConfigResolver {
    /// 按当前部署形态定位各层配置
    pub fn discover() -> Self {
        let mode = DeploymentMode::detect();
        debug!("部署形态: {:?}", mode);
        Self::with_sources(ConfigSources {
            mode,
            env: EnvSource::Process { dotenv: true },
            explicit_file: None,
            user_dir: dirs::config_dir().map(|dir| dir.join(APP_DIR_NAME)),
            template_dir: mode.template_dir(),
        })
    }

    pub fn with_sources(sources: ConfigSources) -> Self {
        Self { sources }
    }

    pub fn with_config_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.sources.explicit_file = Some(path.into());
        self
    }

    pub fn mode(&self) -> DeploymentMode {
        self.sources.mode
    }

    pub fn user_dir(&self) -> Option<&Path> {
        self.sources.user_dir.as_deref()
    }

    /// 重新读取所有层，每次运行调用一次，不跨运行缓存
    pub fn load(&self) -> ResolvedConfig {
        let mut layers = Vec::new();

        layers.push(ConfigLayer {
            source: LayerSource::Environment,
            file: ConfigFile::from_env(&self.sources.env.snapshot()),
        });

        if let Some(path) = &self.sources.explicit_file {
            push_file_layer(&mut layers, path, LayerSource::Explicit(path.clone()));
        }

        if let Some(dir) = &self.sources.user_dir {
            let path = dir.join(CONFIG_FILE_NAME);
            let mut file = read_layer(&path).unwrap_or_default();
            merge_key_files(dir, &mut file);
            layers.push(ConfigLayer {
                source: LayerSource::User(path),
                file,
            });
        }

        if let Some(dir) = &self.sources.template_dir {
            let path = dir.join(CONFIG_FILE_NAME);
            push_file_layer(&mut layers, &path, LayerSource::Template(path.clone()));
        }

        let embedded = ConfigFile::parse(EMBEDDED_TEMPLATE).unwrap_or_else(|e| {
            warn!("内置模板配置无效: {:#}", e);
            ConfigFile::default()
        });
        layers.push(ConfigLayer {
            source: LayerSource::Embedded,
            file: embedded,
        });

        ResolvedConfig {
            mode: self.sources.mode,
            layers,
        }
    }
}

fn read_layer(path: &Path) -> Option<ConfigFile> {
    match ConfigFile::load(path) {
        Ok(file) => file,
        Err(e) => {
            warn!("忽略无法读取的配置层: {:#}", e);
            None
        }
    }
}

fn push_file_layer(layers: &mut Vec<ConfigLayer>, path: &Path, source: LayerSource) {
    if let Some(file) = read_layer(path) {
        debug!("加载配置层: {}", path.display());
        layers.push(ConfigLayer { source, file });
    }
}

/// 用户目录中的 `<provider>_api_key.txt` 也算用户层的密钥来源
fn merge_key_files(dir: &Path, file: &mut ConfigFile) {
    for provider in ["openai", "claude"] {
        if file.api_keys.contains_key(provider) {
            continue;
        }
        let path = dir.join(format!("{}_api_key.txt", provider));
        if let Ok(raw) = fs::read_to_string(&path) {
            let key = raw.trim();
            if !key.is_empty() {
                debug!("从 {} 读取 {} 密钥", path.display(), provider);
                file.api_keys.insert(provider.to_string(), key.to_string());
            }
        }
    }
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// 某一次运行看到的配置快照
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    mode: DeploymentMode,
    layers: Vec<ConfigLayer>,
}

impl ResolvedConfig {
    pub fn mode(&self) -> DeploymentMode {
        self.mode
    }

    pub fn layers(&self) -> &[ConfigLayer] {
        &self.layers
    }

    /// 按优先级返回第一个非空值及其来源
    pub fn resolve<T>(&self, pick: impl Fn(&ConfigFile) -> Option<T>) -> Option<(T, &LayerSource)> {
        self.layers
            .iter()
            .find_map(|layer| pick(&layer.file).map(|value| (value, &layer.source)))
    }

    fn resolve_str(&self, pick: impl Fn(&ConfigFile) -> Option<&String>) -> Option<String> {
        self.resolve(|f| pick(f).and_then(|v| non_empty(v)))
            .map(|(value, _)| value)
    }

    pub fn default_provider(&self) -> String {
        self.resolve_str(|f| f.default_provider.as_ref())
            .map(|p| p.to_ascii_lowercase())
            .unwrap_or_else(default_provider)
    }

    /// 某提供方的默认模型：同一层中 `[models]` 优先于 `default_model`
    pub fn default_model(&self, provider: &str) -> String {
        let provider = provider.to_ascii_lowercase();
        match self.resolve(|f| {
            f.models
                .get(&provider)
                .and_then(|m| non_empty(m))
                .or_else(|| f.default_model.as_deref().and_then(non_empty))
        }) {
            Some((model, source)) => {
                debug!("模型 {} 来自 {:?}", model, source);
                model
            }
            None => default_model(),
        }
    }

    pub fn default_prompt_style(&self) -> String {
        self.resolve_str(|f| f.default_prompt_style.as_ref())
            .unwrap_or_else(default_prompt_style)
    }

    fn prompt_text(&self, style: &str) -> Option<String> {
        self.resolve(|f| {
            f.prompt_variations
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(style))
                .and_then(|(_, text)| non_empty(text))
        })
        .map(|(text, _)| text)
    }

    /// 解析提示词；未知风格回退到默认风格的文本
    pub fn prompt(&self, style: Option<&str>) -> Prompt {
        let default_style = self.default_prompt_style();
        let style = style
            .and_then(non_empty)
            .unwrap_or_else(|| default_style.clone());
        if let Some(text) = self.prompt_text(&style) {
            return Prompt { style, text };
        }
        warn!("未知的提示词风格 `{}`，使用默认风格 `{}` 的文本", style, default_style);
        let text = self
            .prompt_text(&default_style)
            .unwrap_or_else(|| FALLBACK_PROMPT_TEXT.to_string());
        Prompt { style, text }
    }

    pub fn prompt_styles(&self) -> Vec<String> {
        let mut styles: Vec<String> = self
            .layers
            .iter()
            .flat_map(|layer| layer.file.prompt_variations.keys().cloned())
            .collect();
        styles.sort();
        styles.dedup();
        styles
    }

    /// API 密钥：显式传入 > 环境 > --config 文件 > 用户目录 > 模板
    pub fn api_key(&self, provider: &str, explicit: Option<&str>) -> Option<String> {
        if let Some(key) = explicit.and_then(non_empty) {
            return Some(key);
        }
        let provider = provider.to_ascii_lowercase();
        self.resolve(|f| f.api_keys.get(&provider).and_then(|k| non_empty(k)))
            .map(|(key, source)| {
                debug!("{} 密钥来自 {:?}", provider, source);
                key
            })
    }

    pub fn max_workers(&self) -> Option<usize> {
        self.resolve(|f| f.max_workers.filter(|n| *n > 0))
            .map(|(n, _)| n)
    }

    pub fn item_timeout(&self) -> Duration {
        let secs = self
            .resolve(|f| f.item_timeout_secs.filter(|n| *n > 0))
            .map(|(n, _)| n)
            .unwrap_or_else(default_item_timeout_secs);
        Duration::from_secs(secs)
    }

    pub fn download_delay(&self) -> Duration {
        let ms = self
            .resolve(|f| f.download_delay_ms)
            .map(|(n, _)| n)
            .unwrap_or_else(default_download_delay_ms);
        Duration::from_millis(ms)
    }

    pub fn video_frame_interval_secs(&self) -> f64 {
        self.resolve(|f| f.video_frame_interval_secs.filter(|n| *n > 0.0))
            .map(|(n, _)| n)
            .unwrap_or_else(default_video_frame_interval_secs)
    }

    pub fn max_image_dimension(&self) -> u32 {
        self.resolve(|f| f.max_image_dimension.filter(|n| *n > 0))
            .map(|(n, _)| n)
            .unwrap_or_else(default_max_image_dimension)
    }

    pub fn jpeg_quality(&self) -> u8 {
        self.resolve(|f| f.jpeg_quality.filter(|q| (1..=100).contains(q)))
            .map(|(n, _)| n)
            .unwrap_or_else(default_jpeg_quality)
    }

    pub fn output_root(&self) -> PathBuf {
        self.resolve(|f| f.output_root.clone())
            .map(|(p, _)| p)
            .unwrap_or_else(default_output_root)
    }

    pub fn ollama_url(&self) -> String {
        self.resolve_str(|f| f.ollama_url.as_ref())
            .unwrap_or_else(default_ollama_url)
    }

    pub fn openai_base_url(&self) -> String {
        self.resolve_str(|f| f.openai_base_url.as_ref())
            .unwrap_or_else(default_openai_base_url)
    }

    pub fn ffmpeg_path(&self) -> PathBuf {
        self.resolve(|f| f.ffmpeg_path.clone())
            .map(|(p, _)| p)
            .unwrap_or_else(|| PathBuf::from("ffmpeg"))
    }
}

fn default_provider() -> String {
    "ollama".to_string()
}

fn default_model() -> String {
    "moondream".to_string()
}

fn default_prompt_style() -> String {
    "detailed".to_string()
}

fn default_item_timeout_secs() -> u64 {
    300
}

fn default_download_delay_ms() -> u64 {
    500
}

fn default_video_frame_interval_secs() -> f64 {
    5.0
}

fn default_max_image_dimension() -> u32 {
    2048
}

fn default_jpeg_quality() -> u8 {
    90
}

fn default_output_root() -> PathBuf {
    PathBuf::from("workflow_output")
}

fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// 只有固定环境变量 + 指定用户目录的解析器，不读真实环境和模板目录
    pub fn resolver(env: &[(&str, &str)], user_dir: Option<&Path>) -> ConfigResolver {
        ConfigResolver::with_sources(ConfigSources {
            mode: DeploymentMode::Source,
            env: EnvSource::Fixed(
                env.iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            explicit_file: None,
            user_dir: user_dir.map(Path::to_path_buf),
            template_dir: None,
        })
    }
}
