use std::path::PathBuf;
use thiserror::Error;

use crate::models::{ItemState, Step};

/// 致命错误：某个步骤无法获得输入或无法创建输出目录，整个运行中止
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("没有指定任何步骤")]
    NoSteps,

    #[error("步骤 `{step}` 失败: {cause}")]
    Step { step: Step, cause: String },

    #[error("无法恢复运行 {dir}: {cause}")]
    Resume { dir: PathBuf, cause: String },
}

impl PipelineError {
    pub fn step(step: Step, cause: impl Into<String>) -> Self {
        PipelineError::Step {
            step,
            cause: cause.into(),
        }
    }

    pub fn failed_step(&self) -> Option<Step> {
        match self {
            PipelineError::NoSteps | PipelineError::Resume { .. } => None,
            PipelineError::Step { step, .. } => Some(*step),
        }
    }
}

/// 提供方调用错误，只会作为单张图片的失败记录，不会中断批处理
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("提供方 {provider} 不可用: {reason}")]
    Unavailable { provider: String, reason: String },

    #[error("不支持的提供方: {0}")]
    Unsupported(String),

    #[error("请求失败: {0}")]
    Request(String),

    #[error("API 返回错误: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("解析响应失败: {0}")]
    Parse(String),

    #[error("提供方返回了空描述")]
    EmptyResponse,
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        ProviderError::Request(e.to_string())
    }
}

/// 单张图片处理失败
#[derive(Debug, Error)]
pub enum ItemError {
    #[error("读取图片失败 {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("无法识别的图片格式: {0}")]
    UnsupportedFormat(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("处理超时（{0} 秒）")]
    Timeout(u64),
}

/// HTTP 抓取错误
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("无效的 URL: {0}")]
    InvalidUrl(String),

    #[error("HTTP 请求失败: {0}")]
    RequestFailed(#[from] reqwest::Error),

    #[error("HTTP 状态码 {status}: {url}")]
    Status { status: u16, url: String },
}

/// 下载步骤错误
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("获取页面失败 {url}: {source}")]
    PageFetch {
        url: String,
        #[source]
        source: FetchError,
    },

    #[error("获取候选图片失败: {0}")]
    CandidateFetch(#[from] FetchError),

    #[error("内容不是可识别的图片")]
    NotAnImage,

    #[error("选择器解析失败: {0}")]
    Selector(String),

    #[error("文件写入失败: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
#[error("条目 {item} 不能从 {from:?} 变为 {to:?}")]
pub struct InvalidTransition {
    pub item: String,
    pub from: ItemState,
    pub to: ItemState,
}
