use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::InvalidTransition;
use crate::utils::file_name_string;

// ============================================================================
// 工作流步骤
// ============================================================================

/// 工作流步骤，声明顺序即规范执行顺序
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Step {
    Download,
    Video,
    Convert,
    Describe,
    Html,
}

impl Step {
    pub const ALL: [Step; 5] = [
        Step::Download,
        Step::Video,
        Step::Convert,
        Step::Describe,
        Step::Html,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Step::Download => "download",
            Step::Video => "video",
            Step::Convert => "convert",
            Step::Describe => "describe",
            Step::Html => "html",
        }
    }

    /// 每个步骤在运行目录下对应的唯一输出子目录
    pub fn output_dir_name(&self) -> &'static str {
        match self {
            Step::Download => "downloaded_images",
            Step::Video => "extracted_frames",
            Step::Convert => "converted_images",
            Step::Describe => "descriptions",
            Step::Html => "html_reports",
        }
    }

    /// 去重并按规范顺序排列
    pub fn canonical(steps: &[Step]) -> Vec<Step> {
        let mut ordered = steps.to_vec();
        ordered.sort();
        ordered.dedup();
        ordered
    }

    /// 解析逗号分隔的步骤列表，例如 "describe,html"
    pub fn parse_list(raw: &str) -> Result<Vec<Step>, String> {
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(Step::from_str)
            .collect()
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Step {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "download" => Ok(Step::Download),
            "video" => Ok(Step::Video),
            "convert" => Ok(Step::Convert),
            "describe" => Ok(Step::Describe),
            "html" => Ok(Step::Html),
            other => Err(format!("未知步骤: {}", other)),
        }
    }
}

// ============================================================================
// 编排器状态
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "step", rename_all = "snake_case")]
pub enum RunState {
    NotStarted,
    Running(Step),
    Failed(Step),
    Completed,
}

// ============================================================================
// 单张图片的处理状态
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    Pending,
    InProgress,
    Done,
    Failed,
}

impl ItemState {
    /// 状态只能向前推进：pending → in_progress → {done | failed}
    pub fn can_advance_to(self, next: ItemState) -> bool {
        matches!(
            (self, next),
            (ItemState::Pending, ItemState::InProgress)
                | (ItemState::InProgress, ItemState::Done)
                | (ItemState::InProgress, ItemState::Failed)
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
}

/// 使用的提示词：风格名 + 实际文本
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prompt {
    pub style: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DescriptionResult {
    pub provider: String,
    pub model: String,
    pub prompt_style: String,
    pub prompt: String,
    pub description: String,
    pub created: DateTime<Local>,
    pub duration_ms: u64,
    pub usage: Option<TokenUsage>,
}

impl DescriptionResult {
    pub fn new(provider: &str, model: &str, prompt: &Prompt, description: String) -> Self {
        Self {
            provider: provider.to_string(),
            model: model.to_string(),
            prompt_style: prompt.style.clone(),
            prompt: prompt.text.clone(),
            description,
            created: Local::now(),
            duration_ms: 0,
            usage: None,
        }
    }
}

/// 描述步骤中追踪的一张图片
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub path: PathBuf,
    pub file_name: String,
    pub hash: Option<String>,
    pub size: Option<u64>,
    state: ItemState,
    pub result: Option<DescriptionResult>,
    pub error: Option<String>,
}

impl WorkItem {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            file_name: file_name_string(&path),
            path,
            hash: None,
            size: None,
            state: ItemState::Pending,
            result: None,
            error: None,
        }
    }

    /// 由已有的描述结果恢复出一个已完成的条目（断点续跑）
    pub fn restored(path: &Path, result: DescriptionResult) -> Self {
        let mut item = Self::new(path);
        item.state = ItemState::Done;
        item.result = Some(result);
        item
    }

    pub fn state(&self) -> ItemState {
        self.state
    }

    fn advance(&mut self, next: ItemState) -> Result<(), InvalidTransition> {
        if !self.state.can_advance_to(next) {
            return Err(InvalidTransition {
                item: self.file_name.clone(),
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    pub fn start(&mut self) -> Result<(), InvalidTransition> {
        self.advance(ItemState::InProgress)
    }

    pub fn complete(&mut self, result: DescriptionResult) -> Result<(), InvalidTransition> {
        self.advance(ItemState::Done)?;
        self.result = Some(result);
        Ok(())
    }

    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), InvalidTransition> {
        self.advance(ItemState::Failed)?;
        self.error = Some(error.into());
        Ok(())
    }
}

// ============================================================================
// 协作式取消
// ============================================================================

/// 共享的停止信号：设置后不再派发新任务，正在执行的调用允许完成
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_order_ignores_request_order() {
        let steps = vec![Step::Html, Step::Describe, Step::Download, Step::Html];
        assert_eq!(
            Step::canonical(&steps),
            vec![Step::Download, Step::Describe, Step::Html]
        );
    }

    #[test]
    fn test_parse_step_list() {
        assert_eq!(
            Step::parse_list("describe, html,VIDEO").unwrap(),
            vec![Step::Describe, Step::Html, Step::Video]
        );
        assert!(Step::parse_list("describe,upload").is_err());
    }

    #[test]
    fn test_work_item_moves_forward_only() {
        let mut item = WorkItem::new("/tmp/a.jpg");
        assert_eq!(item.file_name, "a.jpg");
        assert_eq!(item.state(), ItemState::Pending);
        assert!(item.fail("too early").is_err());

        item.start().unwrap();
        item.fail("provider error").unwrap();
        assert_eq!(item.state(), ItemState::Failed);
        assert_eq!(item.error.as_deref(), Some("provider error"));

        // failed 之后不能再回到 in_progress 或 done
        assert!(item.start().is_err());
        let prompt = Prompt { style: "detailed".into(), text: "describe".into() };
        assert!(item.complete(DescriptionResult::new("ollama", "moondream", &prompt, "x".into())).is_err());
        assert_eq!(item.state(), ItemState::Failed);
    }

    #[test]
    fn test_cancellation_flag_is_shared() {
        let flag = CancellationFlag::new();
        let clone = flag.clone();
        assert!(!clone.is_cancelled());
        flag.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn test_run_state_serializes_with_step() {
        let json = serde_json::to_string(&RunState::Running(Step::Describe)).unwrap();
        assert_eq!(json, r#"{"state":"running","step":"describe"}"#);
    }
}
