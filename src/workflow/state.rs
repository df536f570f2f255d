//! 运行状态文件 `workflow_state.json`，用于断点续跑

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::models::{RunState, Statistics, Step};

pub const STATE_FILE: &str = "workflow_state.json";

/// 解析完成后的运行参数（不含 API 密钥）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedParams {
    pub url: Option<String>,
    pub min_size: u64,
    pub max_images: Option<usize>,
    pub provider: String,
    pub model: String,
    pub prompt_style: String,
    pub custom_prompt: Option<String>,
    pub input_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowState {
    pub run_id: String,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub completed: Vec<Step>,
    pub state: RunState,
    pub params: ResolvedParams,
    #[serde(default)]
    pub stats: Statistics,
    pub created: DateTime<Local>,
    pub updated: DateTime<Local>,
}

impl WorkflowState {
    pub fn new(run_id: String, steps: Vec<Step>, params: ResolvedParams) -> Self {
        let now = Local::now();
        Self {
            run_id,
            steps,
            completed: Vec::new(),
            state: RunState::NotStarted,
            params,
            stats: Statistics::default(),
            created: now,
            updated: now,
        }
    }

    pub fn path(run_dir: &Path) -> PathBuf {
        run_dir.join(STATE_FILE)
    }

    pub fn load(run_dir: &Path) -> Result<Self> {
        let path = Self::path(run_dir);
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("无法读取状态文件: {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("状态文件格式错误: {}", path.display()))
    }

    /// 先写临时文件再改名，中途退出不会留下半个文件
    pub fn save(&mut self, run_dir: &Path) -> Result<()> {
        self.updated = Local::now();
        let path = Self::path(run_dir);
        let tmp = path.with_extension("json.tmp");
        let raw = serde_json::to_string_pretty(self).context("序列化运行状态失败")?;
        std::fs::write(&tmp, raw).with_context(|| format!("无法写入: {}", tmp.display()))?;
        std::fs::rename(&tmp, &path).with_context(|| format!("无法写入: {}", path.display()))?;
        Ok(())
    }

    pub fn is_completed(&self, step: Step) -> bool {
        self.completed.contains(&step)
    }

    pub fn mark_completed(&mut self, step: Step) {
        if !self.is_completed(step) {
            self.completed.push(step);
            self.completed.sort();
        }
    }
}
