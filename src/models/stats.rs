use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use super::types::Step;

/// 单张图片描述的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessResult {
    Success,
    Failed(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    pub images_discovered: usize,
    pub images_processed: usize,
    pub successes: usize,
    pub failures: usize,
    pub downloads_attempted: usize,
    pub downloads_succeeded: usize,
    pub duplicates_skipped: usize,
    pub undersized_skipped: usize,
    pub frames_extracted: usize,
    pub videos_failed: usize,
    pub images_converted: usize,
    pub conversion_failures: usize,
    /// 失败条目名称，非描述阶段的条目带有阶段前缀
    pub failed_items: Vec<String>,
    /// 每个步骤耗时（秒）
    pub step_durations: BTreeMap<Step, f64>,
}

impl Statistics {
    pub fn add_result(&mut self, name: &str, result: &ProcessResult) {
        self.images_processed += 1;
        match result {
            ProcessResult::Success => self.successes += 1,
            ProcessResult::Failed(_) => {
                self.failures += 1;
                self.failed_items.push(name.to_string());
            }
        }
    }

    pub fn add_stage_failure(&mut self, step: Step, name: &str) {
        self.failed_items.push(format!("{}: {}", step, name));
    }

    /// 重新执行描述步骤前清掉上一次的描述计数，阶段失败保留
    pub fn reset_descriptions(&mut self) {
        self.images_discovered = 0;
        self.images_processed = 0;
        self.successes = 0;
        self.failures = 0;
        self.failed_items.retain(|name| {
            Step::ALL
                .iter()
                .any(|step| name.starts_with(&format!("{}: ", step)))
        });
    }

    pub fn record_duration(&mut self, step: Step, elapsed: Duration) {
        *self.step_durations.entry(step).or_default() += elapsed.as_secs_f64();
    }
}

/// 统计数据的唯一累加入口
///
/// 所有并发写入都走 `update`（内部是 watch 通道的 `send_modify`），
/// 外部可以轮询 `snapshot` 或通过 `subscribe` 订阅进度。
#[derive(Debug, Clone)]
pub struct StatsHandle {
    tx: Arc<watch::Sender<Statistics>>,
}

impl Default for StatsHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsHandle {
    pub fn new() -> Self {
        Self::with_initial(Statistics::default())
    }

    pub fn with_initial(stats: Statistics) -> Self {
        let (tx, _rx) = watch::channel(stats);
        Self { tx: Arc::new(tx) }
    }

    pub fn update(&self, f: impl FnOnce(&mut Statistics)) {
        self.tx.send_modify(f);
    }

    pub fn snapshot(&self) -> Statistics {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Statistics> {
        self.tx.subscribe()
    }

    pub fn replace(&self, stats: Statistics) {
        self.tx.send_replace(stats);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_result_counts() {
        let mut stats = Statistics::default();
        stats.add_result("a.jpg", &ProcessResult::Success);
        stats.add_result("b.jpg", &ProcessResult::Failed("timeout".into()));
        assert_eq!(stats.images_processed, 2);
        assert_eq!(stats.successes, 1);
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.failed_items, vec!["b.jpg".to_string()]);
    }

    #[test]
    fn test_reset_descriptions_keeps_stage_failures() {
        let mut stats = Statistics::default();
        stats.add_result("b.jpg", &ProcessResult::Failed("timeout".into()));
        stats.add_stage_failure(Step::Convert, "phone.heic");
        stats.frames_extracted = 4;
        stats.reset_descriptions();
        assert_eq!(stats.failures, 0);
        assert_eq!(stats.images_processed, 0);
        assert_eq!(stats.failed_items, vec!["convert: phone.heic".to_string()]);
        assert_eq!(stats.frames_extracted, 4);
    }

    #[test]
    fn test_record_duration_accumulates() {
        let mut stats = Statistics::default();
        stats.record_duration(Step::Describe, Duration::from_millis(500));
        stats.record_duration(Step::Describe, Duration::from_millis(500));
        assert!((stats.step_durations[&Step::Describe] - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_concurrent_updates_are_not_lost() {
        let handle = StatsHandle::new();
        let mut rx = handle.subscribe();
        let mut tasks = Vec::new();
        for i in 0..50 {
            let handle = handle.clone();
            tasks.push(tokio::spawn(async move {
                handle.update(|s| s.add_result(&format!("{}.jpg", i), &ProcessResult::Success));
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(handle.snapshot().successes, 50);
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().images_processed, 50);
    }

    #[test]
    fn test_statistics_serialize_step_keys() {
        let mut stats = Statistics::default();
        stats.record_duration(Step::Html, Duration::from_secs(2));
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["step_durations"]["html"], 2.0);
    }
}
