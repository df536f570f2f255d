//! 描述步骤的并发工作池

use futures::stream::{self, StreamExt};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::ItemError;
use crate::models::{
    CancellationFlag, DescriptionResult, ItemState, ProcessResult, Prompt, Statistics, StatsHandle,
    WorkItem,
};
use crate::providers::{ImageInput, VisionProvider};
use crate::utils::content_hash;

const DEFAULT_ITEM_TIMEOUT: Duration = Duration::from_secs(300);

/// 一批图片共用的模型与提示词
#[derive(Debug, Clone)]
pub struct DescribeJob {
    pub model: String,
    pub prompt: Prompt,
}

#[derive(Debug, Clone)]
pub struct BatchOutcome {
    /// 与输入顺序一致
    pub items: Vec<WorkItem>,
    /// 仅本批次的统计
    pub stats: Statistics,
}

impl BatchOutcome {
    pub fn succeeded(&self) -> impl Iterator<Item = (&WorkItem, &DescriptionResult)> {
        self.items
            .iter()
            .filter_map(|item| item.result.as_ref().map(|r| (item, r)))
    }

    pub fn failed(&self) -> impl Iterator<Item = &WorkItem> {
        self.items
            .iter()
            .filter(|item| item.state() == ItemState::Failed)
    }
}

pub struct WorkerPool {
    provider: Arc<dyn VisionProvider>,
    concurrency: usize,
    item_timeout: Duration,
    stats: StatsHandle,
    cancel: CancellationFlag,
}

impl WorkerPool {
    pub fn new(provider: Arc<dyn VisionProvider>, stats: StatsHandle, cancel: CancellationFlag) -> Self {
        let concurrency = provider.max_concurrency();
        Self {
            provider,
            concurrency,
            item_timeout: DEFAULT_ITEM_TIMEOUT,
            stats,
            cancel,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_item_timeout(mut self, item_timeout: Duration) -> Self {
        self.item_timeout = item_timeout;
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// 并发描述所有条目，单张失败不影响其他条目
    ///
    /// 已经是 `Done` 的条目（断点续跑恢复的）原样返回；
    /// 取消后尚未派发的条目保持 `Pending`，不计入统计。
    pub async fn process(&self, items: Vec<WorkItem>, job: &DescribeJob) -> BatchOutcome {
        let total = items.len();
        let pending = items
            .iter()
            .filter(|i| i.state() == ItemState::Pending)
            .count();
        info!(
            "🖼️ 开始描述 {} 张图片（待处理 {}），提供方: {}，模型: {}，并发: {}",
            total,
            pending,
            self.provider.name(),
            job.model,
            self.concurrency
        );

        let mut batch = Statistics {
            images_discovered: total,
            ..Default::default()
        };
        let mut finished: Vec<(usize, WorkItem)> = Vec::with_capacity(total);
        let mut done = 0usize;

        let mut stream = stream::iter(items.into_iter().enumerate().map(|(index, item)| {
            let provider = Arc::clone(&self.provider);
            let cancel = self.cancel.clone();
            let item_timeout = self.item_timeout;
            async move {
                let (item, dispatched) = run_item(provider, item, job, item_timeout, &cancel).await;
                (index, item, dispatched)
            }
        }))
        .buffer_unordered(self.concurrency.max(1));

        while let Some((index, item, dispatched)) = stream.next().await {
            let result = match item.state() {
                ItemState::Done if dispatched => Some(ProcessResult::Success),
                ItemState::Failed if dispatched => Some(ProcessResult::Failed(
                    item.error.clone().unwrap_or_default(),
                )),
                _ => None,
            };

            if let Some(result) = result {
                done += 1;
                match &result {
                    ProcessResult::Success => info!("[{}/{}] ✅ {}", done, pending, item.file_name),
                    ProcessResult::Failed(reason) => {
                        warn!("[{}/{}] ❌ 处理 '{}' 时出错: {}", done, pending, item.file_name, reason)
                    }
                }
                batch.add_result(&item.file_name, &result);
                self.stats
                    .update(|s| s.add_result(&item.file_name, &result));
            }
            finished.push((index, item));
        }

        finished.sort_by_key(|(index, _)| *index);
        let items: Vec<WorkItem> = finished.into_iter().map(|(_, item)| item).collect();

        let skipped = items
            .iter()
            .filter(|i| i.state() == ItemState::Pending)
            .count();
        if skipped > 0 {
            warn!("⏹️ 已取消，{} 张图片未派发", skipped);
        }
        info!(
            "描述完成: 成功 {}，失败 {}",
            batch.successes, batch.failures
        );

        BatchOutcome {
            items,
            stats: batch,
        }
    }
}

/// 返回条目以及它是否真正被派发
async fn run_item(
    provider: Arc<dyn VisionProvider>,
    mut item: WorkItem,
    job: &DescribeJob,
    item_timeout: Duration,
    cancel: &CancellationFlag,
) -> (WorkItem, bool) {
    if item.state() != ItemState::Pending || cancel.is_cancelled() {
        return (item, false);
    }
    if let Err(e) = item.start() {
        warn!("{}", e);
        return (item, false);
    }

    let outcome = match timeout(item_timeout, describe_one(provider.as_ref(), &mut item, job)).await {
        Ok(result) => result,
        Err(_) => Err(ItemError::Timeout(item_timeout.as_secs())),
    };

    let transition = match outcome {
        Ok(result) => {
            debug!("{} 描述耗时 {} ms", item.file_name, result.duration_ms);
            item.complete(result)
        }
        Err(e) => item.fail(e.to_string()),
    };
    if let Err(e) = transition {
        warn!("{}", e);
    }
    (item, true)
}

async fn describe_one(
    provider: &dyn VisionProvider,
    item: &mut WorkItem,
    job: &DescribeJob,
) -> Result<DescriptionResult, ItemError> {
    let data = read_image(&item.path).await?;
    item.size = Some(data.len() as u64);
    item.hash = Some(content_hash(&data));

    let image = ImageInput::from_bytes(&item.file_name, data)?;
    Ok(provider.describe(&image, &job.prompt, &job.model).await?)
}

async fn read_image(path: &Path) -> Result<Vec<u8>, ItemError> {
    tokio::fs::read(path).await.map_err(|source| ItemError::Read {
        path: path.to_path_buf(),
        source,
    })
}
