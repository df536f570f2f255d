//! 工作流编排：download → video → convert → describe → html

use chrono::{DateTime, Local};
use reqwest::Url;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use super::state::{ResolvedParams, WorkflowState};
use crate::app::{ConfigResolver, ResolvedConfig};
use crate::error::{DownloadError, PipelineError};
use crate::models::{CancellationFlag, ItemState, Prompt, RunState, Statistics, StatsHandle, Step, WorkItem};
use crate::providers::{ProviderConfig, ProviderKind, ProviderRegistry, VisionProvider};
use crate::services::report::{image_prefix, DESCRIPTIONS_FILE, HTML_FILE};
use crate::services::{
    ConvertOptions, DescribeJob, DescriptionsDocument, DownloadOptions, Downloader, FrameExtractor,
    HtmlReport, HttpFetcher, ImageConverter, ReportEntry, ReqwestFetcher, WorkerPool,
};
use crate::utils::{file_name_string, list_images, sanitize_label};

const CUSTOM_PROMPT_STYLE: &str = "custom";

/// 一次运行的参数，未给出的从配置中解析
#[derive(Debug, Clone, Default)]
pub struct WorkflowParams {
    pub url: Option<String>,
    pub min_size: Option<u64>,
    pub max_images: Option<usize>,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub prompt_style: Option<String>,
    pub custom_prompt: Option<String>,
    pub input_dir: Option<PathBuf>,
    pub output_root: Option<PathBuf>,
    pub api_key: Option<String>,
    /// 继续一个已有的运行目录
    pub resume: Option<PathBuf>,
}

/// 运行结果，只读
#[derive(Debug, Clone)]
pub struct WorkflowRun {
    run_id: String,
    run_dir: PathBuf,
    steps: Vec<Step>,
    state: RunState,
    params: ResolvedParams,
    stats: Statistics,
    outputs: BTreeMap<Step, PathBuf>,
}

impl WorkflowRun {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// 被取消的运行停在 `Running(step)`，可以用 resume 继续
    pub fn is_interrupted(&self) -> bool {
        matches!(self.state, RunState::Running(_))
    }

    pub fn params(&self) -> &ResolvedParams {
        &self.params
    }

    pub fn stats(&self) -> &Statistics {
        &self.stats
    }

    pub fn output_dir(&self, step: Step) -> Option<&Path> {
        self.outputs.get(&step).map(PathBuf::as_path)
    }

    pub fn descriptions_file(&self) -> Option<PathBuf> {
        self.output_dir(Step::Describe)
            .map(|dir| dir.join(DESCRIPTIONS_FILE))
            .filter(|p| p.is_file())
    }

    pub fn html_report(&self) -> Option<PathBuf> {
        self.output_dir(Step::Html)
            .map(|dir| dir.join(HTML_FILE))
            .filter(|p| p.is_file())
    }
}

/// 运行目录名中的来源部分：URL 取主机名加最后一段路径，否则取输入目录名
pub fn source_label(url: Option<&str>, input_dir: Option<&Path>) -> String {
    if let Some(url) = url.and_then(|u| Url::parse(u).ok()) {
        let host = url.host_str().unwrap_or("web").to_string();
        let last = url
            .path_segments()
            .and_then(|segments| segments.filter(|s| !s.is_empty()).last().map(str::to_string));
        return match last {
            Some(segment) => format!("{}_{}", host, segment),
            None => host,
        };
    }
    input_dir
        .and_then(|dir| match dir.file_name() {
            Some(name) => Some(name.to_string_lossy().into_owned()),
            None => std::path::absolute(dir)
                .ok()?
                .file_name()
                .map(|n| n.to_string_lossy().into_owned()),
        })
        .unwrap_or_else(|| "input".to_string())
}

/// `wf_<来源>_<提供方>_<模型>_<提示词风格>_<时间戳>`
pub fn build_run_name(
    source: &str,
    provider: &str,
    model: &str,
    prompt_style: &str,
    timestamp: DateTime<Local>,
) -> String {
    format!(
        "wf_{}_{}_{}_{}_{}",
        sanitize_label(source),
        sanitize_label(provider),
        sanitize_label(model),
        sanitize_label(prompt_style),
        timestamp.format("%Y%m%d_%H%M%S")
    )
}

/// 同名目录已存在时追加 `_1`、`_2` ...
fn unique_run_dir(root: &Path, name: &str) -> PathBuf {
    let mut candidate = root.join(name);
    let mut counter = 1;
    while candidate.exists() {
        candidate = root.join(format!("{}_{}", name, counter));
        counter += 1;
    }
    candidate
}

struct StepOutcome {
    output: PathBuf,
    /// 被取消，步骤没有完成
    interrupted: bool,
}

impl StepOutcome {
    fn done(output: PathBuf) -> Self {
        Self {
            output,
            interrupted: false,
        }
    }
}

/// 编排器：每次 `run` 都重新读取配置、构造提供方注册表
pub struct Orchestrator {
    resolver: ConfigResolver,
    fetcher: Option<Arc<dyn HttpFetcher>>,
    registry: Option<ProviderRegistry>,
    stats: StatsHandle,
    cancel: CancellationFlag,
}

impl Orchestrator {
    pub fn new(resolver: ConfigResolver) -> Self {
        Self {
            resolver,
            fetcher: None,
            registry: None,
            stats: StatsHandle::new(),
            cancel: CancellationFlag::new(),
        }
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn HttpFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// 使用给定的注册表代替按配置构造的注册表
    pub fn with_registry(mut self, registry: ProviderRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn resolver(&self) -> &ConfigResolver {
        &self.resolver
    }

    pub fn cancellation(&self) -> CancellationFlag {
        self.cancel.clone()
    }

    /// 当前运行的统计，可轮询或订阅
    pub fn stats(&self) -> StatsHandle {
        self.stats.clone()
    }

    pub async fn run(&self, steps: &[Step], params: WorkflowParams) -> Result<WorkflowRun, PipelineError> {
        let config = self.resolver.load();
        debug!("配置层: {:?}", config.layers().iter().map(|l| &l.source).collect::<Vec<_>>());

        let (mut state, run_dir) = match &params.resume {
            Some(dir) => self.resume_state(dir, steps)?,
            None => self.prepare_new(&config, steps, &params)?,
        };
        let steps = state.steps.clone();
        let first = *steps.first().ok_or(PipelineError::NoSteps)?;

        let mut ctx = RunContext {
            config,
            run_dir: run_dir.clone(),
            params: state.params.clone(),
            steps: steps.clone(),
            api_key: params.api_key.clone(),
            stats: self.stats.clone(),
            cancel: self.cancel.clone(),
            fetcher: self.fetcher.clone(),
            registry: self.registry.clone(),
            describe_source: None,
        };
        // 描述步骤的前置检查放在创建任何目录之前
        let describer = if steps.contains(&Step::Describe) && !state.is_completed(Step::Describe) {
            Some(ctx.describer()?)
        } else {
            None
        };

        std::fs::create_dir_all(&run_dir).map_err(|e| {
            PipelineError::step(first, format!("无法创建运行目录 {}: {}", run_dir.display(), e))
        })?;
        self.stats.replace(state.stats.clone());

        info!("🚀 开始运行 {}", state.run_id);
        info!("📂 运行目录: {}", run_dir.display());
        info!(
            "📋 步骤: {}",
            steps.iter().map(Step::as_str).collect::<Vec<_>>().join(" → ")
        );

        let mut outputs = BTreeMap::new();
        let mut current_input = ctx.params.input_dir.clone().unwrap_or_else(|| run_dir.clone());

        for step in steps.iter().copied() {
            let output = run_dir.join(step.output_dir_name());
            if state.is_completed(step) {
                info!("⏭️ 步骤 {} 已完成，跳过", step);
                if step == Step::Describe {
                    ctx.describe_source = Some(current_input.clone());
                }
                outputs.insert(step, output.clone());
                current_input = output;
                continue;
            }
            if self.cancel.is_cancelled() {
                warn!("⏹️ 运行已取消，停在步骤 {} 之前", step);
                break;
            }

            state.state = RunState::Running(step);
            ctx.save_state(&mut state);

            info!("▶️ 步骤 {} 开始，输入: {}", step, current_input.display());
            let started = Instant::now();
            let result = match step {
                Step::Download => ctx.download(&output).await,
                Step::Video => ctx.video(&current_input, &output).await,
                Step::Convert => ctx.convert(&current_input, &output).await,
                Step::Describe => match &describer {
                    Some((provider, provider_config, prompt)) => {
                        ctx.describe(provider.clone(), provider_config, prompt, &current_input, &output)
                            .await
                    }
                    None => Err(PipelineError::step(step, "提供方未初始化")),
                },
                Step::Html => ctx.html(&current_input, &output),
            };
            let elapsed = started.elapsed();
            self.stats.update(|s| s.record_duration(step, elapsed));

            match result {
                Ok(outcome) if outcome.interrupted => {
                    outputs.insert(step, outcome.output);
                    warn!("⏹️ 步骤 {} 被取消，可使用 --resume {} 继续", step, run_dir.display());
                    ctx.save_state(&mut state);
                    break;
                }
                Ok(outcome) => {
                    info!("✅ 步骤 {} 完成，用时 {:.1} 秒", step, elapsed.as_secs_f64());
                    state.mark_completed(step);
                    outputs.insert(step, outcome.output.clone());
                    current_input = outcome.output;
                }
                Err(e) => {
                    state.state = RunState::Failed(step);
                    ctx.save_state(&mut state);
                    return Err(e);
                }
            }
        }

        if steps.iter().all(|s| state.is_completed(*s)) {
            state.state = RunState::Completed;
        }
        ctx.save_state(&mut state);

        let stats = self.stats.snapshot();
        info!(
            "\n🎉 运行结束! 成功 {} 张，失败 {} 张",
            stats.successes, stats.failures
        );

        Ok(WorkflowRun {
            run_id: state.run_id.clone(),
            run_dir,
            steps,
            state: state.state,
            params: state.params.clone(),
            stats,
            outputs,
        })
    }

    fn resume_state(&self, dir: &Path, steps: &[Step]) -> Result<(WorkflowState, PathBuf), PipelineError> {
        let mut state = WorkflowState::load(dir).map_err(|e| PipelineError::Resume {
            dir: dir.to_path_buf(),
            cause: format!("{:#}", e),
        })?;
        let requested = Step::canonical(steps);
        if !requested.is_empty() {
            let mut merged = state.steps.clone();
            merged.extend(requested);
            state.steps = Step::canonical(&merged);
        }
        info!(
            "🔁 继续运行 {}，已完成: {:?}",
            state.run_id, state.completed
        );
        Ok((state, dir.to_path_buf()))
    }

    /// 解析参数并检查前置条件，此时还没有创建任何目录
    fn prepare_new(
        &self,
        config: &ResolvedConfig,
        steps: &[Step],
        params: &WorkflowParams,
    ) -> Result<(WorkflowState, PathBuf), PipelineError> {
        let steps = Step::canonical(steps);
        let first = *steps.first().ok_or(PipelineError::NoSteps)?;

        if steps.contains(&Step::Download) {
            let url = params
                .url
                .as_deref()
                .map(str::trim)
                .filter(|u| !u.is_empty())
                .ok_or_else(|| PipelineError::step(Step::Download, "download 步骤需要 --url"))?;
            Url::parse(url).map_err(|e| PipelineError::step(Step::Download, format!("无效的 URL {}: {}", url, e)))?;
        } else {
            let dir = params
                .input_dir
                .as_deref()
                .ok_or_else(|| PipelineError::step(first, "未指定输入目录"))?;
            if !dir.is_dir() {
                return Err(PipelineError::step(
                    first,
                    format!("输入目录不存在: {}", dir.display()),
                ));
            }
        }

        let provider = params
            .provider
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_ascii_lowercase)
            .unwrap_or_else(|| config.default_provider());
        let kind = provider.parse::<ProviderKind>();
        if let Err(e) = &kind {
            if steps.contains(&Step::Describe) {
                return Err(PipelineError::step(Step::Describe, e.to_string()));
            }
        }
        let model = match &kind {
            Ok(kind) => {
                ProviderConfig::resolve(config, *kind, params.model.as_deref(), None, None).model
            }
            Err(_) => params
                .model
                .clone()
                .unwrap_or_else(|| config.default_model(&provider)),
        };

        let custom_prompt = params
            .custom_prompt
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string);
        let prompt_style = match &custom_prompt {
            Some(_) => CUSTOM_PROMPT_STYLE.to_string(),
            None => config.prompt(params.prompt_style.as_deref()).style,
        };

        let resolved = ResolvedParams {
            url: params.url.clone(),
            min_size: params.min_size.unwrap_or(0),
            max_images: params.max_images,
            provider: kind.as_ref().map(|k| k.as_str().to_string()).unwrap_or(provider),
            model,
            prompt_style,
            custom_prompt,
            input_dir: params.input_dir.clone(),
        };

        let label = source_label(resolved.url.as_deref(), resolved.input_dir.as_deref());
        let run_id = build_run_name(
            &label,
            &resolved.provider,
            &resolved.model,
            &resolved.prompt_style,
            Local::now(),
        );
        let output_root = params.output_root.clone().unwrap_or_else(|| config.output_root());
        let run_dir = unique_run_dir(&output_root, &run_id);
        let run_id = file_name_string(&run_dir);

        Ok((WorkflowState::new(run_id, steps, resolved), run_dir))
    }
}

/// 单次运行内各步骤共享的上下文
struct RunContext {
    config: ResolvedConfig,
    run_dir: PathBuf,
    params: ResolvedParams,
    steps: Vec<Step>,
    api_key: Option<String>,
    stats: StatsHandle,
    cancel: CancellationFlag,
    fetcher: Option<Arc<dyn HttpFetcher>>,
    registry: Option<ProviderRegistry>,
    /// 描述步骤读取图片的目录，HTML 报告引用图片时使用
    describe_source: Option<PathBuf>,
}

impl RunContext {
    fn save_state(&self, state: &mut WorkflowState) {
        state.stats = self.stats.snapshot();
        if let Err(e) = state.save(&self.run_dir) {
            warn!("保存运行状态失败: {:#}", e);
        }
    }

    fn prompt(&self) -> Prompt {
        match &self.params.custom_prompt {
            Some(text) => Prompt {
                style: CUSTOM_PROMPT_STYLE.to_string(),
                text: text.clone(),
            },
            None => self.config.prompt(Some(&self.params.prompt_style)),
        }
    }

    /// 构造本次运行的注册表并取出选中的提供方
    fn describer(&self) -> Result<(Arc<dyn VisionProvider>, ProviderConfig, Prompt), PipelineError> {
        let kind: ProviderKind = self
            .params
            .provider
            .parse()
            .map_err(|e: crate::error::ProviderError| PipelineError::step(Step::Describe, e.to_string()))?;
        let provider_config = ProviderConfig::resolve(
            &self.config,
            kind,
            Some(&self.params.model),
            self.api_key.as_deref(),
            self.params.custom_prompt.as_deref(),
        );

        let registry = self
            .registry
            .clone()
            .unwrap_or_else(|| ProviderRegistry::from_config(&self.config));
        registry.refresh_credentials(&self.config, &provider_config);
        let provider = registry
            .get_kind(kind)
            .map_err(|e| PipelineError::step(Step::Describe, e.to_string()))?;

        Ok((provider, provider_config, self.prompt()))
    }

    fn has_later_steps(&self, step: Step) -> bool {
        self.steps.iter().any(|s| *s > step)
    }

    async fn download(&self, output: &Path) -> Result<StepOutcome, PipelineError> {
        let step = Step::Download;
        let url = self
            .params
            .url
            .as_deref()
            .ok_or_else(|| PipelineError::step(step, "download 步骤需要 --url"))?;

        let fetcher: Arc<dyn HttpFetcher> = match &self.fetcher {
            Some(fetcher) => fetcher.clone(),
            None => Arc::new(
                ReqwestFetcher::new(self.config.item_timeout())
                    .map_err(|e| PipelineError::step(step, format!("无法构造 HTTP 客户端: {}", e)))?,
            ),
        };
        let options = DownloadOptions {
            min_size: self.params.min_size,
            max_images: self.params.max_images,
            delay: self.config.download_delay(),
        };

        let downloader = Downloader::new(fetcher.as_ref(), self.stats.clone(), self.cancel.clone());
        match downloader.download(url, output, &options).await {
            Ok(_) => Ok(StepOutcome {
                output: output.to_path_buf(),
                interrupted: self.cancel.is_cancelled(),
            }),
            Err(e @ DownloadError::PageFetch { .. }) if !self.has_later_steps(step) => {
                warn!("❌ {}", e);
                self.stats.update(|s| s.add_stage_failure(step, url));
                std::fs::create_dir_all(output).map_err(|e| PipelineError::step(step, e.to_string()))?;
                Ok(StepOutcome::done(output.to_path_buf()))
            }
            Err(e) => Err(PipelineError::step(step, e.to_string())),
        }
    }

    async fn video(&self, input: &Path, output: &Path) -> Result<StepOutcome, PipelineError> {
        let extractor = FrameExtractor::new(
            self.config.ffmpeg_path(),
            self.config.video_frame_interval_secs(),
            self.stats.clone(),
            self.cancel.clone(),
        );
        extractor
            .extract_all(input, output)
            .await
            .map_err(|e| PipelineError::step(Step::Video, e.to_string()))?;
        Ok(StepOutcome {
            output: output.to_path_buf(),
            interrupted: self.cancel.is_cancelled(),
        })
    }

    async fn convert(&self, input: &Path, output: &Path) -> Result<StepOutcome, PipelineError> {
        let converter = ImageConverter::new(
            ConvertOptions {
                max_dimension: self.config.max_image_dimension(),
                jpeg_quality: self.config.jpeg_quality(),
            },
            self.stats.clone(),
            self.cancel.clone(),
        );
        converter
            .convert_all(input, output)
            .await
            .map_err(|e| PipelineError::step(Step::Convert, e.to_string()))?;
        Ok(StepOutcome {
            output: output.to_path_buf(),
            interrupted: self.cancel.is_cancelled(),
        })
    }

    async fn describe(
        &mut self,
        provider: Arc<dyn VisionProvider>,
        provider_config: &ProviderConfig,
        prompt: &Prompt,
        input: &Path,
        output: &Path,
    ) -> Result<StepOutcome, PipelineError> {
        let step = Step::Describe;
        let images = list_images(input).map_err(|e| {
            PipelineError::step(step, format!("无法读取输入目录 {}: {}", input.display(), e))
        })?;
        std::fs::create_dir_all(output).map_err(|e| PipelineError::step(step, e.to_string()))?;
        self.describe_source = Some(input.to_path_buf());

        if !provider.is_available().await {
            warn!("⚠️ 提供方 {} 当前不可用，所有图片都会记录为失败", provider.name());
        }

        // 续跑时沿用已有的描述
        let aggregate = output.join(DESCRIPTIONS_FILE);
        let previous: HashMap<String, ReportEntry> = if aggregate.is_file() {
            match DescriptionsDocument::read(&aggregate) {
                Ok(doc) => doc.entries.into_iter().map(|e| (e.file_name.clone(), e)).collect(),
                Err(e) => {
                    warn!("读取已有描述文件失败，全部重新描述 {}: {}", aggregate.display(), e);
                    HashMap::new()
                }
            }
        } else {
            HashMap::new()
        };

        let items: Vec<WorkItem> = images
            .iter()
            .map(|path| match previous.get(&file_name_string(path)) {
                Some(entry) => WorkItem::restored(path, entry.to_result(prompt)),
                None => WorkItem::new(path),
            })
            .collect();
        let restored = items.iter().filter(|i| i.state() == ItemState::Done).count();
        if restored > 0 {
            info!("♻️ 沿用已有描述 {} 条", restored);
        }
        self.stats.update(|s| {
            s.reset_descriptions();
            s.images_discovered += items.len();
            s.images_processed += restored;
            s.successes += restored;
        });

        let mut pool = WorkerPool::new(provider, self.stats.clone(), self.cancel.clone())
            .with_item_timeout(self.config.item_timeout());
        if let Some(workers) = self.config.max_workers() {
            pool = pool.with_concurrency(workers);
        }
        let job = DescribeJob {
            model: provider_config.model.clone(),
            prompt: prompt.clone(),
        };
        let outcome = pool.process(items, &job).await;

        let document = DescriptionsDocument {
            source_dir: Some(input.to_path_buf()),
            entries: outcome
                .succeeded()
                .map(|(item, result)| ReportEntry::from_result(&item.file_name, result))
                .collect(),
            failures: outcome
                .failed()
                .map(|item| (item.file_name.clone(), item.error.clone().unwrap_or_default()))
                .collect(),
        };
        document.write(&aggregate).map_err(|e| {
            PipelineError::step(step, format!("无法写入 {}: {}", aggregate.display(), e))
        })?;
        info!("📝 描述已写入 {}", aggregate.display());

        let interrupted = outcome.items.iter().any(|i| i.state() == ItemState::Pending);
        Ok(StepOutcome {
            output: output.to_path_buf(),
            interrupted,
        })
    }

    fn html(&self, input: &Path, output: &Path) -> Result<StepOutcome, PipelineError> {
        let step = Step::Html;
        let aggregate = input.join(DESCRIPTIONS_FILE);
        if !aggregate.is_file() {
            return Err(PipelineError::step(
                step,
                format!("找不到描述文件: {}", aggregate.display()),
            ));
        }
        let document = DescriptionsDocument::read(&aggregate)
            .map_err(|e| PipelineError::step(step, format!("无法读取 {}: {}", aggregate.display(), e)))?;

        std::fs::create_dir_all(output).map_err(|e| PipelineError::step(step, e.to_string()))?;
        let image_dir = self
            .describe_source
            .clone()
            .or_else(|| document.source_dir.clone())
            .unwrap_or_else(|| input.to_path_buf());
        let prefix = image_prefix(&self.run_dir, output, &image_dir);
        let title = file_name_string(&self.run_dir);
        let stats = self.stats.snapshot();
        let html = HtmlReport {
            title: &title,
            document: &document,
            stats: &stats,
            image_prefix: &prefix,
        }
        .render();

        let target = output.join(HTML_FILE);
        std::fs::write(&target, html)
            .map_err(|e| PipelineError::step(step, format!("无法写入 {}: {}", target.display(), e)))?;
        info!("🌐 HTML 报告: {}", target.display());
        Ok(StepOutcome::done(output.to_path_buf()))
    }
}
