use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{info, warn};

use image_describer::app::ConfigResolver;
use image_describer::logger;
use image_describer::models::{Statistics, Step};
use image_describer::providers::{ProviderConfig, ProviderRegistry};
use image_describer::utils::{format_size, parse_size};
use image_describer::workflow::{Orchestrator, WorkflowParams, WorkflowRun};

/// 下载网页图片、抽取视频帧、转换格式，并用视觉模型生成描述
#[derive(Debug, Parser)]
#[command(name = "image_describer", version)]
struct Cli {
    /// 要抓取图片的网页地址
    #[arg(long)]
    url: Option<String>,

    /// 下载图片的最小大小，例如 100KB、1.5MB
    #[arg(long, value_parser = parse_min_size)]
    min_size: Option<u64>,

    /// 最多下载的图片数量
    #[arg(long)]
    max_images: Option<usize>,

    /// 逗号分隔的步骤：download,video,convert,describe,html
    #[arg(long)]
    steps: Option<String>,

    /// ollama / openai / claude
    #[arg(long)]
    provider: Option<String>,

    #[arg(long)]
    model: Option<String>,

    #[arg(long)]
    prompt_style: Option<String>,

    /// 直接给出提示词文本，覆盖 --prompt-style
    #[arg(long)]
    custom_prompt: Option<String>,

    #[arg(long)]
    input_dir: Option<PathBuf>,

    /// 运行目录的父目录
    #[arg(long)]
    output_dir: Option<PathBuf>,

    #[arg(long)]
    api_key: Option<String>,

    /// 继续一个被中断或失败的运行目录
    #[arg(long)]
    resume: Option<PathBuf>,

    /// 额外的配置文件，优先级仅次于环境变量，高于用户目录和模板
    #[arg(long)]
    config: Option<PathBuf>,

    /// 列出提供方及其可用性后退出
    #[arg(long)]
    list_providers: bool,
}

fn parse_min_size(raw: &str) -> Result<u64, String> {
    parse_size(raw).ok_or_else(|| format!("无法解析的大小: {}", raw))
}

impl Cli {
    /// 未指定时：有 URL 则下载、描述、生成报告；续跑时沿用原来的步骤
    fn steps(&self) -> Result<Vec<Step>> {
        Ok(match &self.steps {
            Some(raw) => Step::parse_list(raw).map_err(anyhow::Error::msg)?,
            None if self.resume.is_some() => Vec::new(),
            None if self.url.is_some() => vec![Step::Download, Step::Describe, Step::Html],
            None => vec![Step::Describe, Step::Html],
        })
    }

    fn params(&self) -> WorkflowParams {
        WorkflowParams {
            url: self.url.clone(),
            min_size: self.min_size,
            max_images: self.max_images,
            provider: self.provider.clone(),
            model: self.model.clone(),
            prompt_style: self.prompt_style.clone(),
            custom_prompt: self.custom_prompt.clone(),
            input_dir: self.input_dir.clone(),
            output_root: self.output_dir.clone(),
            api_key: self.api_key.clone(),
            resume: self.resume.clone(),
        }
    }
}

async fn list_providers(resolver: &ConfigResolver, api_key: Option<&str>) -> Result<()> {
    let config = resolver.load();
    let registry = ProviderRegistry::from_config(&config);

    println!("可用的提供方:");
    for (kind, available) in registry.availability().await {
        let resolved = ProviderConfig::resolve(&config, kind, None, api_key, None);
        let mark = if available { "✅" } else { "❌" };
        println!("  {} {:<8} 默认模型: {}", mark, kind.as_str(), resolved.model);
    }
    println!(
        "默认提供方: {}，提示词风格: {}",
        config.default_provider(),
        config.prompt_styles().join(", ")
    );
    Ok(())
}

fn print_summary(run: &WorkflowRun) {
    let stats: &Statistics = run.stats();
    println!("{}", "=".repeat(60));
    println!("运行: {}", run.run_id());
    println!("目录: {}", run.run_dir().display());
    println!(
        "步骤: {}",
        run.steps().iter().map(Step::as_str).collect::<Vec<_>>().join(", ")
    );
    if stats.downloads_attempted > 0 {
        println!(
            "下载: 成功 {} / 尝试 {}，重复 {}，过小 {}",
            stats.downloads_succeeded,
            stats.downloads_attempted,
            stats.duplicates_skipped,
            stats.undersized_skipped
        );
    }
    if stats.frames_extracted > 0 || stats.videos_failed > 0 {
        println!("视频: 抽取 {} 帧，失败 {} 个", stats.frames_extracted, stats.videos_failed);
    }
    if stats.images_converted > 0 || stats.conversion_failures > 0 {
        println!("转换: {} 张，失败 {} 张", stats.images_converted, stats.conversion_failures);
    }
    println!(
        "描述: 发现 {} 张，成功 {}，失败 {}",
        stats.images_discovered, stats.successes, stats.failures
    );
    for (step, secs) in &stats.step_durations {
        println!("  {:<9} {:.1} 秒", step.as_str(), secs);
    }
    if let Some(file) = run.descriptions_file() {
        let size = std::fs::metadata(&file).map(|m| m.len()).unwrap_or(0);
        println!("描述文件: {} ({})", file.display(), format_size(size));
    }
    if let Some(html) = run.html_report() {
        println!("HTML 报告: {}", html.display());
    }
    if !stats.failed_items.is_empty() {
        println!("失败条目:");
        for name in &stats.failed_items {
            println!("  - {}", name);
        }
    }
    if run.is_interrupted() {
        println!("⏹️ 运行被中断，可使用 --resume {} 继续", run.run_dir().display());
    }
    println!("{}", "=".repeat(60));
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let mut resolver = ConfigResolver::discover();
    if let Some(path) = &cli.config {
        anyhow::ensure!(path.is_file(), "配置文件不存在: {}", path.display());
        resolver = resolver.with_config_file(path);
    }

    if cli.list_providers {
        list_providers(&resolver, cli.api_key.as_deref())
            .await
            .context("列出提供方失败")?;
        return Ok(ExitCode::SUCCESS);
    }

    let orchestrator = Orchestrator::new(resolver);
    let cancel = orchestrator.cancellation();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("⏹️ 收到 Ctrl-C，正在停止派发新任务...");
            cancel.cancel();
        }
    });

    let steps = cli.steps().context("--steps 参数无效")?;
    match orchestrator.run(&steps, cli.params()).await {
        Ok(run) => {
            print_summary(&run);
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            eprintln!("❌ {}", e);
            if let Some(step) = e.failed_step() {
                eprintln!("失败的步骤: {}", step);
            }
            Ok(ExitCode::FAILURE)
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    logger::init();
    let cli = Cli::parse();
    info!("🚀 image_describer 启动");
    run(cli).await
}
