//! 网页图片下载：抓取页面、提取图片地址、逐个下载并去重

use async_trait::async_trait;
use reqwest::Url;
use scraper::{Html, Selector};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::error::{DownloadError, FetchError};
use crate::models::{CancellationFlag, StatsHandle, Step};
use crate::utils::{
    content_hash, is_image_file, list_images, sanitize_filename, unique_path, IMAGE_EXTENSIONS,
};

const USER_AGENT: &str = "Mozilla/5.0 (compatible; image_describer/0.1)";

/// HTTP 抓取接口，测试中替换为 MockFetcher
#[async_trait]
pub trait HttpFetcher: Send + Sync {
    async fn fetch_text(&self, url: &str) -> Result<String, FetchError>;

    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

#[derive(Debug, Clone)]
pub struct ReqwestFetcher {
    inner: reqwest::Client,
}

impl ReqwestFetcher {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let inner = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self { inner })
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response, FetchError> {
        let parsed = Url::parse(url).map_err(|_| FetchError::InvalidUrl(url.to_string()))?;
        let response = self.inner.get(parsed).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl HttpFetcher for ReqwestFetcher {
    async fn fetch_text(&self, url: &str) -> Result<String, FetchError> {
        Ok(self.get(url).await?.text().await?)
    }

    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        Ok(self.get(url).await?.bytes().await?.to_vec())
    }
}

// ============================================================================
// 提取图片地址
// ============================================================================

const IMG_ATTRS: [&str; 4] = ["src", "data-src", "data-original", "data-lazy-src"];

fn selector(css: &str) -> Result<Selector, DownloadError> {
    Selector::parse(css).map_err(|e| DownloadError::Selector(format!("{}: {}", css, e)))
}

/// `srcset` 中每一项的第一个字段是地址
fn srcset_urls(srcset: &str) -> impl Iterator<Item = &str> {
    srcset
        .split(',')
        .filter_map(|entry| entry.split_whitespace().next())
}

/// 从 HTML 中提取候选图片地址，相对地址按页面地址解析，保持首次出现的顺序
pub fn extract_image_urls(html: &str, base: &Url) -> Result<Vec<String>, DownloadError> {
    let document = Html::parse_document(html);
    let mut raw: Vec<&str> = Vec::new();

    for img in document.select(&selector("img")?) {
        let el = img.value();
        raw.extend(IMG_ATTRS.iter().filter_map(|attr| el.attr(attr)));
        if let Some(srcset) = el.attr("srcset") {
            raw.extend(srcset_urls(srcset));
        }
    }

    for source in document.select(&selector("source[srcset]")?) {
        if let Some(srcset) = source.value().attr("srcset") {
            raw.extend(srcset_urls(srcset));
        }
    }

    let meta = selector(
        r#"meta[property="og:image"], meta[name="twitter:image"], meta[property="twitter:image"], link[rel="image_src"]"#,
    )?;
    for el in document.select(&meta) {
        raw.extend(el.value().attr("content").or_else(|| el.value().attr("href")));
    }

    let anchors: Vec<&str> = document
        .select(&selector("a[href]")?)
        .filter_map(|a| a.value().attr("href"))
        .collect();

    let mut seen = HashSet::new();
    let mut urls = Vec::new();
    let mut push = |candidate: &str, require_image_ext: bool| {
        let Some(url) = resolve_url(base, candidate) else {
            return;
        };
        if require_image_ext && !is_image_file(Path::new(url.path())) {
            return;
        }
        let url = url.to_string();
        if seen.insert(url.clone()) {
            urls.push(url);
        }
    };
    for candidate in raw {
        push(candidate, false);
    }
    for href in anchors {
        push(href, true);
    }

    debug!("页面中提取到 {} 个候选图片地址", urls.len());
    Ok(urls)
}

fn resolve_url(base: &Url, raw: &str) -> Option<Url> {
    let raw = raw.trim();
    if raw.is_empty() || raw.starts_with("data:") {
        return None;
    }
    let mut url = base.join(raw).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    url.set_fragment(None);
    Some(url)
}

/// 检测到的格式对应的扩展名，只接受后续步骤能列出的图片格式
fn accepted_extension(format: image::ImageFormat) -> Option<&'static str> {
    format
        .extensions_str()
        .iter()
        .copied()
        .find(|ext| IMAGE_EXTENSIONS.contains(*ext))
}

/// 文件名取自地址的最后一段，扩展名改成实际检测到的格式
fn file_name_for(url: &str, ext: &str) -> String {
    let stem = Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|segments| segments.filter(|s| !s.is_empty()).last().map(str::to_string))
        })
        .map(|segment| {
            urlencoding::decode(&segment)
                .map(|s| s.into_owned())
                .unwrap_or_else(|_| segment.clone())
        })
        .map(|name| {
            let path = PathBuf::from(sanitize_filename(&name));
            path.file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default()
        })
        .filter(|stem| !stem.is_empty())
        .unwrap_or_else(|| format!("image_{}", uuid::Uuid::new_v4().simple()));
    format!("{}.{}", stem, ext)
}

// ============================================================================
// 下载
// ============================================================================

#[derive(Debug, Clone)]
pub struct DownloadOptions {
    /// 小于该字节数的图片被丢弃
    pub min_size: u64,
    /// 目标目录中最多保留多少张图片（已有文件也算）
    pub max_images: Option<usize>,
    pub delay: Duration,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            min_size: 0,
            max_images: None,
            delay: Duration::from_millis(500),
        }
    }
}

/// 成功接收的一个候选
#[derive(Debug, Clone)]
pub struct DownloadCandidate {
    pub url: String,
    pub size: u64,
    pub hash: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct DownloadReport {
    pub candidates: Vec<String>,
    pub attempted: usize,
    pub saved: Vec<DownloadCandidate>,
    pub duplicates: usize,
    pub undersized: usize,
    /// (地址, 原因)
    pub failures: Vec<(String, String)>,
}

pub struct Downloader<'a> {
    fetcher: &'a dyn HttpFetcher,
    stats: StatsHandle,
    cancel: CancellationFlag,
}

impl<'a> Downloader<'a> {
    pub fn new(fetcher: &'a dyn HttpFetcher, stats: StatsHandle, cancel: CancellationFlag) -> Self {
        Self {
            fetcher,
            stats,
            cancel,
        }
    }

    /// 抓取页面并把图片保存到 `target`
    ///
    /// 只有页面本身抓取失败会返回错误，单个候选失败只记录。
    pub async fn download(
        &self,
        page_url: &str,
        target: &Path,
        options: &DownloadOptions,
    ) -> Result<DownloadReport, DownloadError> {
        let base = Url::parse(page_url).map_err(|_| DownloadError::PageFetch {
            url: page_url.to_string(),
            source: FetchError::InvalidUrl(page_url.to_string()),
        })?;

        info!("🌐 正在抓取页面: {}", page_url);
        let html = self
            .fetcher
            .fetch_text(page_url)
            .await
            .map_err(|source| DownloadError::PageFetch {
                url: page_url.to_string(),
                source,
            })?;

        let mut report = DownloadReport {
            candidates: extract_image_urls(&html, &base)?,
            ..Default::default()
        };
        info!("🔍 找到 {} 个候选图片", report.candidates.len());

        tokio::fs::create_dir_all(target).await?;
        let (mut known_hashes, mut stored) = self.existing_hashes(target).await?;
        if stored > 0 {
            info!("📁 目标目录已有 {} 张图片", stored);
        }

        for url in report.candidates.clone() {
            if options.max_images.is_some_and(|max| stored >= max) {
                info!("已达到图片数量上限 {:?}，停止下载", options.max_images);
                break;
            }
            if self.cancel.is_cancelled() {
                warn!("⏹️ 下载已取消");
                break;
            }
            if report.attempted > 0 && !options.delay.is_zero() {
                sleep(options.delay).await;
            }

            report.attempted += 1;
            self.stats.update(|s| s.downloads_attempted += 1);

            match self.fetch_candidate(&url, &known_hashes, options).await {
                Ok(Candidate::Accepted { data, ext, hash }) => {
                    let path = unique_path(target, &file_name_for(&url, ext));
                    if let Err(e) = tokio::fs::write(&path, &data).await {
                        warn!("❌ 保存 '{}' 时出错: {}", path.display(), e);
                        self.stats
                            .update(|s| s.add_stage_failure(Step::Download, &url));
                        report.failures.push((url, DownloadError::Io(e).to_string()));
                        continue;
                    }
                    debug!("💾 已保存 {} -> {}", url, path.display());
                    known_hashes.insert(hash.clone());
                    stored += 1;
                    self.stats.update(|s| s.downloads_succeeded += 1);
                    report.saved.push(DownloadCandidate {
                        url,
                        size: data.len() as u64,
                        hash,
                        path,
                    });
                }
                Ok(Candidate::Duplicate) => {
                    debug!("重复图片，跳过: {}", url);
                    report.duplicates += 1;
                    self.stats.update(|s| s.duplicates_skipped += 1);
                }
                Ok(Candidate::Undersized(size)) => {
                    debug!("图片过小（{} 字节），跳过: {}", size, url);
                    report.undersized += 1;
                    self.stats.update(|s| s.undersized_skipped += 1);
                }
                Err(e) => {
                    warn!("❌ 下载 '{}' 时出错: {}", url, e);
                    self.stats
                        .update(|s| s.add_stage_failure(Step::Download, &url));
                    report.failures.push((url, e.to_string()));
                }
            }
        }

        info!(
            "✅ 下载完成: 尝试 {}，保存 {}，重复 {}，过小 {}，失败 {}",
            report.attempted,
            report.saved.len(),
            report.duplicates,
            report.undersized,
            report.failures.len()
        );
        Ok(report)
    }

    async fn existing_hashes(&self, target: &Path) -> Result<(HashSet<String>, usize), DownloadError> {
        let mut hashes = HashSet::new();
        let existing = list_images(target)?;
        for path in &existing {
            match tokio::fs::read(path).await {
                Ok(data) => {
                    hashes.insert(content_hash(&data));
                }
                Err(e) => warn!("读取已有文件失败 {}: {}", path.display(), e),
            }
        }
        Ok((hashes, existing.len()))
    }

    async fn fetch_candidate(
        &self,
        url: &str,
        known_hashes: &HashSet<String>,
        options: &DownloadOptions,
    ) -> Result<Candidate, DownloadError> {
        let data = self.fetcher.fetch_bytes(url).await?;
        let hash = content_hash(&data);
        if known_hashes.contains(&hash) {
            return Ok(Candidate::Duplicate);
        }
        if (data.len() as u64) < options.min_size {
            return Ok(Candidate::Undersized(data.len() as u64));
        }
        let ext = image::guess_format(&data)
            .ok()
            .and_then(accepted_extension)
            .ok_or(DownloadError::NotAnImage)?;
        Ok(Candidate::Accepted { data, ext, hash })
    }
}

enum Candidate {
    Accepted {
        data: Vec<u8>,
        ext: &'static str,
        hash: String,
    },
    Duplicate,
    Undersized(u64),
}
