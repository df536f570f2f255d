//! 格式转换：统一成提供方都能接受、尺寸受限的 JPEG / PNG

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{ImageFormat, ImageReader};
use std::io::Cursor;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::models::{CancellationFlag, StatsHandle, Step};
use crate::utils::{file_name_string, list_images, unique_path_for_content};

#[derive(Debug, Clone, Copy)]
pub struct ConvertOptions {
    pub max_dimension: u32,
    pub jpeg_quality: u8,
}

impl Default for ConvertOptions {
    fn default() -> Self {
        Self {
            max_dimension: 2048,
            jpeg_quality: 90,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConvertReport {
    /// 重新编码的数量
    pub converted: usize,
    /// 原样复制的数量
    pub copied: usize,
    /// 输出目录里已有相同内容而跳过的数量
    pub existing: usize,
    pub failures: Vec<(String, String)>,
}

enum Plan {
    Copy,
    Reencode,
    Existing,
}

pub struct ImageConverter {
    options: ConvertOptions,
    stats: StatsHandle,
    cancel: CancellationFlag,
}

impl ImageConverter {
    pub fn new(options: ConvertOptions, stats: StatsHandle, cancel: CancellationFlag) -> Self {
        Self {
            options,
            stats,
            cancel,
        }
    }

    pub async fn convert_all(&self, input: &Path, output: &Path) -> std::io::Result<ConvertReport> {
        tokio::fs::create_dir_all(output).await?;
        let mut report = ConvertReport::default();

        for path in list_images(input)? {
            if self.cancel.is_cancelled() {
                warn!("⏹️ 转换已取消");
                break;
            }
            let name = file_name_string(&path);
            match self.convert_one(&path, output).await {
                Ok(Plan::Copy) => report.copied += 1,
                Ok(Plan::Existing) => report.existing += 1,
                Ok(Plan::Reencode) => {
                    report.converted += 1;
                    self.stats.update(|s| s.images_converted += 1);
                }
                Err(reason) => {
                    warn!("❌ 处理 '{}' 时出错: {}", name, reason);
                    self.stats.update(|s| {
                        s.conversion_failures += 1;
                        s.add_stage_failure(Step::Convert, &name);
                    });
                    report.failures.push((name, reason));
                }
            }
        }

        info!(
            "转换完成: 重新编码 {}，复制 {}，已存在 {}，失败 {}",
            report.converted,
            report.copied,
            report.existing,
            report.failures.len()
        );
        Ok(report)
    }

    async fn convert_one(&self, path: &Path, output: &Path) -> Result<Plan, String> {
        let data = tokio::fs::read(path).await.map_err(|e| e.to_string())?;
        let name = file_name_string(path);

        let reader = ImageReader::new(Cursor::new(&data))
            .with_guessed_format()
            .map_err(|e| e.to_string())?;
        let format = reader
            .format()
            .ok_or_else(|| "无法识别的图片格式".to_string())?;
        let (width, height) = reader.into_dimensions().map_err(|e| e.to_string())?;
        let within = width.max(height) <= self.options.max_dimension;

        if within && matches!(format, ImageFormat::Jpeg | ImageFormat::Png) {
            let Some(target) = unique_path_for_content(output, &name, &data) else {
                debug!("{} 已在输出目录中，跳过", name);
                return Ok(Plan::Existing);
            };
            debug!("{} 无需转换，直接复制", name);
            tokio::fs::write(target, &data)
                .await
                .map_err(|e| e.to_string())?;
            return Ok(Plan::Copy);
        }

        let options = self.options;
        let encoded = tokio::task::spawn_blocking(move || reencode(&data, options))
            .await
            .map_err(|e| format!("转换任务异常: {}", e))??;

        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "image".to_string());
        let Some(target) = unique_path_for_content(output, &format!("{}.jpg", stem), &encoded) else {
            debug!("{} 的转换结果已存在，跳过", name);
            return Ok(Plan::Existing);
        };
        tokio::fs::write(&target, encoded)
            .await
            .map_err(|e| e.to_string())?;
        debug!("{} -> {}", name, target.display());
        Ok(Plan::Reencode)
    }
}

/// 解码、按最长边缩小、编码为 JPEG
fn reencode(data: &[u8], options: ConvertOptions) -> Result<Vec<u8>, String> {
    let mut img = image::load_from_memory(data).map_err(|e| format!("解码失败: {}", e))?;
    let max = options.max_dimension.max(1);
    if img.width() > max || img.height() > max {
        img = img.resize(max, max, FilterType::Lanczos3);
    }
    let rgb = img.to_rgb8();
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, options.jpeg_quality.clamp(1, 100))
        .encode_image(&rgb)
        .map_err(|e| format!("编码失败: {}", e))?;
    Ok(out)
}
