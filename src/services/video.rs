//! 视频抽帧：调用 ffmpeg 每隔固定秒数导出一帧 JPEG

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::models::{CancellationFlag, StatsHandle, Step};
use crate::utils::{
    file_name_string, is_image_file, is_video_file, list_files_sorted, sanitize_filename,
    unique_path_for_content,
};

#[derive(Debug, Clone, Default)]
pub struct VideoReport {
    pub videos: usize,
    pub frames: usize,
    /// 原样复制过去的图片
    pub copied: usize,
    /// 输出目录里已有相同内容而跳过的图片
    pub existing: usize,
    pub failures: Vec<(String, String)>,
}

pub struct FrameExtractor {
    ffmpeg: PathBuf,
    interval_secs: f64,
    stats: StatsHandle,
    cancel: CancellationFlag,
}

impl FrameExtractor {
    pub fn new(ffmpeg: PathBuf, interval_secs: f64, stats: StatsHandle, cancel: CancellationFlag) -> Self {
        let interval_secs = if interval_secs > 0.0 { interval_secs } else { 5.0 };
        Self {
            ffmpeg,
            interval_secs,
            stats,
            cancel,
        }
    }

    /// 处理输入目录：视频抽帧，图片原样复制，结果都写入 `output`
    pub async fn extract_all(&self, input: &Path, output: &Path) -> std::io::Result<VideoReport> {
        tokio::fs::create_dir_all(output).await?;
        let files = list_files_sorted(input, |p| is_video_file(p) || is_image_file(p))?;
        let mut report = VideoReport::default();
        let mut prefixes = HashSet::new();

        for path in files {
            if self.cancel.is_cancelled() {
                warn!("⏹️ 抽帧已取消");
                break;
            }
            let name = file_name_string(&path);

            if is_image_file(&path) {
                let data = tokio::fs::read(&path).await?;
                match unique_path_for_content(output, &name, &data) {
                    Some(target) => {
                        tokio::fs::write(target, &data).await?;
                        report.copied += 1;
                    }
                    None => report.existing += 1,
                }
                continue;
            }

            report.videos += 1;
            let prefix = frame_prefix(&path, &mut prefixes);
            match self.extract(&path, &prefix, output).await {
                Ok(frames) => {
                    info!("🎞️ {} 导出 {} 帧", name, frames);
                    report.frames += frames;
                    self.stats.update(|s| s.frames_extracted += frames);
                }
                Err(reason) => {
                    warn!("❌ 处理 '{}' 时出错: {}", name, reason);
                    self.stats.update(|s| {
                        s.videos_failed += 1;
                        s.add_stage_failure(Step::Video, &name);
                    });
                    report.failures.push((name, reason));
                }
            }
        }

        info!(
            "视频步骤完成: 视频 {}，帧 {}，复制图片 {}，失败 {}",
            report.videos,
            report.frames,
            report.copied,
            report.failures.len()
        );
        Ok(report)
    }

    async fn extract(&self, video: &Path, prefix: &str, output: &Path) -> Result<usize, String> {
        // 清掉上一次留下的同前缀帧，之后的计数只包含本次导出的文件
        for stale in frame_files(output, prefix)? {
            tokio::fs::remove_file(&stale)
                .await
                .map_err(|e| format!("无法删除旧帧 {}: {}", stale.display(), e))?;
        }
        let pattern = output.join(format!("{}%04d.jpg", prefix));

        debug!("ffmpeg 抽帧: {} -> {}", video.display(), pattern.display());
        let result = Command::new(&self.ffmpeg)
            .arg("-hide_banner")
            .args(["-loglevel", "error", "-y", "-i"])
            .arg(video)
            .arg("-vf")
            .arg(format!("fps=1/{}", self.interval_secs))
            .args(["-q:v", "2"])
            .arg(&pattern)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| format!("无法启动 ffmpeg ({}): {}", self.ffmpeg.display(), e))?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            let last = stderr.lines().last().unwrap_or("").trim().to_string();
            return Err(format!("ffmpeg 退出码 {:?}: {}", result.status.code(), last));
        }

        let frames = frame_files(output, prefix)?.len();
        if frames == 0 {
            return Err("没有导出任何帧".to_string());
        }
        Ok(frames)
    }
}

/// 帧文件名前缀：`<文件名>_<扩展名>_frame_`，同一批里重名时追加序号
fn frame_prefix(video: &Path, used: &mut HashSet<String>) -> String {
    let clean = |s: &std::ffi::OsStr| sanitize_filename(&s.to_string_lossy()).replace('%', "_");
    let stem = video
        .file_stem()
        .map(clean)
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "video".to_string());
    let base = match video.extension().map(clean) {
        Some(ext) => format!("{}_{}", stem, ext.to_ascii_lowercase()),
        None => stem,
    };
    let mut prefix = format!("{}_frame_", base);
    let mut counter = 1;
    while !used.insert(prefix.clone()) {
        counter += 1;
        prefix = format!("{}_{}_frame_", base, counter);
    }
    prefix
}

/// 输出目录中形如 `<prefix>0001.jpg` 的帧文件
fn frame_files(output: &Path, prefix: &str) -> Result<Vec<PathBuf>, String> {
    list_files_sorted(output, |p| {
        file_name_string(p)
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_suffix(".jpg"))
            .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
    })
    .map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::files::test_support::{temp_dir, write_jpeg};
    use crate::utils::list_images;

    #[tokio::test]
    async fn test_images_pass_through_and_missing_ffmpeg_fails_item() {
        let input = temp_dir("video_in");
        let output = temp_dir("video_out");
        write_jpeg(&input.join("still.jpg"), 16, 16, [1, 2, 3]);
        std::fs::write(input.join("clip.mp4"), b"not a real video").unwrap();
        std::fs::write(input.join("readme.txt"), b"ignored").unwrap();

        let stats = StatsHandle::new();
        let extractor = FrameExtractor::new(
            PathBuf::from("/nonexistent/bin/ffmpeg"),
            5.0,
            stats.clone(),
            CancellationFlag::new(),
        );
        let report = extractor.extract_all(&input, &output).await.unwrap();

        assert_eq!(report.copied, 1);
        assert_eq!(report.videos, 1);
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].1.contains("ffmpeg"));
        assert_eq!(list_images(&output).unwrap().len(), 1);

        let snap = stats.snapshot();
        assert_eq!(snap.videos_failed, 1);
        assert_eq!(snap.failed_items, vec!["video: clip.mp4".to_string()]);

        std::fs::remove_dir_all(input).ok();
        std::fs::remove_dir_all(output).ok();
    }

    #[tokio::test]
    #[ignore = "需要本机安装 ffmpeg"]
    async fn test_real_ffmpeg_extracts_frames() {
        let input = temp_dir("video_real_in");
        let output = temp_dir("video_real_out");
        let clip = input.join("test pattern.mp4");
        let status = std::process::Command::new("ffmpeg")
            .args(["-loglevel", "error", "-f", "lavfi", "-i", "testsrc=duration=3:size=320x240:rate=10"])
            .arg(&clip)
            .status()
            .unwrap();
        assert!(status.success());

        let extractor = FrameExtractor::new(PathBuf::from("ffmpeg"), 1.0, StatsHandle::new(), CancellationFlag::new());
        let report = extractor.extract_all(&input, &output).await.unwrap();
        assert!(report.frames >= 2);
        assert!(list_images(&output).unwrap()[0]
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("test_pattern_mp4_frame_"));

        std::fs::remove_dir_all(input).ok();
        std::fs::remove_dir_all(output).ok();
    }

    #[test]
    fn test_frame_prefix_keeps_extension_and_dedups() {
        let mut used = HashSet::new();
        assert_eq!(frame_prefix(Path::new("in/clip.mp4"), &mut used), "clip_mp4_frame_");
        assert_eq!(frame_prefix(Path::new("in/clip.MOV"), &mut used), "clip_mov_frame_");
        assert_eq!(frame_prefix(Path::new("in/clip.mov"), &mut used), "clip_mov_2_frame_");
        assert_eq!(frame_prefix(Path::new("in/50%.mkv"), &mut used), "50__mkv_frame_");
    }

    /// 假 ffmpeg：按输出模板写两帧
    #[cfg(unix)]
    fn fake_ffmpeg(dir: &Path) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let script = dir.join("ffmpeg");
        std::fs::write(
            &script,
            "#!/bin/sh\nfor last; do :; done\nprintf x > \"$(printf \"$last\" 1)\"\nprintf x > \"$(printf \"$last\" 2)\"\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        script
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_same_stem_videos_keep_their_own_frames() {
        let bin = temp_dir("video_bin");
        let input = temp_dir("video_stem_in");
        let output = temp_dir("video_stem_out");
        std::fs::write(input.join("clip.mp4"), b"first").unwrap();
        std::fs::write(input.join("clip.mov"), b"second").unwrap();
        write_jpeg(&input.join("still.jpg"), 8, 8, [9, 9, 9]);

        let stats = StatsHandle::new();
        let extractor = FrameExtractor::new(fake_ffmpeg(&bin), 1.0, stats.clone(), CancellationFlag::new());
        let first = extractor.extract_all(&input, &output).await.unwrap();
        assert_eq!(first.frames, 4);
        assert_eq!(first.copied, 1);
        assert_eq!(stats.snapshot().frames_extracted, 4);

        // 再跑一次：帧被覆盖，图片不再复制
        let second = extractor.extract_all(&input, &output).await.unwrap();
        assert_eq!(second.frames, 4);
        assert_eq!((second.copied, second.existing), (0, 1));

        let names: Vec<String> = list_images(&output)
            .unwrap()
            .iter()
            .map(|p| file_name_string(p))
            .collect();
        assert_eq!(
            names,
            vec![
                "clip_mov_frame_0001.jpg",
                "clip_mov_frame_0002.jpg",
                "clip_mp4_frame_0001.jpg",
                "clip_mp4_frame_0002.jpg",
                "still.jpg",
            ]
        );

        for dir in [bin, input, output] {
            std::fs::remove_dir_all(dir).ok();
        }
    }
}
