use sha1::{Digest, Sha1};
use std::io;
use std::path::{Path, PathBuf};

/// 工作流能识别的全部图片扩展名（小写）
pub static IMAGE_EXTENSIONS: phf::Set<&'static str> = phf::phf_set! {
    "jpg", "jpeg", "png", "gif", "bmp", "webp", "tif", "tiff", "heic", "heif",
};

/// 视频扩展名（小写）
pub static VIDEO_EXTENSIONS: phf::Set<&'static str> = phf::phf_set! {
    "mp4", "mov", "avi", "mkv", "webm", "m4v", "wmv",
};

fn extension_lower(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

pub fn is_image_file(path: &Path) -> bool {
    extension_lower(path).is_some_and(|e| IMAGE_EXTENSIONS.contains(e.as_str()))
}

pub fn is_video_file(path: &Path) -> bool {
    extension_lower(path).is_some_and(|e| VIDEO_EXTENSIONS.contains(e.as_str()))
}

/// 计算内容哈希（SHA-1，十六进制）
pub fn content_hash(data: &[u8]) -> String {
    hex::encode(Sha1::digest(data))
}

/// 列出目录下满足条件的文件，按文件名排序
///
/// 不递归子目录。排序结果就是整个工作流使用的"目录顺序"。
pub fn list_files_sorted(dir: &Path, filter: impl Fn(&Path) -> bool) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_file() && filter(&path) {
            files.push(path);
        }
    }
    files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(files)
}

pub fn list_images(dir: &Path) -> io::Result<Vec<PathBuf>> {
    list_files_sorted(dir, is_image_file)
}

/// 依次给出 `name`、`stem_1.ext`、`stem_2.ext` ... 形式的候选路径
fn numbered_paths<'a>(dir: &'a Path, file_name: &'a str) -> impl Iterator<Item = PathBuf> + 'a {
    let path = Path::new(file_name);
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("file");
    let ext = path.extension().and_then(|e| e.to_str());
    std::iter::once(dir.join(file_name)).chain((1..).map(move |counter| {
        let name = match ext {
            Some(ext) => format!("{}_{}.{}", stem, counter, ext),
            None => format!("{}_{}", stem, counter),
        };
        dir.join(name)
    }))
}

/// 返回目录中不存在的文件路径，冲突时追加 `_1`、`_2` ...
pub fn unique_path(dir: &Path, file_name: &str) -> PathBuf {
    numbered_paths(dir, file_name)
        .find(|candidate| !candidate.exists())
        .unwrap_or_else(|| dir.join(file_name))
}

/// 和 `unique_path` 相同，但同名序列里已有内容相同的文件时返回 `None`
///
/// 重复执行同一步骤时用它避免写出 `_1` 副本。
pub fn unique_path_for_content(dir: &Path, file_name: &str, data: &[u8]) -> Option<PathBuf> {
    let hash = content_hash(data);
    for candidate in numbered_paths(dir, file_name) {
        if !candidate.exists() {
            return Some(candidate);
        }
        if std::fs::read(&candidate).is_ok_and(|existing| content_hash(&existing) == hash) {
            return None;
        }
    }
    None
}

pub fn file_name_string(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::PathBuf;

    /// 在系统临时目录下创建一个唯一的测试目录
    pub fn temp_dir(prefix: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("{}_{}", prefix, uuid::Uuid::new_v4().simple()));
        std::fs::create_dir_all(&dir).expect("create temp dir");
        dir
    }

    /// 生成一张指定尺寸的纯色 JPEG
    pub fn write_jpeg(path: &std::path::Path, width: u32, height: u32, rgb: [u8; 3]) {
        let img = image::RgbImage::from_pixel(width, height, image::Rgb(rgb));
        img.save(path).expect("write jpeg");
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::temp_dir;
    use super::*;

    #[test]
    fn test_extension_filters() {
        assert!(is_image_file(Path::new("a/B.JPG")));
        assert!(is_image_file(Path::new("x.heic")));
        assert!(!is_image_file(Path::new("notes.txt")));
        assert!(is_video_file(Path::new("clip.MP4")));
        assert!(!is_video_file(Path::new("clip")));
    }

    #[test]
    fn test_content_hash_is_stable() {
        assert_eq!(content_hash(b"abc"), "a9993e364706816aba3e25717850c26c9cd0d89d");
        assert_ne!(content_hash(b"abc"), content_hash(b"abd"));
    }

    #[test]
    fn test_list_images_sorted_and_filtered() {
        let dir = temp_dir("files_list");
        for name in ["b.png", "a.jpg", "c.txt", "C.gif"] {
            std::fs::write(dir.join(name), b"x").unwrap();
        }
        std::fs::create_dir_all(dir.join("nested.jpg")).unwrap();
        let names: Vec<String> = list_images(&dir)
            .unwrap()
            .iter()
            .map(|p| file_name_string(p))
            .collect();
        assert_eq!(names, vec!["C.gif", "a.jpg", "b.png"]);
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_unique_path_appends_counter() {
        let dir = temp_dir("files_unique");
        assert_eq!(unique_path(&dir, "x.jpg"), dir.join("x.jpg"));
        std::fs::write(dir.join("x.jpg"), b"1").unwrap();
        std::fs::write(dir.join("x_1.jpg"), b"2").unwrap();
        assert_eq!(unique_path(&dir, "x.jpg"), dir.join("x_2.jpg"));
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_unique_path_for_content_skips_identical_copies() {
        let dir = temp_dir("files_content");
        assert_eq!(unique_path_for_content(&dir, "x.jpg", b"1"), Some(dir.join("x.jpg")));
        std::fs::write(dir.join("x.jpg"), b"1").unwrap();
        std::fs::write(dir.join("x_1.jpg"), b"2").unwrap();
        assert_eq!(unique_path_for_content(&dir, "x.jpg", b"1"), None);
        assert_eq!(unique_path_for_content(&dir, "x.jpg", b"2"), None);
        assert_eq!(unique_path_for_content(&dir, "x.jpg", b"3"), Some(dir.join("x_2.jpg")));
        std::fs::remove_dir_all(dir).ok();
    }
}
