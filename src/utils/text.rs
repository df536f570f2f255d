use once_cell::sync::Lazy;
use regex::Regex;

static SIZE_RE: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)^\s*(\d+(?:\.\d+)?)\s*(b|k|kb|kib|m|mb|mib|g|gb|gib)?\s*$").ok());

/// 清理文件名中的非法字符
/// 处理 Windows 文件系统不支持的字符、控制字符和空白
pub fn sanitize_filename(filename: &str) -> String {
    filename
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c if c.is_whitespace() => '_',
            _ => c,
        })
        .collect::<String>()
        .trim_matches(|c: char| c == '.' || c == '_')
        .to_string()
}

/// 清理运行目录名中的一个组成部分
/// 只保留 ASCII 字母数字、`.` 和 `-`，其余连续字符折叠成一个 `_`
pub fn sanitize_label(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_underscore = false;
    for c in raw.chars() {
        if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
            out.push(c);
            last_underscore = false;
        } else if !last_underscore {
            out.push('_');
            last_underscore = true;
        }
    }
    let trimmed = out.trim_matches(|c: char| c == '_' || c == '.');
    if trimmed.is_empty() {
        "unnamed".to_string()
    } else {
        trimmed.chars().take(60).collect()
    }
}

/// 解析人类可读的大小，例如 "100KB"、"1.5MB"、"2048"
///
/// 1 KB = 1024 字节，不区分大小写。无法解析时返回 `None`。
pub fn parse_size(input: &str) -> Option<u64> {
    let re = SIZE_RE.as_ref()?;
    let caps = re.captures(input)?;
    let number: f64 = caps.get(1)?.as_str().parse().ok()?;
    let unit = caps
        .get(2)
        .map(|m| m.as_str().to_ascii_lowercase())
        .unwrap_or_default();
    let multiplier: f64 = match unit.as_str() {
        "" | "b" => 1.0,
        "k" | "kb" | "kib" => 1024.0,
        "m" | "mb" | "mib" => 1024.0 * 1024.0,
        "g" | "gb" | "gib" => 1024.0 * 1024.0 * 1024.0,
        _ => return None,
    };
    Some((number * multiplier).round() as u64)
}

/// 把字节数格式化成便于日志阅读的字符串
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size_units() {
        assert_eq!(parse_size("100KB"), Some(100 * 1024));
        assert_eq!(parse_size("100kb"), Some(100 * 1024));
        assert_eq!(parse_size(" 2 MB "), Some(2 * 1024 * 1024));
        assert_eq!(parse_size("1.5M"), Some(1536 * 1024));
        assert_eq!(parse_size("512"), Some(512));
        assert_eq!(parse_size("1GB"), Some(1024 * 1024 * 1024));
    }

    #[test]
    fn test_parse_size_rejects_garbage() {
        assert_eq!(parse_size(""), None);
        assert_eq!(parse_size("KB"), None);
        assert_eq!(parse_size("10 TB"), None);
        assert_eq!(parse_size("-5KB"), None);
    }

    #[test]
    fn test_sanitize_label() {
        assert_eq!(sanitize_label("llava:7b"), "llava_7b");
        assert_eq!(sanitize_label("example.com/gallery?x=1"), "example.com_gallery_x_1");
        assert_eq!(sanitize_label("///"), "unnamed");
        assert_eq!(sanitize_label("我的 照片"), "unnamed");
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("a/b:c?.jpg"), "a_b_c_.jpg");
        assert_eq!(sanitize_filename("my photo.png"), "my_photo.png");
        assert_eq!(sanitize_filename("../secret"), "secret");
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(10), "10 B");
        assert_eq!(format_size(2048), "2.0 KB");
    }
}
