//! 描述汇总文件与 HTML 报告

use chrono::{Local, NaiveDateTime, TimeZone};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use crate::models::{DescriptionResult, Prompt, Statistics};

pub const DESCRIPTIONS_FILE: &str = "image_descriptions.txt";
pub const HTML_FILE: &str = "index.html";
const SEPARATOR_WIDTH: usize = 80;
const CREATED_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const FAILED_HEADER: &str = "Failed images:";
const SOURCE_HEADER: &str = "# Source: ";

fn separator() -> String {
    "-".repeat(SEPARATOR_WIDTH)
}

/// 汇总文件中的一条描述
#[derive(Debug, Clone, PartialEq)]
pub struct ReportEntry {
    pub file_name: String,
    pub description: String,
    pub provider: String,
    pub model: String,
    pub prompt_style: String,
    pub created: String,
}

impl ReportEntry {
    pub fn from_result(file_name: &str, result: &DescriptionResult) -> Self {
        Self {
            file_name: file_name.to_string(),
            description: result.description.trim().to_string(),
            provider: result.provider.clone(),
            model: result.model.clone(),
            prompt_style: result.prompt_style.clone(),
            created: result.created.format(CREATED_FORMAT).to_string(),
        }
    }

    /// 还原成描述结果（断点续跑时使用），提示词原文取当前配置
    pub fn to_result(&self, prompt: &Prompt) -> DescriptionResult {
        let mut result = DescriptionResult::new(
            &self.provider,
            &self.model,
            &Prompt {
                style: self.prompt_style.clone(),
                text: prompt.text.clone(),
            },
            self.description.clone(),
        );
        if let Some(created) = NaiveDateTime::parse_from_str(&self.created, CREATED_FORMAT)
            .ok()
            .and_then(|dt| Local.from_local_datetime(&dt).single())
        {
            result.created = created;
        }
        result
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DescriptionsDocument {
    /// 被描述图片所在目录
    pub source_dir: Option<PathBuf>,
    pub entries: Vec<ReportEntry>,
    /// (文件名, 原因)
    pub failures: Vec<(String, String)>,
}

impl DescriptionsDocument {
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# Image Descriptions");
        if let Some(dir) = &self.source_dir {
            let _ = writeln!(out, "{}{}", SOURCE_HEADER, dir.display());
        }
        let _ = writeln!(out, "# Generated: {}", Local::now().format(CREATED_FORMAT));
        let _ = writeln!(out, "# Images described: {}", self.entries.len());
        out.push('\n');

        for entry in &self.entries {
            let _ = writeln!(out, "File: {}", entry.file_name);
            let _ = writeln!(out, "{}", entry.description);
            out.push('\n');
            let _ = writeln!(out, "Provider: {}", entry.provider);
            let _ = writeln!(out, "Model: {}", entry.model);
            let _ = writeln!(out, "Prompt: {}", entry.prompt_style);
            let _ = writeln!(out, "Created: {}", entry.created);
            let _ = writeln!(out, "{}", separator());
            out.push('\n');
        }

        if !self.failures.is_empty() {
            let _ = writeln!(out, "{}", FAILED_HEADER);
            for (name, reason) in &self.failures {
                let _ = writeln!(out, "{}: {}", name, reason.replace('\n', " "));
            }
        }
        out
    }

    pub fn parse(raw: &str) -> Self {
        let mut doc = Self::default();
        let separator = separator();
        let mut block: Vec<&str> = Vec::new();
        let mut in_failures = false;

        for line in raw.lines() {
            if in_failures {
                if let Some((name, reason)) = line.split_once(": ") {
                    doc.failures.push((name.trim().to_string(), reason.trim().to_string()));
                }
                continue;
            }
            if line.trim_end() == separator {
                doc.entries.extend(parse_block(&block));
                block.clear();
            } else if line.trim_end() == FAILED_HEADER {
                in_failures = true;
            } else if !line.starts_with('#') || !block.is_empty() {
                block.push(line);
            } else if let Some(dir) = line.strip_prefix(SOURCE_HEADER) {
                doc.source_dir = Some(PathBuf::from(dir.trim()));
            }
        }
        doc.entries.extend(parse_block(&block));
        doc
    }

    pub fn read(path: &Path) -> std::io::Result<Self> {
        Ok(Self::parse(&std::fs::read_to_string(path)?))
    }

    pub fn write(&self, path: &Path) -> std::io::Result<()> {
        std::fs::write(path, self.render())
    }
}

const META_KEYS: [&str; 4] = ["Provider: ", "Model: ", "Prompt: ", "Created: "];

fn parse_block(lines: &[&str]) -> Option<ReportEntry> {
    let start = lines.iter().position(|l| l.starts_with("File: "))?;
    let file_name = lines[start]["File: ".len()..].trim().to_string();
    let body = &lines[start + 1..];

    // 末尾四行元数据，顺序固定
    let mut end = body.len();
    while end > 0 && body[end - 1].trim().is_empty() {
        end -= 1;
    }
    let has_meta = end >= META_KEYS.len()
        && body[end - META_KEYS.len()..end]
            .iter()
            .zip(META_KEYS)
            .all(|(line, key)| line.starts_with(key));
    let meta_start = if has_meta { end - META_KEYS.len() } else { end };
    let meta = |key: &str| {
        body[meta_start..end]
            .iter()
            .find_map(|l| l.strip_prefix(key))
            .map(|v| v.trim().to_string())
            .unwrap_or_default()
    };

    Some(ReportEntry {
        description: body[..meta_start].join("\n").trim().to_string(),
        provider: meta(META_KEYS[0]),
        model: meta(META_KEYS[1]),
        prompt_style: meta(META_KEYS[2]),
        created: meta(META_KEYS[3]),
        file_name,
    })
}

// ============================================================================
// HTML
// ============================================================================

pub fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// 图片在 HTML 中的引用前缀：位于运行目录内时用相对路径，否则用绝对路径
pub fn image_prefix(run_dir: &Path, html_dir: &Path, image_dir: &Path) -> String {
    match image_dir.strip_prefix(run_dir) {
        Ok(rel) if html_dir.parent() == Some(run_dir) => {
            let rel: PathBuf = Path::new("..").join(rel);
            rel.to_string_lossy().replace('\\', "/")
        }
        _ => {
            let abs = std::path::absolute(image_dir).unwrap_or_else(|_| image_dir.to_path_buf());
            format!("file://{}", abs.to_string_lossy().replace('\\', "/"))
        }
    }
}

pub struct HtmlReport<'a> {
    pub title: &'a str,
    pub document: &'a DescriptionsDocument,
    pub stats: &'a Statistics,
    pub image_prefix: &'a str,
}

impl HtmlReport<'_> {
    pub fn render(&self) -> String {
        let mut out = String::new();
        let title = escape_html(self.title);
        let _ = writeln!(out, "<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">");
        let _ = writeln!(out, "<title>{}</title>", title);
        out.push_str(STYLE);
        let _ = writeln!(out, "</head>\n<body>\n<h1>{}</h1>", title);

        let _ = writeln!(out, "<section class=\"summary\">");
        let _ = writeln!(
            out,
            "<p>Described: {} &middot; Failed: {} &middot; Generated: {}</p>",
            self.document.entries.len(),
            self.document.failures.len(),
            Local::now().format(CREATED_FORMAT)
        );
        if self.stats.downloads_attempted > 0 {
            let _ = writeln!(
                out,
                "<p>Downloads: {} saved of {} attempted, {} duplicates, {} undersized</p>",
                self.stats.downloads_succeeded,
                self.stats.downloads_attempted,
                self.stats.duplicates_skipped,
                self.stats.undersized_skipped
            );
        }
        let _ = writeln!(out, "</section>");

        for entry in &self.document.entries {
            let src = format!(
                "{}/{}",
                self.image_prefix,
                urlencoding::encode(&entry.file_name)
            );
            let _ = writeln!(out, "<article class=\"entry\">");
            let _ = writeln!(
                out,
                "<img src=\"{}\" alt=\"{}\" loading=\"lazy\">",
                escape_html(&src),
                escape_html(&entry.file_name)
            );
            let _ = writeln!(out, "<div>\n<h2>{}</h2>", escape_html(&entry.file_name));
            for paragraph in entry.description.split("\n\n") {
                let _ = writeln!(out, "<p>{}</p>", escape_html(paragraph.trim()).replace('\n', "<br>"));
            }
            let _ = writeln!(
                out,
                "<p class=\"meta\">{} / {} / {} / {}</p>\n</div>\n</article>",
                escape_html(&entry.provider),
                escape_html(&entry.model),
                escape_html(&entry.prompt_style),
                escape_html(&entry.created)
            );
        }

        if !self.document.failures.is_empty() {
            let _ = writeln!(out, "<section class=\"failures\">\n<h2>Failed images</h2>\n<ul>");
            for (name, reason) in &self.document.failures {
                let _ = writeln!(out, "<li><strong>{}</strong>: {}</li>", escape_html(name), escape_html(reason));
            }
            let _ = writeln!(out, "</ul>\n</section>");
        }

        out.push_str("</body>\n</html>\n");
        out
    }
}

const STYLE: &str = r#"<style>
body { font-family: sans-serif; max-width: 1100px; margin: 2em auto; color: #222; }
.entry { display: flex; gap: 1.5em; border-bottom: 1px solid #ddd; padding: 1em 0; }
.entry img { width: 280px; height: auto; object-fit: contain; }
.meta { color: #777; font-size: 0.85em; }
.failures li { color: #a33; }
</style>
"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, description: &str) -> ReportEntry {
        ReportEntry {
            file_name: name.into(),
            description: description.into(),
            provider: "ollama".into(),
            model: "moondream".into(),
            prompt_style: "detailed".into(),
            created: "2026-10-18 09:30:00".into(),
        }
    }

    #[test]
    fn test_render_then_parse_keeps_entries() {
        let doc = DescriptionsDocument {
            source_dir: Some(PathBuf::from("/tmp/in")),
            entries: vec![
                entry("coffee_desk.jpg", "A mug on a desk.\n\nProvider: not metadata, just text."),
                entry("outdoor_scene.jpg", "A lake at dusk."),
            ],
            failures: vec![("broken.jpg".into(), "提供方返回了空描述".into())],
        };
        let text = doc.render();
        assert!(text.starts_with("# Image Descriptions"));
        assert_eq!(text.matches("File: ").count(), 2);
        assert!(text.contains(&format!("Created: 2026-10-18 09:30:00\n{}\n", "-".repeat(80))));
        assert!(text.contains("Failed images:\nbroken.jpg: 提供方返回了空描述"));

        let parsed = DescriptionsDocument::parse(&text);
        assert_eq!(parsed, doc);
    }

    #[test]
    fn test_to_result_restores_fields() {
        let prompt = Prompt {
            style: "concise".into(),
            text: "Be brief.".into(),
        };
        let result = entry("a.jpg", "Text").to_result(&prompt);
        assert_eq!(result.prompt_style, "detailed");
        assert_eq!(result.prompt, "Be brief.");
        assert_eq!(result.created.format(CREATED_FORMAT).to_string(), "2026-10-18 09:30:00");
    }

    #[test]
    fn test_html_is_escaped() {
        let doc = DescriptionsDocument {
            source_dir: None,
            entries: vec![entry("a b.jpg", "<script>alert('x')</script> & more")],
            failures: vec![("bad\".jpg".into(), "<boom>".into())],
        };
        let html = HtmlReport {
            title: "wf_<test>",
            document: &doc,
            stats: &Statistics::default(),
            image_prefix: "../converted_images",
        }
        .render();
        assert!(html.contains("&lt;script&gt;alert(&#39;x&#39;)&lt;/script&gt; &amp; more"));
        assert!(!html.contains("<script>"));
        assert!(html.contains("src=\"../converted_images/a%20b.jpg\""));
        assert!(html.contains("<title>wf_&lt;test&gt;</title>"));
        assert!(html.contains("&lt;boom&gt;"));
    }

    #[test]
    fn test_image_prefix() {
        let run = Path::new("/out/wf_x");
        let html = run.join("html_reports");
        assert_eq!(image_prefix(run, &html, &run.join("converted_images")), "../converted_images");
        assert_eq!(image_prefix(run, &html, Path::new("/photos")), "file:///photos");
    }
}
