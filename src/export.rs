//! Renders a [`PipelineSummary`] as JSON, CSV, HTML or Markdown.

use std::fmt::Write as _;
use std::str::FromStr;

use html_escape::{encode_double_quoted_attribute, encode_text};

use crate::models::PipelineSummary;

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("unsupported export format: {0}")]
    UnsupportedFormat(String),
    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
    Html,
    Markdown,
}

impl FromStr for ExportFormat {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            "html" => Ok(ExportFormat::Html),
            "markdown" | "md" => Ok(ExportFormat::Markdown),
            other => Err(ExportError::UnsupportedFormat(other.to_string())),
        }
    }
}

impl ExportFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            ExportFormat::Json => "application/json",
            ExportFormat::Csv => "text/csv; charset=utf-8",
            ExportFormat::Html => "text/html; charset=utf-8",
            ExportFormat::Markdown => "text/markdown; charset=utf-8",
        }
    }
}

pub fn render(summary: &PipelineSummary, format: ExportFormat) -> Result<String, ExportError> {
    let generated = chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
    match format {
        ExportFormat::Json => to_json(summary),
        ExportFormat::Csv => Ok(to_csv(summary)),
        ExportFormat::Html => Ok(to_html(summary, &generated)),
        ExportFormat::Markdown => Ok(to_markdown(summary, &generated)),
    }
}

pub fn to_json(summary: &PipelineSummary) -> Result<String, ExportError> {
    Ok(serde_json::to_string_pretty(summary)?)
}

pub fn to_csv(summary: &PipelineSummary) -> String {
    let mut out = String::from("Index,Image URL,Caption,Alt Text,Width,Height,Original Caption\n");
    for r in &summary.results {
        let row = [
            r.sequence_index.to_string(),
            r.image_url.clone(),
            r.caption.clone(),
            r.alt_text.clone(),
            r.width.to_string(),
            r.height.to_string(),
            r.nearby_caption.clone().unwrap_or_default(),
        ];
        let line = row.iter().map(|f| csv_field(f)).collect::<Vec<_>>().join(",");
        out.push_str(&line);
        out.push('\n');
    }
    out
}

fn csv_field(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

const HTML_STYLE: &str = r#"
        body { font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif; max-width: 1200px; margin: 0 auto; padding: 20px; background: #f5f5f5; }
        .header, .stat-card, .image-card { background: white; border-radius: 10px; box-shadow: 0 2px 4px rgba(0,0,0,0.1); }
        .header { padding: 30px; margin-bottom: 30px; }
        .header h1 { margin: 0 0 10px 0; color: #333; }
        .meta { color: #666; font-size: 14px; }
        .stats { display: grid; grid-template-columns: repeat(auto-fit, minmax(200px, 1fr)); gap: 15px; margin-bottom: 30px; }
        .stat-card { padding: 20px; }
        .stat-card .number { font-size: 32px; font-weight: bold; color: #667eea; }
        .stat-card .label { color: #666; font-size: 14px; margin-top: 5px; }
        .image-grid { display: grid; grid-template-columns: repeat(auto-fill, minmax(350px, 1fr)); gap: 20px; }
        .image-card { overflow: hidden; }
        .image-card img { width: 100%; height: 250px; object-fit: cover; }
        .image-card .content { padding: 20px; }
        .image-card .caption { font-size: 16px; color: #333; margin-bottom: 10px; line-height: 1.5; }
        .footer { margin-top: 50px; padding: 20px; text-align: center; color: #666; font-size: 14px; }
"#;

pub fn to_html(summary: &PipelineSummary, generated: &str) -> String {
    let title = if summary.page_title.is_empty() {
        "Image Captions"
    } else {
        summary.page_title.as_str()
    };

    let mut html = String::new();
    let _ = write!(
        html,
        r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>Image Captions - {title}</title>
    <style>{style}</style>
</head>
<body>
    <div class="header">
        <h1>{title}</h1>
        <div class="meta">
            <strong>Source:</strong> {source}<br>
            <strong>Generated:</strong> {generated}
        </div>
    </div>
    <div class="stats">
        <div class="stat-card"><div class="number">{found}</div><div class="label">Images Found</div></div>
        <div class="stat-card"><div class="number">{processed}</div><div class="label">Successfully Processed</div></div>
        <div class="stat-card"><div class="number">{failed}</div><div class="label">Failed</div></div>
    </div>
    <div class="image-grid">
"#,
        title = encode_text(title),
        style = HTML_STYLE,
        source = encode_text(&summary.source_url),
        generated = encode_text(generated),
        found = summary.total_images_found,
        processed = summary.images_processed,
        failed = summary.images_failed,
    );

    for r in &summary.results {
        let mut meta = format!("{} × {} px", r.width, r.height);
        if !r.alt_text.is_empty() {
            let _ = write!(meta, " • {}", encode_text(&r.alt_text));
        }
        if let Some(original) = r.nearby_caption.as_deref().filter(|c| !c.is_empty()) {
            let _ = write!(meta, "<br>Original: {}", encode_text(original));
        }
        let _ = write!(
            html,
            r#"        <div class="image-card">
            <img src="{src}" alt="{alt}" loading="lazy">
            <div class="content">
                <div class="caption">{caption}</div>
                <div class="meta">{meta}</div>
            </div>
        </div>
"#,
            src = encode_double_quoted_attribute(&r.image_url),
            alt = encode_double_quoted_attribute(&r.caption),
            caption = encode_text(&r.caption),
            meta = meta,
        );
    }

    html.push_str(
        r#"    </div>
    <div class="footer">Generated by image-caption-api</div>
</body>
</html>
"#,
    );
    html
}

pub fn to_markdown(summary: &PipelineSummary, generated: &str) -> String {
    let title = if summary.page_title.is_empty() {
        "Image Captions"
    } else {
        summary.page_title.as_str()
    };

    let mut md = String::new();
    let _ = write!(
        md,
        "# {title}\n\n\
         **Source:** {source}  \n\
         **Generated:** {generated}\n\n\
         ## Summary\n\n\
         - **Images Found:** {found}\n\
         - **Successfully Processed:** {processed}\n\
         - **Failed:** {failed}\n\n\
         ## Captions\n\n",
        source = summary.source_url,
        found = summary.total_images_found,
        processed = summary.images_processed,
        failed = summary.images_failed,
    );

    for r in &summary.results {
        let alt = if r.alt_text.is_empty() { "N/A" } else { r.alt_text.as_str() };
        let _ = write!(
            md,
            "### Image {index}\n\n\
             ![{caption}]({url})\n\n\
             **Caption:** {caption}  \n\
             **Dimensions:** {width} × {height} px  \n\
             **Alt Text:** {alt}\n",
            index = r.sequence_index,
            caption = r.caption,
            url = r.image_url,
            width = r.width,
            height = r.height,
        );
        if let Some(original) = r.nearby_caption.as_deref().filter(|c| !c.is_empty()) {
            let _ = writeln!(md, "**Original Caption:** {original}");
        }
        md.push_str("\n---\n\n");
    }

    if !summary.errors.is_empty() {
        md.push_str("## Failed Images\n\n");
        for e in &summary.errors {
            let _ = writeln!(md, "- Image {}: {} ({})", e.sequence_index, e.image_url, e.error_reason);
        }
    }

    md
}
