//! Extension-based preview classification and the HTML documents each strategy produces.

use pulldown_cmark::{Options, Parser, html};

use crate::escape_html;

pub const OFFICE_EXTENSIONS: &[&str] = &[
    "docx", "docm", "dotm", "dotx", "xlsx", "xlsb", "xls", "xlsm", "pptx", "ppsx", "ppt", "pps",
    "pptm", "potm", "ppam", "potx", "ppsm", "rtf",
];
pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp", "bmp", "svg"];
pub const CODE_EXTENSIONS: &[&str] = &[
    "java", "py", "c", "cpp", "cs", "rb", "go", "js", "ts", "html", "css", "xml", "json", "sh",
    "bat",
];
pub const TEXT_EXTENSIONS: &[&str] = &["txt", "md", "csv"];

const OFFICE_VIEWER: &str = "https://view.officeapps.live.com/op/view.aspx?src=";
const HIGHLIGHT_CSS: &str =
    "https://cdnjs.cloudflare.com/ajax/libs/highlight.js/11.7.0/styles/atom-one-dark.min.css";
const HIGHLIGHT_JS: &str =
    "https://cdnjs.cloudflare.com/ajax/libs/highlight.js/11.7.0/highlight.min.js";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextFlavor {
    Csv,
    Markdown,
    Code,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreviewKind {
    /// Handed to the external office viewer; nothing is fetched locally.
    Office,
    /// Image or PDF embedded directly in an iframe.
    Embed,
    /// Text fetched in full, then transformed.
    Text(TextFlavor),
    Unsupported,
}

impl PreviewKind {
    pub fn needs_fetch(self) -> bool {
        matches!(self, PreviewKind::Text(_))
    }
}

/// Lowercased text after the last `.`; a name without a dot is its own extension.
pub fn extension_of(file_name: &str) -> String {
    file_name
        .rsplit('.')
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase()
}

pub fn classify(file_name: &str) -> PreviewKind {
    let ext = extension_of(file_name);
    let ext = ext.as_str();
    if OFFICE_EXTENSIONS.contains(&ext) {
        PreviewKind::Office
    } else if IMAGE_EXTENSIONS.contains(&ext) || ext == "pdf" {
        PreviewKind::Embed
    } else if ext == "csv" {
        PreviewKind::Text(TextFlavor::Csv)
    } else if ext == "md" {
        PreviewKind::Text(TextFlavor::Markdown)
    } else if CODE_EXTENSIONS.contains(&ext) || TEXT_EXTENSIONS.contains(&ext) {
        PreviewKind::Text(TextFlavor::Code)
    } else {
        PreviewKind::Unsupported
    }
}

pub fn office_viewer_url(file_url: &str) -> String {
    let encoded: String = url::form_urlencoded::byte_serialize(file_url.as_bytes()).collect();
    format!("{OFFICE_VIEWER}{encoded}")
}

pub fn embed_document(file_url: &str) -> String {
    format!(
        r#"<body style="margin:0; background-color: #282c34;"><iframe src="{}" frameborder="0" style="width:100%; height:100vh;"></iframe></body>"#,
        escape_html(file_url)
    )
}

pub fn csv_document(file_name: &str, text: &str) -> String {
    let rows: String = text
        .trim()
        .lines()
        .map(|row| {
            let cells: Vec<String> = row.split(',').map(escape_html).collect();
            format!("<tr><td>{}</td></tr>", cells.join("</td><td>"))
        })
        .collect();
    format!(
        "<html><head><title>Preview: {}</title><style>html,body{{margin:0;padding:0;height:100%;}} body{{font-family:monospace;background-color:#282c34;color:#abb2bf;padding:1em;}} table{{width:100%;border-collapse:collapse;}} td,th{{border:1px solid #555;padding:8px;text-align:left;}} th{{background-color:#444;}}</style></head><body><table>{rows}</table></body></html>",
        escape_html(file_name)
    )
}

pub fn markdown_document(file_name: &str, text: &str) -> String {
    let mut body = String::with_capacity(text.len() * 3 / 2);
    html::push_html(&mut body, Parser::new_ext(text, markdown_options()));
    format!(
        "<html><head><title>Preview: {}</title><style>html,body{{margin:0;padding:0;height:100%;}} body{{font-family:sans-serif;background-color:#282c34;color:#abb2bf;padding:2em;}} h1,h2,h3{{color:#61afef;}} a{{color:#98c379;}} code{{background:#3a3f4b;padding:2px 4px;border-radius:4px;}}</style></head><body>{body}</body></html>",
        escape_html(file_name)
    )
}

pub fn code_document(file_name: &str, text: &str) -> String {
    let ext = escape_html(&extension_of(file_name));
    format!(
        r#"<html><head><title>Preview: {}</title><link rel="stylesheet" href="{HIGHLIGHT_CSS}"><style>html, body {{ margin:0; padding:0; height:100%; font-family: monospace; background-color: #282c34; }} pre {{ margin: 1em; }}</style></head><body><pre><code class="{ext}">{}</code></pre><script src="{HIGHLIGHT_JS}"></script><script>hljs.highlightAll();</script></body></html>"#,
        escape_html(file_name),
        escape_html(text)
    )
}

fn markdown_options() -> Options {
    Options::ENABLE_TABLES | Options::ENABLE_STRIKETHROUGH | Options::ENABLE_TASKLISTS
}

/// Builds the document for a text preview once its content has been fetched.
pub fn render_text(flavor: TextFlavor, file_name: &str, text: &str) -> String {
    match flavor {
        TextFlavor::Csv => csv_document(file_name, text),
        TextFlavor::Markdown => markdown_document(file_name, text),
        TextFlavor::Code => code_document(file_name, text),
    }
}
