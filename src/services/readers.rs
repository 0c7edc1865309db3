//! Text extraction from raw document bytes, dispatched by [`DocumentFormat`].
//!
//! Supported out of the box:
//! - plain text and Markdown (UTF-8, lossy)
//! - HTML (markup, scripts and styles removed, entities decoded)
//! - DOCX (`word/document.xml` text runs, one line per paragraph)

use super::DocumentReader;
use crate::error::{PipelineError, Result};
use crate::record::DocumentFormat;
use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;

/// Upper bound on the decompressed size of `word/document.xml`.
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// Maps document formats to readers.
#[derive(Clone, Default)]
pub struct ReaderRegistry {
    readers: HashMap<DocumentFormat, Arc<dyn DocumentReader>>,
}

impl ReaderRegistry {
    /// An empty registry: every format is unsupported.
    pub fn new() -> Self {
        Self::default()
    }

    /// Plain text, Markdown, HTML, and DOCX.
    pub fn with_defaults() -> Self {
        let text: Arc<dyn DocumentReader> = Arc::new(PlainTextReader);
        Self::new()
            .with(DocumentFormat::PlainText, text.clone())
            .with(DocumentFormat::Markdown, text)
            .with(DocumentFormat::Html, Arc::new(HtmlReader))
            .with(DocumentFormat::Docx, Arc::new(DocxReader))
    }

    pub fn with(mut self, format: DocumentFormat, reader: Arc<dyn DocumentReader>) -> Self {
        self.register(format, reader);
        self
    }

    /// Register `reader` for `format`, replacing any previous one.
    pub fn register(&mut self, format: DocumentFormat, reader: Arc<dyn DocumentReader>) {
        self.readers.insert(format, reader);
    }

    pub fn get(&self, format: &DocumentFormat) -> Option<&Arc<dyn DocumentReader>> {
        self.readers.get(format)
    }

    pub fn supports(&self, format: &DocumentFormat) -> bool {
        self.readers.contains_key(format)
    }
}

impl std::fmt::Debug for ReaderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut formats: Vec<String> = self.readers.keys().map(|k| k.to_string()).collect();
        formats.sort();
        f.debug_struct("ReaderRegistry")
            .field("formats", &formats)
            .finish()
    }
}

/// UTF-8 text with invalid sequences replaced. A leading BOM is dropped.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainTextReader;

impl DocumentReader for PlainTextReader {
    fn name(&self) -> &'static str {
        "text"
    }

    fn read(&self, bytes: &[u8]) -> Result<String> {
        let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }
}

/// Visible text of an HTML page.
#[derive(Debug, Clone, Copy, Default)]
pub struct HtmlReader;

/// Elements whose content is never visible text.
const HIDDEN_ELEMENTS: &[&str] = &["script", "style", "noscript", "template", "head"];

/// Elements that start a new line of text.
const BLOCK_ELEMENTS: &[&str] = &[
    "p", "div", "br", "li", "ul", "ol", "tr", "table", "section", "article", "header",
    "footer", "h1", "h2", "h3", "h4", "h5", "h6", "blockquote", "pre", "title",
];

impl DocumentReader for HtmlReader {
    fn name(&self) -> &'static str {
        "html"
    }

    fn read(&self, bytes: &[u8]) -> Result<String> {
        Ok(html_to_text(&String::from_utf8_lossy(bytes)))
    }
}

fn html_to_text(html: &str) -> String {
    let mut out = String::with_capacity(html.len() / 2);
    let mut rest = html;
    while let Some(lt) = rest.find('<') {
        push_text(&mut out, &rest[..lt]);
        rest = &rest[lt..];

        if let Some(after) = rest.strip_prefix("<!--") {
            rest = after.find("-->").map_or("", |i| &after[i + 3..]);
            continue;
        }
        let Some(gt) = rest.find('>') else {
            rest = "";
            break;
        };
        let tag = &rest[1..gt];
        rest = &rest[gt + 1..];

        let closing = tag.starts_with('/');
        let name: String = tag
            .trim_start_matches('/')
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();

        if !closing && HIDDEN_ELEMENTS.contains(&name.as_str()) && !tag.ends_with('/') {
            let close = format!("</{name}");
            let lower = rest.to_ascii_lowercase();
            rest = match lower.find(&close) {
                Some(i) => rest[i..].find('>').map_or("", |j| &rest[i + j + 1..]),
                None => "",
            };
            continue;
        }
        if BLOCK_ELEMENTS.contains(&name.as_str()) {
            out.push('\n');
        } else {
            out.push(' ');
        }
    }
    push_text(&mut out, rest);

    out.lines()
        .map(|l| l.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Source line breaks are not visible in rendered HTML; only block
/// elements break lines.
fn push_text(out: &mut String, raw: &str) {
    out.extend(
        decode_entities(raw)
            .chars()
            .map(|c| if c.is_whitespace() { ' ' } else { c }),
    );
}

fn decode_entities(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        rest = &rest[amp..];
        let decoded = rest.find(';').filter(|&i| i <= 10).and_then(|semi| {
            let entity = &rest[1..semi];
            let ch = match entity {
                "amp" => Some('&'),
                "lt" => Some('<'),
                "gt" => Some('>'),
                "quot" => Some('"'),
                "apos" => Some('\''),
                "nbsp" => Some(' '),
                _ => entity
                    .strip_prefix("#x")
                    .or_else(|| entity.strip_prefix("#X"))
                    .and_then(|h| u32::from_str_radix(h, 16).ok())
                    .or_else(|| entity.strip_prefix('#').and_then(|d| d.parse().ok()))
                    .and_then(char::from_u32),
            }?;
            Some((ch, semi))
        });
        match decoded {
            Some((ch, semi)) => {
                out.push(ch);
                rest = &rest[semi + 1..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// Text of a Word document, one line per paragraph.
#[derive(Debug, Clone, Copy, Default)]
pub struct DocxReader;

impl DocumentReader for DocxReader {
    fn name(&self) -> &'static str {
        "docx"
    }

    fn read(&self, bytes: &[u8]) -> Result<String> {
        let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
            .map_err(|e| PipelineError::Reader(format!("not a docx archive: {e}")))?;
        let entry = archive
            .by_name("word/document.xml")
            .map_err(|_| PipelineError::Reader("word/document.xml not found".to_string()))?;
        let mut xml = Vec::new();
        entry
            .take(MAX_XML_ENTRY_BYTES)
            .read_to_end(&mut xml)
            .map_err(|e| PipelineError::Reader(e.to_string()))?;
        if xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
            return Err(PipelineError::Reader(
                "word/document.xml exceeds size limit".to_string(),
            ));
        }
        docx_paragraphs(&xml)
    }
}

/// Collect `w:t` runs, breaking lines at `w:p` ends and `w:br`/`w:tab` marks.
fn docx_paragraphs(xml: &[u8]) -> Result<String> {
    use quick_xml::events::Event;

    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut out = String::new();
    let mut in_text = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_text = true,
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => out.push('\n'),
                _ => {}
            },
            Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"br" => out.push('\n'),
                b"tab" => out.push('\t'),
                _ => {}
            },
            Ok(Event::Text(t)) if in_text => {
                let text = t
                    .unescape()
                    .map_err(|e| PipelineError::Reader(e.to_string()))?;
                out.push_str(&text);
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(PipelineError::Reader(format!("malformed docx xml: {e}"))),
            _ => {}
        }
        buf.clear();
    }
    Ok(out.trim_end().to_string())
}
