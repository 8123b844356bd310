//! Text extraction from transcript document bytes.
//!
//! Converts PDF, DOCX, and plain-text documents into analyzable text.
//! Format is detected by sniffing the bytes, not by trusting the filename
//! or declared MIME type; the declared type only breaks ties for content
//! that is ambiguous (a ZIP that is not a DOCX, undecodable text).
//!
//! Extraction is a pure function of the input; persisting the outcome is
//! the caller's job. Extraction failure is fatal for a transcript — there
//! is no fallback extractor.

use thiserror::Error;

/// Maximum extracted text length (200KB). Analysis prompts truncate further,
/// but the stored transcript content keeps this much.
const MAX_EXTRACT_BYTES: usize = 200_000;

/// Fraction of control bytes above which lossy-decoded text is considered
/// binary garbage rather than a transcript.
const MAX_CONTROL_CHAR_RATIO: f64 = 0.05;

/// Document formats detected by byte sniffing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SniffedFormat {
    Pdf,
    Docx,
    PlainText,
}

impl SniffedFormat {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Docx => "docx",
            Self::PlainText => "text",
        }
    }
}

/// Errors that can occur during text extraction.
#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("Document is empty")]
    Empty,
    #[error("Document is corrupt: {0}")]
    Corrupt(String),
    #[error("Unsupported document format: {0}")]
    UnsupportedFormat(String),
}

impl ExtractionError {
    /// Stable reason tag for persistence and the activity log.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Corrupt(_) => "corrupt",
            Self::UnsupportedFormat(_) => "unsupported_format",
        }
    }
}

/// Detect the document format from leading bytes.
pub fn sniff_format(bytes: &[u8]) -> Option<SniffedFormat> {
    if bytes.starts_with(b"%PDF") {
        return Some(SniffedFormat::Pdf);
    }
    if bytes.starts_with(b"PK\x03\x04") {
        // ZIP container — a DOCX if it carries word/document.xml.
        if zip_has_document_xml(bytes) {
            return Some(SniffedFormat::Docx);
        }
        return None;
    }
    if looks_like_text(bytes) {
        return Some(SniffedFormat::PlainText);
    }
    None
}

/// Extract plain text from raw document bytes.
///
/// Returns cleaned text truncated to [`MAX_EXTRACT_BYTES`]. Empty input,
/// undecodable input, and unknown formats are rejected. `declared_mime` is
/// advisory only: it decides whether an undecodable blob is reported as
/// corrupt text or as an unsupported format.
pub fn extract_text(
    bytes: &[u8],
    declared_mime: Option<&str>,
) -> Result<String, ExtractionError> {
    if bytes.is_empty() {
        return Err(ExtractionError::Empty);
    }

    let format = match sniff_format(bytes) {
        Some(f) => f,
        None => {
            // Declared text that failed the sniff is corrupt, not unknown.
            if declared_mime.is_some_and(|m| m.starts_with("text/")) {
                return Err(ExtractionError::Corrupt(
                    "declared text/* but content is not decodable".to_string(),
                ));
            }
            let hint = declared_mime.unwrap_or("unknown");
            return Err(ExtractionError::UnsupportedFormat(hint.to_string()));
        }
    };

    let raw = match format {
        SniffedFormat::Pdf => extract_pdf(bytes)?,
        SniffedFormat::Docx => extract_docx(bytes)?,
        SniffedFormat::PlainText => extract_plaintext(bytes)?,
    };

    let cleaned = clean_text(&raw);
    if cleaned.trim().is_empty() {
        return Err(ExtractionError::Corrupt(format!(
            "no text content in {} document",
            format.label()
        )));
    }

    Ok(truncate_text(&cleaned, MAX_EXTRACT_BYTES))
}

// ---------------------------------------------------------------------------
// Format-specific extractors
// ---------------------------------------------------------------------------

fn extract_pdf(bytes: &[u8]) -> Result<String, ExtractionError> {
    // pdf-extract can panic on malformed PDFs — wrap in catch_unwind
    let owned = bytes.to_vec();
    let result = std::panic::catch_unwind(move || pdf_extract::extract_text_from_mem(&owned));

    match result {
        Ok(Ok(text)) => Ok(text),
        Ok(Err(e)) => Err(ExtractionError::Corrupt(format!("PDF: {}", e))),
        Err(_) => Err(ExtractionError::Corrupt(
            "PDF extraction panicked (malformed file)".to_string(),
        )),
    }
}

fn extract_docx(bytes: &[u8]) -> Result<String, ExtractionError> {
    // DOCX = ZIP archive containing word/document.xml
    // Walk <w:t> tags to extract text runs.
    let cursor = std::io::Cursor::new(bytes);
    let mut archive = zip::ZipArchive::new(cursor)
        .map_err(|e| ExtractionError::Corrupt(format!("DOCX zip: {}", e)))?;

    let doc = archive
        .by_name("word/document.xml")
        .map_err(|e| ExtractionError::Corrupt(format!("DOCX missing document.xml: {}", e)))?;

    let mut reader = quick_xml::Reader::from_reader(std::io::BufReader::new(doc));
    let mut buf = Vec::new();
    let mut text = String::new();
    let mut in_text_tag = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(ref e))
            | Ok(quick_xml::events::Event::Empty(ref e)) => {
                let local = e.local_name();
                if local.as_ref() == b"t" {
                    in_text_tag = true;
                } else if local.as_ref() == b"p" && !text.is_empty() && !text.ends_with('\n') {
                    text.push('\n');
                }
            }
            Ok(quick_xml::events::Event::End(ref e)) => {
                if e.local_name().as_ref() == b"t" {
                    in_text_tag = false;
                }
            }
            Ok(quick_xml::events::Event::Text(ref e)) => {
                if in_text_tag {
                    if let Ok(s) = e.unescape() {
                        text.push_str(&s);
                    }
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => {
                return Err(ExtractionError::Corrupt(format!("DOCX XML: {}", e)));
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(text)
}

fn extract_plaintext(bytes: &[u8]) -> Result<String, ExtractionError> {
    match std::str::from_utf8(bytes) {
        Ok(s) => Ok(s.to_string()),
        Err(_) => Ok(String::from_utf8_lossy(bytes).into_owned()),
    }
}

fn zip_has_document_xml(bytes: &[u8]) -> bool {
    let cursor = std::io::Cursor::new(bytes);
    match zip::ZipArchive::new(cursor) {
        Ok(mut archive) => archive.by_name("word/document.xml").is_ok(),
        Err(_) => false,
    }
}

fn looks_like_text(bytes: &[u8]) -> bool {
    if bytes.contains(&0) {
        return false;
    }
    let sample = &bytes[..bytes.len().min(4096)];
    let control = sample
        .iter()
        .filter(|b| b.is_ascii_control() && !matches!(b, b'\n' | b'\r' | b'\t'))
        .count();
    (control as f64) / (sample.len() as f64) <= MAX_CONTROL_CHAR_RATIO
}

// ---------------------------------------------------------------------------
// Cleaning and validation
// ---------------------------------------------------------------------------

/// Normalize extracted text: collapse runs of blank lines, strip page
/// markers and non-printable characters, normalize line endings.
pub fn clean_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.replace("\r\n", "\n").replace('\r', "\n").chars() {
        if ch == '\n' || ch == '\t' || !ch.is_control() {
            out.push(ch);
        }
    }

    // Collapse 3+ newlines to a paragraph break.
    let mut collapsed = String::with_capacity(out.len());
    let mut newline_run = 0;
    for ch in out.chars() {
        if ch == '\n' {
            newline_run += 1;
            if newline_run <= 2 {
                collapsed.push(ch);
            }
        } else {
            newline_run = 0;
            collapsed.push(ch);
        }
    }

    collapsed.trim().to_string()
}

pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Heuristic check that extracted text actually reads like a therapy
/// session transcript. Advisory only: a low score is logged as a warning,
/// never a processing failure.
#[derive(Debug, Clone)]
pub struct ContentValidation {
    pub confidence: f64,
    pub issues: Vec<String>,
}

pub fn validate_transcript(text: &str) -> ContentValidation {
    let mut confidence: f64 = 0.0;
    let mut issues = Vec::new();

    if text.trim().len() < 100 {
        return ContentValidation {
            confidence: 0.0,
            issues: vec!["content too short to be a meaningful transcript".to_string()],
        };
    }

    let lower = text.to_lowercase();
    let therapy_keywords = [
        "session", "therapy", "therapist", "client", "patient", "counseling", "feelings",
        "thoughts", "emotions",
    ];
    let keyword_hits = therapy_keywords.iter().filter(|k| lower.contains(*k)).count();
    if keyword_hits >= 3 {
        confidence += 0.4;
    }

    // Speaker-labelled dialogue lines.
    let dialogue_lines = text
        .lines()
        .filter(|line| {
            let t = line.trim_start().to_lowercase();
            t.starts_with("therapist:")
                || t.starts_with("counselor:")
                || t.starts_with("client:")
                || t.starts_with("patient:")
                || t.starts_with("t:")
                || t.starts_with("c:")
        })
        .count();
    if dialogue_lines >= 2 {
        confidence += 0.4;
    }

    let words = word_count(text);
    if words >= 1000 {
        confidence += 0.2;
    } else if words < 300 {
        issues.push("content may be too short for a full session".to_string());
    }

    let confidence = confidence.clamp(0.0, 1.0);
    if confidence < 0.3 {
        issues.push("low confidence that this is a therapy transcript".to_string());
    }

    ContentValidation { confidence, issues }
}

/// Truncate text at a safe UTF-8 boundary.
fn truncate_text(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }

    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    let mut result = text[..end].to_string();
    result.push_str("\n\n[... content truncated ...]");
    result
}
