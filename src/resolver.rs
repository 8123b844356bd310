//! Client identity and session date resolution.
//!
//! Works out who a transcript belongs to and when the session happened,
//! using ordered heuristics over the filename and the extracted text.
//! Resolution never fails: the worst case is the filename stem at low
//! confidence, so every transcript always lands somewhere visible.

use chrono::{Datelike, NaiveDate};
use regex::Regex;
use std::sync::OnceLock;
use unicode_normalization::UnicodeNormalization;

use crate::types::{Confidence, ResolvedIdentity};

/// How many lines at each end of the transcript are scanned for
/// salutation-style client labels.
const SALUTATION_WINDOW: usize = 15;

fn filename_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        // "Jordan Lee_2024-03-11.pdf", "jordan-lee_20240311.docx"
        Regex::new(r"^(?P<name>.+?)[_\s-](?P<date>\d{4}-?\d{2}-?\d{2})$")
            .unwrap_or_else(|e| unreachable!("static regex: {e}"))
    })
}

fn salutation_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?im)^\s*(?:client|patient)(?:\s+name)?\s*[:\-]\s*(?P<name>[A-Za-z][A-Za-z .'\-]{1,60})$")
            .unwrap_or_else(|e| unreachable!("static regex: {e}"))
    })
}

fn body_date_patterns() -> &'static [Regex] {
    static RES: OnceLock<Vec<Regex>> = OnceLock::new();
    RES.get_or_init(|| {
        [
            // ISO: 2024-03-11
            r"\b(\d{4})-(\d{2})-(\d{2})\b",
            // US: 3/11/2024 or 03/11/2024
            r"\b(\d{1,2})/(\d{1,2})/(\d{4})\b",
            // Written: March 11, 2024
            r"\b(January|February|March|April|May|June|July|August|September|October|November|December)\s+(\d{1,2}),?\s+(\d{4})\b",
        ]
        .iter()
        .map(|p| Regex::new(p).unwrap_or_else(|e| unreachable!("static regex: {e}")))
        .collect()
    })
}

/// Resolve client name and session date from a transcript filename and its
/// extracted text.
pub fn resolve(filename: &str, text: &str) -> ResolvedIdentity {
    let stem = file_stem(filename);

    // 1. Filename carries "<name>_<date>": highest confidence.
    if let Some(caps) = filename_pattern().captures(stem) {
        let raw_name = &caps["name"];
        if let Some(date) = parse_compact_date(&caps["date"]) {
            let name = humanize_name(raw_name);
            if !name.is_empty() {
                return ResolvedIdentity {
                    client_name: name,
                    session_date: Some(date),
                    confidence: Confidence::High,
                };
            }
        }
    }

    // 2. Salutation line near either end of the transcript body.
    if let Some(name) = find_salutation_name(text) {
        return ResolvedIdentity {
            client_name: name,
            session_date: find_body_date(text),
            confidence: Confidence::Medium,
        };
    }

    // 3. Filename stem as-is. A body date still helps even here.
    let name = humanize_name(stem);
    ResolvedIdentity {
        client_name: if name.is_empty() {
            "Unknown Client".to_string()
        } else {
            name
        },
        session_date: find_body_date(text),
        confidence: Confidence::Low,
    }
}

/// Canonical form of a client name used for dedup and lookup: NFKC
/// normalization, casefold, whitespace collapse.
pub fn normalize_client_name(name: &str) -> String {
    name.nfkc()
        .collect::<String>()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn file_stem(filename: &str) -> &str {
    let base = filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(filename);
    match base.rfind('.') {
        Some(idx) if idx > 0 => &base[..idx],
        _ => base,
    }
}

/// Turn a filename fragment into a display name: separators to spaces,
/// title-case each word.
fn humanize_name(raw: &str) -> String {
    raw.split(|c: char| c == '_' || c == '-' || c.is_whitespace())
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn find_salutation_name(text: &str) -> Option<String> {
    let lines: Vec<&str> = text.lines().collect();
    let head = lines.iter().take(SALUTATION_WINDOW);
    let tail_start = lines.len().saturating_sub(SALUTATION_WINDOW);
    let tail = lines.iter().skip(tail_start.max(SALUTATION_WINDOW));

    for line in head.chain(tail) {
        if let Some(caps) = salutation_pattern().captures(line) {
            let name = caps["name"].trim().trim_end_matches('.').to_string();
            if looks_like_name(&name) {
                return Some(name);
            }
        }
    }
    None
}

/// Distinguish a labelled name ("Client: Maria Alvarez") from labelled
/// dialogue ("Client: I had a rough week"): few words, each capitalized.
fn looks_like_name(candidate: &str) -> bool {
    let words: Vec<&str> = candidate.split_whitespace().collect();
    if words.is_empty() || words.len() > 4 {
        return false;
    }
    words.iter().all(|w| {
        w.chars()
            .next()
            .map(|c| c.is_uppercase())
            .unwrap_or(false)
            && w.len() > 1
    })
}

/// First plausible date mentioned in the transcript body.
pub fn find_body_date(text: &str) -> Option<NaiveDate> {
    let patterns = body_date_patterns();

    if let Some(caps) = patterns[0].captures(text) {
        if let Some(d) = ymd(&caps[1], &caps[2], &caps[3]) {
            return Some(d);
        }
    }
    if let Some(caps) = patterns[1].captures(text) {
        if let Some(d) = ymd(&caps[3], &caps[1], &caps[2]) {
            return Some(d);
        }
    }
    if let Some(caps) = patterns[2].captures(text) {
        let month = month_number(&caps[1])?;
        if let Some(d) = ymd(&caps[3], &month.to_string(), &caps[2]) {
            return Some(d);
        }
    }
    None
}

fn parse_compact_date(s: &str) -> Option<NaiveDate> {
    let digits: String = s.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() != 8 {
        return None;
    }
    ymd(&digits[..4], &digits[4..6], &digits[6..8])
}

fn ymd(y: &str, m: &str, d: &str) -> Option<NaiveDate> {
    let date = NaiveDate::from_ymd_opt(
        y.parse().ok()?,
        m.parse().ok()?,
        d.parse().ok()?,
    )?;
    // Reject clearly implausible session years.
    if date.year() < 2000 || date.year() > 2100 {
        return None;
    }
    Some(date)
}

fn month_number(name: &str) -> Option<u32> {
    match name.to_lowercase().as_str() {
        "january" => Some(1),
        "february" => Some(2),
        "march" => Some(3),
        "april" => Some(4),
        "may" => Some(5),
        "june" => Some(6),
        "july" => Some(7),
        "august" => Some(8),
        "september" => Some(9),
        "october" => Some(10),
        "november" => Some(11),
        "december" => Some(12),
        _ => None,
    }
}
