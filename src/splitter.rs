use regex::Regex;
use std::sync::OnceLock;

/// A newline, any run of whitespace-only lines, and another newline.
fn paragraph_boundary() -> &'static Regex {
    static BOUNDARY: OnceLock<Regex> = OnceLock::new();
    BOUNDARY.get_or_init(|| Regex::new(r"\n[ \t\r\f\v]*(?:\n[ \t\r\f\v]*)+").expect("valid regex"))
}

/// Split text into paragraphs at blank-line boundaries.
///
/// Lines holding only whitespace count as blank. Paragraphs are trimmed and empty
/// ones are dropped, so the returned order matches `chunk_index`.
pub fn split_paragraphs(text: &str) -> Vec<String> {
    paragraph_boundary()
        .split(text)
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}
