//! Letter and search input validation.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use crate::core::patterns::contains_markup_injection;

pub const MAX_CONTENT_CHARS: usize = 5000;
pub const MAX_NAME_CHARS: usize = 100;
pub const MAX_QUERY_CHARS: usize = 200;

/// One rejected field
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FieldIssue {
    pub field: &'static str,
    pub message: &'static str,
}

impl FieldIssue {
    fn new(field: &'static str, message: &'static str) -> Self {
        Self { field, message }
    }
}

/// Check a letter's text fields; every problem is reported, not just the first
pub fn validate_letter(
    content: &str,
    author: &str,
    recipient: Option<&str>,
) -> Result<(), Vec<FieldIssue>> {
    let mut issues = Vec::new();

    let content_len = content.chars().count();
    if content_len == 0 {
        issues.push(FieldIssue::new("content", "Content is required"));
    } else if content_len > MAX_CONTENT_CHARS {
        issues.push(FieldIssue::new(
            "content",
            "Content must be less than 5000 characters",
        ));
    } else if contains_markup_injection(content) {
        issues.push(FieldIssue::new("content", "Invalid content detected"));
    }

    let author_len = author.chars().count();
    if author_len == 0 {
        issues.push(FieldIssue::new("author", "Author is required"));
    } else if author_len > MAX_NAME_CHARS {
        issues.push(FieldIssue::new(
            "author",
            "Author must be less than 100 characters",
        ));
    } else if contains_markup_injection(author) {
        issues.push(FieldIssue::new("author", "Invalid author name"));
    }

    if let Some(recipient) = recipient {
        if recipient.chars().count() > MAX_NAME_CHARS {
            issues.push(FieldIssue::new(
                "recipient",
                "Recipient must be less than 100 characters",
            ));
        } else if contains_markup_injection(recipient) {
            issues.push(FieldIssue::new("recipient", "Invalid recipient name"));
        }
    }

    if issues.is_empty() {
        Ok(())
    } else {
        Err(issues)
    }
}

/// Check a search query and an optional page parameter
pub fn validate_search(query: &str, page: Option<&str>) -> Result<(), Vec<FieldIssue>> {
    let mut issues = Vec::new();

    if query.chars().count() > MAX_QUERY_CHARS {
        issues.push(FieldIssue::new(
            "query",
            "Search query must be less than 200 characters",
        ));
    } else if contains_markup_injection(query) {
        issues.push(FieldIssue::new("query", "Invalid search query"));
    }

    if let Some(page) = page {
        if page.is_empty() || !page.bytes().all(|b| b.is_ascii_digit()) {
            issues.push(FieldIssue::new("page", "Invalid page number"));
        }
    }

    if issues.is_empty() {
        Ok(())
    } else {
        Err(issues)
    }
}

static STRIPPED: Lazy<Vec<Regex>> = Lazy::new(|| {
    ["script", "iframe", "object", "embed", "link", "meta"]
        .iter()
        .map(|tag| format!(r"(?is)<{tag}\b.*?</{tag}>", tag = tag))
        .chain([
            r"(?i)javascript:".to_string(),
            r#"(?i)on\w+\s*=\s*["'][^"']*["']"#.to_string(),
        ])
        .filter_map(|pattern| Regex::new(&pattern).ok())
        .collect()
});

/// Remove active markup from free text and trim it
pub fn sanitize_input(input: &str) -> String {
    let mut text = input.to_string();
    for pattern in STRIPPED.iter() {
        text = pattern.replace_all(&text, "").into_owned();
    }
    text.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_letter() {
        assert!(validate_letter("Dear Sam, the tea was cold.", "Ana", Some("Sam")).is_ok());
        assert!(validate_letter("hello", "Ana", None).is_ok());
    }

    #[test]
    fn test_letter_issues_are_collected() {
        let long = "x".repeat(MAX_CONTENT_CHARS + 1);
        let issues = validate_letter(&long, "", Some("<script>")).unwrap_err();
        assert_eq!(
            issues,
            vec![
                FieldIssue::new("content", "Content must be less than 5000 characters"),
                FieldIssue::new("author", "Author is required"),
                FieldIssue::new("recipient", "Invalid recipient name"),
            ]
        );
    }

    #[test]
    fn test_length_counts_characters() {
        let content = "é".repeat(MAX_CONTENT_CHARS);
        assert!(validate_letter(&content, "Zoë", None).is_ok());
    }

    #[test]
    fn test_markup_rejected() {
        let issues = validate_letter("click <a onclick='x'>", "Ana", None).unwrap_err();
        assert_eq!(issues[0].message, "Invalid content detected");
        assert!(validate_letter("javascript:alert(1)", "Ana", None).is_err());
    }

    #[test]
    fn test_search_validation() {
        assert!(validate_search("rain in paris", Some("2")).is_ok());
        assert!(validate_search("", None).is_ok());
        assert_eq!(validate_search("x", Some("2a")).unwrap_err()[0].field, "page");
        assert!(validate_search(&"q".repeat(201), None).is_err());
    }

    #[test]
    fn test_sanitize_strips_active_markup() {
        assert_eq!(
            sanitize_input("  hi <script>alert(1)</script>there  "),
            "hi there"
        );
        assert_eq!(
            sanitize_input("<IFRAME src=x>\n</iframe>ok"),
            "ok"
        );
        assert_eq!(sanitize_input("<b onclick=\"x()\">bold</b>"), "<b >bold</b>");
        assert_eq!(sanitize_input("JavaScript:void(0)"), "void(0)");
        assert_eq!(sanitize_input("plain words"), "plain words");
    }
}
