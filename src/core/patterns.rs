//! Static pattern tables for request content classification.
//!
//! Four tables: cross-site scripting, SQL injection, path traversal and
//! automation user agents. All matching is case-insensitive. The tables are
//! compiled once and shared; classification is a pure function.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Category of a matched pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternCategory {
    Xss,
    SqlInjection,
    PathTraversal,
    Bot,
}

impl PatternCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternCategory::Xss => "xss",
            PatternCategory::SqlInjection => "sql_injection",
            PatternCategory::PathTraversal => "path_traversal",
            PatternCategory::Bot => "bot",
        }
    }
}

impl fmt::Display for PatternCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A compiled pattern with its source kept for explanations
pub struct Signature {
    pub source: &'static str,
    regex: Regex,
}

impl Signature {
    pub fn is_match(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }
}

const XSS_PATTERNS: &[&str] = &[
    r"(?:<|%3c)script",
    r"javascript:",
    // inline handlers only inside a tag or after a quote breaking out of an attribute
    r#"(?:<|%3c)[^>]*?(?:\s|/|\+|%20|%2f|%09|%0a|"|'|%22|%27)on\w+\s*(?:=|%3d)"#,
    r#"(?:"|'|%22|%27)(?:\s|\+|%20)*on\w+\s*(?:=|%3d)"#,
    r"eval\s*\(",
    r"document\.cookie",
    r"window\.location",
];

// Separator between SQL keywords: whitespace, `+` or `%20` in URLs.
const SQL_PATTERNS: &[&str] = &[
    r"union(?:\s|\+|%20)+select",
    r"drop(?:\s|\+|%20)+table",
    r"delete(?:\s|\+|%20)+from",
    r"insert(?:\s|\+|%20)+into",
    r"update(?:\s|\+|%20)+\w+(?:\s|\+|%20)+set",
    r"char\s*\(",
    r"exec\s*\(",
    r"system\s*\(",
];

const TRAVERSAL_PATTERNS: &[&str] = &[
    r"\.\.(?:/|\\|%2f|%5c|%252f|%255c)",
    r"%2e%2e(?:/|\\|%2f|%5c)",
];

/// Automation libraries and headless browsers; a match blocks the request
const AUTOMATION_USER_AGENTS: &[&str] = &[
    "bot",
    "crawler",
    "spider",
    "scraper",
    "curl",
    "wget",
    "python",
    "java",
    "php",
    "go-http",
    "okhttp",
    "libwww",
    "lwp",
    "perl",
    "ruby",
    "scrapy",
    "mechanize",
    "selenium",
    "phantom",
    "headless",
];

/// Monitoring and auditing tools; scored by the detector but never blocked outright
const MONITORING_USER_AGENTS: &[&str] = &[
    "chrome-lighthouse",
    "gtmetrix",
    "pingdom",
    "uptimerobot",
    "site24x7",
    "newrelic",
    "datadog",
    "sentry",
    "bugsnag",
    "rollbar",
];

fn compile<I>(sources: I, literal: bool) -> Vec<Signature>
where
    I: IntoIterator<Item = &'static str>,
{
    sources
        .into_iter()
        .filter_map(|source| {
            let pattern = if literal {
                regex::escape(source)
            } else {
                source.to_string()
            };
            Regex::new(&format!("(?i){}", pattern))
                .ok()
                .map(|regex| Signature { source, regex })
        })
        .collect()
}

static XSS: Lazy<Vec<Signature>> = Lazy::new(|| compile(XSS_PATTERNS.iter().copied(), false));
static SQL: Lazy<Vec<Signature>> = Lazy::new(|| compile(SQL_PATTERNS.iter().copied(), false));
static TRAVERSAL: Lazy<Vec<Signature>> =
    Lazy::new(|| compile(TRAVERSAL_PATTERNS.iter().copied(), false));
static AUTOMATION: Lazy<Vec<Signature>> =
    Lazy::new(|| compile(AUTOMATION_USER_AGENTS.iter().copied(), true));
static USER_AGENT_SIGNATURES: Lazy<Vec<Signature>> = Lazy::new(|| {
    compile(
        AUTOMATION_USER_AGENTS
            .iter()
            .chain(MONITORING_USER_AGENTS)
            .copied(),
        true,
    )
});

fn table(category: PatternCategory) -> &'static [Signature] {
    match category {
        PatternCategory::Xss => XSS.as_slice(),
        PatternCategory::SqlInjection => SQL.as_slice(),
        PatternCategory::PathTraversal => TRAVERSAL.as_slice(),
        PatternCategory::Bot => AUTOMATION.as_slice(),
    }
}

fn matching(text: &str, categories: &[PatternCategory]) -> BTreeSet<PatternCategory> {
    categories
        .iter()
        .copied()
        .filter(|category| table(*category).iter().any(|sig| sig.is_match(text)))
        .collect()
}

/// Every category whose table matches `text`
pub fn classify(text: &str) -> BTreeSet<PatternCategory> {
    matching(
        text,
        &[
            PatternCategory::Xss,
            PatternCategory::SqlInjection,
            PatternCategory::PathTraversal,
            PatternCategory::Bot,
        ],
    )
}

/// Content attack categories matched by a request URL
pub fn classify_url(url: &str) -> BTreeSet<PatternCategory> {
    matching(
        url,
        &[
            PatternCategory::Xss,
            PatternCategory::SqlInjection,
            PatternCategory::PathTraversal,
        ],
    )
}

/// Automation categories matched by a user agent
pub fn classify_user_agent(user_agent: &str) -> BTreeSet<PatternCategory> {
    matching(user_agent, &[PatternCategory::Bot])
}

/// Whether free text carries script or inline handler markup
pub fn contains_markup_injection(text: &str) -> bool {
    XSS.iter().take(4).any(|sig| sig.is_match(text))
}

/// User-agent signatures scored by the bot detector, blocking and monitoring tools alike
pub fn user_agent_signatures() -> &'static [Signature] {
    USER_AGENT_SIGNATURES.as_slice()
}
