// Error classification for Rebound
// Maps raw tool/browser error text onto the closed ErrorKind taxonomy

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Closed taxonomy of failures. Retry policy lookup keys on this and nothing else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NetworkTimeout,
    RateLimited,
    ServerError,
    Captcha,
    SelectorNotFound,
    StaleElement,
    NotFound,
    AuthRequired,
    ConnectionReset,
    PageCrash,
    Unknown,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 11] = [
        ErrorKind::NetworkTimeout,
        ErrorKind::RateLimited,
        ErrorKind::ServerError,
        ErrorKind::Captcha,
        ErrorKind::SelectorNotFound,
        ErrorKind::StaleElement,
        ErrorKind::NotFound,
        ErrorKind::AuthRequired,
        ErrorKind::ConnectionReset,
        ErrorKind::PageCrash,
        ErrorKind::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NetworkTimeout => "network_timeout",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::ServerError => "server_error",
            ErrorKind::Captcha => "captcha",
            ErrorKind::SelectorNotFound => "selector_not_found",
            ErrorKind::StaleElement => "stale_element",
            ErrorKind::NotFound => "not_found",
            ErrorKind::AuthRequired => "auth_required",
            ErrorKind::ConnectionReset => "connection_reset",
            ErrorKind::PageCrash => "page_crash",
            ErrorKind::Unknown => "unknown",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == value)
    }

    /// Permanent failures never benefit from retrying.
    pub fn is_permanent(&self) -> bool {
        matches!(self, ErrorKind::NotFound | ErrorKind::AuthRequired)
    }

    /// Failures that say the target resource itself is unhealthy. Only these
    /// count toward a circuit breaker trip.
    pub fn reflects_resource_health(&self) -> bool {
        matches!(
            self,
            ErrorKind::NetworkTimeout
                | ErrorKind::RateLimited
                | ErrorKind::ServerError
                | ErrorKind::ConnectionReset
                | ErrorKind::PageCrash
        )
    }

    /// Transient failures may be retried immediately without backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorKind::NetworkTimeout | ErrorKind::ConnectionReset | ErrorKind::StaleElement
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Evaluated top to bottom; first match wins.
static RULES: Lazy<Vec<(ErrorKind, Regex)>> = Lazy::new(|| {
    let rules: [(ErrorKind, &str); 10] = [
        (
            ErrorKind::NetworkTimeout,
            r"timeout|timed out|time out|deadline exceeded|etimedout",
        ),
        (
            ErrorKind::RateLimited,
            r"\b429\b|rate.?limit|too many requests|throttl|quota exceeded",
        ),
        (
            ErrorKind::ServerError,
            r"\b50[0-9]\b|internal server error|bad gateway|service unavailable|server error",
        ),
        (
            ErrorKind::Captcha,
            r"captcha|are you a robot|verify you are human|bot detection|challenge page",
        ),
        (
            ErrorKind::SelectorNotFound,
            r"selector|no such element|element not found|no node found|unable to locate|could not find element|not interactable",
        ),
        (
            ErrorKind::StaleElement,
            r"stale element|detached from (the )?(dom|document)|not attached to the (dom|page)|node is detached",
        ),
        (
            ErrorKind::NotFound,
            r"\b404\b|not found|no such page|does not exist",
        ),
        (
            ErrorKind::AuthRequired,
            r"\b401\b|\b403\b|unauthori[sz]ed|forbidden|login required|sign.?in required|authentication|access denied",
        ),
        (
            ErrorKind::ConnectionReset,
            r"connection (reset|refused|closed|aborted)|econnreset|econnrefused|socket hang up|broken pipe|net::err_",
        ),
        (
            ErrorKind::PageCrash,
            r"page crash|target crashed|crashed|renderer|aw, snap|browser (has )?disconnected|target closed|session closed",
        ),
    ];

    rules
        .into_iter()
        .map(|(kind, pattern)| {
            let regex = Regex::new(&format!("(?i){pattern}"))
                .unwrap_or_else(|e| panic!("invalid built-in pattern for {kind}: {e}"));
            (kind, regex)
        })
        .collect()
});

/// Coarse tool class used for timeouts and remediation ladders
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCategory {
    Interaction,
    Navigation,
    Extraction,
    Bulk,
    Other,
}

impl ToolCategory {
    pub const ALL: [ToolCategory; 5] = [
        ToolCategory::Interaction,
        ToolCategory::Navigation,
        ToolCategory::Extraction,
        ToolCategory::Bulk,
        ToolCategory::Other,
    ];

    /// Lookup by tool name prefix, e.g. `browser_click` or `click_element`
    pub fn of(tool_name: &str) -> Self {
        let name = tool_name.to_ascii_lowercase();
        let name = name.strip_prefix("browser_").unwrap_or(&name);

        const BULK: &[&str] = &["batch", "bulk", "crawl", "download", "paginate"];
        const EXTRACTION: &[&str] = &[
            "extract", "scrape", "read", "get_text", "get_content", "screenshot", "snapshot",
            "query",
        ];
        const NAVIGATION: &[&str] = &["navigate", "goto", "open", "reload", "back", "forward"];
        const INTERACTION: &[&str] = &[
            "click", "fill", "type", "select", "hover", "press", "scroll", "check", "focus",
            "upload",
        ];

        let matches = |words: &[&str]| words.iter().any(|w| name.starts_with(w));
        if matches(BULK) {
            ToolCategory::Bulk
        } else if matches(EXTRACTION) {
            ToolCategory::Extraction
        } else if matches(NAVIGATION) {
            ToolCategory::Navigation
        } else if matches(INTERACTION) {
            ToolCategory::Interaction
        } else {
            ToolCategory::Other
        }
    }
}

/// Pure, order-sensitive classifier over raw error text.
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorClassifier;

impl ErrorClassifier {
    pub fn new() -> Self {
        Self
    }

    /// Classify an error message. Total: unmatched text is `Unknown`.
    pub fn classify(&self, error: &str) -> ErrorKind {
        RULES
            .iter()
            .find(|(_, regex)| regex.is_match(error))
            .map(|(kind, _)| *kind)
            .unwrap_or(ErrorKind::Unknown)
    }

    pub fn is_permanent(&self, kind: ErrorKind) -> bool {
        kind.is_permanent()
    }

    pub fn is_transient(&self, kind: ErrorKind) -> bool {
        kind.is_transient()
    }
}
