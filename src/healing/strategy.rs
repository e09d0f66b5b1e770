// Remediation strategies and the fixed ladders they are drawn from

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use url::Url;

use crate::backoff::duration_ms;
use crate::classifier::{ErrorKind, ToolCategory};

const SHORT_WAIT: Duration = Duration::from_secs(2);
const MEDIUM_WAIT: Duration = Duration::from_secs(5);
const LONG_WAIT: Duration = Duration::from_secs(10);
const LOAD_TIMEOUT: Duration = Duration::from_secs(10);
const NETWORK_IDLE_TIMEOUT: Duration = Duration::from_secs(15);

/// Fieldless discriminant of [`RemediationStrategy`], used as the statistics key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    ScreenshotFirst,
    GeneralizeSelector,
    WaitForLoad,
    ScanPage,
    ShortWait,
    MediumWait,
    LongWait,
    WaitForNetworkIdle,
    ForceHttps,
    ToggleWww,
    BareDomain,
    VisualCheck,
    FullTextSearch,
    DomDump,
    RetryAsIs,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 15] = [
        StrategyKind::ScreenshotFirst,
        StrategyKind::GeneralizeSelector,
        StrategyKind::WaitForLoad,
        StrategyKind::ScanPage,
        StrategyKind::ShortWait,
        StrategyKind::MediumWait,
        StrategyKind::LongWait,
        StrategyKind::WaitForNetworkIdle,
        StrategyKind::ForceHttps,
        StrategyKind::ToggleWww,
        StrategyKind::BareDomain,
        StrategyKind::VisualCheck,
        StrategyKind::FullTextSearch,
        StrategyKind::DomDump,
        StrategyKind::RetryAsIs,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::ScreenshotFirst => "screenshot_first",
            StrategyKind::GeneralizeSelector => "generalize_selector",
            StrategyKind::WaitForLoad => "wait_for_load",
            StrategyKind::ScanPage => "scan_page",
            StrategyKind::ShortWait => "short_wait",
            StrategyKind::MediumWait => "medium_wait",
            StrategyKind::LongWait => "long_wait",
            StrategyKind::WaitForNetworkIdle => "wait_for_network_idle",
            StrategyKind::ForceHttps => "force_https",
            StrategyKind::ToggleWww => "toggle_www",
            StrategyKind::BareDomain => "bare_domain",
            StrategyKind::VisualCheck => "visual_check",
            StrategyKind::FullTextSearch => "full_text_search",
            StrategyKind::DomDump => "dom_dump",
            StrategyKind::RetryAsIs => "retry_as_is",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == value)
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure family; each has a fixed ladder of strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    Selector,
    Timing,
    Navigation,
    Extraction,
    HumanRequired,
    Generic,
}

impl FailureCategory {
    pub fn categorize(kind: ErrorKind, tool: ToolCategory) -> Self {
        let extracting = matches!(tool, ToolCategory::Extraction | ToolCategory::Bulk);
        let navigating = tool == ToolCategory::Navigation;
        match kind {
            ErrorKind::Captcha | ErrorKind::AuthRequired => FailureCategory::HumanRequired,
            ErrorKind::SelectorNotFound | ErrorKind::StaleElement | ErrorKind::Unknown
                if extracting =>
            {
                FailureCategory::Extraction
            }
            ErrorKind::SelectorNotFound | ErrorKind::StaleElement => FailureCategory::Selector,
            ErrorKind::NetworkTimeout | ErrorKind::RateLimited => FailureCategory::Timing,
            ErrorKind::NotFound | ErrorKind::ConnectionReset | ErrorKind::ServerError
                if navigating =>
            {
                FailureCategory::Navigation
            }
            ErrorKind::ServerError | ErrorKind::ConnectionReset => FailureCategory::Timing,
            ErrorKind::NotFound | ErrorKind::PageCrash | ErrorKind::Unknown => {
                FailureCategory::Generic
            }
        }
    }

    pub fn ladder(&self) -> &'static [StrategyKind] {
        use StrategyKind::*;
        match self {
            FailureCategory::Selector => &[ScreenshotFirst, GeneralizeSelector, WaitForLoad, ScanPage],
            FailureCategory::Timing => &[ShortWait, MediumWait, LongWait, WaitForNetworkIdle],
            FailureCategory::Navigation => &[ForceHttps, ToggleWww, BareDomain],
            FailureCategory::Extraction => &[VisualCheck, FullTextSearch, DomDump],
            FailureCategory::HumanRequired => &[],
            FailureCategory::Generic => &[RetryAsIs],
        }
    }

    /// Suggested next steps once the ladder is exhausted
    pub fn suggestions(&self) -> Vec<String> {
        let lines: &[&str] = match self {
            FailureCategory::Selector => &[
                "Take a fresh snapshot and locate the element by visible text",
                "Check whether the element lives inside an iframe or shadow root",
                "Confirm the page finished rendering client-side content",
            ],
            FailureCategory::Timing => &[
                "Check whether the site is rate limiting this session",
                "Retry later or lower the run concurrency",
            ],
            FailureCategory::Navigation => &[
                "Verify the URL manually",
                "Search for the page instead of navigating directly",
            ],
            FailureCategory::Extraction => &[
                "Inspect a screenshot to confirm the data is visible",
                "Narrow the extraction to a smaller region of the page",
            ],
            FailureCategory::HumanRequired => &[
                "This page requires a human (captcha or login)",
                "Complete the challenge in the browser, then resume the run",
            ],
            FailureCategory::Generic => &[
                "Reload the page and retry the action",
                "Ask the operator for guidance",
            ],
        };
        lines.iter().map(|s| s.to_string()).collect()
    }
}

/// Terminal payload when no strategy is left to try
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticReport {
    pub category: FailureCategory,
    pub error_kind: ErrorKind,
    pub error: String,
    pub strategies_tried: Vec<StrategyKind>,
    pub suggestions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum RemediationStrategy {
    ScreenshotFirst,
    GeneralizeSelector {
        original: String,
        generalized: String,
    },
    WaitForLoad {
        #[serde(with = "duration_ms")]
        timeout: Duration,
    },
    ScanPage,
    Wait {
        #[serde(with = "duration_ms")]
        duration: Duration,
    },
    WaitForNetworkIdle {
        #[serde(with = "duration_ms")]
        timeout: Duration,
    },
    ForceHttps {
        url: String,
    },
    ToggleWww {
        url: String,
    },
    BareDomain {
        url: String,
    },
    VisualCheck,
    FullTextSearch {
        needle: String,
    },
    DomDump,
    RetryAsIs,
    Exhausted(DiagnosticReport),
}

impl RemediationStrategy {
    /// `None` only for `Exhausted`
    pub fn kind(&self) -> Option<StrategyKind> {
        let kind = match self {
            RemediationStrategy::ScreenshotFirst => StrategyKind::ScreenshotFirst,
            RemediationStrategy::GeneralizeSelector { .. } => StrategyKind::GeneralizeSelector,
            RemediationStrategy::WaitForLoad { .. } => StrategyKind::WaitForLoad,
            RemediationStrategy::ScanPage => StrategyKind::ScanPage,
            RemediationStrategy::Wait { duration } if *duration <= SHORT_WAIT => {
                StrategyKind::ShortWait
            }
            RemediationStrategy::Wait { duration } if *duration <= MEDIUM_WAIT => {
                StrategyKind::MediumWait
            }
            RemediationStrategy::Wait { .. } => StrategyKind::LongWait,
            RemediationStrategy::WaitForNetworkIdle { .. } => StrategyKind::WaitForNetworkIdle,
            RemediationStrategy::ForceHttps { .. } => StrategyKind::ForceHttps,
            RemediationStrategy::ToggleWww { .. } => StrategyKind::ToggleWww,
            RemediationStrategy::BareDomain { .. } => StrategyKind::BareDomain,
            RemediationStrategy::VisualCheck => StrategyKind::VisualCheck,
            RemediationStrategy::FullTextSearch { .. } => StrategyKind::FullTextSearch,
            RemediationStrategy::DomDump => StrategyKind::DomDump,
            RemediationStrategy::RetryAsIs => StrategyKind::RetryAsIs,
            RemediationStrategy::Exhausted(_) => return None,
        };
        Some(kind)
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, RemediationStrategy::Exhausted(_))
    }

    /// Delay the executor sleeps before the remediated call
    pub fn pre_delay(&self) -> Duration {
        match self {
            RemediationStrategy::Wait { duration } => *duration,
            _ => Duration::ZERO,
        }
    }

    /// Arguments for the remediated call.
    ///
    /// Rewrites `selector`/`url` where the strategy derived a new one and
    /// attaches the strategy itself under `_remediation` as a hint to the tool.
    pub fn apply_to_args(&self, args: &Value) -> Value {
        let mut args = args.clone();
        let Some(map) = args.as_object_mut() else {
            return args;
        };
        match self {
            RemediationStrategy::GeneralizeSelector { generalized, .. } => {
                map.insert("selector".into(), Value::String(generalized.clone()));
            }
            RemediationStrategy::ForceHttps { url }
            | RemediationStrategy::ToggleWww { url }
            | RemediationStrategy::BareDomain { url } => {
                map.insert("url".into(), Value::String(url.clone()));
            }
            _ => {}
        }
        if let Ok(hint) = serde_json::to_value(self) {
            map.insert("_remediation".into(), hint);
        }
        args
    }

    /// Build the concrete strategy for `kind`, or `None` if it cannot apply
    /// to this failure (no selector to loosen, URL already in that form).
    pub fn build(kind: StrategyKind, context: &FailureContext) -> Option<Self> {
        let strategy = match kind {
            StrategyKind::ScreenshotFirst => RemediationStrategy::ScreenshotFirst,
            StrategyKind::GeneralizeSelector => {
                let original = context.selector.as_deref()?;
                let generalized = generalize_selector(original)?;
                RemediationStrategy::GeneralizeSelector {
                    original: original.to_string(),
                    generalized,
                }
            }
            StrategyKind::WaitForLoad => RemediationStrategy::WaitForLoad {
                timeout: LOAD_TIMEOUT,
            },
            StrategyKind::ScanPage => RemediationStrategy::ScanPage,
            StrategyKind::ShortWait => RemediationStrategy::Wait {
                duration: SHORT_WAIT,
            },
            StrategyKind::MediumWait => RemediationStrategy::Wait {
                duration: MEDIUM_WAIT,
            },
            StrategyKind::LongWait => RemediationStrategy::Wait {
                duration: LONG_WAIT,
            },
            StrategyKind::WaitForNetworkIdle => RemediationStrategy::WaitForNetworkIdle {
                timeout: NETWORK_IDLE_TIMEOUT,
            },
            StrategyKind::ForceHttps => RemediationStrategy::ForceHttps {
                url: force_https(context.url.as_deref()?)?,
            },
            StrategyKind::ToggleWww => RemediationStrategy::ToggleWww {
                url: toggle_www(context.url.as_deref()?)?,
            },
            StrategyKind::BareDomain => RemediationStrategy::BareDomain {
                url: bare_domain(context.url.as_deref()?)?,
            },
            StrategyKind::VisualCheck => RemediationStrategy::VisualCheck,
            StrategyKind::FullTextSearch => RemediationStrategy::FullTextSearch {
                needle: context.search_text(),
            },
            StrategyKind::DomDump => RemediationStrategy::DomDump,
            StrategyKind::RetryAsIs => RemediationStrategy::RetryAsIs,
        };
        Some(strategy)
    }
}

impl fmt::Display for RemediationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemediationStrategy::GeneralizeSelector { generalized, .. } => {
                write!(f, "generalize_selector({generalized})")
            }
            RemediationStrategy::Wait { duration } => write!(f, "wait({}ms)", duration.as_millis()),
            RemediationStrategy::ForceHttps { url }
            | RemediationStrategy::ToggleWww { url }
            | RemediationStrategy::BareDomain { url } => {
                write!(f, "{}({url})", self.kind().map(|k| k.as_str()).unwrap_or(""))
            }
            RemediationStrategy::Exhausted(report) => {
                write!(f, "exhausted({} strategies tried)", report.strategies_tried.len())
            }
            other => match other.kind() {
                Some(kind) => f.write_str(kind.as_str()),
                None => f.write_str("exhausted"),
            },
        }
    }
}

/// What the learner knows about the failing call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FailureContext {
    pub action: String,
    pub tool_name: String,
    pub args: Value,
    pub url: Option<String>,
    pub selector: Option<String>,
}

impl FailureContext {
    /// Pulls `url` and `selector` out of the tool arguments when present
    pub fn new(action: impl Into<String>, tool_name: impl Into<String>, args: Value) -> Self {
        let text = |key: &str| args.get(key).and_then(Value::as_str).map(str::to_string);
        let url = text("url");
        let selector = text("selector");
        Self {
            action: action.into(),
            tool_name: tool_name.into(),
            args,
            url,
            selector,
        }
    }

    pub fn tool_category(&self) -> ToolCategory {
        ToolCategory::of(&self.tool_name)
    }

    fn search_text(&self) -> String {
        ["text", "query", "field", "label"]
            .iter()
            .find_map(|key| self.args.get(*key).and_then(Value::as_str))
            .map(str::to_string)
            .unwrap_or_else(|| self.action.clone())
    }
}

static POSITIONAL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r":nth-(?:last-)?(?:child|of-type)\([^)]*\)").expect("valid positional pattern")
});
static ID_OR_CLASS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[#.][A-Za-z0-9_-]+").expect("valid id/class pattern"));
static DIGIT_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d{4,}").expect("valid digit run pattern"));

fn is_volatile_name(name: &str) -> bool {
    if DIGIT_RUN.is_match(name) {
        return true;
    }
    // generated hashes such as css-1a2b3c or btn_9f8e7d6c
    name.split(['-', '_']).any(|segment| {
        segment.len() >= 6
            && segment.chars().all(|c| c.is_ascii_hexdigit())
            && segment.chars().any(|c| c.is_ascii_digit())
            && segment.chars().any(|c| c.is_ascii_alphabetic())
    })
}

/// Loosen a CSS selector.
///
/// Drops positional pseudo-classes and generated ids/classes. If neither
/// applies, drops the outermost ancestor step. Returns `None` when nothing
/// can be loosened.
pub fn generalize_selector(selector: &str) -> Option<String> {
    let original = selector.trim();
    let without_positions = POSITIONAL.replace_all(original, "");
    let without_volatile = ID_OR_CLASS.replace_all(&without_positions, |caps: &regex::Captures| {
        if is_volatile_name(&caps[0][1..]) {
            String::new()
        } else {
            caps[0].to_string()
        }
    });

    let mut steps: Vec<&str> = without_volatile.split_whitespace().collect();
    // a step emptied down to a bare combinator is meaningless at the edges
    while matches!(steps.first(), Some(&(">" | "+" | "~"))) {
        steps.remove(0);
    }
    while matches!(steps.last(), Some(&(">" | "+" | "~"))) {
        steps.pop();
    }
    let cleaned = steps.join(" ");

    if !cleaned.is_empty() && cleaned != original {
        return Some(cleaned);
    }
    if cleaned.is_empty() {
        return None;
    }

    let mut steps: Vec<&str> = original.split_whitespace().collect();
    if steps.len() < 2 {
        return None;
    }
    steps.remove(0);
    if matches!(steps.first(), Some(&(">" | "+" | "~"))) {
        steps.remove(0);
    }
    (!steps.is_empty()).then(|| steps.join(" "))
}

fn parse_loose(raw: &str) -> Option<Url> {
    Url::parse(raw)
        .ok()
        .filter(|url| url.has_host())
        .or_else(|| Url::parse(&format!("http://{raw}")).ok())
}

fn changed(raw: &str, candidate: Url) -> Option<String> {
    let candidate = candidate.to_string();
    let original = parse_loose(raw).map(|u| u.to_string());
    (original.as_deref() != Some(candidate.as_str())).then_some(candidate)
}

pub fn force_https(raw: &str) -> Option<String> {
    let mut url = parse_loose(raw)?;
    if url.scheme() != "http" {
        return None;
    }
    url.set_scheme("https").ok()?;
    changed(raw, url)
}

pub fn toggle_www(raw: &str) -> Option<String> {
    let mut url = parse_loose(raw)?;
    let host = url.domain()?.to_string();
    let toggled = match host.strip_prefix("www.") {
        Some(bare) => bare.to_string(),
        None => format!("www.{host}"),
    };
    url.set_host(Some(&toggled)).ok()?;
    changed(raw, url)
}

pub fn bare_domain(raw: &str) -> Option<String> {
    let mut url = parse_loose(raw)?;
    url.set_path("/");
    url.set_query(None);
    url.set_fragment(None);
    changed(raw, url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_categorize_by_kind_and_tool() {
        use ErrorKind::*;
        let cases = [
            (SelectorNotFound, "browser_click", FailureCategory::Selector),
            (SelectorNotFound, "extract_table", FailureCategory::Extraction),
            (NetworkTimeout, "browser_click", FailureCategory::Timing),
            (NotFound, "navigate", FailureCategory::Navigation),
            (NotFound, "click", FailureCategory::Generic),
            (ServerError, "click", FailureCategory::Timing),
            (Captcha, "navigate", FailureCategory::HumanRequired),
            (AuthRequired, "extract", FailureCategory::HumanRequired),
            (PageCrash, "click", FailureCategory::Generic),
        ];
        for (kind, tool, expected) in cases {
            assert_eq!(
                FailureCategory::categorize(kind, ToolCategory::of(tool)),
                expected,
                "{kind} via {tool}"
            );
        }
    }

    #[test]
    fn test_ladders_have_fixed_shape() {
        assert_eq!(
            FailureCategory::Selector.ladder(),
            &[
                StrategyKind::ScreenshotFirst,
                StrategyKind::GeneralizeSelector,
                StrategyKind::WaitForLoad,
                StrategyKind::ScanPage
            ]
        );
        assert_eq!(FailureCategory::Navigation.ladder().len(), 3);
        assert!(FailureCategory::HumanRequired.ladder().is_empty());
    }

    #[test]
    fn test_generalize_selector() {
        assert_eq!(
            generalize_selector("ul.results > li:nth-child(3) a").as_deref(),
            Some("ul.results > li a")
        );
        assert_eq!(
            generalize_selector("#item-123456 .price").as_deref(),
            Some(".price")
        );
        assert_eq!(
            generalize_selector("div.css-1a2b3c4 button.buy").as_deref(),
            Some("div button.buy")
        );
        // nothing volatile: drop the outermost ancestor step
        assert_eq!(
            generalize_selector("form#checkout > button.submit").as_deref(),
            Some("button.submit")
        );
        assert_eq!(generalize_selector("button.submit"), None);
        assert_eq!(generalize_selector("#node-99999"), None);
    }

    #[test]
    fn test_url_remediations() {
        assert_eq!(
            force_https("http://shop.example.com/cart").as_deref(),
            Some("https://shop.example.com/cart")
        );
        assert_eq!(force_https("https://shop.example.com/cart"), None);

        assert_eq!(
            toggle_www("https://example.com/a").as_deref(),
            Some("https://www.example.com/a")
        );
        assert_eq!(
            toggle_www("https://www.example.com/a").as_deref(),
            Some("https://example.com/a")
        );
        assert_eq!(toggle_www("http://127.0.0.1:8080/"), None);

        assert_eq!(
            bare_domain("https://example.com/deep/path?q=1#frag").as_deref(),
            Some("https://example.com/")
        );
        assert_eq!(bare_domain("https://example.com/"), None);
    }

    #[test]
    fn test_build_skips_inapplicable() {
        let context = FailureContext::new("click buy", "browser_click", json!({"selector": "button"}));
        assert_eq!(
            RemediationStrategy::build(StrategyKind::GeneralizeSelector, &context),
            None
        );
        assert_eq!(RemediationStrategy::build(StrategyKind::ForceHttps, &context), None);
        assert_eq!(
            RemediationStrategy::build(StrategyKind::MediumWait, &context),
            Some(RemediationStrategy::Wait {
                duration: Duration::from_secs(5)
            })
        );
    }

    #[test]
    fn test_wait_kind_follows_duration() {
        for kind in [StrategyKind::ShortWait, StrategyKind::MediumWait, StrategyKind::LongWait] {
            let strategy = RemediationStrategy::build(kind, &FailureContext::default()).unwrap();
            assert_eq!(strategy.kind(), Some(kind));
        }
    }

    #[test]
    fn test_apply_to_args_rewrites_and_tags() {
        let strategy = RemediationStrategy::ForceHttps {
            url: "https://example.com/".to_string(),
        };
        let args = strategy.apply_to_args(&json!({"url": "http://example.com/", "wait": true}));
        assert_eq!(args["url"], "https://example.com/");
        assert_eq!(args["wait"], true);
        assert_eq!(args["_remediation"]["strategy"], "force_https");

        let wait = RemediationStrategy::Wait {
            duration: Duration::from_secs(2),
        };
        let args = wait.apply_to_args(&json!({}));
        assert_eq!(args["_remediation"]["duration"], 2000);
        assert_eq!(wait.pre_delay(), Duration::from_secs(2));
    }
}
