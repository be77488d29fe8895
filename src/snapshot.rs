use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::driver::{BrowserError, FormDescriptor, PageDriver, RawElement};

/// Candidate nodes for the interactive surface.
pub const INTERACTIVE_SELECTORS: &[&str] = &[
    "a",
    "button",
    "input",
    "select",
    "textarea",
    "details",
    "summary",
    "[onclick]",
    "[role=\"button\"]",
    "[role=\"link\"]",
    "[role=\"tab\"]",
    "[role=\"menuitem\"]",
    "[tabindex]",
];

/// Never reported, even when a role/tabindex selector matches them.
pub const IGNORED_TAGS: &[&str] = &["script", "style", "noscript", "meta", "link", "head"];

/// The only attributes carried into a snapshot.
pub const ATTRIBUTE_ALLOW_LIST: &[&str] = &[
    "id",
    "name",
    "class",
    "type",
    "href",
    "placeholder",
    "value",
    "role",
    "aria-label",
    "title",
    "alt",
    "data-testid",
];

pub const MAX_TEXT_CHARS: usize = 100;

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl BoundingBox {
    fn rounded(x: f64, y: f64, width: f64, height: f64) -> Self {
        let r = |v: f64| (v * 10.0).round() / 10.0;
        Self { x: r(x), y: r(y), width: r(width), height: r(height) }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ElementInfo {
    /// 1-based position within one snapshot. Not stable across snapshots.
    pub index: usize,
    pub tag: String,
    pub role: Option<String>,
    pub text: String,
    pub href: Option<String>,
    pub placeholder: Option<String>,
    pub value: Option<String>,
    pub bbox: BoundingBox,
    /// Re-targets this element in later actions.
    pub selector: String,
    pub is_clickable: bool,
    pub is_editable: bool,
    pub is_visible: bool,
    pub attributes: BTreeMap<String, String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageType {
    LoginPage,
    SearchPage,
    DetailPage,
    ResultPage,
    FormPage,
    ListPage,
    #[default]
    Unknown,
}

impl PageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LoginPage => "login_page",
            Self::SearchPage => "search_page",
            Self::DetailPage => "detail_page",
            Self::ResultPage => "result_page",
            Self::FormPage => "form_page",
            Self::ListPage => "list_page",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for PageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Checked in order against the lowercased URL and title.
const PAGE_KEYWORDS: &[(PageType, &[&str])] = &[
    (PageType::LoginPage, &["login", "로그인"]),
    (PageType::SearchPage, &["search", "검색"]),
    (PageType::DetailPage, &["detail", "상세"]),
    (PageType::ResultPage, &["result", "결과"]),
    (PageType::FormPage, &["form", "신청", "작성"]),
    (PageType::ListPage, &["list", "목록"]),
];

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PageSnapshot {
    pub url: String,
    pub title: String,
    pub elements: Vec<ElementInfo>,
    pub forms: Vec<FormDescriptor>,
    pub page_type: PageType,
    pub summary: String,
}

impl PageSnapshot {
    pub fn clickable_count(&self) -> usize {
        self.elements.iter().filter(|e| e.is_clickable).count()
    }

    pub fn editable_count(&self) -> usize {
        self.elements.iter().filter(|e| e.is_editable).count()
    }
}

pub struct SnapshotExtractor<D> {
    page: Arc<D>,
}

impl<D: PageDriver> SnapshotExtractor<D> {
    pub fn new(page: Arc<D>) -> Self {
        Self { page }
    }

    /// Observe the current page.
    ///
    /// Unreadable elements are skipped and a failed form query yields no
    /// forms, but failing to enumerate elements at all is returned as an error
    /// so the caller can retry.
    pub async fn extract(&self) -> Result<PageSnapshot, BrowserError> {
        let url = self.page.url().await?;
        let title = self.page.title().await?;

        let raw = self.page.query_elements(&interactive_selector()).await?;
        let candidates = raw.len();
        let elements = build_elements(raw);

        let forms = match self.page.query_forms().await {
            Ok(forms) => forms,
            Err(e) => {
                warn!(error = %e, "form extraction failed");
                Vec::new()
            }
        };

        let page_type = infer_page_type(&url, &title, &elements);
        let summary = summarize(&url, &title, &elements, &forms);
        debug!(candidates, kept = elements.len(), %page_type, "snapshot extracted");

        Ok(PageSnapshot { url, title, elements, forms, page_type, summary })
    }
}

pub fn interactive_selector() -> String {
    INTERACTIVE_SELECTORS.join(", ")
}

/// Filter raw candidates down to visible interactive elements, indexed from 1
/// in document order.
pub fn build_elements(raw: Vec<RawElement>) -> Vec<ElementInfo> {
    let mut elements = Vec::with_capacity(raw.len());
    for candidate in raw {
        if let Some(info) = element_from_raw(candidate, elements.len() + 1) {
            elements.push(info);
        }
    }
    elements
}

fn element_from_raw(raw: RawElement, index: usize) -> Option<ElementInfo> {
    let tag = raw.tag.trim().to_ascii_lowercase();
    if tag.is_empty() || IGNORED_TAGS.contains(&tag.as_str()) {
        return None;
    }
    if !raw.visible || !(raw.width > 0.0) || !(raw.height > 0.0) {
        return None;
    }

    let attributes: BTreeMap<String, String> = raw
        .attributes
        .into_iter()
        .filter(|(k, v)| !v.is_empty() && ATTRIBUTE_ALLOW_LIST.contains(&k.as_str()))
        .collect();

    let role = attributes.get("role").cloned();
    let is_clickable =
        matches!(tag.as_str(), "a" | "button") || raw.has_click_handler || role.as_deref() == Some("button");
    let is_editable = matches!(tag.as_str(), "input" | "textarea" | "select") || raw.content_editable;

    Some(ElementInfo {
        index,
        selector: generate_selector(&tag, &attributes),
        text: truncate_chars(raw.text.trim(), MAX_TEXT_CHARS),
        role,
        href: attributes.get("href").cloned(),
        placeholder: attributes.get("placeholder").cloned(),
        value: attributes.get("value").cloned(),
        bbox: BoundingBox::rounded(raw.x, raw.y, raw.width, raw.height),
        tag,
        is_clickable,
        is_editable,
        is_visible: true,
        attributes,
    })
}

/// Selector priority: id, then name scoped by tag, then test id, then the tag
/// with its first two classes, then the bare tag.
pub fn generate_selector(tag: &str, attributes: &BTreeMap<String, String>) -> String {
    if let Some(id) = attributes.get("id").filter(|v| !v.trim().is_empty()) {
        return if is_css_ident(id) {
            format!("#{id}")
        } else {
            format!("[id='{}']", quote(id))
        };
    }
    if let Some(name) = attributes.get("name").filter(|v| !v.trim().is_empty()) {
        return format!("{tag}[name='{}']", quote(name));
    }
    if let Some(test_id) = attributes.get("data-testid").filter(|v| !v.trim().is_empty()) {
        return format!("[data-testid='{}']", quote(test_id));
    }
    let classes: Vec<&str> = attributes
        .get("class")
        .map(|c| c.split_whitespace().filter(|c| is_css_ident(c)).take(2).collect())
        .unwrap_or_default();
    if classes.is_empty() {
        tag.to_string()
    } else {
        format!("{tag}.{}", classes.join("."))
    }
}

fn is_css_ident(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' || c == '-' => {}
        _ => return false,
    }
    chars.all(|c| c.is_alphanumeric() || c == '_' || c == '-')
}

fn quote(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'")
}

pub(crate) fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

pub fn infer_page_type(url: &str, title: &str, elements: &[ElementInfo]) -> PageType {
    let url = url.to_lowercase();
    let title = title.to_lowercase();
    for (page_type, keywords) in PAGE_KEYWORDS {
        if keywords.iter().any(|k| url.contains(k) || title.contains(k)) {
            return *page_type;
        }
    }

    let editable = elements.iter().filter(|e| e.is_editable).count();
    let links = elements.iter().filter(|e| e.tag == "a").count();
    if editable >= 3 {
        PageType::FormPage
    } else if links >= 10 {
        PageType::ListPage
    } else {
        PageType::Unknown
    }
}

fn summarize(url: &str, title: &str, elements: &[ElementInfo], forms: &[FormDescriptor]) -> String {
    let clickable = elements.iter().filter(|e| e.is_clickable).count();
    let editable = elements.iter().filter(|e| e.is_editable).count();
    format!(
        "URL: {url} | Title: {title} | Clickable: {clickable} | Editable: {editable} | Forms: {}",
        forms.len()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(tag: &str, attrs: &[(&str, &str)]) -> RawElement {
        RawElement {
            tag: tag.to_string(),
            attributes: attrs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            width: 80.0,
            height: 20.0,
            visible: true,
            ..Default::default()
        }
    }

    fn attrs(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn selector_priority() {
        assert_eq!(generate_selector("input", &attrs(&[("id", "id"), ("name", "user_id")])), "#id");
        assert_eq!(generate_selector("input", &attrs(&[("name", "q")])), "input[name='q']");
        assert_eq!(
            generate_selector("div", &attrs(&[("data-testid", "card"), ("class", "a b")])),
            "[data-testid='card']"
        );
        assert_eq!(generate_selector("a", &attrs(&[("class", "infoClose btn big")])), "a.infoClose.btn");
        assert_eq!(generate_selector("button", &attrs(&[])), "button");
    }

    #[test]
    fn selector_quotes_awkward_values() {
        assert_eq!(generate_selector("div", &attrs(&[("id", "1st item")])), "[id='1st item']");
        assert_eq!(generate_selector("input", &attrs(&[("name", "o'neil")])), "input[name='o\\'neil']");
    }

    #[test]
    fn hidden_and_zero_area_elements_are_dropped() {
        let mut hidden = raw("button", &[("id", "hidden")]);
        hidden.visible = false;
        let mut flat = raw("a", &[("id", "flat")]);
        flat.height = 0.0;
        let script = raw("script", &[]);
        let kept = raw("a", &[("id", "kept")]);

        let elements = build_elements(vec![hidden, flat, script, kept]);
        assert_eq!(elements.len(), 1);
        assert_eq!(elements[0].selector, "#kept");
        assert_eq!(elements[0].index, 1);
    }

    #[test]
    fn affordances_and_attribute_filtering() {
        let mut div = raw("DIV", &[("role", "button"), ("onmouseover", "x()"), ("title", "")]);
        div.text = format!("  {}  ", "가".repeat(150));
        let mut editable = raw("div", &[]);
        editable.content_editable = true;

        let elements = build_elements(vec![div, editable, raw("select", &[("name", "branch")])]);
        assert_eq!(elements[0].tag, "div");
        assert!(elements[0].is_clickable);
        assert!(!elements[0].is_editable);
        assert_eq!(elements[0].text.chars().count(), MAX_TEXT_CHARS);
        assert_eq!(elements[0].attributes.len(), 1);
        assert!(elements[1].is_editable);
        assert!(elements[2].is_editable);
        assert!(!elements[2].is_clickable);
    }

    #[test]
    fn bbox_rounds_to_one_decimal() {
        let mut r = raw("a", &[]);
        r.x = 10.04;
        r.y = 3.26;
        r.width = 99.99;
        let el = &build_elements(vec![r])[0];
        assert_eq!(el.bbox, BoundingBox { x: 10.0, y: 3.3, width: 100.0, height: 20.0 });
    }

    #[test]
    fn page_type_keywords_then_shape() {
        assert_eq!(infer_page_type("https://lib.example/login", "", &[]), PageType::LoginPage);
        assert_eq!(infer_page_type("https://lib.example/", "통합검색", &[]), PageType::SearchPage);
        assert_eq!(infer_page_type("https://lib.example/", "대출 신청", &[]), PageType::FormPage);

        let inputs = build_elements(vec![raw("input", &[]), raw("input", &[]), raw("textarea", &[])]);
        assert_eq!(infer_page_type("https://lib.example/", "Home", &inputs), PageType::FormPage);

        let links = build_elements((0..10).map(|_| raw("a", &[])).collect());
        assert_eq!(infer_page_type("https://lib.example/", "Home", &links), PageType::ListPage);
        assert_eq!(infer_page_type("https://lib.example/", "Home", &links[..9]), PageType::Unknown);
    }

    #[test]
    fn page_type_serializes_snake_case() {
        assert_eq!(serde_json::to_value(PageType::LoginPage).unwrap(), "login_page");
        assert_eq!(serde_json::to_value(PageType::Unknown).unwrap(), "unknown");
    }
}
