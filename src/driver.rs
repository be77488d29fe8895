//! The browser capability surface the agent drives.
//!
//! Everything the executor and the snapshot extractor need from a live page is
//! expressed here as a selector-addressed trait, so the loop can run against
//! Chromium ([`crate::browser::ChromiumDriver`]) or an in-memory page
//! ([`crate::static_page::StaticPage`]).

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Serialize, Deserialize)]
pub enum BrowserError {
    #[error("element not found: {0}")]
    ElementNotFound(String),
    #[error("interaction failed: {0}")]
    Interaction(String),
    #[error("navigation failed: {0}")]
    Navigation(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("browser is closed")]
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrollDirection {
    Up,
    Down,
    Top,
    Bottom,
}

impl ScrollDirection {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "up" => Some(Self::Up),
            "down" => Some(Self::Down),
            "top" => Some(Self::Top),
            "bottom" => Some(Self::Bottom),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Down => "down",
            Self::Top => "top",
            Self::Bottom => "bottom",
        }
    }

    /// Window-level script performing the scroll.
    pub fn script(&self) -> &'static str {
        match self {
            Self::Up => "window.scrollBy(0, -500)",
            Self::Down => "window.scrollBy(0, 500)",
            Self::Top => "window.scrollTo(0, 0)",
            Self::Bottom => "window.scrollTo(0, document.body.scrollHeight)",
        }
    }
}

/// How a `<select>` option is matched.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SelectBy {
    Value(String),
    Label(String),
}

/// One candidate node as read from the page, before any filtering.
///
/// `attributes` only ever carries names from the snapshot allow-list; the
/// extractor decides visibility, selectors and affordances from these fields.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RawElement {
    pub tag: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default)]
    pub width: f64,
    #[serde(default)]
    pub height: f64,
    #[serde(default)]
    pub visible: bool,
    #[serde(default)]
    pub has_click_handler: bool,
    #[serde(default)]
    pub content_editable: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FormField {
    pub tag: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub field_type: String,
    #[serde(default)]
    pub placeholder: String,
    #[serde(default)]
    pub required: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FormDescriptor {
    #[serde(default)]
    pub index: usize,
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub fields: Vec<FormField>,
}

#[async_trait]
pub trait PageDriver: Send + Sync {
    async fn url(&self) -> Result<String, BrowserError>;
    async fn title(&self) -> Result<String, BrowserError>;

    /// Load `url` and return once the document has parsed (DOMContentLoaded),
    /// not waiting for network idle.
    async fn goto(&self, url: &str, timeout: Duration) -> Result<(), BrowserError>;
    async fn wait_for_content_loaded(&self, timeout: Duration) -> Result<(), BrowserError>;
    async fn go_back(&self) -> Result<(), BrowserError>;

    /// Resolve `selector`, waiting at most `timeout`.
    async fn wait_for_selector(&self, selector: &str, timeout: Duration) -> Result<(), BrowserError>;
    async fn scroll_into_view(&self, selector: &str) -> Result<(), BrowserError>;
    async fn click(&self, selector: &str) -> Result<(), BrowserError>;
    async fn focus(&self, selector: &str) -> Result<(), BrowserError>;
    /// Replace the element's content with `text`.
    async fn fill(&self, selector: &str, text: &str) -> Result<(), BrowserError>;
    async fn select_option(&self, selector: &str, option: &SelectBy) -> Result<(), BrowserError>;
    async fn hover(&self, selector: &str) -> Result<(), BrowserError>;

    async fn press_key(&self, key: &str) -> Result<(), BrowserError>;
    async fn scroll(&self, direction: ScrollDirection) -> Result<(), BrowserError>;
    /// Capture the full page as a PNG at `path`.
    async fn screenshot(&self, path: &Path) -> Result<(), BrowserError>;

    /// Every node matching `selector`, in document order. Nodes that could not
    /// be read are dropped; an `Err` means the page could not be enumerated at all.
    async fn query_elements(&self, selector: &str) -> Result<Vec<RawElement>, BrowserError>;
    async fn query_forms(&self) -> Result<Vec<FormDescriptor>, BrowserError>;

    async fn close(&self) -> Result<(), BrowserError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scroll_direction_parses_case_insensitively() {
        assert_eq!(ScrollDirection::parse(" Down "), Some(ScrollDirection::Down));
        assert_eq!(ScrollDirection::parse("TOP"), Some(ScrollDirection::Top));
        assert_eq!(ScrollDirection::parse("sideways"), None);
    }

    #[test]
    fn raw_element_tolerates_missing_fields() {
        let raw: RawElement = serde_json::from_str(r#"{"tag":"a","visible":true}"#).unwrap();
        assert_eq!(raw.tag, "a");
        assert!(raw.attributes.is_empty());
        assert_eq!(raw.width, 0.0);
    }

    #[test]
    fn form_field_reads_type_key() {
        let field: FormField =
            serde_json::from_str(r#"{"tag":"input","name":"q","type":"search","required":true}"#)
                .unwrap();
        assert_eq!(field.field_type, "search");
        assert!(field.required);
    }
}
