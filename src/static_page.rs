//! An in-memory [`PageDriver`].
//!
//! Pages are plain element lists keyed by URL. Links carry a navigation target,
//! inputs remember what was typed into them, and enumeration failures can be
//! injected, which is enough to drive the whole agent loop without a browser.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::driver::{BrowserError, FormDescriptor, PageDriver, RawElement, ScrollDirection, SelectBy};

pub const BLANK_URL: &str = "about:blank";

#[derive(Clone, Debug)]
pub struct StaticElement {
    tag: String,
    text: String,
    attributes: BTreeMap<String, String>,
    visible: bool,
    width: f64,
    height: f64,
    link: Option<String>,
    content_editable: bool,
    options: Vec<(String, String)>,
    detached: bool,
    value: String,
}

impl StaticElement {
    pub fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_ascii_lowercase(),
            text: String::new(),
            attributes: BTreeMap::new(),
            visible: true,
            width: 120.0,
            height: 24.0,
            link: None,
            content_editable: false,
            options: Vec::new(),
            detached: false,
            value: String::new(),
        }
    }

    pub fn id(self, id: &str) -> Self {
        self.attr("id", id)
    }

    pub fn name(self, name: &str) -> Self {
        self.attr("name", name)
    }

    pub fn class(self, class: &str) -> Self {
        self.attr("class", class)
    }

    pub fn text(mut self, text: &str) -> Self {
        self.text = text.to_string();
        self
    }

    pub fn attr(mut self, key: &str, value: &str) -> Self {
        self.attributes.insert(key.to_string(), value.to_string());
        self
    }

    pub fn hidden(mut self) -> Self {
        self.visible = false;
        self
    }

    pub fn size(mut self, width: f64, height: f64) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Clicking this element loads `url`.
    pub fn link_to(mut self, url: &str) -> Self {
        self.link = Some(url.to_string());
        if self.tag == "a" {
            self.attributes.insert("href".to_string(), url.to_string());
        }
        self
    }

    pub fn onclick(self) -> Self {
        self.attr("onclick", "handle()")
    }

    pub fn editable(mut self) -> Self {
        self.content_editable = true;
        self
    }

    pub fn option(mut self, value: &str, label: &str) -> Self {
        self.options.push((value.to_string(), label.to_string()));
        self
    }

    /// Still matched by selectors, but rejects every interaction.
    pub fn detached(mut self) -> Self {
        self.detached = true;
        self
    }

    fn accepts_text(&self) -> bool {
        matches!(self.tag.as_str(), "input" | "textarea") || self.content_editable
    }

    fn raw(&self) -> RawElement {
        RawElement {
            tag: self.tag.clone(),
            text: self.text.clone(),
            attributes: self.attributes.clone(),
            x: 0.0,
            y: 0.0,
            width: self.width,
            height: self.height,
            visible: self.visible,
            has_click_handler: self.attributes.contains_key("onclick"),
            content_editable: self.content_editable,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct StaticDocument {
    title: String,
    elements: Vec<StaticElement>,
    forms: Vec<FormDescriptor>,
}

impl StaticDocument {
    pub fn new(title: &str) -> Self {
        Self { title: title.to_string(), ..Default::default() }
    }

    pub fn element(mut self, element: StaticElement) -> Self {
        self.elements.push(element);
        self
    }

    pub fn form(mut self, mut form: FormDescriptor) -> Self {
        form.index = self.forms.len();
        self.forms.push(form);
        self
    }
}

#[derive(Default)]
struct PageState {
    documents: HashMap<String, StaticDocument>,
    current: String,
    history: Vec<String>,
    focused: Option<String>,
    failing_queries: usize,
    events: Vec<String>,
    closed: bool,
}

impl PageState {
    fn ensure_open(&self) -> Result<(), BrowserError> {
        if self.closed {
            Err(BrowserError::Closed)
        } else {
            Ok(())
        }
    }

    fn document(&self) -> Option<&StaticDocument> {
        self.documents.get(&self.current)
    }

    fn find(&mut self, selector: &str) -> Result<&mut StaticElement, BrowserError> {
        let compiled = Selector::parse(selector)?;
        let current = self.current.clone();
        self.documents
            .get_mut(&current)
            .and_then(|doc| doc.elements.iter_mut().find(|e| e.visible && compiled.matches(e)))
            .ok_or_else(|| BrowserError::ElementNotFound(selector.to_string()))
    }

    fn interactable(&mut self, selector: &str) -> Result<&mut StaticElement, BrowserError> {
        let element = self.find(selector)?;
        if element.detached {
            return Err(BrowserError::Interaction(format!(
                "element {selector} is not attached to the DOM"
            )));
        }
        Ok(element)
    }

    fn load(&mut self, url: &str) -> Result<(), BrowserError> {
        if !self.documents.contains_key(url) {
            return Err(BrowserError::Navigation(format!("net::ERR_NAME_NOT_RESOLVED at {url}")));
        }
        let previous = std::mem::replace(&mut self.current, url.to_string());
        self.history.push(previous);
        self.focused = None;
        Ok(())
    }
}

/// Scripted page for exercising the agent without a browser.
pub struct StaticPage {
    state: Mutex<PageState>,
}

impl Default for StaticPage {
    fn default() -> Self {
        Self::new()
    }
}

impl StaticPage {
    pub fn new() -> Self {
        let mut documents = HashMap::new();
        documents.insert(BLANK_URL.to_string(), StaticDocument::default());
        Self {
            state: Mutex::new(PageState {
                documents,
                current: BLANK_URL.to_string(),
                ..Default::default()
            }),
        }
    }

    pub fn with_document(mut self, url: &str, document: StaticDocument) -> Self {
        self.state.get_mut().documents.insert(url.to_string(), document);
        self
    }

    /// Start on `url` without recording a history entry.
    pub async fn open(&self, url: &str) -> Result<(), BrowserError> {
        let mut st = self.state.lock().await;
        st.load(url)?;
        st.history.clear();
        Ok(())
    }

    /// Make the next `count` element enumerations fail.
    pub async fn fail_next_queries(&self, count: usize) {
        self.state.lock().await.failing_queries = count;
    }

    /// Value typed into the first element matching `selector` on the current page.
    pub async fn value_of(&self, selector: &str) -> Option<String> {
        let mut st = self.state.lock().await;
        st.find(selector).ok().map(|e| e.value.clone())
    }

    /// Interactions performed so far, e.g. `click #login`.
    pub async fn events(&self) -> Vec<String> {
        self.state.lock().await.events.clone()
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }
}

#[async_trait]
impl PageDriver for StaticPage {
    async fn url(&self) -> Result<String, BrowserError> {
        let st = self.state.lock().await;
        st.ensure_open()?;
        Ok(st.current.clone())
    }

    async fn title(&self) -> Result<String, BrowserError> {
        let st = self.state.lock().await;
        st.ensure_open()?;
        Ok(st.document().map(|d| d.title.clone()).unwrap_or_default())
    }

    async fn goto(&self, url: &str, _timeout: Duration) -> Result<(), BrowserError> {
        let mut st = self.state.lock().await;
        st.ensure_open()?;
        st.events.push(format!("goto {url}"));
        st.load(url)
    }

    async fn wait_for_content_loaded(&self, _timeout: Duration) -> Result<(), BrowserError> {
        self.state.lock().await.ensure_open()
    }

    async fn go_back(&self) -> Result<(), BrowserError> {
        let mut st = self.state.lock().await;
        st.ensure_open()?;
        st.events.push("go_back".to_string());
        if let Some(previous) = st.history.pop() {
            st.current = previous;
            st.focused = None;
        }
        Ok(())
    }

    async fn wait_for_selector(&self, selector: &str, timeout: Duration) -> Result<(), BrowserError> {
        let found = {
            let mut st = self.state.lock().await;
            st.ensure_open()?;
            match st.find(selector) {
                Ok(_) => true,
                Err(BrowserError::ElementNotFound(_)) => false,
                Err(e) => return Err(e),
            }
        };
        if found {
            return Ok(());
        }
        // Nothing on a static page will appear later; spend the wait like a real driver.
        tokio::time::sleep(timeout).await;
        Err(BrowserError::Timeout(format!(
            "waiting for selector `{selector}` exceeded {}ms",
            timeout.as_millis()
        )))
    }

    async fn scroll_into_view(&self, selector: &str) -> Result<(), BrowserError> {
        let mut st = self.state.lock().await;
        st.ensure_open()?;
        st.interactable(selector).map(|_| ())
    }

    async fn click(&self, selector: &str) -> Result<(), BrowserError> {
        let mut st = self.state.lock().await;
        st.ensure_open()?;
        let link = st.interactable(selector)?.link.clone();
        st.events.push(format!("click {selector}"));
        match link {
            Some(url) => st.load(&url),
            None => Ok(()),
        }
    }

    async fn focus(&self, selector: &str) -> Result<(), BrowserError> {
        let mut st = self.state.lock().await;
        st.ensure_open()?;
        st.interactable(selector)?;
        st.focused = Some(selector.to_string());
        Ok(())
    }

    async fn fill(&self, selector: &str, text: &str) -> Result<(), BrowserError> {
        let mut st = self.state.lock().await;
        st.ensure_open()?;
        let element = st.interactable(selector)?;
        if !element.accepts_text() {
            return Err(BrowserError::Interaction(format!(
                "element {selector} is not an <input>, <textarea> or [contenteditable] element"
            )));
        }
        element.value = text.to_string();
        st.events.push(format!("fill {selector} {text}"));
        Ok(())
    }

    async fn select_option(&self, selector: &str, option: &SelectBy) -> Result<(), BrowserError> {
        let mut st = self.state.lock().await;
        st.ensure_open()?;
        let element = st.interactable(selector)?;
        let chosen = element
            .options
            .iter()
            .find(|(value, label)| match option {
                SelectBy::Value(v) => value == v,
                SelectBy::Label(l) => label == l,
            })
            .map(|(value, _)| value.clone())
            .ok_or_else(|| BrowserError::Interaction(format!("no option {option:?} in {selector}")))?;
        element.value = chosen.clone();
        st.events.push(format!("select {selector} {chosen}"));
        Ok(())
    }

    async fn hover(&self, selector: &str) -> Result<(), BrowserError> {
        let mut st = self.state.lock().await;
        st.ensure_open()?;
        st.interactable(selector)?;
        st.events.push(format!("hover {selector}"));
        Ok(())
    }

    async fn press_key(&self, key: &str) -> Result<(), BrowserError> {
        let mut st = self.state.lock().await;
        st.ensure_open()?;
        let event = match &st.focused {
            Some(target) => format!("press {key} on {target}"),
            None => format!("press {key}"),
        };
        st.events.push(event);
        Ok(())
    }

    async fn scroll(&self, direction: ScrollDirection) -> Result<(), BrowserError> {
        let mut st = self.state.lock().await;
        st.ensure_open()?;
        st.events.push(format!("scroll {}", direction.as_str()));
        Ok(())
    }

    async fn screenshot(&self, path: &Path) -> Result<(), BrowserError> {
        self.state.lock().await.ensure_open()?;
        // PNG signature only; enough for callers checking the artifact exists.
        tokio::fs::write(path, b"\x89PNG\r\n\x1a\n")
            .await
            .map_err(|e| BrowserError::Protocol(format!("write {}: {e}", path.display())))
    }

    async fn query_elements(&self, selector: &str) -> Result<Vec<RawElement>, BrowserError> {
        let mut st = self.state.lock().await;
        st.ensure_open()?;
        if st.failing_queries > 0 {
            st.failing_queries -= 1;
            return Err(BrowserError::Protocol("Execution context was destroyed".to_string()));
        }
        let compiled = Selector::parse(selector)?;
        Ok(st
            .document()
            .map(|doc| doc.elements.iter().filter(|e| compiled.matches(e)).map(|e| e.raw()).collect())
            .unwrap_or_default())
    }

    async fn query_forms(&self) -> Result<Vec<FormDescriptor>, BrowserError> {
        let st = self.state.lock().await;
        st.ensure_open()?;
        Ok(st.document().map(|d| d.forms.clone()).unwrap_or_default())
    }

    async fn close(&self) -> Result<(), BrowserError> {
        self.state.lock().await.closed = true;
        Ok(())
    }
}

/// A selector list of compound selectors: `tag#id.class[attr='value']`, joined
/// by commas. Combinators and pseudo-classes are not supported.
struct Selector {
    alternatives: Vec<Compound>,
}

#[derive(Default)]
struct Compound {
    tag: Option<String>,
    id: Option<String>,
    classes: Vec<String>,
    attributes: Vec<(String, Option<String>)>,
}

impl Selector {
    fn parse(input: &str) -> Result<Self, BrowserError> {
        let alternatives = split_list(input)
            .into_iter()
            .map(|part| Compound::parse(part.trim()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|reason| BrowserError::Protocol(format!("invalid selector `{input}`: {reason}")))?;
        Ok(Self { alternatives })
    }

    fn matches(&self, element: &StaticElement) -> bool {
        self.alternatives.iter().any(|c| c.matches(element))
    }
}

// Commas inside quoted attribute values do not split the list.
fn split_list(input: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut start = 0;
    for (i, c) in input.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match (quote, c) {
            (_, '\\') => escaped = true,
            (Some(q), c) if c == q => quote = None,
            (None, '\'' | '"') => quote = Some(c),
            (None, ',') => {
                parts.push(&input[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&input[start..]);
    parts
}

impl Compound {
    fn parse(input: &str) -> Result<Self, String> {
        if input.is_empty() {
            return Err("empty selector".to_string());
        }
        let chars: Vec<char> = input.chars().collect();
        let mut out = Compound::default();
        let mut i = 0;

        let ident = |i: &mut usize| -> String {
            let begin = *i;
            while *i < chars.len() && (chars[*i].is_alphanumeric() || chars[*i] == '-' || chars[*i] == '_') {
                *i += 1;
            }
            chars[begin..*i].iter().collect()
        };

        if chars[0] != '#' && chars[0] != '.' && chars[0] != '[' {
            let tag = ident(&mut i);
            if tag.is_empty() {
                return Err(format!("unexpected `{}`", chars[0]));
            }
            out.tag = Some(tag.to_ascii_lowercase());
        }

        while i < chars.len() {
            match chars[i] {
                '#' => {
                    i += 1;
                    let id = ident(&mut i);
                    if id.is_empty() {
                        return Err("empty id".to_string());
                    }
                    out.id = Some(id);
                }
                '.' => {
                    i += 1;
                    let class = ident(&mut i);
                    if class.is_empty() {
                        return Err("empty class".to_string());
                    }
                    out.classes.push(class);
                }
                '[' => {
                    i += 1;
                    let name = ident(&mut i);
                    if name.is_empty() {
                        return Err("empty attribute name".to_string());
                    }
                    let value = match chars.get(i) {
                        Some(']') => None,
                        Some('=') => {
                            i += 1;
                            Some(attribute_value(&chars, &mut i)?)
                        }
                        _ => return Err(format!("malformed attribute `{name}`")),
                    };
                    if chars.get(i) != Some(&']') {
                        return Err("unterminated attribute".to_string());
                    }
                    i += 1;
                    out.attributes.push((name.to_ascii_lowercase(), value));
                }
                c => return Err(format!("unsupported `{c}`")),
            }
        }
        Ok(out)
    }

    fn matches(&self, element: &StaticElement) -> bool {
        if let Some(tag) = &self.tag {
            if tag != &element.tag {
                return false;
            }
        }
        if let Some(id) = &self.id {
            if element.attributes.get("id") != Some(id) {
                return false;
            }
        }
        let classes: Vec<&str> = element
            .attributes
            .get("class")
            .map(|c| c.split_whitespace().collect())
            .unwrap_or_default();
        if !self.classes.iter().all(|c| classes.contains(&c.as_str())) {
            return false;
        }
        self.attributes.iter().all(|(name, expected)| {
            match (element.attributes.get(name), expected) {
                (Some(_), None) => true,
                (Some(actual), Some(expected)) => actual == expected,
                (None, _) => false,
            }
        })
    }
}

fn attribute_value(chars: &[char], i: &mut usize) -> Result<String, String> {
    let mut value = String::new();
    match chars.get(*i).copied() {
        Some(q @ ('\'' | '"')) => {
            *i += 1;
            loop {
                match chars.get(*i).copied() {
                    None => return Err("unterminated string".to_string()),
                    Some('\\') => {
                        if let Some(next) = chars.get(*i + 1) {
                            value.push(*next);
                        }
                        *i += 2;
                    }
                    Some(c) if c == q => {
                        *i += 1;
                        return Ok(value);
                    }
                    Some(c) => {
                        value.push(c);
                        *i += 1;
                    }
                }
            }
        }
        _ => {
            while let Some(c) = chars.get(*i).copied() {
                if c == ']' {
                    break;
                }
                value.push(c);
                *i += 1;
            }
            Ok(value)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::interactive_selector;

    fn library() -> StaticPage {
        StaticPage::new()
            .with_document(
                "https://lib.example/",
                StaticDocument::new("Library")
                    .element(StaticElement::new("a").class("infoClose").text("닫기"))
                    .element(StaticElement::new("input").name("q").attr("type", "search"))
                    .element(StaticElement::new("a").text("Login").link_to("https://lib.example/login"))
                    .element(StaticElement::new("script")),
            )
            .with_document("https://lib.example/login", StaticDocument::new("Login"))
    }

    #[test]
    fn selector_parsing() {
        assert!(Selector::parse("input[name='q']").is_ok());
        assert!(Selector::parse("a.infoClose, #id, [data-testid=\"x\"]").is_ok());
        assert!(Selector::parse("div > span").is_err());
        assert!(Selector::parse("input[name='q'").is_err());
        assert!(Selector::parse("").is_err());
    }

    #[tokio::test]
    async fn enumerates_interactive_candidates() {
        let page = library();
        page.open("https://lib.example/").await.unwrap();
        let raw = page.query_elements(&interactive_selector()).await.unwrap();
        assert_eq!(raw.len(), 3);
        assert_eq!(raw[1].attributes.get("name").map(String::as_str), Some("q"));
    }

    #[tokio::test]
    async fn links_navigate_and_back_returns() {
        let page = library();
        page.open("https://lib.example/").await.unwrap();
        page.click("a[href='https://lib.example/login']").await.unwrap();
        assert_eq!(page.url().await.unwrap(), "https://lib.example/login");
        page.go_back().await.unwrap();
        assert_eq!(page.url().await.unwrap(), "https://lib.example/");
    }

    #[tokio::test]
    async fn fill_and_errors() {
        let page = library();
        page.open("https://lib.example/").await.unwrap();
        page.fill("input[type=search]", "자바의 정석").await.unwrap();
        assert_eq!(page.value_of("input[name='q']").await.as_deref(), Some("자바의 정석"));
        assert!(matches!(page.fill("a.infoClose", "x").await, Err(BrowserError::Interaction(_))));
        assert!(matches!(
            page.goto("https://elsewhere.example/", Duration::from_secs(1)).await,
            Err(BrowserError::Navigation(_))
        ));
    }

    #[tokio::test]
    async fn injected_failures_and_close() {
        let page = library();
        page.fail_next_queries(1).await;
        assert!(page.query_elements("a").await.is_err());
        assert!(page.query_elements("a").await.is_ok());
        page.close().await.unwrap();
        assert_eq!(page.url().await, Err(BrowserError::Closed));
    }
}
