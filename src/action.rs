use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::ser::Serializer;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::agent::AgentError;
use crate::driver::{BrowserError, PageDriver, ScrollDirection, SelectBy};

// ========================= Vocabulary =========================

/// The closed set of operations an LLM may ask for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ActionKind {
    Navigate { url: String },
    Click { selector: String },
    Type { selector: String, text: String },
    Select { selector: String, value: String },
    Scroll { direction: String },
    Wait { seconds: String },
    PressKey { key: String },
    Hover { selector: String },
    GoBack,
    Screenshot { filename: Option<String> },
    Done { summary: String },
}

impl ActionKind {
    pub const NAMES: [&'static str; 11] = [
        "navigate",
        "click",
        "type",
        "select",
        "scroll",
        "wait",
        "press_key",
        "hover",
        "go_back",
        "screenshot",
        "done",
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Navigate { .. } => "navigate",
            Self::Click { .. } => "click",
            Self::Type { .. } => "type",
            Self::Select { .. } => "select",
            Self::Scroll { .. } => "scroll",
            Self::Wait { .. } => "wait",
            Self::PressKey { .. } => "press_key",
            Self::Hover { .. } => "hover",
            Self::GoBack => "go_back",
            Self::Screenshot { .. } => "screenshot",
            Self::Done { .. } => "done",
        }
    }

    /// One line per action with an example payload, for prompts and tool listings.
    pub fn describe_all() -> String {
        [
            ("navigate", "Load a URL", r#"{"action": "navigate", "value": "https://..."}"#),
            ("click", "Click an element", r#"{"action": "click", "selector": "CSS selector"}"#),
            ("type", "Replace the text of an input", r#"{"action": "type", "selector": "CSS selector", "value": "text"}"#),
            ("select", "Choose a <select> option by value or label", r#"{"action": "select", "selector": "CSS selector", "value": "option"}"#),
            ("scroll", "Scroll the window (up, down, top, bottom)", r#"{"action": "scroll", "value": "down"}"#),
            ("wait", "Pause for a number of seconds", r#"{"action": "wait", "value": "2"}"#),
            ("press_key", "Press one key", r#"{"action": "press_key", "value": "Enter"}"#),
            ("hover", "Move the pointer over an element", r#"{"action": "hover", "selector": "CSS selector"}"#),
            ("go_back", "Go back in browser history", r#"{"action": "go_back"}"#),
            ("screenshot", "Capture the full page", r#"{"action": "screenshot", "value": "result.png"}"#),
            ("done", "Finish and report the result", r#"{"action": "done", "value": "result summary"}"#),
        ]
        .iter()
        .map(|(name, what, example)| format!("- {name}: {what} {example}"))
        .collect::<Vec<_>>()
        .join("\n")
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Action {
    pub kind: ActionKind,
    pub reason: Option<String>,
}

impl Action {
    pub fn new(kind: ActionKind) -> Self {
        Self { kind, reason: None }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn navigate(url: impl Into<String>) -> Self {
        Self::new(ActionKind::Navigate { url: url.into() })
    }

    pub fn click(selector: impl Into<String>) -> Self {
        Self::new(ActionKind::Click { selector: selector.into() })
    }

    pub fn type_text(selector: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(ActionKind::Type { selector: selector.into(), text: text.into() })
    }

    pub fn wait(seconds: impl Into<String>) -> Self {
        Self::new(ActionKind::Wait { seconds: seconds.into() })
    }

    pub fn screenshot(filename: Option<String>) -> Self {
        Self::new(ActionKind::Screenshot { filename })
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    pub fn is_done(&self) -> bool {
        matches!(self.kind, ActionKind::Done { .. })
    }

    pub fn selector(&self) -> Option<&str> {
        match &self.kind {
            ActionKind::Click { selector }
            | ActionKind::Type { selector, .. }
            | ActionKind::Select { selector, .. }
            | ActionKind::Hover { selector } => Some(selector),
            _ => None,
        }
    }

    pub fn value(&self) -> Option<&str> {
        match &self.kind {
            ActionKind::Navigate { url } => Some(url),
            ActionKind::Type { text, .. } => Some(text),
            ActionKind::Select { value, .. } => Some(value),
            ActionKind::Scroll { direction } => Some(direction),
            ActionKind::Wait { seconds } => Some(seconds),
            ActionKind::PressKey { key } => Some(key),
            ActionKind::Screenshot { filename } => filename.as_deref(),
            ActionKind::Done { summary } => Some(summary),
            ActionKind::Click { .. } | ActionKind::Hover { .. } | ActionKind::GoBack => None,
        }
    }

    /// The `{"action", "selector", "value", "reason"}` wire shape.
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("action".into(), Value::String(self.name().into()));
        if let Some(selector) = self.selector() {
            map.insert("selector".into(), Value::String(selector.into()));
        }
        if let Some(value) = self.value() {
            map.insert("value".into(), Value::String(value.into()));
        }
        if let Some(reason) = &self.reason {
            map.insert("reason".into(), Value::String(reason.clone()));
        }
        Value::Object(map)
    }
}

impl Serialize for Action {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

fn field(dict: &Value, key: &str) -> Option<String> {
    match dict.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Build an [`Action`] from an LLM-produced mapping. Never fails: an
/// unrecognised action name becomes `wait`.
pub fn parse_action_from_dict(dict: &Value) -> Action {
    let name = field(dict, "action").unwrap_or_default().trim().to_ascii_lowercase();
    let selector = field(dict, "selector").unwrap_or_default();
    let value = field(dict, "value");
    let reason = field(dict, "reason");

    let kind = match name.as_str() {
        "navigate" => ActionKind::Navigate { url: value.unwrap_or_default() },
        "click" => ActionKind::Click { selector },
        "type" => ActionKind::Type { selector, text: value.unwrap_or_default() },
        "select" => ActionKind::Select { selector, value: value.unwrap_or_default() },
        "scroll" => ActionKind::Scroll { direction: value.unwrap_or_else(|| "down".into()) },
        "wait" => ActionKind::Wait { seconds: value.unwrap_or_else(|| "1".into()) },
        "press_key" => ActionKind::PressKey { key: value.unwrap_or_default() },
        "hover" => ActionKind::Hover { selector },
        "go_back" => ActionKind::GoBack,
        "screenshot" => ActionKind::Screenshot { filename: value.filter(|v| !v.trim().is_empty()) },
        "done" => ActionKind::Done { summary: value.unwrap_or_default() },
        other => {
            warn!(error = %AgentError::UnsupportedAction(other.to_string()), "falling back to wait");
            ActionKind::Wait { seconds: value.unwrap_or_else(|| "1".into()) }
        }
    };
    Action { kind, reason }
}

// ========================= Results & Errors =========================

#[derive(Debug, Error)]
pub enum ActionError {
    #[error("element not found: {selector}")]
    ElementNotFound { selector: String },
    #[error("interaction failed on {selector}: {reason}")]
    Interaction { selector: String, reason: String },
    #[error("navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error(transparent)]
    Browser(#[from] BrowserError),
}

#[derive(Clone, Debug, Serialize)]
pub struct ActionResult {
    pub success: bool,
    pub message: String,
    pub action: Action,
    pub before_url: String,
    pub after_url: String,
    pub error: Option<String>,
    pub screenshot_path: Option<PathBuf>,
}

/// Delays and bounded waits used while acting on a page.
#[derive(Clone, Debug)]
pub struct Timings {
    pub element_timeout: Duration,
    pub load_timeout: Duration,
    pub navigate_settle: Duration,
    pub pre_click: Duration,
    pub post_click: Duration,
    pub input_settle: Duration,
    pub go_back_settle: Duration,
    pub start_settle: Duration,
    pub transition_settle: Duration,
    pub step_settle: Duration,
    /// Multiplied by the attempt number between snapshot retries.
    pub retry_backoff: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            element_timeout: Duration::from_secs(10),
            load_timeout: Duration::from_secs(10),
            navigate_settle: Duration::from_secs(1),
            pre_click: Duration::from_millis(300),
            post_click: Duration::from_secs(1),
            input_settle: Duration::from_millis(500),
            go_back_settle: Duration::from_secs(1),
            start_settle: Duration::from_secs(2),
            transition_settle: Duration::from_secs(2),
            step_settle: Duration::from_secs(1),
            retry_backoff: Duration::from_secs(1),
        }
    }
}

impl Timings {
    pub fn immediate() -> Self {
        Self {
            element_timeout: Duration::ZERO,
            load_timeout: Duration::ZERO,
            navigate_settle: Duration::ZERO,
            pre_click: Duration::ZERO,
            post_click: Duration::ZERO,
            input_settle: Duration::ZERO,
            go_back_settle: Duration::ZERO,
            start_settle: Duration::ZERO,
            transition_settle: Duration::ZERO,
            step_settle: Duration::ZERO,
            retry_backoff: Duration::ZERO,
        }
    }
}

async fn settle(d: Duration) {
    if !d.is_zero() {
        tokio::time::sleep(d).await;
    }
}

/// Screenshot names must stay inside the screenshot directory.
fn plain_file_name(name: &str) -> Result<String, ActionError> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(file)), None) => Ok(file.to_string_lossy().into_owned()),
        _ => Err(ActionError::InvalidArgument(format!("screenshot filename '{name}' must be a plain file name"))),
    }
}

// ========================= Executor =========================

struct Applied {
    message: String,
    screenshot_path: Option<PathBuf>,
}

impl Applied {
    fn msg(message: impl Into<String>) -> Self {
        Self { message: message.into(), screenshot_path: None }
    }
}

pub struct ActionExecutor<D> {
    page: Arc<D>,
    timings: Timings,
    navigation_timeout: Duration,
    screenshot_dir: PathBuf,
    history: Vec<ActionResult>,
}

impl<D: PageDriver> ActionExecutor<D> {
    pub fn new(page: Arc<D>, timings: Timings, navigation_timeout: Duration) -> Self {
        Self {
            page,
            timings,
            navigation_timeout,
            screenshot_dir: PathBuf::from("."),
            history: Vec::new(),
        }
    }

    pub fn with_screenshot_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.screenshot_dir = dir.into();
        self
    }

    /// Every result produced so far, oldest first.
    pub fn history(&self) -> &[ActionResult] {
        &self.history
    }

    /// Apply one action. Failures are reported in the result, never returned.
    pub async fn execute(&mut self, action: Action) -> ActionResult {
        let before_url = self.current_url().await;
        let outcome = self.apply(&action).await;
        let after_url = self.current_url().await;

        let result = match outcome {
            Ok(applied) => ActionResult {
                success: true,
                message: applied.message,
                action,
                before_url,
                after_url,
                error: None,
                screenshot_path: applied.screenshot_path,
            },
            Err(err) => {
                warn!(action = action.name(), error = %err, "action failed");
                ActionResult {
                    success: false,
                    message: format!("{} failed: {err}", action.name()),
                    action,
                    before_url,
                    after_url,
                    error: Some(err.to_string()),
                    screenshot_path: None,
                }
            }
        };
        debug!(action = result.action.name(), success = result.success, after = %result.after_url, "action executed");
        self.history.push(result.clone());
        result
    }

    async fn current_url(&self) -> String {
        match self.page.url().await {
            Ok(url) => url,
            Err(e) => {
                warn!(error = %e, "could not read page url");
                String::new()
            }
        }
    }

    async fn apply(&self, action: &Action) -> Result<Applied, ActionError> {
        match &action.kind {
            ActionKind::Navigate { url } => self.navigate(url).await,
            ActionKind::Click { selector } => self.click(selector).await,
            ActionKind::Type { selector, text } => self.type_text(selector, text).await,
            ActionKind::Select { selector, value } => self.select(selector, value).await,
            ActionKind::Scroll { direction } => {
                let dir = ScrollDirection::parse(direction).ok_or_else(|| {
                    ActionError::InvalidArgument(format!("unknown scroll direction '{direction}'"))
                })?;
                self.page.scroll(dir).await?;
                settle(self.timings.input_settle).await;
                Ok(Applied::msg(format!("Scrolled {}", dir.as_str())))
            }
            ActionKind::Wait { seconds } => {
                let secs: f64 = seconds
                    .trim()
                    .parse()
                    .map_err(|_| ActionError::InvalidArgument(format!("invalid wait duration '{seconds}'")))?;
                let requested = Duration::try_from_secs_f64(secs)
                    .map_err(|e| ActionError::InvalidArgument(format!("invalid wait duration '{seconds}': {e}")))?;
                // Never outlast a page load.
                let waited = requested.min(self.navigation_timeout);
                tokio::time::sleep(waited).await;
                Ok(Applied::msg(format!("Waited {} seconds", waited.as_secs_f64())))
            }
            ActionKind::PressKey { key } => {
                if key.trim().is_empty() {
                    return Err(ActionError::InvalidArgument("press_key requires a key".into()));
                }
                self.page.press_key(key).await?;
                settle(self.timings.input_settle).await;
                Ok(Applied::msg(format!("Pressed {key}")))
            }
            ActionKind::Hover { selector } => {
                self.resolve(selector).await?;
                self.page.hover(selector).await.map_err(|e| interaction(selector, e))?;
                settle(self.timings.input_settle).await;
                Ok(Applied::msg(format!("Hovered {selector}")))
            }
            ActionKind::GoBack => {
                self.page.go_back().await?;
                settle(self.timings.go_back_settle).await;
                Ok(Applied::msg("Went back"))
            }
            ActionKind::Screenshot { filename } => {
                let name = match filename {
                    Some(name) => plain_file_name(name)?,
                    None => format!("screenshot_{}.png", self.history.len()),
                };
                let path = self.screenshot_dir.join(name);
                self.page.screenshot(&path).await?;
                Ok(Applied {
                    message: format!("Screenshot saved to {}", path.display()),
                    screenshot_path: Some(path),
                })
            }
            ActionKind::Done { summary } => {
                info!(summary = %summary, "done");
                Ok(Applied::msg(format!("Done: {summary}")))
            }
        }
    }

    async fn navigate(&self, url: &str) -> Result<Applied, ActionError> {
        if url.trim().is_empty() {
            return Err(ActionError::InvalidArgument("navigate requires a url".into()));
        }
        self.page
            .goto(url, self.navigation_timeout)
            .await
            .map_err(|e| ActionError::Navigation { url: url.to_string(), reason: e.to_string() })?;
        settle(self.timings.navigate_settle).await;
        Ok(Applied::msg(format!("Navigated to {url}")))
    }

    async fn click(&self, selector: &str) -> Result<Applied, ActionError> {
        self.resolve(selector).await?;
        self.page.scroll_into_view(selector).await.map_err(|e| interaction(selector, e))?;
        settle(self.timings.pre_click).await;
        self.page.click(selector).await.map_err(|e| interaction(selector, e))?;
        settle(self.timings.post_click).await;
        Ok(Applied::msg(format!("Clicked {selector}")))
    }

    async fn type_text(&self, selector: &str, text: &str) -> Result<Applied, ActionError> {
        self.resolve(selector).await?;
        self.page.focus(selector).await.map_err(|e| interaction(selector, e))?;
        self.page.fill(selector, "").await.map_err(|e| interaction(selector, e))?;
        self.page.fill(selector, text).await.map_err(|e| interaction(selector, e))?;
        settle(self.timings.input_settle).await;
        Ok(Applied::msg(format!("Typed '{text}' into {selector}")))
    }

    async fn select(&self, selector: &str, value: &str) -> Result<Applied, ActionError> {
        self.resolve(selector).await?;
        let by_value = self.page.select_option(selector, &SelectBy::Value(value.to_string())).await;
        if let Err(first) = by_value {
            debug!(selector, error = %first, "select by value failed, trying label");
            self.page
                .select_option(selector, &SelectBy::Label(value.to_string()))
                .await
                .map_err(|e| interaction(selector, e))?;
        }
        settle(self.timings.input_settle).await;
        Ok(Applied::msg(format!("Selected '{value}' in {selector}")))
    }

    /// Bounded wait for `selector`. Absence and timeouts both mean not found.
    async fn resolve(&self, selector: &str) -> Result<(), ActionError> {
        if selector.trim().is_empty() {
            return Err(ActionError::InvalidArgument("a selector is required".into()));
        }
        match self.page.wait_for_selector(selector, self.timings.element_timeout).await {
            Ok(()) => Ok(()),
            Err(BrowserError::ElementNotFound(_) | BrowserError::Timeout(_)) => {
                Err(ActionError::ElementNotFound { selector: selector.to_string() })
            }
            Err(e) => Err(ActionError::Browser(e)),
        }
    }
}

fn interaction(selector: &str, err: BrowserError) -> ActionError {
    match err {
        BrowserError::Closed => ActionError::Browser(BrowserError::Closed),
        BrowserError::ElementNotFound(_) => ActionError::ElementNotFound { selector: selector.to_string() },
        other => ActionError::Interaction { selector: selector.to_string(), reason: other.to_string() },
    }
}
