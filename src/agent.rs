use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::action::{parse_action_from_dict, Action, ActionExecutor, ActionResult, Timings};
use crate::browser::{BrowserConfig, ChromiumDriver};
use crate::driver::{BrowserError, PageDriver};
use crate::llm::{LlmCallback, LlmProvider};
use crate::prompt::{build_reflection_prompt, build_selection_prompt, normalize_text, parse_action_object};
use crate::render::{snapshot_to_text, SnapshotExport};
use crate::snapshot::{PageSnapshot, PageType, SnapshotExtractor};

/// Completed actions kept in a page summary.
pub const SUMMARY_WINDOW: usize = 5;

// ========================= Core Types =========================

#[derive(Debug, Error, Clone, PartialEq, Serialize, Deserialize)]
pub enum AgentError {
    #[error("snapshot extraction failed: {0}")]
    SnapshotExtraction(String),
    #[error("could not parse an action from the llm response: {0}")]
    SelectionParse(String),
    #[error("unsupported action: {0}")]
    UnsupportedAction(String),
    #[error("llm error: {0}")]
    Llm(String),
    #[error(transparent)]
    Browser(#[from] BrowserError),
    #[error("invalid configuration: {0}")]
    Config(String),
}

#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub max_steps: usize,
    /// Snapshot attempts per step.
    pub max_retries: usize,
    pub navigation_timeout: Duration,
    pub headless: bool,
    pub viewport: (u32, u32),
    pub locale: String,
    pub llm_provider: LlmProvider,
    pub timings: Timings,
    pub snapshot_max_elements: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_steps: 30,
            max_retries: 3,
            navigation_timeout: Duration::from_secs(60),
            headless: false,
            viewport: (1280, 900),
            locale: "ko-KR".into(),
            llm_provider: LlmProvider::Anthropic,
            timings: Timings::default(),
            snapshot_max_elements: crate::render::DEFAULT_MAX_ELEMENTS,
        }
    }
}

impl AgentConfig {
    /// Defaults overlaid with `BUA_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();
        if let Some(v) = parsed(&lookup, "BUA_MAX_STEPS") {
            cfg.max_steps = v;
        }
        if let Some(v) = parsed(&lookup, "BUA_MAX_RETRIES") {
            cfg.max_retries = v;
        }
        if let Some(ms) = parsed::<u64>(&lookup, "BUA_TIMEOUT_MS") {
            cfg.navigation_timeout = Duration::from_millis(ms);
        }
        if let Some(raw) = lookup("BUA_HEADLESS") {
            match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => cfg.headless = true,
                "0" | "false" | "no" | "off" => cfg.headless = false,
                _ => warn!(key = "BUA_HEADLESS", value = %raw, "ignoring invalid setting"),
            }
        }
        if let Some(locale) = lookup("BUA_LOCALE").filter(|l| !l.trim().is_empty()) {
            cfg.locale = locale.trim().to_string();
        }
        if let Some(provider) = parsed(&lookup, "BUA_LLM_PROVIDER") {
            cfg.llm_provider = provider;
        }
        if let Some(raw) = lookup("BUA_VIEWPORT") {
            match parse_viewport(&raw) {
                Some(viewport) => cfg.viewport = viewport,
                None => warn!(key = "BUA_VIEWPORT", value = %raw, "ignoring invalid setting"),
            }
        }
        cfg
    }

    pub fn validate(&self) -> Result<(), AgentError> {
        if self.max_steps == 0 {
            return Err(AgentError::Config("max_steps must be at least 1".into()));
        }
        if self.max_retries == 0 {
            return Err(AgentError::Config("max_retries must be at least 1".into()));
        }
        if self.viewport.0 == 0 || self.viewport.1 == 0 {
            return Err(AgentError::Config("viewport must be non-empty".into()));
        }
        Ok(())
    }

    pub fn browser_config(&self) -> BrowserConfig {
        BrowserConfig {
            headless: self.headless,
            user_agent: None,
            viewport: self.viewport,
            locale: self.locale.clone(),
        }
    }
}

fn parsed<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T>
where
    T: FromStr,
    T::Err: Display,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(key, value = %raw, error = %e, "ignoring invalid setting");
            None
        }
    }
}

fn parse_viewport(raw: &str) -> Option<(u32, u32)> {
    let (w, h) = raw.trim().split_once(['x', 'X'])?;
    let w: u32 = w.trim().parse().ok()?;
    let h: u32 = h.trim().parse().ok()?;
    (w > 0 && h > 0).then_some((w, h))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Idle,
    Running,
    Stepping { step: usize },
    Done,
    Aborted,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: usize,
    pub thought: String,
    /// The executed action in its `{"action", "selector", "value", "reason"}` shape.
    pub action: Value,
    pub observation: String,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PageSummary {
    pub url: String,
    pub page_type: PageType,
    pub completed_actions: Vec<String>,
    pub learned_rules: Vec<String>,
    pub next_expected: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunOutcome {
    Done,
    BudgetExhausted,
    Aborted { reason: String },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub success: bool,
    pub goal: String,
    pub steps: usize,
    pub history: Vec<StepRecord>,
    pub page_summaries: Vec<PageSummary>,
    pub final_url: String,
    pub outcome: RunOutcome,
    /// Summary given with `done`.
    pub result: Option<String>,
}

/// Digest of the actions taken before leaving `url`: the last few successful
/// actions that were not waits, as `action: selector-or-value`.
pub fn post_summary(url: &str, history: &[StepRecord]) -> PageSummary {
    let completed: Vec<String> = history
        .iter()
        .filter(|r| r.success && r.action.get("action").and_then(Value::as_str) != Some("wait"))
        .map(|r| {
            let name = r.action.get("action").and_then(Value::as_str).unwrap_or_default();
            let target = r
                .action
                .get("selector")
                .or_else(|| r.action.get("value"))
                .and_then(Value::as_str)
                .unwrap_or_default();
            format!("{name}: {target}")
        })
        .collect();
    let recent = completed[completed.len().saturating_sub(SUMMARY_WINDOW)..].to_vec();
    PageSummary {
        url: url.to_string(),
        page_type: PageType::Unknown,
        completed_actions: recent,
        learned_rules: Vec::new(),
        next_expected: String::new(),
    }
}

async fn settle(d: Duration) {
    if !d.is_zero() {
        tokio::time::sleep(d).await;
    }
}

// ========================= Agent Core =========================

pub struct Agent<D, L>
where
    D: PageDriver,
    L: LlmCallback,
{
    page: Arc<D>,
    llm: L,
    cfg: AgentConfig,
    executor: ActionExecutor<D>,
    extractor: SnapshotExtractor<D>,
    state: AgentState,
}

impl<L: LlmCallback> Agent<ChromiumDriver, L> {
    /// Start a browser from `cfg` and wrap it.
    pub async fn launch(cfg: AgentConfig, llm: L) -> Result<Self, AgentError> {
        cfg.validate()?;
        let driver = ChromiumDriver::launch(cfg.browser_config()).await?;
        Self::new(Arc::new(driver), llm, cfg)
    }
}

impl<D, L> Agent<D, L>
where
    D: PageDriver,
    L: LlmCallback,
{
    pub fn new(page: Arc<D>, llm: L, cfg: AgentConfig) -> Result<Self, AgentError> {
        cfg.validate()?;
        let executor = ActionExecutor::new(page.clone(), cfg.timings.clone(), cfg.navigation_timeout);
        let extractor = SnapshotExtractor::new(page.clone());
        Ok(Self { page, llm, cfg, executor, extractor, state: AgentState::Idle })
    }

    pub fn with_screenshot_dir(mut self, dir: impl Into<std::path::PathBuf>) -> Self {
        self.executor = self.executor.with_screenshot_dir(dir);
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.cfg
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    pub fn page(&self) -> &Arc<D> {
        &self.page
    }

    pub async fn current_url(&self) -> String {
        self.page.url().await.unwrap_or_default()
    }

    /// Apply one action outside a run.
    pub async fn execute(&mut self, action: Action) -> ActionResult {
        self.executor.execute(action).await
    }

    /// Observe the current page, retrying like a run step would.
    pub async fn snapshot(&self) -> Result<PageSnapshot, AgentError> {
        self.observe().await
    }

    pub async fn export_snapshot(&self, max_elements: usize) -> Result<SnapshotExport, AgentError> {
        let snapshot = self.observe().await?;
        Ok(SnapshotExport::new(&snapshot, max_elements))
    }

    pub async fn close(&mut self) -> Result<(), AgentError> {
        self.page.close().await?;
        self.state = AgentState::Idle;
        Ok(())
    }

    /// Drive the page toward `goal` until `done`, the step budget runs out, or
    /// the loop cannot continue. Always returns the full trace.
    pub async fn run(&mut self, goal: &str, start_url: Option<&str>) -> RunReport {
        let run_id = nanoid!();
        let goal = normalize_text(goal);
        let mut history: Vec<StepRecord> = Vec::new();
        let mut page_summaries: Vec<PageSummary> = Vec::new();
        self.state = AgentState::Running;
        info!(%run_id, goal = %goal, start_url = ?start_url, "run started");

        if let Some(url) = start_url {
            let result = self.executor.execute(Action::navigate(url)).await;
            if !result.success {
                warn!(%run_id, url, error = ?result.error, "start navigation failed");
            }
            settle(self.cfg.timings.start_settle).await;
        }

        let mut step = 0;
        let mut last_url = String::new();
        let mut outcome: Option<RunOutcome> = None;
        let mut final_result: Option<String> = None;

        while step < self.cfg.max_steps {
            step += 1;
            self.state = AgentState::Stepping { step };
            info!(%run_id, step, "step started");

            let current_url = self.current_url().await;
            if !last_url.is_empty() && current_url != last_url {
                let summary = post_summary(&last_url, &history);
                info!(%run_id, step, from = %last_url, to = %current_url, completed = summary.completed_actions.len(), "page transition");
                page_summaries.push(summary);
                settle(self.cfg.timings.transition_settle).await;
            }

            let snapshot = match self.observe().await {
                Ok(s) => s,
                Err(e) => {
                    warn!(%run_id, step, error = %e, "aborting run");
                    outcome = Some(RunOutcome::Aborted { reason: e.to_string() });
                    break;
                }
            };
            debug!(%run_id, step, page_type = %snapshot.page_type, elements = snapshot.elements.len(), "snapshot");
            let snapshot_text = snapshot_to_text(&snapshot, self.cfg.snapshot_max_elements);

            let selected = match self
                .select_action(&goal, &snapshot_text, &history, page_summaries.last())
                .await
            {
                Ok(map) => map,
                Err(e) => {
                    warn!(%run_id, step, error = %e, "aborting run");
                    outcome = Some(RunOutcome::Aborted { reason: e.to_string() });
                    break;
                }
            };
            let thought = selected
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let action = parse_action_from_dict(&Value::Object(selected));
            info!(%run_id, step, action = action.name(), arg = ?action.selector().or(action.value()), thought = %thought, "action selected");

            let result = self.executor.execute(action.clone()).await;
            info!(%run_id, step, success = result.success, observation = %result.message, "observation");
            history.push(StepRecord {
                step,
                thought,
                action: action.to_value(),
                observation: result.message.clone(),
                success: result.success,
                timestamp: Utc::now(),
            });

            if action.is_done() {
                final_result = action.value().map(str::to_string);
                outcome = Some(RunOutcome::Done);
                break;
            }

            if !result.success {
                self.reflect(&action.to_value(), &result).await;
            }

            last_url = current_url;
            settle(self.cfg.timings.step_settle).await;
        }

        let outcome = outcome.unwrap_or(RunOutcome::BudgetExhausted);
        let success = outcome == RunOutcome::Done;
        self.state = if matches!(outcome, RunOutcome::Aborted { .. }) {
            AgentState::Aborted
        } else {
            AgentState::Done
        };
        let final_url = self.current_url().await;
        info!(%run_id, steps = step, success, outcome = ?outcome, "run finished");

        RunReport {
            run_id,
            success,
            goal,
            steps: step,
            history,
            page_summaries,
            final_url,
            outcome,
            result: final_result,
        }
    }

    async fn observe(&self) -> Result<PageSnapshot, AgentError> {
        let attempts = self.cfg.max_retries;
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            let observed = async {
                self.page.wait_for_content_loaded(self.cfg.timings.load_timeout).await?;
                self.extractor.extract().await
            }
            .await;
            match observed {
                Ok(snapshot) => return Ok(snapshot),
                Err(e) => {
                    warn!(attempt, attempts, error = %e, "snapshot attempt failed");
                    last_error = e.to_string();
                    settle(self.cfg.timings.retry_backoff * attempt as u32).await;
                }
            }
        }
        Err(AgentError::SnapshotExtraction(format!("{attempts} attempts failed, last: {last_error}")))
    }

    async fn select_action(
        &self,
        goal: &str,
        snapshot_text: &str,
        history: &[StepRecord],
        last_summary: Option<&PageSummary>,
    ) -> Result<Map<String, Value>, AgentError> {
        let prompt = build_selection_prompt(goal, snapshot_text, history, last_summary);
        let response = self
            .llm
            .complete(&prompt)
            .await
            .map_err(|e| AgentError::Llm(format!("{e:#}")))?;
        parse_action_object(&normalize_text(&response)).map_err(|e| {
            debug!(response = %response.chars().take(200).collect::<String>(), "unparseable selection");
            AgentError::SelectionParse(e.to_string())
        })
    }

    // Diagnostic only; the outcome never changes the loop.
    async fn reflect(&self, action: &Value, result: &ActionResult) {
        let prompt = build_reflection_prompt(action, result);
        match self.llm.complete(&prompt).await {
            Ok(analysis) => info!(analysis = %analysis.trim(), "reflection"),
            Err(e) => warn!(error = %e, "reflection failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use serde_json::json;

    use super::*;

    fn record(step: usize, action: Value, success: bool) -> StepRecord {
        StepRecord {
            step,
            thought: String::new(),
            action,
            observation: String::new(),
            success,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn post_summary_keeps_recent_successful_non_waits() {
        let mut history = vec![
            record(1, json!({"action": "click", "selector": "a.infoClose"}), true),
            record(2, json!({"action": "wait", "value": "1"}), true),
            record(3, json!({"action": "type", "selector": "#missing", "value": "x"}), false),
            record(4, json!({"action": "press_key", "value": "Enter"}), true),
        ];
        let summary = post_summary("https://lib.example/", &history);
        assert_eq!(summary.completed_actions, vec!["click: a.infoClose", "press_key: Enter"]);
        assert_eq!(summary.page_type, PageType::Unknown);
        assert!(summary.learned_rules.is_empty());

        for i in 5..12 {
            history.push(record(i, json!({"action": "scroll", "value": format!("down{i}")}), true));
        }
        let summary = post_summary("https://lib.example/", &history);
        assert_eq!(summary.completed_actions.len(), SUMMARY_WINDOW);
        assert_eq!(summary.completed_actions[0], "scroll: down7");
    }

    #[test]
    fn config_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("BUA_MAX_STEPS", "5"),
            ("BUA_MAX_RETRIES", "many"),
            ("BUA_TIMEOUT_MS", "1500"),
            ("BUA_HEADLESS", "true"),
            ("BUA_VIEWPORT", "1024x768"),
            ("BUA_LLM_PROVIDER", "openai"),
        ]
        .into_iter()
        .collect();
        let cfg = AgentConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.max_steps, 5);
        assert_eq!(cfg.max_retries, 3);
        assert_eq!(cfg.navigation_timeout, Duration::from_millis(1500));
        assert!(cfg.headless);
        assert_eq!(cfg.viewport, (1024, 768));
        assert_eq!(cfg.llm_provider, LlmProvider::OpenAi);
        assert_eq!(cfg.locale, "ko-KR");
    }

    #[test]
    fn viewport_parsing() {
        assert_eq!(parse_viewport(" 800 X 600 "), Some((800, 600)));
        assert_eq!(parse_viewport("0x600"), None);
        assert_eq!(parse_viewport("wide"), None);
    }

    #[test]
    fn validation_rejects_empty_budgets() {
        let cfg = AgentConfig { max_steps: 0, ..AgentConfig::default() };
        assert!(matches!(cfg.validate(), Err(AgentError::Config(_))));
        assert!(AgentConfig::default().validate().is_ok());
    }

    #[test]
    fn outcome_serializes_with_kind_tag() {
        assert_eq!(serde_json::to_value(RunOutcome::BudgetExhausted).unwrap(), json!({"kind": "budget_exhausted"}));
        assert_eq!(
            serde_json::to_value(RunOutcome::Aborted { reason: "x".into() }).unwrap(),
            json!({"kind": "aborted", "reason": "x"})
        );
    }
}
