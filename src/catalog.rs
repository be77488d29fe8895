//! Named tools exposed to a host process. Every call returns a JSON object with
//! `success` and either `message` or `error`.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::action::Action;
use crate::agent::{Agent, AgentError};
use crate::driver::PageDriver;
use crate::llm::LlmCallback;

pub const SNAPSHOT_MAX_ELEMENTS: usize = 30;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

pub fn tool_definitions() -> Vec<ToolDefinition> {
    let tool = |name: &str, description: &str, input_schema: Value| ToolDefinition {
        name: name.to_string(),
        description: description.to_string(),
        input_schema,
    };
    vec![
        tool(
            "browser_agent_run",
            "Run the browse-and-act agent until it reaches the goal or its step budget.",
            json!({
                "type": "object",
                "properties": {
                    "goal": { "type": "string", "description": "What to accomplish, in natural language" },
                    "start_url": { "type": "string", "description": "Page to open first" }
                },
                "required": ["goal"]
            }),
        ),
        tool(
            "browser_navigate",
            "Open a URL in the agent's browser.",
            json!({
                "type": "object",
                "properties": { "url": { "type": "string" } },
                "required": ["url"]
            }),
        ),
        tool(
            "browser_snapshot",
            "Describe the interactive elements of the current page.",
            json!({ "type": "object", "properties": {} }),
        ),
        tool(
            "browser_click",
            "Click the element matching a CSS selector.",
            json!({
                "type": "object",
                "properties": { "selector": { "type": "string" } },
                "required": ["selector"]
            }),
        ),
        tool(
            "browser_type",
            "Replace the text of the input matching a CSS selector.",
            json!({
                "type": "object",
                "properties": {
                    "selector": { "type": "string" },
                    "text": { "type": "string" }
                },
                "required": ["selector", "text"]
            }),
        ),
        tool(
            "browser_screenshot",
            "Capture the full page to a PNG file.",
            json!({
                "type": "object",
                "properties": {
                    "filename": { "type": "string" },
                    "inline": { "type": "boolean", "description": "Also return the PNG as base64" }
                }
            }),
        ),
    ]
}

fn failure(error: impl std::fmt::Display) -> Value {
    json!({ "success": false, "error": error.to_string() })
}

fn required<'a>(args: &'a Value, key: &str) -> Result<&'a str, Value> {
    args.get(key)
        .and_then(Value::as_str)
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| failure(format!("missing required argument '{key}'")))
}

/// Owns one agent; calls are serialised through its lock.
pub struct ToolCatalog<D, L>
where
    D: PageDriver,
    L: LlmCallback,
{
    agent: Mutex<Agent<D, L>>,
}

impl<D, L> ToolCatalog<D, L>
where
    D: PageDriver,
    L: LlmCallback,
{
    pub fn new(agent: Agent<D, L>) -> Self {
        Self { agent: Mutex::new(agent) }
    }

    pub fn list(&self) -> Vec<ToolDefinition> {
        tool_definitions()
    }

    pub async fn call(&self, name: &str, args: &Value) -> Value {
        info!(tool = name, "tool call");
        let result = match name {
            "browser_agent_run" => self.agent_run(args).await,
            "browser_navigate" => self.navigate(args).await,
            "browser_snapshot" => self.snapshot().await,
            "browser_click" => self.click(args).await,
            "browser_type" => self.type_text(args).await,
            "browser_screenshot" => self.screenshot(args).await,
            other => Err(failure(format!("unknown tool: {other}"))),
        };
        result.unwrap_or_else(|err| {
            warn!(tool = name, error = %err["error"], "tool call failed");
            err
        })
    }

    pub async fn close(&self) -> Result<(), AgentError> {
        self.agent.lock().await.close().await
    }

    async fn agent_run(&self, args: &Value) -> Result<Value, Value> {
        let goal = required(args, "goal")?;
        let start_url = args.get("start_url").and_then(Value::as_str).filter(|u| !u.trim().is_empty());
        let report = self.agent.lock().await.run(goal, start_url).await;
        let message = match &report.result {
            Some(summary) => format!("finished in {} steps: {summary}", report.steps),
            None => format!("stopped after {} steps without completing the goal", report.steps),
        };
        let mut value = serde_json::to_value(&report).map_err(failure)?;
        value["message"] = Value::String(message);
        Ok(value)
    }

    async fn navigate(&self, args: &Value) -> Result<Value, Value> {
        let url = required(args, "url")?;
        let result = self.agent.lock().await.execute(Action::navigate(url)).await;
        let mut out = json!({ "success": result.success, "message": result.message, "url": result.after_url });
        if let Some(error) = result.error {
            out["error"] = Value::String(error);
        }
        Ok(out)
    }

    async fn snapshot(&self) -> Result<Value, Value> {
        let export = self
            .agent
            .lock()
            .await
            .export_snapshot(SNAPSHOT_MAX_ELEMENTS)
            .await
            .map_err(failure)?;
        let mut out = serde_json::to_value(&export).map_err(failure)?;
        out["success"] = Value::Bool(true);
        out["message"] = Value::String(format!("{} interactive elements", export.elements_count));
        Ok(out)
    }

    async fn click(&self, args: &Value) -> Result<Value, Value> {
        let selector = required(args, "selector")?;
        let result = self.agent.lock().await.execute(Action::click(selector)).await;
        Ok(outcome(result.success, result.message, result.error))
    }

    async fn type_text(&self, args: &Value) -> Result<Value, Value> {
        let selector = required(args, "selector")?;
        let text = args.get("text").and_then(Value::as_str).unwrap_or_default();
        let result = self.agent.lock().await.execute(Action::type_text(selector, text)).await;
        Ok(outcome(result.success, result.message, result.error))
    }

    async fn screenshot(&self, args: &Value) -> Result<Value, Value> {
        let filename = args
            .get("filename")
            .and_then(Value::as_str)
            .filter(|f| !f.trim().is_empty())
            .map(str::to_string);
        let inline = args.get("inline").and_then(Value::as_bool).unwrap_or(false);
        let result = self.agent.lock().await.execute(Action::screenshot(filename)).await;
        let mut out = outcome(result.success, result.message, result.error);
        if let Some(path) = result.screenshot_path {
            out["path"] = Value::String(path.display().to_string());
            if inline {
                let png = tokio::fs::read(&path).await.map_err(failure)?;
                out["data"] = Value::String(B64.encode(png));
            }
        }
        Ok(out)
    }
}

fn outcome(success: bool, message: String, error: Option<String>) -> Value {
    let mut out = json!({ "success": success, "message": message });
    if let Some(error) = error {
        out["error"] = Value::String(error);
    }
    out
}
