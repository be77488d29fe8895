use std::env;
use std::fmt;
use std::future::Future;
use std::str::FromStr;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::prompt::{decode_lossy, normalize_text};

/// Prompt text in, completion text out.
#[async_trait]
pub trait LlmCallback: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String>;
}

#[async_trait]
impl LlmCallback for Box<dyn LlmCallback> {
    async fn complete(&self, prompt: &str) -> Result<String> {
        (**self).complete(prompt).await
    }
}

/// Adapts an async closure into an [`LlmCallback`].
pub struct FnCallback<F>(F);

pub fn from_fn<F, Fut>(f: F) -> FnCallback<F>
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<String>> + Send,
{
    FnCallback(f)
}

#[async_trait]
impl<F, Fut> LlmCallback for FnCallback<F>
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<String>> + Send,
{
    async fn complete(&self, prompt: &str) -> Result<String> {
        (self.0)(prompt.to_string()).await
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LlmProvider {
    #[default]
    Anthropic,
    OpenAi,
    /// No remote model; heuristic replies only.
    Local,
}

impl FromStr for LlmProvider {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "anthropic" | "claude" => Ok(Self::Anthropic),
            "openai" => Ok(Self::OpenAi),
            "local" | "rule" | "none" => Ok(Self::Local),
            other => Err(anyhow!("unknown llm provider '{other}'")),
        }
    }
}

impl fmt::Display for LlmProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Anthropic => "anthropic",
            Self::OpenAi => "openai",
            Self::Local => "local",
        })
    }
}

#[derive(Clone)]
pub struct LlmConfig {
    pub anthropic_api_key: String,
    pub anthropic_base: String,
    pub anthropic_model: String,
    pub openai_api_key: String,
    pub openai_base: String, // e.g. "https://api.openai.com/v1"
    pub openai_model: String,
    pub max_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            anthropic_api_key: env::var("ANTHROPIC_API_KEY").unwrap_or_default(),
            anthropic_base: env::var("ANTHROPIC_BASE_URL").unwrap_or_else(|_| "https://api.anthropic.com".into()),
            anthropic_model: env::var("ANTHROPIC_MODEL").unwrap_or_else(|_| "claude-sonnet-4-20250514".into()),
            openai_api_key: env::var("OPENAI_API_KEY").unwrap_or_default(),
            openai_base: env::var("OPENAI_BASE_URL").unwrap_or_else(|_| "https://api.openai.com/v1".into()),
            openai_model: env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o".into()),
            max_tokens: 1024,
        }
    }
}

async fn post_json(req: reqwest::RequestBuilder, body: &Value, vendor: &str) -> Result<Value> {
    let resp = req.json(body).send().await?;
    let status = resp.status();
    let text = decode_lossy(&resp.bytes().await?);
    if !status.is_success() {
        bail!("{vendor} error {status}: {text}");
    }
    serde_json::from_str(&text).with_context(|| format!("failed to parse {vendor} response JSON"))
}

#[derive(Clone)]
pub struct AnthropicClient {
    http: Client,
    api_key: String,
    base: String,
    model: String,
    max_tokens: u32,
}

impl AnthropicClient {
    pub fn new(cfg: &LlmConfig) -> Result<Self> {
        if cfg.anthropic_api_key.is_empty() {
            bail!("ANTHROPIC_API_KEY missing");
        }
        Ok(Self {
            http: Client::new(),
            api_key: cfg.anthropic_api_key.clone(),
            base: cfg.anthropic_base.trim_end_matches('/').to_string(),
            model: cfg.anthropic_model.clone(),
            max_tokens: cfg.max_tokens,
        })
    }
}

#[async_trait]
impl LlmCallback for AnthropicClient {
    async fn complete(&self, prompt: &str) -> Result<String> {
        let body = json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "messages": [{ "role": "user", "content": normalize_text(prompt) }]
        });
        let req = self
            .http
            .post(format!("{}/v1/messages", self.base))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01");
        let v = post_json(req, &body, "Anthropic").await?;
        if let Some(usage) = v.get("usage") {
            debug!(model = %self.model, usage = %usage, "anthropic completion");
        }
        v.pointer("/content/0/text")
            .and_then(Value::as_str)
            .map(str::to_string)
            .context("missing content[0].text")
    }
}

#[derive(Clone)]
pub struct OpenAiClient {
    http: Client,
    api_key: String,
    base: String,
    model: String,
    max_tokens: u32,
}

impl OpenAiClient {
    pub fn new(cfg: &LlmConfig) -> Result<Self> {
        if cfg.openai_api_key.is_empty() {
            bail!("OPENAI_API_KEY missing");
        }
        Ok(Self {
            http: Client::new(),
            api_key: cfg.openai_api_key.clone(),
            base: cfg.openai_base.trim_end_matches('/').to_string(),
            model: cfg.openai_model.clone(),
            max_tokens: cfg.max_tokens,
        })
    }
}

#[async_trait]
impl LlmCallback for OpenAiClient {
    async fn complete(&self, prompt: &str) -> Result<String> {
        let body = json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "messages": [{ "role": "user", "content": normalize_text(prompt) }]
        });
        let req = self
            .http
            .post(format!("{}/chat/completions", self.base))
            .bearer_auth(&self.api_key);
        let v = post_json(req, &body, "OpenAI").await?;
        v.pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .map(str::to_string)
            .context("missing choices[0].message.content")
    }
}

/// Heuristic replies used when no model is configured.
#[derive(Clone, Copy, Debug, Default)]
pub struct RuleBasedLlm;

impl RuleBasedLlm {
    fn goal_of(prompt: &str) -> &str {
        prompt
            .split("## Goal\n")
            .nth(1)
            .and_then(|rest| rest.lines().next())
            .unwrap_or("")
    }

    fn page_of(prompt: &str) -> &str {
        prompt
            .split("## Current page\n")
            .nth(1)
            .and_then(|rest| rest.split("\n\n## ").next())
            .unwrap_or("")
    }
}

#[async_trait]
impl LlmCallback for RuleBasedLlm {
    async fn complete(&self, prompt: &str) -> Result<String> {
        if prompt.starts_with("An action failed.") {
            return Ok("The action failed; try a different selector or re-check the page state.".into());
        }
        let goal = Self::goal_of(prompt).to_lowercase();
        let on_login_page = Self::page_of(prompt).to_lowercase().contains("login");
        let reply = if (goal.contains("로그인") || goal.contains("login")) && on_login_page {
            r#"{"action": "type", "selector": "input#id", "value": "testuser", "reason": "enter the login id"}"#
        } else if goal.contains("검색") || goal.contains("search") {
            r#"{"action": "type", "selector": "input[type=search]", "value": "검색어", "reason": "enter the search query"}"#
        } else {
            r#"{"action": "wait", "value": "2", "reason": "wait for the page to load"}"#
        };
        Ok(reply.to_string())
    }
}

/// Pick a client for `preferred`, falling back to the other configured vendor
/// and finally to [`RuleBasedLlm`].
pub fn select_callback(preferred: LlmProvider, cfg: &LlmConfig) -> Box<dyn LlmCallback> {
    let anthropic = || AnthropicClient::new(cfg).ok().map(|c| Box::new(c) as Box<dyn LlmCallback>);
    let openai = || OpenAiClient::new(cfg).ok().map(|c| Box::new(c) as Box<dyn LlmCallback>);
    let chosen = match preferred {
        LlmProvider::Anthropic => anthropic().map(|c| (c, "anthropic")).or_else(|| openai().map(|c| (c, "openai"))),
        LlmProvider::OpenAi => openai().map(|c| (c, "openai")).or_else(|| anthropic().map(|c| (c, "anthropic"))),
        LlmProvider::Local => None,
    };
    match chosen {
        Some((client, name)) => {
            info!(provider = name, "using remote llm");
            client
        }
        None => {
            info!("no llm api key configured, using rule-based replies");
            Box::new(RuleBasedLlm)
        }
    }
}

/// [`select_callback`] with keys and endpoints read from the environment.
pub fn callback_from_env(preferred: LlmProvider) -> Box<dyn LlmCallback> {
    select_callback(preferred, &LlmConfig::default())
}
