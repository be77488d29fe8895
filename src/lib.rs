pub mod action;
pub mod agent;
pub mod browser;
pub mod catalog;
pub mod driver;
pub mod llm;
pub mod prompt;
pub mod render;
pub mod snapshot;
pub mod static_page;

pub use action::{Action, ActionExecutor, ActionKind, ActionResult, Timings};
pub use agent::{Agent, AgentConfig, AgentError, PageSummary, RunOutcome, RunReport, StepRecord};
pub use browser::{BrowserConfig, ChromiumDriver};
pub use catalog::{ToolCatalog, ToolDefinition};
pub use driver::{BrowserError, PageDriver};
pub use llm::{callback_from_env, from_fn, LlmCallback, LlmProvider};
pub use snapshot::{ElementInfo, PageSnapshot, PageType};
