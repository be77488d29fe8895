//! Prompt construction and LLM reply parsing.

use serde_json::{Map, Value};
use thiserror::Error;

use crate::action::{ActionKind, ActionResult};
use crate::agent::{PageSummary, StepRecord};

/// Recent steps shown to the LLM.
pub const HISTORY_WINDOW: usize = 5;
/// Completed actions quoted from the previous page summary.
pub const SUMMARY_ACTIONS: usize = 3;

pub const FACILITY_INFO_URL: &str = "https://library.cnu.ac.kr/webcontent/info/326";

/// Decode bytes as UTF-8, replacing invalid sequences.
pub fn decode_lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Strip control characters other than newline and tab.
pub fn normalize_text(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect()
}

const POLICY: &str = "\
## Rules
1. Work out exactly what the goal asks for. A search request means search only; a login request means login only.
2. Never repeat an action that already succeeded in the history.
3. Never repeat the same action on the same selector.

## Behaviour by goal
### Search (e.g. \"search for 자바의 정석\")
1. Close the popup (a.infoClose) if present.
2. Type the query into the search box (input[name='q']).
3. Click the search button (input.searchBtn) or press Enter.
4. Check the results, then done. Searching does not require login.

### Login (student id and password given)
1. Close the popup (a.infoClose) if present.
2. Go to the login page if needed.
3. Type the student id (input#id, input[name='user_id'], input[name='id']).
4. Type the password (input[name='password'], input[name='user_password']).
5. Click the login button (button[type='submit'], input[type='submit'], .login-btn) or press Enter.
6. When the URL changed or a logout link is visible, done.
If Enter leaves you on the login page, click the login button directly.

### Facility information (floors, reading rooms, opening hours)
1. Navigate to the facility guide page.
2. Find the requested facility or floor on the page.
3. Answer with done.

### Loans and reservations
Log in first, then perform the request.

## Site hints
- Search box: input[name='q']
- Search button: input.searchBtn
- Login form: input#id (student id), input[name='password']
- Close popup: a.infoClose";

/// Selection prompt for one step. Deterministic in its inputs.
pub fn build_selection_prompt(
    goal: &str,
    snapshot_text: &str,
    history: &[StepRecord],
    last_summary: Option<&PageSummary>,
) -> String {
    let recent = &history[history.len().saturating_sub(HISTORY_WINDOW)..];
    let history_text = if recent.is_empty() {
        "none".to_string()
    } else {
        recent
            .iter()
            .map(|r| {
                let name = r.action.get("action").and_then(Value::as_str).unwrap_or("");
                format!("Step {}: {} -> {}", r.step, name, r.observation)
            })
            .collect::<Vec<_>>()
            .join("\n")
    };

    let mut prompt = String::new();
    prompt.push_str("You are a browser automation agent.\n\n");
    prompt.push_str(&format!("## Goal\n{goal}\n\n"));
    prompt.push_str(&format!("## Current page\n{snapshot_text}\n\n"));
    prompt.push_str(&format!("## Action history (check before acting)\n{history_text}\n\n"));
    if let Some(summary) = last_summary {
        let done: Vec<&str> = summary
            .completed_actions
            .iter()
            .take(SUMMARY_ACTIONS)
            .map(String::as_str)
            .collect();
        prompt.push_str(&format!(
            "## Previous page\n- URL: {}\n- Completed: {}\n\n",
            summary.url,
            done.join(", ")
        ));
    }
    prompt.push_str(POLICY);
    prompt.push_str(&format!("\n- Facility guide: {FACILITY_INFO_URL}\n\n"));
    prompt.push_str("## Available actions\n");
    prompt.push_str(&ActionKind::describe_all());
    prompt.push_str(
        "\n\n## Response format\nReply with exactly one JSON object and nothing else:\n\
         {\"action\": \"name\", \"selector\": \"selector if needed\", \"value\": \"value if needed\", \"reason\": \"why this action\"}\n",
    );
    prompt
}

/// Diagnostic prompt after a failed action.
pub fn build_reflection_prompt(action: &Value, result: &ActionResult) -> String {
    format!(
        "An action failed. Analyse the cause.\n\n\
         ## Attempted action\n{action}\n\n\
         ## Result\n- success: {}\n- message: {}\n- error: {}\n\n\
         ## Question\n1. Why did it fail?\n2. What should be done next?\n\n\
         Answer in one or two sentences.\n",
        result.success,
        result.message,
        result.error.as_deref().unwrap_or("none"),
    )
}

#[derive(Debug, Error, PartialEq)]
pub enum SelectionError {
    #[error("no JSON object in response")]
    NoObject,
    #[error("response contains {0} top-level JSON objects")]
    Ambiguous(usize),
    #[error("unterminated JSON object")]
    Unterminated,
    #[error("invalid JSON object: {0}")]
    Invalid(String),
}

/// Extract the single JSON object from an LLM reply. Prose before and after the
/// object is ignored; more than one top-level object is rejected.
pub fn parse_action_object(response: &str) -> Result<Map<String, Value>, SelectionError> {
    let spans = top_level_objects(response)?;
    let (start, end) = match spans.as_slice() {
        [] => return Err(SelectionError::NoObject),
        [one] => *one,
        many => return Err(SelectionError::Ambiguous(many.len())),
    };
    match serde_json::from_str::<Value>(&response[start..end]) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(SelectionError::Invalid("not an object".into())),
        Err(e) => Err(SelectionError::Invalid(e.to_string())),
    }
}

// Byte spans of brace-balanced objects. String literals are only tracked
// inside an object, so stray quotes in surrounding prose are harmless.
fn top_level_objects(text: &str) -> Result<Vec<(usize, usize)>, SelectionError> {
    let mut spans = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in text.char_indices() {
        if depth > 0 && in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '{' => {
                if depth == 0 {
                    start = i;
                }
                depth += 1;
            }
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    spans.push((start, i + 1));
                }
            }
            '"' if depth > 0 => in_string = true,
            _ => {}
        }
    }
    if depth > 0 {
        return Err(SelectionError::Unterminated);
    }
    Ok(spans)
}
