use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use bua::action::Timings;
use bua::agent::{Agent, AgentConfig, AgentState, RunOutcome};
use bua::llm::{from_fn, LlmCallback};
use bua::static_page::{StaticDocument, StaticElement, StaticPage};
use bua::{Action, PageDriver};

const HOME: &str = "https://lib.example/";
const LOGIN: &str = "https://lib.example/login";

fn library() -> StaticPage {
    StaticPage::new()
        .with_document(
            HOME,
            StaticDocument::new("Library")
                .element(StaticElement::new("a").id("login").text("Login").link_to(LOGIN))
                .element(StaticElement::new("input").attr("type", "search").name("q")),
        )
        .with_document(
            LOGIN,
            StaticDocument::new("Sign in")
                .element(StaticElement::new("input").id("id").attr("type", "text"))
                .element(StaticElement::new("input").id("password").attr("type", "password")),
        )
}

fn config(max_steps: usize) -> AgentConfig {
    AgentConfig { max_steps, timings: Timings::immediate(), ..AgentConfig::default() }
}

/// Replies with `replies` in order for selection prompts, a fixed analysis for
/// reflection prompts, and records every selection prompt it saw.
fn scripted(replies: &[&str]) -> (impl LlmCallback, Arc<Mutex<Vec<String>>>) {
    let queue: Arc<Mutex<VecDeque<String>>> =
        Arc::new(Mutex::new(replies.iter().map(|r| r.to_string()).collect()));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let prompts = seen.clone();
    let llm = from_fn(move |prompt: String| {
        let reply = if prompt.starts_with("An action failed.") {
            "selector was wrong".to_string()
        } else {
            prompts.lock().unwrap().push(prompt);
            queue
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| r#"{"action": "done", "value": "script exhausted"}"#.to_string())
        };
        async move { Ok::<_, anyhow::Error>(reply) }
    });
    (llm, seen)
}

#[tokio::test(start_paused = true)]
async fn snapshot_lists_only_visible_interactive_elements() {
    let page = StaticPage::new().with_document(
        HOME,
        StaticDocument::new("Home")
            .element(StaticElement::new("a").text("Login").link_to("/login"))
            .element(StaticElement::new("button").text("Hidden").hidden()),
    );
    page.open(HOME).await.unwrap();
    let (llm, _) = scripted(&[]);
    let agent = Agent::new(Arc::new(page), llm, config(5)).unwrap();

    let snapshot = agent.snapshot().await.unwrap();
    assert_eq!(snapshot.elements.len(), 1);
    let link = &snapshot.elements[0];
    assert_eq!(link.tag, "a");
    assert_eq!(link.href.as_deref(), Some("/login"));
    assert!(link.is_clickable);
    assert_eq!(snapshot.clickable_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn typing_into_missing_element_fails_without_panicking() {
    let page = library();
    page.open(HOME).await.unwrap();
    let (llm, _) = scripted(&[]);
    let mut agent = Agent::new(Arc::new(page), llm, config(5)).unwrap();

    let result = agent.execute(Action::type_text("#missing", "abc")).await;
    assert!(!result.success);
    assert!(result.error.unwrap().contains("not found"));
    assert_eq!(result.before_url, HOME);
    assert_eq!(result.after_url, HOME);
}

#[tokio::test(start_paused = true)]
async fn done_ends_the_run_successfully() {
    let (llm, _) = scripted(&[
        r#"{"action": "type", "selector": "input[name='q']", "value": "rust", "reason": "search"}"#,
        r#"{"action": "done", "value": "typed the query"}"#,
    ]);
    let page = Arc::new(library());
    let mut agent = Agent::new(page.clone(), llm, config(10)).unwrap();

    let report = agent.run("search for rust", Some(HOME)).await;
    assert!(report.success);
    assert_eq!(report.outcome, RunOutcome::Done);
    assert_eq!(report.steps, 2);
    assert_eq!(report.history.len(), 2);
    assert_eq!(report.result.as_deref(), Some("typed the query"));
    assert_eq!(report.final_url, HOME);
    assert_eq!(page.value_of("input[name='q']").await.as_deref(), Some("rust"));
    assert_eq!(agent.state(), AgentState::Done);
}

#[tokio::test(start_paused = true)]
async fn budget_runs_out_when_never_done() {
    let (llm, _) = scripted(&[r#"{"action": "wait", "value": "0.5"}"#; 5]);
    let mut agent = Agent::new(Arc::new(library()), llm, config(3)).unwrap();

    let report = agent.run("browse forever", Some(HOME)).await;
    assert_eq!(report.steps, 3);
    assert!(!report.success);
    assert_eq!(report.outcome, RunOutcome::BudgetExhausted);
    assert_eq!(report.history.len(), 3);
    assert!(report.history.iter().all(|r| r.success));
    assert!(report.page_summaries.is_empty());
}

#[tokio::test(start_paused = true)]
async fn unparseable_reply_aborts_before_recording_a_step() {
    let (llm, _) = scripted(&["I think you should log in first."]);
    let mut agent = Agent::new(Arc::new(library()), llm, config(5)).unwrap();

    let report = agent.run("log in", Some(HOME)).await;
    assert_eq!(report.steps, 1);
    assert!(report.history.is_empty());
    assert!(!report.success);
    match &report.outcome {
        RunOutcome::Aborted { reason } => assert!(reason.contains("could not parse"), "{reason}"),
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(agent.state(), AgentState::Aborted);
}

#[tokio::test(start_paused = true)]
async fn page_transition_produces_one_summary() {
    let (llm, prompts) = scripted(&[
        r##"{"action": "click", "selector": "#login", "reason": "open login"}"##,
        r#"{"action": "done", "value": "on the login page"}"#,
    ]);
    let mut agent = Agent::new(Arc::new(library()), llm, config(5)).unwrap();

    let report = agent.run("open the login page", Some(HOME)).await;
    assert!(report.success);
    assert_eq!(report.page_summaries.len(), 1);
    let summary = &report.page_summaries[0];
    assert_eq!(summary.url, HOME);
    assert_eq!(summary.completed_actions, vec!["click: #login"]);
    assert_eq!(report.final_url, LOGIN);

    let prompts = prompts.lock().unwrap();
    assert_eq!(prompts.len(), 2);
    assert!(!prompts[0].contains("## Previous page"));
    assert!(prompts[1].contains("## Previous page"));
    assert!(prompts[1].contains("click: #login"));
}

#[tokio::test(start_paused = true)]
async fn failed_action_is_recorded_and_the_run_continues() {
    let (llm, _) = scripted(&[
        r##"{"action": "click", "selector": "#nope"}"##,
        r#"{"action": "teleport", "value": "0"}"#,
        r#"{"action": "done", "value": "gave up"}"#,
    ]);
    let mut agent = Agent::new(Arc::new(library()), llm, config(5)).unwrap();

    let report = agent.run("click something", Some(HOME)).await;
    assert_eq!(report.steps, 3);
    assert!(!report.history[0].success);
    assert_eq!(report.history[1].action["action"], "wait");
    assert!(report.history[1].success);
    assert!(report.success);
}

#[tokio::test(start_paused = true)]
async fn snapshot_failures_are_retried_then_abort() {
    let page = Arc::new(library());
    page.open(HOME).await.unwrap();
    page.fail_next_queries(1).await;
    let (llm, _) = scripted(&[r#"{"action": "done", "value": "ok"}"#]);
    let mut agent = Agent::new(page.clone(), llm, AgentConfig { max_retries: 2, ..config(5) }).unwrap();
    let report = agent.run("recover", None).await;
    assert!(report.success);

    page.fail_next_queries(10).await;
    let report = agent.run("give up", None).await;
    assert_eq!(report.steps, 1);
    assert!(report.history.is_empty());
    match &report.outcome {
        RunOutcome::Aborted { reason } => assert!(reason.contains("2 attempts failed"), "{reason}"),
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn extraction_is_idempotent_on_an_unchanged_page() {
    let page = Arc::new(library());
    page.open(LOGIN).await.unwrap();
    let (llm, _) = scripted(&[]);
    let agent = Agent::new(page.clone(), llm, config(5)).unwrap();

    let first = agent.snapshot().await.unwrap();
    let second = agent.snapshot().await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first.editable_count(), 2);
    assert_eq!(page.url().await.unwrap(), LOGIN);
}

#[tokio::test(start_paused = true)]
async fn llm_error_aborts_before_recording_a_step() {
    let llm = from_fn(|_prompt: String| async { Err::<String, _>(anyhow::anyhow!("upstream 529 overloaded")) });
    let mut agent = Agent::new(Arc::new(library()), llm, config(5)).unwrap();

    let report = agent.run("log in", Some(HOME)).await;
    assert_eq!(report.steps, 1);
    assert!(report.history.is_empty());
    assert!(!report.success);
    match &report.outcome {
        RunOutcome::Aborted { reason } => assert!(reason.contains("upstream 529 overloaded"), "{reason}"),
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn two_objects_in_one_reply_abort_the_run() {
    let (llm, _) = scripted(&[r#"{"action": "wait", "value": "1"} {"action": "done", "value": "x"}"#]);
    let mut agent = Agent::new(Arc::new(library()), llm, config(5)).unwrap();

    let report = agent.run("log in", Some(HOME)).await;
    assert_eq!(report.steps, 1);
    assert!(report.history.is_empty());
    assert!(!report.success);
    match &report.outcome {
        RunOutcome::Aborted { reason } => assert!(reason.contains("could not parse"), "{reason}"),
        other => panic!("unexpected outcome {other:?}"),
    }
}
