//! Real-browser checks. Run with: cargo test --test chromium -- --ignored

use std::sync::Arc;

use bua::action::Timings;
use bua::agent::{Agent, AgentConfig};
use bua::browser::{BrowserConfig, ChromiumDriver};
use bua::llm::RuleBasedLlm;
use bua::{Action, PageDriver};

const FORM_PAGE: &str = "data:text/html,<title>Login</title>\
<form action='/login' method='post'><input id='id' type='text'><input id='pw' type='password'>\
<button id='go' type='submit'>Sign in</button></form><a href='more.html'>More</a>";

fn headless() -> BrowserConfig {
    BrowserConfig { headless: true, ..BrowserConfig::default() }
}

#[tokio::test]
#[ignore = "requires Chrome"]
async fn extracts_a_real_page() {
    let driver = Arc::new(ChromiumDriver::launch(headless()).await.unwrap());
    let cfg = AgentConfig { headless: true, timings: Timings::immediate(), ..AgentConfig::default() };
    let mut agent = Agent::new(driver.clone(), RuleBasedLlm, cfg).unwrap();

    assert!(agent.execute(Action::navigate(FORM_PAGE)).await.success);
    let snapshot = agent.snapshot().await.unwrap();
    assert_eq!(snapshot.title, "Login");
    assert_eq!(snapshot.editable_count(), 2);
    assert_eq!(snapshot.forms.len(), 1);
    assert_eq!(snapshot.forms[0].method, "post");

    let typed = agent.execute(Action::type_text("#id", "testuser")).await;
    assert!(typed.success, "{:?}", typed.error);
    let missing = agent.execute(Action::click("#nope")).await;
    assert!(!missing.success);

    agent.close().await.unwrap();
    assert!(driver.url().await.is_err());
}

#[tokio::test]
#[ignore = "requires Chrome"]
async fn screenshots_land_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let driver = ChromiumDriver::launch(headless()).await.unwrap();
    driver.goto(FORM_PAGE, std::time::Duration::from_secs(30)).await.unwrap();
    let path = dir.path().join("page.png");
    driver.screenshot(&path).await.unwrap();
    assert!(std::fs::metadata(&path).unwrap().len() > 8);
    driver.close().await.unwrap();
}
