use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chromiumoxide::browser::Browser;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::input::{DispatchKeyEventParams, DispatchKeyEventType};
use chromiumoxide::cdp::browser_protocol::page::{CaptureScreenshotFormat, NavigateParams};
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::element::Element;
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use nanoid::nanoid;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::driver::{BrowserError, FormDescriptor, PageDriver, RawElement, ScrollDirection, SelectBy};
use crate::snapshot::ATTRIBUTE_ALLOW_LIST;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Clone, Debug)]
pub struct BrowserConfig {
    pub headless: bool,
    pub user_agent: Option<String>,
    pub viewport: (u32, u32),
    pub locale: String,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: true,
            user_agent: None,
            viewport: (1280, 900),
            locale: "ko-KR".into(),
        }
    }
}

fn protocol(e: impl std::fmt::Display) -> BrowserError {
    BrowserError::Protocol(e.to_string())
}

/// [`PageDriver`] over a Chromium instance launched through CDP.
pub struct ChromiumDriver {
    page: Page,
    browser: Mutex<Option<Browser>>,
    handler: JoinHandle<()>,
    profile_dir: PathBuf,
}

impl ChromiumDriver {
    pub async fn launch(cfg: BrowserConfig) -> Result<Self, BrowserError> {
        let mut builder = chromiumoxide::browser::BrowserConfig::builder();
        if !cfg.headless {
            builder = builder.with_head();
        }
        // A fresh profile per launch avoids the ProcessSingleton lock when
        // Chromium is restarted quickly.
        let profile_dir = std::env::temp_dir().join(format!("bua-profile-{}-{}", std::process::id(), nanoid!(8)));
        std::fs::create_dir_all(&profile_dir).map_err(protocol)?;
        let (width, height) = cfg.viewport;
        builder = builder
            .user_data_dir(profile_dir.clone())
            .window_size(width, height)
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg(format!("--lang={}", cfg.locale));
        let bcfg = builder.build().map_err(protocol)?;

        let (browser, mut handler) = Browser::launch(bcfg).await.map_err(protocol)?;
        let handler = tokio::spawn(async move {
            while let Some(_ev) = handler.next().await {}
        });
        let page = browser.new_page("about:blank").await.map_err(protocol)?;
        if let Some(ua) = cfg.user_agent {
            page.set_user_agent(ua).await.map_err(protocol)?;
        }
        let metrics = SetDeviceMetricsOverrideParams::builder()
            .width(width as i64)
            .height(height as i64)
            .device_scale_factor(1.0)
            .mobile(false)
            .build()
            .map_err(protocol)?;
        if let Err(e) = page.execute(metrics).await {
            warn!(error = %e, "viewport override failed");
        }
        info!(headless = cfg.headless, width, height, locale = %cfg.locale, "chromium launched");

        Ok(Self {
            page,
            browser: Mutex::new(Some(browser)),
            handler,
            profile_dir,
        })
    }

    /// Call `function` with JSON-encoded `args` in the page and decode its result.
    async fn call<T: DeserializeOwned>(&self, function: &str, args: &impl Serialize) -> Result<T, BrowserError> {
        let args = serde_json::to_string(args).map_err(protocol)?;
        self.eval(format!("({function})(...{args})")).await
    }

    // Explicit EvaluateParams: a string containing `=>` would otherwise be sent
    // as a function declaration rather than evaluated.
    async fn eval<T: DeserializeOwned>(&self, expression: String) -> Result<T, BrowserError> {
        let params = EvaluateParams::builder()
            .expression(expression)
            .return_by_value(true)
            .build()
            .map_err(protocol)?;
        self.page
            .evaluate_expression(params)
            .await
            .map_err(protocol)?
            .into_value::<T>()
            .map_err(protocol)
    }

    async fn run_script(&self, script: &str) -> Result<(), BrowserError> {
        let params = EvaluateParams::builder().expression(script).build().map_err(protocol)?;
        self.page.evaluate_expression(params).await.map_err(protocol)?;
        Ok(())
    }

    async fn ready_state(&self) -> Option<String> {
        self.eval::<String>("document.readyState".to_string()).await.ok()
    }

    async fn element(&self, selector: &str) -> Result<Element, BrowserError> {
        self.page
            .find_element(selector)
            .await
            .map_err(|_| BrowserError::ElementNotFound(selector.to_string()))
    }

    async fn ensure_open(&self) -> Result<(), BrowserError> {
        if self.browser.lock().await.is_none() {
            Err(BrowserError::Closed)
        } else {
            Ok(())
        }
    }
}

const PROBE_JS: &str = r#"(selector) => {
  let el;
  try { el = document.querySelector(selector); } catch (e) { return "invalid"; }
  if (!el) return "missing";
  const style = window.getComputedStyle(el);
  const visible = style.visibility !== "hidden" && style.display !== "none" && el.getClientRects().length > 0;
  return visible ? "visible" : "hidden";
}"#;

const CLEAR_JS: &str = r#"(selector) => {
  const el = document.querySelector(selector);
  if (!el) return false;
  if (el.isContentEditable) { el.textContent = ""; } else { el.value = ""; }
  el.dispatchEvent(new Event("input", { bubbles: true }));
  return true;
}"#;

const SELECT_JS: &str = r#"(selector, wanted, byLabel) => {
  const el = document.querySelector(selector);
  if (!el || !el.options) return false;
  for (const opt of el.options) {
    const key = byLabel ? (opt.label || opt.text).trim() : opt.value;
    if (key === wanted) {
      el.value = opt.value;
      el.dispatchEvent(new Event("input", { bubbles: true }));
      el.dispatchEvent(new Event("change", { bubbles: true }));
      return true;
    }
  }
  return false;
}"#;

const ELEMENTS_JS: &str = r#"(selector, allow) => {
  const out = [];
  for (const el of document.querySelectorAll(selector)) {
    try {
      const rect = el.getBoundingClientRect();
      const style = window.getComputedStyle(el);
      const attributes = {};
      for (const name of allow) {
        const v = el.getAttribute(name);
        if (v !== null) attributes[name] = v;
      }
      out.push({
        tag: el.tagName.toLowerCase(),
        text: (el.innerText || el.value || "").trim().slice(0, 200),
        attributes,
        x: rect.x, y: rect.y, width: rect.width, height: rect.height,
        visible: style.visibility !== "hidden" && style.display !== "none" && el.getClientRects().length > 0,
        has_click_handler: el.hasAttribute("onclick") || typeof el.onclick === "function",
        content_editable: el.isContentEditable,
      });
    } catch (e) {
      out.push(null);
    }
  }
  return out;
}"#;

const FORMS_JS: &str = r#"() => Array.from(document.forms).map((form, index) => ({
  index,
  action: form.getAttribute("action") || "",
  method: (form.getAttribute("method") || "get").toLowerCase(),
  fields: Array.from(form.querySelectorAll("input, select, textarea")).map((f) => ({
    tag: f.tagName.toLowerCase(),
    name: f.getAttribute("name") || "",
    type: f.getAttribute("type") || "",
    placeholder: f.getAttribute("placeholder") || "",
    required: f.required === true,
  })),
}))"#;

#[async_trait]
impl PageDriver for ChromiumDriver {
    async fn url(&self) -> Result<String, BrowserError> {
        self.ensure_open().await?;
        Ok(self.page.url().await.map_err(protocol)?.unwrap_or_default())
    }

    async fn title(&self) -> Result<String, BrowserError> {
        self.ensure_open().await?;
        Ok(self.page.get_title().await.map_err(protocol)?.unwrap_or_default())
    }

    async fn goto(&self, url: &str, timeout: Duration) -> Result<(), BrowserError> {
        self.ensure_open().await?;
        let navigation = async {
            let resp = self
                .page
                .execute(NavigateParams::new(url))
                .await
                .map_err(|e| BrowserError::Navigation(e.to_string()))?;
            if let Some(err) = resp.result.error_text.clone() {
                return Err(BrowserError::Navigation(format!("{err} at {url}")));
            }
            while !matches!(self.ready_state().await.as_deref(), Some("interactive" | "complete")) {
                sleep(POLL_INTERVAL).await;
            }
            Ok(())
        };
        tokio::time::timeout(timeout, navigation)
            .await
            .map_err(|_| BrowserError::Navigation(format!("timed out after {}ms loading {url}", timeout.as_millis())))?
    }

    async fn wait_for_content_loaded(&self, timeout: Duration) -> Result<(), BrowserError> {
        self.ensure_open().await?;
        let start = Instant::now();
        loop {
            if matches!(self.ready_state().await.as_deref(), Some("interactive" | "complete")) {
                return Ok(());
            }
            if start.elapsed() >= timeout {
                return Err(BrowserError::Timeout(format!("DOMContentLoaded not reached in {}ms", timeout.as_millis())));
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    async fn go_back(&self) -> Result<(), BrowserError> {
        self.ensure_open().await?;
        self.run_script("history.back()").await
    }

    async fn wait_for_selector(&self, selector: &str, timeout: Duration) -> Result<(), BrowserError> {
        self.ensure_open().await?;
        let start = Instant::now();
        loop {
            let state: String = self.call(PROBE_JS, &[selector]).await?;
            match state.as_str() {
                "visible" => return Ok(()),
                "invalid" => return Err(BrowserError::Protocol(format!("invalid selector `{selector}`"))),
                _ => {}
            }
            if start.elapsed() >= timeout {
                return Err(BrowserError::Timeout(format!(
                    "waiting for selector `{selector}` exceeded {}ms",
                    timeout.as_millis()
                )));
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    async fn scroll_into_view(&self, selector: &str) -> Result<(), BrowserError> {
        let element = self.element(selector).await?;
        element
            .scroll_into_view()
            .await
            .map_err(|e| BrowserError::Interaction(e.to_string()))?;
        Ok(())
    }

    async fn click(&self, selector: &str) -> Result<(), BrowserError> {
        let element = self.element(selector).await?;
        element.click().await.map_err(|e| BrowserError::Interaction(e.to_string()))?;
        Ok(())
    }

    async fn focus(&self, selector: &str) -> Result<(), BrowserError> {
        let element = self.element(selector).await?;
        element.focus().await.map_err(|e| BrowserError::Interaction(e.to_string()))?;
        Ok(())
    }

    async fn fill(&self, selector: &str, text: &str) -> Result<(), BrowserError> {
        let cleared: bool = self.call(CLEAR_JS, &[selector]).await?;
        if !cleared {
            return Err(BrowserError::ElementNotFound(selector.to_string()));
        }
        if text.is_empty() {
            return Ok(());
        }
        let element = self.element(selector).await?;
        element
            .focus()
            .await
            .map_err(|e| BrowserError::Interaction(e.to_string()))?
            .type_str(text)
            .await
            .map_err(|e| BrowserError::Interaction(e.to_string()))?;
        Ok(())
    }

    async fn select_option(&self, selector: &str, option: &SelectBy) -> Result<(), BrowserError> {
        let (wanted, by_label) = match option {
            SelectBy::Value(v) => (v.as_str(), false),
            SelectBy::Label(l) => (l.as_str(), true),
        };
        let selected: bool = self.call(SELECT_JS, &(selector, wanted, by_label)).await?;
        if selected {
            Ok(())
        } else {
            Err(BrowserError::Interaction(format!("no option {option:?} in {selector}")))
        }
    }

    async fn hover(&self, selector: &str) -> Result<(), BrowserError> {
        let element = self.element(selector).await?;
        element.hover().await.map_err(|e| BrowserError::Interaction(e.to_string()))?;
        Ok(())
    }

    async fn press_key(&self, key: &str) -> Result<(), BrowserError> {
        self.ensure_open().await?;
        // Element-level press knows key definitions (Enter submits forms);
        // with nothing focused fall back to raw CDP key events.
        if let Ok(focused) = self.page.find_element(":focus").await {
            if focused.press_key(key).await.is_ok() {
                return Ok(());
            }
        }
        for kind in [DispatchKeyEventType::KeyDown, DispatchKeyEventType::KeyUp] {
            let event = DispatchKeyEventParams::builder()
                .r#type(kind)
                .key(key)
                .build()
                .map_err(protocol)?;
            self.page.execute(event).await.map_err(protocol)?;
        }
        Ok(())
    }

    async fn scroll(&self, direction: ScrollDirection) -> Result<(), BrowserError> {
        self.ensure_open().await?;
        self.run_script(direction.script()).await
    }

    async fn screenshot(&self, path: &Path) -> Result<(), BrowserError> {
        self.ensure_open().await?;
        let params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .full_page(true)
            .build();
        let bytes = self.page.screenshot(params).await.map_err(protocol)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(protocol)?;
        }
        tokio::fs::write(path, bytes).await.map_err(protocol)?;
        debug!(path = %path.display(), "screenshot written");
        Ok(())
    }

    async fn query_elements(&self, selector: &str) -> Result<Vec<RawElement>, BrowserError> {
        self.ensure_open().await?;
        let raw: Vec<Option<RawElement>> = self
            .call(ELEMENTS_JS, &(selector, ATTRIBUTE_ALLOW_LIST))
            .await?;
        let total = raw.len();
        let elements: Vec<RawElement> = raw.into_iter().flatten().collect();
        if elements.len() < total {
            debug!(skipped = total - elements.len(), "unreadable elements skipped");
        }
        Ok(elements)
    }

    async fn query_forms(&self) -> Result<Vec<FormDescriptor>, BrowserError> {
        self.ensure_open().await?;
        self.call(FORMS_JS, &serde_json::json!([])).await
    }

    async fn close(&self) -> Result<(), BrowserError> {
        let Some(mut browser) = self.browser.lock().await.take() else {
            return Ok(());
        };
        if let Err(e) = browser.close().await {
            warn!(error = %e, "browser close failed");
        }
        let _ = browser.wait().await;
        self.handler.abort();
        if let Err(e) = tokio::fs::remove_dir_all(&self.profile_dir).await {
            debug!(error = %e, dir = %self.profile_dir.display(), "profile cleanup failed");
        }
        info!("chromium closed");
        Ok(())
    }
}
