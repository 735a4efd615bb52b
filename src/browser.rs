use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use chromiumoxide::browser::Browser as OxideBrowser;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::input::{
    DispatchMouseEventParams, DispatchMouseEventType, InsertTextParams, MouseButton,
};
use chromiumoxide::layout::Point;
use chromiumoxide::page::{Page, ScreenshotParamsBuilder};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::action::{
    resolve, ActionError, ActionRequest, Pacer, ScrollDirection, StepOutcome, TokioSleeper,
};
use crate::agent::{Session, SessionProvider};
use crate::config::{AgentMode, SessionConfig};
use crate::snapshot::{decode_capture, PageSnapshot, CAPTURE_JS};

const DEFAULT_SCROLL_PX: i64 = 600;
const DEFAULT_WAIT_MS: u64 = 1500;

/// Launches one Chromium instance per task run.
pub struct ChromiumProvider {
    config: SessionConfig,
}

impl ChromiumProvider {
    pub fn new(config: SessionConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SessionProvider for ChromiumProvider {
    type Session = ChromiumSession;

    async fn acquire(&self) -> Result<ChromiumSession> {
        ChromiumSession::launch(self.config.clone()).await
    }
}

/// One live page driven over CDP. Capture and execution never raise; errors
/// degrade to empty snapshots and failed outcomes for the loop to route.
pub struct ChromiumSession {
    page: Page,
    browser: Option<OxideBrowser>,
    pacer: Pacer,
    config: SessionConfig,
}

impl ChromiumSession {
    pub async fn launch(config: SessionConfig) -> Result<Self> {
        let mut builder = chromiumoxide::browser::BrowserConfig::builder();
        if !config.headless {
            builder = builder.with_head();
        }
        // Unique user data dir per run to avoid ProcessSingleton profile lock
        // conflicts when instances are spawned in quick succession.
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let mut profile_dir: PathBuf = std::env::temp_dir();
        profile_dir.push(format!("webscout-profile-{}-{}", std::process::id(), ts));
        let _ = std::fs::create_dir_all(&profile_dir);
        builder = builder
            .user_data_dir(profile_dir.clone())
            .arg(format!("--user-data-dir={}", profile_dir.display()))
            .arg("--no-first-run")
            .arg("--no-default-browser-check");
        if let Some(proxy) = &config.proxy {
            builder = builder.arg(format!("--proxy-server={proxy}"));
        }
        let bcfg = builder.build().map_err(|e| anyhow::anyhow!(e))?;

        let (browser, mut handler) = OxideBrowser::launch(bcfg)
            .await
            .context("launching chromium")?;
        tokio::spawn(async move {
            while let Some(_ev) = handler.next().await {}
        });

        let page = browser.new_page("about:blank").await?;
        let ua = config
            .user_agent
            .clone()
            .unwrap_or_else(|| config.viewport.default_user_agent().to_string());
        page.set_user_agent(ua).await?;

        let (width, height) = config.viewport.dimensions();
        page.execute(
            SetDeviceMetricsOverrideParams::builder()
                .width(width as i64)
                .height(height as i64)
                .device_scale_factor(config.viewport.device_scale())
                .mobile(config.viewport.is_mobile())
                .build()
                .map_err(|e| anyhow::anyhow!(e))?,
        )
        .await?;

        Ok(Self {
            page,
            browser: Some(browser),
            pacer: Pacer::new(Box::new(TokioSleeper)),
            config,
        })
    }

    /// Replace the default pacing, e.g. a seeded [`Pacer`] for reproducible
    /// interaction timing.
    pub fn with_pacer(mut self, pacer: Pacer) -> Self {
        self.pacer = pacer;
        self
    }

    async fn best_known_url(&self) -> String {
        match self.page.url().await {
            Ok(Some(url)) => url,
            _ => "about:blank".into(),
        }
    }

    /// Geometry and state of a previously stamped element, looked up by its
    /// `data-ws-id` attribute on the live DOM.
    async fn locate(&self, target: usize) -> Result<ElementBox, ActionError> {
        let js = format!(
            r#"(() => {{
  const el = document.querySelector('[data-ws-id="{target}"]');
  if (!el) return JSON.stringify(null);
  el.scrollIntoView({{block: 'center', inline: 'center'}});
  const r = el.getBoundingClientRect();
  return JSON.stringify({{
    x: r.x, y: r.y, width: r.width, height: r.height,
    disabled: el.disabled === true
  }});
}})()"#
        );
        let raw: String = self
            .page
            .evaluate(js)
            .await
            .map_err(ActionError::browser)?
            .into_value()
            .map_err(ActionError::browser)?;
        let parsed: Option<ElementBox> =
            serde_json::from_str(&raw).map_err(ActionError::browser)?;
        parsed.ok_or(ActionError::StaleTarget { target })
    }

    async fn click_element(&self, target: usize) -> Result<(), ActionError> {
        let rect = self.locate(target).await?;
        if rect.disabled || rect.width <= 0.0 || rect.height <= 0.0 {
            return Err(ActionError::NotInteractable { target });
        }
        let (x, y) = self
            .pacer
            .click_point(rect.x, rect.y, rect.width, rect.height);
        self.page
            .move_mouse(Point { x, y })
            .await
            .map_err(ActionError::browser)?;
        let cmd = DispatchMouseEventParams::builder()
            .x(x)
            .y(y)
            .button(MouseButton::Left)
            .click_count(1);
        self.page
            .execute(
                cmd.clone()
                    .r#type(DispatchMouseEventType::MousePressed)
                    .build()
                    .map_err(ActionError::browser)?,
            )
            .await
            .map_err(ActionError::browser)?;
        self.page
            .execute(
                cmd.r#type(DispatchMouseEventType::MouseReleased)
                    .build()
                    .map_err(ActionError::browser)?,
            )
            .await
            .map_err(ActionError::browser)?;
        Ok(())
    }

    /// Click into the field, then feed characters one at a time with a
    /// typing cadence in between.
    async fn type_into(&self, target: usize, text: &str) -> Result<(), ActionError> {
        self.click_element(target).await?;
        for ch in text.chars() {
            self.page
                .execute(InsertTextParams {
                    text: ch.to_string(),
                })
                .await
                .map_err(ActionError::browser)?;
            self.pacer.typing_pause().await;
        }
        Ok(())
    }

    async fn scroll(&self, direction: ScrollDirection, amount: Option<i64>) -> Result<(), ActionError> {
        let px = amount.unwrap_or(DEFAULT_SCROLL_PX).max(0);
        let js = match direction {
            ScrollDirection::Up => format!("window.scrollBy(0, -{px});"),
            ScrollDirection::Down => format!("window.scrollBy(0, {px});"),
            ScrollDirection::Top => "window.scrollTo(0, 0);".to_string(),
            ScrollDirection::Bottom => {
                "window.scrollTo(0, document.body.scrollHeight);".to_string()
            }
        };
        self.page.evaluate(js).await.map_err(ActionError::browser)?;
        Ok(())
    }

    /// Top organic results from a search results page, when one is showing.
    pub async fn search_results(&self, limit: usize) -> Result<Vec<SearchResult>> {
        let js = format!(
            r#"(() => {{
  const out = [];
  for (const a of document.querySelectorAll('a h3')) {{
    const link = a.closest('a');
    if (!link || !link.href || link.href.startsWith('javascript:')) continue;
    out.push({{title: a.innerText.trim(), url: link.href}});
    if (out.length >= {limit}) break;
  }}
  return JSON.stringify(out);
}})()"#
        );
        let raw: String = self.page.evaluate(js).await?.into_value()?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Full-page screenshot, base64-encoded PNG.
    pub async fn screenshot_b64(&self) -> Result<String> {
        let bytes = self
            .page
            .screenshot(
                ScreenshotParamsBuilder::default()
                    .full_page(true)
                    .omit_background(true)
                    .build(),
            )
            .await?;
        Ok(STANDARD.encode(bytes))
    }
}

#[async_trait]
impl Session for ChromiumSession {
    async fn capture(&self) -> PageSnapshot {
        let url = self.best_known_url().await;
        let include_text = self.config.mode == AgentMode::Ai;
        let raw: Result<String> = async {
            Ok(self
                .page
                .evaluate(CAPTURE_JS)
                .await?
                .into_value::<String>()?)
        }
        .await;
        match raw.and_then(|json| decode_capture(&json, self.config.element_cap, include_text)) {
            Ok(snapshot) => {
                if snapshot.is_blank() {
                    debug!(url = %snapshot.url, "blank capture, page may still be loading");
                }
                snapshot
            }
            Err(err) => {
                warn!(%err, url, "capture failed, returning empty snapshot");
                PageSnapshot::empty(url)
            }
        }
    }

    async fn execute(&self, request: &ActionRequest, snapshot: &PageSnapshot) -> StepOutcome {
        self.pacer.before_action().await;
        let outcome: Result<Option<String>, ActionError> = match request {
            ActionRequest::Click { target } => match resolve(snapshot, *target) {
                Ok(_) => self.click_element(*target).await.map(|()| None),
                Err(err) => Err(err),
            },
            ActionRequest::Type { target, text } => match resolve(snapshot, *target) {
                Ok(_) => self.type_into(*target, text).await.map(|()| None),
                Err(err) => Err(err),
            },
            ActionRequest::Scroll { direction, amount } => {
                self.scroll(*direction, *amount).await.map(|()| None)
            }
            ActionRequest::Navigate { url } => match self.navigate(url).await {
                Ok(()) => Ok(Some(format!("now at {}", self.best_known_url().await))),
                Err(err) => Err(err),
            },
            ActionRequest::Wait { ms } => {
                self.pacer
                    .pause(std::time::Duration::from_millis(ms.unwrap_or(DEFAULT_WAIT_MS)))
                    .await;
                Ok(None)
            }
            // Verdicts are intercepted by the loop; reaching here is a bug
            // upstream, reported rather than acted on.
            ActionRequest::Finish { .. } | ActionRequest::Fail { .. } => {
                Err(ActionError::browser("verdict passed to executor"))
            }
        };
        self.pacer.after_action().await;
        match outcome {
            Ok(detail) => {
                debug!(action = request.kind(), "action done");
                match detail {
                    Some(detail) => StepOutcome::with_detail(detail),
                    None => StepOutcome::ok(),
                }
            }
            Err(error) => StepOutcome::failed(error),
        }
    }

    async fn navigate(&self, url: &str) -> Result<(), ActionError> {
        let nav = async {
            self.page.goto(url).await?;
            self.page.wait_for_navigation().await?;
            anyhow::Ok(())
        };
        match tokio::time::timeout(self.config.nav_timeout, nav).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(ActionError::browser(err)),
            Err(_) => Err(ActionError::NavigationTimeout { url: url.into() }),
        }
    }

    async fn close(&mut self) {
        if let Some(mut browser) = self.browser.take() {
            if let Err(err) = browser.close().await {
                warn!(%err, "browser close failed");
            }
            let _ = browser.wait().await;
        }
    }
}

#[derive(Debug, Deserialize)]
struct ElementBox {
    x: f64,
    y: f64,
    width: f64,
    height: f64,
    #[serde(default)]
    disabled: bool,
}

/// One organic result scraped off a results page.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
}
