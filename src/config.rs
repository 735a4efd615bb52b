use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::snapshot::DEFAULT_ELEMENT_CAP;

/// How much of the page the capture feeds to the reasoning service.
/// `Fast` keeps only interactable elements; `Ai` also harvests visible text
/// blocks. Picked at session construction, never branched on in the loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentMode {
    Fast,
    Ai,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewportProfile {
    Mobile,
    Desktop,
}

impl ViewportProfile {
    pub fn dimensions(&self) -> (u32, u32) {
        match self {
            ViewportProfile::Mobile => (390, 844),
            ViewportProfile::Desktop => (1280, 800),
        }
    }

    pub fn device_scale(&self) -> f64 {
        match self {
            ViewportProfile::Mobile => 3.0,
            ViewportProfile::Desktop => 1.0,
        }
    }

    pub fn is_mobile(&self) -> bool {
        matches!(self, ViewportProfile::Mobile)
    }

    pub fn default_user_agent(&self) -> &'static str {
        match self {
            ViewportProfile::Mobile => {
                "Mozilla/5.0 (iPhone; CPU iPhone OS 17_5 like Mac OS X) AppleWebKit/605.1.15 \
                 (KHTML, like Gecko) Version/17.5 Mobile/15E148 Safari/604.1"
            }
            ViewportProfile::Desktop => {
                "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 \
                 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36"
            }
        }
    }
}

/// Everything the browser session provider needs at launch. The proxy and
/// emulation profile are inputs here; nothing downstream looks at them.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub mode: AgentMode,
    pub viewport: ViewportProfile,
    pub headless: bool,
    pub proxy: Option<String>,
    pub user_agent: Option<String>,
    pub element_cap: usize,
    pub nav_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            mode: AgentMode::Ai,
            viewport: ViewportProfile::Mobile,
            headless: true,
            proxy: env::var("WEBSCOUT_PROXY").ok().filter(|p| !p.is_empty()),
            user_agent: None,
            element_cap: DEFAULT_ELEMENT_CAP,
            nav_timeout: Duration::from_secs(20),
        }
    }
}

impl SessionConfig {
    pub fn desktop(mut self) -> Self {
        self.viewport = ViewportProfile::Desktop;
        self
    }

    pub fn headful(mut self) -> Self {
        self.headless = false;
        self
    }

    pub fn fast(mut self) -> Self {
        self.mode = AgentMode::Fast;
        self
    }
}
