use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::snapshot::{Element, PageSnapshot};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrollDirection {
    Up,
    Down,
    Top,
    Bottom,
}

/// One decoded instruction from the reasoning service. Strictly validated:
/// anything that does not decode into one of these shapes is rejected
/// upstream, never guessed at.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ActionRequest {
    Click {
        target: usize,
    },
    Type {
        target: usize,
        text: String,
    },
    Scroll {
        direction: ScrollDirection,
        #[serde(default)]
        amount: Option<i64>,
    },
    Navigate {
        url: String,
    },
    Wait {
        #[serde(default)]
        ms: Option<u64>,
    },
    Finish {
        result: String,
    },
    Fail {
        reason: String,
    },
}

impl ActionRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            ActionRequest::Click { .. } => "click",
            ActionRequest::Type { .. } => "type",
            ActionRequest::Scroll { .. } => "scroll",
            ActionRequest::Navigate { .. } => "navigate",
            ActionRequest::Wait { .. } => "wait",
            ActionRequest::Finish { .. } => "finish",
            ActionRequest::Fail { .. } => "fail",
        }
    }

    /// Element id this request acts on, if any.
    pub fn target(&self) -> Option<usize> {
        match self {
            ActionRequest::Click { target } | ActionRequest::Type { target, .. } => Some(*target),
            _ => None,
        }
    }

}

/// Action-level failures. Recorded into history and surfaced to the
/// reasoning service on the next turn; they never terminate the task.
#[derive(Clone, Debug, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionError {
    #[error("no element {target} in the current snapshot")]
    StaleTarget { target: usize },
    #[error("element {target} is not interactable")]
    NotInteractable { target: usize },
    #[error("navigation to {url} timed out")]
    NavigationTimeout { url: String },
    #[error("browser error: {message}")]
    Browser { message: String },
}

impl ActionError {
    pub fn browser(message: impl ToString) -> Self {
        ActionError::Browser {
            message: message.to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepOutcome {
    Success {
        #[serde(default)]
        detail: Option<String>,
    },
    Failure {
        error: ActionError,
    },
}

impl StepOutcome {
    pub fn ok() -> Self {
        StepOutcome::Success { detail: None }
    }

    pub fn with_detail(detail: impl Into<String>) -> Self {
        StepOutcome::Success {
            detail: Some(detail.into()),
        }
    }

    pub fn failed(error: ActionError) -> Self {
        StepOutcome::Failure { error }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, StepOutcome::Success { .. })
    }

    /// One-line summary for prompts and logs.
    pub fn brief(&self) -> String {
        match self {
            StepOutcome::Success { detail: None } => "ok".into(),
            StepOutcome::Success { detail: Some(d) } => format!("ok ({d})"),
            StepOutcome::Failure { error } => format!("failed: {error}"),
        }
    }
}

/// Lookup-or-fail against the current snapshot's arena. Ids from older
/// snapshots must land here as [`ActionError::StaleTarget`], never resolve to
/// a different element.
pub fn resolve<'a>(snapshot: &'a PageSnapshot, target: usize) -> Result<&'a Element, ActionError> {
    snapshot
        .element(target)
        .ok_or(ActionError::StaleTarget { target })
}

/// Sleeping seam so pacing and retry backoff stay deterministic and instant
/// under test.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Timing envelope for human-like interaction, in milliseconds.
#[derive(Clone, Copy, Debug)]
pub struct PacingProfile {
    pub pre_action_ms: (u64, u64),
    pub post_action_ms: (u64, u64),
    pub per_char_ms: (u64, u64),
    /// Click offset from element center, as a fraction of the element box.
    pub click_jitter: f64,
}

impl Default for PacingProfile {
    fn default() -> Self {
        Self {
            pre_action_ms: (300, 900),
            post_action_ms: (500, 1200),
            per_char_ms: (80, 180),
            click_jitter: 0.25,
        }
    }
}

/// Drives variable delays and pointer jitter around each browser mutation.
/// Seeded construction gives a reproducible sequence for tests.
pub struct Pacer {
    rng: Mutex<StdRng>,
    sleeper: Box<dyn Sleeper>,
    profile: PacingProfile,
}

impl Pacer {
    pub fn new(sleeper: Box<dyn Sleeper>) -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
            sleeper,
            profile: PacingProfile::default(),
        }
    }

    pub fn seeded(seed: u64, sleeper: Box<dyn Sleeper>) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            sleeper,
            profile: PacingProfile::default(),
        }
    }

    pub fn with_profile(mut self, profile: PacingProfile) -> Self {
        self.profile = profile;
        self
    }

    pub async fn before_action(&self) {
        let ms = self.pick(self.profile.pre_action_ms);
        self.sleeper.sleep(Duration::from_millis(ms)).await;
    }

    pub async fn after_action(&self) {
        let ms = self.pick(self.profile.post_action_ms);
        self.sleeper.sleep(Duration::from_millis(ms)).await;
    }

    /// Cadence pause between typed characters.
    pub async fn typing_pause(&self) {
        let ms = self.pick(self.profile.per_char_ms);
        self.sleeper.sleep(Duration::from_millis(ms)).await;
    }

    pub async fn pause(&self, duration: Duration) {
        self.sleeper.sleep(duration).await;
    }

    /// Click point inside the element box: center plus a bounded random
    /// offset, so repeated clicks do not land on the exact same pixel.
    pub fn click_point(&self, x: f64, y: f64, width: f64, height: f64) -> (f64, f64) {
        let mut rng = self.rng.lock().expect("pacer rng poisoned");
        let jitter = self.profile.click_jitter;
        let dx = if width > 2.0 {
            rng.gen_range(-width * jitter / 2.0..=width * jitter / 2.0)
        } else {
            0.0
        };
        let dy = if height > 2.0 {
            rng.gen_range(-height * jitter / 2.0..=height * jitter / 2.0)
        } else {
            0.0
        };
        (x + width / 2.0 + dx, y + height / 2.0 + dy)
    }

    fn pick(&self, (lo, hi): (u64, u64)) -> u64 {
        let mut rng = self.rng.lock().expect("pacer rng poisoned");
        if lo >= hi {
            lo
        } else {
            rng.gen_range(lo..=hi)
        }
    }
}
