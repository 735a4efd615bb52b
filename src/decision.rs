use std::env;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::action::{resolve, ActionRequest, Sleeper, TokioSleeper};
use crate::agent::{DecisionService, StepRecord, Task};
use crate::snapshot::PageSnapshot;

const API_VERSION: &str = "2023-06-01";

const SYSTEM_PROMPT: &str = r#"You are a web automation agent controlling a real browser to complete a task.
Each turn you see the current page (URL, interactive elements with numeric ids, visible text) and your previous steps.

Reply with exactly ONE JSON object choosing the next action:
{"action":"click","target":<element id>}
{"action":"type","target":<element id>,"text":"text to enter"}
{"action":"scroll","direction":"up"|"down"|"top"|"bottom","amount":<pixels, optional>}
{"action":"navigate","url":"https://..."}
{"action":"wait","ms":<milliseconds, optional>}
{"action":"finish","result":"the answer or outcome of the task"}
{"action":"fail","reason":"why the task cannot be completed"}

Rules:
1. target ids must come from the current element list. Ids from earlier pages are invalid.
2. If the page shows no elements it may still be loading: use wait.
3. If a previous step failed, adapt; use fail only when no approach is left.
4. You may include a "reasoning" field; it is ignored.
5. No markdown, no prose outside the JSON object."#;

/// Reasoning-service failure classes. Transient ones are retried inside the
/// client; whatever comes out of [`DecisionService::decide`] is terminal for
/// the task.
#[derive(Debug, Error)]
pub enum DecisionError {
    #[error("transient service error: {0}")]
    Transient(String),
    #[error("fatal service error: {0}")]
    Fatal(String),
    #[error("unparseable reply: {0}")]
    Parse(String),
}

#[derive(Debug, Error)]
pub enum TransportError {
    /// Timeout, connect failure, garbled response body. Retried.
    #[error("request failed: {0}")]
    Network(String),
    #[error("service returned {status}: {message}")]
    Status { status: u16, message: String },
}

impl TransportError {
    fn is_transient(&self) -> bool {
        match self {
            TransportError::Network(_) => true,
            TransportError::Status { status, .. } => *status == 429 || *status >= 500,
        }
    }
}

/// Narrow seam over the messages API so retry and parsing logic can be
/// exercised without a network.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn complete(&self, system: &str, user: &str) -> Result<String, TransportError>;
}

#[derive(Clone, Debug)]
pub struct DecisionConfig {
    pub api_base: String,
    pub api_key: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Retries after the first attempt on transient transport failure.
    pub transient_retries: u32,
    pub backoff_base: Duration,
    pub request_timeout: Duration,
    /// Trailing step records included verbatim in the prompt; older ones
    /// collapse to a count line.
    pub history_window: usize,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            api_base: env::var("ANTHROPIC_BASE_URL")
                .unwrap_or_else(|_| "https://api.anthropic.com".into()),
            api_key: env::var("ANTHROPIC_API_KEY").unwrap_or_default(),
            model: env::var("WEBSCOUT_MODEL")
                .unwrap_or_else(|_| "claude-sonnet-4-20250514".into()),
            max_tokens: 500,
            temperature: 0.3,
            transient_retries: 2,
            backoff_base: Duration::from_millis(500),
            request_timeout: Duration::from_secs(60),
            history_window: 5,
        }
    }
}

struct HttpTransport {
    http: reqwest::Client,
    cfg: DecisionConfig,
}

#[async_trait]
impl ChatTransport for HttpTransport {
    async fn complete(&self, system: &str, user: &str) -> Result<String, TransportError> {
        let url = format!("{}/v1/messages", self.cfg.api_base);
        let body = json!({
            "model": self.cfg.model,
            "max_tokens": self.cfg.max_tokens,
            "temperature": self.cfg.temperature,
            "system": system,
            "messages": [{ "role": "user", "content": user }],
        });
        let resp = self
            .http
            .post(url)
            .header("x-api-key", &self.cfg.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;
        if !status.is_success() {
            let message = serde_json::from_str::<Value>(&text)
                .ok()
                .and_then(|v| v["error"]["message"].as_str().map(String::from))
                .unwrap_or(text);
            return Err(TransportError::Status {
                status: status.as_u16(),
                message,
            });
        }
        let v: Value = serde_json::from_str(&text)
            .map_err(|e| TransportError::Network(format!("invalid response body: {e}")))?;
        v.pointer("/content/0/text")
            .and_then(Value::as_str)
            .map(String::from)
            .ok_or_else(|| TransportError::Network("response carried no text content".into()))
    }
}

/// Claude-backed decision client. Stateless between calls: the task, step
/// history and snapshot passed to each `decide` carry all continuity.
pub struct ClaudeClient {
    transport: Box<dyn ChatTransport>,
    sleeper: Box<dyn Sleeper>,
    cfg: DecisionConfig,
}

impl ClaudeClient {
    pub fn new(cfg: DecisionConfig) -> Result<Self> {
        if cfg.api_key.is_empty() {
            bail!("ANTHROPIC_API_KEY missing");
        }
        let http = reqwest::Client::builder()
            .timeout(cfg.request_timeout)
            .build()?;
        Ok(Self {
            transport: Box::new(HttpTransport {
                http,
                cfg: cfg.clone(),
            }),
            sleeper: Box::new(TokioSleeper),
            cfg,
        })
    }

    /// Swap the transport and sleeper; used by tests and custom backends.
    pub fn with_transport(
        cfg: DecisionConfig,
        transport: Box<dyn ChatTransport>,
        sleeper: Box<dyn Sleeper>,
    ) -> Self {
        Self {
            transport,
            sleeper,
            cfg,
        }
    }
}

#[async_trait]
impl DecisionService for ClaudeClient {
    async fn decide(
        &self,
        task: &Task,
        history: &[StepRecord],
        snapshot: &PageSnapshot,
    ) -> Result<ActionRequest, DecisionError> {
        let mut prompt = build_user_prompt(task, history, snapshot, self.cfg.history_window, None);
        let mut clarified = false;
        let mut retries_left = self.cfg.transient_retries;
        let mut backoff = self.cfg.backoff_base;

        loop {
            match self.transport.complete(SYSTEM_PROMPT, &prompt).await {
                Ok(reply) => match parse_reply(&reply, snapshot) {
                    Ok(request) => {
                        debug!(action = request.kind(), "decision parsed");
                        return Ok(request);
                    }
                    Err(problem) => {
                        if clarified {
                            return Err(DecisionError::Parse(problem));
                        }
                        warn!(%problem, "reply did not validate, asking once more");
                        clarified = true;
                        prompt = build_user_prompt(
                            task,
                            history,
                            snapshot,
                            self.cfg.history_window,
                            Some(&problem),
                        );
                    }
                },
                Err(err) if err.is_transient() => {
                    if retries_left == 0 {
                        return Err(DecisionError::Transient(err.to_string()));
                    }
                    warn!(%err, retries_left, "transient service failure, backing off");
                    retries_left -= 1;
                    self.sleeper.sleep(backoff).await;
                    backoff *= 2;
                }
                Err(err) => return Err(DecisionError::Fatal(err.to_string())),
            }
        }
    }
}

fn build_user_prompt(
    task: &Task,
    history: &[StepRecord],
    snapshot: &PageSnapshot,
    window: usize,
    clarification: Option<&str>,
) -> String {
    let mut out = format!(
        "Current task: {}\nStep {}/{}\n\n{}\nPrevious steps:\n",
        task.goal,
        history.len() + 1,
        task.max_steps,
        snapshot.render(),
    );
    if history.is_empty() {
        out.push_str("None\n");
    } else {
        let skipped = history.len().saturating_sub(window);
        if skipped > 0 {
            out.push_str(&format!("({skipped} earlier steps omitted)\n"));
        }
        for (i, record) in history.iter().enumerate().skip(skipped) {
            let request =
                serde_json::to_string(&record.request).unwrap_or_else(|_| "?".into());
            out.push_str(&format!(
                "{}: {} -> {}\n",
                i + 1,
                request,
                record.outcome.brief()
            ));
        }
    }
    if let Some(problem) = clarification {
        out.push_str(&format!(
            "\nYour previous reply was rejected: {problem}. \
             Respond with a single valid JSON object only.\n"
        ));
    }
    out.push_str("\nNext action as a single JSON object:");
    out
}

/// Strict decode of a service reply. Extracts the first balanced JSON object
/// (models occasionally wrap it in prose or fences), decodes it into an
/// [`ActionRequest`], and checks element references against the current
/// snapshot. Anything else is a parse failure, never a best-effort guess.
fn parse_reply(reply: &str, snapshot: &PageSnapshot) -> Result<ActionRequest, String> {
    let object = extract_json_object(reply)
        .ok_or_else(|| "reply contains no JSON object".to_string())?;
    let request: ActionRequest =
        serde_json::from_str(object).map_err(|e| format!("invalid action: {e}"))?;
    validate(&request, snapshot)?;
    Ok(request)
}

fn validate(request: &ActionRequest, snapshot: &PageSnapshot) -> Result<(), String> {
    if let Some(target) = request.target() {
        resolve(snapshot, target).map_err(|e| e.to_string())?;
    }
    match request {
        ActionRequest::Type { text, .. } if text.is_empty() => {
            Err("type requires non-empty text".into())
        }
        ActionRequest::Navigate { url }
            if !(url.starts_with("http://") || url.starts_with("https://")) =>
        {
            Err(format!("navigate requires an absolute http(s) url, got {url:?}"))
        }
        _ => Ok(()),
    }
}

/// First balanced `{...}` in the text, string-literal aware.
fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in text[start..].char_indices() {
        if in_string {
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
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + i + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::StepOutcome;
    use crate::snapshot::{Element, ElementRole};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    struct ScriptedTransport {
        replies: Mutex<VecDeque<Result<String, TransportError>>>,
        fallback: String,
        calls: AtomicUsize,
    }

    impl ScriptedTransport {
        fn new(replies: Vec<Result<String, TransportError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                fallback: "no more scripted replies".into(),
                calls: AtomicUsize::new(0),
            })
        }

        fn always(reply: &str) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(VecDeque::new()),
                fallback: reply.into(),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ChatTransport for Arc<ScriptedTransport> {
        async fn complete(&self, _system: &str, _user: &str) -> Result<String, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(self.fallback.clone()))
        }
    }

    struct InstantSleeper {
        slept: Mutex<Vec<Duration>>,
    }

    #[async_trait]
    impl Sleeper for InstantSleeper {
        async fn sleep(&self, duration: Duration) {
            self.slept.lock().unwrap().push(duration);
        }
    }

    fn page() -> PageSnapshot {
        PageSnapshot {
            url: "https://search.example/".into(),
            title: "Search".into(),
            elements: vec![
                Element {
                    id: 0,
                    role: ElementRole::Input,
                    label: "q".into(),
                    enabled: true,
                    in_viewport: true,
                },
                Element {
                    id: 2,
                    role: ElementRole::Link,
                    label: "Weather in Paris".into(),
                    enabled: true,
                    in_viewport: true,
                },
            ],
            text_blocks: vec![],
        }
    }

    fn client(transport: Arc<ScriptedTransport>) -> ClaudeClient {
        let cfg = DecisionConfig {
            backoff_base: Duration::from_millis(10),
            ..DecisionConfig::default()
        };
        ClaudeClient::with_transport(
            cfg,
            Box::new(transport),
            Box::new(InstantSleeper {
                slept: Mutex::new(Vec::new()),
            }),
        )
    }

    fn task() -> Task {
        Task::new("search for weather in Paris")
    }

    #[tokio::test]
    async fn decodes_valid_reply() {
        let transport = ScriptedTransport::new(vec![Ok(
            r#"{"action":"type","target":0,"text":"weather paris","reasoning":"search box"}"#
                .into(),
        )]);
        let client = client(transport.clone());
        let request = client.decide(&task(), &[], &page()).await.unwrap();
        assert_eq!(
            request,
            ActionRequest::Type {
                target: 0,
                text: "weather paris".into()
            }
        );
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn reply_wrapped_in_prose_and_fences_still_parses() {
        let transport = ScriptedTransport::new(vec![Ok(
            "Here is my move:\n```json\n{\"action\":\"click\",\"target\":2}\n```".into(),
        )]);
        let client = client(transport);
        let request = client.decide(&task(), &[], &page()).await.unwrap();
        assert_eq!(request, ActionRequest::Click { target: 2 });
    }

    #[tokio::test]
    async fn unparseable_reply_gets_exactly_one_clarification_retry() {
        let transport = ScriptedTransport::always("I would click the search box now.");
        let client = client(transport.clone());
        let err = client.decide(&task(), &[], &page()).await.unwrap_err();
        assert!(matches!(err, DecisionError::Parse(_)));
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn clarification_retry_can_recover() {
        let transport = ScriptedTransport::new(vec![
            Ok("clicking now".into()),
            Ok(r#"{"action":"click","target":2}"#.into()),
        ]);
        let client = client(transport.clone());
        let request = client.decide(&task(), &[], &page()).await.unwrap();
        assert_eq!(request, ActionRequest::Click { target: 2 });
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn unknown_target_is_a_parse_failure() {
        let transport = ScriptedTransport::always(r#"{"action":"click","target":99}"#);
        let client = client(transport.clone());
        let err = client.decide(&task(), &[], &page()).await.unwrap_err();
        assert!(matches!(err, DecisionError::Parse(_)));
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn transient_errors_retry_with_backoff_then_give_up() {
        let transport = ScriptedTransport::new(vec![
            Err(TransportError::Status {
                status: 503,
                message: "overloaded".into(),
            }),
            Err(TransportError::Network("timeout".into())),
            Err(TransportError::Status {
                status: 500,
                message: "boom".into(),
            }),
        ]);
        let slept = Arc::new(Mutex::new(Vec::new()));
        struct Shared(Arc<Mutex<Vec<Duration>>>);
        #[async_trait]
        impl Sleeper for Shared {
            async fn sleep(&self, d: Duration) {
                self.0.lock().unwrap().push(d);
            }
        }
        let cfg = DecisionConfig {
            backoff_base: Duration::from_millis(10),
            ..DecisionConfig::default()
        };
        let client = ClaudeClient::with_transport(
            cfg,
            Box::new(transport.clone()),
            Box::new(Shared(slept.clone())),
        );
        let err = client.decide(&task(), &[], &page()).await.unwrap_err();
        assert!(matches!(err, DecisionError::Transient(_)));
        // Initial attempt + two retries, doubling backoff between them.
        assert_eq!(transport.calls(), 3);
        assert_eq!(
            slept.lock().unwrap().as_slice(),
            &[Duration::from_millis(10), Duration::from_millis(20)]
        );
    }

    #[tokio::test]
    async fn transient_failure_then_success_recovers() {
        let transport = ScriptedTransport::new(vec![
            Err(TransportError::Network("connection reset".into())),
            Ok(r#"{"action":"wait","ms":500}"#.into()),
        ]);
        let client = client(transport.clone());
        let request = client.decide(&task(), &[], &page()).await.unwrap();
        assert_eq!(request, ActionRequest::Wait { ms: Some(500) });
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn auth_failure_is_fatal_without_retry() {
        let transport = ScriptedTransport::always("unused");
        *transport.replies.lock().unwrap() = VecDeque::from(vec![Err(TransportError::Status {
            status: 401,
            message: "invalid x-api-key".into(),
        })]);
        let client = client(transport.clone());
        let err = client.decide(&task(), &[], &page()).await.unwrap_err();
        assert!(matches!(err, DecisionError::Fatal(_)));
        assert_eq!(transport.calls(), 1);
    }

    #[test]
    fn prompt_windows_history() {
        let snap = page();
        let record = |i: usize| StepRecord {
            request: ActionRequest::Wait { ms: Some(i as u64) },
            outcome: StepOutcome::ok(),
            snapshot: snap.clone(),
        };
        let history: Vec<StepRecord> = (0..8).map(record).collect();
        let prompt = build_user_prompt(&task(), &history, &snap, 5, None);
        assert!(prompt.contains("(3 earlier steps omitted)"));
        assert!(!prompt.contains("\n3: "));
        assert!(prompt.contains("\n4: "));
        assert!(prompt.contains("\n8: "));
        assert!(prompt.contains("Step 9/20"));
    }

    #[test]
    fn extract_json_handles_braces_in_strings() {
        let text = r#"note {"action":"finish","result":"use {braces} freely"} trailing"#;
        let obj = extract_json_object(text).unwrap();
        let req: ActionRequest = serde_json::from_str(obj).unwrap();
        assert_eq!(
            req,
            ActionRequest::Finish {
                result: "use {braces} freely".into()
            }
        );
    }

    #[test]
    fn missing_parameter_is_rejected_not_guessed() {
        let err = parse_reply(r#"{"action":"navigate"}"#, &page()).unwrap_err();
        assert!(err.contains("invalid action"));
        let err = parse_reply(r#"{"action":"navigate","url":"ftp://x"}"#, &page()).unwrap_err();
        assert!(err.contains("http"));
    }
}
