use std::time::Instant;

use async_trait::async_trait;
use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::action::{ActionError, ActionRequest, StepOutcome};
use crate::decision::DecisionError;
use crate::snapshot::PageSnapshot;

pub const DEFAULT_MAX_STEPS: usize = 20;

const SEARCH_START_URL: &str = "https://www.google.com";

/// One natural-language goal plus its budget. Immutable for the whole run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Task {
    pub goal: String,
    pub start_url: Option<String>,
    pub max_steps: usize,
}

impl Task {
    pub fn new(goal: impl Into<String>) -> Self {
        Self {
            goal: goal.into(),
            start_url: None,
            max_steps: DEFAULT_MAX_STEPS,
        }
    }

    pub fn with_start_url(mut self, url: impl Into<String>) -> Self {
        self.start_url = Some(url.into());
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }
}

/// One loop iteration: the action issued, how it went, and the snapshot the
/// decision was made against. History is append-only and never reordered.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StepRecord {
    pub request: ActionRequest,
    pub outcome: StepOutcome,
    pub snapshot: PageSnapshot,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskOutcome {
    Completed { result: String },
    Failed { reason: String },
    Exhausted { reason: String },
}

/// Terminal report for one task run, produced exactly once.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskResult {
    pub run_id: String,
    pub outcome: TaskOutcome,
    pub history: Vec<StepRecord>,
    pub steps: usize,
    pub elapsed_ms: u128,
}

impl TaskResult {
    pub fn is_completed(&self) -> bool {
        matches!(self.outcome, TaskOutcome::Completed { .. })
    }

    /// Result payload on completion.
    pub fn result(&self) -> Option<&str> {
        match &self.outcome {
            TaskOutcome::Completed { result } => Some(result),
            _ => None,
        }
    }

    /// Human-readable reason on failure or exhaustion.
    pub fn reason(&self) -> Option<&str> {
        match &self.outcome {
            TaskOutcome::Failed { reason } | TaskOutcome::Exhausted { reason } => Some(reason),
            TaskOutcome::Completed { .. } => None,
        }
    }
}

/// A live browser session scoped to one task run. `capture` and `execute`
/// never raise; trouble shows up as empty snapshots and failed outcomes so
/// the loop keeps turning.
#[async_trait]
pub trait Session: Send + Sync {
    async fn capture(&self) -> PageSnapshot;
    async fn execute(&self, request: &ActionRequest, snapshot: &PageSnapshot) -> StepOutcome;
    async fn navigate(&self, url: &str) -> Result<(), ActionError>;
    /// Idempotent teardown; called on every exit path.
    async fn close(&mut self);
}

/// Hands out one session per task run. Acquisition is the only surface that
/// callers of [`Agent::run_task`] ever see an error from.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    type Session: Session;
    async fn acquire(&self) -> anyhow::Result<Self::Session>;
}

/// The reasoning service consulted each iteration for the next action.
/// Stateless between calls; `history` carries all continuity.
#[async_trait]
pub trait DecisionService: Send + Sync {
    async fn decide(
        &self,
        task: &Task,
        history: &[StepRecord],
        snapshot: &PageSnapshot,
    ) -> Result<ActionRequest, DecisionError>;
}

/// Runs the perceive-decide-act cycle: capture a snapshot, ask the decision
/// service, execute the action, record the step, until a verdict or the
/// budget ends the run. Individual action failures are the service's problem
/// to recover from; the loop only enforces the hard step ceiling.
pub struct Agent<P, D> {
    provider: P,
    decider: D,
}

impl<P, D> Agent<P, D>
where
    P: SessionProvider,
    D: DecisionService,
{
    pub fn new(provider: P, decider: D) -> Self {
        Self { provider, decider }
    }

    pub async fn run_task(&self, task: &Task) -> anyhow::Result<TaskResult> {
        let run_id = nanoid!();
        let start = Instant::now();
        info!(%run_id, goal = %task.goal, max_steps = task.max_steps, "task started");

        // A zero budget is terminal before any resource is touched.
        if task.max_steps == 0 {
            return Ok(Self::report(
                run_id,
                TaskOutcome::Exhausted {
                    reason: "step budget of 0 reached".into(),
                },
                Vec::new(),
                start,
            ));
        }

        let mut session = self.provider.acquire().await?;

        if let Some(url) = &task.start_url {
            if let Err(err) = session.navigate(url).await {
                warn!(%err, url, "initial navigation failed");
                session.close().await;
                return Ok(Self::report(
                    run_id,
                    TaskOutcome::Failed {
                        reason: format!("initial navigation to {url} failed: {err}"),
                    },
                    Vec::new(),
                    start,
                ));
            }
        }

        let (outcome, history) = self.drive(task, &session).await;
        session.close().await;

        info!(%run_id, outcome = ?outcome, steps = history.len(), "task finished");
        Ok(Self::report(run_id, outcome, history, start))
    }

    /// Convenience entry: a web search phrased as a regular task.
    pub async fn search(&self, query: &str) -> anyhow::Result<TaskResult> {
        let task = Task::new(format!(
            "Search the web for \"{query}\" and report the most relevant findings."
        ))
        .with_start_url(SEARCH_START_URL);
        self.run_task(&task).await
    }

    async fn drive(&self, task: &Task, session: &P::Session) -> (TaskOutcome, Vec<StepRecord>) {
        let mut history: Vec<StepRecord> = Vec::new();

        for step in 0..task.max_steps {
            let snapshot = session.capture().await;
            debug!(
                step,
                url = %snapshot.url,
                elements = snapshot.elements.len(),
                "captured page"
            );

            let request = match self.decider.decide(task, &history, &snapshot).await {
                Ok(request) => request,
                Err(err) => {
                    warn!(step, %err, "decision service gave up");
                    return (
                        TaskOutcome::Failed {
                            reason: format!("decision-service-unavailable: {err}"),
                        },
                        history,
                    );
                }
            };
            info!(step, action = request.kind(), "next action");

            match &request {
                ActionRequest::Finish { result } => {
                    let result = result.clone();
                    history.push(StepRecord {
                        request,
                        outcome: StepOutcome::with_detail("task reported complete"),
                        snapshot,
                    });
                    return (TaskOutcome::Completed { result }, history);
                }
                ActionRequest::Fail { reason } => {
                    let reason = reason.clone();
                    history.push(StepRecord {
                        request,
                        outcome: StepOutcome::with_detail("task reported unrecoverable"),
                        snapshot,
                    });
                    return (TaskOutcome::Failed { reason }, history);
                }
                _ => {}
            }

            let outcome = session.execute(&request, &snapshot).await;
            if let StepOutcome::Failure { error } = &outcome {
                // Recorded, not terminal: the service sees the failure next
                // turn and chooses whether to retry, adapt, or give up.
                warn!(step, %error, "action failed");
            }
            history.push(StepRecord {
                request,
                outcome,
                snapshot,
            });
        }

        (
            TaskOutcome::Exhausted {
                reason: format!("step budget of {} reached", task.max_steps),
            },
            history,
        )
    }

    fn report(
        run_id: String,
        outcome: TaskOutcome,
        history: Vec<StepRecord>,
        start: Instant,
    ) -> TaskResult {
        let steps = history.len();
        TaskResult {
            run_id,
            outcome,
            history,
            steps,
            elapsed_ms: start.elapsed().as_millis(),
        }
    }
}
