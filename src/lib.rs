pub mod action;
pub mod agent;
pub mod browser;
pub mod config;
pub mod decision;
pub mod snapshot;

pub use action::{ActionError, ActionRequest, ScrollDirection, StepOutcome};
pub use agent::{Agent, DecisionService, Session, SessionProvider, StepRecord, Task, TaskOutcome, TaskResult};
pub use browser::{ChromiumProvider, ChromiumSession, SearchResult};
pub use config::{AgentMode, SessionConfig, ViewportProfile};
pub use decision::{ClaudeClient, DecisionConfig, DecisionError};
pub use snapshot::{Element, ElementRole, PageSnapshot};
