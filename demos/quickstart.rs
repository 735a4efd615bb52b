use anyhow::Result;
use tracing_subscriber::EnvFilter;
use webscout::{Agent, ChromiumProvider, ClaudeClient, DecisionConfig, SessionConfig, Task};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let provider = ChromiumProvider::new(SessionConfig::default());
    let decider = ClaudeClient::new(DecisionConfig::default())?;
    let agent = Agent::new(provider, decider);

    let report = match std::env::args().nth(1) {
        Some(goal) => {
            let task = Task::new(goal).with_start_url("https://www.google.com");
            agent.run_task(&task).await?
        }
        None => agent.search("weather in Paris today").await?,
    };

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
