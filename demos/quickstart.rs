use std::sync::Arc;

use anyhow::Result;
use pagepilot::{EnvCredentials, Pilot, PilotConfig, TaskStatus};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut cfg = PilotConfig::from_env();
    cfg.browser.headless = false;
    let pilot = Pilot::launch(cfg, Arc::new(EnvCredentials)).await?;
    tracing::info!(model = pilot.model(), "pilot ready");

    let mut events = pilot.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            tracing::info!(event = %serde_json::to_string(&event).unwrap_or_default(), "pilot event");
        }
    });

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let report = pilot
        .run_task(
            Some("https://duckduckgo.com"),
            "search for 'fox' and press enter, then finish",
            cancel,
        )
        .await?;

    for step in &report.steps {
        println!("{:>2}. {} -> {}", step.index, step.turn.thought, step.turn.action.to_json());
        if let Some(err) = &step.error {
            println!("    failed: {err}");
        }
    }
    match report.status {
        TaskStatus::Finished => println!("done"),
        other => println!("stopped: {other:?}"),
    }
    Ok(())
}
