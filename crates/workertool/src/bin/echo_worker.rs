//! Reference worker tool: echoes each payload back as the action's result.
//!
//! Every action gets a step started/finished pair and a console line. A payload
//! of `{"fail": true}` fails the action with exit code 1.

use std::io;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value;
use workertool::bridge::protocol::LogLevel;
use workertool::{CommandHandler, EventSink, ResultEvent};

struct EchoHandler;

#[async_trait]
impl CommandHandler for EchoHandler {
    async fn execute(
        &self,
        action_id: &str,
        payload: Value,
        events: &EventSink,
    ) -> io::Result<ResultEvent> {
        let step = events
            .step_started("echo", format!("echo {}", action_id))
            .await?;
        events
            .console(LogLevel::Info, format!("{}: {}", action_id, payload))
            .await?;
        events.step_finished(step).await?;

        let fail = payload.get("fail").and_then(Value::as_bool).unwrap_or(false);
        let message = payload.to_string();
        if fail {
            tracing::info!(%action_id, "Failing action on request");
            Ok(ResultEvent::failure(action_id, 1, message))
        } else {
            Ok(ResultEvent::success(action_id).with_message(message))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    workertool::logging::init_tracing();
    tracing::info!(pid = std::process::id(), "echo-worker starting");

    workertool::run_worker_from_env(&EchoHandler)
        .await
        .context("echo-worker failed")?;

    tracing::info!("echo-worker exiting");
    Ok(())
}
