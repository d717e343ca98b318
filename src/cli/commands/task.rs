//! `run-task`

use ai_companion::config::Config;
use ai_companion::runtime::intent::Intent;
use ai_companion::runtime::{ComponentContainer, ContextProgram, Runtime, TaskType};
use anyhow::{Context, Result};
use clap::Args;
use colored::*;
use log::info;
use serde_json::Value;
use std::sync::{Arc, Mutex};

#[derive(Args)]
pub struct RunTaskCommand {
    /// Task name
    pub name: String,
    /// screen, sticky, repeating or quick (or 0-3)
    #[arg(short, long, default_value = "screen")]
    pub task_type: String,
    /// JSON start value handed to TaskStarted
    #[arg(short, long, default_value = "null")]
    pub start_value: String,
}

/// Registers handlers for the task's own events and records every dispatch.
#[derive(Default)]
struct RecordingProgram {
    events: Mutex<Vec<String>>,
}

impl RecordingProgram {
    fn events(&self) -> Vec<String> {
        self.events.lock().map(|events| events.clone()).unwrap_or_default()
    }
}

impl ContextProgram for RecordingProgram {
    fn define(&self, container: &Arc<dyn ComponentContainer>) -> Result<()> {
        let name = container.context_name();
        for event in ["Initialize", "TaskStarted", "ReceivedFromScreen", "ErrorOccurred"] {
            container.register_event(&name, event);
        }
        Ok(())
    }

    fn handle_event(
        &self,
        _container: &dyn ComponentContainer,
        component_name: &str,
        event_name: &str,
        args: &[Value],
    ) -> bool {
        let line = format!("{}.{}({})", component_name, event_name, Value::from(args.to_vec()));
        if let Ok(mut events) = self.events.lock() {
            events.push(line);
        }
        true
    }
}

pub async fn handle_run_task(config: &Config, cmd: RunTaskCommand) -> Result<()> {
    let task_type: TaskType = cmd.task_type.parse()?;
    let start_value: Value = serde_json::from_str(&cmd.start_value)
        .with_context(|| format!("Start value is not JSON: {}", cmd.start_value))?;
    let runtime_config = config.runtime.runtime_config();
    info!("Running task {} as {}", cmd.name, task_type);

    // Task workers block on their queues; keep them off the async executor.
    let name = cmd.name.clone();
    let (events, result) = tokio::task::spawn_blocking(move || -> Result<_> {
        let runtime = Runtime::builder().config(runtime_config).build();
        let program = Arc::new(RecordingProgram::default());
        runtime.register_service(&name, task_type, program.clone());

        let result = runtime.start_service(&Intent::for_service(name.clone(), &start_value))?;
        let task = runtime.task(&name).context("Task did not register")?;
        task.flush()?;
        runtime.run_on_task_thread(&name, |task| task.stop())?;
        // The stop job shuts the worker down after it runs.
        task.thread()
            .context("Task has no thread")?
            .worker()
            .join();
        runtime.shutdown();
        Ok((program.events(), result))
    })
    .await??;

    println!("{} {} ({})", "Task".bold(), cmd.name.bright_cyan(), task_type);
    println!("  Start result: {:?}", result);
    for event in events {
        println!("  {} {}", "→".bright_green(), event);
    }
    Ok(())
}
