//! Drone - Rust 自主任务执行引擎
//!
//! 入口：加载配置、初始化日志，`drone run <task>` 运行一次任务，`drone tools` 列出可用工具。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use drone::core::{
    AgentEvent, AgentStatus, AgentStore, BroadcastEventSink, InMemoryAgentStore, MessageKind,
    TranscriptMessage,
};
use drone::sandbox::SandboxBackend;
use drone::{load_config, observability, AgentRunner};
use tokio::sync::broadcast::error::RecvError;

/// Drone 自主任务执行引擎
#[derive(Parser, Debug)]
#[command(name = "drone")]
#[command(version, about, long_about = None)]
struct Cli {
    /// 额外的配置文件（覆盖 config/default.toml）
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 运行一个任务直到完成
    Run {
        /// 任务描述
        task: String,

        /// 最大循环数，0 表示不限
        #[arg(long)]
        max_cycles: Option<usize>,

        /// 忽略连续失败的停止建议
        #[arg(long)]
        continuous: bool,

        /// 在 Docker 容器中执行代码
        #[arg(long)]
        docker: bool,
    },

    /// 列出已注册的工具
    Tools {
        /// 输出 JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = load_config(cli.config).context("Failed to load configuration")?;
    observability::init(&config.telemetry);

    let workspace = config.app.workspace_root();
    std::fs::create_dir_all(&workspace)
        .with_context(|| format!("Failed to create workspace {}", workspace.display()))?;

    match cli.command {
        Command::Run {
            task,
            max_cycles,
            continuous,
            docker,
        } => {
            if let Some(max_cycles) = max_cycles {
                config.agent.max_cycles = max_cycles;
            }
            config.agent.continuous |= continuous;
            if docker {
                config.sandbox.backend = SandboxBackend::Docker;
            }
            run_task(config, task).await
        }
        Command::Tools { json } => {
            let store = Arc::new(InMemoryAgentStore::new());
            let runner = AgentRunner::from_config(config, store, Arc::new(BroadcastEventSink::default()))
                .await
                .context("Failed to initialize agent runtime")?;
            if json {
                let declarations = runner.tools().function_declarations();
                println!("{}", serde_json::to_string_pretty(&declarations)?);
            } else {
                for tool in runner.tools().list() {
                    println!("{:<16} {}", tool.name(), tool.description());
                }
            }
            Ok(())
        }
    }
}

async fn run_task(config: drone::AppConfig, task: String) -> anyhow::Result<()> {
    let store = Arc::new(InMemoryAgentStore::new());
    let events = Arc::new(BroadcastEventSink::default());
    let mut rx = events.subscribe();

    let runner = AgentRunner::from_config(config, store.clone(), events.clone())
        .await
        .context("Failed to initialize agent runtime")?;
    let agent = store.create_agent(task).await;
    let handle = runner
        .start(&agent.id)
        .await
        .context("Failed to start agent")?;

    let printer = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(AgentEvent::Message { message, .. }) => print_message(&message),
                Ok(AgentEvent::AgentStatus { running: false, .. }) => break,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });

    tokio::select! {
        result = handle => result.context("Agent task panicked")?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received Ctrl+C, stopping after the current cycle...");
            runner.stop(&agent.id);
        }
    }
    while runner.is_running(&agent.id) {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    let _ = printer.await;

    let record = store
        .find_agent(&agent.id)
        .await?
        .context("Agent record disappeared")?;
    if record.status == AgentStatus::Failed {
        anyhow::bail!("Agent {} failed", agent.id);
    }
    Ok(())
}

fn print_message(message: &TranscriptMessage) {
    let content = &message.content;
    match message.kind {
        MessageKind::Thought => {
            println!("> {} {}", content["command"].as_str().unwrap_or("?"), content["arguments"]);
            if let Some(reasoning) = content["reasoning"].as_array() {
                for line in reasoning.iter().filter_map(|l| l.as_str()) {
                    println!("  {}", line);
                }
            }
        }
        MessageKind::Result => {
            let mark = if content["success"].as_bool().unwrap_or(false) {
                "ok"
            } else {
                "failed"
            };
            println!("  [{}] {}", mark, content["summary"].as_str().unwrap_or_default());
        }
        _ => println!("{}", message.text_content()),
    }
}
