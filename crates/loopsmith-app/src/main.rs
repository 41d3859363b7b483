//! loopsmith - drive a tool-calling model through edit/test cycles
//!
//! Takes a task description, lets the model edit files and run commands
//! inside a sandbox directory, runs the project's tests after every turn and
//! feeds failures back until they pass or the turn budget runs out.

use anyhow::{Context, Result};
use clap::Parser;
use loopsmith_adapters::config::{api_key_from_env, API_KEY_ENV};
use loopsmith_adapters::{logging, AgentConfig, Sandbox};
use loopsmith_core::ConversationState;
use loopsmith_engine::capabilities::ShellOptions;
use loopsmith_engine::{
    ClientSettings, FeedbackController, FeedbackSettings, OpenAiClient, RunReport, ToolContext,
    ToolDispatcher, ToolRegistry,
};
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

const USAGE_EXIT: u8 = 2;

#[derive(Parser, Debug)]
#[command(
    name = "loopsmith",
    about = "Let a language model edit a project until its tests pass",
    version
)]
struct Args {
    /// What the model should build or fix
    task: Option<String>,

    /// Sandbox directory all file and shell operations are confined to
    #[arg(long)]
    root: Option<PathBuf>,

    /// Config file (defaults to <config dir>/loopsmith/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Maximum feedback turns
    #[arg(long)]
    max_turns: Option<usize>,

    /// Maximum model round trips per turn
    #[arg(long)]
    max_hops: Option<usize>,

    /// Model identifier sent to the chat-completions endpoint
    #[arg(long)]
    model: Option<String>,
}

impl Args {
    fn apply(&self, config: &mut AgentConfig) {
        if let Some(root) = &self.root {
            config.sandbox_root = root.clone();
        }
        if let Some(turns) = self.max_turns {
            config.max_turns = turns;
        }
        if let Some(hops) = self.max_hops {
            config.max_hops = hops;
        }
        if let Some(model) = &self.model {
            config.model = model.clone();
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let Some(task) = args
        .task
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
    else {
        eprintln!("Usage: loopsmith \"Describe your coding task\"");
        return ExitCode::from(USAGE_EXIT);
    };

    logging::init("info");

    match run(&args, &task).await {
        Ok(report) => {
            tracing::info!(
                outcome = %report.outcome,
                turns = report.turns,
                completion_status = report.completion_status(),
                "run finished"
            );
            if let Some(answer) = &report.last_answer {
                println!("{answer}");
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            tracing::error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: &Args, task: &str) -> Result<RunReport> {
    let api_key = api_key_from_env()
        .with_context(|| format!("Please set the {API_KEY_ENV} environment variable"))?;

    let mut config = AgentConfig::load(args.config.as_deref())?;
    args.apply(&mut config);
    config.validate()?;

    fs::create_dir_all(&config.sandbox_root).with_context(|| {
        format!(
            "Failed to create sandbox root {}",
            config.sandbox_root.display()
        )
    })?;
    let root = config
        .sandbox_root
        .canonicalize()
        .with_context(|| format!("Failed to resolve {}", config.sandbox_root.display()))?;
    tracing::info!(root = %root.display(), model = %config.model, "sandbox ready");

    let client = OpenAiClient::new(
        api_key,
        &ClientSettings {
            base_url: config.base_url.clone(),
            model: config.model.clone(),
            temperature: config.temperature,
            request_timeout: config.request_timeout(),
        },
    )?;

    let ctx = ToolContext {
        sandbox: Sandbox::new(&root),
        shell: ShellOptions {
            timeout: config.shell_timeout(),
            allowed_commands: config.allowed_commands.clone(),
        },
    };
    let registry = Arc::new(ToolRegistry::with_builtin_tools()?);
    let dispatcher = ToolDispatcher::new(Arc::new(client), registry, ctx, config.max_hops);
    let conversation = ConversationState::new(config.system_prompt.clone(), config.max_history);

    let mut controller =
        FeedbackController::new(conversation, dispatcher, FeedbackSettings::from_config(&config));
    Ok(controller.run(task).await)
}
