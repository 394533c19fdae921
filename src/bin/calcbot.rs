use std::{path::PathBuf, process::ExitCode, sync::Arc};

use calcbot::{
    agents::{Agent, AgentConfig, AgentError, ToolErrorPolicy, DEFAULT_MODEL, MATH_PROMPT, REACT_PROMPT},
    prompts::PromptLibrary,
    providers::{
        ollama::{Ollama, OllamaConfig},
        scripted::ScriptedProvider,
    },
    trace::{render_history, render_trace},
    LLMError, LLMProvider,
};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const USAGE: &str = "Please provide an input string.\nExample: Add 4 and 5.2";

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("could not load model script: {0}")]
    Script(LLMError),
    #[error("could not set up the model client: {0}")]
    Client(LLMError),
    #[error(transparent)]
    Agent(#[from] AgentError),
}

#[derive(Parser)]
#[command(name = "calcbot")]
#[command(about = "Ask a tool-calling math agent one question")]
struct Args {
    /// The question; all words are joined with spaces
    utterance: Vec<String>,

    /// Model served by Ollama
    #[arg(long, default_value = DEFAULT_MODEL)]
    model: String,

    /// Prompt file name inside the prompt directory
    #[arg(long)]
    prompt: Option<String>,

    /// Prompt directory (defaults to CALCBOT_PROMPT_DIR or ./prompts)
    #[arg(long)]
    prompt_dir: Option<PathBuf>,

    /// Use the ReAct agent and print the turn's trace
    #[arg(long)]
    react: bool,

    /// Maximum model calls per turn
    #[arg(long, default_value_t = 8)]
    max_iterations: usize,

    /// Feed tool errors back to the model instead of failing
    #[arg(long)]
    report_tool_errors: bool,

    /// OpenAI-compatible base URL (defaults to OLLAMA_BASE_URL or the local Ollama server)
    #[arg(long)]
    base_url: Option<String>,

    /// Replay model replies from a YAML/JSON script instead of calling a model
    #[arg(long)]
    scripted: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    let utterance = args.utterance.join(" ");
    if utterance.trim().is_empty() {
        println!("{USAGE}");
        return ExitCode::from(1);
    }

    match run(&args, utterance).await {
        Ok(lines) => {
            for line in lines {
                println!("{line}");
            }
            ExitCode::SUCCESS
        }
        Err(error) => {
            eprintln!("error: {error}");
            ExitCode::from(1)
        }
    }
}

async fn run(args: &Args, utterance: String) -> Result<Vec<String>, CliError> {
    let provider: Arc<dyn LLMProvider> = match &args.scripted {
        Some(path) => Arc::new(ScriptedProvider::from_file(path).map_err(CliError::Script)?),
        None => {
            let mut config = OllamaConfig::from_env();
            if let Some(base_url) = &args.base_url {
                config = config.with_base_url(base_url.clone());
            }
            Arc::new(Ollama::from_config(config).map_err(CliError::Client)?)
        }
    };

    let library = match &args.prompt_dir {
        Some(dir) => PromptLibrary::new(dir),
        None => PromptLibrary::from_env(),
    };

    let policy = if args.report_tool_errors {
        ToolErrorPolicy::Report
    } else {
        ToolErrorPolicy::Fail
    };
    let config = AgentConfig::default()
        .with_model(args.model.clone())
        .with_max_iterations(args.max_iterations)
        .with_tool_error_policy(policy);

    let agent = if args.react {
        let prompt = args.prompt.as_deref().unwrap_or(REACT_PROMPT);
        Agent::react_agent(provider, &library, prompt)?
    } else {
        let prompt = args.prompt.as_deref().unwrap_or(MATH_PROMPT);
        Agent::math_agent(provider, &library, prompt)?
    };

    let mut session = agent.with_config(config).session();
    let turn = session.send(utterance).await?;

    let mut lines = render_history(session.messages());
    if args.react {
        lines.push(String::new());
        lines.extend(render_trace(session.state().since(turn.start)));
    }
    Ok(lines)
}
