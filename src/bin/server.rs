use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use calcbot::{
    agents::{Agent, AgentConfig, DEFAULT_MODEL, MATH_PROMPT, REACT_PROMPT},
    prompts::PromptLibrary,
    providers::ollama::{Ollama, OllamaConfig},
    web::{router, AppState, DEFAULT_IDLE_MINUTES},
    LLMProvider,
};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "server")]
#[command(about = "Serve the CalcBot web front ends")]
struct Args {
    #[arg(long, default_value_t = 3002)]
    port: u16,

    #[arg(long, default_value = DEFAULT_MODEL)]
    model: String,

    #[arg(long)]
    prompt_dir: Option<PathBuf>,

    #[arg(long, default_value = MATH_PROMPT)]
    prompt: String,

    #[arg(long, default_value = REACT_PROMPT)]
    react_prompt: String,

    #[arg(long)]
    base_url: Option<String>,

    /// Minutes before an untouched session is dropped
    #[arg(long, default_value_t = DEFAULT_IDLE_MINUTES)]
    session_idle_minutes: i64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,server=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let mut ollama = OllamaConfig::from_env();
    if let Some(base_url) = args.base_url {
        ollama = ollama.with_base_url(base_url);
    }
    let provider: Arc<dyn LLMProvider> = Arc::new(Ollama::from_config(ollama)?);

    let library = match args.prompt_dir {
        Some(dir) => PromptLibrary::new(dir),
        None => PromptLibrary::from_env(),
    };
    let config = AgentConfig::default().with_model(args.model);

    let plain = Agent::math_agent(provider.clone(), &library, &args.prompt)?
        .with_config(config.clone());
    let react = Agent::react_agent(provider, &library, &args.react_prompt)?.with_config(config);

    let state = AppState::new(plain, react)
        .with_idle_ttl(chrono::Duration::minutes(args.session_idle_minutes.max(1)));
    let app = router(Arc::new(state));

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}
