use std::net::SocketAddr;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

mod agent;
mod controller;
mod models;
mod repl;
mod server;
mod settings;
mod storage;
mod thread;

use agent::engine::Engine;
use agent::tools::ToolRegistry;
use controller::ChatController;
use models::{ModelSelector, OpenAICompatible};
use settings::{GlobalConfigDefaults, RequestOverrides};
use storage::SqliteThreadStore;

#[derive(Debug, Parser)]
#[command(name = "threadchat")]
#[command(about = "Persistent tool-calling chat agent", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Args)]
struct CommonArgs {
    /// SQLite URL, e.g. sqlite:///tmp/chat.db
    #[arg(long)]
    db: Option<String>,
    #[arg(long)]
    model: Option<String>,
    /// Upper bound on model turns per submission
    #[arg(long)]
    max_steps: Option<u32>,
    /// Only send the newest N messages to the model
    #[arg(long, value_parser = settings::parse_history_limit)]
    max_history: Option<usize>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve the chat UI and HTTP API
    Serve {
        #[arg(long, default_value = "127.0.0.1:7171")]
        listen: String,
        #[command(flatten)]
        common: CommonArgs,
    },
    /// Interactive terminal chat
    Chat {
        /// Resume an existing thread
        #[arg(long)]
        thread: Option<String>,
        #[command(flatten)]
        common: CommonArgs,
    },
}

fn global_defaults(common: &CommonArgs) -> GlobalConfigDefaults {
    let mut global = GlobalConfigDefaults::from_env();
    global.default_model = ModelSelector::select(common.model.clone(), global.default_model.take());
    let mut policy = global.loop_policy.take().unwrap_or_default();
    policy.max_steps = common.max_steps.or(policy.max_steps);
    policy.max_history_messages = common.max_history.or(policy.max_history_messages);
    global.loop_policy = Some(policy);
    global
}

async fn build_engine(common: &CommonArgs) -> anyhow::Result<(Engine, Arc<SqliteThreadStore>)> {
    let store = Arc::new(SqliteThreadStore::initialize(common.db.clone()).await?);
    let engine = Engine::new(
        store.clone(),
        Arc::new(OpenAICompatible::from_env()),
        ToolRegistry::with_default_tools(),
        global_defaults(common),
    );
    Ok((engine, store))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve { listen, common } => {
            let addr: SocketAddr = listen.parse()?;
            let metrics = PrometheusBuilder::new().install_recorder()?;
            let (engine, store) = build_engine(&common).await?;
            let state = server::AppState::new(ChatController::new(engine).await, Some(metrics));
            server::serve(addr, state).await?;
            store.close().await;
        }
        Commands::Chat { thread, common } => {
            let (engine, store) = build_engine(&common).await?;
            let mut controller = ChatController::new(engine).await;
            if let Some(id) = thread {
                let shown = controller.select_thread(&id).await.len();
                info!(thread_id = %id, messages = shown, "resumed thread");
            }
            repl::run(&mut controller, RequestOverrides::default()).await?;
            store.close().await;
        }
    }
    Ok(())
}
