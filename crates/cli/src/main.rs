use std::path::PathBuf;

use {
    anyhow::Context,
    clap::{Parser, Subcommand},
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

use {
    embody_agents::{AgentDirectory, StaticAgentDirectory},
    embody_config::{EmbodyConfig, apply_env_overrides, discover_and_load, load_config},
    embody_tools::{Protocol, to_tool_descriptors},
};

#[derive(Parser)]
#[command(name = "embody", about = "Embody: serve agents as chat, tools and voice")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file to load instead of discovering one.
    #[arg(long, global = true, env = "EMBODY_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server.
    Gateway {
        #[arg(long)]
        bind: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Print the tools an agent exposes.
    Tools {
        /// Agent id.
        agent: String,
        /// Render for the realtime voice session instead of tool calling.
        #[arg(long, default_value_t = false)]
        realtime: bool,
    },
    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Load the config and its agents, then print a summary.
    Check,
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true),
            )
            .init();
    }
}

fn load(cli: &Cli) -> anyhow::Result<EmbodyConfig> {
    match &cli.config {
        Some(path) => {
            let mut config = load_config(path)
                .with_context(|| format!("failed to load config {}", path.display()))?;
            apply_env_overrides(&mut config, |key| std::env::var(key).ok());
            Ok(config)
        },
        None => Ok(discover_and_load()),
    }
}

async fn print_tools(config: &EmbodyConfig, agent_id: &str, realtime: bool) -> anyhow::Result<()> {
    let directory = StaticAgentDirectory::from_entries(&config.agents)?;
    let agent = directory
        .agent(agent_id)
        .await
        .with_context(|| format!("agent {agent_id} is not configured"))?;
    let protocol = if realtime {
        Protocol::Realtime
    } else {
        Protocol::ToolCalling
    };
    let tools = to_tool_descriptors(&agent.spec, protocol);
    println!("{}", serde_json::to_string_pretty(&tools)?);
    Ok(())
}

fn check_config(config: &EmbodyConfig) -> anyhow::Result<()> {
    let directory = StaticAgentDirectory::from_entries(&config.agents)?;
    println!("server      {}:{}", config.server.bind, config.server.port);
    println!("sandbox     {}", config.server.sandbox_domain);
    println!(
        "admission   {}/min, {} concurrent",
        config.rate_limit.requests_per_minute, config.rate_limit.max_concurrent_requests
    );
    println!("runtime     {}", config.runtime.url);
    println!("agents      {}", directory.len());
    for entry in &config.agents {
        println!("  {} ({}) team {}", entry.id, entry.name, entry.team_id);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    info!(version = env!("CARGO_PKG_VERSION"), "embody starting");
    let mut config = load(&cli)?;

    match cli.command {
        Commands::Gateway { bind, port } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            embody_gateway::start_gateway(config).await
        },
        Commands::Tools { agent, realtime } => print_tools(&config, &agent, realtime).await,
        Commands::Config {
            action: ConfigAction::Check,
        } => check_config(&config),
    }
}
