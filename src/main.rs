use anyhow::{Context, Result};
use bua::agent::Agent;
use bua::catalog::{tool_definitions, ToolCatalog};
use bua::llm::{callback_from_env, LlmProvider};
use bua::AgentConfig;
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "bua")]
#[command(about = "LLM-driven browse-and-act agent")]
#[command(version)]
struct Cli {
    /// Run Chrome without a window (overrides BUA_HEADLESS)
    #[arg(long, global = true)]
    headless: bool,

    /// LLM provider: anthropic, openai or local (overrides BUA_LLM_PROVIDER)
    #[arg(long, global = true)]
    provider: Option<LlmProvider>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Pursue a goal until done or out of steps
    Run {
        #[arg(long)]
        goal: String,
        #[arg(long)]
        start_url: Option<String>,
    },
    /// Print the interactive elements of a page
    Snapshot {
        #[arg(long)]
        url: Option<String>,
    },
    /// Invoke one catalog tool
    Call {
        tool: String,
        /// Tool arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,
    },
    /// List the catalog tools and their input schemas
    Tools,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Command::Tools = cli.command {
        return print_json(&tool_definitions());
    }

    let mut cfg = AgentConfig::from_env();
    if cli.headless {
        cfg.headless = true;
    }
    if let Some(provider) = cli.provider {
        cfg.llm_provider = provider;
    }
    let llm = callback_from_env(cfg.llm_provider);
    let max_elements = cfg.snapshot_max_elements;
    let mut agent = Agent::launch(cfg, llm).await.context("failed to launch browser")?;
    info!(headless = agent.config().headless, "browser ready");

    match cli.command {
        Command::Run { goal, start_url } => {
            let report = agent.run(&goal, start_url.as_deref()).await;
            agent.close().await?;
            print_json(&report)
        }
        Command::Snapshot { url } => {
            let exported = async {
                if let Some(url) = url.as_deref() {
                    let result = agent.execute(bua::Action::navigate(url)).await;
                    if let Some(error) = result.error {
                        anyhow::bail!(error);
                    }
                }
                Ok(agent.export_snapshot(max_elements).await?)
            }
            .await;
            agent.close().await?;
            print_json(&exported?)
        }
        Command::Call { tool, args } => {
            let args: Value = serde_json::from_str(&args).context("--args must be a JSON object")?;
            let catalog = ToolCatalog::new(agent);
            let output = catalog.call(&tool, &args).await;
            catalog.close().await?;
            print_json(&output)
        }
        Command::Tools => Ok(()),
    }
}
