//! agent-desk - contact-center agent client
//!
//! SIP-over-WebSocket calling and queue presence from the terminal.

mod agent;
mod api;
mod auth;
mod calling;
mod config;
mod console;
mod error;
mod events;
mod presence;
mod signaling;
mod switch;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::api::{ApiClient, RestPresenceStore, RestQueueDirectory, TelephonyConfig};
use crate::auth::TokenStore;
use crate::config::Config;
use crate::presence::{PresenceStatus, PresenceStore, QueueDirectory, QueuePresenceSync};
use crate::switch::AmiClient;

#[derive(Parser)]
#[command(name = "agent-desk")]
#[command(about = "Contact-center agent client: calls and queue presence", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Store a session token issued by the backend
    Login {
        /// Bearer token
        #[arg(short, long)]
        token: String,

        /// Backend base URL (kept from the previous login if omitted)
        #[arg(long)]
        api_url: Option<String>,

        /// Agent id (kept from the previous login if omitted)
        #[arg(long)]
        agent: Option<String>,

        /// Token lifetime in seconds
        #[arg(long)]
        expires_in: Option<u64>,
    },

    /// Leave all queues and clear the stored token
    Logout,

    /// Show the SIP identity issued to this agent
    Whoami,

    /// Show the local configuration
    Config,

    /// Log in to telephony and run the interactive agent console
    Console,

    /// Get/set agent presence
    Presence {
        /// New status: Ready, Off-Queue or a break name
        #[arg(short, long)]
        set: Option<String>,

        /// Break id (looked up by name when omitted)
        #[arg(short, long)]
        break_id: Option<u32>,
    },

    /// List configured breaks
    Breaks,

    /// Show the agent's queues and membership state
    Queues,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match cli.command {
        Commands::Login {
            token,
            api_url,
            agent,
            expires_in,
        } => {
            login(token, api_url, agent, expires_in).await?;
        }
        Commands::Logout => {
            tracing::info!("Logging out...");
            logout().await?;
        }
        Commands::Whoami => {
            whoami().await?;
        }
        Commands::Config => {
            show_config()?;
        }
        Commands::Console => {
            console::run(&Config::load()?).await?;
        }
        Commands::Presence { set, break_id } => match set {
            Some(status) => {
                tracing::info!("Setting presence to {}...", status);
                set_presence(&status, break_id).await?;
            }
            None => {
                get_presence().await?;
            }
        },
        Commands::Breaks => {
            list_breaks().await?;
        }
        Commands::Queues => {
            list_queues().await?;
        }
    }

    Ok(())
}

async fn login(
    token: String,
    api_url: Option<String>,
    agent: Option<String>,
    expires_in: Option<u64>,
) -> Result<()> {
    let mut config = Config::load()?;
    if let Some(url) = api_url {
        config.api_base_url = Some(url);
    }
    if let Some(agent) = agent {
        config.agent_id = Some(agent);
    }
    config.set_session_token(token, expires_in);

    let client = ApiClient::from_config(&config)?;
    let telephony = TelephonyConfig::fetch(&client)
        .await
        .context("Token check failed")?;
    config.save()?;

    println!("Logged in as {}", telephony.account().aor());
    Ok(())
}

fn presence_sync(config: &Config, client: &ApiClient) -> Result<QueuePresenceSync> {
    let switch = config
        .switch
        .clone()
        .context("No switch endpoint configured (add a [switch] section to the config file)")?;
    Ok(QueuePresenceSync::new(
        config.agent_id()?,
        Arc::new(RestQueueDirectory::new(client.clone())),
        Arc::new(AmiClient::new(switch)),
        Arc::new(RestPresenceStore::new(client.clone())),
    ))
}

async fn logout() -> Result<()> {
    let mut config = Config::load()?;
    match ApiClient::from_config(&config) {
        Ok(client) => match presence_sync(&config, &client) {
            Ok(sync) => {
                for failure in sync.teardown().await {
                    println!("Could not leave {}: {}", failure.queue, failure.error);
                }
            }
            Err(e) => tracing::warn!("Queue teardown skipped: {:#}", e),
        },
        Err(e) => tracing::warn!("Queue teardown skipped: {:#}", e),
    }

    config.clear_tokens();
    config.save()?;
    println!("Logged out.");
    Ok(())
}

async fn whoami() -> Result<()> {
    let config = Config::load()?;
    let client = ApiClient::from_config(&config)?;
    let telephony = TelephonyConfig::fetch(&client).await?;
    let account = telephony.account();

    println!("\nAgent: {}", config.agent_id.as_deref().unwrap_or("(not set)"));
    println!("  SIP identity: {}", account.aor());
    if let Some(name) = &account.display_name {
        println!("  Display name: {}", name);
    }
    println!("  Signaling:    {}", account.ws_url);
    for server in &telephony.ice_servers {
        println!("  ICE server:   {}", server.urls().join(", "));
    }
    Ok(())
}

fn show_config() -> Result<()> {
    let config = Config::load()?;
    println!("Config file: {}", Config::config_path()?.display());
    println!("  API base URL: {}", config.api_base_url.as_deref().unwrap_or("(not set)"));
    println!("  Agent id:     {}", config.agent_id.as_deref().unwrap_or("(not set)"));
    let token = match config.get_session_token() {
        Some(t) if t.is_expired() => "expired",
        Some(_) => "present",
        None => "none",
    };
    println!("  Session:      {}", token);
    match &config.switch {
        Some(switch) => println!("  Switch:       {}@{}:{}", switch.username, switch.host, switch.port),
        None => println!("  Switch:       (not set)"),
    }
    Ok(())
}

async fn get_presence() -> Result<()> {
    let config = Config::load()?;
    let client = ApiClient::from_config(&config)?;
    let record = RestPresenceStore::new(client).load().await?;

    println!("\nPresence Status:");
    println!("  Status: {}", record.current_status);
    if let Some(id) = record.break_id {
        println!("  Break id: {}", id);
    }
    Ok(())
}

async fn set_presence(name: &str, break_id: Option<u32>) -> Result<()> {
    let config = Config::load()?;
    let client = ApiClient::from_config(&config)?;

    let break_id = match break_id {
        Some(id) => Some(id),
        None => api::agent_status::list_breaks(&client)
            .await?
            .into_iter()
            .find(|b| b.name.eq_ignore_ascii_case(name.trim()))
            .map(|b| b.id),
    };
    let status = PresenceStatus::parse(name, break_id)?;

    let report = presence_sync(&config, &client)?.apply(status).await?;
    println!("Presence set to: {}", report.status);
    for queue in &report.synced {
        println!("  {}: ok", queue);
    }
    for failure in &report.failures {
        println!("  {}: {}", failure.queue, failure.error);
    }
    Ok(())
}

async fn list_breaks() -> Result<()> {
    let config = Config::load()?;
    let client = ApiClient::from_config(&config)?;
    let breaks = api::agent_status::list_breaks(&client).await?;

    if breaks.is_empty() {
        println!("No breaks configured.");
        return Ok(());
    }
    println!("\n{:>4}  Name", "Id");
    for b in breaks {
        println!("{:>4}  {}", b.id, b.name);
    }
    Ok(())
}

async fn list_queues() -> Result<()> {
    let config = Config::load()?;
    let client = ApiClient::from_config(&config)?;
    let directory = RestQueueDirectory::new(client);

    let agent = directory.agent_queues(config.agent_id()?).await?;
    let rows = directory.memberships(&agent.interface).await?;

    println!("\nInterface: {}", agent.interface);
    for queue in &agent.queues {
        let state = match rows.iter().find(|r| &r.queue_name == queue) {
            Some(row) if row.paused => format!(
                "paused ({})",
                row.pause_reason.as_deref().unwrap_or("no reason")
            ),
            Some(_) => "ready".to_string(),
            None => "not a member".to_string(),
        };
        println!("  {:<20} {}", queue, state);
    }
    Ok(())
}
