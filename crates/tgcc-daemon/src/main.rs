use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use teloxide::prelude::*;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

use tgcc_core::config::BridgeConfig;
use tgcc_telegram::sink::TelegramSink;

mod batcher;
mod bridge;
mod commands;
mod ctl;
mod supervisor;
mod telegram;
mod toolsock;

use batcher::MessageBatcher;
use bridge::{AgentBridge, Registry};
use telegram::AgentRuntime;

/// Window for merging consecutive text messages into one user-message.
const BATCH_WINDOW: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(name = "tgcc", about = "Telegram ⇄ Claude-CLI bridge daemon")]
struct Cli {
    /// Config file path (default: TGCC_CONFIG env, then ~/.tgcc/tgcc.json).
    #[arg(long)]
    config: Option<String>,

    /// Tracing filter override (e.g. "tgcc=debug").
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Fatal configuration problems at startup exit with code 1.
    let config = match BridgeConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("tgcc: {e}");
            std::process::exit(1);
        }
    };

    let default_filter = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.global.log_level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();

    if config.agents.is_empty() {
        eprintln!("tgcc: no agents configured");
        std::process::exit(1);
    }

    let registry: Arc<Registry> = Arc::new(Registry::new());
    let hub = supervisor::SupervisorHub::new();

    let mut bridges: HashMap<String, Arc<AgentBridge>> = HashMap::new();
    let mut background: Vec<tokio::task::JoinHandle<()>> = Vec::new();

    for agent_config in &config.agents {
        let bot = Bot::new(&agent_config.bot_token);
        let sink = Arc::new(TelegramSink::new(bot.clone()));
        let bridge = AgentBridge::new(
            agent_config.clone(),
            config.global.clone(),
            config.repos.clone(),
            sink.clone(),
            Arc::clone(&registry),
            Arc::clone(&hub),
        );
        bridges.insert(agent_config.id.clone(), Arc::clone(&bridge));

        // Batcher: merged text batches feed the pipeline in FIFO order.
        let (batcher, mut batch_rx) = MessageBatcher::new(BATCH_WINDOW);
        {
            let bridge = Arc::clone(&bridge);
            background.push(tokio::spawn(async move {
                while let Some(batch) = batch_rx.recv().await {
                    bridge
                        .deliver_text(batch.chat_id, batch.user_id, batch.text)
                        .await;
                }
            }));
        }

        // Per-agent control socket.
        {
            let bridge = Arc::clone(&bridge);
            let path = ctl::socket_path(&config.global.socket_dir, &agent_config.id);
            background.push(tokio::spawn(async move {
                if let Err(e) = ctl::serve(bridge, path).await {
                    error!(error = %e, "control socket failed");
                }
            }));
        }

        // One tool socket per allowed user; files land in that user's DM.
        for &user_id in &agent_config.allowed_users {
            let path = toolsock::socket_path(&config.global.socket_dir, &agent_config.id, user_id);
            let sink = sink.clone();
            background.push(tokio::spawn(async move {
                if let Err(e) = toolsock::serve(sink, path, user_id).await {
                    error!(error = %e, "tool socket failed");
                }
            }));
        }

        // Telegram long polling.
        let runtime = Arc::new(AgentRuntime {
            bridge: Arc::clone(&bridge),
            batcher,
        });
        background.push(tokio::spawn(telegram::run_bot(bot, runtime)));

        info!(agent = %agent_config.id, "agent started");
    }

    // Supervisor socket, shared across agents.
    {
        let hub = Arc::clone(&hub);
        let bridges = bridges.clone();
        let path = config.global.socket_dir.join("supervisor.sock");
        background.push(tokio::spawn(async move {
            if let Err(e) = supervisor::serve(hub, bridges, path).await {
                error!(error = %e, "supervisor socket failed");
            }
        }));
    }

    info!(agents = bridges.len(), "tgcc daemon up");

    // Graceful shutdown on SIGTERM/SIGINT.
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = sigterm.recv() => info!("SIGTERM received"),
        _ = sigint.recv() => info!("SIGINT received"),
    }

    for (id, bridge) in &bridges {
        info!(agent = %id, "shutting down agent");
        bridge.shutdown().await;
    }
    for task in background {
        task.abort();
    }
    info!("tgcc daemon stopped");
    Ok(())
}
