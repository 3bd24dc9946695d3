use std::sync::Arc;

use anyhow::Context;
use tokio_stream::{StreamExt, StreamMap};

use nanoclaw::channels::{CLI_JID, ChannelRegistry, CliChannel, MessageStream};
use nanoclaw::config::{Config, MAIN_GROUP_FOLDER};
use nanoclaw::container::{DockerConfig, DockerRunner};
use nanoclaw::ipc::file_sender::FileSender;
use nanoclaw::orchestrator::{Orchestrator, OrchestratorDeps};
use nanoclaw::store::{Database, LibSqlBackend};
use nanoclaw::types::{ChatInfo, RegisteredGroup};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = Config::from_env().context("invalid configuration")?;

    eprintln!("🦀 nanoclaw v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Assistant: {}", config.assistant_name);
    eprintln!("   Root: {}", config.root_dir.display());
    eprintln!(
        "   Containers: {} (max {}, warm pool {})",
        config.container_image,
        config.max_concurrent_containers,
        if config.warm_pool_enabled { "on" } else { "off" }
    );

    // ── Container runtime ────────────────────────────────────────────────
    let runner = Arc::new(DockerRunner::new(DockerConfig::from(&config)));
    runner
        .ensure_runtime_running()
        .await
        .context("container runtime is not available")?;
    match runner.cleanup_orphans().await {
        Ok(0) => {}
        Ok(n) => tracing::info!(count = n, "Stopped orphaned containers"),
        Err(e) => tracing::warn!(error = %e, "Failed to clean up orphaned containers"),
    }

    // ── Database ─────────────────────────────────────────────────────────
    let db_path = config.db_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&db_path)
            .await
            .with_context(|| format!("failed to open database at {}", db_path.display()))?,
    );
    db.run_migrations().await.context("database migration failed")?;
    eprintln!("   Database: {}", db_path.display());

    // ── Channels ─────────────────────────────────────────────────────────
    let mut channels = ChannelRegistry::new();
    channels.add(Arc::new(CliChannel::new()));

    let orchestrator = Orchestrator::new(
        config.clone(),
        OrchestratorDeps {
            db: Arc::clone(&db),
            runner: runner.clone(),
            channels: channels.clone(),
        },
    )?;
    orchestrator.load_state().await.context("failed to load router state")?;
    // A fresh store has no chats; make the terminal the main group.
    let local = RegisteredGroup::new("Local", MAIN_GROUP_FOLDER, CLI_JID, "cli");
    if orchestrator
        .ensure_default_group(local)
        .await
        .context("failed to register the local chat")?
    {
        eprintln!("   Registered {CLI_JID} as the main group");
    }
    orchestrator.prewarm_all();

    let mut inbound: StreamMap<String, MessageStream> = StreamMap::new();
    for channel in channels.all() {
        match channel.connect().await {
            Ok(stream) => {
                inbound.insert(channel.name().to_string(), stream);
            }
            Err(e) => tracing::error!(channel = channel.name(), error = %e, "Channel failed to connect"),
        }
    }
    let store = Arc::clone(&db);
    tokio::spawn(async move {
        while let Some((channel, msg)) = inbound.next().await {
            let chat = ChatInfo {
                jid: msg.chat_jid.clone(),
                name: None,
                channel: channel.clone(),
                is_group: false,
                last_message_time: msg.timestamp.clone(),
            };
            if let Err(e) = store.store_chat_metadata(&chat).await {
                tracing::warn!(chat_jid = %msg.chat_jid, error = %e, "Failed to store chat metadata");
            }
            if let Err(e) = store.store_message(&msg).await {
                tracing::error!(chat_jid = %msg.chat_jid, error = %e, "Failed to store inbound message");
            }
        }
        tracing::info!("All inbound channels closed");
    });

    // ── Background loops ─────────────────────────────────────────────────
    let file_sender = FileSender::new(
        orchestrator.bridge().clone(),
        config.groups_dir(),
        channels.clone(),
        orchestrator.clone(),
        config.ipc_poll_interval,
    )
    .spawn();

    let recovered = orchestrator.recover_pending_messages().await;
    if recovered > 0 {
        eprintln!("   Recovered {recovered} chats with unprocessed messages");
    }
    let message_loop = orchestrator.spawn_message_loop();

    shutdown_signal().await;
    tracing::info!("Shutdown signal received");

    orchestrator.queue().shutdown(config.shutdown_grace).await;
    file_sender.abort();
    if let Some(handle) = message_loop {
        handle.abort();
    }
    channels.disconnect_all().await;
    tracing::info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
