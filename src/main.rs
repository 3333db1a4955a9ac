//! Typerace Server
//!
//! Process bootstrap: configuration, logging, component wiring, and
//! graceful shutdown. All the interesting behavior lives in the
//! library crate.

use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use typerace::admin::{run_admin_server, AdminConfig, AdminState};
use typerace::config::Config;
use typerace::control::{ControlFlags, ControllerConfig, SelfHealingController, SysinfoSampler};
use typerace::core::TextProvider;
use typerace::game::{RaceEngine, ReplayStore};
use typerace::network::{GameServer, RoomRegistry};
use typerace::VERSION;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let config = Config::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .init();

    info!("Typerace Server v{}", VERSION);
    info!("Environment: {}", config.environment);
    info!("WebSocket bind: {}", config.ws_bind);
    info!("Admin bind: {}", config.admin_bind);
    info!(
        "Race settings: {} max players, {} to start, {}s countdown",
        config.max_players_per_game, config.min_players_to_start, config.countdown_seconds
    );

    // Wire the component graph explicitly: no globals, same shape the
    // tests construct.
    let texts = TextProvider::load_or_builtin(&config.texts_path);
    info!("Loaded {} race passages", texts.len());
    let flags = Arc::new(ControlFlags::new());
    let replays = Arc::new(ReplayStore::new());
    let (engine, events_rx) = RaceEngine::new(
        config.engine_config(),
        texts,
        flags.clone(),
        replays.clone(),
    );
    let rooms = Arc::new(RoomRegistry::new(flags.clone()));

    let queue_worker = engine.spawn_creation_queue_worker();

    let admin_state = AdminState::new(
        AdminConfig {
            bind_addr: config.admin_bind,
            environment: config.environment,
            client_url: config.client_url.clone(),
            api_key: config.admin_api_key.clone(),
        },
        engine.clone(),
        flags.clone(),
        replays.clone(),
        rooms.clone(),
    );
    let admin = tokio::spawn(async move {
        if let Err(e) = run_admin_server(admin_state).await {
            warn!("Admin server error: {}", e);
        }
    });

    let mut controller_tasks = Vec::new();
    if config.self_healing {
        let controller = Arc::new(SelfHealingController::new(
            ControllerConfig::default(),
            flags.clone(),
            engine.clone(),
        ));
        controller_tasks.push(controller.clone().spawn(Box::new(SysinfoSampler::new())));
        controller_tasks.push(controller.spawn_deferred_worker());
        info!("Self-healing controller started");
    } else {
        info!("Self-healing controller disabled (set SELF_HEALING=1 to enable)");
    }

    let server = GameServer::new(
        config.server_config(),
        engine.clone(),
        rooms.clone(),
        flags.clone(),
        replays.clone(),
        events_rx,
    );
    let shutdown = server.shutdown_handle();
    let server_task = tokio::spawn(server.run());

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    // Stop intake, tell every room why, and give the pump a moment to
    // flush the termination events before tearing the tasks down.
    flags.set_accepting_new_players(false);
    engine.terminate_all("server_shutdown").await;
    tokio::time::sleep(std::time::Duration::from_millis(250)).await;

    let _ = shutdown.send(());
    let _ = tokio::time::timeout(std::time::Duration::from_secs(5), server_task).await;
    admin.abort();
    queue_worker.abort();
    for task in controller_tasks {
        task.abort();
    }
    info!("Shutdown complete");
    Ok(())
}
