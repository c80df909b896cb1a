use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::AtomicU32;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod classic;
mod config;
mod error;
mod events;
mod lite;
mod motd;
mod protocol;
mod reload;

use api::{ApiServer, ApiState};
use classic::ClassicServer;
use config::Config;
use events::{Event, EventBus, EventFilter, EventKind};
use lite::{LiteForwarder, StrategyManager};
use motd::MotdPassthrough;
use reload::ConfigService;

#[derive(Parser, Debug)]
#[command(name = "craftgate")]
#[command(about = "A Minecraft-edition reverse proxy")]
struct Args {
    #[arg(short, long, default_value = "config.yml")]
    config: String,

    #[arg(short, long)]
    validate_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting craftgate");

    let cfg = Config::load(&args.config).await?;

    if args.validate_config {
        info!("Configuration is valid");
        return Ok(());
    }

    let events = Arc::new(EventBus::new());
    let config_service = Arc::new(ConfigService::new(
        cfg.clone(),
        Some(PathBuf::from(&args.config)),
        events.clone(),
    ));
    let strategies = Arc::new(StrategyManager::new());
    let motd = Arc::new(MotdPassthrough::new());
    let active_players = Arc::new(AtomicU32::new(0));

    // reset caches and prune counters whenever the configuration is swapped
    {
        let mut subscription = events.subscribe(EventFilter::kinds([EventKind::ConfigUpdate]));
        let motd = motd.clone();
        let strategies = strategies.clone();
        tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                if let Event::ConfigUpdate { new, .. } = event {
                    motd.reset();
                    strategies.prune(&new);
                }
            }
        });
    }

    // Start the control-plane API if enabled
    if cfg.api.enabled {
        let api_server = ApiServer::new(
            cfg.api.bind.clone(),
            ApiState {
                config: config_service.clone(),
                events: events.clone(),
                strategies: strategies.clone(),
                motd: motd.clone(),
                active_players: active_players.clone(),
            },
        );
        tokio::spawn(async move {
            if let Err(e) = api_server.start().await {
                error!("API server error: {}", e);
            }
        });
    }

    // Start the main listener
    let listener = TcpListener::bind(&cfg.bind)
        .await
        .with_context(|| format!("Failed to bind to {}", cfg.bind))?;
    let bind_addr = listener
        .local_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| cfg.bind.clone());
    info!(
        "Listening on {} in {} mode",
        bind_addr,
        if cfg.lite.enabled { "lite" } else { "classic" }
    );

    let server_task = if cfg.lite.enabled {
        let forwarder = Arc::new(LiteForwarder::new(
            config_service.clone(),
            strategies.clone(),
        ));
        tokio::spawn(strategies.clone().run_latency_probes(config_service.clone()));
        tokio::spawn(forwarder.serve(listener))
    } else {
        let classic = Arc::new(ClassicServer::new(
            config_service.clone(),
            motd.clone(),
            events.clone(),
            active_players.clone(),
        ));
        tokio::spawn(classic.serve(listener))
    };

    events.publish(Event::Ready {
        bind_addr,
        lite: cfg.lite.enabled,
    });

    // Handle shutdown gracefully
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        _ = server_task => {
            error!("Main server task exited unexpectedly");
        }
    }

    events.publish(Event::Shutdown { reason: None });
    // give event subscribers a moment to drain
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    info!("craftgate shutdown complete");
    Ok(())
}
