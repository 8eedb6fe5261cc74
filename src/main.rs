mod api;
mod config;
mod projects;
mod providers;
mod runs;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::Request;
use clap::Parser;
use dotenvy::dotenv;
use sentry::integrations::tower::{NewSentryLayer, SentryHttpLayer};
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::projects::file_repository::FileProjectRepository;
use crate::projects::repository::ProjectRepository;
use crate::providers::openai::OpenAiClient;
use crate::runs::manager::RunManager;
use crate::runs::session_store::SessionStore;

#[derive(Parser)]
#[command(name = "game-studio", about = "Runs the Codex agent against browser game projects")]
enum Cli {
    /// Start the HTTP server (default when no subcommand is given)
    #[command(alias = "run")]
    Serve {
        /// Listen on this port instead of $PORT
        #[arg(long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    dotenv().ok();

    // Default to Serve when no subcommand is given, but still allow
    // --help and --version to work.
    let args: Vec<String> = std::env::args().collect();
    let cli = if args.len() <= 1 {
        Cli::Serve { port: None }
    } else {
        Cli::parse()
    };

    match cli {
        Cli::Serve { port } => run_server(port).await,
    }
}

async fn run_server(port_override: Option<u16>) -> Result<(), Box<dyn Error>> {
    let config = config::Config::from_env();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("game_studio=info,tower_http=warn,hyper=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_tree::HierarchicalLayer::new(2).with_targets(true).with_bracketed_fields(false))
        .with(sentry::integrations::tracing::layer().event_filter(
            |metadata| match *metadata.level() {
                tracing::Level::ERROR => sentry::integrations::tracing::EventFilter::Event,
                tracing::Level::WARN | tracing::Level::INFO => {
                    sentry::integrations::tracing::EventFilter::Breadcrumb
                }
                _ => sentry::integrations::tracing::EventFilter::Ignore,
            },
        ))
        .init();

    let _guard = sentry::init((
        config.sentry_dsn.clone().unwrap_or_default(),
        sentry::ClientOptions {
            release: sentry::release_name!(),
            environment: Some(config.environment.clone().into()),
            send_default_pii: true,
            traces_sample_rate: 0.2,
            enable_logs: true,
            ..Default::default()
        },
    ));

    let http_client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(180))
        .build()
        .context("failed to build HTTP client")?;

    let file_projects = FileProjectRepository::new(&config.games_dir);
    file_projects
        .ensure_root()
        .with_context(|| format!("failed to create games dir {}", config.games_dir.display()))?;
    let projects: Arc<dyn ProjectRepository> = Arc::new(file_projects);

    let mut manager = RunManager::new(
        projects.clone(),
        SessionStore::new(&config.games_dir),
        &config.codex,
    )
    .with_retention(config.run_retention);

    match OpenAiClient::from_config(http_client, &config.openai) {
        Some(openai) => {
            let openai = Arc::new(openai);
            manager = manager
                .with_title_provider(openai.clone())
                .with_image_provider(openai);
        }
        None => tracing::info!("OPENAI_API_KEY not set, title and cover generation disabled"),
    }

    let manager = manager.start();

    let app_state = api::AppState {
        projects,
        runs: manager.clone(),
        games_dir: config.games_dir.clone(),
    };

    let app = api::create_app(app_state)
        .layer(SentryHttpLayer::new().enable_transaction())
        .layer(NewSentryLayer::<Request<Body>>::new_from_top());

    let port = port_override.unwrap_or(config.port);
    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(
        games_dir = %config.games_dir.display(),
        codex_bin = %config.codex.bin,
        event_schema = runs::events::EVENT_SCHEMA_VERSION,
        "game studio ready"
    );
    println!("Listening on http://{addr}");

    // Runs are cancelled and finished before the server drains, so open
    // event streams close on their `run_finished`.
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            manager.shutdown().await;
        })
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
