use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mailattrib_recon::{ReconConfig, Reconciler};
use mailattrib_shopify::{build_http_client, ShopifyClient};
use mailattrib_storage::{MemoryRepository, PgRepository, Repository};
use mailattrib_web::AppState;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "mailattrib")]
#[command(about = "Direct-mail revenue attribution service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the webhook/API server.
    Serve,
    /// Trigger a bulk order export for one user.
    Sync {
        #[arg(long)]
        user: Uuid,
    },
    /// Apply pending database migrations.
    Migrate,
}

fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env("MAILATTRIB_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn repository_from_env() -> Result<Arc<dyn Repository>> {
    match std::env::var("DATABASE_URL") {
        Ok(url) => {
            let repo = PgRepository::connect(&url)
                .await
                .context("connecting to DATABASE_URL")?;
            Ok(Arc::new(repo))
        }
        Err(_) => {
            info!("DATABASE_URL unset; using the in-memory repository");
            Ok(Arc::new(MemoryRepository::new()))
        }
    }
}

async fn reconciler_from_env() -> Result<Reconciler> {
    let config = ReconConfig::from_env();
    let repo = repository_from_env().await?;
    let http = build_http_client(config.http_timeout).context("building http client")?;
    Ok(Reconciler::new(
        repo,
        ShopifyClient::new(http, config.api_version.clone()),
        &config,
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let host = std::env::var("MAILATTRIB_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
            let port: u16 = std::env::var("MAILATTRIB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000);
            let reconciler = Arc::new(reconciler_from_env().await?);
            info!(%host, port, "serving webhook endpoints");
            mailattrib_web::serve(AppState::new(reconciler), &host, port).await?;
        }
        Commands::Sync { user } => {
            let reconciler = reconciler_from_env().await?;
            let operation_id = reconciler.trigger_bulk_export(user).await?;
            println!("bulk export started: user={user} operation_id={operation_id}");
        }
        Commands::Migrate => {
            let url =
                std::env::var("DATABASE_URL").context("DATABASE_URL must be set for migrate")?;
            let repo = PgRepository::connect(&url).await?;
            repo.migrate().await?;
            println!("migrations applied");
        }
    }

    Ok(())
}
