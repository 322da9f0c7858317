use aikg_sync::{AikgRuntime, AppConfig};
use aikg_web::AppState;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "aikg")]
#[command(about = "AI Knowledge Gazette scheduler and admin API")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run every scheduler plus the admin API until Ctrl-C.
    Serve,
    /// Scrape every eligible website once and wait for the batches to land.
    ScrapeOnce,
    /// Zero every website's daily retry counter.
    ResetRetries,
    /// Generate one issue and mail it to a single address.
    SendTest {
        #[arg(long)]
        area: String,
        #[arg(long)]
        reader: String,
        #[arg(long)]
        email: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,aikg_sync=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = AppConfig::from_env().context("loading configuration")?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await?,
        Commands::ScrapeOnce => {
            let summary = AikgRuntime::from_config(config).await?.scrape_once().await?;
            println!(
                "scrape complete: run_id={} websites={} batches={} articles={}",
                summary.run_id, summary.websites_scraped, summary.batches, summary.articles_created
            );
        }
        Commands::ResetRetries => {
            let runtime = AikgRuntime::from_config(config).await?;
            let reset = runtime.scraper.reset_trigger().await?;
            println!("retry counters reset: websites={reset}");
        }
        Commands::SendTest {
            area,
            reader,
            email,
        } => {
            let runtime = AikgRuntime::from_config(config).await?;
            let content = runtime.sender.send_to(&area, &reader, &email).await?;
            println!(
                "sent to {email}: subject={:?} style={}",
                content.subject, content.style
            );
        }
    }

    Ok(())
}

async fn serve(config: AppConfig) -> Result<()> {
    let bind = config.bind_addr.clone();
    let runtime = AikgRuntime::from_config(config).await?;
    runtime.start().await.context("starting schedulers")?;
    info!("schedulers started");

    let served = aikg_web::serve(AppState::from_runtime(&runtime), &bind, async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = ?err, "ctrl-c listener failed");
        }
        info!("shutdown requested");
    })
    .await;

    runtime.shutdown().await?;
    served
}
