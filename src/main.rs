use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

use channel_relay::config::Config;
use channel_relay::discord::DiscordClient;
use channel_relay::links::{FileLinkDirectory, LinkDirectory, PgLinkDirectory};
use channel_relay::metrics::RelayMetrics;
use channel_relay::quota::HttpQuotaService;
use channel_relay::scheduler;
use channel_relay::server::{self, AppState};
use channel_relay::translate::GoogleWebTranslator;
use channel_relay::{RelayDeps, RelayPipeline};

async fn open_link_directory(config: &Config) -> Result<Arc<dyn LinkDirectory>> {
    if let Some(url) = &config.database_url {
        let directory = PgLinkDirectory::connect(url)
            .await
            .context("Failed to connect to the link database")?;
        return Ok(Arc::new(directory));
    }

    let path = config
        .links_file
        .as_deref()
        .context("Either DATABASE_URL or LINKS_FILE must be set")?;
    let directory = FileLinkDirectory::open(path)
        .with_context(|| format!("Failed to open links file {}", path))?;
    Ok(Arc::new(directory))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("channel_relay=info".parse()?),
        )
        .init();

    info!("Starting channel relay");

    let config = Arc::new(Config::from_env()?);
    info!(
        "Event mode: {}, provider cap {}/s (burst {}), concurrency {}",
        config.event_mode, config.provider_rate_cap, config.provider_burst, config.concurrency
    );

    let links = open_link_directory(&config).await?;
    let quota = HttpQuotaService::from_config(&config).context("Failed to build quota client")?;
    let platform = DiscordClient::from_config(&config).context("Failed to build platform client")?;
    let provider = GoogleWebTranslator::from_config(&config).context("Failed to build translator")?;

    let pipeline = Arc::new(RelayPipeline::new(
        &config,
        RelayDeps {
            links,
            quota: Arc::new(quota),
            platform: Arc::new(platform),
            provider: Arc::new(provider),
            metrics: Arc::new(RelayMetrics::new()),
        },
    ));

    let _scheduler = scheduler::start_scheduler(Arc::clone(&config), Arc::clone(&pipeline)).await?;

    server::run_server(AppState { config, pipeline }).await?;

    info!("Channel relay stopped");
    Ok(())
}
