use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use jobmon_ai::{AiClient, AiConfig, ClassificationPolicy, ResponseMode};
use jobmon_storage::{open_and_prepare, Database, HttpFetcher, LeadStore, SourceStore};
use jobmon_sync::{
    ingest_queue, maybe_build_scheduler, run_all_fetchers, run_ingest_worker, ClassificationWorker,
    DiscordNotifier, SyncConfig,
};
use jobmon_web::AppState;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "jobmon")]
#[command(about = "Job lead monitor: ingest, dedup and classify job postings")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP API with the ingest and classification workers.
    Serve,
    /// Fetch every enabled source once, printing progress lines.
    Fetch,
    /// Classify a single posting and print the result.
    Classify {
        title: String,
        #[arg(default_value = "")]
        description: String,
    },
    /// Send a free-text prompt to the configured model.
    Ask { prompt: String },
    /// Create the schema and seed default sources.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("jobmon=info".parse()?))
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await?,
        Commands::Fetch => {
            let db = open_database(&config).await?;
            let http = HttpFetcher::new(config.http_client_config())?;
            let events = run_all_fetchers(SourceStore::new(db.clone()), LeadStore::new(db.clone()), http);
            futures::pin_mut!(events);
            while let Some(event) = events.next().await {
                println!("{event}");
            }
            db.close().await;
        }
        Commands::Classify { title, description } => {
            let (ai, policy) = classifier(&config)?;
            let result = policy.classify(&ai, &title, &description).await;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Ask { prompt } => {
            let ai = AiClient::from_config(&AiConfig::from_env())?;
            println!("{}", ai.generate(&prompt, ResponseMode::Text).await);
        }
        Commands::Migrate => {
            let db = open_database(&config).await?;
            println!("schema ready: {}", config.database_url);
            db.close().await;
        }
    }

    Ok(())
}

async fn open_database(config: &SyncConfig) -> Result<Database> {
    open_and_prepare(&config.database_url, config.db_config()).await
}

fn classifier(config: &SyncConfig) -> Result<(AiClient, Arc<ClassificationPolicy>)> {
    let ai_config = AiConfig::from_env();
    let ai = AiClient::from_config(&ai_config)?;
    let policy = ClassificationPolicy::from_workspace_root(&config.workspace_root)?
        .with_model(ai_config.classify_model.clone());
    Ok((ai, Arc::new(policy)))
}

async fn serve(config: SyncConfig) -> Result<()> {
    let db = open_database(&config).await?;
    let leads = LeadStore::new(db.clone());
    let sources = SourceStore::new(db.clone());
    let http = HttpFetcher::new(config.http_client_config())?;
    let (ai, policy) = classifier(&config)?;
    info!(keys = ai.key_count(), model = ai.model(), "ai client ready");

    let (ingest, receiver) = ingest_queue();
    tokio::spawn(run_ingest_worker(receiver, leads.clone(), config.ingest_throttle));

    let mut sweep = ClassificationWorker::new(leads.clone(), ai.clone(), policy.clone())
        .with_pauses(config.classify_busy, config.classify_idle);
    if let Some(url) = &config.discord_webhook_url {
        sweep = sweep.with_notifier(Arc::new(DiscordNotifier::new(url.clone())));
    }
    tokio::spawn(sweep.run());

    let scheduler = maybe_build_scheduler(&config, sources.clone(), leads.clone(), http.clone()).await?;
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting scheduler")?;
        info!(cron = %config.fetch_cron, "fetch scheduler started");
    }

    let port: u16 = std::env::var("JOBMON_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let state = AppState {
        leads,
        sources,
        http,
        ingest,
        ai,
        policy,
        api_key: std::env::var("API_KEY").ok().filter(|v| !v.is_empty()),
    };

    tokio::select! {
        result = jobmon_web::serve(state, port) => result?,
        _ = tokio::signal::ctrl_c() => info!("shutdown requested"),
    }
    db.close().await;
    Ok(())
}
