//! Fetch orchestration, background workers and scheduling.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use async_stream::stream;
use futures::{Stream, StreamExt};
use jobmon_adapters::{fetcher_for_source, AdapterError};
use jobmon_core::JobSource;
use jobmon_storage::{DbConfig, HttpClientConfig, HttpFetcher, LeadStore, SourceStore};
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

mod notify;
mod workers;

pub use notify::{DiscordNotifier, LeadNotifier, DEFAULT_EMBED_COLOR};
pub use workers::{
    ingest_queue, run_ingest_worker, ClassificationWorker, IngestQueue, IngestReceiver, SweepOutcome,
};

pub const CRATE_NAME: &str = "jobmon-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub db_busy_timeout: Duration,
    pub workspace_root: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub ingest_throttle: Duration,
    pub classify_busy: Duration,
    pub classify_idle: Duration,
    pub scheduler_enabled: bool,
    pub fetch_cron: String,
    pub discord_webhook_url: Option<String>,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let millis = |name: &str, default: u64| {
            Duration::from_millis(
                std::env::var(name)
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(default),
            )
        };

        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:data/jobs.db".to_string()),
            db_busy_timeout: Duration::from_secs(
                std::env::var("DB_BUSY_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(30),
            ),
            workspace_root: std::env::var("JOBMON_WORKSPACE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
            user_agent: std::env::var("JOBMON_USER_AGENT")
                .unwrap_or_else(|_| "Mozilla/5.0 (compatible; jobmon/0.1)".to_string()),
            http_timeout_secs: std::env::var("JOBMON_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(15),
            ingest_throttle: millis("INGEST_THROTTLE_MS", 500),
            classify_busy: millis("CLASSIFY_BUSY_MS", 1_000),
            classify_idle: millis("CLASSIFY_IDLE_MS", 5_000),
            scheduler_enabled: std::env::var("JOBMON_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            fetch_cron: std::env::var("FETCH_CRON").unwrap_or_else(|_| "0 */30 * * * *".to_string()),
            discord_webhook_url: std::env::var("DISCORD_WEBHOOK_URL")
                .ok()
                .filter(|v| !v.trim().is_empty()),
        }
    }

    pub fn db_config(&self) -> DbConfig {
        DbConfig {
            busy_timeout: self.db_busy_timeout,
            ..DbConfig::default()
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..HttpClientConfig::default()
        }
    }
}

/// Progress notification emitted while a fetch run is in flight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SyncEvent {
    Progress { percent: u8, message: String },
    Log { message: String },
    Error { message: String },
    Done { new_leads: usize },
}

impl fmt::Display for SyncEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Progress { percent, message } => write!(f, "progress:{percent}:{message}"),
            Self::Log { message } => write!(f, "log:{message}"),
            Self::Error { message } => write!(f, "error:{message}"),
            Self::Done { new_leads } => write!(f, "done:{new_leads}"),
        }
    }
}

async fn fetch_source(source: &JobSource, leads: &LeadStore, http: &HttpFetcher) -> Result<usize, AdapterError> {
    let fetcher = fetcher_for_source(source)?;
    let fetched = fetcher.fetch_leads(http).await?;
    let mut inserted = 0;
    for lead in &fetched {
        if leads.save_lead(lead).await {
            inserted += 1;
        }
    }
    info!(fetched = fetched.len(), inserted, "source processed");
    Ok(inserted)
}

/// Fetch every enabled source in turn, saving new leads as they arrive.
///
/// Nothing runs until the stream is polled. A failing source is reported as an
/// [`SyncEvent::Error`] and the run moves on to the next one.
pub fn run_all_fetchers(
    sources: SourceStore,
    leads: LeadStore,
    http: HttpFetcher,
) -> impl Stream<Item = SyncEvent> + Send + 'static {
    stream! {
        let run_id = Uuid::new_v4();
        let enabled = match sources.enabled_sources().await {
            Ok(enabled) => enabled,
            Err(err) => {
                error!(%run_id, error = %err, "listing job sources failed");
                yield SyncEvent::Error { message: format!("Failed to load sources: {err}") };
                yield SyncEvent::Done { new_leads: 0 };
                return;
            }
        };

        let total = enabled.len();
        info!(%run_id, sources = total, "fetch run started");
        yield SyncEvent::Progress {
            percent: 0,
            message: format!("Starting fetch for {total} sources..."),
        };

        let mut total_new = 0;
        for (index, source) in enabled.iter().enumerate() {
            let span = info_span!("fetch_source", %run_id, source = %source.name);
            match fetch_source(source, &leads, &http).instrument(span).await {
                Ok(count) => {
                    total_new += count;
                    yield SyncEvent::Log { message: format!("Fetched {count} from {}", source.name) };
                }
                Err(err) => {
                    warn!(%run_id, source = %source.name, error = %err, "source failed");
                    yield SyncEvent::Error { message: format!("Failed {}: {err}", source.name) };
                }
            }
            if let Err(err) = sources.touch(&source.id).await {
                warn!(source = %source.id, error = %err, "updating last_checked failed");
            }
            let percent = ((index + 1) * 100 / total) as u8;
            yield SyncEvent::Progress { percent, message: "Processing...".to_string() };
        }

        info!(%run_id, new_leads = total_new, "fetch run finished");
        yield SyncEvent::Done { new_leads: total_new };
    }
}

/// Drain a fetch run, returning the number of new leads.
pub async fn run_fetch_to_completion(sources: SourceStore, leads: LeadStore, http: HttpFetcher) -> usize {
    let events = run_all_fetchers(sources, leads, http);
    futures::pin_mut!(events);
    let mut new_leads = 0;
    while let Some(event) = events.next().await {
        if let SyncEvent::Done { new_leads: n } = event {
            new_leads = n;
        }
    }
    new_leads
}

/// Cron-driven fetch runs, when enabled in `config`.
pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    sources: SourceStore,
    leads: LeadStore,
    http: HttpFetcher,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = &config.fetch_cron;
    let job = Job::new_async(cron, move |_uuid, _lock| {
        let sources = sources.clone();
        let leads = leads.clone();
        let http = http.clone();
        Box::pin(async move {
            let new_leads = run_fetch_to_completion(sources, leads, http).await;
            info!(new_leads, "scheduled fetch complete");
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobmon_storage::{Database, DbConfig};
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn stores(sources: &[JobSource]) -> (TempDir, SourceStore, LeadStore) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}", dir.path().join("jobs.db").display());
        let db = Database::connect(&url, DbConfig::default()).await.unwrap();
        db.init_schema().await.unwrap();
        let source_store = SourceStore::new(db.clone());
        source_store.seed(sources).await.unwrap();
        (dir, source_store, LeadStore::new(db))
    }

    fn source(id: &str, kind: &str, url: &str, parsing_config: Option<&str>) -> JobSource {
        JobSource {
            id: id.to_string(),
            name: format!("{id} board"),
            source_type: kind.to_string(),
            url: url.to_string(),
            parsing_config: parsing_config.map(ToString::to_string),
            enabled: true,
            last_checked: None,
        }
    }

    fn http() -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(5),
            ..HttpClientConfig::default()
        })
        .unwrap()
    }

    /// Serve `body` as JSON to every connection on an ephemeral port.
    async fn serve_json(body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else { break };
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    let _ = socket.read(&mut buf).await;
                    let response = format!(
                        "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        format!("http://{addr}/jobs")
    }

    async fn collect(sources: SourceStore, leads: LeadStore) -> Vec<String> {
        run_all_fetchers(sources, leads, http())
            .map(|event| event.to_string())
            .collect()
            .await
    }

    #[test]
    fn events_render_as_protocol_lines() {
        let progress = SyncEvent::Progress {
            percent: 50,
            message: "Processing...".into(),
        };
        assert_eq!(progress.to_string(), "progress:50:Processing...");
        assert_eq!(SyncEvent::Log { message: "hi".into() }.to_string(), "log:hi");
        assert_eq!(SyncEvent::Error { message: "bad".into() }.to_string(), "error:bad");
        assert_eq!(SyncEvent::Done { new_leads: 3 }.to_string(), "done:3");
    }

    #[tokio::test]
    async fn fetch_run_saves_new_leads_once() {
        let url = serve_json(
            r#"{"data": {"jobs": [
                {"id": 1, "title": "Growth marketer", "description": "Own the funnel"},
                {"id": 2, "title": "Fractional CMO", "description": "Strategy"},
                {"title": "No id"}
            ]}}"#,
        )
        .await;
        let config = r#"{"root_key": "data.jobs"}"#;
        let (_dir, sources, leads) = stores(&[source("board", "api", &url, Some(config))]).await;

        let lines = collect(sources.clone(), leads.clone()).await;
        assert_eq!(
            lines,
            vec![
                "progress:0:Starting fetch for 1 sources...",
                "log:Fetched 2 from board board",
                "progress:100:Processing...",
                "done:2",
            ]
        );
        assert_eq!(leads.count_unscored().await.unwrap(), 2);

        let lines = collect(sources.clone(), leads.clone()).await;
        assert_eq!(lines[1], "log:Fetched 0 from board board");
        assert_eq!(lines.last().unwrap(), "done:0");

        let touched = sources.enabled_sources().await.unwrap();
        assert!(touched[0].last_checked.is_some());
    }

    #[tokio::test]
    async fn failing_source_does_not_stop_the_run() {
        let url = serve_json(r#"[{"id": "x1", "title": "Designer"}]"#).await;
        let (_dir, sources, leads) = stores(&[
            source("a_broken", "scrape", "https://example.invalid", None),
            source("b_working", "api", &url, None),
        ])
        .await;

        let lines = collect(sources, leads).await;
        assert_eq!(lines.len(), 6);
        assert_eq!(lines[0], "progress:0:Starting fetch for 2 sources...");
        assert!(lines[1].starts_with("error:Failed a_broken board: unsupported source type"));
        assert_eq!(lines[2], "progress:50:Processing...");
        assert_eq!(lines[3], "log:Fetched 1 from b_working board");
        assert_eq!(lines[4], "progress:100:Processing...");
        assert_eq!(lines[5], "done:1");
    }

    #[tokio::test]
    async fn unreadable_source_table_ends_the_run() {
        let (_dir, sources, leads) = stores(&[]).await;
        leads.database().close().await;
        let lines = collect(sources, leads).await;
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("error:Failed to load sources"));
        assert_eq!(lines[1], "done:0");
    }

    #[tokio::test]
    async fn scheduler_only_built_when_enabled() {
        let (_dir, sources, leads) = stores(&[]).await;
        let mut config = SyncConfig::from_env();
        config.scheduler_enabled = false;
        assert!(maybe_build_scheduler(&config, sources.clone(), leads.clone(), http())
            .await
            .unwrap()
            .is_none());

        config.scheduler_enabled = true;
        config.fetch_cron = "0 */30 * * * *".to_string();
        assert!(maybe_build_scheduler(&config, sources.clone(), leads.clone(), http())
            .await
            .unwrap()
            .is_some());

        config.fetch_cron = "not a cron".to_string();
        assert!(maybe_build_scheduler(&config, sources, leads, http()).await.is_err());
    }
}
