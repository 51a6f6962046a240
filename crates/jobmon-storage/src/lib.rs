//! Single-writer persistence gateway, lead/source stores and HTTP fetch utilities.

mod db;
mod http;
mod leads;
mod sources;

pub use db::{Database, DatabaseUrl, DbConfig, Dialect, StorageError, WriteScope};
pub use http::{
    classify_reqwest_error, classify_status, retry, BackoffCurve, BackoffPolicy, FetchError,
    FetchedResponse, HttpClientConfig, HttpFetcher, RetryDisposition,
};
pub use leads::{derive_lead_id, ApplicationUpdate, LeadStore, ManualLead, SaveOutcome, MAX_LEAD_ID_LEN};
pub use sources::{default_sources, SourceStore};

pub const CRATE_NAME: &str = "jobmon-storage";

/// Connect, create the schema and seed default sources.
pub async fn open_and_prepare(url: &str, config: DbConfig) -> anyhow::Result<Database> {
    use anyhow::Context;

    let db = Database::connect(url, config)
        .await
        .with_context(|| format!("connecting to {url}"))?;
    db.init_schema().await.context("creating schema")?;
    SourceStore::new(db.clone())
        .seed_defaults()
        .await
        .context("seeding job sources")?;
    Ok(db)
}
