//! Configured job sources.

use chrono::{DateTime, Utc};
use jobmon_core::{JobSource, SourceKind};
use serde_json::json;
use tracing::info;

use crate::db::{Database, StorageError};

#[derive(Debug, sqlx::FromRow)]
struct SourceRow {
    id: String,
    name: String,
    source_type: String,
    url: String,
    parsing_config: Option<String>,
    enabled: bool,
    last_checked: Option<DateTime<Utc>>,
}

impl From<SourceRow> for JobSource {
    fn from(row: SourceRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            source_type: row.source_type,
            url: row.url,
            parsing_config: row.parsing_config,
            enabled: row.enabled,
            last_checked: row.last_checked,
        }
    }
}

/// Sources inserted into an empty `job_sources` table on first start.
pub fn default_sources() -> Vec<JobSource> {
    let source = |id: &str, name: &str, kind: SourceKind, url: &str, config: serde_json::Value| JobSource {
        id: id.to_string(),
        name: name.to_string(),
        source_type: kind.as_str().to_string(),
        url: url.to_string(),
        parsing_config: Some(config.to_string()),
        enabled: true,
        last_checked: None,
    };

    vec![
        source(
            "wwr_marketing",
            "We Work Remotely - Marketing",
            SourceKind::Rss,
            "https://weworkremotely.com/categories/remote-sales-and-marketing-jobs.rss",
            json!({}),
        ),
        source(
            "wwr_design",
            "We Work Remotely - Design",
            SourceKind::Rss,
            "https://weworkremotely.com/categories/remote-design-jobs.rss",
            json!({}),
        ),
        source(
            "freelancer_api",
            "Freelancer.com (Python/Marketing)",
            SourceKind::Api,
            "https://www.freelancer.com/api/projects/0.1/projects/active?compact=true&limit=20&query=python%20marketing",
            json!({
                "root_key": "result.projects",
                "id_key": "id",
                "title_key": "title",
                "desc_key": "preview_description",
                "url_key": "seo_url",
                "company_key": "owner_id"
            }),
        ),
        source(
            "remoteok",
            "RemoteOK (Python)",
            SourceKind::Api,
            "https://remoteok.com/api?tag=python",
            json!({"root_key": "", "title_key": "position"}),
        ),
    ]
}

#[derive(Debug, Clone)]
pub struct SourceStore {
    db: Database,
}

impl SourceStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn enabled_sources(&self) -> Result<Vec<JobSource>, StorageError> {
        let rows: Vec<SourceRow> = sqlx::query_as(
            "SELECT id, name, type AS source_type, url, parsing_config, enabled, last_checked \
             FROM job_sources WHERE enabled = 1 ORDER BY id",
        )
        .fetch_all(self.db.reader())
        .await?;
        Ok(rows.into_iter().map(JobSource::from).collect())
    }

    pub async fn touch(&self, id: &str) -> Result<(), StorageError> {
        let sql = self.db.sql("UPDATE job_sources SET last_checked = ? WHERE id = ?");
        let mut scope = self.db.begin_write().await?;
        sqlx::query(&sql)
            .bind(Utc::now())
            .bind(id)
            .execute(scope.conn())
            .await?;
        scope.commit().await
    }

    /// Seed [`default_sources`] when the table is empty. Returns the number inserted.
    pub async fn seed_defaults(&self) -> Result<usize, StorageError> {
        self.seed(&default_sources()).await
    }

    pub async fn seed(&self, sources: &[JobSource]) -> Result<usize, StorageError> {
        let insert_sql = self.db.sql(
            "INSERT INTO job_sources (id, name, type, url, parsing_config, enabled) \
             VALUES (?, ?, ?, ?, ?, ?)",
        );
        let mut scope = self.db.begin_write().await?;
        let existing: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM job_sources")
            .fetch_one(scope.conn())
            .await?;
        if existing > 0 {
            return Ok(0);
        }
        for source in sources {
            sqlx::query(&insert_sql)
                .bind(&source.id)
                .bind(&source.name)
                .bind(&source.source_type)
                .bind(&source.url)
                .bind(source.parsing_config.as_deref())
                .bind(source.enabled)
                .execute(scope.conn())
                .await?;
        }
        scope.commit().await?;
        info!(count = sources.len(), "seeded job sources");
        Ok(sources.len())
    }
}
