//! Lead persistence: the deduplicating save pipeline and the row-level updates
//! used by the workers and the HTTP layer.

use chrono::{DateTime, Utc};
use jobmon_core::{connect_score, AgencyLabel, Classification, JobLead, NewLead, STATUS_NEW};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::db::{Database, StorageError};

pub const MAX_LEAD_ID_LEN: usize = 50;

const LEAD_COLUMNS: &str = "id, source, external_id, title, description, url, budget, company, \
     posted_at, status, agency_match, match_score, ai_confidence, match_reasoning, scored, \
     applied, applied_at, applied_by, connect_score, client_signals, client_proposal, \
     client_plan, created_at";

/// Stable primary key for a lead, at most [`MAX_LEAD_ID_LEN`] bytes.
///
/// Short ids are `{source}_{external_id}` verbatim. Longer ones keep a prefix and
/// append a digest of the full string so distinct ids never share a truncation.
pub fn derive_lead_id(source: &str, external_id: &str) -> String {
    let composed = format!("{source}_{external_id}");
    if composed.len() <= MAX_LEAD_ID_LEN {
        return composed;
    }
    let digest = hex::encode(Sha256::digest(composed.as_bytes()));
    let suffix = &digest[..16];
    let mut cut = MAX_LEAD_ID_LEN - suffix.len() - 1;
    while !composed.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}-{}", &composed[..cut], suffix)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Inserted,
    Duplicate,
}

/// Lead entered by hand through the dashboard; it skips classification.
#[derive(Debug, Clone)]
pub struct ManualLead {
    pub title: String,
    pub description: String,
    pub agency_match: String,
    pub url: String,
    pub company: String,
}

#[derive(Debug, Clone, Default)]
pub struct ApplicationUpdate {
    pub agency_match: Option<String>,
    pub client_proposal: Option<String>,
    pub client_plan: Option<String>,
    pub applied_by: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct LeadRow {
    id: String,
    source: String,
    external_id: String,
    title: String,
    description: String,
    url: String,
    budget: String,
    company: String,
    posted_at: DateTime<Utc>,
    status: String,
    agency_match: Option<String>,
    match_score: i64,
    ai_confidence: f64,
    match_reasoning: Option<String>,
    scored: bool,
    applied: bool,
    applied_at: Option<DateTime<Utc>>,
    applied_by: Option<String>,
    connect_score: i64,
    client_signals: Option<String>,
    client_proposal: Option<String>,
    client_plan: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<LeadRow> for JobLead {
    fn from(row: LeadRow) -> Self {
        Self {
            id: row.id,
            source: row.source,
            external_id: row.external_id,
            title: row.title,
            description: row.description,
            url: row.url,
            budget: row.budget,
            company: row.company,
            posted_at: row.posted_at,
            status: row.status,
            agency_match: row.agency_match.map(AgencyLabel::from),
            match_score: row.match_score,
            ai_confidence: row.ai_confidence,
            match_reasoning: row.match_reasoning,
            scored: row.scored,
            applied: row.applied,
            applied_at: row.applied_at,
            applied_by: row.applied_by,
            connect_score: row.connect_score,
            client_signals: row
                .client_signals
                .and_then(|raw| serde_json::from_str(&raw).ok()),
            client_proposal: row.client_proposal,
            client_plan: row.client_plan,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LeadStore {
    db: Database,
}

impl LeadStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Insert a lead unless one with the same external id already exists.
    ///
    /// Returns `true` only for a fresh insert. Duplicates and failures both
    /// report `false`; failures are logged here and never reach the caller.
    pub async fn save_lead(&self, lead: &NewLead) -> bool {
        match self.try_save_lead(lead).await {
            Ok(SaveOutcome::Inserted) => true,
            Ok(SaveOutcome::Duplicate) => false,
            Err(err) => {
                warn!(
                    source = %lead.source,
                    external_id = %lead.external_id,
                    error = %err,
                    "save_lead failed"
                );
                false
            }
        }
    }

    pub async fn try_save_lead(&self, lead: &NewLead) -> Result<SaveOutcome, StorageError> {
        let exists_sql = self.db.sql("SELECT id FROM job_leads WHERE external_id = ?");
        let existing: Option<String> = sqlx::query_scalar(&exists_sql)
            .bind(&lead.external_id)
            .fetch_optional(self.db.reader())
            .await?;
        if existing.is_some() {
            return Ok(SaveOutcome::Duplicate);
        }

        let id = derive_lead_id(&lead.source, &lead.external_id);
        let now = Utc::now();
        let signals = lead.client_signals.as_ref().map(JsonValue::to_string);
        let connect = lead.client_signals.as_ref().map(connect_score).unwrap_or(0);

        let insert_sql = self.db.sql(
            r#"
            INSERT INTO job_leads (
                id, source, external_id, title, description, url,
                budget, company, posted_at, status, created_at,
                match_score, scored, connect_score, client_signals
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, 0, ?, ?)
            "#,
        );

        let mut scope = self.db.begin_write().await?;
        let inserted = sqlx::query(&insert_sql)
            .bind(&id)
            .bind(&lead.source)
            .bind(&lead.external_id)
            .bind(&lead.title)
            .bind(&lead.description)
            .bind(&lead.url)
            .bind(&lead.budget)
            .bind(&lead.company)
            .bind(lead.posted_at.unwrap_or(now))
            .bind(STATUS_NEW)
            .bind(now)
            .bind(connect)
            .bind(signals)
            .execute(scope.conn())
            .await;

        match inserted {
            Ok(_) => {
                scope.commit().await?;
                debug!(%id, "lead inserted");
                Ok(SaveOutcome::Inserted)
            }
            Err(err) => {
                let err = StorageError::from(err);
                if let Err(rollback_err) = scope.rollback().await {
                    warn!(%id, error = %rollback_err, "rolling back failed insert");
                }
                if err.is_unique_violation() {
                    debug!(%id, "lead lost insert race; treating as duplicate");
                    Ok(SaveOutcome::Duplicate)
                } else {
                    Err(err)
                }
            }
        }
    }

    /// The single lead the classification sweep should handle next, oldest first.
    pub async fn next_unscored(&self) -> Result<Option<JobLead>, StorageError> {
        let sql = format!(
            "SELECT {LEAD_COLUMNS} FROM job_leads WHERE scored = 0 AND description <> '' \
             ORDER BY created_at LIMIT 1"
        );
        let row: Option<LeadRow> = sqlx::query_as(&sql).fetch_optional(self.db.reader()).await?;
        Ok(row.map(JobLead::from))
    }

    pub async fn count_unscored(&self) -> Result<i64, StorageError> {
        let count = sqlx::query_scalar(
            "SELECT COUNT(*) FROM job_leads WHERE scored = 0 AND description <> ''",
        )
        .fetch_one(self.db.reader())
        .await?;
        Ok(count)
    }

    pub async fn record_classification(
        &self,
        id: &str,
        classification: &Classification,
    ) -> Result<bool, StorageError> {
        let sql = self.db.sql(
            "UPDATE job_leads SET agency_match = ?, match_score = ?, ai_confidence = ?, \
             match_reasoning = ?, scored = 1 WHERE id = ?",
        );
        let mut scope = self.db.begin_write().await?;
        let result = sqlx::query(&sql)
            .bind(classification.label.as_str())
            .bind(classification.score)
            .bind(classification.confidence)
            .bind(classification.reasoning.as_deref())
            .bind(id)
            .execute(scope.conn())
            .await?;
        scope.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get(&self, id: &str) -> Result<Option<JobLead>, StorageError> {
        let sql = self
            .db
            .sql(&format!("SELECT {LEAD_COLUMNS} FROM job_leads WHERE id = ?"));
        let row: Option<LeadRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(self.db.reader())
            .await?;
        Ok(row.map(JobLead::from))
    }

    /// Open leads, best match first.
    pub async fn list_new(&self) -> Result<Vec<JobLead>, StorageError> {
        let sql = self.db.sql(&format!(
            "SELECT {LEAD_COLUMNS} FROM job_leads WHERE status = ? \
             ORDER BY match_score DESC, posted_at DESC"
        ));
        let rows: Vec<LeadRow> = sqlx::query_as(&sql)
            .bind(STATUS_NEW)
            .fetch_all(self.db.reader())
            .await?;
        Ok(rows.into_iter().map(JobLead::from).collect())
    }

    pub async fn list_applied(&self) -> Result<Vec<JobLead>, StorageError> {
        let sql = format!(
            "SELECT {LEAD_COLUMNS} FROM job_leads WHERE applied = 1 ORDER BY applied_at DESC"
        );
        let rows: Vec<LeadRow> = sqlx::query_as(&sql).fetch_all(self.db.reader()).await?;
        Ok(rows.into_iter().map(JobLead::from).collect())
    }

    /// Attach client signals to a lead and recompute its connect score.
    pub async fn enrich(&self, external_id: &str, signals: &JsonValue) -> Result<bool, StorageError> {
        let sql = self.db.sql(
            "UPDATE job_leads SET client_signals = ?, connect_score = ? WHERE external_id = ?",
        );
        let mut scope = self.db.begin_write().await?;
        let result = sqlx::query(&sql)
            .bind(signals.to_string())
            .bind(connect_score(signals))
            .bind(external_id)
            .execute(scope.conn())
            .await?;
        scope.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn insert_manual(&self, lead: &ManualLead) -> Result<String, StorageError> {
        let now = Utc::now();
        let id = format!("manual_{}", now.timestamp_micros());
        let sql = self.db.sql(
            r#"
            INSERT INTO job_leads (
                id, source, external_id, title, description, url,
                budget, company, posted_at, status, created_at,
                match_score, ai_confidence, scored, agency_match
            ) VALUES (?, 'Manual Input', ?, ?, ?, ?, 'N/A', ?, ?, ?, ?, 100, 1.0, 1, ?)
            "#,
        );
        let mut scope = self.db.begin_write().await?;
        sqlx::query(&sql)
            .bind(&id)
            .bind(&id)
            .bind(&lead.title)
            .bind(&lead.description)
            .bind(&lead.url)
            .bind(&lead.company)
            .bind(now)
            .bind(STATUS_NEW)
            .bind(now)
            .bind(&lead.agency_match)
            .execute(scope.conn())
            .await?;
        scope.commit().await?;
        Ok(id)
    }

    pub async fn mark_applied(
        &self,
        id: &str,
        update: &ApplicationUpdate,
    ) -> Result<bool, StorageError> {
        let sql = self.db.sql(
            "UPDATE job_leads SET applied = 1, applied_at = ?, \
             agency_match = COALESCE(?, agency_match), applied_by = ?, \
             client_proposal = ?, client_plan = ? WHERE id = ?",
        );
        let mut scope = self.db.begin_write().await?;
        let result = sqlx::query(&sql)
            .bind(Utc::now())
            .bind(update.agency_match.as_deref())
            .bind(update.applied_by.as_deref())
            .bind(update.client_proposal.as_deref())
            .bind(update.client_plan.as_deref())
            .bind(id)
            .execute(scope.conn())
            .await?;
        scope.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn unmark_applied(&self, id: &str) -> Result<bool, StorageError> {
        let sql = self
            .db
            .sql("UPDATE job_leads SET applied = 0, applied_at = NULL WHERE id = ?");
        let mut scope = self.db.begin_write().await?;
        let result = sqlx::query(&sql).bind(id).execute(scope.conn()).await?;
        scope.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn save_draft(
        &self,
        id: &str,
        client_proposal: Option<&str>,
        client_plan: Option<&str>,
    ) -> Result<bool, StorageError> {
        let sql = self
            .db
            .sql("UPDATE job_leads SET client_proposal = ?, client_plan = ? WHERE id = ?");
        let mut scope = self.db.begin_write().await?;
        let result = sqlx::query(&sql)
            .bind(client_proposal)
            .bind(client_plan)
            .bind(id)
            .execute(scope.conn())
            .await?;
        scope.commit().await?;
        Ok(result.rows_affected() > 0)
    }
}
