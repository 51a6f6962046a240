//! Core domain model for the job lead monitor.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "jobmon-core";

pub const DEFAULT_BUDGET: &str = "N/A";
pub const DEFAULT_COMPANY: &str = "Unknown";
pub const STATUS_NEW: &str = "new";

/// Declared shape of a configured source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Rss,
    Api,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rss => "rss",
            Self::Api => "api",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "rss" => Some(Self::Rss),
            "api" => Some(Self::Api),
            _ => None,
        }
    }
}

/// A configured origin of postings, as stored in `job_sources`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSource {
    pub id: String,
    pub name: String,
    pub source_type: String,
    pub url: String,
    pub parsing_config: Option<String>,
    pub enabled: bool,
    pub last_checked: Option<DateTime<Utc>>,
}

impl JobSource {
    pub fn kind(&self) -> Option<SourceKind> {
        SourceKind::parse(&self.source_type)
    }
}

/// Per-source key mapping for generic JSON APIs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsingConfig {
    /// Dot-separated path to the item array. Empty means the payload root.
    #[serde(default)]
    pub root_key: String,
    #[serde(default = "default_id_key")]
    pub id_key: String,
    #[serde(default = "default_title_key")]
    pub title_key: String,
    #[serde(default = "default_desc_key")]
    pub desc_key: String,
    #[serde(default = "default_url_key")]
    pub url_key: String,
    #[serde(default = "default_company_key")]
    pub company_key: String,
}

fn default_id_key() -> String {
    "id".to_string()
}

fn default_title_key() -> String {
    "title".to_string()
}

fn default_desc_key() -> String {
    "description".to_string()
}

fn default_url_key() -> String {
    "url".to_string()
}

fn default_company_key() -> String {
    "company".to_string()
}

impl Default for ParsingConfig {
    fn default() -> Self {
        Self {
            root_key: String::new(),
            id_key: default_id_key(),
            title_key: default_title_key(),
            desc_key: default_desc_key(),
            url_key: default_url_key(),
            company_key: default_company_key(),
        }
    }
}

impl ParsingConfig {
    /// Parse the raw `parsing_config` column. Missing or blank text yields the defaults.
    pub fn from_json(raw: Option<&str>) -> Result<Self, serde_json::Error> {
        match raw.map(str::trim) {
            None | Some("") => Ok(Self::default()),
            Some(text) => serde_json::from_str(text),
        }
    }

    pub fn root_path(&self) -> Vec<&str> {
        self.root_key
            .split('.')
            .map(str::trim)
            .filter(|segment| !segment.is_empty())
            .collect()
    }
}

/// Normalized lead record handed from fetchers and the ingest endpoint to the save pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewLead {
    pub source: String,
    pub external_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_budget")]
    pub budget: String,
    #[serde(default = "default_company")]
    pub company: String,
    #[serde(default)]
    pub posted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub client_signals: Option<JsonValue>,
}

fn default_budget() -> String {
    DEFAULT_BUDGET.to_string()
}

fn default_company() -> String {
    DEFAULT_COMPANY.to_string()
}

impl NewLead {
    pub fn new(
        source: impl Into<String>,
        external_id: impl Into<String>,
        title: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            external_id: external_id.into(),
            title: title.into(),
            description: String::new(),
            url: String::new(),
            budget: default_budget(),
            company: default_company(),
            posted_at: None,
            client_signals: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_company(mut self, company: impl Into<String>) -> Self {
        self.company = company.into();
        self
    }
}

/// Outcome label of a classification.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum AgencyLabel {
    Agency(String),
    Reject,
    Unassigned,
}

impl AgencyLabel {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Agency(key) => key,
            Self::Reject => "reject",
            Self::Unassigned => "unassigned",
        }
    }

    pub fn agency_key(&self) -> Option<&str> {
        match self {
            Self::Agency(key) => Some(key),
            _ => None,
        }
    }
}

impl From<String> for AgencyLabel {
    fn from(value: String) -> Self {
        match value.as_str() {
            "reject" => Self::Reject,
            "unassigned" => Self::Unassigned,
            _ => Self::Agency(value),
        }
    }
}

impl From<AgencyLabel> for String {
    fn from(value: AgencyLabel) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for AgencyLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub label: AgencyLabel,
    pub confidence: f64,
    pub score: i64,
    pub reasoning: Option<String>,
}

impl Classification {
    pub fn rejected() -> Self {
        Self {
            label: AgencyLabel::Reject,
            confidence: 1.0,
            score: 0,
            reasoning: None,
        }
    }

    pub fn unassigned() -> Self {
        Self {
            label: AgencyLabel::Unassigned,
            confidence: 0.0,
            score: 0,
            reasoning: None,
        }
    }

    pub fn as_tuple(&self) -> (&str, f64, i64) {
        (self.label.as_str(), self.confidence, self.score)
    }
}

/// Persisted lead row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobLead {
    pub id: String,
    pub source: String,
    pub external_id: String,
    pub title: String,
    pub description: String,
    pub url: String,
    pub budget: String,
    pub company: String,
    pub posted_at: DateTime<Utc>,
    pub status: String,
    pub agency_match: Option<AgencyLabel>,
    pub match_score: i64,
    pub ai_confidence: f64,
    pub match_reasoning: Option<String>,
    pub scored: bool,
    pub applied: bool,
    pub applied_at: Option<DateTime<Utc>>,
    pub applied_by: Option<String>,
    pub connect_score: i64,
    pub client_signals: Option<JsonValue>,
    pub client_proposal: Option<String>,
    pub client_plan: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl JobLead {
    pub fn awaiting_classification(&self) -> bool {
        !self.scored && !self.description.is_empty()
    }
}

/// Heuristic client quality score derived from scraped client signals.
pub fn connect_score(signals: &JsonValue) -> i64 {
    let mut score = 0;
    if signals
        .get("payment_verified")
        .map(is_truthy)
        .unwrap_or(false)
    {
        score += 15;
    }
    if signals
        .get("client_spent")
        .and_then(JsonValue::as_f64)
        .unwrap_or(0.0)
        > 10_000.0
    {
        score += 20;
    }
    if signals
        .get("hire_rate")
        .and_then(JsonValue::as_f64)
        .unwrap_or(0.0)
        > 50.0
    {
        score += 15;
    }
    if signals
        .get("proposal_count")
        .and_then(JsonValue::as_f64)
        .unwrap_or(99.0)
        < 5.0
    {
        score += 20;
    }
    score
}

fn is_truthy(value: &JsonValue) -> bool {
    match value {
        JsonValue::Bool(b) => *b,
        JsonValue::Number(n) => n.as_f64().map(|v| v != 0.0).unwrap_or(false),
        JsonValue::String(s) => !s.is_empty(),
        JsonValue::Array(a) => !a.is_empty(),
        JsonValue::Object(o) => !o.is_empty(),
        JsonValue::Null => false,
    }
}
