//! Source fetchers: syndication feeds and generic JSON APIs normalized into [`NewLead`]s.

use async_trait::async_trait;
use jobmon_core::{JobSource, NewLead, ParsingConfig, SourceKind, DEFAULT_BUDGET, DEFAULT_COMPANY};
use jobmon_storage::{FetchError, HttpFetcher};
use scraper::Html;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "jobmon-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("feed parse error: {0}")]
    Feed(#[from] feed_rs::parser::ParseFeedError),
    #[error("invalid parsing_config: {0}")]
    Config(#[from] serde_json::Error),
    #[error("unsupported source type {0:?}")]
    UnsupportedType(String),
}

#[async_trait]
pub trait SourceFetcher: Send + Sync {
    fn source(&self) -> &JobSource;

    async fn fetch_leads(&self, http: &HttpFetcher) -> Result<Vec<NewLead>, AdapterError>;
}

pub fn fetcher_for_source(source: &JobSource) -> Result<Box<dyn SourceFetcher>, AdapterError> {
    match source.kind() {
        Some(SourceKind::Rss) => Ok(Box::new(RssFetcher::new(source.clone()))),
        Some(SourceKind::Api) => Ok(Box::new(ApiFetcher::new(source.clone())?)),
        None => Err(AdapterError::UnsupportedType(source.source_type.clone())),
    }
}

/// Best-guess employer from a posting title: `"Acme: Role"` or `"Role at Acme"`.
pub fn extract_company(title: &str) -> String {
    let guess = if let Some((company, _)) = title.split_once(':') {
        company.trim()
    } else if let Some((_, company)) = title.rsplit_once(" at ") {
        company.trim()
    } else {
        ""
    };
    if guess.is_empty() {
        DEFAULT_COMPANY.to_string()
    } else {
        guess.to_string()
    }
}

/// Flatten an HTML fragment to whitespace-normalized text.
pub fn html_to_text(fragment: &str) -> String {
    let text = if fragment.contains('<') {
        Html::parse_fragment(fragment)
            .root_element()
            .text()
            .collect::<Vec<_>>()
            .join(" ")
    } else {
        fragment.to_string()
    };
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[derive(Debug, Clone)]
pub struct RssFetcher {
    source: JobSource,
}

impl RssFetcher {
    pub fn new(source: JobSource) -> Self {
        Self { source }
    }

    pub fn parse_feed(&self, bytes: &[u8]) -> Result<Vec<NewLead>, AdapterError> {
        // Entries without a guid take their first link as id rather than a generated hash.
        let feed = feed_rs::parser::Builder::new()
            .id_generator(|links, _title, _uri| links.first().map(|l| l.href.clone()).unwrap_or_default())
            .build()
            .parse(bytes)?;
        let leads = feed
            .entries
            .into_iter()
            .filter_map(|entry| {
                let link = entry.links.first().map(|l| l.href.clone()).unwrap_or_default();
                let external_id = if entry.id.trim().is_empty() {
                    link.clone()
                } else {
                    entry.id.trim().to_string()
                };
                if external_id.is_empty() {
                    debug!(source = %self.source.name, "feed entry without id or link skipped");
                    return None;
                }
                let title = entry
                    .title
                    .map(|t| t.content.trim().to_string())
                    .unwrap_or_default();
                let description = entry
                    .summary
                    .map(|s| s.content)
                    .filter(|s| !s.trim().is_empty())
                    .or_else(|| entry.content.and_then(|c| c.body))
                    .map(|html| html_to_text(&html))
                    .unwrap_or_default();

                Some(NewLead {
                    source: self.source.name.clone(),
                    external_id,
                    company: extract_company(&title),
                    title,
                    description,
                    url: link,
                    budget: DEFAULT_BUDGET.to_string(),
                    posted_at: entry.published.or(entry.updated),
                    client_signals: None,
                })
            })
            .collect();
        Ok(leads)
    }
}

#[async_trait]
impl SourceFetcher for RssFetcher {
    fn source(&self) -> &JobSource {
        &self.source
    }

    async fn fetch_leads(&self, http: &HttpFetcher) -> Result<Vec<NewLead>, AdapterError> {
        let response = http.fetch_bytes(&self.source.name, &self.source.url).await?;
        self.parse_feed(&response.body)
    }
}

#[derive(Debug, Clone)]
pub struct ApiFetcher {
    source: JobSource,
    config: ParsingConfig,
}

impl ApiFetcher {
    pub fn new(source: JobSource) -> Result<Self, AdapterError> {
        let config = ParsingConfig::from_json(source.parsing_config.as_deref())?;
        Ok(Self { source, config })
    }

    pub fn config(&self) -> &ParsingConfig {
        &self.config
    }

    /// Locate the item list inside `payload` and map every usable element.
    pub fn map_payload(&self, payload: &JsonValue) -> Result<Vec<NewLead>, AdapterError> {
        let mut cursor = payload;
        for segment in self.config.root_path() {
            cursor = cursor.get(segment).ok_or_else(|| {
                AdapterError::Message(format!(
                    "key path {:?} not found in response",
                    self.config.root_key
                ))
            })?;
        }
        let items = cursor.as_array().ok_or_else(|| {
            AdapterError::Message(format!(
                "expected an array at {:?}, found {}",
                self.config.root_key,
                json_kind(cursor)
            ))
        })?;

        let leads: Vec<NewLead> = items.iter().filter_map(|item| self.map_item(item)).collect();
        if leads.len() < items.len() {
            debug!(
                source = %self.source.name,
                skipped = items.len() - leads.len(),
                "api items without id or title skipped"
            );
        }
        Ok(leads)
    }

    fn map_item(&self, item: &JsonValue) -> Option<NewLead> {
        let field = |key: &str| scalar_text(item.get(key));
        let external_id = field(&self.config.id_key).filter(|s| !s.is_empty())?;
        let title = field(&self.config.title_key).filter(|s| !s.is_empty())?;

        Some(NewLead {
            source: self.source.name.clone(),
            external_id,
            title,
            description: field(&self.config.desc_key).unwrap_or_default(),
            url: field(&self.config.url_key).unwrap_or_default(),
            budget: DEFAULT_BUDGET.to_string(),
            company: field(&self.config.company_key)
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| DEFAULT_COMPANY.to_string()),
            posted_at: None,
            client_signals: None,
        })
    }
}

#[async_trait]
impl SourceFetcher for ApiFetcher {
    fn source(&self) -> &JobSource {
        &self.source
    }

    async fn fetch_leads(&self, http: &HttpFetcher) -> Result<Vec<NewLead>, AdapterError> {
        let payload = http.fetch_json(&self.source.name, &self.source.url).await?;
        self.map_payload(&payload)
    }
}

fn scalar_text(value: Option<&JsonValue>) -> Option<String> {
    match value? {
        JsonValue::String(s) => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn source(kind: &str, parsing_config: Option<&str>) -> JobSource {
        JobSource {
            id: "test".to_string(),
            name: "Test Source".to_string(),
            source_type: kind.to_string(),
            url: "https://example.com/feed".to_string(),
            parsing_config: parsing_config.map(ToString::to_string),
            enabled: true,
            last_checked: None,
        }
    }

    const SAMPLE_RSS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0">
  <channel>
    <title>Remote Marketing Jobs</title>
    <link>https://example.com</link>
    <description>Jobs</description>
    <item>
      <guid>abc</guid>
      <title>Acme: Growth Marketer</title>
      <link>https://example.com/jobs/abc</link>
      <description>&lt;p&gt;Own &lt;b&gt;paid&lt;/b&gt; acquisition.&lt;/p&gt;</description>
      <pubDate>Tue, 10 Feb 2026 09:00:00 +0000</pubDate>
    </item>
    <item>
      <guid>def</guid>
      <title>Product Designer at Globex</title>
      <link>https://example.com/jobs/def</link>
      <description>Design things.</description>
    </item>
  </channel>
</rss>"#;

    #[test]
    fn company_heuristics() {
        assert_eq!(extract_company("Acme: Growth Marketer"), "Acme");
        assert_eq!(extract_company("Product Designer at Globex"), "Globex");
        assert_eq!(extract_company("Designer at Initech at Night"), "Night");
        assert_eq!(extract_company("Senior Copywriter"), "Unknown");
        assert_eq!(extract_company(": Untitled"), "Unknown");
    }

    #[test]
    fn html_is_flattened_to_text() {
        assert_eq!(html_to_text("<p>Own <b>paid</b>\n acquisition.</p>"), "Own paid acquisition.");
        assert_eq!(html_to_text("  plain   text "), "plain text");
    }

    #[test]
    fn rss_entries_normalize_into_leads() {
        let fetcher = RssFetcher::new(source("rss", None));
        let leads = fetcher.parse_feed(SAMPLE_RSS.as_bytes()).unwrap();
        assert_eq!(leads.len(), 2);

        let first = &leads[0];
        assert_eq!(first.external_id, "abc");
        assert_eq!(first.title, "Acme: Growth Marketer");
        assert_eq!(first.company, "Acme");
        assert_eq!(first.source, "Test Source");
        assert_eq!(first.url, "https://example.com/jobs/abc");
        assert_eq!(first.description, "Own paid acquisition.");
        assert_eq!(first.budget, "N/A");
        assert!(first.posted_at.is_some());

        assert_eq!(leads[1].company, "Globex");
        assert!(leads[1].posted_at.is_none());
    }

    #[test]
    fn entries_without_guid_use_their_link() {
        let feed = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0">
  <channel>
    <title>Jobs</title>
    <item>
      <title>Copywriter at Initech</title>
      <link>https://e.com/jobs/42</link>
      <description>Write words.</description>
    </item>
    <item>
      <title>Orphan posting</title>
      <description>No guid and no link.</description>
    </item>
  </channel>
</rss>"#;
        let fetcher = RssFetcher::new(source("rss", None));
        let leads = fetcher.parse_feed(feed.as_bytes()).unwrap();
        assert_eq!(leads.len(), 1);
        assert_eq!(leads[0].external_id, "https://e.com/jobs/42");
        assert_eq!(leads[0].url, "https://e.com/jobs/42");

        // A retitled posting keeps the same id.
        let retitled = feed.replace("Copywriter at Initech", "Senior Copywriter at Initech");
        let again = fetcher.parse_feed(retitled.as_bytes()).unwrap();
        assert_eq!(again[0].external_id, leads[0].external_id);
    }

    #[test]
    fn malformed_feed_is_an_error() {
        let fetcher = RssFetcher::new(source("rss", None));
        assert!(fetcher.parse_feed(b"definitely not xml").is_err());
    }

    #[test]
    fn api_item_with_default_mapping() {
        let fetcher = ApiFetcher::new(source("api", None)).unwrap();
        let leads = fetcher
            .map_payload(&json!([{"id": 7, "title": "X", "description": "Y"}]))
            .unwrap();
        assert_eq!(
            leads,
            vec![NewLead {
                source: "Test Source".to_string(),
                external_id: "7".to_string(),
                title: "X".to_string(),
                description: "Y".to_string(),
                url: String::new(),
                budget: "N/A".to_string(),
                company: "Unknown".to_string(),
                posted_at: None,
                client_signals: None,
            }]
        );
    }

    #[test]
    fn api_nested_root_and_custom_keys() {
        let config = r#"{"root_key": "result.projects", "desc_key": "preview_description", "url_key": "seo_url", "company_key": "owner_id"}"#;
        let fetcher = ApiFetcher::new(source("api", Some(config))).unwrap();
        assert_eq!(fetcher.config().root_path(), vec!["result", "projects"]);
        let payload = json!({
            "status": "success",
            "result": {"projects": [
                {"id": 101, "title": "Python scraper", "preview_description": "Scrape", "seo_url": "python/scraper", "owner_id": 555},
                {"title": "Missing id"},
                {"id": 102}
            ]}
        });
        let leads = fetcher.map_payload(&payload).unwrap();
        assert_eq!(leads.len(), 1);
        assert_eq!(leads[0].external_id, "101");
        assert_eq!(leads[0].description, "Scrape");
        assert_eq!(leads[0].url, "python/scraper");
        assert_eq!(leads[0].company, "555");
    }

    #[test]
    fn api_shape_errors_are_reported() {
        let fetcher = ApiFetcher::new(source("api", Some(r#"{"root_key": "jobs"}"#))).unwrap();
        assert!(fetcher.map_payload(&json!({"items": []})).is_err());
        assert!(fetcher.map_payload(&json!({"jobs": {"id": 1}})).is_err());
    }

    #[test]
    fn dispatch_on_source_type() {
        assert!(fetcher_for_source(&source("rss", None)).is_ok());
        assert!(fetcher_for_source(&source("API", Some("{}"))).is_ok());
        assert!(matches!(
            fetcher_for_source(&source("scrape", None)),
            Err(AdapterError::UnsupportedType(_))
        ));
        assert!(matches!(
            fetcher_for_source(&source("api", Some("{broken"))),
            Err(AdapterError::Config(_))
        ));
    }
}
