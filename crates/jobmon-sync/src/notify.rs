//! Outbound notifications for leads that matched a business unit.

use async_trait::async_trait;
use jobmon_core::{Classification, JobLead};
use serde_json::{json, Value as JsonValue};
use tracing::{debug, warn};

pub const DEFAULT_EMBED_COLOR: u32 = 0x10B981;
const EMBED_DESCRIPTION_CHARS: usize = 200;

/// Receives leads that matched a business unit.
#[async_trait]
pub trait LeadNotifier: Send + Sync {
    async fn notify(&self, lead: &JobLead, classification: &Classification, color: Option<u32>);
}

/// Posts a rich embed to a Discord-style webhook.
#[derive(Debug, Clone)]
pub struct DiscordNotifier {
    http: reqwest::Client,
    webhook_url: String,
}

impl DiscordNotifier {
    pub fn new(webhook_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            webhook_url: webhook_url.into(),
        }
    }

    pub fn payload(lead: &JobLead, classification: &Classification, color: Option<u32>) -> JsonValue {
        let description = if lead.description.is_empty() {
            "No description".to_string()
        } else {
            let excerpt: String = lead.description.chars().take(EMBED_DESCRIPTION_CHARS).collect();
            format!("{excerpt}...")
        };

        json!({
            "username": "Job Monitor",
            "embeds": [{
                "title": format!("New Lead: {}", lead.title),
                "description": description,
                "url": lead.url,
                "color": color.unwrap_or(DEFAULT_EMBED_COLOR),
                "fields": [
                    {"name": "Agency Match", "value": classification.label.as_str().to_uppercase(), "inline": true},
                    {"name": "Source", "value": lead.source, "inline": true},
                    {"name": "AI Score", "value": format!("{}/100", classification.score), "inline": true},
                ],
                "footer": {"text": format!("Job Monitor • {}", lead.posted_at.format("%Y-%m-%d"))},
            }]
        })
    }
}

#[async_trait]
impl LeadNotifier for DiscordNotifier {
    async fn notify(&self, lead: &JobLead, classification: &Classification, color: Option<u32>) {
        let payload = Self::payload(lead, classification, color);
        match self.http.post(&self.webhook_url).json(&payload).send().await {
            Ok(resp) if resp.status().is_success() => debug!(id = %lead.id, "webhook notification sent"),
            Ok(resp) => warn!(id = %lead.id, status = resp.status().as_u16(), "webhook rejected notification"),
            Err(err) => warn!(id = %lead.id, error = %err, "webhook notification failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use jobmon_core::AgencyLabel;

    fn lead(description: &str) -> JobLead {
        let posted = Utc.with_ymd_and_hms(2026, 3, 4, 12, 0, 0).unwrap();
        JobLead {
            id: "wwr_abc".into(),
            source: "We Work Remotely".into(),
            external_id: "abc".into(),
            title: "Growth Marketer".into(),
            description: description.into(),
            url: "https://example.com/abc".into(),
            budget: "N/A".into(),
            company: "Acme".into(),
            posted_at: posted,
            status: "new".into(),
            agency_match: None,
            match_score: 0,
            ai_confidence: 0.0,
            match_reasoning: None,
            scored: false,
            applied: false,
            applied_at: None,
            applied_by: None,
            connect_score: 0,
            client_signals: None,
            client_proposal: None,
            client_plan: None,
            created_at: posted,
        }
    }

    #[test]
    fn embed_carries_match_details() {
        let classification = Classification {
            label: AgencyLabel::Agency("ascend".into()),
            confidence: 0.9,
            score: 82,
            reasoning: None,
        };
        let payload = DiscordNotifier::payload(&lead(&"x".repeat(300)), &classification, Some(0x3B82F6));
        let embed = &payload["embeds"][0];
        assert_eq!(payload["username"], "Job Monitor");
        assert_eq!(embed["title"], "New Lead: Growth Marketer");
        assert_eq!(embed["color"], 0x3B82F6);
        assert_eq!(embed["description"].as_str().unwrap().len(), 203);
        assert_eq!(embed["fields"][0]["value"], "ASCEND");
        assert_eq!(embed["fields"][2]["value"], "82/100");
        assert_eq!(embed["footer"]["text"], "Job Monitor • 2026-03-04");

        let payload = DiscordNotifier::payload(&lead(""), &classification, None);
        assert_eq!(payload["embeds"][0]["description"], "No description");
        assert_eq!(payload["embeds"][0]["color"], DEFAULT_EMBED_COLOR);
    }
}
