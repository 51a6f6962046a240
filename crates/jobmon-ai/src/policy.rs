//! Business-unit classification: keyword pre-filter, prompt construction and reply parsing.

use std::path::Path;

use anyhow::{Context, Result};
use jobmon_core::{AgencyLabel, Classification};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use crate::client::{AiClient, CompletionError, ResponseMode, DEFAULT_MAX_RETRIES, EMPTY_JSON_REPLY};

/// Characters of the description included in the prompt.
pub const PROMPT_DESCRIPTION_CHARS: usize = 800;
const PROMPT_LIST_ITEMS: usize = 5;
const DEFAULT_CONFIDENCE: f64 = 0.5;
const DEFAULT_SCORE: i64 = 50;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AgencyProfile {
    pub key: String,
    pub name: String,
    #[serde(default)]
    pub focus: String,
    #[serde(default)]
    pub industries: Vec<String>,
    #[serde(default)]
    pub target_roles: Vec<String>,
    /// Embed color for notifications.
    #[serde(default)]
    pub color: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
struct AgenciesFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    agencies: Vec<AgencyProfile>,
}

#[derive(Debug, Clone, Deserialize)]
struct RejectFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    contains_any: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ClassificationPolicy {
    profiles: Vec<AgencyProfile>,
    reject_keywords: Vec<String>,
    model: Option<String>,
}

impl ClassificationPolicy {
    pub fn new(profiles: Vec<AgencyProfile>, reject_keywords: Vec<String>) -> Self {
        Self {
            profiles: profiles
                .into_iter()
                .map(|mut p| {
                    p.key = p.key.trim().to_lowercase();
                    p
                })
                .collect(),
            reject_keywords: reject_keywords
                .into_iter()
                .map(|k| k.trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
            model: None,
        }
    }

    /// Load `rules/agencies.yaml` and `rules/reject.yaml` below `root`.
    pub fn from_workspace_root(root: &Path) -> Result<Self> {
        let rules_dir = root.join("rules");
        let agencies: AgenciesFile = load_yaml(&rules_dir.join("agencies.yaml"))?;
        let reject: RejectFile = load_yaml(&rules_dir.join("reject.yaml"))?;
        Ok(Self::new(agencies.agencies, reject.contains_any))
    }

    /// Model used for classification calls instead of the client's default.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn profiles(&self) -> &[AgencyProfile] {
        &self.profiles
    }

    pub fn profile(&self, key: &str) -> Option<&AgencyProfile> {
        self.profiles.iter().find(|p| p.key == key)
    }

    pub fn should_reject(&self, text: &str) -> bool {
        let haystack = text.to_lowercase();
        self.reject_keywords.iter().any(|k| haystack.contains(k.as_str()))
    }

    pub fn build_prompt(&self, title: &str, description: &str) -> String {
        let mut prompt = String::from("Classify this job into ONE of the following business units:\n\n");
        for profile in &self.profiles {
            prompt.push_str(&format!("{} ({}):\n", profile.key.to_uppercase(), profile.name));
            prompt.push_str(&format!("  - Focus: {}\n", profile.focus));
            prompt.push_str(&format!("  - Keywords: {}\n", first_items(&profile.industries)));
            prompt.push_str(&format!("  - Roles: {}\n\n", first_items(&profile.target_roles)));
        }
        prompt.push_str(
            "If the job does not clearly fit ANY (e.g. entry level, low budget, unrelated), return REJECT.\n\n",
        );
        prompt.push_str(&format!("JOB TITLE: {title}\n"));
        let excerpt: String = description.chars().take(PROMPT_DESCRIPTION_CHARS).collect();
        prompt.push_str(&format!("JOB DESC: {excerpt}\n\n"));
        prompt.push_str(concat!(
            "Return formatted JSON ONLY:\n",
            "{\n",
            "  \"agency\": \"AGENCY_KEY\" (or \"reject\"),\n",
            "  \"confidence\": 0.0 to 1.0,\n",
            "  \"reasoning\": \"Short explanation\",\n",
            "  \"score\": 0 to 100 (Fit Score independent of agency match)\n",
            "}"
        ));
        prompt
    }

    /// Interpret a model reply. Anything unusable becomes `unassigned`.
    pub fn parse_response(&self, content: &str) -> Classification {
        let content = content.trim();
        if content.is_empty() || content.starts_with("Error") || content == EMPTY_JSON_REPLY {
            return Classification::unassigned();
        }

        let data: JsonValue = match serde_json::from_str(content) {
            Ok(value @ JsonValue::Object(_)) => value,
            Ok(_) => {
                warn!(content, "classification reply is not a json object");
                return Classification::unassigned();
            }
            Err(err) => {
                warn!(error = %err, content, "classification reply is not valid json");
                return Classification::unassigned();
            }
        };

        let agency = data
            .get("agency")
            .and_then(JsonValue::as_str)
            .unwrap_or("unassigned")
            .to_lowercase();
        let Some(confidence) = numeric_field(&data, "confidence") else {
            warn!(content, "classification reply has a non-numeric confidence");
            return Classification::unassigned();
        };
        let Some(score) = numeric_field(&data, "score") else {
            warn!(content, "classification reply has a non-numeric score");
            return Classification::unassigned();
        };

        let label = match self.profiles.iter().find(|p| agency.contains(p.key.as_str())) {
            Some(profile) => AgencyLabel::Agency(profile.key.clone()),
            None if agency == "reject" => AgencyLabel::Reject,
            None => AgencyLabel::Unassigned,
        };

        Classification {
            label,
            confidence: confidence.unwrap_or(DEFAULT_CONFIDENCE).clamp(0.0, 1.0),
            score: score
                .map(|s| s.round() as i64)
                .unwrap_or(DEFAULT_SCORE)
                .clamp(0, 100),
            reasoning: data
                .get("reasoning")
                .and_then(JsonValue::as_str)
                .map(ToString::to_string),
        }
    }

    /// Pre-filter, then ask the model. A completion failure is returned as-is so
    /// callers can leave the lead pending; an answered but unusable reply is `unassigned`.
    pub async fn try_classify(
        &self,
        ai: &AiClient,
        title: &str,
        description: &str,
    ) -> Result<Classification, CompletionError> {
        if self.should_reject(&format!("{title} {description}")) {
            debug!(title, "rejected by keyword pre-filter");
            return Ok(Classification::rejected());
        }

        let prompt = self.build_prompt(title, description);
        let content = match &self.model {
            Some(model) => {
                ai.with_model(model.as_str())
                    .try_generate(&prompt, ResponseMode::Json, DEFAULT_MAX_RETRIES)
                    .await?
            }
            None => ai.try_generate(&prompt, ResponseMode::Json, DEFAULT_MAX_RETRIES).await?,
        };
        debug!(title, "classification reply received");
        Ok(self.parse_response(&content))
    }

    /// Never fails; a completion failure yields `unassigned`.
    pub async fn classify(&self, ai: &AiClient, title: &str, description: &str) -> Classification {
        self.try_classify(ai, title, description).await.unwrap_or_else(|err| {
            if !matches!(err, CompletionError::NotConfigured) {
                warn!(error = %err, title, "classification degraded");
            }
            Classification::unassigned()
        })
    }
}

fn first_items(values: &[String]) -> String {
    values
        .iter()
        .take(PROMPT_LIST_ITEMS)
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

/// `Some(None)` when absent, `None` when present but not a number.
fn numeric_field(data: &JsonValue, key: &str) -> Option<Option<f64>> {
    match data.get(key) {
        None | Some(JsonValue::Null) => Some(None),
        Some(JsonValue::Number(n)) => n.as_f64().filter(|v| v.is_finite()).map(Some),
        Some(JsonValue::String(s)) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()).map(Some),
        Some(_) => None,
    }
}

fn load_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StubBackend;
    use std::sync::Arc;
    use std::time::Duration;

    fn profile(key: &str, name: &str) -> AgencyProfile {
        AgencyProfile {
            key: key.to_string(),
            name: name.to_string(),
            focus: format!("{name} focus"),
            industries: (1..=7).map(|i| format!("industry{i}")).collect(),
            target_roles: vec!["role a".to_string(), "role b".to_string()],
            color: None,
        }
    }

    fn policy() -> ClassificationPolicy {
        ClassificationPolicy::new(
            vec![profile("ascend", "Ascend Growth"), profile("apex", "Apex Strategy")],
            vec!["Unpaid".to_string(), "internship".to_string()],
        )
    }

    fn ai(backend: Arc<StubBackend>, keys: &[&str]) -> AiClient {
        AiClient::new(
            keys.iter().map(ToString::to_string).collect(),
            backend,
            "test-model",
            Duration::from_millis(1),
        )
    }

    #[test]
    fn reject_keywords_match_case_insensitively() {
        let policy = policy();
        assert!(policy.should_reject("UNPAID Marketing role"));
        assert!(policy.should_reject("Summer Internship program"));
        assert!(!policy.should_reject("Senior growth marketer"));
    }

    #[test]
    fn prompt_lists_profiles_and_truncates_description() {
        let description = "é".repeat(1000);
        let prompt = policy().build_prompt("Growth Lead", &description);
        assert!(prompt.contains("ASCEND (Ascend Growth):"));
        assert!(prompt.contains("  - Keywords: industry1, industry2, industry3, industry4, industry5\n"));
        assert!(!prompt.contains("industry6"));
        assert!(prompt.contains("  - Roles: role a, role b\n"));
        assert!(prompt.contains("JOB TITLE: Growth Lead\n"));
        assert!(prompt.contains(&format!("JOB DESC: {}\n", "é".repeat(800))));
        assert!(!prompt.contains(&"é".repeat(801)));
        assert!(prompt.ends_with('}'));
    }

    #[test]
    fn reply_parsing_normalizes_agency_names() {
        let policy = policy();
        let result = policy.parse_response(
            r#"{"agency": "Ascend Growth", "confidence": 0.9, "score": 80, "reasoning": "fits"}"#,
        );
        assert_eq!(result.as_tuple(), ("ascend", 0.9, 80));
        assert_eq!(result.reasoning.as_deref(), Some("fits"));

        let result = policy.parse_response(r#"{"agency": "REJECT", "confidence": 0.7, "score": 10}"#);
        assert_eq!(result.as_tuple(), ("reject", 0.7, 10));

        let result = policy.parse_response(r#"{"agency": "Something Else"}"#);
        assert_eq!(result.as_tuple(), ("unassigned", 0.5, 50));
    }

    #[test]
    fn reply_parsing_defaults_and_clamps() {
        let policy = policy();
        assert_eq!(policy.parse_response(r#"{"agency": "apex"}"#).as_tuple(), ("apex", 0.5, 50));
        assert_eq!(
            policy.parse_response(r#"{"agency": "apex", "confidence": 4, "score": 250}"#).as_tuple(),
            ("apex", 1.0, 100)
        );
        assert_eq!(
            policy.parse_response(r#"{"agency": "apex", "confidence": "0.4", "score": -3}"#).as_tuple(),
            ("apex", 0.4, 0)
        );
    }

    #[test]
    fn unusable_replies_are_unassigned() {
        let policy = policy();
        for reply in [
            "",
            "{}",
            "Error generating response",
            "not json at all",
            "[1, 2]",
            r#"{"agency": "apex", "confidence": "high"}"#,
        ] {
            assert_eq!(policy.parse_response(reply), Classification::unassigned(), "{reply}");
        }
    }

    #[tokio::test]
    async fn prefilter_rejects_without_calling_the_model() {
        let backend = Arc::new(StubBackend::replying(Ok(r#"{"agency": "ascend"}"#.into())));
        let result = policy()
            .classify(&ai(backend.clone(), &["k"]), "Unpaid growth intern", "")
            .await;
        assert_eq!(result.as_tuple(), ("reject", 1.0, 0));
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn classify_uses_configured_model_and_json_mode() {
        let backend = Arc::new(StubBackend::replying(Ok(
            r#"{"agency": "apex", "confidence": 0.8, "score": 72}"#.into(),
        )));
        let result = policy()
            .with_model("classifier")
            .classify(&ai(backend.clone(), &["k"]), "Fractional CMO", "Lead our strategy")
            .await;
        assert_eq!(result.as_tuple(), ("apex", 0.8, 72));
        let request = backend.last_request().unwrap();
        assert_eq!(request.model, "classifier");
        assert_eq!(request.mode, ResponseMode::Json);
    }

    #[tokio::test]
    async fn degraded_model_yields_unassigned() {
        let backend = Arc::new(StubBackend::replying(Err(CompletionError::RateLimited(String::new()))));
        let result = policy()
            .classify(&ai(backend.clone(), &["k"]), "Growth marketer", "Own our funnel")
            .await;
        assert_eq!(result, Classification::unassigned());
        assert_eq!(backend.calls(), DEFAULT_MAX_RETRIES);

        let backend = Arc::new(StubBackend::replying(Ok("{}".into())));
        let result = policy().classify(&ai(backend, &[]), "Growth marketer", "Own our funnel").await;
        assert_eq!(result, Classification::unassigned());
    }

    #[tokio::test]
    async fn try_classify_surfaces_completion_failures() {
        let backend = Arc::new(StubBackend::replying(Err(CompletionError::RateLimited(String::new()))));
        let err = policy()
            .try_classify(&ai(backend.clone(), &["k"]), "Growth marketer", "Own our funnel")
            .await
            .unwrap_err();
        assert!(err.is_rate_limit());
        assert_eq!(backend.calls(), DEFAULT_MAX_RETRIES);

        // An answered reply naming no profile is still a final result.
        let backend = Arc::new(StubBackend::replying(Ok(
            r#"{"agency": "none of these", "confidence": 0.2, "score": 15}"#.into(),
        )));
        let result = policy()
            .try_classify(&ai(backend, &["k"]), "Growth marketer", "Own our funnel")
            .await
            .unwrap();
        assert_eq!(result.as_tuple(), ("unassigned", 0.2, 15));

        let backend = Arc::new(StubBackend::replying(Ok("{}".into())));
        let result = policy()
            .try_classify(&ai(backend.clone(), &[]), "Unpaid role", "")
            .await
            .unwrap();
        assert_eq!(result.as_tuple(), ("reject", 1.0, 0));
        assert_eq!(backend.calls(), 0);
    }

    #[test]
    fn shipped_rules_files_load() {
        let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
        let policy = ClassificationPolicy::from_workspace_root(&root).unwrap();
        let keys: Vec<&str> = policy.profiles().iter().map(|p| p.key.as_str()).collect();
        assert_eq!(keys, vec!["ascend", "apex", "socketlogic", "infrastructure"]);
        assert_eq!(policy.profile("ascend").and_then(|p| p.color), Some(0x3B82F6));
        assert!(policy.should_reject("Unpaid volunteer position"));
    }

    #[test]
    fn rules_are_read_from_workspace_dir() {
        let dir = tempfile::tempdir().unwrap();
        let rules = dir.path().join("rules");
        std::fs::create_dir_all(&rules).unwrap();
        std::fs::write(
            rules.join("agencies.yaml"),
            "version: 1\nagencies:\n  - key: Solo\n    name: Solo Shop\n",
        )
        .unwrap();
        std::fs::write(rules.join("reject.yaml"), "version: 1\ncontains_any: [crypto]\n").unwrap();

        let policy = ClassificationPolicy::from_workspace_root(dir.path()).unwrap();
        assert_eq!(policy.profiles()[0].key, "solo");
        assert!(policy.profiles()[0].industries.is_empty());
        assert!(policy.should_reject("Crypto trading bot"));

        std::fs::remove_file(rules.join("reject.yaml")).unwrap();
        assert!(ClassificationPolicy::from_workspace_root(dir.path()).is_err());
    }
}
