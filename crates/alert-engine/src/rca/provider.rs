//! External AI capability used for root-cause analysis

use super::context::AnalysisContext;
use crate::models::CandidateCause;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum AiError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("authentication failed")]
    Authentication,

    #[error("rate limited by provider")]
    RateLimited,

    #[error("provider returned status {0}")]
    Server(u16),

    #[error("analysis timed out")]
    Timeout,

    #[error("provider not configured: {0}")]
    NotConfigured(String),
}

impl AiError {
    /// Worth one more attempt
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AiError::Request(_) | AiError::RateLimited | AiError::Server(_) | AiError::Timeout
        )
    }
}

impl From<reqwest::Error> for AiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            AiError::Timeout
        } else {
            AiError::Request(e.to_string())
        }
    }
}

/// What the model is asked to return
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AiFinding {
    #[serde(default)]
    pub causes: Vec<CandidateCause>,
    #[serde(default)]
    pub evidence: Vec<String>,
    #[serde(default)]
    pub recommendations: Vec<String>,
    #[serde(default)]
    pub knowledge_refs: Vec<String>,
    #[serde(default)]
    pub confidence: f64,
}

#[async_trait]
pub trait AiProvider: Send + Sync {
    fn name(&self) -> &str;
    fn model(&self) -> &str;
    async fn analyze(&self, context: &AnalysisContext) -> Result<AiFinding, AiError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub enabled: bool,
    pub endpoint: String,
    pub model: String,
    /// Environment variable holding the API key
    pub api_key_env: String,
    pub max_tokens: u32,
    pub request_timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: "https://api.anthropic.com/v1/messages".to_string(),
            model: "claude-3-5-sonnet-20241022".to_string(),
            api_key_env: "ALERT_ENGINE_AI_API_KEY".to_string(),
            max_tokens: 2000,
            request_timeout_secs: 30,
        }
    }
}

const SYSTEM_PROMPT: &str = "You are an SRE assistant performing root-cause analysis for a \
monitoring alert. You receive the alert, the recent history of its metrics, correlated \
series from the same hosts or services, and relevant knowledge base entries. Respond with \
a single JSON object and nothing else, using the fields: causes (array of {description, \
confidence between 0 and 1, evidence array}), evidence (array of strings), recommendations \
(array of strings), knowledge_refs (ids of knowledge entries you relied on) and confidence \
(overall, between 0 and 1). Rank causes by confidence. Return an empty causes array if the \
data does not point to a cause.";

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    system: &'a str,
    messages: Vec<Message>,
}

#[derive(Debug, Serialize)]
struct Message {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: String,
}

/// Messages-style HTTP provider
pub struct HttpAiProvider {
    client: Client,
    endpoint: String,
    model: String,
    api_key: String,
    max_tokens: u32,
}

impl HttpAiProvider {
    /// Reads the API key from the configured environment variable
    pub fn from_config(config: &ProviderConfig) -> Result<Self, AiError> {
        let api_key = std::env::var(&config.api_key_env)
            .map_err(|_| AiError::NotConfigured(format!("{} is not set", config.api_key_env)))?;
        Self::new(config, api_key)
    }

    pub fn new(config: &ProviderConfig, api_key: impl Into<String>) -> Result<Self, AiError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(AiError::NotConfigured("empty API key".to_string()));
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs.max(1)))
            .build()
            .map_err(|e| AiError::NotConfigured(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            api_key,
            max_tokens: config.max_tokens,
        })
    }
}

/// Pull the JSON object out of the model's text, tolerating code fences
pub(crate) fn parse_finding(text: &str) -> Result<AiFinding, AiError> {
    let start = text.find('{');
    let end = text.rfind('}');
    let json = match (start, end) {
        (Some(start), Some(end)) if start < end => &text[start..=end],
        _ => {
            return Err(AiError::InvalidResponse(
                "no JSON object in model output".to_string(),
            ))
        }
    };

    let mut finding: AiFinding = serde_json::from_str(json)
        .map_err(|e| AiError::InvalidResponse(format!("failed to parse model output: {}", e)))?;

    finding.confidence = clamp_unit(finding.confidence);
    for cause in &mut finding.causes {
        cause.confidence = clamp_unit(cause.confidence);
    }
    finding.causes.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    Ok(finding)
}

fn clamp_unit(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

#[async_trait]
impl AiProvider for HttpAiProvider {
    fn name(&self) -> &str {
        "http"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn analyze(&self, context: &AnalysisContext) -> Result<AiFinding, AiError> {
        let payload = serde_json::to_string(context)
            .map_err(|e| AiError::InvalidResponse(format!("failed to encode context: {}", e)))?;

        let request = MessagesRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            temperature: 0.1,
            system: SYSTEM_PROMPT,
            messages: vec![Message {
                role: "user",
                content: payload,
            }],
        };

        let response = self
            .client
            .post(&self.endpoint)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        match status.as_u16() {
            401 | 403 => return Err(AiError::Authentication),
            429 => return Err(AiError::RateLimited),
            code if status.is_server_error() => return Err(AiError::Server(code)),
            _ if !status.is_success() => {
                let body = response.text().await.unwrap_or_default();
                return Err(AiError::InvalidResponse(format!("HTTP {}: {}", status, body)));
            }
            _ => {}
        }

        let body: MessagesResponse = response
            .json()
            .await
            .map_err(|e| AiError::InvalidResponse(format!("failed to parse response: {}", e)))?;
        let text = body
            .content
            .first()
            .map(|block| block.text.as_str())
            .ok_or_else(|| AiError::InvalidResponse("no content in response".to_string()))?;

        parse_finding(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Labels, Severity, Threshold};
    use crate::rca::context::AlertDigest;
    use mockito::Matcher;

    fn context() -> AnalysisContext {
        AnalysisContext {
            alert: AlertDigest {
                id: "a1".into(),
                rule_id: "R1".into(),
                rule_name: "HighCpu".into(),
                severity: Severity::Critical,
                labels: Labels::new(),
                value: 95.0,
                threshold: Threshold::default(),
                starts_at: None,
                description: None,
            },
            history: Vec::new(),
            correlated: Vec::new(),
            knowledge: Vec::new(),
            truncated: false,
        }
    }

    fn provider(url: &str) -> HttpAiProvider {
        let config = ProviderConfig {
            enabled: true,
            endpoint: format!("{}/v1/messages", url),
            ..Default::default()
        };
        HttpAiProvider::new(&config, "test-key").unwrap()
    }

    #[test]
    fn test_parse_finding_tolerates_fences_and_ranks() {
        let text = "```json\n{\"causes\": [{\"description\": \"gc\", \"confidence\": 0.2}, {\"description\": \"leak\", \"confidence\": 1.7}], \"confidence\": 0.8}\n```";
        let finding = parse_finding(text).unwrap();
        assert_eq!(finding.causes[0].description, "leak");
        assert_eq!(finding.causes[0].confidence, 1.0);
        assert_eq!(finding.confidence, 0.8);

        assert!(matches!(parse_finding("no idea"), Err(AiError::InvalidResponse(_))));
    }

    #[test]
    fn test_transient_classification() {
        assert!(AiError::Timeout.is_transient());
        assert!(AiError::Server(502).is_transient());
        assert!(!AiError::Authentication.is_transient());
        assert!(!AiError::InvalidResponse("x".into()).is_transient());
    }

    #[test]
    fn test_missing_key_is_not_configured() {
        let config = ProviderConfig {
            api_key_env: "ALERT_ENGINE_TEST_UNSET_KEY".into(),
            ..Default::default()
        };
        assert!(matches!(
            HttpAiProvider::from_config(&config),
            Err(AiError::NotConfigured(_))
        ));
    }

    #[tokio::test]
    async fn test_analyze_sends_messages_request() {
        let mut server = mockito::Server::new_async().await;
        let reply = serde_json::json!({
            "content": [{"type": "text", "text": "{\"causes\": [{\"description\": \"Runaway batch job\", \"confidence\": 0.7, \"evidence\": [\"cpu 95%\"]}], \"recommendations\": [\"throttle the job\"], \"confidence\": 0.7}"}]
        });
        let mock = server
            .mock("POST", "/v1/messages")
            .match_header("x-api-key", "test-key")
            .match_header("anthropic-version", "2023-06-01")
            .match_body(Matcher::PartialJsonString(
                r#"{"max_tokens": 2000, "model": "claude-3-5-sonnet-20241022"}"#.to_string(),
            ))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(reply.to_string())
            .create_async()
            .await;

        let finding = provider(&server.url()).analyze(&context()).await.unwrap();
        mock.assert_async().await;
        assert_eq!(finding.causes.len(), 1);
        assert_eq!(finding.recommendations, vec!["throttle the job"]);
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let mut server = mockito::Server::new_async().await;
        let _unauthorized = server
            .mock("POST", "/v1/messages")
            .with_status(401)
            .create_async()
            .await;
        let result = provider(&server.url()).analyze(&context()).await;
        assert!(matches!(result, Err(AiError::Authentication)));

        let mut server = mockito::Server::new_async().await;
        let _overloaded = server
            .mock("POST", "/v1/messages")
            .with_status(529)
            .create_async()
            .await;
        let result = provider(&server.url()).analyze(&context()).await;
        assert!(matches!(result, Err(AiError::Server(529))));
    }
}
