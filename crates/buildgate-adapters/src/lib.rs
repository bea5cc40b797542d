//! Collaborator adapters for BuildGate: payment rails and generative-text backends.

#![deny(unsafe_code)]

use async_trait::async_trait;
use buildgate_core::error::CoreError;
use buildgate_core::payment::PaymentRail;
use buildgate_core::recommend::{GenerationContext, RecommendationDraft, TextGenerator};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

/// One transfer accepted by [`MockPaymentRail`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedTransfer {
    pub transfer_id: String,
    pub destination_account: String,
    pub amount_cents: i64,
    pub description: String,
}

/// Deterministic local payment rail. Records every transfer it accepts.
#[derive(Debug, Default)]
pub struct MockPaymentRail {
    latency: Option<Duration>,
    transfers: Mutex<Vec<RecordedTransfer>>,
}

impl MockPaymentRail {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep before accepting each transfer.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            transfers: Mutex::new(Vec::new()),
        }
    }

    pub async fn transfers(&self) -> Vec<RecordedTransfer> {
        self.transfers.lock().await.clone()
    }
}

#[async_trait]
impl PaymentRail for MockPaymentRail {
    fn rail(&self) -> &'static str {
        "mock"
    }

    async fn transfer(
        &self,
        destination_account: &str,
        amount_cents: i64,
        description: &str,
    ) -> Result<String, CoreError> {
        if amount_cents <= 0 {
            return Err(CoreError::collaborator(
                self.rail(),
                format!("transfer amount must be positive, got {amount_cents}"),
            ));
        }
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let mut transfers = self.transfers.lock().await;
        let material = format!(
            "{}|{}|{}|{}",
            transfers.len(),
            destination_account,
            amount_cents,
            description
        );
        let digest = blake3::hash(material.as_bytes()).to_hex();
        let transfer_id = format!("mock-{}", &digest.as_str()[..16]);
        transfers.push(RecordedTransfer {
            transfer_id: transfer_id.clone(),
            destination_account: destination_account.to_string(),
            amount_cents,
            description: description.to_string(),
        });
        Ok(transfer_id)
    }
}

/// Deterministic failing rail useful for chaos testing.
#[derive(Debug, Clone)]
pub struct AlwaysFailPaymentRail {
    rail_name: &'static str,
    reason: String,
}

impl AlwaysFailPaymentRail {
    pub fn new(rail_name: &'static str, reason: impl Into<String>) -> Self {
        Self {
            rail_name,
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl PaymentRail for AlwaysFailPaymentRail {
    fn rail(&self) -> &'static str {
        self.rail_name
    }

    async fn transfer(
        &self,
        _destination_account: &str,
        _amount_cents: i64,
        _description: &str,
    ) -> Result<String, CoreError> {
        Err(CoreError::collaborator(self.rail_name, self.reason.clone()))
    }
}

/// Connection settings for an OpenAI-compatible chat completions endpoint.
#[derive(Debug, Clone)]
pub struct HttpGeneratorConfig {
    /// Base URL or full `/chat/completions` URL.
    pub endpoint: String,
    pub model: String,
    pub api_key: Option<String>,
    pub request_timeout: Duration,
}

const SYSTEM_PROMPT: &str = "You advise construction project owners. Given project \
features as JSON, reply with one JSON object with keys title, description, priority \
(1-10), reasoning, confidence (0-1), estimated_impact and estimated_effort. Never \
recommend submitting permits, releasing funds, signing contracts or resolving disputes \
on the owner's behalf.";

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

/// Generative recommendation backend speaking the OpenAI chat completions protocol.
#[derive(Debug, Clone)]
pub struct HttpTextGenerator {
    client: Client,
    url: String,
    model: String,
    api_key: Option<String>,
}

impl HttpTextGenerator {
    pub fn new(config: HttpGeneratorConfig) -> Result<Self, CoreError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| {
                CoreError::collaborator("http-generator", format!("failed to build client: {e}"))
            })?;
        Ok(Self {
            client,
            url: resolve_chat_endpoint(&config.endpoint),
            model: config.model,
            api_key: config.api_key.filter(|key| !key.trim().is_empty()),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl TextGenerator for HttpTextGenerator {
    fn backend(&self) -> &'static str {
        "http-generator"
    }

    async fn generate(
        &self,
        context: &GenerationContext,
    ) -> Result<RecommendationDraft, CoreError> {
        let features = serde_json::to_string(context)?;
        let payload = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": features },
            ],
            "response_format": { "type": "json_object" },
        });

        let mut request = self.client.post(&self.url).json(&payload);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }
        let response = request
            .send()
            .await
            .map_err(|e| CoreError::collaborator(self.backend(), format!("request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(CoreError::collaborator(
                self.backend(),
                format!("error {}: {}", status, truncate(&body, 320)),
            ));
        }

        let body: ChatResponse = response.json().await.map_err(|e| {
            CoreError::collaborator(self.backend(), format!("invalid response: {e}"))
        })?;
        let content = body
            .choices
            .first()
            .and_then(|choice| choice.message.content.as_deref())
            .ok_or_else(|| {
                CoreError::collaborator(self.backend(), "response did not include content")
            })?;
        debug!(project_id = %context.project_id, "generative recommendation received");
        parse_draft(content)
            .map_err(|message| CoreError::collaborator(self.backend(), message))
    }
}

fn resolve_chat_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim().trim_end_matches('/');
    if trimmed.ends_with("/chat/completions") {
        trimmed.to_string()
    } else {
        format!("{trimmed}/chat/completions")
    }
}

/// Parse the model's reply, tolerating a fenced code block around the JSON.
fn parse_draft(content: &str) -> Result<RecommendationDraft, String> {
    let trimmed = content.trim();
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();
    serde_json::from_str(unfenced).map_err(|e| format!("reply is not a recommendation: {e}"))
}

fn truncate(value: &str, max_chars: usize) -> String {
    let mut chars = value.chars();
    let truncated: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{truncated}...")
    } else {
        truncated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildgate_core::error::ErrorKind;

    #[tokio::test]
    async fn mock_rail_records_transfers() {
        let rail = MockPaymentRail::new();
        let first = rail.transfer("acct_1", 1_000, "release t1").await.unwrap();
        let second = rail.transfer("acct_1", 1_000, "release t1").await.unwrap();
        assert!(first.starts_with("mock-"));
        assert_ne!(first, second);
        assert_eq!(rail.transfers().await.len(), 2);
    }

    #[tokio::test]
    async fn mock_rail_rejects_non_positive_amounts() {
        let rail = MockPaymentRail::new();
        let err = rail.transfer("acct_1", 0, "zero").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Collaborator);
        assert!(rail.transfers().await.is_empty());
    }

    #[tokio::test]
    async fn failing_rail_reports_collaborator_error() {
        let rail = AlwaysFailPaymentRail::new("stripe", "card network down");
        let err = rail.transfer("acct_1", 100, "x").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Collaborator);
        assert!(err.to_string().contains("card network down"));
    }

    #[test]
    fn chat_endpoint_is_normalized() {
        assert_eq!(
            resolve_chat_endpoint("https://llm.internal/v1/"),
            "https://llm.internal/v1/chat/completions"
        );
        assert_eq!(
            resolve_chat_endpoint("https://llm.internal/v1/chat/completions"),
            "https://llm.internal/v1/chat/completions"
        );
    }

    #[test]
    fn parses_fenced_and_bare_replies() {
        let bare = r#"{"title":"Book inspection","description":"d","priority":6,"reasoning":"r","confidence":0.7}"#;
        let draft = parse_draft(bare).unwrap();
        assert_eq!(draft.title, "Book inspection");
        assert_eq!(draft.estimated_effort, None);

        let fenced = format!("```json\n{bare}\n```");
        assert_eq!(parse_draft(&fenced).unwrap(), draft);

        assert!(parse_draft("sure, here you go").is_err());
    }
}
