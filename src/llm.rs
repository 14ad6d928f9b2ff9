//! Relationship discovery and revalidation via an LLM collaborator.
//!
//! The core never parses free-form text: the model is instructed to return
//! a strict JSON array of typed relationship candidates, and this module
//! hands the catalog already-structured values. Markets are batched by
//! event so each call sees a coherent discovery scope.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::catalog::Relationship;
use crate::retry::{retry_async, RetryPolicy, Retryable};
use crate::types::{Market, RelationshipCandidate, Revalidation};

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
/// Keep prompts inside a comfortable context budget.
const MAX_MARKETS_PER_BATCH: usize = 40;
/// Settlement rules are truncated for the prompt; the fingerprint guards
/// full-text changes.
const MAX_RULES_CHARS: usize = 500;

const DISCOVER_SYSTEM_PROMPT: &str = "\
You are analyzing prediction markets to find logically related markets whose \
prices should be mathematically constrained relative to each other.

For each batch of markets, identify ALL pairs or groups where a logical or \
mathematical relationship exists. Classify each relationship as one of:

1. SUBSET: market A's YES outcome is a strict subset of market B's YES outcome.
   {\"type\": \"SUBSET\", \"subset_ticker\": \"...\", \"superset_ticker\": \"...\",
    \"confidence\": 0.0-1.0, \"reasoning\": \"...\"}
2. THRESHOLD: markets on the same underlying with ordered strikes.
   {\"type\": \"THRESHOLD\", \"tickers_ascending\": [\"...\"],
    \"confidence\": 0.0-1.0, \"reasoning\": \"...\"}
3. PARTITION: mutually exclusive, exhaustive outcomes that must sum to ~100%.
   {\"type\": \"PARTITION\", \"tickers\": [\"...\"],
    \"confidence\": 0.0-1.0, \"reasoning\": \"...\"}
4. IMPLICATION: one event logically or empirically implies another.
   {\"type\": \"IMPLICATION\", \"if_ticker\": \"...\", \"then_ticker\": \"...\",
    \"estimated_conditional_prob\": 0.0-1.0, \"confidence\": 0.0-1.0,
    \"reasoning\": \"...\"}

CRITICAL: read the settlement rules carefully. Markets that LOOK related may \
settle on different criteria that break the logical link. Only flag \
relationships you are confident about; false positives lose money.

Return ONLY a valid JSON array of relationships. Return [] if none exist. Do \
not include any text outside the JSON array.";

const REVALIDATE_SYSTEM_PROMPT: &str = "\
You previously identified a relationship between prediction markets. Given \
the relationship and the markets' CURRENT titles and settlement rules, judge \
whether the relationship still holds.

Return ONLY a JSON object: {\"still_valid\": true|false, \"confidence\": 0.0-1.0}. \
No text outside the JSON object.";

/// Failures of the discovery collaborator.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("llm transport: {0}")]
    Transport(String),
    #[error("llm rate limited (retry after {retry_after_secs}s)")]
    RateLimited { retry_after_secs: u64 },
    #[error("llm returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    /// The reply was not the strict JSON the prompt demands. Not retried;
    /// the batch is skipped.
    #[error("llm returned malformed payload: {0}")]
    Malformed(String),
}

impl Retryable for LlmError {
    fn is_transient(&self) -> bool {
        match self {
            LlmError::Transport(_) | LlmError::RateLimited { .. } => true,
            LlmError::Status { status, .. } => *status >= 500,
            LlmError::Malformed(_) => false,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            LlmError::RateLimited { retry_after_secs } => {
                Some(Duration::from_secs(*retry_after_secs))
            }
            _ => None,
        }
    }
}

/// The discovery/revalidation seam the catalog workers consume.
#[async_trait]
pub trait RelationshipSource: Send + Sync {
    async fn discover(
        &self,
        markets: &[Arc<Market>],
    ) -> Result<Vec<RelationshipCandidate>, LlmError>;

    async fn revalidate(
        &self,
        relationship: &Relationship,
        markets: &[Arc<Market>],
    ) -> Result<Revalidation, LlmError>;
}

/// Group open markets by event and chunk oversized groups. Single-market
/// groups cannot hold an internal relationship and are dropped.
pub fn batch_by_event(markets: &[Arc<Market>]) -> Vec<Vec<Arc<Market>>> {
    let mut groups: FxHashMap<&str, Vec<Arc<Market>>> = FxHashMap::default();
    for market in markets {
        groups
            .entry(market.event_ticker.as_str())
            .or_default()
            .push(Arc::clone(market));
    }
    let mut keys: Vec<&str> = groups.keys().copied().collect();
    keys.sort_unstable();

    let mut batches = Vec::new();
    for key in keys {
        let group = groups.remove(key).expect("key from map");
        if group.len() < 2 {
            continue;
        }
        for chunk in group.chunks(MAX_MARKETS_PER_BATCH) {
            if chunk.len() >= 2 {
                batches.push(chunk.to_vec());
            }
        }
    }
    batches
}

/// Strip optional markdown fences and parse the strict JSON payload.
fn parse_json_reply<T: serde::de::DeserializeOwned>(text: &str) -> Result<T, LlmError> {
    let trimmed = text.trim();
    let payload = if trimmed.starts_with("```") {
        let lines: Vec<&str> = trimmed.lines().collect();
        let end = if lines.last().map(|l| l.trim()) == Some("```") {
            lines.len() - 1
        } else {
            lines.len()
        };
        lines[1..end].join("\n")
    } else {
        trimmed.to_string()
    };
    serde_json::from_str(payload.trim())
        .map_err(|e| LlmError::Malformed(format!("{e}: {}", truncate(text, 300))))
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

fn format_market(market: &Market) -> String {
    let mut parts = vec![
        format!("Ticker: {}", market.ticker),
        format!("  Title: {}", market.title),
    ];
    if let Some(subtitle) = &market.subtitle {
        parts.push(format!("  Subtitle: {}", subtitle));
    }
    parts.push(format!(
        "  YES ask: {}  YES bid: {}",
        market.quote.yes_ask, market.quote.yes_bid
    ));
    if !market.rules.is_empty() {
        parts.push(format!(
            "  Settlement rules: {}",
            truncate(&market.rules, MAX_RULES_CHARS)
        ));
    }
    parts.join("\n")
}

/// Anthropic Messages API client implementing `RelationshipSource`.
pub struct AnthropicClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
    max_tokens: u32,
    retry: RetryPolicy,
}

impl AnthropicClient {
    pub fn new(api_key: String, model: String, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client");
        Self {
            http,
            api_key,
            model,
            max_tokens: 4096,
            retry: RetryPolicy::from_env(),
        }
    }

    pub fn from_env(timeout: Duration) -> Option<Self> {
        let api_key = std::env::var("ANTHROPIC_API_KEY").ok()?;
        let model = std::env::var("ANTHROPIC_MODEL")
            .unwrap_or_else(|_| "claude-sonnet-4-5".to_string());
        Some(Self::new(api_key, model, timeout))
    }

    async fn complete(&self, system: &str, user: String) -> Result<String, LlmError> {
        let payload = json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "system": system,
            "messages": [{"role": "user", "content": user}],
        });

        let response = self
            .http
            .post(ANTHROPIC_API_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&payload)
            .send()
            .await
            .map_err(|e| LlmError::Transport(e.to_string()))?;

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after_secs = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(1);
            return Err(LlmError::RateLimited { retry_after_secs });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Status {
                status: status.as_u16(),
                body: truncate(&body, 500),
            });
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| LlmError::Transport(e.to_string()))?;
        body.get("content")
            .and_then(|c| c.as_array())
            .and_then(|items| items.iter().find(|i| i["type"] == "text"))
            .and_then(|i| i["text"].as_str())
            .map(str::to_string)
            .ok_or_else(|| LlmError::Malformed("missing text content".into()))
    }
}

#[async_trait]
impl RelationshipSource for AnthropicClient {
    async fn discover(
        &self,
        markets: &[Arc<Market>],
    ) -> Result<Vec<RelationshipCandidate>, LlmError> {
        if markets.len() < 2 {
            return Ok(Vec::new());
        }
        let market_text = markets
            .iter()
            .map(|m| format_market(m))
            .collect::<Vec<_>>()
            .join("\n\n");
        let user = format!(
            "Analyze these {} markets for logical relationships:\n\n{}",
            markets.len(),
            market_text
        );
        debug!("sending {} markets for relationship discovery", markets.len());

        let text = retry_async(&self.retry, "llm_discover", || {
            self.complete(DISCOVER_SYSTEM_PROMPT, user.clone())
        })
        .await?;

        let candidates: Vec<RelationshipCandidate> = match parse_json_reply(&text) {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!("discovery reply unparseable, skipping batch: {}", e);
                return Err(e);
            }
        };
        info!("discovery batch produced {} candidates", candidates.len());
        Ok(candidates)
    }

    async fn revalidate(
        &self,
        relationship: &Relationship,
        markets: &[Arc<Market>],
    ) -> Result<Revalidation, LlmError> {
        let market_text = markets
            .iter()
            .map(|m| format_market(m))
            .collect::<Vec<_>>()
            .join("\n\n");
        let user = format!(
            "Relationship under review:\n{}\n\nCurrent markets:\n\n{}",
            serde_json::to_string_pretty(&relationship.kind)
                .unwrap_or_else(|_| relationship.kind.tag().to_string()),
            market_text
        );

        let text = retry_async(&self.retry, "llm_revalidate", || {
            self.complete(REVALIDATE_SYSTEM_PROMPT, user.clone())
        })
        .await?;
        parse_json_reply(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MarketStatus, Quote, RelationshipKind};
    use chrono::Utc;

    fn market(ticker: &str, event: &str) -> Arc<Market> {
        Arc::new(Market {
            ticker: ticker.to_string(),
            event_ticker: event.to_string(),
            title: format!("Will {ticker} resolve yes?"),
            subtitle: None,
            status: MarketStatus::Open,
            quote: Quote {
                yes_bid: 48,
                yes_ask: 52,
                no_bid: 48,
                no_ask: 52,
            },
            yes_depth: 20,
            no_depth: 20,
            rules: "Settlement rules text.".to_string(),
            close_time: None,
            updated_at: Utc::now(),
        })
    }

    #[test]
    fn batching_groups_by_event_and_drops_singletons() {
        let markets = vec![
            market("A1", "EV_A"),
            market("A2", "EV_A"),
            market("B1", "EV_B"),
            market("C1", "EV_C"),
            market("C2", "EV_C"),
            market("C3", "EV_C"),
        ];
        let batches = batch_by_event(&markets);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 2); // EV_A
        assert_eq!(batches[1].len(), 3); // EV_C; EV_B dropped
    }

    #[test]
    fn parses_raw_discovery_reply() {
        let reply = r#"[
            {"type": "SUBSET", "subset_ticker": "MAR", "superset_ticker": "JUN",
             "confidence": 0.95, "reasoning": "March cut implies June cut"},
            {"type": "THRESHOLD", "tickers_ascending": ["T3", "T4", "T5"],
             "confidence": 0.9, "reasoning": "ordered strikes"},
            {"type": "IMPLICATION", "if_ticker": "A", "then_ticker": "B",
             "estimated_conditional_prob": 0.92, "confidence": 0.8,
             "reasoning": "A empirically implies B"}
        ]"#;
        let candidates: Vec<RelationshipCandidate> = parse_json_reply(reply).unwrap();
        assert_eq!(candidates.len(), 3);
        assert!(matches!(
            &candidates[0].kind,
            RelationshipKind::Subset { subset, superset }
                if subset == "MAR" && superset == "JUN"
        ));
        assert!(matches!(
            &candidates[2].kind,
            RelationshipKind::Implication { conditional_prob, .. }
                if (*conditional_prob - 0.92).abs() < f64::EPSILON
        ));
    }

    #[test]
    fn parses_fenced_reply() {
        let reply = "```json\n[{\"type\": \"PARTITION\", \"tickers\": [\"A\", \"B\"], \"confidence\": 0.9, \"reasoning\": \"\"}]\n```";
        let candidates: Vec<RelationshipCandidate> = parse_json_reply(reply).unwrap();
        assert_eq!(candidates.len(), 1);
    }

    #[test]
    fn parses_revalidation_object() {
        let verdict: Revalidation =
            parse_json_reply("{\"still_valid\": false, \"confidence\": 0.3}").unwrap();
        assert!(!verdict.still_valid);
    }

    #[test]
    fn malformed_reply_is_not_retried() {
        let err = parse_json_reply::<Vec<RelationshipCandidate>>("the markets look related")
            .unwrap_err();
        assert!(matches!(err, LlmError::Malformed(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn prompt_rendering_truncates_rules() {
        let mut m = (*market("A", "EV")).clone();
        m.rules = "r".repeat(2_000);
        let text = format_market(&m);
        assert!(text.len() < 1_000);
        assert!(text.contains("Ticker: A"));
    }
}
