//! Discord webhook alerts.
//!
//! Structured embeds for detected opportunities, executed trades, errors,
//! kill-switch flips, and the daily summary. Alerts are strictly
//! best-effort: an unset webhook disables them, and delivery failures are
//! logged and dropped, never propagated into the trading path.

use chrono::Utc;
use serde_json::json;
use tracing::{debug, warn};

use crate::risk::GovernorSummary;
use crate::types::{Opportunity, OpportunityState};

const COLOR_GREEN: u32 = 0x2ECC71;
const COLOR_RED: u32 = 0xE74C3C;
const COLOR_BLUE: u32 = 0x3498DB;
const COLOR_ORANGE: u32 = 0xE67E22;

/// Webhook alert sink.
pub struct AlertSink {
    webhook_url: Option<String>,
    http: reqwest::Client,
}

impl AlertSink {
    pub fn from_env() -> Self {
        let webhook_url = std::env::var("DISCORD_WEBHOOK_URL")
            .ok()
            .filter(|s| !s.trim().is_empty());
        if webhook_url.is_none() {
            debug!("DISCORD_WEBHOOK_URL not set, alerts disabled");
        }
        Self {
            webhook_url,
            http: reqwest::Client::new(),
        }
    }

    pub fn disabled() -> Self {
        Self {
            webhook_url: None,
            http: reqwest::Client::new(),
        }
    }

    async fn send(&self, embed: serde_json::Value) {
        let Some(url) = &self.webhook_url else {
            return;
        };
        let payload = json!({ "embeds": [embed] });
        match self.http.post(url).json(&payload).send().await {
            Ok(response) if !response.status().is_success() => {
                warn!("alert webhook returned {}", response.status());
            }
            Err(e) => warn!("alert webhook failed: {}", e),
            _ => {}
        }
    }

    pub async fn opportunity_detected(&self, opp: &Opportunity) {
        let legs_text = opp
            .legs
            .iter()
            .map(|l| {
                format!(
                    "  {} {} {} @ {}c x{}",
                    l.action.to_string().to_uppercase(),
                    l.side,
                    l.ticker,
                    l.limit_price,
                    l.desired_count
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        self.send(json!({
            "title": format!("Opportunity: {}", opp.signal),
            "description": format!(
                "**Edge:** {}c  **Net:** {}c  **Score:** {:.4}\n**Confidence:** {:.2}\n```\n{}\n```",
                opp.raw_edge, opp.net_magnitude, opp.score, opp.confidence, legs_text
            ),
            "color": COLOR_BLUE,
            "timestamp": Utc::now().to_rfc3339(),
        }))
        .await;
    }

    pub async fn execution_finished(&self, opp: &Opportunity, filled: i64, dry_run: bool) {
        let color = match opp.state {
            OpportunityState::Filled => COLOR_GREEN,
            OpportunityState::Partial => COLOR_ORANGE,
            _ => COLOR_RED,
        };
        self.send(json!({
            "title": format!(
                "{}{}: {}",
                if dry_run { "[DRY RUN] " } else { "" },
                opp.state,
                opp.signal
            ),
            "description": format!(
                "Opportunity `{}`\nFilled {} of {} contracts",
                opp.id, filled, opp.desired_count()
            ),
            "color": color,
            "timestamp": Utc::now().to_rfc3339(),
        }))
        .await;
    }

    pub async fn error(&self, title: &str, detail: &str) {
        self.send(json!({
            "title": format!("Error: {}", title),
            "description": detail.chars().take(1_500).collect::<String>(),
            "color": COLOR_RED,
            "timestamp": Utc::now().to_rfc3339(),
        }))
        .await;
    }

    pub async fn kill_switch(&self, engaged: bool, reason: &str) {
        self.send(json!({
            "title": if engaged { "KILL SWITCH ENGAGED" } else { "Kill switch disengaged" },
            "description": reason,
            "color": if engaged { COLOR_RED } else { COLOR_GREEN },
            "timestamp": Utc::now().to_rfc3339(),
        }))
        .await;
    }

    pub async fn daily_summary(
        &self,
        summary: &GovernorSummary,
        opportunities_today: u64,
        trades_today: u64,
    ) {
        self.send(json!({
            "title": "Daily summary",
            "description": format!(
                "**Balance:** {}c\n**Daily P&L:** {}c\n**Open positions:** {}\n**Opportunities:** {}\n**Trades:** {}",
                summary.balance_cents,
                summary.daily_pnl_cents,
                summary.ledger.open_positions,
                opportunities_today,
                trades_today
            ),
            "color": if summary.daily_pnl_cents >= 0 { COLOR_GREEN } else { COLOR_ORANGE },
            "timestamp": Utc::now().to_rfc3339(),
        }))
        .await;
    }
}
