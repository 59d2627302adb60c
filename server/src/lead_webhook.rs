//! Delivery of qualified leads to the studio's own webhook.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{error, info, warn};

use crate::types::{now_iso, Conversation, QualifiedLead, Studio};

const USER_AGENT: &str = concat!("lead-bot/", env!("CARGO_PKG_VERSION"));

#[async_trait]
pub trait LeadNotifier: Send + Sync {
    /// Returns true when the studio acknowledged the lead with a 2xx.
    async fn deliver(&self, studio: &Studio, lead: &QualifiedLead) -> bool;
}

/// `data` is the phone plus every collected field, flattened.
pub fn build_qualified_lead(conversation: &Conversation) -> QualifiedLead {
    let mut data = Map::new();
    data.insert(
        "phone".to_string(),
        Value::String(conversation.user_phone.clone()),
    );
    if let Ok(Value::Object(fields)) = serde_json::to_value(&conversation.collected_data) {
        data.extend(fields);
    }
    QualifiedLead {
        lead_id: conversation.id.clone(),
        studio_id: conversation.studio_id.clone(),
        timestamp: now_iso(),
        source: "whatsapp".to_string(),
        data: Value::Object(data),
    }
}

pub struct HttpLeadNotifier {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpLeadNotifier {
    pub fn new(client: reqwest::Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }
}

#[async_trait]
impl LeadNotifier for HttpLeadNotifier {
    async fn deliver(&self, studio: &Studio, lead: &QualifiedLead) -> bool {
        let Some(url) = studio
            .webhook_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
        else {
            warn!(
                studio_id = %studio.id,
                lead_id = %lead.lead_id,
                "studio has no webhook url, lead not delivered"
            );
            return false;
        };

        let response = self
            .client
            .post(url)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .timeout(self.timeout)
            .json(lead)
            .send()
            .await;

        match response {
            Ok(response) if response.status().is_success() => {
                info!(
                    studio_id = %studio.id,
                    lead_id = %lead.lead_id,
                    status = %response.status(),
                    "lead delivered"
                );
                true
            }
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                error!(
                    studio_id = %studio.id,
                    lead_id = %lead.lead_id,
                    %status,
                    body = %body,
                    "lead webhook rejected the lead"
                );
                false
            }
            Err(err) => {
                error!(
                    studio_id = %studio.id,
                    lead_id = %lead.lead_id,
                    error = %err,
                    "lead webhook request failed"
                );
                false
            }
        }
    }
}
