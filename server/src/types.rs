use std::{collections::HashMap, str::FromStr, sync::Arc};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};

use crate::{
    config::Settings, fields::LeadFields, lead_webhook::LeadNotifier, llm::ChatModel,
    messaging::MessageSender, store::ConversationStore,
};

pub fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

/// Digits only, so `whatsapp:+34 600 11 22 33` and `34600112233` compare equal.
pub fn normalize_whatsapp_phone(raw: &str) -> Option<String> {
    let digits = raw
        .chars()
        .filter(|c| c.is_ascii_digit())
        .collect::<String>();
    if digits.is_empty() {
        None
    } else {
        Some(digits)
    }
}

/// Strips the Twilio `whatsapp:` channel prefix.
pub fn strip_channel_prefix(raw: &str) -> &str {
    raw.trim().strip_prefix("whatsapp:").unwrap_or(raw.trim())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Studio {
    pub id: String,
    pub name: String,
    pub email: String,
    pub whatsapp_number: Option<String>,
    pub webhook_url: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BotQuestion {
    pub id: i32,
    pub text: String,
    pub field: String,
    #[serde(rename = "type", default = "default_question_kind")]
    pub kind: String,
    #[serde(default)]
    pub choices: Vec<String>,
}

fn default_question_kind() -> String {
    "text".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BotConfig {
    pub studio_id: String,
    pub welcome_message: String,
    pub branding_color: String,
    pub logo_url: Option<String>,
    #[serde(default)]
    pub questions: Vec<BotQuestion>,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Active,
    PendingConfirmation,
    PendingUpdateConfirmation,
    Qualified,
    Closed,
    Dropped,
}

impl ConversationStatus {
    pub const OPEN: [ConversationStatus; 4] = [
        ConversationStatus::Active,
        ConversationStatus::PendingConfirmation,
        ConversationStatus::PendingUpdateConfirmation,
        ConversationStatus::Qualified,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ConversationStatus::Active => "active",
            ConversationStatus::PendingConfirmation => "pending_confirmation",
            ConversationStatus::PendingUpdateConfirmation => "pending_update_confirmation",
            ConversationStatus::Qualified => "qualified",
            ConversationStatus::Closed => "closed",
            ConversationStatus::Dropped => "dropped",
        }
    }

    pub fn is_open(self) -> bool {
        Self::OPEN.contains(&self)
    }

    pub fn is_pending(self) -> bool {
        matches!(
            self,
            ConversationStatus::PendingConfirmation | ConversationStatus::PendingUpdateConfirmation
        )
    }
}

impl FromStr for ConversationStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "active" => Ok(ConversationStatus::Active),
            "pending_confirmation" => Ok(ConversationStatus::PendingConfirmation),
            "pending_update_confirmation" => Ok(ConversationStatus::PendingUpdateConfirmation),
            "qualified" => Ok(ConversationStatus::Qualified),
            "closed" => Ok(ConversationStatus::Closed),
            "dropped" => Ok(ConversationStatus::Dropped),
            other => Err(format!("unknown conversation status '{other}'")),
        }
    }
}

impl std::fmt::Display for ConversationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub studio_id: String,
    pub user_phone: String,
    pub status: ConversationStatus,
    pub current_step: i32,
    pub collected_data: LeadFields,
    #[serde(default)]
    pub pending_update: Option<LeadFields>,
    #[serde(default)]
    pub tools_used: Vec<String>,
    pub lead_sent_at: Option<String>,
    pub closed_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Conversation {
    pub fn lead_sent(&self) -> bool {
        self.lead_sent_at.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Bot,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Bot => "bot",
        }
    }

    pub fn parse(value: &str) -> Self {
        if value == "user" {
            MessageRole::User
        } else {
            MessageRole::Bot
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMessage {
    pub id: String,
    pub conversation_id: String,
    pub role: MessageRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_message_id: Option<String>,
    pub created_at: String,
}

/// Normalized inbound message. Field meanings follow Twilio's webhook form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    #[serde(rename = "MessageSid", default)]
    pub message_sid: String,
    #[serde(rename = "From")]
    pub from: String,
    #[serde(rename = "To")]
    pub to: String,
    #[serde(rename = "Body", default)]
    pub body: String,
    #[serde(rename = "NumMedia", default)]
    pub num_media: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BotReply {
    pub messages: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub buttons: Vec<String>,
    pub delay_ms: u64,
}

impl BotReply {
    pub fn text(messages: &[&str]) -> Self {
        Self {
            messages: messages.iter().map(|m| m.to_string()).collect(),
            buttons: vec![],
            delay_ms: 800,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualifiedLead {
    pub lead_id: String,
    pub studio_id: String,
    pub timestamp: String,
    pub source: String,
    pub data: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestTemplate {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub messages: Value,
    pub final_data: Value,
    pub final_status: String,
    pub message_count: i32,
    pub lead_sent: bool,
    pub events: Value,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Evaluation {
    pub id: String,
    pub template_id: String,
    pub template_name: String,
    pub config_name: String,
    pub timestamp: String,
    #[serde(default)]
    pub results: Value,
    #[serde(default)]
    pub metrics: Value,
}

pub struct AppState {
    pub settings: Settings,
    pub store: Arc<dyn ConversationStore>,
    pub model: Arc<dyn ChatModel>,
    pub notifier: Arc<dyn LeadNotifier>,
    pub twilio: Option<Arc<dyn MessageSender>>,
    pub cloud_api: Option<Arc<dyn MessageSender>>,
    pub conversation_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    pub evaluations: RwLock<Vec<Evaluation>>,
}

fn lock_key(studio_id: &str, user_phone: &str) -> String {
    format!("{studio_id}:{user_phone}")
}

impl AppState {
    pub fn new(
        settings: Settings,
        store: Arc<dyn ConversationStore>,
        model: Arc<dyn ChatModel>,
        notifier: Arc<dyn LeadNotifier>,
    ) -> Self {
        Self {
            settings,
            store,
            model,
            notifier,
            twilio: None,
            cloud_api: None,
            conversation_locks: Mutex::new(HashMap::new()),
            evaluations: RwLock::new(Vec::new()),
        }
    }

    /// Per (studio, phone) lock so turns of one chat never interleave.
    pub async fn conversation_lock(&self, studio_id: &str, user_phone: &str) -> Arc<Mutex<()>> {
        let mut locks = self.conversation_locks.lock().await;
        locks.entry(lock_key(studio_id, user_phone)).or_default().clone()
    }

    /// Drops the chat's lock entry once no turn holds or awaits it.
    pub async fn release_conversation_lock(&self, studio_id: &str, user_phone: &str) {
        let key = lock_key(studio_id, user_phone);
        let mut locks = self.conversation_locks.lock().await;
        if locks.get(&key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(&key);
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateStudioBody {
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub whatsapp_number: Option<String>,
    #[serde(default)]
    pub webhook_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateStudioBody {
    pub name: Option<String>,
    pub email: Option<String>,
    pub whatsapp_number: Option<String>,
    pub webhook_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BotConfigBody {
    pub welcome_message: Option<String>,
    pub branding_color: Option<String>,
    pub logo_url: Option<String>,
    pub questions: Option<Vec<BotQuestion>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageQuery {
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_page_limit")]
    pub limit: u32,
}

fn default_page() -> u32 {
    1
}

fn default_page_limit() -> u32 {
    10
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BotTestBody {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub studio_id: Option<String>,
    #[serde(default)]
    pub reset: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BotTestQuery {
    pub conversation_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTemplateBody {
    #[serde(default)]
    pub name: String,
    pub description: Option<String>,
    pub messages: Option<Value>,
    pub final_data: Option<Value>,
    pub final_status: Option<String>,
    pub message_count: Option<i32>,
    pub lead_sent: Option<bool>,
    pub events: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct IdQuery {
    pub id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationQuery {
    pub template_id: Option<String>,
    pub config_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateEvaluationBody {
    #[serde(default)]
    pub template_id: String,
    #[serde(default)]
    pub template_name: String,
    #[serde(default)]
    pub config_name: String,
    #[serde(default)]
    pub results: Value,
    #[serde(default)]
    pub metrics: Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings_round_trip_through_from_str() {
        for status in [
            ConversationStatus::Active,
            ConversationStatus::PendingConfirmation,
            ConversationStatus::PendingUpdateConfirmation,
            ConversationStatus::Qualified,
            ConversationStatus::Closed,
            ConversationStatus::Dropped,
        ] {
            assert_eq!(status.as_str().parse::<ConversationStatus>(), Ok(status));
        }
        assert!("resolved".parse::<ConversationStatus>().is_err());
    }

    #[test]
    fn qualified_stays_open_for_follow_ups() {
        assert!(ConversationStatus::Qualified.is_open());
        assert!(!ConversationStatus::Dropped.is_open());
        assert!(ConversationStatus::PendingUpdateConfirmation.is_pending());
    }

    #[test]
    fn phone_numbers_normalize_to_digits() {
        assert_eq!(
            normalize_whatsapp_phone("whatsapp:+34 600 11 22 33").as_deref(),
            Some("34600112233")
        );
        assert_eq!(normalize_whatsapp_phone("whatsapp:"), None);
        assert_eq!(strip_channel_prefix(" whatsapp:+14155238886"), "+14155238886");
        assert_eq!(strip_channel_prefix("+14155238886"), "+14155238886");
    }

    #[test]
    fn twilio_form_fields_deserialize() {
        let raw = r#"{"MessageSid":"SM1","From":"whatsapp:+34600111222","To":"whatsapp:+14155238886","Body":"Hola","NumMedia":"0"}"#;
        let message: InboundMessage = serde_json::from_str(raw).expect("inbound");
        assert_eq!(message.message_sid, "SM1");
        assert_eq!(message.body, "Hola");
        assert_eq!(message.num_media.as_deref(), Some("0"));
    }
}
