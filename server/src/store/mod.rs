//! Persistence seam. `PgStore` backs production, `MemoryStore` backs tests and
//! database-less local runs.

mod memory;
mod pg;

pub use memory::MemoryStore;
pub use pg::PgStore;

use async_trait::async_trait;
use chrono::{Duration, Utc};

use crate::{
    error::{AppError, AppResult},
    types::{
        now_iso, BotConfig, BotQuestion, Conversation, ConversationMessage, CreateStudioBody,
        Studio, TestTemplate, UpdateStudioBody,
    },
};

#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn ping(&self) -> AppResult<()>;

    async fn list_studios(&self) -> AppResult<Vec<Studio>>;
    async fn get_studio(&self, id: &str) -> AppResult<Option<Studio>>;
    /// Matches on digits only, so stored numbers may keep their `whatsapp:+` prefix.
    async fn find_studio_by_whatsapp(&self, number: &str) -> AppResult<Option<Studio>>;
    async fn create_studio(&self, body: CreateStudioBody) -> AppResult<Studio>;
    async fn update_studio(&self, id: &str, body: UpdateStudioBody) -> AppResult<Option<Studio>>;

    async fn get_bot_config(&self, studio_id: &str) -> AppResult<Option<BotConfig>>;
    async fn upsert_bot_config(&self, config: BotConfig) -> AppResult<BotConfig>;

    async fn find_open_conversation(
        &self,
        studio_id: &str,
        user_phone: &str,
    ) -> AppResult<Option<Conversation>>;
    async fn get_conversation(&self, id: &str) -> AppResult<Option<Conversation>>;
    async fn insert_conversation(&self, conversation: &Conversation) -> AppResult<()>;
    async fn save_conversation(&self, conversation: &Conversation) -> AppResult<()>;
    /// Closes every open conversation of a (studio, phone) pair; returns how many.
    async fn close_open_conversations(&self, studio_id: &str, user_phone: &str) -> AppResult<u64>;
    /// Newest first, plus the total count for pagination.
    async fn list_conversations(
        &self,
        studio_id: &str,
        offset: u64,
        limit: u32,
    ) -> AppResult<(Vec<Conversation>, i64)>;

    async fn append_message(&self, message: &ConversationMessage) -> AppResult<()>;
    async fn list_messages(&self, conversation_id: &str) -> AppResult<Vec<ConversationMessage>>;
    /// The last `limit` messages in chronological order.
    async fn recent_messages(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> AppResult<Vec<ConversationMessage>>;

    async fn inbound_seen(&self, message_sid: &str) -> AppResult<bool>;
    /// Records a handled provider message id and forgets ids older than
    /// [`INBOUND_RETENTION_DAYS`]; false when it was already recorded.
    async fn record_inbound(&self, message_sid: &str) -> AppResult<bool>;

    async fn list_templates(&self) -> AppResult<Vec<TestTemplate>>;
    async fn create_template(&self, template: TestTemplate) -> AppResult<TestTemplate>;
    async fn delete_template(&self, id: &str) -> AppResult<bool>;
}

/// Provider retries stop well before this.
pub const INBOUND_RETENTION_DAYS: i64 = 7;

pub(crate) fn inbound_cutoff() -> String {
    (Utc::now() - Duration::days(INBOUND_RETENTION_DAYS)).to_rfc3339()
}

fn question(id: i32, text: &str, field: &str, choices: &[&str]) -> BotQuestion {
    BotQuestion {
        id,
        text: text.to_string(),
        field: field.to_string(),
        kind: if choices.is_empty() { "text" } else { "choice" }.to_string(),
        choices: choices.iter().map(|c| c.to_string()).collect(),
    }
}

/// Configuration a new studio starts with.
pub fn default_bot_config(studio_id: &str) -> BotConfig {
    BotConfig {
        studio_id: studio_id.to_string(),
        welcome_message: "Ei 👋 Què t'agradaria tatuar-te?".to_string(),
        branding_color: "#FF6B6B".to_string(),
        logo_url: None,
        questions: vec![
            question(1, "Què t'agradaria tatuar-te?", "description", &[]),
            question(
                2,
                "On al cos, i quina mida? S fins 5cm, M 5-12cm, L 12-20cm, XL secció completa",
                "placement_size",
                &[],
            ),
            question(
                3,
                "Quin estil t'agrada: tradicional, realisme, línia fina, neo-tradicional o abstracte?",
                "style",
                &["Tradicional", "Realisme", "Línia fina", "Neo-tradicional", "Abstracte"],
            ),
            question(
                4,
                "Prefereixes color o blanc i negre?",
                "color",
                &["Color", "Blanc i negre"],
            ),
            question(5, "Quan t'aniria bé, més o menys?", "timing_preference", &[]),
            question(6, "Com et dius?", "name", &[]),
        ],
        updated_at: now_iso(),
    }
}

pub(crate) fn duplicate_email(email: &str) -> AppError {
    AppError::Conflict(format!("a studio with email {email} already exists"))
}

pub(crate) fn digits_match(stored: Option<&str>, wanted: &str) -> bool {
    let Some(stored) = stored.and_then(crate::types::normalize_whatsapp_phone) else {
        return false;
    };
    crate::types::normalize_whatsapp_phone(wanted).is_some_and(|wanted| wanted == stored)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_asks_for_minimum_fields_first() {
        let config = default_bot_config("studio-1");
        let fields: Vec<&str> = config.questions.iter().map(|q| q.field.as_str()).collect();
        assert_eq!(&fields[..2], &["description", "placement_size"]);
        assert_eq!(config.questions[2].kind, "choice");
    }

    #[test]
    fn whatsapp_numbers_match_on_digits() {
        assert!(digits_match(Some("whatsapp:+14155238886"), "+1 415 523 8886"));
        assert!(!digits_match(Some("whatsapp:+14155238886"), "+14155238887"));
        assert!(!digits_match(None, "+14155238886"));
    }
}
