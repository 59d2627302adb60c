use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{default_bot_config, digits_match, duplicate_email, inbound_cutoff, ConversationStore};
use crate::{
    error::AppResult,
    types::{
        now_iso, BotConfig, Conversation, ConversationMessage, ConversationStatus,
        CreateStudioBody, Studio, TestTemplate, UpdateStudioBody,
    },
};

#[derive(Default)]
struct MemoryData {
    studios: HashMap<String, Studio>,
    bot_configs: HashMap<String, BotConfig>,
    conversations: HashMap<String, Conversation>,
    messages: HashMap<String, Vec<ConversationMessage>>,
    /// message sid -> received at
    inbound: HashMap<String, String>,
    templates: Vec<TestTemplate>,
}

#[derive(Default)]
pub struct MemoryStore {
    data: RwLock<MemoryData>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn ping(&self) -> AppResult<()> {
        Ok(())
    }

    async fn list_studios(&self) -> AppResult<Vec<Studio>> {
        let data = self.data.read().await;
        let mut studios: Vec<Studio> = data.studios.values().cloned().collect();
        studios.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(studios)
    }

    async fn get_studio(&self, id: &str) -> AppResult<Option<Studio>> {
        Ok(self.data.read().await.studios.get(id).cloned())
    }

    async fn find_studio_by_whatsapp(&self, number: &str) -> AppResult<Option<Studio>> {
        let data = self.data.read().await;
        Ok(data
            .studios
            .values()
            .find(|studio| digits_match(studio.whatsapp_number.as_deref(), number))
            .cloned())
    }

    async fn create_studio(&self, body: CreateStudioBody) -> AppResult<Studio> {
        let now = now_iso();
        let studio = Studio {
            id: Uuid::new_v4().to_string(),
            name: body.name.trim().to_string(),
            email: body.email.trim().to_string(),
            whatsapp_number: body.whatsapp_number,
            webhook_url: body.webhook_url,
            created_at: now.clone(),
            updated_at: now,
        };
        let mut data = self.data.write().await;
        if data.studios.values().any(|s| s.email == studio.email) {
            return Err(duplicate_email(&studio.email));
        }
        data.bot_configs
            .insert(studio.id.clone(), default_bot_config(&studio.id));
        data.studios.insert(studio.id.clone(), studio.clone());
        Ok(studio)
    }

    async fn update_studio(&self, id: &str, body: UpdateStudioBody) -> AppResult<Option<Studio>> {
        let mut data = self.data.write().await;
        if let Some(email) = body.email.as_deref().map(str::trim) {
            if data.studios.values().any(|s| s.id != id && s.email == email) {
                return Err(duplicate_email(email));
            }
        }
        let Some(studio) = data.studios.get_mut(id) else {
            return Ok(None);
        };
        if let Some(name) = body.name {
            studio.name = name.trim().to_string();
        }
        if let Some(email) = body.email {
            studio.email = email.trim().to_string();
        }
        if let Some(number) = body.whatsapp_number {
            studio.whatsapp_number = Some(number).filter(|n| !n.trim().is_empty());
        }
        if let Some(url) = body.webhook_url {
            studio.webhook_url = Some(url).filter(|u| !u.trim().is_empty());
        }
        studio.updated_at = now_iso();
        Ok(Some(studio.clone()))
    }

    async fn get_bot_config(&self, studio_id: &str) -> AppResult<Option<BotConfig>> {
        Ok(self.data.read().await.bot_configs.get(studio_id).cloned())
    }

    async fn upsert_bot_config(&self, config: BotConfig) -> AppResult<BotConfig> {
        self.data
            .write()
            .await
            .bot_configs
            .insert(config.studio_id.clone(), config.clone());
        Ok(config)
    }

    async fn find_open_conversation(
        &self,
        studio_id: &str,
        user_phone: &str,
    ) -> AppResult<Option<Conversation>> {
        let data = self.data.read().await;
        Ok(data
            .conversations
            .values()
            .filter(|c| {
                c.studio_id == studio_id && c.user_phone == user_phone && c.status.is_open()
            })
            .max_by(|a, b| a.created_at.cmp(&b.created_at))
            .cloned())
    }

    async fn get_conversation(&self, id: &str) -> AppResult<Option<Conversation>> {
        Ok(self.data.read().await.conversations.get(id).cloned())
    }

    async fn insert_conversation(&self, conversation: &Conversation) -> AppResult<()> {
        self.data
            .write()
            .await
            .conversations
            .insert(conversation.id.clone(), conversation.clone());
        Ok(())
    }

    async fn save_conversation(&self, conversation: &Conversation) -> AppResult<()> {
        self.insert_conversation(conversation).await
    }

    async fn close_open_conversations(&self, studio_id: &str, user_phone: &str) -> AppResult<u64> {
        let mut data = self.data.write().await;
        let now = now_iso();
        let mut closed = 0;
        for conversation in data.conversations.values_mut() {
            if conversation.studio_id == studio_id
                && conversation.user_phone == user_phone
                && conversation.status.is_open()
            {
                conversation.status = ConversationStatus::Closed;
                conversation.closed_at = Some(now.clone());
                conversation.updated_at = now.clone();
                closed += 1;
            }
        }
        Ok(closed)
    }

    async fn list_conversations(
        &self,
        studio_id: &str,
        offset: u64,
        limit: u32,
    ) -> AppResult<(Vec<Conversation>, i64)> {
        let data = self.data.read().await;
        let mut conversations: Vec<Conversation> = data
            .conversations
            .values()
            .filter(|c| c.studio_id == studio_id)
            .cloned()
            .collect();
        conversations.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let total = conversations.len() as i64;
        let page = conversations
            .into_iter()
            .skip(usize::try_from(offset).unwrap_or(usize::MAX))
            .take(limit as usize)
            .collect();
        Ok((page, total))
    }

    async fn append_message(&self, message: &ConversationMessage) -> AppResult<()> {
        self.data
            .write()
            .await
            .messages
            .entry(message.conversation_id.clone())
            .or_default()
            .push(message.clone());
        Ok(())
    }

    async fn list_messages(&self, conversation_id: &str) -> AppResult<Vec<ConversationMessage>> {
        Ok(self
            .data
            .read()
            .await
            .messages
            .get(conversation_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn recent_messages(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> AppResult<Vec<ConversationMessage>> {
        let messages = self.list_messages(conversation_id).await?;
        let skip = messages.len().saturating_sub(limit);
        Ok(messages.into_iter().skip(skip).collect())
    }

    async fn inbound_seen(&self, message_sid: &str) -> AppResult<bool> {
        Ok(self.data.read().await.inbound.contains_key(message_sid))
    }

    async fn record_inbound(&self, message_sid: &str) -> AppResult<bool> {
        let cutoff = inbound_cutoff();
        let mut data = self.data.write().await;
        data.inbound.retain(|_, received_at| *received_at >= cutoff);
        if data.inbound.contains_key(message_sid) {
            return Ok(false);
        }
        data.inbound.insert(message_sid.to_string(), now_iso());
        Ok(true)
    }

    async fn list_templates(&self) -> AppResult<Vec<TestTemplate>> {
        let mut templates = self.data.read().await.templates.clone();
        templates.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(templates)
    }

    async fn create_template(&self, template: TestTemplate) -> AppResult<TestTemplate> {
        self.data.write().await.templates.push(template.clone());
        Ok(template)
    }

    async fn delete_template(&self, id: &str) -> AppResult<bool> {
        let mut data = self.data.write().await;
        let before = data.templates.len();
        data.templates.retain(|t| t.id != id);
        Ok(data.templates.len() != before)
    }
}
