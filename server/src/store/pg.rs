use async_trait::async_trait;
use serde_json::Value;
use sqlx::{postgres::PgRow, PgPool, Row};
use tracing::warn;
use uuid::Uuid;

use super::{default_bot_config, duplicate_email, inbound_cutoff, ConversationStore};
use crate::{
    error::{AppError, AppResult},
    fields::LeadFields,
    types::{
        normalize_whatsapp_phone, now_iso, BotConfig, Conversation, ConversationMessage,
        ConversationStatus, CreateStudioBody, MessageRole, Studio, TestTemplate, UpdateStudioBody,
    },
};

fn open_statuses() -> Vec<&'static str> {
    ConversationStatus::OPEN.map(ConversationStatus::as_str).to_vec()
}

const CONVERSATION_COLUMNS: &str = "id, studio_id, user_phone, status, current_step, \
     collected_data, pending_update, tools_used, lead_sent_at, closed_at, created_at, updated_at";

pub struct PgStore {
    db: PgPool,
}

impl PgStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

fn json_text<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
}

fn parse_json_text(value: &str) -> Value {
    serde_json::from_str(value).unwrap_or(Value::Null)
}

fn studio_write_error(err: sqlx::Error, email: &str) -> AppError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => duplicate_email(email),
        _ => AppError::Database(err),
    }
}

fn parse_studio_row(row: &PgRow) -> Studio {
    Studio {
        id: row.get("id"),
        name: row.get("name"),
        email: row.get("email"),
        whatsapp_number: row.get("whatsapp_number"),
        webhook_url: row.get("webhook_url"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn parse_bot_config_row(row: &PgRow) -> BotConfig {
    BotConfig {
        studio_id: row.get("studio_id"),
        welcome_message: row.get("welcome_message"),
        branding_color: row.get("branding_color"),
        logo_url: row.get("logo_url"),
        questions: serde_json::from_str(&row.get::<String, _>("questions")).unwrap_or_default(),
        updated_at: row.get("updated_at"),
    }
}

fn parse_conversation_row(row: &PgRow) -> Conversation {
    let id: String = row.get("id");
    let status = row
        .get::<String, _>("status")
        .parse::<ConversationStatus>()
        .unwrap_or_else(|err| {
            warn!(
                conversation_id = %id,
                error = %err,
                "stored status unreadable, treating as closed"
            );
            ConversationStatus::Closed
        });
    Conversation {
        status,
        studio_id: row.get("studio_id"),
        user_phone: row.get("user_phone"),
        current_step: row.get("current_step"),
        collected_data: serde_json::from_str::<LeadFields>(&row.get::<String, _>("collected_data"))
            .unwrap_or_default(),
        pending_update: row
            .get::<Option<String>, _>("pending_update")
            .and_then(|raw| serde_json::from_str::<LeadFields>(&raw).ok()),
        tools_used: serde_json::from_str::<Vec<String>>(&row.get::<String, _>("tools_used"))
            .unwrap_or_default(),
        lead_sent_at: row.get("lead_sent_at"),
        closed_at: row.get("closed_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        id,
    }
}

fn parse_message_row(row: &PgRow) -> ConversationMessage {
    ConversationMessage {
        id: row.get("id"),
        conversation_id: row.get("conversation_id"),
        role: MessageRole::parse(&row.get::<String, _>("role")),
        content: row.get("content"),
        provider_message_id: row.get("provider_message_id"),
        created_at: row.get("created_at"),
    }
}

fn parse_template_row(row: &PgRow) -> TestTemplate {
    TestTemplate {
        id: row.get("id"),
        name: row.get("name"),
        description: row.get("description"),
        messages: parse_json_text(&row.get::<String, _>("messages")),
        final_data: parse_json_text(&row.get::<String, _>("final_data")),
        final_status: row.get("final_status"),
        message_count: row.get("message_count"),
        lead_sent: row.get("lead_sent"),
        events: parse_json_text(&row.get::<String, _>("events")),
        created_at: row.get("created_at"),
    }
}

#[async_trait]
impl ConversationStore for PgStore {
    async fn ping(&self) -> AppResult<()> {
        sqlx::query("SELECT 1").execute(&self.db).await?;
        Ok(())
    }

    async fn list_studios(&self) -> AppResult<Vec<Studio>> {
        let rows = sqlx::query("SELECT * FROM studios ORDER BY created_at ASC")
            .fetch_all(&self.db)
            .await?;
        Ok(rows.iter().map(parse_studio_row).collect())
    }

    async fn get_studio(&self, id: &str) -> AppResult<Option<Studio>> {
        let row = sqlx::query("SELECT * FROM studios WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.db)
            .await?;
        Ok(row.as_ref().map(parse_studio_row))
    }

    async fn find_studio_by_whatsapp(&self, number: &str) -> AppResult<Option<Studio>> {
        let Some(digits) = normalize_whatsapp_phone(number) else {
            return Ok(None);
        };
        let row = sqlx::query(
            "SELECT * FROM studios \
             WHERE regexp_replace(COALESCE(whatsapp_number, ''), '[^0-9]', '', 'g') = $1 \
             ORDER BY created_at ASC LIMIT 1",
        )
        .bind(digits)
        .fetch_optional(&self.db)
        .await?;
        Ok(row.as_ref().map(parse_studio_row))
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
        let mut tx = self.db.begin().await?;
        sqlx::query(
            "INSERT INTO studios (id, name, email, whatsapp_number, webhook_url, created_at, updated_at) \
             VALUES ($1,$2,$3,$4,$5,$6,$7)",
        )
        .bind(&studio.id)
        .bind(&studio.name)
        .bind(&studio.email)
        .bind(&studio.whatsapp_number)
        .bind(&studio.webhook_url)
        .bind(&studio.created_at)
        .bind(&studio.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|err| studio_write_error(err, &studio.email))?;

        let config = default_bot_config(&studio.id);
        sqlx::query(
            "INSERT INTO bot_configs (studio_id, welcome_message, branding_color, logo_url, questions, updated_at) \
             VALUES ($1,$2,$3,$4,$5,$6)",
        )
        .bind(&config.studio_id)
        .bind(&config.welcome_message)
        .bind(&config.branding_color)
        .bind(&config.logo_url)
        .bind(json_text(&config.questions))
        .bind(&config.updated_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(studio)
    }

    async fn update_studio(&self, id: &str, body: UpdateStudioBody) -> AppResult<Option<Studio>> {
        let Some(mut studio) = self.get_studio(id).await? else {
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
        sqlx::query(
            "UPDATE studios SET name = $2, email = $3, whatsapp_number = $4, webhook_url = $5, updated_at = $6 \
             WHERE id = $1",
        )
        .bind(&studio.id)
        .bind(&studio.name)
        .bind(&studio.email)
        .bind(&studio.whatsapp_number)
        .bind(&studio.webhook_url)
        .bind(&studio.updated_at)
        .execute(&self.db)
        .await
        .map_err(|err| studio_write_error(err, &studio.email))?;
        Ok(Some(studio))
    }

    async fn get_bot_config(&self, studio_id: &str) -> AppResult<Option<BotConfig>> {
        let row = sqlx::query("SELECT * FROM bot_configs WHERE studio_id = $1")
            .bind(studio_id)
            .fetch_optional(&self.db)
            .await?;
        Ok(row.as_ref().map(parse_bot_config_row))
    }

    async fn upsert_bot_config(&self, config: BotConfig) -> AppResult<BotConfig> {
        sqlx::query(
            "INSERT INTO bot_configs (studio_id, welcome_message, branding_color, logo_url, questions, updated_at) \
             VALUES ($1,$2,$3,$4,$5,$6) \
             ON CONFLICT (studio_id) DO UPDATE SET \
               welcome_message = EXCLUDED.welcome_message, \
               branding_color = EXCLUDED.branding_color, \
               logo_url = EXCLUDED.logo_url, \
               questions = EXCLUDED.questions, \
               updated_at = EXCLUDED.updated_at",
        )
        .bind(&config.studio_id)
        .bind(&config.welcome_message)
        .bind(&config.branding_color)
        .bind(&config.logo_url)
        .bind(json_text(&config.questions))
        .bind(&config.updated_at)
        .execute(&self.db)
        .await?;
        Ok(config)
    }

    async fn find_open_conversation(
        &self,
        studio_id: &str,
        user_phone: &str,
    ) -> AppResult<Option<Conversation>> {
        let row = sqlx::query(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations \
             WHERE studio_id = $1 AND user_phone = $2 AND status = ANY($3) \
             ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(studio_id)
        .bind(user_phone)
        .bind(open_statuses())
        .fetch_optional(&self.db)
        .await?;
        Ok(row.as_ref().map(parse_conversation_row))
    }

    async fn get_conversation(&self, id: &str) -> AppResult<Option<Conversation>> {
        let row = sqlx::query(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.db)
        .await?;
        Ok(row.as_ref().map(parse_conversation_row))
    }

    async fn insert_conversation(&self, conversation: &Conversation) -> AppResult<()> {
        sqlx::query(&format!(
            "INSERT INTO conversations ({CONVERSATION_COLUMNS}) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12)"
        ))
        .bind(&conversation.id)
        .bind(&conversation.studio_id)
        .bind(&conversation.user_phone)
        .bind(conversation.status.as_str())
        .bind(conversation.current_step)
        .bind(json_text(&conversation.collected_data))
        .bind(conversation.pending_update.as_ref().map(json_text))
        .bind(json_text(&conversation.tools_used))
        .bind(&conversation.lead_sent_at)
        .bind(&conversation.closed_at)
        .bind(&conversation.created_at)
        .bind(&conversation.updated_at)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn save_conversation(&self, conversation: &Conversation) -> AppResult<()> {
        sqlx::query(
            "UPDATE conversations SET status = $2, current_step = $3, collected_data = $4, \
               pending_update = $5, tools_used = $6, lead_sent_at = $7, closed_at = $8, updated_at = $9 \
             WHERE id = $1",
        )
        .bind(&conversation.id)
        .bind(conversation.status.as_str())
        .bind(conversation.current_step)
        .bind(json_text(&conversation.collected_data))
        .bind(conversation.pending_update.as_ref().map(json_text))
        .bind(json_text(&conversation.tools_used))
        .bind(&conversation.lead_sent_at)
        .bind(&conversation.closed_at)
        .bind(&conversation.updated_at)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn close_open_conversations(&self, studio_id: &str, user_phone: &str) -> AppResult<u64> {
        let now = now_iso();
        let result = sqlx::query(
            "UPDATE conversations SET status = 'closed', closed_at = $3, updated_at = $3 \
             WHERE studio_id = $1 AND user_phone = $2 AND status = ANY($4)",
        )
        .bind(studio_id)
        .bind(user_phone)
        .bind(now)
        .bind(open_statuses())
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected())
    }

    async fn list_conversations(
        &self,
        studio_id: &str,
        offset: u64,
        limit: u32,
    ) -> AppResult<(Vec<Conversation>, i64)> {
        let total = sqlx::query("SELECT COUNT(*) AS total FROM conversations WHERE studio_id = $1")
            .bind(studio_id)
            .fetch_one(&self.db)
            .await?
            .get::<i64, _>("total");
        let rows = sqlx::query(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE studio_id = $1 \
             ORDER BY created_at DESC OFFSET $2 LIMIT $3"
        ))
        .bind(studio_id)
        .bind(i64::try_from(offset).unwrap_or(i64::MAX))
        .bind(i64::from(limit))
        .fetch_all(&self.db)
        .await?;
        Ok((rows.iter().map(parse_conversation_row).collect(), total))
    }

    async fn append_message(&self, message: &ConversationMessage) -> AppResult<()> {
        sqlx::query(
            "INSERT INTO conversation_messages (id, conversation_id, role, content, provider_message_id, created_at) \
             VALUES ($1,$2,$3,$4,$5,$6)",
        )
        .bind(&message.id)
        .bind(&message.conversation_id)
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(&message.provider_message_id)
        .bind(&message.created_at)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn list_messages(&self, conversation_id: &str) -> AppResult<Vec<ConversationMessage>> {
        let rows = sqlx::query(
            "SELECT * FROM conversation_messages WHERE conversation_id = $1 ORDER BY seq ASC",
        )
        .bind(conversation_id)
        .fetch_all(&self.db)
        .await?;
        Ok(rows.iter().map(parse_message_row).collect())
    }

    async fn recent_messages(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> AppResult<Vec<ConversationMessage>> {
        let rows = sqlx::query(
            "SELECT * FROM ( \
               SELECT * FROM conversation_messages WHERE conversation_id = $1 \
               ORDER BY seq DESC LIMIT $2 \
             ) recent ORDER BY seq ASC",
        )
        .bind(conversation_id)
        .bind(limit as i64)
        .fetch_all(&self.db)
        .await?;
        Ok(rows.iter().map(parse_message_row).collect())
    }

    async fn inbound_seen(&self, message_sid: &str) -> AppResult<bool> {
        let row = sqlx::query("SELECT 1 FROM inbound_messages WHERE message_sid = $1")
            .bind(message_sid)
            .fetch_optional(&self.db)
            .await?;
        Ok(row.is_some())
    }

    async fn record_inbound(&self, message_sid: &str) -> AppResult<bool> {
        sqlx::query("DELETE FROM inbound_messages WHERE received_at < $1")
            .bind(inbound_cutoff())
            .execute(&self.db)
            .await?;
        let result = sqlx::query(
            "INSERT INTO inbound_messages (message_sid, received_at) VALUES ($1,$2) \
             ON CONFLICT (message_sid) DO NOTHING",
        )
        .bind(message_sid)
        .bind(now_iso())
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_templates(&self) -> AppResult<Vec<TestTemplate>> {
        let rows = sqlx::query("SELECT * FROM test_templates ORDER BY created_at DESC")
            .fetch_all(&self.db)
            .await?;
        Ok(rows.iter().map(parse_template_row).collect())
    }

    async fn create_template(&self, template: TestTemplate) -> AppResult<TestTemplate> {
        sqlx::query(
            "INSERT INTO test_templates \
               (id, name, description, messages, final_data, final_status, message_count, lead_sent, events, created_at) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10)",
        )
        .bind(&template.id)
        .bind(&template.name)
        .bind(&template.description)
        .bind(json_text(&template.messages))
        .bind(json_text(&template.final_data))
        .bind(&template.final_status)
        .bind(template.message_count)
        .bind(template.lead_sent)
        .bind(json_text(&template.events))
        .bind(&template.created_at)
        .execute(&self.db)
        .await?;
        Ok(template)
    }

    async fn delete_template(&self, id: &str) -> AppResult<bool> {
        let result = sqlx::query("DELETE FROM test_templates WHERE id = $1")
            .bind(id)
            .execute(&self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
