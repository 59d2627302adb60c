//! Turn handling: deterministic checks first, then the model, then the status machine.

use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::AppResult,
    fields::{detect_significant_change, format_changes, LeadFields, FIELD_NAMES},
    intent::{
        classify_confirmation, detect_complex_request, detect_exit_intent,
        detect_medical_question, ConfirmationAnswer,
    },
    lead_webhook::build_qualified_lead,
    llm::{parse_reply_messages, ChatMessage, ChatRequest},
    metrics::log_conversation_metrics,
    prompting::{render_system_prompt, SystemPromptContext},
    tools::{tool_definitions, ToolCall},
    types::{
        now_iso, strip_channel_prefix, AppState, BotConfig, BotReply, Conversation,
        ConversationMessage, ConversationStatus, InboundMessage, MessageRole, Studio,
    },
};

pub const ERROR_REPLY: &[&str] = &["Perdona, hi ha hagut un error."];
pub const EXIT_REPLY: &[&str] = &["D'acord!", "Si canvies d'opinió, escriu-me quan vulguis."];
pub const MEDICAL_REPLY: &[&str] = &[
    "No puc donar consells mèdics.",
    "L'estudi segueix protocols estàndard de cura posterior.",
    "Per temes mèdics, consulta un professional.",
];
pub const COMPLEX_REPLY: &[&str] = &[
    "Això necessita una consulta personalitzada amb un artista.",
    "T'agradaria que et contacti algú de l'estudi directament?",
];
pub const LLM_ERROR_REPLY: &[&str] = &[
    "Perdona, hi ha hagut un error.",
    "Pots tornar-ho a intentar?",
];

const RECAP_OPENER: &str = "Perfecte! Deixa'm fer un resum:";
const RECAP_QUESTION: &str = "Vols que passi la info a l'estudi?";
const REVISE_REPLY: &str = "Cap problema, què vols canviar?";
const UPDATE_KEPT_REPLY: &str = "D'acord, ho deixo com estava.";
const UPDATE_APPLIED_REPLY: &str = "Entesos! He actualitzat la info.";
const UPDATE_CONFIRMED_REPLY: &str = "Fet! He actualitzat la info a l'estudi.";
const UPDATE_QUESTION: &str = "Vols que ho actualitzi a l'estudi?";
const GOODBYE_REPLY: &[&str] = &["Gràcies a tu!", "Si necessites res més, aquí estic."];
const GENERIC_PROMPT: &str = "Explica'm una mica més què tens en ment.";

/// Marker kept in `tools_used` once the size-based handoff has been offered.
const COMPLEX_HANDOFF: &str = "complex_handoff";

const PLACEMENT_FIELDS: &[&str] = &["placement", "placement_size", "placement_concept"];

#[derive(Debug, Clone, Default)]
pub struct TurnOutcome {
    pub reply: BotReply,
    pub conversation: Option<Conversation>,
    pub events: Vec<String>,
    pub duplicate: bool,
}

struct Turn<'a> {
    state: &'a AppState,
    studio: Studio,
    config: BotConfig,
    user_phone: String,
    text: String,
    message_sid: Option<String>,
    events: Vec<String>,
    /// Set by a qualifying transition; the lead goes out once the new status is saved.
    lead_due: bool,
}

fn reply(messages: &[&str]) -> BotReply {
    BotReply::text(messages)
}

fn owned_reply(messages: Vec<String>, delay_ms: u64) -> BotReply {
    BotReply {
        messages,
        buttons: vec![],
        delay_ms,
    }
}

pub async fn handle_incoming_message(
    state: &Arc<AppState>,
    inbound: InboundMessage,
) -> AppResult<TurnOutcome> {
    let user_phone = strip_channel_prefix(&inbound.from).to_string();
    let studio_number = strip_channel_prefix(&inbound.to).to_string();

    let Some(studio) = state.store.find_studio_by_whatsapp(&studio_number).await? else {
        warn!(studio_number = %studio_number, "no studio for whatsapp number");
        return Ok(TurnOutcome {
            reply: reply(ERROR_REPLY),
            ..TurnOutcome::default()
        });
    };
    let Some(config) = state.store.get_bot_config(&studio.id).await? else {
        warn!(studio_id = %studio.id, "studio has no bot config");
        return Ok(TurnOutcome {
            reply: reply(ERROR_REPLY),
            ..TurnOutcome::default()
        });
    };

    let studio_id = studio.id.clone();
    let phone = user_phone.clone();
    let lock = state.conversation_lock(&studio_id, &phone).await;
    let outcome = {
        let _guard = lock.lock().await;
        handle_locked(state, studio, config, user_phone, inbound).await
    };
    drop(lock);
    state.release_conversation_lock(&studio_id, &phone).await;
    outcome
}

/// The message id is recorded only after the turn is stored, so a failed turn
/// can be retried by the provider.
async fn handle_locked(
    state: &AppState,
    studio: Studio,
    config: BotConfig,
    user_phone: String,
    inbound: InboundMessage,
) -> AppResult<TurnOutcome> {
    let message_sid = Some(inbound.message_sid.trim().to_string()).filter(|sid| !sid.is_empty());
    if let Some(sid) = message_sid.as_deref() {
        if state.store.inbound_seen(sid).await? {
            info!(studio_id = %studio.id, message_sid = sid, "duplicate inbound message ignored");
            return Ok(TurnOutcome {
                duplicate: true,
                ..TurnOutcome::default()
            });
        }
    }

    let mut turn = Turn {
        state,
        studio,
        config,
        user_phone,
        text: inbound.body.trim().to_string(),
        message_sid,
        events: vec![],
        lead_due: false,
    };
    let existing = state
        .store
        .find_open_conversation(&turn.studio.id, &turn.user_phone)
        .await?;
    let outcome = turn.run(existing).await?;
    if let Some(sid) = turn.message_sid.as_deref() {
        if !state.store.record_inbound(sid).await? {
            debug!(message_sid = sid, "inbound message recorded by another worker");
        }
    }
    Ok(outcome)
}

impl Turn<'_> {
    async fn run(&mut self, existing: Option<Conversation>) -> AppResult<TurnOutcome> {
        let Some(mut conversation) = existing else {
            return self.without_conversation().await;
        };

        if conversation.status.is_pending() {
            if let Some(reply) = self.resolve_pending(&mut conversation) {
                return self.finish(conversation, reply).await;
            }
        }

        if detect_exit_intent(&self.text) {
            self.event("exit_intent");
            conversation.status = if conversation.lead_sent() {
                ConversationStatus::Closed
            } else {
                ConversationStatus::Dropped
            };
            conversation.pending_update = None;
            conversation.closed_at = Some(now_iso());
            return self.finish(conversation, reply(EXIT_REPLY)).await;
        }

        if detect_medical_question(&self.text) {
            self.event("medical_question");
            return self.finish(conversation, reply(MEDICAL_REPLY)).await;
        }

        let size_handoff_offered = conversation.tools_used.iter().any(|t| t == COMPLEX_HANDOFF);
        let collected = if size_handoff_offered {
            LeadFields::default()
        } else {
            conversation.collected_data.clone()
        };
        if detect_complex_request(&self.text, &collected) {
            self.event("complex_request");
            if !size_handoff_offered {
                conversation.tools_used.push(COMPLEX_HANDOFF.to_string());
            }
            return self.finish(conversation, reply(COMPLEX_REPLY)).await;
        }

        let reply = self.model_turn(&mut conversation).await?;
        self.finish(conversation, reply).await
    }

    fn event(&mut self, name: impl Into<String>) {
        self.events.push(name.into());
    }

    async fn without_conversation(&mut self) -> AppResult<TurnOutcome> {
        if detect_exit_intent(&self.text) {
            self.event("exit_intent");
            return Ok(self.outcome(reply(EXIT_REPLY), None));
        }
        if detect_medical_question(&self.text) {
            self.event("medical_question");
            return Ok(self.outcome(reply(MEDICAL_REPLY), None));
        }
        if detect_complex_request(&self.text, &LeadFields::default()) {
            self.event("complex_request");
            return Ok(self.outcome(reply(COMPLEX_REPLY), None));
        }

        let now = now_iso();
        let conversation = Conversation {
            id: Uuid::new_v4().to_string(),
            studio_id: self.studio.id.clone(),
            user_phone: self.user_phone.clone(),
            status: ConversationStatus::Active,
            current_step: 0,
            collected_data: LeadFields::default(),
            pending_update: None,
            tools_used: vec![],
            lead_sent_at: None,
            closed_at: None,
            created_at: now.clone(),
            updated_at: now,
        };
        self.state.store.insert_conversation(&conversation).await?;
        info!(
            conversation_id = %conversation.id,
            studio_id = %self.studio.id,
            "conversation started"
        );
        self.event("conversation_started");

        let welcome = match self.config.welcome_message.trim() {
            "" => GENERIC_PROMPT.to_string(),
            welcome => welcome.to_string(),
        };
        self.record_exchange(&conversation, std::slice::from_ref(&welcome)).await?;
        Ok(self.outcome(owned_reply(vec![welcome], 800), Some(conversation)))
    }

    /// Deterministic answer to a pending yes/no question. `None` lets the turn
    /// continue through the normal checks.
    fn resolve_pending(&mut self, conversation: &mut Conversation) -> Option<BotReply> {
        let answer = classify_confirmation(&self.text);
        match (conversation.status, answer) {
            (_, ConfirmationAnswer::Unclear) => None,
            (ConversationStatus::PendingConfirmation, ConfirmationAnswer::Confirmed) => {
                self.event("lead_confirmed");
                conversation.status = ConversationStatus::Qualified;
                conversation.lead_sent_at = Some(now_iso());
                self.lead_due = true;
                let name = conversation
                    .collected_data
                    .get("name")
                    .unwrap_or("gràcies")
                    .to_string();
                Some(owned_reply(
                    vec![
                        "He passat la info a l'estudi.".to_string(),
                        format!("Et contactaran aviat, {name}! 😊"),
                    ],
                    1000,
                ))
            }
            (ConversationStatus::PendingConfirmation, ConfirmationAnswer::Rejected) => {
                if detect_exit_intent(&self.text) {
                    return None;
                }
                self.event("lead_revision_requested");
                conversation.status = ConversationStatus::Active;
                Some(reply(&[REVISE_REPLY]))
            }
            (ConversationStatus::PendingUpdateConfirmation, ConfirmationAnswer::Confirmed) => {
                self.event("update_confirmed");
                if let Some(update) = conversation.pending_update.take() {
                    conversation.collected_data = update;
                }
                conversation.status = ConversationStatus::Qualified;
                self.lead_due = true;
                Some(reply(&[UPDATE_CONFIRMED_REPLY]))
            }
            (ConversationStatus::PendingUpdateConfirmation, ConfirmationAnswer::Rejected) => {
                self.event("update_rejected");
                conversation.pending_update = None;
                conversation.status = ConversationStatus::Qualified;
                Some(reply(&[UPDATE_KEPT_REPLY]))
            }
            _ => None,
        }
    }

    async fn model_turn(&mut self, conversation: &mut Conversation) -> AppResult<BotReply> {
        let history = self
            .state
            .store
            .recent_messages(&conversation.id, self.state.settings.openai.history_limit)
            .await?
            .into_iter()
            .map(|m| match m.role {
                MessageRole::User => ChatMessage::user(m.content),
                MessageRole::Bot => ChatMessage::assistant(m.content),
            })
            .collect();
        let system = render_system_prompt(&SystemPromptContext {
            studio_name: &self.studio.name,
            collected: &conversation.collected_data,
            status: conversation.status,
            lead_sent: conversation.lead_sent(),
            user_message: &self.text,
        });

        let completion = match self
            .state
            .model
            .complete(ChatRequest {
                system,
                history,
                user: self.text.clone(),
                tools: tool_definitions(),
            })
            .await
        {
            Ok(completion) => completion,
            Err(err) => {
                warn!(conversation_id = %conversation.id, error = %err, "model call failed");
                self.event("llm_error");
                return Ok(reply(LLM_ERROR_REPLY));
            }
        };

        let mut extracted = LeadFields::default();
        let mut send_requested = false;
        let mut update_request: Option<(String, bool)> = None;
        let mut close_reason = None;
        for call in completion.tool_calls {
            let name = call.name();
            self.event(format!("tool:{name}"));
            if !conversation.tools_used.iter().any(|t| t == name) {
                conversation.tools_used.push(name.to_string());
            }
            match call {
                ToolCall::ExtractTattooInfo(fields) => {
                    extracted.merge(&fields);
                }
                ToolCall::SendToStudio { confirmed } => send_requested |= confirmed,
                ToolCall::UpdateLead {
                    changes,
                    requires_confirmation,
                } => update_request = Some((changes, requires_confirmation)),
                ToolCall::CloseConversation { reason } => close_reason = Some(reason),
            }
        }
        let messages = parse_reply_messages(&completion.content);
        debug!(
            conversation_id = %conversation.id,
            status = %conversation.status,
            messages = messages.len(),
            "model turn parsed"
        );

        if let Some(reason) = close_reason {
            info!(conversation_id = %conversation.id, ?reason, "model closed the conversation");
            self.event("conversation_closed");
            if conversation.status == ConversationStatus::Active {
                conversation.collected_data.merge(&extracted);
            }
            conversation.status = if conversation.lead_sent() {
                ConversationStatus::Closed
            } else {
                ConversationStatus::Dropped
            };
            conversation.pending_update = None;
            conversation.closed_at = Some(now_iso());
            if messages.is_empty() {
                return Ok(reply(GOODBYE_REPLY));
            }
            return Ok(owned_reply(messages, 800));
        }

        let reply = match conversation.status {
            ConversationStatus::Active | ConversationStatus::PendingConfirmation => {
                self.collect_turn(conversation, &extracted, send_requested, messages)
            }
            ConversationStatus::Qualified | ConversationStatus::PendingUpdateConfirmation => {
                self.update_turn(conversation, &extracted, update_request, messages)
            }
            ConversationStatus::Closed | ConversationStatus::Dropped => {
                self.fallback_reply(conversation, messages)
            }
        };
        Ok(reply)
    }

    fn collect_turn(
        &mut self,
        conversation: &mut Conversation,
        extracted: &LeadFields,
        send_requested: bool,
        messages: Vec<String>,
    ) -> BotReply {
        let changed = conversation.collected_data.merge(extracted);
        if !changed.is_empty() {
            self.event(format!("fields_updated:{}", changed.join(",")));
        }

        let data = &conversation.collected_data;
        let ready = data.has_minimum_lead_info() && (send_requested || data.get("name").is_some());
        let recap_due = match conversation.status {
            ConversationStatus::Active => ready,
            _ => ready && !changed.is_empty(),
        };
        if recap_due {
            self.event("lead_ready");
            conversation.status = ConversationStatus::PendingConfirmation;
            return recap_reply(&conversation.collected_data);
        }
        self.fallback_reply(conversation, messages)
    }

    fn update_turn(
        &mut self,
        conversation: &mut Conversation,
        extracted: &LeadFields,
        update_request: Option<(String, bool)>,
        messages: Vec<String>,
    ) -> BotReply {
        let base = conversation
            .pending_update
            .clone()
            .unwrap_or_else(|| conversation.collected_data.clone());
        let proposed = base.merged(extracted);
        if proposed == conversation.collected_data {
            return self.fallback_reply(conversation, messages);
        }

        let report = detect_significant_change(&conversation.collected_data, &proposed);
        let tool_wants_confirmation = update_request.as_ref().is_some_and(|(_, confirm)| *confirm);
        if report.significant || tool_wants_confirmation {
            self.event("update_pending");
            let summary = if report.changes.is_empty() {
                update_request
                    .map(|(changes, _)| changes)
                    .filter(|changes| !changes.trim().is_empty())
                    .unwrap_or_else(|| proposed.summary_lines().join(", "))
            } else {
                format_changes(&report.changes)
            };
            conversation.pending_update = Some(proposed);
            conversation.status = ConversationStatus::PendingUpdateConfirmation;
            return owned_reply(
                vec![
                    format!("Només per confirmar el canvi: {summary}"),
                    UPDATE_QUESTION.to_string(),
                ],
                800,
            );
        }

        self.event("update_applied");
        conversation.collected_data = proposed;
        conversation.pending_update = None;
        conversation.status = ConversationStatus::Qualified;
        self.lead_due = true;
        reply(&[UPDATE_APPLIED_REPLY])
    }

    /// The model's own words, or the next unanswered configured question.
    fn fallback_reply(&self, conversation: &Conversation, messages: Vec<String>) -> BotReply {
        if !messages.is_empty() {
            return owned_reply(messages, 800);
        }
        let data = &conversation.collected_data;
        let next = self.config.questions.iter().find(|q| {
            let field = q.field.as_str();
            if PLACEMENT_FIELDS.contains(&field) {
                !data.has_placement()
            } else {
                FIELD_NAMES.contains(&field) && data.get(field).is_none()
            }
        });
        let text = next.map(|q| q.text.as_str()).unwrap_or(GENERIC_PROMPT);
        reply(&[text])
    }

    async fn deliver_lead(&mut self, conversation: &Conversation) {
        let lead = build_qualified_lead(conversation);
        if self.state.notifier.deliver(&self.studio, &lead).await {
            self.event("lead_sent");
        } else {
            self.event("lead_delivery_failed");
        }
    }

    async fn record_exchange(
        &self,
        conversation: &Conversation,
        replies: &[String],
    ) -> AppResult<()> {
        let store = &self.state.store;
        store
            .append_message(&ConversationMessage {
                id: Uuid::new_v4().to_string(),
                conversation_id: conversation.id.clone(),
                role: MessageRole::User,
                content: self.text.clone(),
                provider_message_id: self.message_sid.clone(),
                created_at: now_iso(),
            })
            .await?;
        for content in replies {
            store
                .append_message(&ConversationMessage {
                    id: Uuid::new_v4().to_string(),
                    conversation_id: conversation.id.clone(),
                    role: MessageRole::Bot,
                    content: content.clone(),
                    provider_message_id: None,
                    created_at: now_iso(),
                })
                .await?;
        }
        Ok(())
    }

    async fn finish(
        &mut self,
        mut conversation: Conversation,
        reply: BotReply,
    ) -> AppResult<TurnOutcome> {
        conversation.current_step += 1;
        conversation.updated_at = now_iso();
        self.state.store.save_conversation(&conversation).await?;
        if std::mem::take(&mut self.lead_due) {
            self.deliver_lead(&conversation).await;
        }
        self.record_exchange(&conversation, &reply.messages).await?;

        info!(
            conversation_id = %conversation.id,
            studio_id = %self.studio.id,
            status = %conversation.status,
            step = conversation.current_step,
            events = ?self.events,
            "turn handled"
        );
        if !conversation.status.is_open() {
            let messages = self.state.store.list_messages(&conversation.id).await?;
            log_conversation_metrics(&conversation, &messages, self.state.model.model_name());
        }
        Ok(self.outcome(reply, Some(conversation)))
    }

    fn outcome(&mut self, reply: BotReply, conversation: Option<Conversation>) -> TurnOutcome {
        TurnOutcome {
            reply,
            conversation,
            events: std::mem::take(&mut self.events),
            duplicate: false,
        }
    }
}

fn recap_reply(data: &LeadFields) -> BotReply {
    let mut messages = vec![RECAP_OPENER.to_string()];
    let summary = data.summary_lines();
    if !summary.is_empty() {
        messages.push(summary.join("\n"));
    }
    messages.push(RECAP_QUESTION.to_string());
    BotReply {
        messages,
        buttons: vec!["Sí".to_string(), "No".to_string()],
        delay_ms: 1000,
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use async_trait::async_trait;
    use tokio::sync::Mutex;

    use super::*;
    use crate::{
        config::Settings,
        error::AppError,
        lead_webhook::LeadNotifier,
        llm::{ChatCompletion, ChatModel},
        store::{ConversationStore, MemoryStore},
        tools::CloseReason,
        types::{CreateStudioBody, QualifiedLead, TestTemplate, UpdateStudioBody},
    };

    const STUDIO_NUMBER: &str = "whatsapp:+14155238886";
    const USER: &str = "whatsapp:+34600111222";

    #[derive(Default)]
    struct ScriptedModel {
        script: Mutex<VecDeque<AppResult<ChatCompletion>>>,
        calls: Mutex<usize>,
    }

    impl ScriptedModel {
        async fn push(&self, content: &str, tool_calls: Vec<ToolCall>) {
            self.script.lock().await.push_back(Ok(ChatCompletion {
                content: content.to_string(),
                tool_calls,
            }));
        }

        async fn push_error(&self) {
            self.script
                .lock()
                .await
                .push_back(Err(AppError::Llm("boom".to_string())));
        }
    }

    #[async_trait]
    impl ChatModel for ScriptedModel {
        async fn complete(&self, _request: ChatRequest) -> AppResult<ChatCompletion> {
            *self.calls.lock().await += 1;
            self.script
                .lock()
                .await
                .pop_front()
                .unwrap_or_else(|| Ok(ChatCompletion::default()))
        }

        fn model_name(&self) -> &str {
            "scripted"
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        leads: Mutex<Vec<QualifiedLead>>,
    }

    #[async_trait]
    impl LeadNotifier for RecordingNotifier {
        async fn deliver(&self, _studio: &Studio, lead: &QualifiedLead) -> bool {
            self.leads.lock().await.push(lead.clone());
            true
        }
    }

    /// `MemoryStore` whose `save_conversation` fails while `failing_saves` is above zero.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        failing_saves: AtomicUsize,
    }

    #[async_trait]
    impl ConversationStore for FlakyStore {
        async fn ping(&self) -> AppResult<()> {
            self.inner.ping().await
        }
        async fn list_studios(&self) -> AppResult<Vec<Studio>> {
            self.inner.list_studios().await
        }
        async fn get_studio(&self, id: &str) -> AppResult<Option<Studio>> {
            self.inner.get_studio(id).await
        }
        async fn find_studio_by_whatsapp(&self, number: &str) -> AppResult<Option<Studio>> {
            self.inner.find_studio_by_whatsapp(number).await
        }
        async fn create_studio(&self, body: CreateStudioBody) -> AppResult<Studio> {
            self.inner.create_studio(body).await
        }
        async fn update_studio(
            &self,
            id: &str,
            body: UpdateStudioBody,
        ) -> AppResult<Option<Studio>> {
            self.inner.update_studio(id, body).await
        }
        async fn get_bot_config(&self, studio_id: &str) -> AppResult<Option<BotConfig>> {
            self.inner.get_bot_config(studio_id).await
        }
        async fn upsert_bot_config(&self, config: BotConfig) -> AppResult<BotConfig> {
            self.inner.upsert_bot_config(config).await
        }
        async fn find_open_conversation(
            &self,
            studio_id: &str,
            user_phone: &str,
        ) -> AppResult<Option<Conversation>> {
            self.inner.find_open_conversation(studio_id, user_phone).await
        }
        async fn get_conversation(&self, id: &str) -> AppResult<Option<Conversation>> {
            self.inner.get_conversation(id).await
        }
        async fn insert_conversation(&self, conversation: &Conversation) -> AppResult<()> {
            self.inner.insert_conversation(conversation).await
        }
        async fn save_conversation(&self, conversation: &Conversation) -> AppResult<()> {
            let failing = self
                .failing_saves
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(AppError::Database(sqlx::Error::PoolTimedOut));
            }
            self.inner.save_conversation(conversation).await
        }
        async fn close_open_conversations(
            &self,
            studio_id: &str,
            user_phone: &str,
        ) -> AppResult<u64> {
            self.inner.close_open_conversations(studio_id, user_phone).await
        }
        async fn list_conversations(
            &self,
            studio_id: &str,
            offset: u64,
            limit: u32,
        ) -> AppResult<(Vec<Conversation>, i64)> {
            self.inner.list_conversations(studio_id, offset, limit).await
        }
        async fn append_message(&self, message: &ConversationMessage) -> AppResult<()> {
            self.inner.append_message(message).await
        }
        async fn list_messages(&self, conversation_id: &str) -> AppResult<Vec<ConversationMessage>> {
            self.inner.list_messages(conversation_id).await
        }
        async fn recent_messages(
            &self,
            conversation_id: &str,
            limit: usize,
        ) -> AppResult<Vec<ConversationMessage>> {
            self.inner.recent_messages(conversation_id, limit).await
        }
        async fn inbound_seen(&self, message_sid: &str) -> AppResult<bool> {
            self.inner.inbound_seen(message_sid).await
        }
        async fn record_inbound(&self, message_sid: &str) -> AppResult<bool> {
            self.inner.record_inbound(message_sid).await
        }
        async fn list_templates(&self) -> AppResult<Vec<TestTemplate>> {
            self.inner.list_templates().await
        }
        async fn create_template(&self, template: TestTemplate) -> AppResult<TestTemplate> {
            self.inner.create_template(template).await
        }
        async fn delete_template(&self, id: &str) -> AppResult<bool> {
            self.inner.delete_template(id).await
        }
    }

    struct Harness {
        state: Arc<AppState>,
        model: Arc<ScriptedModel>,
        notifier: Arc<RecordingNotifier>,
        sid: AtomicUsize,
    }

    impl Harness {
        async fn new() -> Self {
            Self::with_store(Arc::new(MemoryStore::new())).await
        }

        async fn with_store(store: Arc<dyn ConversationStore>) -> Self {
            store
                .create_studio(CreateStudioBody {
                    name: "Tinta Negra".to_string(),
                    email: "hola@tintanegra.cat".to_string(),
                    whatsapp_number: Some(STUDIO_NUMBER.to_string()),
                    webhook_url: Some("http://127.0.0.1:9/leads".to_string()),
                })
                .await
                .expect("studio");
            let model = Arc::new(ScriptedModel::default());
            let notifier = Arc::new(RecordingNotifier::default());
            let state = Arc::new(AppState::new(
                Settings::for_tests(),
                store,
                model.clone(),
                notifier.clone(),
            ));
            Self {
                state,
                model,
                notifier,
                sid: AtomicUsize::new(0),
            }
        }

        async fn send(&self, body: &str) -> TurnOutcome {
            let sid = self.sid.fetch_add(1, Ordering::SeqCst) + 1;
            self.deliver(&format!("SM{sid}"), body).await.expect("turn")
        }

        async fn deliver(&self, sid: &str, body: &str) -> AppResult<TurnOutcome> {
            handle_incoming_message(
                &self.state,
                InboundMessage {
                    message_sid: sid.to_string(),
                    from: USER.to_string(),
                    to: STUDIO_NUMBER.to_string(),
                    body: body.to_string(),
                    num_media: None,
                },
            )
            .await
        }

        async fn leads(&self) -> usize {
            self.notifier.leads.lock().await.len()
        }
    }

    fn extract(pairs: &[(&str, &str)]) -> ToolCall {
        let args = serde_json::Value::Object(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), serde_json::Value::String(v.to_string())))
                .collect(),
        );
        ToolCall::ExtractTattooInfo(crate::tools::fields_from_args(&args))
    }

    fn status(outcome: &TurnOutcome) -> Option<ConversationStatus> {
        outcome.conversation.as_ref().map(|c| c.status)
    }

    async fn reach_recap(h: &Harness) {
        h.send("Hola!").await;
        h.model
            .push(
                r#"["Una rosa al braç, m'agrada!"]"#,
                vec![
                    extract(&[
                        ("description", "una rosa"),
                        ("placement", "braç"),
                        ("name", "Marta"),
                    ]),
                    ToolCall::SendToStudio { confirmed: true },
                ],
            )
            .await;
        let recap = h.send("Sóc la Marta, vull una rosa al braç").await;
        assert_eq!(status(&recap), Some(ConversationStatus::PendingConfirmation));
    }

    async fn qualify(h: &Harness) {
        reach_recap(h).await;
        let done = h.send("sí").await;
        assert_eq!(status(&done), Some(ConversationStatus::Qualified));
    }

    #[tokio::test]
    async fn unknown_studio_gets_error_reply() {
        let h = Harness::new().await;
        let outcome = handle_incoming_message(
            &h.state,
            InboundMessage {
                message_sid: "SMx".to_string(),
                from: USER.to_string(),
                to: "whatsapp:+10000000000".to_string(),
                body: "Hola".to_string(),
                num_media: None,
            },
        )
        .await
        .expect("turn");
        assert_eq!(outcome.reply.messages, ERROR_REPLY);
        assert!(outcome.conversation.is_none());
    }

    #[tokio::test]
    async fn first_message_creates_conversation_with_welcome() {
        let h = Harness::new().await;
        let outcome = h.send("Hola!").await;
        assert_eq!(status(&outcome), Some(ConversationStatus::Active));
        assert_eq!(outcome.reply.messages, vec!["Ei 👋 Què t'agradaria tatuar-te?"]);
        assert_eq!(*h.model.calls.lock().await, 0);
        let id = outcome.conversation.map(|c| c.id).expect("id");
        assert_eq!(h.state.store.list_messages(&id).await.expect("messages").len(), 2);
    }

    #[tokio::test]
    async fn duplicate_delivery_is_ignored() {
        let h = Harness::new().await;
        let inbound = InboundMessage {
            message_sid: "SM-dup".to_string(),
            from: USER.to_string(),
            to: STUDIO_NUMBER.to_string(),
            body: "Hola".to_string(),
            num_media: None,
        };
        let first = handle_incoming_message(&h.state, inbound.clone()).await.expect("first");
        let second = handle_incoming_message(&h.state, inbound).await.expect("second");
        assert!(!first.duplicate);
        assert!(second.duplicate);
        assert!(second.reply.messages.is_empty());
    }

    #[tokio::test]
    async fn full_qualification_sends_the_lead_once() {
        let h = Harness::new().await;
        qualify(&h).await;
        assert_eq!(h.leads().await, 1);
        let lead = h.notifier.leads.lock().await[0].clone();
        assert_eq!(lead.data["phone"], "+34600111222");
        assert_eq!(lead.data["description"], "una rosa");
    }

    #[tokio::test]
    async fn recap_lists_fields_and_asks_to_send() {
        let h = Harness::new().await;
        h.send("Hola!").await;
        h.model
            .push(
                "",
                vec![
                    extract(&[("description", "una rosa"), ("placement_size", "avantbraç M")]),
                    ToolCall::SendToStudio { confirmed: true },
                ],
            )
            .await;
        let recap = h.send("una rosa a l'avantbraç, mida M").await;
        assert_eq!(recap.reply.messages[0], "Perfecte! Deixa'm fer un resum:");
        assert!(recap.reply.messages[1].contains("Ubicació: avantbraç M"));
        assert_eq!(recap.reply.messages.last().map(String::as_str), Some(RECAP_QUESTION));
        assert_eq!(h.leads().await, 0);
    }

    #[tokio::test]
    async fn rejecting_the_recap_goes_back_to_collecting() {
        let h = Harness::new().await;
        h.send("Hola!").await;
        h.model
            .push(
                "",
                vec![extract(&[
                    ("description", "un lleó"),
                    ("placement", "esquena"),
                    ("name", "Pau"),
                ])],
            )
            .await;
        h.send("Sóc en Pau, un lleó a l'esquena").await;
        let outcome = h.send("no, espera").await;
        assert_eq!(status(&outcome), Some(ConversationStatus::Active));
        assert_eq!(outcome.reply.messages, vec![REVISE_REPLY]);
        assert_eq!(h.leads().await, 0);
    }

    #[tokio::test]
    async fn exit_intent_drops_unsent_and_closes_sent() {
        let h = Harness::new().await;
        h.send("Hola!").await;
        let dropped = h.send("No m'interessa").await;
        assert_eq!(status(&dropped), Some(ConversationStatus::Dropped));
        assert_eq!(dropped.reply.messages, EXIT_REPLY);

        let h = Harness::new().await;
        qualify(&h).await;
        let closed = h.send("passo, ja no el vull").await;
        assert_eq!(status(&closed), Some(ConversationStatus::Closed));
        assert!(closed.conversation.and_then(|c| c.closed_at).is_some());
    }

    #[tokio::test]
    async fn medical_and_complex_short_circuit_the_model() {
        let h = Harness::new().await;
        h.send("Hola!").await;
        let medical = h.send("Tinc diabetis, és un problema?").await;
        assert_eq!(medical.reply.messages, MEDICAL_REPLY);
        let complex = h.send("Voldria fer un cover d'un tatuatge vell").await;
        assert_eq!(complex.reply.messages, COMPLEX_REPLY);
        assert_eq!(status(&complex), Some(ConversationStatus::Active));
        assert_eq!(*h.model.calls.lock().await, 0);
    }

    #[tokio::test]
    async fn model_failure_keeps_state() {
        let h = Harness::new().await;
        h.send("Hola!").await;
        h.model.push_error().await;
        let outcome = h.send("vull una rosa").await;
        assert_eq!(outcome.reply.messages, LLM_ERROR_REPLY);
        let conversation = outcome.conversation.expect("conversation");
        assert_eq!(conversation.status, ConversationStatus::Active);
        assert!(conversation.collected_data.is_empty());
    }

    #[tokio::test]
    async fn empty_model_text_asks_next_configured_question() {
        let h = Harness::new().await;
        h.send("Hola!").await;
        h.model.push("", vec![extract(&[("description", "una rosa")])]).await;
        let outcome = h.send("una rosa").await;
        assert_eq!(
            outcome.reply.messages,
            vec!["On al cos, i quina mida? S fins 5cm, M 5-12cm, L 12-20cm, XL secció completa"]
        );
    }

    #[tokio::test]
    async fn significant_update_waits_for_confirmation() {
        let h = Harness::new().await;
        qualify(&h).await;
        h.model
            .push("", vec![extract(&[("placement", "bíceps")])])
            .await;
        let ask = h.send("millor al bíceps").await;
        assert_eq!(status(&ask), Some(ConversationStatus::PendingUpdateConfirmation));
        assert!(ask.reply.messages[0].contains("placement: braç → bíceps"));
        assert_eq!(h.leads().await, 1);

        let applied = h.send("sí, actualitza").await;
        let conversation = applied.conversation.expect("conversation");
        assert_eq!(conversation.status, ConversationStatus::Qualified);
        assert_eq!(conversation.collected_data.placement.as_deref(), Some("bíceps"));
        assert!(conversation.pending_update.is_none());
        assert_eq!(h.leads().await, 2);
    }

    #[tokio::test]
    async fn rejected_update_keeps_sent_data() {
        let h = Harness::new().await;
        qualify(&h).await;
        h.model
            .push("", vec![extract(&[("description", "un drac")])])
            .await;
        h.send("i si fos un drac?").await;
        let kept = h.send("no cal").await;
        let conversation = kept.conversation.expect("conversation");
        assert_eq!(conversation.status, ConversationStatus::Qualified);
        assert_eq!(conversation.collected_data.description.as_deref(), Some("una rosa"));
        assert_eq!(kept.reply.messages, vec![UPDATE_KEPT_REPLY]);
        assert_eq!(h.leads().await, 1);
    }

    #[tokio::test]
    async fn minor_update_is_applied_and_resent() {
        let h = Harness::new().await;
        qualify(&h).await;
        h.model
            .push("", vec![extract(&[("color", "Color")])])
            .await;
        let outcome = h.send("el vull en color").await;
        assert_eq!(status(&outcome), Some(ConversationStatus::Qualified));
        assert_eq!(outcome.reply.messages, vec![UPDATE_APPLIED_REPLY]);
        assert_eq!(h.leads().await, 2);
    }

    #[tokio::test]
    async fn close_tool_after_send_closes() {
        let h = Harness::new().await;
        qualify(&h).await;
        h.model
            .push(
                "",
                vec![ToolCall::CloseConversation {
                    reason: CloseReason::GratitudeAfterSend,
                }],
            )
            .await;
        let outcome = h.send("moltes gràcies!").await;
        assert_eq!(status(&outcome), Some(ConversationStatus::Closed));
        assert_eq!(outcome.reply.messages, GOODBYE_REPLY);
        assert!(h
            .state
            .store
            .find_open_conversation(
                &outcome.conversation.expect("conversation").studio_id,
                "+34600111222"
            )
            .await
            .expect("lookup")
            .is_none());
    }

    #[tokio::test]
    async fn failed_save_lets_the_provider_retry_without_a_second_lead() {
        let store = Arc::new(FlakyStore::default());
        let h = Harness::with_store(store.clone()).await;
        reach_recap(&h).await;

        store.failing_saves.store(1, Ordering::SeqCst);
        assert!(h.deliver("SM-yes", "sí").await.is_err());
        assert_eq!(h.leads().await, 0);

        let retried = h.deliver("SM-yes", "sí").await.expect("retry");
        assert!(!retried.duplicate);
        assert_eq!(status(&retried), Some(ConversationStatus::Qualified));
        assert_eq!(h.leads().await, 1);

        let again = h.deliver("SM-yes", "sí").await.expect("redelivery");
        assert!(again.duplicate);
        h.deliver("SM-yes-2", "sí").await.expect("second yes");
        assert_eq!(h.leads().await, 1);
    }

    #[tokio::test]
    async fn concurrent_confirmations_send_one_lead() {
        let h = Harness::new().await;
        reach_recap(&h).await;
        let (first, second) = tokio::join!(h.deliver("SM-a", "sí"), h.deliver("SM-b", "sí"));
        let statuses = [first.expect("first"), second.expect("second")].map(|o| status(&o));
        assert!(statuses.contains(&Some(ConversationStatus::Qualified)));
        assert_eq!(h.leads().await, 1);
        assert!(h.state.conversation_locks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn exit_while_an_update_is_pending_closes_without_resending() {
        let h = Harness::new().await;
        qualify(&h).await;
        h.model
            .push("", vec![extract(&[("description", "un drac")])])
            .await;
        let ask = h.send("i si fos un drac?").await;
        assert_eq!(status(&ask), Some(ConversationStatus::PendingUpdateConfirmation));

        let closed = h.send("passo").await;
        assert_eq!(closed.reply.messages, EXIT_REPLY);
        let conversation = closed.conversation.expect("conversation");
        assert_eq!(conversation.status, ConversationStatus::Closed);
        assert!(conversation.pending_update.is_none());
        assert_eq!(conversation.collected_data.description.as_deref(), Some("una rosa"));
        assert_eq!(h.leads().await, 1);
    }
}
