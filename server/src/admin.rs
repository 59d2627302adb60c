//! JSON admin API: studios, bot configuration, conversations and the bot-test simulator.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use crate::{
    conversation::handle_incoming_message,
    error::{AppError, AppResult},
    store::default_bot_config,
    types::{
        now_iso, AppState, BotConfigBody, BotTestBody, BotTestQuery, CreateEvaluationBody,
        CreateStudioBody, CreateTemplateBody, Evaluation, EvaluationQuery, IdQuery, InboundMessage,
        PageQuery, Studio, TestTemplate, UpdateStudioBody,
    },
};

pub const BOT_TEST_PHONE: &str = "+34999999999";
const MAX_EVALUATIONS: usize = 100;
const MAX_PAGE_SIZE: u32 = 100;
const MAX_PAGE: u32 = 100_000;

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let header = headers.get("authorization")?.to_str().ok()?;
    let token = header.strip_prefix("Bearer ")?;
    Some(token.trim().to_string())
}

/// Open when no admin token is configured.
fn require_admin(state: &AppState, headers: &HeaderMap) -> AppResult<()> {
    let Some(expected) = state.settings.admin_api_token.as_deref() else {
        return Ok(());
    };
    match bearer_token(headers) {
        Some(token) if token == expected => Ok(()),
        _ => Err(AppError::Unauthorized),
    }
}

async fn studio_or_404(state: &AppState, studio_id: &str) -> AppResult<Studio> {
    state
        .store
        .get_studio(studio_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("studio {studio_id}")))
}

pub async fn list_studios(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    require_admin(&state, &headers)?;
    let studios = state.store.list_studios().await?;
    Ok(Json(json!({ "studios": studios })))
}

pub async fn create_studio(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateStudioBody>,
) -> AppResult<Json<Value>> {
    require_admin(&state, &headers)?;
    if body.name.trim().is_empty() || body.email.trim().is_empty() {
        return Err(AppError::BadRequest("name and email are required".to_string()));
    }
    let studio = state.store.create_studio(body).await?;
    info!(studio_id = %studio.id, "studio created");
    Ok(Json(json!({ "studio": studio })))
}

pub async fn get_studio(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(studio_id): Path<String>,
) -> AppResult<Json<Value>> {
    require_admin(&state, &headers)?;
    let studio = studio_or_404(&state, &studio_id).await?;
    Ok(Json(json!({ "studio": studio })))
}

pub async fn update_studio(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(studio_id): Path<String>,
    Json(body): Json<UpdateStudioBody>,
) -> AppResult<Json<Value>> {
    require_admin(&state, &headers)?;
    let studio = state
        .store
        .update_studio(&studio_id, body)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("studio {studio_id}")))?;
    Ok(Json(json!({ "studio": studio })))
}

pub async fn get_bot_config(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(studio_id): Path<String>,
) -> AppResult<Json<Value>> {
    require_admin(&state, &headers)?;
    studio_or_404(&state, &studio_id).await?;
    let config = match state.store.get_bot_config(&studio_id).await? {
        Some(config) => config,
        None => default_bot_config(&studio_id),
    };
    Ok(Json(json!({ "botConfig": config })))
}

pub async fn update_bot_config(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(studio_id): Path<String>,
    Json(body): Json<BotConfigBody>,
) -> AppResult<Json<Value>> {
    require_admin(&state, &headers)?;
    studio_or_404(&state, &studio_id).await?;
    let mut config = match state.store.get_bot_config(&studio_id).await? {
        Some(config) => config,
        None => default_bot_config(&studio_id),
    };
    if let Some(welcome_message) = body.welcome_message {
        config.welcome_message = welcome_message;
    }
    if let Some(branding_color) = body.branding_color {
        config.branding_color = branding_color;
    }
    if let Some(logo_url) = body.logo_url {
        config.logo_url = Some(logo_url).filter(|url| !url.trim().is_empty());
    }
    if let Some(questions) = body.questions {
        config.questions = questions;
    }
    config.updated_at = now_iso();
    let config = state.store.upsert_bot_config(config).await?;
    Ok(Json(json!({ "botConfig": config })))
}

pub async fn list_conversations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(studio_id): Path<String>,
    Query(query): Query<PageQuery>,
) -> AppResult<Json<Value>> {
    require_admin(&state, &headers)?;
    studio_or_404(&state, &studio_id).await?;
    let page = query.page.clamp(1, MAX_PAGE);
    let limit = query.limit.clamp(1, MAX_PAGE_SIZE);
    let offset = u64::from(page - 1) * u64::from(limit);
    let (conversations, total_count) = state
        .store
        .list_conversations(&studio_id, offset, limit)
        .await?;
    let total_pages = (total_count + i64::from(limit) - 1) / i64::from(limit);
    Ok(Json(json!({
        "conversations": conversations,
        "pagination": {
            "page": page,
            "limit": limit,
            "totalCount": total_count,
            "totalPages": total_pages,
            "hasMore": i64::from(page) < total_pages,
        }
    })))
}

pub async fn get_conversation(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
) -> AppResult<Json<Value>> {
    require_admin(&state, &headers)?;
    let conversation = state
        .store
        .get_conversation(&conversation_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("conversation {conversation_id}")))?;
    let messages = state.store.list_messages(&conversation_id).await?;
    Ok(Json(json!({ "conversation": conversation, "messages": messages })))
}

async fn bot_test_studio(state: &AppState, requested: Option<String>) -> AppResult<Studio> {
    let requested = requested
        .filter(|id| !id.trim().is_empty())
        .or_else(|| state.settings.bot_test_studio_id.clone());
    if let Some(studio_id) = requested {
        return studio_or_404(state, &studio_id).await;
    }
    state
        .store
        .list_studios()
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| AppError::NotFound("no studio available for bot tests".to_string()))
}

/// Runs one simulator turn through the same orchestrator the webhooks use.
pub async fn post_bot_test(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<BotTestBody>,
) -> AppResult<Json<Value>> {
    require_admin(&state, &headers)?;
    let studio = bot_test_studio(&state, body.studio_id).await?;

    if body.reset {
        let closed = state
            .store
            .close_open_conversations(&studio.id, BOT_TEST_PHONE)
            .await?;
        info!(studio_id = %studio.id, closed, "bot test conversation reset");
        return Ok(Json(json!({
            "success": true,
            "conversationId": null,
            "message": "Conversation reset",
        })));
    }

    if body.message.trim().is_empty() {
        return Err(AppError::BadRequest("message is required".to_string()));
    }
    let Some(studio_number) = studio.whatsapp_number.clone() else {
        return Err(AppError::BadRequest(format!(
            "studio {} has no whatsapp number",
            studio.id
        )));
    };

    let outcome = handle_incoming_message(
        &state,
        InboundMessage {
            message_sid: format!("TEST_{}", Uuid::new_v4()),
            from: format!("whatsapp:{BOT_TEST_PHONE}"),
            to: studio_number,
            body: body.message,
            num_media: None,
        },
    )
    .await?;

    let conversation = match outcome.conversation {
        Some(conversation) => Some(conversation),
        None => {
            state
                .store
                .find_open_conversation(&studio.id, BOT_TEST_PHONE)
                .await?
        }
    };
    let message_count = match &conversation {
        Some(conversation) => state.store.list_messages(&conversation.id).await?.len(),
        None => 0,
    };
    let timestamp = now_iso();
    let recent_events: Vec<Value> = outcome
        .events
        .iter()
        .map(|event| json!({ "type": event, "timestamp": timestamp }))
        .collect();
    let conversation_id = conversation.as_ref().map(|c| c.id.clone());

    Ok(Json(json!({
        "success": true,
        "conversationId": conversation_id,
        "messages": outcome.reply.messages,
        "buttons": outcome.reply.buttons,
        "debug": {
            "extractedData": conversation
                .as_ref()
                .map(|c| json!(c.collected_data))
                .unwrap_or_else(|| json!({})),
            "status": conversation.as_ref().map(|c| c.status),
            "leadSent": conversation.as_ref().is_some_and(|c| c.lead_sent()),
            "leadSentAt": conversation.as_ref().and_then(|c| c.lead_sent_at.clone()),
            "closedAt": conversation.as_ref().and_then(|c| c.closed_at.clone()),
            "currentStep": conversation.as_ref().map(|c| c.current_step),
            "conversationId": conversation_id,
            "messageCount": message_count,
            "recentEvents": recent_events,
        }
    })))
}

pub async fn get_bot_test(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<BotTestQuery>,
) -> AppResult<Json<Value>> {
    require_admin(&state, &headers)?;
    let Some(conversation_id) = query.conversation_id.filter(|id| !id.is_empty()) else {
        return Ok(Json(json!({ "messages": [] })));
    };
    let Some(conversation) = state.store.get_conversation(&conversation_id).await? else {
        return Ok(Json(json!({ "messages": [] })));
    };
    let messages = state.store.list_messages(&conversation.id).await?;
    Ok(Json(json!({
        "messages": messages,
        "collectedData": conversation.collected_data,
        "status": conversation.status,
    })))
}

pub async fn list_templates(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    require_admin(&state, &headers)?;
    let templates = state.store.list_templates().await?;
    Ok(Json(json!({ "templates": templates })))
}

pub async fn create_template(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateTemplateBody>,
) -> AppResult<Json<Value>> {
    require_admin(&state, &headers)?;
    let Some(messages) = body.messages.filter(|_| !body.name.trim().is_empty()) else {
        return Err(AppError::BadRequest("Name and messages are required".to_string()));
    };
    let template = state
        .store
        .create_template(TestTemplate {
            id: Uuid::new_v4().to_string(),
            name: body.name.trim().to_string(),
            description: body.description.filter(|d| !d.trim().is_empty()),
            messages,
            final_data: body.final_data.unwrap_or_else(|| json!({})),
            final_status: body.final_status.unwrap_or_else(|| "active".to_string()),
            message_count: body.message_count.unwrap_or(0),
            lead_sent: body.lead_sent.unwrap_or(false),
            events: body.events.unwrap_or_else(|| json!([])),
            created_at: now_iso(),
        })
        .await?;
    Ok(Json(json!({ "template": template })))
}

pub async fn delete_template(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<IdQuery>,
) -> AppResult<Json<Value>> {
    require_admin(&state, &headers)?;
    let Some(id) = query.id.filter(|id| !id.trim().is_empty()) else {
        return Err(AppError::BadRequest("Template ID is required".to_string()));
    };
    if !state.store.delete_template(&id).await? {
        return Err(AppError::NotFound(format!("template {id}")));
    }
    Ok(Json(json!({ "success": true })))
}

pub async fn list_evaluations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<EvaluationQuery>,
) -> AppResult<Json<Value>> {
    require_admin(&state, &headers)?;
    let evaluations = state.evaluations.read().await;
    let mut filtered: Vec<Evaluation> = evaluations
        .iter()
        .filter(|e| query.template_id.as_ref().map_or(true, |id| &e.template_id == id))
        .filter(|e| query.config_name.as_ref().map_or(true, |name| &e.config_name == name))
        .cloned()
        .collect();
    filtered.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    Ok(Json(json!({ "evaluations": filtered })))
}

pub async fn create_evaluation(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateEvaluationBody>,
) -> AppResult<Json<Value>> {
    require_admin(&state, &headers)?;
    let evaluation = Evaluation {
        id: format!("eval-{}", Uuid::new_v4()),
        template_id: body.template_id,
        template_name: body.template_name,
        config_name: body.config_name,
        timestamp: now_iso(),
        results: body.results,
        metrics: body.metrics,
    };
    let mut evaluations = state.evaluations.write().await;
    evaluations.push(evaluation.clone());
    if evaluations.len() > MAX_EVALUATIONS {
        let excess = evaluations.len() - MAX_EVALUATIONS;
        evaluations.drain(..excess);
    }
    Ok(Json(json!({ "evaluation": evaluation })))
}

pub async fn delete_evaluations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    require_admin(&state, &headers)?;
    state.evaluations.write().await.clear();
    Ok(Json(json!({ "success": true })))
}
