use std::{collections::HashMap, sync::Arc};

use axum::{
    body::Bytes,
    extract::{Form, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use sqlx::postgres::PgPoolOptions;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, error, info, warn};

use crate::{
    admin,
    config::Settings,
    conversation::handle_incoming_message,
    error::{AppError, AppResult},
    lead_webhook::HttpLeadNotifier,
    llm::OpenAiChatModel,
    messaging::{deliver_reply, CloudApiSender, MessageSender, TwilioSender},
    store::{ConversationStore, MemoryStore, PgStore},
    types::{now_iso, AppState, InboundMessage},
};

pub fn verify_whatsapp_signature(
    app_secret: &str,
    signature_header: Option<&str>,
    body: &[u8],
) -> bool {
    if app_secret.is_empty() {
        return true;
    }
    let signature = signature_header.unwrap_or("").trim();
    let signature = signature
        .strip_prefix("sha256=")
        .unwrap_or(signature)
        .trim();
    if signature.is_empty() {
        return false;
    }
    let Ok(signature_bytes) = hex::decode(signature) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(app_secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&signature_bytes).is_ok()
}

/// Text messages of a Cloud API delivery, in Twilio's inbound shape.
pub fn cloud_api_inbound_messages(payload: &Value) -> Vec<InboundMessage> {
    if payload.get("object").and_then(Value::as_str) != Some("whatsapp_business_account") {
        return vec![];
    }
    let entries = payload
        .get("entry")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let mut inbound = Vec::new();
    for entry in entries {
        let changes = entry
            .get("changes")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        for change in changes {
            let value = change.get("value").cloned().unwrap_or_else(|| json!({}));
            let display_number = value
                .pointer("/metadata/display_phone_number")
                .and_then(Value::as_str)
                .unwrap_or("");
            let display_digits: String =
                display_number.chars().filter(char::is_ascii_digit).collect();
            let messages = value
                .get("messages")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();

            for message in messages {
                if message.get("type").and_then(Value::as_str) != Some("text") {
                    debug!(kind = ?message.get("type"), "skipping non-text whatsapp message");
                    continue;
                }
                let from = message.get("from").and_then(Value::as_str).unwrap_or("");
                let body = message
                    .pointer("/text/body")
                    .and_then(Value::as_str)
                    .unwrap_or("");
                if from.is_empty() || body.trim().is_empty() {
                    continue;
                }
                inbound.push(InboundMessage {
                    message_sid: message
                        .get("id")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_string(),
                    from: format!("whatsapp:+{}", from.trim_start_matches('+')),
                    to: format!("whatsapp:+{display_digits}"),
                    body: body.to_string(),
                    num_media: None,
                });
            }
        }
    }
    inbound
}

async fn twilio_webhook(
    State(state): State<Arc<AppState>>,
    Form(inbound): Form<InboundMessage>,
) -> impl IntoResponse {
    let to = inbound.from.clone();
    let outcome = match handle_incoming_message(&state, inbound).await {
        Ok(outcome) => outcome,
        Err(err) => {
            error!(error = %err, "failed to process twilio message");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Error processing message").into_response();
        }
    };

    if !outcome.reply.messages.is_empty() {
        match state.twilio.clone() {
            Some(sender) => {
                let pacing = state.settings.reply_pacing;
                tokio::spawn(async move {
                    deliver_reply(sender, &to, &outcome.reply, pacing).await;
                });
            }
            None => warn!(to = %to, "twilio is not configured, reply not sent"),
        }
    }
    (StatusCode::OK, "OK").into_response()
}

async fn whatsapp_webhook_verify(
    Query(params): Query<HashMap<String, String>>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let mode = params.get("hub.mode").cloned().unwrap_or_default();
    let verify_token = params.get("hub.verify_token").cloned().unwrap_or_default();
    let challenge = params.get("hub.challenge").cloned().unwrap_or_default();
    let expected_verify_token = state
        .settings
        .webhook_verify_token
        .clone()
        .unwrap_or_default();

    if mode == "subscribe"
        && !challenge.is_empty()
        && !expected_verify_token.is_empty()
        && verify_token == expected_verify_token
    {
        info!("whatsapp webhook verified");
        return (StatusCode::OK, challenge).into_response();
    }

    warn!(mode = %mode, "whatsapp webhook verification failed");
    (
        StatusCode::FORBIDDEN,
        Json(json!({ "error": "invalid webhook verification token" })),
    )
        .into_response()
}

async fn whatsapp_webhook_event(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let app_secret = state
        .settings
        .whatsapp_app_secret
        .clone()
        .unwrap_or_default();
    let signature_header = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok());
    if !verify_whatsapp_signature(&app_secret, signature_header, &body) {
        warn!("dropped whatsapp delivery with an invalid signature");
        return (StatusCode::OK, Json(json!({ "ok": true, "received": 0 }))).into_response();
    }

    let payload = serde_json::from_slice::<Value>(&body).unwrap_or_else(|_| json!({}));
    let inbound = cloud_api_inbound_messages(&payload);
    let received = inbound.len();
    for message in inbound {
        let state = state.clone();
        tokio::spawn(async move {
            let to = message.from.clone();
            match handle_incoming_message(&state, message).await {
                Ok(outcome) if outcome.reply.messages.is_empty() => {}
                Ok(outcome) => match state.cloud_api.clone() {
                    Some(sender) => {
                        deliver_reply(sender, &to, &outcome.reply, state.settings.reply_pacing)
                            .await;
                    }
                    None => warn!(to = %to, "whatsapp cloud api is not configured, reply not sent"),
                },
                Err(err) => error!(error = %err, "failed to process whatsapp message"),
            }
        });
    }

    (StatusCode::OK, Json(json!({ "ok": true, "received": received }))).into_response()
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let database = match state.store.ping().await {
        Ok(()) => true,
        Err(err) => {
            warn!(error = %err, "health check could not reach the store");
            false
        }
    };
    let status = if database {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(json!({
            "status": if database { "healthy" } else { "unhealthy" },
            "timestamp": now_iso(),
            "version": env!("CARGO_PKG_VERSION"),
            "services": {
                "database": if database { "connected" } else { "disconnected" },
                "api": "running",
            }
        })),
    )
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhook/twilio/whatsapp", post(twilio_webhook))
        .route(
            "/webhook/whatsapp",
            get(whatsapp_webhook_verify).post(whatsapp_webhook_event),
        )
        .route(
            "/api/studios",
            get(admin::list_studios).post(admin::create_studio),
        )
        .route(
            "/api/studios/{studio_id}",
            get(admin::get_studio).put(admin::update_studio),
        )
        .route(
            "/api/studios/{studio_id}/bot-config",
            get(admin::get_bot_config).put(admin::update_bot_config),
        )
        .route(
            "/api/studios/{studio_id}/conversations",
            get(admin::list_conversations),
        )
        .route(
            "/api/conversations/{conversation_id}",
            get(admin::get_conversation),
        )
        .route(
            "/api/bot-test",
            get(admin::get_bot_test).post(admin::post_bot_test),
        )
        .route(
            "/api/bot-test/templates",
            get(admin::list_templates)
                .post(admin::create_template)
                .delete(admin::delete_template),
        )
        .route(
            "/api/bot-test/evaluations",
            get(admin::list_evaluations)
                .post(admin::create_evaluation)
                .delete(admin::delete_evaluations),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn open_store(settings: &Settings) -> AppResult<Arc<dyn ConversationStore>> {
    let Some(database_url) = settings.database_url.as_deref() else {
        warn!("DATABASE_URL not set, running on the in-memory store");
        return Ok(Arc::new(MemoryStore::new()));
    };
    let db = PgPoolOptions::new()
        .max_connections(settings.database_max_connections)
        .connect(database_url)
        .await?;
    sqlx::migrate!("./migrations").run(&db).await?;
    info!("database connected and migrated");
    Ok(Arc::new(PgStore::new(db)))
}

pub async fn run() -> AppResult<()> {
    let settings = Settings::from_env();
    let http = reqwest::Client::builder().build()?;

    let store = open_store(&settings).await?;
    if settings.openai.api_key.is_none() {
        warn!("OPENAI_API_KEY not set, model turns will answer with the apology reply");
    }
    let model = Arc::new(OpenAiChatModel::new(http.clone(), settings.openai.clone()));
    let notifier = Arc::new(HttpLeadNotifier::new(
        http.clone(),
        settings.lead_webhook_timeout,
    ));

    let mut state = AppState::new(settings.clone(), store, model, notifier);
    state.twilio = settings.twilio.clone().map(|twilio| {
        Arc::new(TwilioSender::new(http.clone(), twilio)) as Arc<dyn MessageSender>
    });
    state.cloud_api = settings.cloud_api.clone().map(|cloud| {
        Arc::new(CloudApiSender::new(http.clone(), cloud)) as Arc<dyn MessageSender>
    });
    info!(
        version = env!("CARGO_PKG_VERSION"),
        model = %settings.openai.model,
        twilio = state.twilio.is_some(),
        cloud_api = state.cloud_api.is_some(),
        "lead bot starting"
    );

    let app = router(Arc::new(state));
    let port = settings.port;
    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|err| AppError::Config(format!("failed to bind {addr}: {err}")))?;

    info!("lead bot listening at http://localhost:{port}");
    axum::serve(listener, app)
        .await
        .map_err(|err| AppError::Config(format!("server runtime failure: {err}")))
}
