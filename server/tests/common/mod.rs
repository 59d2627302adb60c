#![allow(dead_code)]

use std::{collections::VecDeque, sync::Arc};

use async_trait::async_trait;
use axum_test::TestServer;
use serde_json::Value;
use tokio::sync::Mutex;

use lead_bot::{
    app::router,
    config::Settings,
    error::AppResult,
    lead_webhook::LeadNotifier,
    llm::{ChatCompletion, ChatModel, ChatRequest},
    store::{ConversationStore, MemoryStore},
    tools::{fields_from_args, ToolCall},
    types::{AppState, CreateStudioBody, QualifiedLead, Studio},
};

pub const STUDIO_NUMBER: &str = "+14155238886";

/// Replays queued completions; an empty queue answers with no text and no tools.
#[derive(Default)]
pub struct ScriptedModel {
    script: Mutex<VecDeque<ChatCompletion>>,
}

impl ScriptedModel {
    pub async fn push(&self, content: &str, tool_calls: Vec<ToolCall>) {
        self.script.lock().await.push_back(ChatCompletion {
            content: content.to_string(),
            tool_calls,
        });
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    async fn complete(&self, _request: ChatRequest) -> AppResult<ChatCompletion> {
        Ok(self.script.lock().await.pop_front().unwrap_or_default())
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub leads: Mutex<Vec<QualifiedLead>>,
}

#[async_trait]
impl LeadNotifier for RecordingNotifier {
    async fn deliver(&self, _studio: &Studio, lead: &QualifiedLead) -> bool {
        self.leads.lock().await.push(lead.clone());
        true
    }
}

pub struct TestApp {
    pub server: TestServer,
    pub state: Arc<AppState>,
    pub model: Arc<ScriptedModel>,
    pub notifier: Arc<RecordingNotifier>,
    pub studio: Studio,
}

pub async fn spawn_app_with(settings: Settings) -> TestApp {
    let store = Arc::new(MemoryStore::new());
    let studio = store
        .create_studio(CreateStudioBody {
            name: "Tinta Negra".to_string(),
            email: "hola@tintanegra.cat".to_string(),
            whatsapp_number: Some(format!("whatsapp:{STUDIO_NUMBER}")),
            webhook_url: Some("http://127.0.0.1:9/leads".to_string()),
        })
        .await
        .expect("studio");
    let model = Arc::new(ScriptedModel::default());
    let notifier = Arc::new(RecordingNotifier::default());
    let state = Arc::new(AppState::new(
        settings,
        store,
        model.clone(),
        notifier.clone(),
    ));
    let server = TestServer::new(router(state.clone())).expect("test server");
    TestApp {
        server,
        state,
        model,
        notifier,
        studio,
    }
}

pub async fn spawn_app() -> TestApp {
    spawn_app_with(Settings::for_tests()).await
}

pub fn extract(pairs: &[(&str, &str)]) -> ToolCall {
    let args = Value::Object(
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
            .collect(),
    );
    ToolCall::ExtractTattooInfo(fields_from_args(&args))
}
