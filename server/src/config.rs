//! Process configuration read from the environment (and an optional `.env`).

use std::{env, str::FromStr, time::Duration};

use tracing::warn;

#[derive(Debug, Clone)]
pub struct OpenAiSettings {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub history_limit: usize,
}

#[derive(Debug, Clone)]
pub struct TwilioSettings {
    pub account_sid: String,
    pub auth_token: String,
    pub whatsapp_number: String,
}

#[derive(Debug, Clone)]
pub struct CloudApiSettings {
    pub access_token: String,
    pub phone_number_id: String,
    pub graph_version: String,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub port: u16,
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub openai: OpenAiSettings,
    pub twilio: Option<TwilioSettings>,
    pub cloud_api: Option<CloudApiSettings>,
    pub webhook_verify_token: Option<String>,
    pub whatsapp_app_secret: Option<String>,
    pub lead_webhook_timeout: Duration,
    pub reply_pacing: bool,
    pub admin_api_token: Option<String>,
    pub bot_test_studio_id: Option<String>,
}

fn env_text(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    let Some(raw) = env_text(key) else {
        return default;
    };
    match raw.parse::<T>() {
        Ok(value) => value,
        Err(_) => {
            warn!(key, value = %raw, "invalid value in environment, using default");
            default
        }
    }
}

fn env_flag(key: &str, default: bool) -> bool {
    match env_text(key).map(|v| v.to_ascii_lowercase()) {
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => true,
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => false,
        Some(v) => {
            warn!(key, value = %v, "invalid boolean in environment, using default");
            default
        }
        None => default,
    }
}

impl Settings {
    /// Reads `.env` (if present) and then the process environment.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        let twilio = match (
            env_text("TWILIO_ACCOUNT_SID"),
            env_text("TWILIO_AUTH_TOKEN"),
            env_text("TWILIO_WHATSAPP_NUMBER"),
        ) {
            (Some(account_sid), Some(auth_token), Some(whatsapp_number)) => Some(TwilioSettings {
                account_sid,
                auth_token,
                whatsapp_number,
            }),
            _ => None,
        };

        let cloud_api = match (
            env_text("WHATSAPP_ACCESS_TOKEN"),
            env_text("WHATSAPP_PHONE_NUMBER_ID"),
        ) {
            (Some(access_token), Some(phone_number_id)) => Some(CloudApiSettings {
                access_token,
                phone_number_id,
                graph_version: env_text("WHATSAPP_GRAPH_VERSION")
                    .unwrap_or_else(|| "v21.0".to_string()),
            }),
            _ => None,
        };

        Self {
            port: env_parse("PORT", 3001),
            database_url: env_text("DATABASE_URL"),
            database_max_connections: env_parse("DATABASE_MAX_CONNECTIONS", 10),
            openai: OpenAiSettings {
                api_key: env_text("OPENAI_API_KEY"),
                base_url: env_text("OPENAI_BASE_URL")
                    .unwrap_or_else(|| "https://api.openai.com/v1".to_string())
                    .trim_end_matches('/')
                    .to_string(),
                model: env_text("OPENAI_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string()),
                temperature: env_parse("OPENAI_TEMPERATURE", 0.4),
                max_tokens: env_parse("OPENAI_MAX_TOKENS", 200),
                history_limit: env_parse("LLM_HISTORY_LIMIT", 14),
            },
            twilio,
            cloud_api,
            webhook_verify_token: env_text("WEBHOOK_VERIFY_TOKEN"),
            whatsapp_app_secret: env_text("WHATSAPP_APP_SECRET"),
            lead_webhook_timeout: Duration::from_secs(env_parse("LEAD_WEBHOOK_TIMEOUT_SECS", 10)),
            reply_pacing: env_flag("REPLY_PACING", true),
            admin_api_token: env_text("ADMIN_API_TOKEN"),
            bot_test_studio_id: env_text("BOT_TEST_STUDIO_ID"),
        }
    }

    /// Settings for tests and local tooling: no providers, no database, no pacing.
    pub fn for_tests() -> Self {
        Self {
            port: 0,
            database_url: None,
            database_max_connections: 1,
            openai: OpenAiSettings {
                api_key: None,
                base_url: "http://127.0.0.1:9".to_string(),
                model: "test-model".to_string(),
                temperature: 0.0,
                max_tokens: 200,
                history_limit: 14,
            },
            twilio: None,
            cloud_api: None,
            webhook_verify_token: Some("verify-me".to_string()),
            whatsapp_app_secret: None,
            lead_webhook_timeout: Duration::from_secs(2),
            reply_pacing: false,
            admin_api_token: None,
            bot_test_studio_id: None,
        }
    }
}
