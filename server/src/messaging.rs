//! Outbound WhatsApp replies through Twilio or the Meta Cloud API.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use rand::Rng;
use serde_json::{json, Value};
use tracing::{debug, error, info};

use crate::{
    config::{CloudApiSettings, TwilioSettings},
    error::{AppError, AppResult},
    types::{normalize_whatsapp_phone, BotReply},
};

const MAX_BUTTONS: usize = 3;

#[async_trait]
pub trait MessageSender: Send + Sync {
    /// Sends one text message; returns the provider's message id when it gives one.
    async fn send_text(&self, to: &str, body: &str) -> AppResult<Option<String>>;

    fn provider(&self) -> &'static str;
}

/// Simulated typing time for a message of this length.
pub fn smart_delay_ms(text: &str) -> u64 {
    let len = text.chars().count();
    let mut rng = rand::rng();
    match len {
        0..=19 => 0,
        20..=49 => 1000 + rng.random_range(0..1000),
        50..=99 => 2000 + rng.random_range(0..2000),
        _ => 3000 + rng.random_range(0..2000),
    }
}

pub fn format_with_buttons(body: &str, buttons: &[String]) -> String {
    if buttons.is_empty() {
        return body.to_string();
    }
    let options = buttons
        .iter()
        .take(MAX_BUTTONS)
        .enumerate()
        .map(|(i, button)| format!("{}. {button}", i + 1))
        .collect::<Vec<_>>()
        .join("\n");
    format!("{body}\n\n{options}")
}

/// Pause before message `index`. Follow-up messages wait at least the reply's `delay_ms`.
fn pause_before(index: usize, message: &str, reply: &BotReply, pacing: bool) -> u64 {
    if !pacing {
        return 0;
    }
    let typing = smart_delay_ms(message);
    if index == 0 {
        typing
    } else {
        typing.max(reply.delay_ms)
    }
}

/// Sends the reply messages in order; only the last one carries the buttons.
/// Stops at the first failure and returns how many went out.
pub async fn deliver_reply(
    sender: Arc<dyn MessageSender>,
    to: &str,
    reply: &BotReply,
    pacing: bool,
) -> usize {
    let last = reply.messages.len().saturating_sub(1);
    let mut sent = 0;
    for (index, message) in reply.messages.iter().enumerate() {
        let body = if index == last {
            format_with_buttons(message, &reply.buttons)
        } else {
            message.clone()
        };
        let delay = pause_before(index, message, reply, pacing);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        match sender.send_text(to, &body).await {
            Ok(message_id) => {
                debug!(
                    provider = sender.provider(),
                    to,
                    delay_ms = delay,
                    message_id = ?message_id,
                    "reply message sent"
                );
                sent += 1;
            }
            Err(err) => {
                error!(
                    provider = sender.provider(),
                    to,
                    error = %err,
                    "failed to send reply message"
                );
                break;
            }
        }
    }
    info!(
        provider = sender.provider(),
        to,
        sent,
        total = reply.messages.len(),
        "reply delivered"
    );
    sent
}

pub struct TwilioSender {
    client: reqwest::Client,
    settings: TwilioSettings,
    base_url: String,
}

impl TwilioSender {
    pub fn new(client: reqwest::Client, settings: TwilioSettings) -> Self {
        Self::with_base_url(client, settings, "https://api.twilio.com")
    }

    pub fn with_base_url(
        client: reqwest::Client,
        settings: TwilioSettings,
        base_url: &str,
    ) -> Self {
        Self {
            client,
            settings,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

fn whatsapp_address(raw: &str) -> String {
    let raw = raw.trim();
    if raw.starts_with("whatsapp:") {
        raw.to_string()
    } else {
        format!("whatsapp:{raw}")
    }
}

#[async_trait]
impl MessageSender for TwilioSender {
    async fn send_text(&self, to: &str, body: &str) -> AppResult<Option<String>> {
        let url = format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            self.base_url, self.settings.account_sid
        );
        let from = whatsapp_address(&self.settings.whatsapp_number);
        let to = whatsapp_address(to);
        let response = self
            .client
            .post(url)
            .basic_auth(&self.settings.account_sid, Some(&self.settings.auth_token))
            .form(&[("From", from.as_str()), ("To", to.as_str()), ("Body", body)])
            .send()
            .await?;
        let status = response.status();
        let raw_body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(AppError::Provider(format!("twilio returned {status}: {raw_body}")));
        }
        let parsed = serde_json::from_str::<Value>(&raw_body).unwrap_or(Value::Null);
        Ok(parsed.get("sid").and_then(Value::as_str).map(str::to_string))
    }

    fn provider(&self) -> &'static str {
        "twilio"
    }
}

pub struct CloudApiSender {
    client: reqwest::Client,
    settings: CloudApiSettings,
    base_url: String,
}

impl CloudApiSender {
    pub fn new(client: reqwest::Client, settings: CloudApiSettings) -> Self {
        Self::with_base_url(client, settings, "https://graph.facebook.com")
    }

    pub fn with_base_url(
        client: reqwest::Client,
        settings: CloudApiSettings,
        base_url: &str,
    ) -> Self {
        Self {
            client,
            settings,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl MessageSender for CloudApiSender {
    async fn send_text(&self, to: &str, body: &str) -> AppResult<Option<String>> {
        let Some(to_digits) = normalize_whatsapp_phone(to) else {
            return Err(AppError::BadRequest(format!("recipient '{to}' has no digits")));
        };
        let payload = json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": to_digits,
            "type": "text",
            "text": { "preview_url": false, "body": body }
        });
        let response = self
            .client
            .post(format!(
                "{}/{}/{}/messages",
                self.base_url, self.settings.graph_version, self.settings.phone_number_id
            ))
            .bearer_auth(&self.settings.access_token)
            .json(&payload)
            .send()
            .await?;
        let status = response.status();
        let raw_body = response.text().await.unwrap_or_default();
        let body =
            serde_json::from_str::<Value>(&raw_body).unwrap_or_else(|_| json!({ "raw": raw_body }));
        if !status.is_success() {
            return Err(AppError::Provider(format!(
                "whatsapp cloud api returned {status}: {body}"
            )));
        }
        Ok(body
            .pointer("/messages/0/id")
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    fn provider(&self) -> &'static str {
        "whatsapp_cloud"
    }
}

#[cfg(test)]
mod tests {
    use axum::{extract::State, routing::post, Json, Router};
    use tokio::sync::Mutex;

    use super::*;

    #[test]
    fn delay_grows_with_length() {
        assert_eq!(smart_delay_ms("Hola!"), 0);
        let medium = smart_delay_ms("Una rosa al braç, m'agrada molt!");
        assert!((1000..2000).contains(&medium));
        let long = smart_delay_ms(&"a".repeat(150));
        assert!((3000..5000).contains(&long));
    }

    #[test]
    fn follow_up_messages_respect_reply_delay() {
        let reply = BotReply {
            messages: vec!["Hola".to_string(), "Què vols?".to_string()],
            buttons: vec![],
            delay_ms: 1000,
        };
        assert_eq!(pause_before(0, "Hola", &reply, true), 0);
        assert_eq!(pause_before(1, "Què vols?", &reply, true), 1000);
        assert_eq!(pause_before(1, "Què vols?", &reply, false), 0);
    }

    #[test]
    fn buttons_are_capped_at_three() {
        let buttons = ["Sí", "No", "Potser", "Més tard"].map(String::from);
        assert_eq!(
            format_with_buttons("Vols continuar?", &buttons),
            "Vols continuar?\n\n1. Sí\n2. No\n3. Potser"
        );
        assert_eq!(format_with_buttons("Hola", &[]), "Hola");
    }

    #[derive(Default)]
    struct RecordingSender {
        sent: Mutex<Vec<(String, String)>>,
        fail_after: Option<usize>,
    }

    #[async_trait]
    impl MessageSender for RecordingSender {
        async fn send_text(&self, to: &str, body: &str) -> AppResult<Option<String>> {
            let mut sent = self.sent.lock().await;
            if self.fail_after.is_some_and(|limit| sent.len() >= limit) {
                return Err(AppError::Provider("provider down".to_string()));
            }
            sent.push((to.to_string(), body.to_string()));
            Ok(None)
        }

        fn provider(&self) -> &'static str {
            "recording"
        }
    }

    #[tokio::test]
    async fn only_last_message_carries_buttons() {
        let sender = Arc::new(RecordingSender::default());
        let reply = BotReply {
            messages: vec!["Perfecte!".to_string(), "Vols que ho envii?".to_string()],
            buttons: vec!["Sí".to_string(), "No".to_string()],
            delay_ms: 0,
        };
        let sent = deliver_reply(sender.clone(), "+34600111222", &reply, false).await;
        assert_eq!(sent, 2);
        let log = sender.sent.lock().await;
        assert_eq!(log[0].1, "Perfecte!");
        assert_eq!(log[1].1, "Vols que ho envii?\n\n1. Sí\n2. No");
    }

    #[tokio::test]
    async fn delivery_stops_at_first_failure() {
        let sender = Arc::new(RecordingSender {
            fail_after: Some(1),
            ..RecordingSender::default()
        });
        let reply = BotReply::text(&["u", "dos", "tres"]);
        assert_eq!(deliver_reply(sender, "+34600111222", &reply, false).await, 1);
    }

    #[tokio::test]
    async fn cloud_api_posts_digits_only_recipient() {
        let received: Arc<Mutex<Vec<Value>>> = Arc::default();
        let app = Router::new()
            .route(
                "/v21.0/{phone_id}/messages",
                post(
                    |State(received): State<Arc<Mutex<Vec<Value>>>>, Json(body): Json<Value>| async move {
                        received.lock().await.push(body);
                        Json(json!({ "messages": [{ "id": "wamid.1" }] }))
                    },
                ),
            )
            .with_state(received.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        let sender = CloudApiSender::with_base_url(
            reqwest::Client::new(),
            CloudApiSettings {
                access_token: "token".to_string(),
                phone_number_id: "12345".to_string(),
                graph_version: "v21.0".to_string(),
            },
            &format!("http://{addr}"),
        );
        let id = sender
            .send_text("whatsapp:+34 600 111 222", "Hola!")
            .await
            .expect("sent");
        assert_eq!(id.as_deref(), Some("wamid.1"));
        let received = received.lock().await;
        assert_eq!(received[0]["to"], "34600111222");
        assert_eq!(received[0]["text"]["body"], "Hola!");
        assert_eq!(received[0]["messaging_product"], "whatsapp");
    }
}
