//! Per-conversation quality signals, logged when a conversation ends.

use std::{collections::HashSet, sync::OnceLock};

use regex::Regex;
use tracing::info;

use crate::types::{Conversation, ConversationMessage, MessageRole};

const FRUSTRATION_PHRASES: &[&str] = &[
    "loop",
    "bucle",
    "repet",
    "ja t'ho he dit",
    "ja te ho he dit",
    "joder",
    "cansino",
    "pesado",
    "otra vez",
];

fn normalize_question(text: &str) -> String {
    static PUNCTUATION: OnceLock<Option<Regex>> = OnceLock::new();
    let lower = text.to_lowercase();
    match PUNCTUATION.get_or_init(|| Regex::new(r"[?.!¿¡]").ok()) {
        Some(re) => re.replace_all(&lower, "").trim().to_string(),
        None => lower.trim().to_string(),
    }
}

/// Any frustration phrase in the user's part of the last five messages.
pub fn detect_frustration(messages: &[ConversationMessage]) -> bool {
    let start = messages.len().saturating_sub(5);
    messages[start..]
        .iter()
        .filter(|m| m.role == MessageRole::User)
        .any(|m| {
            let content = m.content.to_lowercase();
            FRUSTRATION_PHRASES.iter().any(|phrase| content.contains(phrase))
        })
}

/// How many bot questions repeat an earlier one once punctuation and case are ignored.
pub fn detect_loops(messages: &[ConversationMessage]) -> usize {
    let mut seen = HashSet::new();
    let mut loops = 0;
    for message in messages {
        if message.role != MessageRole::Bot || !message.content.contains('?') {
            continue;
        }
        if !seen.insert(normalize_question(&message.content)) {
            loops += 1;
        }
    }
    loops
}

pub fn count_user_questions(messages: &[ConversationMessage]) -> usize {
    messages
        .iter()
        .filter(|m| m.role == MessageRole::User && m.content.contains('?'))
        .count()
}

pub fn log_conversation_metrics(
    conversation: &Conversation,
    messages: &[ConversationMessage],
    model: &str,
) {
    info!(
        conversation_id = %conversation.id,
        studio_id = %conversation.studio_id,
        outcome = %conversation.status,
        model,
        messages = messages.len(),
        user_questions = count_user_questions(messages),
        loops = detect_loops(messages),
        frustrated = detect_frustration(messages),
        lead_sent = conversation.lead_sent(),
        tools = ?conversation.tools_used,
        "conversation metrics"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::now_iso;

    fn message(role: MessageRole, content: &str) -> ConversationMessage {
        ConversationMessage {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: "c1".to_string(),
            role,
            content: content.to_string(),
            provider_message_id: None,
            created_at: now_iso(),
        }
    }

    #[test]
    fn repeated_bot_questions_count_as_loops() {
        let messages = vec![
            message(MessageRole::Bot, "On el vols?"),
            message(MessageRole::User, "no ho sé"),
            message(MessageRole::Bot, "¿On el vols?!"),
            message(MessageRole::Bot, "on EL vols?"),
            message(MessageRole::Bot, "Perfecte."),
        ];
        assert_eq!(detect_loops(&messages), 2);
    }

    #[test]
    fn frustration_only_looks_at_recent_user_messages() {
        let mut messages = vec![message(MessageRole::User, "Ja t'ho he dit!")];
        assert!(detect_frustration(&messages));
        for _ in 0..5 {
            messages.push(message(MessageRole::Bot, "ok"));
        }
        assert!(!detect_frustration(&messages));
        assert!(!detect_frustration(&[message(MessageRole::Bot, "otra vez")]));
    }

    #[test]
    fn counts_user_questions() {
        let messages = vec![
            message(MessageRole::User, "Quant costa?"),
            message(MessageRole::Bot, "Depèn, on el vols?"),
            message(MessageRole::User, "braç"),
        ];
        assert_eq!(count_user_questions(&messages), 1);
    }
}
