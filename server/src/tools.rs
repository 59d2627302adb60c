//! Function tools offered to the model and parsing of the calls it makes.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

use crate::fields::LeadFields;

pub const EXTRACT_TATTOO_INFO: &str = "extract_tattoo_info";
pub const SEND_TO_STUDIO: &str = "send_to_studio";
pub const UPDATE_LEAD: &str = "update_lead";
pub const CLOSE_CONVERSATION: &str = "close_conversation";

pub const STYLE_CHOICES: &[&str] = &[
    "Realisme",
    "Tradicional",
    "Línia fina",
    "Neo-tradicional",
    "Abstracte",
    "No especificat",
];

pub const COLOR_CHOICES: &[&str] = &["Blanc i negre", "Color", "No especificat"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    GratitudeAfterSend,
    GoodbyeAfterSend,
    NotInterested,
    WillThinkAboutIt,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToolCall {
    ExtractTattooInfo(LeadFields),
    SendToStudio { confirmed: bool },
    UpdateLead { changes: String, requires_confirmation: bool },
    CloseConversation { reason: CloseReason },
}

impl ToolCall {
    pub fn name(&self) -> &'static str {
        match self {
            ToolCall::ExtractTattooInfo(_) => EXTRACT_TATTOO_INFO,
            ToolCall::SendToStudio { .. } => SEND_TO_STUDIO,
            ToolCall::UpdateLead { .. } => UPDATE_LEAD,
            ToolCall::CloseConversation { .. } => CLOSE_CONVERSATION,
        }
    }

    /// Parses one `function` entry of a chat completion. Unknown tools and
    /// arguments that do not match the schema are logged and skipped.
    pub fn parse(name: &str, arguments: &str) -> Option<ToolCall> {
        let args = if arguments.trim().is_empty() {
            json!({})
        } else {
            match serde_json::from_str::<Value>(arguments) {
                Ok(value) => value,
                Err(err) => {
                    warn!(tool = name, error = %err, "tool arguments are not valid json");
                    return None;
                }
            }
        };

        match name {
            EXTRACT_TATTOO_INFO => Some(ToolCall::ExtractTattooInfo(fields_from_args(&args))),
            SEND_TO_STUDIO => Some(ToolCall::SendToStudio {
                confirmed: args.get("confirmed").and_then(Value::as_bool).unwrap_or(true),
            }),
            UPDATE_LEAD => Some(ToolCall::UpdateLead {
                changes: args
                    .get("changes")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                requires_confirmation: args
                    .get("requiresConfirmation")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            }),
            CLOSE_CONVERSATION => {
                let reason = args.get("reason").cloned().unwrap_or(Value::Null);
                match serde_json::from_value::<CloseReason>(reason) {
                    Ok(reason) => Some(ToolCall::CloseConversation { reason }),
                    Err(err) => {
                        warn!(tool = name, error = %err, "unknown close reason");
                        None
                    }
                }
            }
            other => {
                warn!(tool = other, "model called an unknown tool");
                None
            }
        }
    }
}

/// Keeps only string-valued known fields; anything else the model sends is dropped.
pub fn fields_from_args(args: &Value) -> LeadFields {
    let text = |key: &str| {
        args.get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };
    LeadFields {
        description: text("description"),
        placement: text("placement"),
        placement_size: text("placement_size"),
        placement_concept: text("placement_concept"),
        style: text("style"),
        color: text("color"),
        budget: text("budget"),
        timing_preference: text("timing_preference"),
        name: text("name"),
    }
}

pub fn tool_definitions() -> Value {
    json!([
        {
            "type": "function",
            "function": {
                "name": EXTRACT_TATTOO_INFO,
                "description": "Call this when the user mentions tattoo details. Extract ONLY what they explicitly said in THIS message, and always answer with natural text as well.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "description": { "type": "string", "description": "What tattoo they want (e.g. \"rosa\", \"drac\", \"mandala\")." },
                        "placement": { "type": "string", "description": "Where on the body (e.g. \"braç\", \"bíceps\", \"esquena\")." },
                        "placement_size": { "type": "string", "description": "Placement plus approximate size S/M/L/XL (e.g. \"avantbraç M\")." },
                        "placement_concept": { "type": "string", "description": "High-level placement concept for multi-area pieces." },
                        "style": { "type": "string", "enum": STYLE_CHOICES },
                        "color": { "type": "string", "enum": COLOR_CHOICES },
                        "timing_preference": { "type": "string", "description": "When they would like it (e.g. \"aquesta setmana\", \"tardes\")." },
                        "name": { "type": "string", "description": "The user's name, only if they gave it." }
                    },
                    "required": []
                }
            }
        },
        {
            "type": "function",
            "function": {
                "name": SEND_TO_STUDIO,
                "description": "Send the lead to the studio once there is a description and a placement. Call it once.",
                "parameters": {
                    "type": "object",
                    "properties": { "confirmed": { "type": "boolean" } },
                    "required": ["confirmed"]
                }
            }
        },
        {
            "type": "function",
            "function": {
                "name": UPDATE_LEAD,
                "description": "Update a lead that was already sent. Changes to description, placement or size need confirmation; colour, style or timing changes do not.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "changes": { "type": "string", "description": "Summary of what changed (e.g. \"placement: braç → bíceps\")." },
                        "requiresConfirmation": { "type": "boolean" }
                    },
                    "required": ["changes", "requiresConfirmation"]
                }
            }
        },
        {
            "type": "function",
            "function": {
                "name": CLOSE_CONVERSATION,
                "description": "The user is saying goodbye, thanks, or is no longer interested.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "reason": {
                            "type": "string",
                            "enum": ["gratitude_after_send", "goodbye_after_send", "not_interested", "will_think_about_it"]
                        }
                    },
                    "required": ["reason"]
                }
            }
        }
    ])
}
