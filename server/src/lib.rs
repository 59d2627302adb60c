pub mod admin;
pub mod app;
pub mod config;
pub mod conversation;
pub mod error;
pub mod fields;
pub mod intent;
pub mod lead_webhook;
pub mod llm;
pub mod messaging;
pub mod metrics;
pub mod prompting;
pub mod store;
pub mod tools;
pub mod types;
