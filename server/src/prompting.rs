use minijinja::{context, Environment};

use crate::{
    fields::{LeadFields, FIELD_NAMES},
    types::ConversationStatus,
};

const SYSTEM_PROMPT_TEMPLATE: &str = include_str!("prompts/system_prompt.j2");

pub struct SystemPromptContext<'a> {
    pub studio_name: &'a str,
    pub collected: &'a LeadFields,
    pub status: ConversationStatus,
    pub lead_sent: bool,
    pub user_message: &'a str,
}

fn collected_lines(collected: &LeadFields) -> Vec<String> {
    FIELD_NAMES
        .iter()
        .filter_map(|field| collected.get(field).map(|value| format!("{field}: {value}")))
        .collect()
}

pub fn render_system_prompt(ctx: &SystemPromptContext<'_>) -> String {
    let mut env = Environment::new();
    if env
        .add_template("system_prompt", SYSTEM_PROMPT_TEMPLATE)
        .is_err()
    {
        return fallback_system_prompt(ctx);
    }

    let Ok(template) = env.get_template("system_prompt") else {
        return fallback_system_prompt(ctx);
    };

    template
        .render(context! {
            studio_name => studio_name(ctx),
            collected => collected_lines(ctx.collected),
            missing => ctx.collected.missing_fields(),
            has_name => ctx.collected.get("name").is_some(),
            lead_sent => ctx.lead_sent,
            status => ctx.status.as_str(),
            user_message => ctx.user_message.trim(),
        })
        .unwrap_or_else(|_| fallback_system_prompt(ctx))
}

fn studio_name<'a>(ctx: &SystemPromptContext<'a>) -> &'a str {
    if ctx.studio_name.trim().is_empty() {
        "l'estudi"
    } else {
        ctx.studio_name.trim()
    }
}

fn fallback_system_prompt(ctx: &SystemPromptContext<'_>) -> String {
    let mut prompt = format!(
        "Ets l'assistent de WhatsApp de {}, un estudi de tatuatges.\n\
         Respon en català, amb missatges curts, i fes UNA pregunta cada vegada.\n\
         Mai donis consells mèdics ni preus finals.\n\
         Retorna la resposta com un array JSON de missatges curts.\n",
        studio_name(ctx)
    );

    let collected = collected_lines(ctx.collected);
    prompt.push_str("\nEstat actual:\n");
    if collected.is_empty() {
        prompt.push_str("(res encara)\n");
    } else {
        for line in collected {
            prompt.push_str(&line);
            prompt.push('\n');
        }
    }

    let missing = ctx.collected.missing_fields();
    if !missing.is_empty() {
        prompt.push_str("\nEncara falta: ");
        prompt.push_str(&missing.join(", "));
        prompt.push('\n');
    }

    if ctx.lead_sent {
        prompt.push_str("\nLa info ja s'ha enviat a l'estudi. Usa update_lead per a canvis.\n");
    }

    prompt
}
