//! Deterministic phrase matching that runs before (or instead of) the LLM.

use crate::fields::LeadFields;

const COMPLETION_PHRASES: &[&str] = &[
    "ja està",
    "ja esta",
    "ja está",
    "ja ho tens",
    "ja val",
    "prou",
    "listo",
    "done",
    "envia",
    "envia-ho",
    "posteja",
    "ok, gràcies",
    "ok gracias",
    "gràcies",
];

/// Polite refusals that would otherwise be shadowed by the gratitude phrases.
const DECLINE_PHRASES: &[&str] = &["no gràcies", "no, gràcies", "no gracias", "no, gracias"];

const WANTS_PHRASES: &[&str] = &["nono", "no no", "vull un", "vull fer", "volia"];

const UNINTERESTED_PHRASES: &[&str] = &[
    "no m'interessa",
    "no m interessa",
    "no minteressa",
    "no me interesa",
    "not interested",
    "no interest",
    "no interested",
    "no vull seguir",
    "passo",
    "ho deixo",
    "deixa-ho",
    "deixa ho",
    "cancel·la",
    "cancela",
    "cancel",
    "stop",
    "parar",
    "para",
    "basta",
    "no gràcies",
    "no gracias",
    "no, gràcies",
    "no, gracias",
    "no vull cap",
    "no em va bé i no vull",
];

const MEDICAL_KEYWORDS: &[&str] = &[
    "al·lèrgia",
    "alergia",
    "allergic",
    "allergy",
    "infecció",
    "infection",
    "cura",
    "healing",
    "pell sensible",
    "sensitive skin",
    "diabetis",
    "diabetes",
    "embaràs",
    "embarassada",
    "pregnant",
    "medicació",
    "medication",
    "dolor",
    "cicatri",
    "scar",
    "queloide",
    "keloid",
];

/// Short English words that would misfire as stems ("painting").
const MEDICAL_WORDS: &[&str] = &["pain", "painful"];

const COMPLEX_KEYWORDS: &[&str] = &[
    "cover",
    "cover-up",
    "cobrir",
    "tapa",
    "disseny personalitzat",
    "custom design",
    "màniga sencera",
    "full sleeve",
    "esquena completa",
    "full back",
    "cicatri",
    "scar",
    "removal",
    "eliminació",
    "làser",
    "laser",
];

const CONFIRMATION_PHRASES: &[&str] = &[
    "sí",
    "si",
    "yes",
    "vale",
    "ok",
    "d'acord",
    "de acord",
    "dacord",
    "endavant",
    "perfecte",
    "genial",
    "correcte",
    "exacte",
    "això",
    "ja està",
    "confirmo",
    "confirma",
    "actualitza",
    "canvia",
    "canviat",
];

const REJECTION_PHRASES: &[&str] = &[
    "no",
    "nop",
    "nope",
    "cancel·la",
    "cancela",
    "deixa'ho",
    "deixa-ho",
    "no cal",
    "no fa falta",
    "no ho canviïs",
    "no ho canvies",
    "no actualitzis",
    "no actualitzes",
    "manté",
    "mantén",
    "així està bé",
    "està bé així",
    "deixa-ho com està",
];

/// Messages at most this long may confirm or reject by containing a phrase.
const SHORT_REPLY_CHARS: usize = 50;

fn normalize(text: &str) -> String {
    text.trim().to_lowercase().replace('’', "'")
}

fn matches_at(text: &str, phrase: &str, whole_word: bool) -> bool {
    if phrase.is_empty() {
        return false;
    }
    text.match_indices(phrase).any(|(start, matched)| {
        let before = text[..start].chars().next_back();
        let after = text[start + matched.len()..].chars().next();
        !before.is_some_and(char::is_alphanumeric)
            && !(whole_word && after.is_some_and(char::is_alphanumeric))
    })
}

/// True when `phrase` occurs in `text` without letters or digits glued to it.
pub fn contains_phrase(text: &str, phrase: &str) -> bool {
    matches_at(text, phrase, true)
}

/// True when a word in `text` starts with `stem`, so "tapa" finds "tapar".
pub fn contains_stem(text: &str, stem: &str) -> bool {
    matches_at(text, stem, false)
}

fn contains_any(text: &str, phrases: &[&str]) -> bool {
    phrases.iter().any(|phrase| contains_phrase(text, phrase))
}

fn contains_any_stem(text: &str, stems: &[&str]) -> bool {
    stems.iter().any(|stem| contains_stem(text, stem))
}

pub fn detect_exit_intent(text: &str) -> bool {
    let text = normalize(text);
    if text.is_empty() {
        return false;
    }
    if contains_any(&text, DECLINE_PHRASES) && !contains_any(&text, WANTS_PHRASES) {
        return true;
    }
    if contains_any(&text, COMPLETION_PHRASES) || contains_any(&text, WANTS_PHRASES) {
        return false;
    }
    contains_any(&text, UNINTERESTED_PHRASES)
}

pub fn detect_medical_question(text: &str) -> bool {
    let text = normalize(text);
    contains_any_stem(&text, MEDICAL_KEYWORDS) || contains_any(&text, MEDICAL_WORDS)
}

pub fn detect_complex_request(text: &str, collected: &LeadFields) -> bool {
    if contains_any_stem(&normalize(text), COMPLEX_KEYWORDS) {
        return true;
    }
    collected
        .placement_size
        .as_deref()
        .map(|size| {
            let size = size.to_lowercase();
            size.contains("xl") || size.contains("màniga")
        })
        .unwrap_or(false)
}

fn matches_short_reply(text: &str, phrases: &[&str]) -> bool {
    let text = normalize(text);
    let text = text.trim_end_matches(['.', ' ']);
    if text.is_empty() {
        return false;
    }
    let short = text.chars().count() < SHORT_REPLY_CHARS;
    phrases.iter().any(|phrase| {
        text == *phrase
            || text.strip_suffix('!').map(str::trim_end) == Some(*phrase)
            || (short && contains_phrase(text, phrase))
    })
}

pub fn detect_confirmation_intent(text: &str) -> bool {
    matches_short_reply(text, CONFIRMATION_PHRASES)
}

pub fn detect_rejection_intent(text: &str) -> bool {
    matches_short_reply(text, REJECTION_PHRASES)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationAnswer {
    Confirmed,
    Rejected,
    Unclear,
}

/// Resolves a reply to a yes/no question; both or neither is `Unclear`.
pub fn classify_confirmation(text: &str) -> ConfirmationAnswer {
    match (detect_confirmation_intent(text), detect_rejection_intent(text)) {
        (true, false) => ConfirmationAnswer::Confirmed,
        (false, true) => ConfirmationAnswer::Rejected,
        _ => ConfirmationAnswer::Unclear,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phrase_needs_word_boundaries() {
        assert!(contains_phrase("vull parar aquí", "parar"));
        assert!(!contains_phrase("ho tinc preparat", "para"));
        assert!(!contains_phrase("escura", "cura"));
        assert!(contains_phrase("stop!", "stop"));
    }

    #[test]
    fn stems_only_need_a_leading_boundary() {
        assert!(contains_stem("vull tapar un tatuatge", "tapa"));
        assert!(contains_stem("tinc cicatrius", "cicatri"));
        assert!(!contains_stem("escura", "cura"));
        assert!(!contains_phrase("vull tapar un tatuatge", "tapa"));
    }

    #[test]
    fn uninterested_messages_exit() {
        assert!(detect_exit_intent("No m'interessa"));
        assert!(detect_exit_intent("no, gràcies"));
        assert!(!detect_exit_intent("ok gràcies!"));
        assert!(detect_exit_intent("not interested"));
        assert!(detect_exit_intent("Passo"));
        assert!(detect_exit_intent("STOP"));
        assert!(detect_exit_intent("no vull seguir amb això"));
    }

    #[test]
    fn wants_and_completion_phrases_win_over_exit() {
        assert!(!detect_exit_intent("nono, vull un tatuatge petit"));
        assert!(!detect_exit_intent("ja està, envia-ho"));
        assert!(!detect_exit_intent("volia parar a preguntar"));
        assert!(!detect_exit_intent("Tinc un disseny preparat"));
        assert!(!detect_exit_intent(""));
    }

    #[test]
    fn medical_keywords() {
        assert!(detect_medical_question("Tinc diabetis, puc tatuar-me?"));
        assert!(detect_medical_question("What about healing time?"));
        assert!(detect_medical_question("Tinc una AL·LÈRGIA al níquel"));
        assert!(detect_medical_question("Tinc cicatrius al braç"));
        assert!(detect_medical_question("Quants dolors fa?"));
        assert!(detect_medical_question("is it painful?"));
        assert!(!detect_medical_question("I like watercolor painting"));
        assert!(!detect_medical_question("Vull una rosa al braç"));
    }

    #[test]
    fn complex_by_keyword_or_collected_size() {
        let empty = LeadFields::default();
        assert!(detect_complex_request("Vull fer un cover d'un tatu antic", &empty));
        assert!(detect_complex_request("a full sleeve please", &empty));
        assert!(detect_complex_request("Vull tapar un tatuatge antic", &empty));
        assert!(!detect_complex_request("una rosa petita", &empty));

        let sleeve = LeadFields {
            placement_size: Some("Màniga".to_string()),
            ..LeadFields::default()
        };
        assert!(detect_complex_request("hola", &sleeve));
        let xl = LeadFields {
            placement_size: Some("XL".to_string()),
            ..LeadFields::default()
        };
        assert!(detect_complex_request("hola", &xl));
    }

    #[test]
    fn confirmation_and_rejection() {
        assert!(detect_confirmation_intent("Sí"));
        assert!(detect_confirmation_intent("ok!"));
        assert!(detect_confirmation_intent("Perfecte, endavant"));
        assert!(!detect_confirmation_intent(
            "ok però abans vull explicar-te una mica més el disseny que tinc pensat"
        ));
        assert!(detect_rejection_intent("no"));
        assert!(detect_rejection_intent("No cal, gràcies"));
        assert!(!detect_rejection_intent("nota"));
    }

    #[test]
    fn classify_is_unclear_when_both_or_neither() {
        assert_eq!(classify_confirmation("sí"), ConfirmationAnswer::Confirmed);
        assert_eq!(classify_confirmation("no, manté-ho"), ConfirmationAnswer::Rejected);
        assert_eq!(classify_confirmation("sí però no"), ConfirmationAnswer::Unclear);
        assert_eq!(classify_confirmation("quin horari teniu?"), ConfirmationAnswer::Unclear);
    }
}
