//! Accumulated lead fields: merge rules, completeness and change detection.

use serde::{Deserialize, Serialize};

use crate::intent::contains_stem;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placement: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placement_size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placement_concept: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timing_preference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

pub const FIELD_NAMES: &[&str] = &[
    "description",
    "placement",
    "placement_size",
    "placement_concept",
    "style",
    "color",
    "budget",
    "timing_preference",
    "name",
];

const GENERIC_VALUES: &[&str] = &[
    "no especificat",
    "no estic segur",
    "no estic segura",
    "no ho sé",
    "no sé",
    "not sure",
    "unknown",
    "n/a",
];

const SIGNIFICANT_FIELDS: &[&str] = &[
    "description",
    "placement",
    "placement_size",
    "placement_concept",
];

/// Stems: "petit" also covers "petita" and "petits".
const SIZE_WORDS: &[&str] = &["petit", "gran", "mitjà", "mitja", "sencer", "complet"];

pub fn is_generic_value(value: &str) -> bool {
    let value = value.trim().to_lowercase();
    GENERIC_VALUES.iter().any(|generic| value == *generic)
}

fn has_text(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.trim().is_empty())
}

impl LeadFields {
    fn slots(&self) -> [(&'static str, &Option<String>); 9] {
        [
            ("description", &self.description),
            ("placement", &self.placement),
            ("placement_size", &self.placement_size),
            ("placement_concept", &self.placement_concept),
            ("style", &self.style),
            ("color", &self.color),
            ("budget", &self.budget),
            ("timing_preference", &self.timing_preference),
            ("name", &self.name),
        ]
    }

    fn slots_mut(&mut self) -> [(&'static str, &mut Option<String>); 9] {
        [
            ("description", &mut self.description),
            ("placement", &mut self.placement),
            ("placement_size", &mut self.placement_size),
            ("placement_concept", &mut self.placement_concept),
            ("style", &mut self.style),
            ("color", &mut self.color),
            ("budget", &mut self.budget),
            ("timing_preference", &mut self.timing_preference),
            ("name", &mut self.name),
        ]
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.slots()
            .into_iter()
            .find(|(name, _)| *name == field)
            .and_then(|(_, value)| value.as_deref())
            .filter(|value| !value.trim().is_empty())
    }

    pub fn is_empty(&self) -> bool {
        self.slots().iter().all(|(_, value)| !has_text(value))
    }

    /// Merges `incoming` into `self` and returns the names of the fields that changed.
    ///
    /// Empty incoming values are ignored and generic placeholders only fill gaps,
    /// so a known answer is never replaced by "not sure".
    pub fn merge(&mut self, incoming: &LeadFields) -> Vec<&'static str> {
        let mut changed = Vec::new();
        for ((name, current), (_, next)) in self.slots_mut().into_iter().zip(incoming.slots()) {
            let Some(next) = next.as_deref().map(str::trim).filter(|v| !v.is_empty()) else {
                continue;
            };
            if is_generic_value(next) && has_text(current) {
                continue;
            }
            if current.as_deref() != Some(next) {
                *current = Some(next.to_string());
                changed.push(name);
            }
        }
        changed
    }

    pub fn merged(&self, incoming: &LeadFields) -> LeadFields {
        let mut next = self.clone();
        next.merge(incoming);
        next
    }

    pub fn has_placement(&self) -> bool {
        has_text(&self.placement)
            || has_text(&self.placement_size)
            || has_text(&self.placement_concept)
    }

    pub fn has_minimum_lead_info(&self) -> bool {
        has_text(&self.description) && self.has_placement()
    }

    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if !has_text(&self.description) {
            missing.push("description");
        }
        if !self.has_placement() {
            missing.push("placement");
        }
        missing
    }

    fn size_word(&self) -> Option<&'static str> {
        let placement = self.placement.as_deref().unwrap_or_default().to_lowercase();
        let size = self.placement_size.as_deref().unwrap_or_default().to_lowercase();
        SIZE_WORDS
            .iter()
            .copied()
            .find(|word| contains_stem(&placement, word) || contains_stem(&size, word))
    }

    /// Recap lines shown to the user before the lead goes to the studio.
    pub fn summary_lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        if let Some(style) = self.get("style") {
            lines.push(format!("Estil: {style}"));
        }
        if let Some(place) = self
            .get("placement_size")
            .or_else(|| self.get("placement"))
            .or_else(|| self.get("placement_concept"))
        {
            lines.push(format!("Ubicació: {place}"));
        }
        if let Some(color) = self.get("color") {
            lines.push(format!("Color: {color}"));
        }
        if let Some(budget) = self.get("budget") {
            lines.push(format!("Pressupost: {budget}"));
        }
        if let Some(timing) = self.get("timing_preference") {
            lines.push(format!("Timing: {timing}"));
        }
        if let Some(description) = self.get("description") {
            lines.push(format!("Idea: {description}"));
        }
        lines
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeReport {
    pub significant: bool,
    pub changes: Vec<String>,
}

pub fn detect_significant_change(old: &LeadFields, new: &LeadFields) -> ChangeReport {
    let mut report = ChangeReport::default();
    for field in SIGNIFICANT_FIELDS {
        if let (Some(before), Some(after)) = (old.get(field), new.get(field)) {
            if before != after {
                report.changes.push(format!("{field}: {before} → {after}"));
                report.significant = true;
            }
        }
    }

    if let (Some(before), Some(after)) = (old.size_word(), new.size_word()) {
        if before != after {
            report.significant = true;
            if !report.changes.iter().any(|c| c.contains("placement")) {
                report.changes.push(format!("mida: {before} → {after}"));
            }
        }
    }
    report
}

pub fn format_changes(changes: &[String]) -> String {
    changes.join(", ")
}
