//! Service-category rules deciding which reports are worth a model call.

use std::fmt;

/// Service categories that are never about cycling infrastructure.
pub const DEFINITELY_EXCLUDE: &[&str] = &[
    "Altkleidercontainer voll",
    "Altkleidercontainer defekt",
    "Altkleidercontainer-Standort vermüllt",
    "Glascontainer voll",
    "Glascontainer defekt",
    "Glascontainer-Standort vermüllt",
    "Leuchtmittel defekt",
    "Leuchtmittel tagsüber in Betrieb",
    "Lichtmast defekt",
    "Parkscheinautomat defekt",
    "Brunnen",
    "Kölner Grün",
    "Spiel- und Bolzplätze",
    "Graffiti",
    "Schrottfahrräder",
    "Schrott-Kfz",
];

pub const HIGH_POTENTIAL: &[&str] = &[
    "Defekte Oberfläche",
    "Straßenmarkierung",
    "Defekte Verkehrszeichen",
    "Radfahrerampel defekt",
    "Umlaufsperren / Drängelgitter",
    "Straßenbaustellen",
];

pub const MEDIUM_POTENTIAL: &[&str] = &[
    "Wilder Müll",
    "Gully verstopft",
    "Fußgängerampel defekt",
    "Kfz-Ampel defekt",
    "Zu lange Rotzeit",
    "Zu kurze Grünzeit",
    "Schutzzeit zu kurz",
    "Keine grüne Welle",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrefilterDecision {
    Check(CheckReason),
    Skip(SkipReason),
}

impl PrefilterDecision {
    pub fn should_check(&self) -> bool {
        matches!(self, PrefilterDecision::Check(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckReason {
    HighPotential,
    MediumPotential,
    UnknownCategory,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    NoDescription,
    ExcludedCategory(String),
}

impl fmt::Display for CheckReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CheckReason::HighPotential => "high_potential",
            CheckReason::MediumPotential => "medium_potential",
            CheckReason::UnknownCategory => "unknown_category",
        })
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::NoDescription => f.write_str("no_description"),
            SkipReason::ExcludedCategory(name) => write!(f, "excluded_category: {}", name),
        }
    }
}

/// Rows without a description cannot be classified; excluded service
/// categories are skipped; everything else, known or not, goes to the model.
pub fn should_check_with_llm(service_name: &str, description: Option<&str>) -> PrefilterDecision {
    if description.map_or(true, |text| text.trim().is_empty()) {
        return PrefilterDecision::Skip(SkipReason::NoDescription);
    }
    if DEFINITELY_EXCLUDE.contains(&service_name) {
        return PrefilterDecision::Skip(SkipReason::ExcludedCategory(service_name.to_string()));
    }
    if HIGH_POTENTIAL.contains(&service_name) {
        return PrefilterDecision::Check(CheckReason::HighPotential);
    }
    if MEDIUM_POTENTIAL.contains(&service_name) {
        return PrefilterDecision::Check(CheckReason::MediumPotential);
    }
    PrefilterDecision::Check(CheckReason::UnknownCategory)
}
