use std::fmt;
use std::hash::Hash;

/// A closed, ordered label vocabulary that a decision must draw from.
///
/// The two implementors are the bike relevance labels and the bike issue
/// categories. The constants carry the field names each task uses on the
/// wire, so records and datasets of both tasks go through the same code.
pub trait Label: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static {
    /// Every permitted value, in the official order used for metrics.
    const ALL: &'static [Self];
    /// Name of the enumeration field inside a decision object.
    const FIELD: &'static str;
    /// Key under which the gold value is stored in prediction/error records.
    const GOLD_KEY: &'static str;
    /// Column holding the gold value in evaluation datasets.
    const DATASET_GOLD_COLUMN: &'static str;
    /// Short task name used in logs, configs and CLI output.
    const TASK: &'static str;

    fn as_str(&self) -> &'static str;

    /// Exact, case-sensitive lookup.
    fn parse(value: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|label| label.as_str() == value)
    }

    fn vocabulary() -> Vec<&'static str> {
        Self::ALL.iter().map(|label| label.as_str()).collect()
    }

    /// Marker shown next to a value in markdown reports.
    fn marker(_value: &str) -> &'static str {
        "•"
    }
}

/// Bike relevance of a service report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelevanceLabel {
    True,
    False,
    Uncertain,
}

impl Label for RelevanceLabel {
    const ALL: &'static [Self] = &[Self::True, Self::False, Self::Uncertain];
    const FIELD: &'static str = "label";
    const GOLD_KEY: &'static str = "gold_label";
    const DATASET_GOLD_COLUMN: &'static str = "gold_label";
    const TASK: &'static str = "relevance";

    fn as_str(&self) -> &'static str {
        match self {
            Self::True => "true",
            Self::False => "false",
            Self::Uncertain => "uncertain",
        }
    }

    fn marker(value: &str) -> &'static str {
        match value {
            "true" => "✅",
            "false" => "❌",
            "uncertain" => "❓",
            _ => "•",
        }
    }
}

/// Category of a bike-related issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IssueCategory {
    SafetyComfort,
    DebrisSharpObjects,
    SurfaceDamage,
    WaterIceDrainage,
    ObstaclesBlockades,
    VegetationVisibility,
    MarkingsSignage,
    TrafficSignals,
    OtherUnclear,
}

impl Label for IssueCategory {
    const ALL: &'static [Self] = &[
        Self::SafetyComfort,
        Self::DebrisSharpObjects,
        Self::SurfaceDamage,
        Self::WaterIceDrainage,
        Self::ObstaclesBlockades,
        Self::VegetationVisibility,
        Self::MarkingsSignage,
        Self::TrafficSignals,
        Self::OtherUnclear,
    ];
    const FIELD: &'static str = "category";
    const GOLD_KEY: &'static str = "gold_category";
    const DATASET_GOLD_COLUMN: &'static str = "phase2_label";
    const TASK: &'static str = "category";

    fn as_str(&self) -> &'static str {
        match self {
            Self::SafetyComfort => "Sicherheit & Komfort (Geometrie/Führung)",
            Self::DebrisSharpObjects => "Müll / Scherben / Splitter (Sharp objects & debris)",
            Self::SurfaceDamage => "Oberflächenqualität / Schäden",
            Self::WaterIceDrainage => "Wasser / Eis / Entwässerung",
            Self::ObstaclesBlockades => "Hindernisse & Blockaden (inkl. Parken & Baustelle)",
            Self::VegetationVisibility => "Vegetation & Sichtbehinderung",
            Self::MarkingsSignage => "Markierungen & Beschilderung",
            Self::TrafficSignals => "Ampeln & Signale (inkl. bike-specific Licht)",
            Self::OtherUnclear => "Other / Unklar",
        }
    }
}

impl fmt::Display for RelevanceLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for IssueCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
