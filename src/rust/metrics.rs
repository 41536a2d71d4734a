//! Classification quality statistics over a fixed vocabulary.
//!
//! The vocabulary is always supplied by the caller and is never inferred
//! from the data: a class that never occurs still gets a row in every table,
//! with zero support and zero scores.

use std::fmt;

use serde::de::{Deserializer, MapAccess, Visitor};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("Label lists must have same length. Got gold={gold}, pred={pred}")]
    LengthMismatch { gold: usize, pred: usize },
}

/// Precision, recall, F1 and support for one vocabulary entry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassScores {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub support: u64,
}

/// Per-class scores in vocabulary order; serialised as a JSON object.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PerClass(pub Vec<(String, ClassScores)>);

impl PerClass {
    pub fn get(&self, label: &str) -> Option<&ClassScores> {
        self.0.iter().find(|(name, _)| name == label).map(|(_, scores)| scores)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ClassScores)> {
        self.0.iter().map(|(name, scores)| (name.as_str(), scores))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Rows are gold classes, columns predicted classes, both in `labels` order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    pub labels: Vec<String>,
    pub matrix: Vec<Vec<u64>>,
}

impl ConfusionMatrix {
    pub fn count(&self, gold: &str, pred: &str) -> Option<u64> {
        let row = self.labels.iter().position(|label| label == gold)?;
        let col = self.labels.iter().position(|label| label == pred)?;
        Some(self.matrix[row][col])
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub accuracy: f64,
    pub macro_f1: f64,
    pub per_class: PerClass,
    pub confusion_matrix: ConfusionMatrix,
}

/// Computes accuracy, macro-F1, per-class scores and the confusion matrix.
///
/// Accuracy is exact string equality over all positions. Gold or predicted
/// values outside `vocabulary` still count toward accuracy but fall outside
/// the per-class tables and the matrix. Zero denominators yield 0.0.
pub fn compute_metrics<G, P, V>(gold: &[G], pred: &[P], vocabulary: &[V]) -> Result<Metrics, MetricsError>
where
    G: AsRef<str>,
    P: AsRef<str>,
    V: AsRef<str>,
{
    if gold.len() != pred.len() {
        return Err(MetricsError::LengthMismatch {
            gold: gold.len(),
            pred: pred.len(),
        });
    }

    let labels: Vec<String> = vocabulary.iter().map(|v| v.as_ref().to_string()).collect();
    let index_of = |value: &str| labels.iter().position(|label| label == value);

    let size = labels.len();
    let mut matrix = vec![vec![0u64; size]; size];
    let mut true_positive = vec![0u64; size];
    let mut predicted = vec![0u64; size];
    let mut support = vec![0u64; size];
    let mut correct = 0u64;

    for (g, p) in gold.iter().zip(pred.iter()) {
        let (g, p) = (g.as_ref(), p.as_ref());
        if g == p {
            correct += 1;
        }
        let gold_index = index_of(g);
        let pred_index = index_of(p);
        if let Some(i) = gold_index {
            support[i] += 1;
        }
        if let Some(j) = pred_index {
            predicted[j] += 1;
        }
        if let (Some(i), Some(j)) = (gold_index, pred_index) {
            matrix[i][j] += 1;
            if i == j {
                true_positive[i] += 1;
            }
        }
    }

    let per_class: Vec<(String, ClassScores)> = labels
        .iter()
        .enumerate()
        .map(|(i, label)| {
            let precision = ratio(true_positive[i], predicted[i]);
            let recall = ratio(true_positive[i], support[i]);
            let false_positive = predicted[i] - true_positive[i];
            let false_negative = support[i] - true_positive[i];
            let f1 = ratio(2 * true_positive[i], 2 * true_positive[i] + false_positive + false_negative);
            (
                label.clone(),
                ClassScores {
                    precision,
                    recall,
                    f1,
                    support: support[i],
                },
            )
        })
        .collect();

    let macro_f1 = if per_class.is_empty() {
        0.0
    } else {
        per_class.iter().map(|(_, scores)| scores.f1).sum::<f64>() / per_class.len() as f64
    };

    Ok(Metrics {
        accuracy: ratio(correct, gold.len() as u64),
        macro_f1,
        per_class: PerClass(per_class),
        confusion_matrix: ConfusionMatrix { labels, matrix },
    })
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

impl Serialize for PerClass {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (label, scores) in &self.0 {
            map.serialize_entry(label, scores)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for PerClass {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct PerClassVisitor;

        impl<'de> Visitor<'de> for PerClassVisitor {
            type Value = PerClass;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of class name to scores")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<PerClass, A::Error> {
                let mut entries = Vec::new();
                while let Some((label, scores)) = access.next_entry::<String, ClassScores>()? {
                    entries.push((label, scores));
                }
                Ok(PerClass(entries))
            }
        }

        deserializer.deserialize_map(PerClassVisitor)
    }
}
