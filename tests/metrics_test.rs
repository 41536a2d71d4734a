use bikeclf::classifier::{IssueCategory, Label, RelevanceLabel};
use bikeclf::metrics::{compute_metrics, MetricsError};

fn assert_macro_consistent(metrics: &bikeclf::Metrics) {
    let mean = metrics.per_class.iter().map(|(_, s)| s.f1).sum::<f64>() / metrics.per_class.len() as f64;
    assert!((metrics.macro_f1 - mean).abs() < 1e-6);
}

#[test]
fn test_perfect_predictions() -> Result<(), Box<dyn std::error::Error>> {
    let gold = ["true", "false", "uncertain"];
    let metrics = compute_metrics(&gold, &gold, &RelevanceLabel::vocabulary())?;

    assert_eq!(metrics.accuracy, 1.0);
    assert_eq!(metrics.macro_f1, 1.0);
    for (_, scores) in metrics.per_class.iter() {
        assert_eq!(scores.support, 1);
    }
    Ok(())
}

#[test]
fn test_all_miss_is_degenerate() -> Result<(), Box<dyn std::error::Error>> {
    let gold = ["true", "true", "true"];
    let pred = ["false", "false", "false"];
    let metrics = compute_metrics(&gold, &pred, &RelevanceLabel::vocabulary())?;

    assert_eq!(metrics.accuracy, 0.0);
    assert!(metrics.macro_f1 <= 0.1);
    let false_scores = metrics.per_class.get("false").ok_or("missing class")?;
    assert_eq!(false_scores.support, 0);
    assert_eq!(false_scores.precision, 0.0);
    assert!(!false_scores.f1.is_nan());
    assert_eq!(metrics.confusion_matrix.count("true", "false"), Some(3));
    Ok(())
}

#[test]
fn test_accuracy_is_exact_match_rate() -> Result<(), Box<dyn std::error::Error>> {
    let gold = ["true", "false", "false", "uncertain", "true", "false", "true"];
    let pred = ["true", "true", "false", "false", "true", "uncertain", "false"];
    let metrics = compute_metrics(&gold, &pred, &RelevanceLabel::vocabulary())?;

    let expected = gold.iter().zip(pred.iter()).filter(|(g, p)| g == p).count() as f64 / gold.len() as f64;
    assert!((metrics.accuracy - expected).abs() < 1e-12);
    assert_macro_consistent(&metrics);
    Ok(())
}

#[test]
fn test_full_category_vocabulary_is_always_reported() -> Result<(), Box<dyn std::error::Error>> {
    let surface = IssueCategory::SurfaceDamage.as_str();
    let signals = IssueCategory::TrafficSignals.as_str();
    let gold = [surface, surface, signals];
    let pred = [surface, signals, signals];
    let metrics = compute_metrics(&gold, &pred, &IssueCategory::vocabulary())?;

    assert_eq!(metrics.per_class.len(), IssueCategory::ALL.len());
    assert_eq!(metrics.confusion_matrix.matrix.len(), IssueCategory::ALL.len());
    for row in &metrics.confusion_matrix.matrix {
        assert_eq!(row.len(), IssueCategory::ALL.len());
    }
    // seven classes never occur, so they pull macro-F1 well below accuracy
    assert!(metrics.macro_f1 < metrics.accuracy);
    assert_macro_consistent(&metrics);
    Ok(())
}

#[test]
fn test_unknown_values_count_only_toward_accuracy() -> Result<(), Box<dyn std::error::Error>> {
    let gold = ["true", "maybe"];
    let pred = ["true", "maybe"];
    let metrics = compute_metrics(&gold, &pred, &RelevanceLabel::vocabulary())?;

    assert_eq!(metrics.accuracy, 1.0);
    let total: u64 = metrics.confusion_matrix.matrix.iter().flatten().sum();
    assert_eq!(total, 1);
    Ok(())
}

#[test]
fn test_length_mismatch_names_both_lengths() {
    let err = compute_metrics(&["true", "false"], &["true"], &RelevanceLabel::vocabulary()).unwrap_err();
    assert!(matches!(err, MetricsError::LengthMismatch { gold: 2, pred: 1 }));
    assert!(err.to_string().contains("gold=2"));
    assert!(err.to_string().contains("pred=1"));
}

#[test]
fn test_metrics_json_shape() -> Result<(), Box<dyn std::error::Error>> {
    let gold = ["true", "false"];
    let metrics = compute_metrics(&gold, &gold, &RelevanceLabel::vocabulary())?;
    let value = serde_json::to_value(&metrics)?;

    assert_eq!(value["per_class"]["uncertain"]["support"], 0);
    assert_eq!(value["confusion_matrix"]["labels"][0], "true");
    let back: bikeclf::Metrics = serde_json::from_value(value)?;
    assert_eq!(back, metrics);
    Ok(())
}
