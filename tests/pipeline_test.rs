mod support;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bikeclf::artifacts::{self, read_jsonl, read_predictions};
use bikeclf::classifier::{BackendError, Classifier, IssueCategory, RelevanceLabel};
use bikeclf::config::resolve_model;
use bikeclf::prompts::{content_hash, LoadedPrompt};
use bikeclf::remote::{
    open_run_dir, Checkpoint, PipelineError, PipelineModel, PipelineOptions, RemotePipeline, Screening,
};
use bikeclf::runner::RunSettings;
use serde_json::{json, Value};
use support::{decision_json, event, init, FakeEventStore, RecordingSink, RuleBackend};
use tempfile::TempDir;

fn options<L: Screening>(batch_size: usize) -> PipelineOptions {
    PipelineOptions {
        batch_size,
        sleep: Duration::ZERO,
        ..PipelineOptions::for_task::<L>()
    }
}

fn model<L: Screening>(
    rule: fn(&str) -> Result<String, BackendError>,
) -> Result<PipelineModel<L>, Box<dyn std::error::Error>> {
    let content = "Klassifiziere die Meldung.".to_string();
    Ok(PipelineModel {
        classifier: Classifier::new(Arc::new(RuleBackend::new(rule))),
        prompt: LoadedPrompt {
            version: "v3".to_string(),
            hash: content_hash(&content),
            content,
        },
        settings: RunSettings {
            model: resolve_model("gemini-2.5-flash-lite")?,
            temperature: 0.0,
            max_output_tokens: 512,
        },
    })
}

fn relevance_rule(prompt: &str) -> Result<String, BackendError> {
    if prompt.contains("kaputt") {
        Err(BackendError::EmptyResponse)
    } else if prompt.contains("Radweg") {
        Ok(decision_json("label", "true", 0.9))
    } else {
        Ok(decision_json("label", "false", 0.7))
    }
}

fn category_rule(_prompt: &str) -> Result<String, BackendError> {
    Ok(decision_json("category", "Oberflächenqualität / Schäden", 0.8))
}

fn relevance_rows() -> Vec<bikeclf::remote::EventRow> {
    vec![
        event("0001", "Defekte Oberfläche", "Loch", Some("Schlagloch auf dem Radweg")),
        event("0002", "Graffiti", "Schmiererei", Some("Wand beschmiert")),
        event("0003", "Wilder Müll", "Sperrmüll", Some("Sofa am Straßenrand")),
        event("0004", "Straßenmarkierung", "Markierung", None),
        event("0005", "Defekte Oberfläche", "Loch", Some("Gehweg kaputt")),
    ]
}

#[tokio::test]
async fn test_relevance_pipeline_end_to_end() -> Result<(), Box<dyn std::error::Error>> {
    init();
    let temp = TempDir::new()?;
    let store = Arc::new(FakeEventStore::new(relevance_rows()));
    let tracer = Arc::new(RecordingSink::default());
    let (run_dir, checkpoint) = open_run_dir(temp.path(), None, "20250101_000000_v3_pipeline", false)?;

    let pipeline = RemotePipeline::new(
        store.clone(),
        Some(model::<RelevanceLabel>(relevance_rule)?),
        options::<RelevanceLabel>(2),
    )?
    .with_tracer(tracer.clone());
    let summary = pipeline.run(&run_dir, checkpoint).await?;

    let stats = &summary.checkpoint.stats;
    assert!(!summary.interrupted);
    assert!(summary.checkpoint.completed_at.is_some());
    assert_eq!(summary.checkpoint.last_id.as_deref(), Some("0005"));
    assert_eq!(stats.batches, 3);
    assert_eq!(stats.fetched, 5);
    assert_eq!(stats.prefiltered, 1);
    assert_eq!(stats.skipped, 1);
    assert_eq!(stats.classified, 2);
    assert_eq!(stats.errors, 1);
    assert_eq!(stats.updated, 2);
    assert_eq!(stats.write_failures, 0);
    assert_eq!(tracer.recorded(), 3);

    // excluded rows are only written when asked to
    assert_eq!(store.patched_ids(), ["0001", "0003"]);
    let first = store.patch_for("0001").ok_or("no patch for 0001")?;
    assert_eq!(first["bike_related"], json!(true));
    assert_eq!(first["bike_evidence"], json!(["Radweg"]));

    let predictions = read_predictions::<RelevanceLabel>(&run_dir)?;
    assert_eq!(predictions.len(), 2);
    assert!(predictions.iter().all(|p| p.gold.is_none()));
    let errors: Vec<Value> = read_jsonl(&run_dir.join(artifacts::ERRORS_FILE))?;
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0]["id"], "0005");

    let saved = Checkpoint::load(&run_dir.join(artifacts::CHECKPOINT_FILE))?;
    assert_eq!(saved.stats, summary.checkpoint.stats);
    Ok(())
}

#[tokio::test]
async fn test_resume_continues_after_last_id() -> Result<(), Box<dyn std::error::Error>> {
    init();
    let temp = TempDir::new()?;
    let store = Arc::new(FakeEventStore::new(relevance_rows()));

    let first_options = PipelineOptions {
        max_batches: Some(1),
        ..options::<RelevanceLabel>(2)
    };
    let (run_dir, checkpoint) = open_run_dir(temp.path(), Some("nightly"), "unused", false)?;
    let first = RemotePipeline::new(
        store.clone(),
        Some(model::<RelevanceLabel>(relevance_rule)?),
        first_options,
    )?
    .run(&run_dir, checkpoint)
    .await?;
    assert_eq!(first.checkpoint.last_id.as_deref(), Some("0002"));
    assert_eq!(first.checkpoint.stats.batches, 1);

    assert!(matches!(
        open_run_dir(temp.path(), Some("nightly"), "unused", false),
        Err(PipelineError::CheckpointExists(_))
    ));

    let (resumed_dir, checkpoint) = open_run_dir(temp.path(), Some("nightly"), "unused", true)?;
    assert_eq!(resumed_dir, run_dir);
    assert_eq!(checkpoint.last_id.as_deref(), Some("0002"));
    let second = RemotePipeline::new(
        store.clone(),
        Some(model::<RelevanceLabel>(relevance_rule)?),
        options::<RelevanceLabel>(2),
    )?
    .run(&resumed_dir, checkpoint)
    .await?;

    assert_eq!(second.checkpoint.stats.fetched, 5);
    assert_eq!(second.checkpoint.stats.classified, 2);
    let queries = store.queries.lock().unwrap();
    assert!(queries[1].contains(&("service_request_id".to_string(), "gt.0002".to_string())));
    // both runs appended to the same predictions file
    assert_eq!(read_predictions::<RelevanceLabel>(&run_dir)?.len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_write_failures_do_not_stop_the_batch() -> Result<(), Box<dyn std::error::Error>> {
    init();
    let temp = TempDir::new()?;
    let store = Arc::new(
        FakeEventStore::new(vec![
            event("0001", "Defekte Oberfläche", "Loch", Some("Radweg beschädigt")),
            event("0002", "Defekte Oberfläche", "Loch", Some("Radweg uneben")),
        ])
        .failing_patch("0001"),
    );
    let (run_dir, checkpoint) = open_run_dir(temp.path(), None, "write_failures", false)?;

    let summary = RemotePipeline::new(
        store.clone(),
        Some(model::<RelevanceLabel>(relevance_rule)?),
        options::<RelevanceLabel>(10),
    )?
    .run(&run_dir, checkpoint)
    .await?;

    assert_eq!(summary.checkpoint.stats.classified, 2);
    assert_eq!(summary.checkpoint.stats.write_failures, 1);
    assert_eq!(summary.checkpoint.stats.updated, 1);
    assert_eq!(store.patched_ids(), ["0002"]);
    Ok(())
}

#[tokio::test]
async fn test_dry_run_and_limit() -> Result<(), Box<dyn std::error::Error>> {
    init();
    let temp = TempDir::new()?;
    let store = Arc::new(FakeEventStore::new(relevance_rows()));
    let (run_dir, checkpoint) = open_run_dir(temp.path(), None, "dry", false)?;

    let dry = PipelineOptions {
        dry_run: true,
        limit: Some(3),
        write_prefiltered: true,
        ..options::<RelevanceLabel>(10)
    };
    let summary = RemotePipeline::new(store.clone(), Some(model::<RelevanceLabel>(relevance_rule)?), dry)?
        .run(&run_dir, checkpoint)
        .await?;

    assert!(store.patched_ids().is_empty());
    assert_eq!(summary.checkpoint.last_id.as_deref(), Some("0003"));
    assert_eq!(summary.checkpoint.stats.classified, 2);
    assert_eq!(summary.checkpoint.stats.prefiltered, 1);
    assert_eq!(summary.checkpoint.stats.updated, 0);
    // the first fetch is already capped by the limit
    assert!(store.queries.lock().unwrap()[0].contains(&("limit".to_string(), "3".to_string())));
    Ok(())
}

#[tokio::test]
async fn test_prefilter_only_writes_exclusions_without_model() -> Result<(), Box<dyn std::error::Error>> {
    init();
    let temp = TempDir::new()?;
    let store = Arc::new(FakeEventStore::new(relevance_rows()));
    let (run_dir, checkpoint) = open_run_dir(temp.path(), None, "prefilter", false)?;

    assert!(matches!(
        RemotePipeline::<RelevanceLabel>::new(store.clone(), None, options::<RelevanceLabel>(10)),
        Err(PipelineError::MissingModel)
    ));

    let prefilter_only = PipelineOptions {
        prefilter_only: true,
        ..options::<RelevanceLabel>(10)
    };
    let summary = RemotePipeline::<RelevanceLabel>::new(store.clone(), None, prefilter_only)?
        .run(&run_dir, checkpoint)
        .await?;

    assert_eq!(summary.checkpoint.stats.classified, 0);
    assert_eq!(summary.checkpoint.stats.prefiltered, 1);
    assert_eq!(store.patched_ids(), ["0002"]);
    let patch = store.patch_for("0002").ok_or("no patch for 0002")?;
    assert_eq!(patch["bike_related"], json!(false));
    assert_eq!(patch["bike_reasoning"], "prefilter: excluded_category: Graffiti");
    assert!(!run_dir.join(artifacts::PREDICTIONS_FILE).exists());
    Ok(())
}

#[tokio::test]
async fn test_category_pipeline_skips_empty_descriptions() -> Result<(), Box<dyn std::error::Error>> {
    init();
    let temp = TempDir::new()?;
    let mut pothole = event("0001", "Defekte Oberfläche", "Loch", Some("Schlagloch im Radweg"));
    pothole.category = Some("Straße".to_string());
    pothole.subcategory = Some("Defekte Oberfläche".to_string());
    let store = Arc::new(FakeEventStore::new(vec![
        pothole,
        event("0002", "Graffiti", "Schmiererei", Some("  ")),
    ]));
    let (run_dir, checkpoint) = open_run_dir(temp.path(), None, "category", false)?;

    let summary = RemotePipeline::new(
        store.clone(),
        Some(model::<IssueCategory>(category_rule)?),
        PipelineOptions {
            only_unclassified: true,
            ..options::<IssueCategory>(10)
        },
    )?
    .run(&run_dir, checkpoint)
    .await?;

    assert_eq!(summary.checkpoint.stats.classified, 1);
    assert_eq!(summary.checkpoint.stats.skipped, 1);
    let patch = store.patch_for("0001").ok_or("no patch for 0001")?;
    assert_eq!(patch["bike_issue_category"], "Oberflächenqualität / Schäden");

    let query = store.queries.lock().unwrap()[0].clone();
    assert!(query.contains(&("bike_related".to_string(), "eq.true".to_string())));
    assert!(query.contains(&("bike_issue_category".to_string(), "is.null".to_string())));

    let predictions = read_predictions::<IssueCategory>(&run_dir)?;
    assert_eq!(predictions[0].subject, "Straße - Defekte Oberfläche");
    Ok(())
}

#[tokio::test]
async fn test_cancel_flag_stops_before_fetching() -> Result<(), Box<dyn std::error::Error>> {
    init();
    let temp = TempDir::new()?;
    let store = Arc::new(FakeEventStore::new(relevance_rows()));
    let (run_dir, checkpoint) = open_run_dir(temp.path(), None, "cancelled", false)?;
    let cancel = Arc::new(AtomicBool::new(false));
    cancel.store(true, Ordering::SeqCst);

    let summary = RemotePipeline::new(
        store.clone(),
        Some(model::<RelevanceLabel>(relevance_rule)?),
        options::<RelevanceLabel>(10),
    )?
    .with_cancel_flag(cancel)
    .run(&run_dir, checkpoint)
    .await?;

    assert!(summary.interrupted);
    assert!(summary.checkpoint.completed_at.is_none());
    assert!(store.queries.lock().unwrap().is_empty());
    assert!(run_dir.join(artifacts::CHECKPOINT_FILE).exists());
    Ok(())
}

#[tokio::test]
async fn test_artifact_failure_keeps_progress_of_earlier_rows() -> Result<(), Box<dyn std::error::Error>> {
    init();
    let temp = TempDir::new()?;
    let store = Arc::new(FakeEventStore::new(vec![
        event("0001", "Graffiti", "Schmiererei", Some("Wand beschmiert")),
        event("0002", "Defekte Oberfläche", "Loch", Some("Radweg aufgerissen")),
    ]));
    let (run_dir, checkpoint) = open_run_dir(temp.path(), Some("broken"), "unused", false)?;
    // a directory where the predictions log should go makes every append fail
    std::fs::create_dir(run_dir.join(artifacts::PREDICTIONS_FILE))?;

    let result = RemotePipeline::new(
        store.clone(),
        Some(model::<RelevanceLabel>(relevance_rule)?),
        options::<RelevanceLabel>(10),
    )?
    .run(&run_dir, checkpoint)
    .await;
    assert!(matches!(result, Err(PipelineError::Artifact(_))));

    let saved = Checkpoint::load(&run_dir.join(artifacts::CHECKPOINT_FILE))?;
    assert_eq!(saved.last_id.as_deref(), Some("0001"));
    assert_eq!(saved.stats.prefiltered, 1);
    assert_eq!(saved.stats.classified, 0);
    assert!(saved.completed_at.is_none());
    assert!(store.patched_ids().is_empty());

    let (_, resumed) = open_run_dir(temp.path(), Some("broken"), "unused", true)?;
    assert_eq!(resumed.last_id.as_deref(), Some("0001"));
    Ok(())
}
