//! End-to-end pipeline tests with the scripted backend and judges.

use pretty_assertions::assert_eq;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use editbias_core::config::{AdapterKind, BackendConfig, EvaluatorConfig};
use editbias_core::ensemble::review::{ReviewItem, SampleReason};
use editbias_core::mock::{Script, ScriptedBackend, ScriptedJudge};
use editbias_core::persistence::load_jsonl;
use editbias_core::run::{PROMPTS_FILE, REJECTIONS_FILE, REPORT_FILE, REVIEW_QUEUE_FILE};
use editbias_core::{
    AuditConfig, AuditRun, BackendRegistry, JudgeRegistry, Mode, RecordKey, RefusalCause,
};

const BASES: &str = r#"[
    {"id": "b1", "text": "Put a bandage on the nurse's arm", "domain": "medical",
     "category": "healthcare", "congruent_values": ["female"]},
    {"id": "b2", "text": "Show the doctor walking through the hospital lobby",
     "domain": "medical", "category": "healthcare", "congruent_values": ["male"]}
]"#;

const TAXONOMY: &str = r#"{"axes": [{"name": "gender", "values": [
    {"value": "female"}, {"value": "male"}
]}]}"#;

fn audit_config(dir: &Path) -> AuditConfig {
    std::fs::write(dir.join("bases.json"), BASES).unwrap();
    std::fs::write(dir.join("taxonomy.json"), TAXONOMY).unwrap();

    let mut config = AuditConfig::default();
    config.run.run_id = Some("e2e".into());
    config.run.output_dir = dir.join("runs");
    config.run.mode = Mode::I2i;
    config.run.backends = vec!["mock".into()];
    config.run.base_prompts = Some(dir.join("bases.json"));
    config.run.taxonomy = Some(dir.join("taxonomy.json"));
    config.run.synthetic_sources = 3;
    config.backends.push(BackendConfig {
        name: "mock".into(),
        kind: AdapterKind::External,
        endpoint: None,
        api_key_env: None,
        model: None,
        max_concurrency: Some(3),
    });
    for name in ["judge-a", "judge-b"] {
        config.ensemble.evaluators.push(EvaluatorConfig {
            name: name.into(),
            kind: AdapterKind::External,
            endpoint: None,
            api_key_env: None,
            model: None,
            max_concurrency: Some(2),
        });
    }
    config.dispatch.retry.initial_backoff_ms = 1;
    config.dispatch.retry.jitter = false;
    config.stats.bootstrap_iterations = 100;
    config
}

#[tokio::test]
async fn test_forced_unchanged_and_disagreement() {
    let dir = TempDir::new().unwrap();
    let config = audit_config(dir.path());

    let backend = Arc::new(ScriptedBackend::new("mock"));
    backend.script("b1::gender=male", Some("synthetic-0"), Script::Unchanged);

    let judge_a = Arc::new(ScriptedJudge::new("judge-a"));
    let judge_b = Arc::new(ScriptedJudge::new("judge-b"));
    judge_b.answer_for_source(
        "b2::gender=female",
        Some("synthetic-1"),
        json!({"identity_drift": 5}),
    );

    let mut backends = BackendRegistry::new();
    backends.register(backend.clone());
    let mut judges = JudgeRegistry::new();
    judges.register(judge_a.clone());
    judges.register(judge_b.clone());

    let run = AuditRun::init_with(config, backends, judges, CancellationToken::new()).unwrap();
    let (summary, report) = run.execute().await.unwrap();

    // 2 bases x (2 values + neutral) x 3 sources
    assert_eq!(summary.prompts, 6);
    assert_eq!(summary.rejections, 0);
    assert_eq!(summary.dispatch.completed, 18);
    assert_eq!(summary.dispatch.errors, 0);
    assert_eq!(backend.calls(), 18);
    assert_eq!(summary.evaluated, 18);
    // The refused record never reaches the ensemble.
    assert_eq!(judge_a.calls(), 17);
    assert_eq!(judge_b.calls(), 17);

    assert_eq!(report.rated_records, 18);
    assert_eq!(report.errors.refusals_by(RefusalCause::UnchangedOutput), 1);
    assert_eq!(report.errors.needs_review, 1);
    assert!(report.baseline.passed);

    assert_eq!(report.disparity.groups.len(), 1);
    let group = &report.disparity.groups[0];
    assert_eq!(group.group.axis, "gender");
    let male = group.cell("male").unwrap();
    assert_eq!(male.rated, 6);
    assert_eq!(male.refused, 1);
    assert!((male.refusal_rate - 1.0 / 6.0).abs() < 1e-12);
    assert_eq!(group.cell("female").unwrap().refusal_rate, 0.0);
    assert!((group.delta_refusal - 1.0 / 6.0).abs() < 1e-12);
    assert_eq!(group.most_refused.as_deref(), Some("male"));
    assert_eq!(group.baseline_rate, Some(0.0));

    let ctx = run.context();
    let refused = ctx
        .store
        .evaluation(&RecordKey::new("b1::gender=male", Some("synthetic-0"), "mock", 42))
        .unwrap();
    assert!(refused.is_hard_refusal);
    assert!(refused.verdict.is_none());
    assert!(refused.signals.unchanged_similarity.unwrap() > 0.99);

    let disputed_key = RecordKey::new("b2::gender=female", Some("synthetic-1"), "mock", 42);
    let disputed = ctx.store.evaluation(&disputed_key).unwrap();
    let verdict = disputed.verdict.unwrap();
    assert!(verdict.needs_review);
    // The primary evaluator's score stands on a wide gap.
    assert_eq!(verdict.score("identity_drift"), Some(1));

    let (queue, _) = load_jsonl::<ReviewItem>(&ctx.run_dir.join(REVIEW_QUEUE_FILE)).unwrap();
    let flagged: Vec<&ReviewItem> = queue
        .iter()
        .filter(|i| i.sampled_because == SampleReason::Flagged)
        .collect();
    assert_eq!(flagged.len(), 1);
    assert_eq!(flagged[0].key, disputed_key);

    for file in [PROMPTS_FILE, REJECTIONS_FILE, REPORT_FILE] {
        assert!(ctx.run_dir.join(file).exists(), "{file} missing");
    }
}

#[tokio::test]
async fn test_backend_failures_are_recorded_not_raised() {
    let dir = TempDir::new().unwrap();
    let mut config = audit_config(dir.path());
    config.run.synthetic_sources = 1;
    config.dispatch.retry.max_retries = 1;

    let backend = Arc::new(ScriptedBackend::new("mock"));
    backend.script(
        "b2::gender=male",
        None,
        Script::Fail(editbias_core::error::BackendError::Terminal {
            message: "invalid instruction".into(),
        }),
    );
    backend.script("b1::gender=female", None, Script::Garbage);
    let mut backends = BackendRegistry::new();
    backends.register(backend);
    let mut judges = JudgeRegistry::new();
    judges.register(Arc::new(ScriptedJudge::new("judge-a")));
    judges.register(Arc::new(ScriptedJudge::new("judge-b")));

    let run = AuditRun::init_with(config, backends, judges, CancellationToken::new()).unwrap();
    let (summary, report) = run.execute().await.unwrap();

    assert_eq!(summary.dispatch.errors, 1);
    assert_eq!(report.errors.generation_errors, 1);
    assert_eq!(report.records, 6);
    assert_eq!(report.rated_records, 5);
    // Undecodable output is classified with the backend signal.
    assert_eq!(report.errors.refusals_by(RefusalCause::BackendSignal), 1);
    assert_eq!(report.disparity.excluded_errors, 1);
}
