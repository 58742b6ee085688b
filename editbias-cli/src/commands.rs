//! Subcommand handlers.

use anyhow::Context;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use editbias_core::config::{AdapterKind, BackendConfig, EvaluatorConfig};
use editbias_core::ensemble::review::{ReviewItem, SampleReason};
use editbias_core::error::AnalysisError;
use editbias_core::mock::{ScriptedBackend, ScriptedJudge};
use editbias_core::persistence::load_jsonl;
use editbias_core::run::{BASELINE_FAILURE_FILE, REVIEW_QUEUE_FILE};
use editbias_core::{
    AuditConfig, AuditError, AuditRun, BackendRegistry, JudgeRegistry, RunContext, RunSummary,
    StatisticalReport, load_config, synthesize_prompts,
};

use crate::{Cli, Commands, ConfigAction, default_log_dir, init_tracing};

pub async fn handle_command(cli: Cli, workspace: &Path) -> anyhow::Result<()> {
    let explicit = cli.config.as_deref();
    match cli.command {
        Commands::Run { run_id, dry_run } => {
            let mut config = load(workspace, explicit)?;
            if run_id.is_some() {
                config.run.run_id = run_id;
            }
            let run_id = config
                .run
                .run_id
                .get_or_insert_with(|| uuid::Uuid::new_v4().to_string())
                .clone();
            if config.run.output_dir.is_relative() {
                config.run.output_dir = workspace.join(&config.run.output_dir);
            }
            let log_dir = config.run.output_dir.join(&run_id).join("logs");
            let _guard = init_tracing(cli.verbose, cli.quiet, &log_dir);
            handle_run(config, dry_run, cli.quiet).await
        }
        Commands::Synthesize { output } => {
            let _guard = init_tracing(cli.verbose, cli.quiet, &default_log_dir());
            let config = load(workspace, explicit)?;
            handle_synthesize(&config, output.as_deref())
        }
        Commands::Analyze {
            run_dir,
            current_stats,
        } => {
            let _guard = init_tracing(cli.verbose, cli.quiet, &run_dir.join("logs"));
            let mut ctx = RunContext::open(&run_dir, CancellationToken::new())
                .with_context(|| format!("cannot open run directory {}", run_dir.display()))?;
            if current_stats {
                let config = load(workspace, explicit)?;
                ctx.config.stats = config.stats;
                ctx.config.review = config.review;
            }
            let report = finalize_or_explain(&ctx.run_dir, ctx.finalize())?;
            print_report(&report);
            Ok(())
        }
        Commands::Review { run_dir } => handle_review(&run_dir),
        Commands::Config { action } => handle_config(action, workspace, explicit),
    }
}

fn load(workspace: &Path, explicit: Option<&Path>) -> anyhow::Result<AuditConfig> {
    load_config(Some(workspace), explicit)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))
}

/// Swap every configured adapter for a scripted in-memory one.
fn dry_run_registries(config: &mut AuditConfig) -> (BackendRegistry, JudgeRegistry) {
    if config.run.backends.is_empty() {
        config.run.backends.push("mock".into());
    }
    for name in &config.run.backends {
        if !config.backends.iter().any(|b| &b.name == name) {
            config.backends.push(BackendConfig {
                name: name.clone(),
                kind: AdapterKind::External,
                endpoint: None,
                api_key_env: None,
                model: None,
                max_concurrency: None,
            });
        }
    }
    if config.ensemble.evaluators.is_empty() {
        for name in ["mock-judge-a", "mock-judge-b"] {
            config.ensemble.evaluators.push(EvaluatorConfig {
                name: name.into(),
                kind: AdapterKind::External,
                endpoint: None,
                api_key_env: None,
                model: None,
                max_concurrency: None,
            });
        }
    }
    config
        .backends
        .iter_mut()
        .for_each(|b| b.kind = AdapterKind::External);
    config
        .ensemble
        .evaluators
        .iter_mut()
        .for_each(|e| e.kind = AdapterKind::External);

    let mut backends = BackendRegistry::new();
    for name in &config.run.backends {
        backends.register(Arc::new(ScriptedBackend::new(name)));
    }
    let mut judges = JudgeRegistry::new();
    for evaluator in &config.ensemble.evaluators {
        judges.register(Arc::new(ScriptedJudge::new(&evaluator.name)));
    }
    (backends, judges)
}

async fn handle_run(mut config: AuditConfig, dry_run: bool, quiet: bool) -> anyhow::Result<()> {
    let (backends, judges) = if dry_run {
        warn!("Dry run: scripted backend and judges replace every configured adapter");
        dry_run_registries(&mut config)
    } else {
        (BackendRegistry::new(), JudgeRegistry::new())
    };

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received; stopping at the next record boundary");
            on_signal.cancel();
        }
    });

    let run = AuditRun::init_with(config, backends, judges, cancel)?;
    let run_id = run.context().run_id.clone();
    let run_dir = run.context().run_dir.clone();
    match run.execute().await {
        Ok((summary, report)) => {
            if !quiet {
                print_summary(&run_id, &summary);
                print_report(&report);
            }
            println!("Run directory: {}", run_dir.display());
            Ok(())
        }
        Err(AuditError::Cancelled) => {
            println!("Run {run_id} cancelled. Resume with: editbias run --run-id {run_id}");
            Ok(())
        }
        Err(e) => finalize_or_explain(&run_dir, Err(e)).map(|_| ()),
    }
}

fn finalize_or_explain(
    run_dir: &Path,
    result: editbias_core::Result<StatisticalReport>,
) -> anyhow::Result<StatisticalReport> {
    match result {
        Ok(report) => Ok(report),
        Err(AuditError::Analysis(AnalysisError::BaselineValidationFailed { diagnostic })) => {
            anyhow::bail!(
                "baseline validation failed: {diagnostic}\nDetails: {}",
                run_dir.join(BASELINE_FAILURE_FILE).display()
            )
        }
        Err(e) => Err(e.into()),
    }
}

fn handle_synthesize(config: &AuditConfig, output: Option<&Path>) -> anyhow::Result<()> {
    let outcome = synthesize_prompts(config)?;
    let mut lines = String::new();
    for prompt in &outcome.prompts {
        lines.push_str(&serde_json::to_string(prompt)?);
        lines.push('\n');
    }
    match output {
        Some(path) => std::fs::write(path, lines)
            .with_context(|| format!("cannot write {}", path.display()))?,
        None => print!("{lines}"),
    }

    eprintln!(
        "{} prompts from {} accepted bases, {} rejections",
        outcome.prompts.len(),
        outcome.accepted_bases(),
        outcome.rejections.len()
    );
    for (reason, count) in outcome.rejection_counts() {
        eprintln!("  {reason}: {count}");
    }
    Ok(())
}

fn handle_review(run_dir: &Path) -> anyhow::Result<()> {
    let path = run_dir.join(REVIEW_QUEUE_FILE);
    if !path.exists() {
        anyhow::bail!(
            "no review queue at {}; run `editbias analyze --run-dir {}` first",
            path.display(),
            run_dir.display()
        );
    }
    let (items, _) = load_jsonl::<ReviewItem>(&path)?;
    let flagged = items
        .iter()
        .filter(|i| i.sampled_because == SampleReason::Flagged)
        .count();
    for item in &items {
        let reason = match item.sampled_because {
            SampleReason::Flagged => "flagged",
            SampleReason::Baseline => "baseline",
        };
        println!("{reason:<9} {}  {}", item.key, item.review_reasons.join("; "));
    }
    println!(
        "\n{} items ({} flagged, {} baseline sample)",
        items.len(),
        flagged,
        items.len() - flagged
    );
    Ok(())
}

fn handle_config(
    action: ConfigAction,
    workspace: &Path,
    explicit: Option<&Path>,
) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_dir = workspace.join(".editbias");
            std::fs::create_dir_all(&config_dir)?;

            let config_path: PathBuf = config_dir.join("config.toml");
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }

            let toml_str = toml::to_string_pretty(&AuditConfig::default())?;
            std::fs::write(&config_path, &toml_str)?;
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
            Ok(())
        }
        ConfigAction::Show => {
            let config = load(workspace, explicit)?;
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn print_summary(run_id: &str, summary: &RunSummary) {
    println!("Run {run_id}");
    println!(
        "  Stage I:   {} prompts, {} rejections",
        summary.prompts, summary.rejections
    );
    println!(
        "  Stage II:  {} dispatched, {} resumed, {} errors, {} backend refusals",
        summary.dispatch.completed,
        summary.dispatch.skipped,
        summary.dispatch.errors,
        summary.dispatch.backend_refusals
    );
    println!(
        "  Stage III: {} evaluated, {} resumed",
        summary.evaluated, summary.evaluations_skipped
    );
}

fn print_report(report: &StatisticalReport) {
    println!(
        "\nRecords: {} ({} rated, {} synthetic excluded)",
        report.records, report.rated_records, report.excluded_synthetic
    );
    println!(
        "Baseline check: passed (neutral disparity {:.3}, threshold {:.3})",
        report.baseline.disparity, report.baseline.threshold
    );
    if let Some(note) = &report.baseline.note {
        println!("  note: {note}");
    }

    println!("\nDisparity (backend/category/axis):");
    for group in &report.disparity.groups {
        println!(
            "  {:<40} refusal delta {:.3}  erasure delta {:.3}  most refused: {}",
            group.group.to_string(),
            group.delta_refusal,
            group.delta_erasure,
            group.most_refused.as_deref().unwrap_or("-")
        );
    }

    let significant = report.pairwise.iter().filter(|p| p.significant).count();
    println!(
        "\nPairwise tests: {} comparisons, {} significant after correction",
        report.pairwise.len(),
        significant
    );
    println!(
        "Threshold sweep: {} grid points, max-disparity group {}",
        report.sweep.points.len(),
        if report.sweep.stable { "stable" } else { "changes" }
    );

    let errors = &report.errors;
    println!("\nRefusals by cause: {:?}", errors.refusals);
    println!(
        "Generation errors: {}  needs review: {}  single evaluator: {}",
        errors.generation_errors, errors.needs_review, errors.single_evaluator
    );
    if !errors.validation_rejections.is_empty() {
        println!("Validation rejections: {:?}", errors.validation_rejections);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dry_run_registers_scripted_adapters() {
        let mut config = AuditConfig::default();
        let (backends, judges) = dry_run_registries(&mut config);
        assert_eq!(config.run.backends, vec!["mock".to_string()]);
        assert!(backends.contains("mock"));
        assert_eq!(judges.names(), vec!["mock-judge-a", "mock-judge-b"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_dry_run_overrides_http_adapters() {
        let mut config = AuditConfig::default();
        config.backends.push(BackendConfig {
            name: "flux".into(),
            kind: AdapterKind::Http,
            endpoint: Some("http://localhost:9/edit".into()),
            api_key_env: None,
            model: None,
            max_concurrency: Some(1),
        });
        config.run.backends.push("flux".into());
        let (backends, _) = dry_run_registries(&mut config);
        assert!(backends.contains("flux"));
        assert_eq!(config.backends[0].kind, AdapterKind::External);
        assert_eq!(config.backend_concurrency("flux"), 1);
    }
}
