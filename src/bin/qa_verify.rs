use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use qa_verifier_lib::models::{ParagraphId, Role};
use qa_verifier_lib::services::{
    preview, read_document, write_qa_csv, write_rows_csv, AnalysisService, AnalyzerType,
    AppConfig, AppPaths, ConfigStore, Edit, LoadReport,
};
use serde::Serialize;

const DEFAULT_SETTLE_SECS: u64 = 30;

const USAGE: &str = "Usage:
  qa-verify <document.docx|.txt> [--set <n>=<role>]... [--merge <n>[,<n>]]... [--undo]...
            [--expected <n>]
            [--out <rows.csv>] [--qa-out <qa.csv>] [--report <json_path>]
            [--analyzer auto|rules|model] [--threshold <0..1>] [--wait-training <secs>]
  qa-verify --stats | --train [--wait-training <secs>] | --reset-training

Options:
  --set <n>=<role>   set paragraph n (1-based) to question|answer|ignore|unclassified
  --merge <n>[,<n>]  merge paragraphs into the preceding answer (one undoable edit)
  --expected <n>     override the expected question count
  --undo             undo the previous edit (edits apply in the order given)
  --data-dir <dir>   override the data directory (checkpoints, corrections, logs)
  --wait-training <secs>
                     how long to let background training finish before exiting
                     (default 30 when corrections were recorded); a cycle still
                     running at exit is cancelled and retried on a later run

Environment:
  QA_VERIFIER_DISABLE_FILE_LOG=1, QA_VERIFIER_LOG_DIR=<dir>, RUST_LOG=<filter>";

fn parse_arg_value(args: &[String], key: &str) -> Option<String> {
    args.iter()
        .position(|a| a == key)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

fn has_flag(args: &[String], key: &str) -> bool {
    args.iter().any(|a| a == key)
}

/// Operator edits in command-line order
enum Step {
    Set(usize, Role),
    Merge(Vec<usize>),
    Expected(usize),
    Undo,
}

fn parse_steps(args: &[String]) -> anyhow::Result<Vec<Step>> {
    let mut steps = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--set" => {
                let value = iter.next().ok_or_else(|| anyhow!("--set needs <n>=<role>"))?;
                let (n, role) = value
                    .split_once('=')
                    .ok_or_else(|| anyhow!("invalid --set value: {}", value))?;
                let n: usize = n.trim().parse().with_context(|| format!("invalid paragraph number: {}", n))?;
                let role: Role = role
                    .trim()
                    .parse()
                    .map_err(|e| anyhow!("invalid role in --set {}: {}", value, e))?;
                steps.push(Step::Set(n, role));
            }
            "--merge" => {
                let value = iter.next().ok_or_else(|| anyhow!("--merge needs <n>"))?;
                let numbers = value
                    .split(',')
                    .map(|n| n.trim().parse::<usize>())
                    .collect::<Result<Vec<_>, _>>()
                    .with_context(|| format!("invalid paragraph list: {}", value))?;
                steps.push(Step::Merge(numbers));
            }
            "--expected" => {
                let value = iter.next().ok_or_else(|| anyhow!("--expected needs <n>"))?;
                let count: usize = value.trim().parse().with_context(|| format!("invalid count: {}", value))?;
                steps.push(Step::Expected(count));
            }
            "--undo" => steps.push(Step::Undo),
            _ => {}
        }
    }
    Ok(steps)
}

fn parse_analyzer(value: &str) -> anyhow::Result<AnalyzerType> {
    match value.trim().to_lowercase().as_str() {
        "auto" => Ok(AnalyzerType::Auto),
        "rules" => Ok(AnalyzerType::Rules),
        "model" => Ok(AnalyzerType::Model),
        other => bail!("unknown analyzer: {}", other),
    }
}

fn load_config(args: &[String]) -> anyhow::Result<AppConfig> {
    let mut config = match ConfigStore::default_config_dir() {
        Some(dir) => ConfigStore::new(dir)
            .load()
            .map_err(|e| anyhow!(e))
            .context("failed to load config")?,
        None => AppConfig::default(),
    };

    if let Some(dir) = parse_arg_value(args, "--data-dir") {
        config.data_dir = Some(PathBuf::from(dir));
    }
    if let Some(analyzer) = parse_arg_value(args, "--analyzer") {
        config.analysis.analyzer_type = parse_analyzer(&analyzer)?;
    }
    if let Some(threshold) = parse_arg_value(args, "--threshold") {
        let threshold: f64 = threshold.parse().context("invalid --threshold")?;
        if !(0.0..=1.0).contains(&threshold) {
            bail!("--threshold must be within 0..1");
        }
        config.analysis.confidence_threshold = threshold;
    }
    Ok(config)
}

fn paragraph_id(service: &AnalysisService, n: usize) -> anyhow::Result<ParagraphId> {
    let doc = service.document().ok_or_else(|| anyhow!("no document loaded"))?;
    n.checked_sub(1)
        .and_then(|i| doc.paragraphs().get(i))
        .map(|p| p.id)
        .ok_or_else(|| anyhow!("paragraph {} does not exist ({} paragraphs)", n, doc.len()))
}

fn apply_steps(service: &mut AnalysisService, steps: &[Step]) -> anyhow::Result<()> {
    for step in steps {
        let result = match step {
            Step::Set(n, role) => {
                let id = paragraph_id(service, *n)?;
                service.issue(&Edit::SetRole { id, role: *role }).map(|_| ())
            }
            Step::Merge(numbers) => {
                let ids = numbers
                    .iter()
                    .map(|n| paragraph_id(service, *n))
                    .collect::<anyhow::Result<Vec<_>>>()?;
                let edit = match ids.as_slice() {
                    [id] => Edit::MergeIntoPreviousAnswer { id: *id },
                    _ => Edit::MergeBatch { ids },
                };
                service.issue(&edit).map(|_| ())
            }
            Step::Expected(count) => service
                .issue(&Edit::SetExpectedCount { count: *count })
                .map(|_| ()),
            Step::Undo => service.undo().map(|_| ()),
        };
        // Edit errors are operator mistakes: report and keep going
        if let Err(e) = result {
            eprintln!("Edit rejected: {}", e);
        }
    }
    Ok(())
}

fn print_document(service: &AnalysisService, report: &LoadReport) {
    println!("Document: {}", report.document);
    println!(
        "Classifier: {}{}",
        report.classifier,
        report
            .model_version
            .map(|v| format!(" (checkpoint v{})", v))
            .unwrap_or_default()
    );
    let Some(doc) = service.document() else {
        return;
    };
    println!(
        "Expected questions: {} (estimated {}, {} still to mark)",
        doc.expected_questions(),
        report.estimated_questions,
        doc.missing_questions()
    );
    println!();

    for p in doc.paragraphs() {
        let merged = if p.is_merged() { " (merged)" } else { "" };
        println!(
            "[P{:03}] {:<12} {:.2}{}  {}",
            p.index + 1,
            p.role.as_str(),
            p.confidence,
            merged,
            preview(&p.text, 100)
        );
    }

    let stats = doc.statistics();
    println!();
    println!(
        "Roles: question={} answer={} ignore={} unclassified={}",
        stats.question, stats.answer, stats.ignore, stats.unclassified
    );
}

fn print_stats(service: &AnalysisService) -> anyhow::Result<()> {
    let stats = service.correction_stats().context("failed to read correction log")?;
    let versions = service.checkpoint_versions().context("failed to list checkpoints")?;
    println!(
        "Corrections: {} (question={} answer={} ignore={} unclassified={})",
        stats.total(),
        stats.question,
        stats.answer,
        stats.ignore,
        stats.unclassified
    );
    println!("Checkpoints: {:?}", versions);
    if let Some(snapshot) = service.training_snapshot() {
        println!(
            "Training: {} (pending={}, latest={:?})",
            snapshot.status, snapshot.pending, snapshot.latest_version
        );
    }
    Ok(())
}

/// Let the worker handle the save before shutdown cancels it
fn settle_training(service: &AnalysisService, before_cycles: u64, secs: u64) {
    let Some(orchestrator) = service.orchestrator() else {
        return;
    };
    if !orchestrator.settle(Duration::from_secs(secs)) {
        println!("Training still running after {}s; it will resume on a later run", secs);
        return;
    }
    let s = orchestrator.snapshot();
    if s.cycles_completed > before_cycles {
        println!("Training finished: checkpoint v{}", s.latest_version.unwrap_or(0));
    } else if let Some(error) = s.last_error {
        println!("Training failed: {}", error);
    } else {
        println!("Training: {} ({} corrections pending)", s.status, s.pending);
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Output<'a> {
    report: &'a LoadReport,
    session_id: String,
    corrections: usize,
    rows: Vec<qa_verifier_lib::models::ExportRow>,
}

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 || has_flag(&args, "--help") {
        eprintln!("{}", USAGE);
        return Ok(());
    }

    let config = load_config(&args)?;
    let paths = AppPaths::resolve(&config).map_err(|e| anyhow!(e))?;
    paths.ensure_dirs().map_err(|e| anyhow!(e))?;
    qa_verifier_lib::init_logging(&paths.logs_dir());

    let include_header = config.export.include_header;
    let wait_secs: Option<u64> = parse_arg_value(&args, "--wait-training")
        .map(|s| s.parse().context("invalid --wait-training"))
        .transpose()?;

    let mut service = AnalysisService::new(config, &paths).context("failed to start analysis service")?;

    if has_flag(&args, "--reset-training") {
        service.reset_training().context("failed to reset training data")?;
        println!("Training data reset");
        return Ok(());
    }
    if has_flag(&args, "--stats") {
        return print_stats(&service);
    }
    if has_flag(&args, "--train") {
        let before = service.training_snapshot().map_or(0, |s| s.cycles_completed);
        if !service.train_now() {
            bail!("training is disabled in the configuration");
        }
        settle_training(&service, before, wait_secs.unwrap_or(DEFAULT_SETTLE_SECS));
        service.shutdown();
        return Ok(());
    }

    let input = Path::new(&args[1]);
    if input.to_string_lossy().starts_with("--") {
        bail!("missing input document\n\n{}", USAGE);
    }
    let source = read_document(input).with_context(|| format!("failed to read {}", input.display()))?;

    let report = service
        .load(&source.name, &source.paragraphs)
        .context("failed to analyze document")?;
    apply_steps(&mut service, &parse_steps(&args)?)?;
    print_document(&service, &report);

    let before = service.training_snapshot().map_or(0, |s| s.cycles_completed);
    let corrections = service.record_save().context("failed to record corrections")?;
    println!("Corrections recorded: {}", corrections.len());

    if let Some(out) = parse_arg_value(&args, "--out") {
        let rows = service.export_rows()?;
        write_rows_csv(Path::new(&out), &rows, include_header)
            .with_context(|| format!("failed to write {}", out))?;
        println!("Wrote {} rows: {}", rows.len(), out);
    }
    if let Some(out) = parse_arg_value(&args, "--qa-out") {
        let pairs = service.qa_pairs()?;
        write_qa_csv(Path::new(&out), &pairs).with_context(|| format!("failed to write {}", out))?;
        println!("Wrote {} questions: {}", pairs.len(), out);
    }
    if let Some(out) = parse_arg_value(&args, "--report") {
        let output = Output {
            report: &report,
            session_id: service.session_id().to_string(),
            corrections: corrections.len(),
            rows: service.export_rows()?,
        };
        let json = serde_json::to_string_pretty(&output)?;
        std::fs::write(&out, json).with_context(|| format!("failed to write {}", out))?;
        println!("Wrote JSON: {}", out);
    }

    if !corrections.is_empty() {
        settle_training(&service, before, wait_secs.unwrap_or(DEFAULT_SETTLE_SECS));
    }
    service.shutdown();
    Ok(())
}
