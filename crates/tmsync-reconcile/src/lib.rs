//! Reconciliation engine and run pipeline.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tmsync_adapters::{flatten_export, MilestoneQueryFlattener, TaskDetailFlattener};
use tmsync_core::{MappingEntry, MilestoneRecord, ReconciliationCandidate, SystemId, TaskRecord};
use tmsync_storage::{
    load_mapping_file, load_system_a_snapshot, load_system_b_snapshot, InvalidEntity, RunStore,
    StoredFile,
};
use tokio::fs;
use tracing::{info, warn};
use uuid::Uuid;

pub mod batch;
pub mod classify;
pub mod diagnostics;
pub mod matcher;

#[cfg(test)]
pub(crate) mod testing;

pub use batch::{build_batches, IdempotenceFilter, PendingWrites, UpdateBatches, WriteBatch};
pub use classify::{
    check_write_necessity, classify_candidate, select_write_target, Classification, ClassifierRules,
    ReconcileError, TargetDecision, TargetSelection, WriteNecessity,
};
pub use diagnostics::{CollectingSink, Diagnostic, DiagnosticsSink, SuppressReason, TeeSink, TracingSink};
pub use matcher::{match_milestone, match_task, SnapshotIndex};

pub const CRATE_NAME: &str = "tmsync-reconcile";

const SYSTEM_A_BATCHES_FILE: &str = "system_a_batches.json";
const SYSTEM_B_BATCHES_FILE: &str = "system_b_batches.json";
const DIAGNOSTICS_FILE: &str = "diagnostics.json";
const REPORT_FILE: &str = "reconcile_report.md";
const SUMMARY_FILE: &str = "run_summary.json";
const MANIFEST_FILE: &str = "manifest.json";

/// Shape of the snapshot files handed to the pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotFormat {
    /// Already-flattened `{"tasks": [...]}` / `{"milestones": [...]}` files.
    #[default]
    Flattened,
    /// Raw per-system exports, flattened on load.
    Raw,
}

impl FromStr for SnapshotFormat {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "flattened" => Ok(Self::Flattened),
            "raw" => Ok(Self::Raw),
            other => anyhow::bail!("unknown snapshot format {other:?} (expected flattened|raw)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    pub workspace_root: PathBuf,
    pub mappings_path: PathBuf,
    pub system_a_snapshot: PathBuf,
    pub system_b_snapshot: PathBuf,
    pub system_a_refresh: Option<PathBuf>,
    pub system_b_refresh: Option<PathBuf>,
    pub rules_path: PathBuf,
    pub output_dir: PathBuf,
    pub parallel: bool,
    pub snapshot_format: SnapshotFormat,
}

impl ReconcileConfig {
    pub fn for_workspace(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let snapshots = root.join("snapshots");
        Self {
            mappings_path: snapshots.join("mappings.json"),
            system_a_snapshot: snapshots.join("system_a.json"),
            system_b_snapshot: snapshots.join("system_b.json"),
            system_a_refresh: None,
            system_b_refresh: None,
            rules_path: root.join("rules.yaml"),
            output_dir: root.join("runs"),
            parallel: false,
            snapshot_format: SnapshotFormat::default(),
            workspace_root: root,
        }
    }

    pub fn from_env() -> Self {
        let root = std::env::var("TMSYNC_WORKSPACE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        Self::from_env_in(root)
    }

    /// Workspace defaults under `root`, then per-path environment overrides.
    pub fn from_env_in(root: impl Into<PathBuf>) -> Self {
        let mut config = Self::for_workspace(root);
        let path_var = |name: &str| std::env::var(name).ok().map(PathBuf::from);

        if let Some(path) = path_var("TMSYNC_MAPPINGS") {
            config.mappings_path = path;
        }
        if let Some(path) = path_var("TMSYNC_SYSTEM_A_SNAPSHOT") {
            config.system_a_snapshot = path;
        }
        if let Some(path) = path_var("TMSYNC_SYSTEM_B_SNAPSHOT") {
            config.system_b_snapshot = path;
        }
        config.system_a_refresh = path_var("TMSYNC_SYSTEM_A_REFRESH");
        config.system_b_refresh = path_var("TMSYNC_SYSTEM_B_REFRESH");
        if let Some(path) = path_var("TMSYNC_RULES") {
            config.rules_path = path;
        }
        if let Some(path) = path_var("TMSYNC_OUTPUT_DIR") {
            config.output_dir = path;
        }
        config.parallel = std::env::var("TMSYNC_PARALLEL")
            .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
            .unwrap_or(false);
        config.snapshot_format = std::env::var("TMSYNC_SNAPSHOT_FORMAT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or_default();
        config
    }
}

/// Pure classification over captured snapshots. Never performs I/O.
#[derive(Debug, Clone, Default)]
pub struct ReconcileEngine {
    rules: ClassifierRules,
    parallel: bool,
}

impl ReconcileEngine {
    pub fn new(rules: ClassifierRules) -> Self {
        Self {
            rules,
            parallel: false,
        }
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn rules(&self) -> &ClassifierRules {
        &self.rules
    }

    fn classify_mapping(
        &self,
        index: &SnapshotIndex<'_>,
        mapping_index: usize,
        mapping: &MappingEntry,
    ) -> Result<Classification, ReconcileError> {
        let pair = index.match_mapping(mapping);
        let Some((task, milestone)) = pair.both() else {
            let missing = [
                pair.task.is_none().then_some(SystemId::SystemA),
                pair.milestone.is_none().then_some(SystemId::SystemB),
            ]
            .into_iter()
            .flatten()
            .collect();
            return Ok(Classification {
                write: None,
                diagnostics: vec![Diagnostic::UnmatchedMapping {
                    mapping_index,
                    task_name: mapping.task.task_name.clone(),
                    milestone_name: mapping.milestone.milestone_name.clone(),
                    missing,
                }],
            });
        };

        let candidate = ReconciliationCandidate {
            mapping_index,
            mapping: mapping.clone(),
            system_a: task.clone(),
            system_b: milestone.clone(),
        };
        classify_candidate(&candidate, &self.rules)
    }

    /// Classify every mapping; the first malformed freshness timestamp aborts the pass.
    ///
    /// Writes and diagnostics come out in mapping order whether or not the pass runs in parallel.
    pub fn classify<S: DiagnosticsSink>(
        &self,
        mappings: &[MappingEntry],
        tasks: &[TaskRecord],
        milestones: &[MilestoneRecord],
        mut sink: S,
    ) -> Result<PendingWrites, ReconcileError> {
        info!(
            mappings = mappings.len(),
            tasks = tasks.len(),
            milestones = milestones.len(),
            parallel = self.parallel,
            "classifying mappings"
        );
        let index = SnapshotIndex::new(tasks, milestones);
        let classify_one = |(mapping_index, mapping): (usize, &MappingEntry)| {
            self.classify_mapping(&index, mapping_index, mapping)
        };

        let outcomes: Vec<Classification> = if self.parallel {
            mappings
                .par_iter()
                .enumerate()
                .map(&classify_one)
                .collect::<Result<_, _>>()?
        } else {
            mappings
                .iter()
                .enumerate()
                .map(&classify_one)
                .collect::<Result<_, _>>()?
        };

        let mut pending = PendingWrites::default();
        for outcome in outcomes {
            for diagnostic in outcome.diagnostics {
                sink.record(diagnostic);
            }
            if let Some(write) = outcome.write {
                pending.push(write);
            }
        }
        info!(
            system_a = pending.system_a.len(),
            system_b = pending.system_b.len(),
            "pending writes after classification"
        );
        Ok(pending)
    }
}

/// Everything written to `diagnostics.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiagnosticsReport {
    pub diagnostics: Vec<Diagnostic>,
    pub invalid_entities: Vec<InvalidEntity>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub mappings: usize,
    pub unmatched_mappings: usize,
    pub system_a_pending: usize,
    pub system_b_pending: usize,
    pub system_a_writes: usize,
    pub system_b_writes: usize,
    pub warnings: usize,
    pub invalid_entities: usize,
    pub run_dir: String,
    pub manifest: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    pub schema_version: u32,
    pub run_id: Uuid,
    pub files: Vec<RunManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

impl From<&StoredFile> for RunManifestFile {
    fn from(file: &StoredFile) -> Self {
        Self {
            name: file.name.clone(),
            path: file.relative_path.display().to_string(),
            sha256: file.content_hash.clone(),
            bytes: file.byte_size as u64,
        }
    }
}

pub struct ReconcilePipeline {
    config: ReconcileConfig,
    engine: ReconcileEngine,
    run_store: RunStore,
}

impl ReconcilePipeline {
    pub fn new(config: ReconcileConfig) -> Result<Self> {
        let rules = ClassifierRules::load_or_default(&config.rules_path)?;
        let engine = ReconcileEngine::new(rules).with_parallel(config.parallel);
        let run_store = RunStore::new(config.output_dir.clone());
        Ok(Self {
            config,
            engine,
            run_store,
        })
    }

    pub fn with_rules(mut self, rules: ClassifierRules) -> Self {
        self.engine = ReconcileEngine::new(rules).with_parallel(self.config.parallel);
        self
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    pub async fn run_once(&self) -> Result<ReconcileRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        info!(%run_id, workspace = %self.config.workspace_root.display(), "starting reconciliation run");

        let mapping_file = load_mapping_file(&self.config.mappings_path)
            .await
            .context("loading mapping file")?;
        let tasks = self.load_tasks(&self.config.system_a_snapshot).await?;
        let milestones = self.load_milestones(&self.config.system_b_snapshot).await?;
        info!(
            mappings = mapping_file.mappings.len(),
            invalid_entities = mapping_file.invalid_entities.len(),
            "received mappings"
        );
        for entity in &mapping_file.invalid_entities {
            warn!(entity_id = entity.entity_id, message = entity.message, "invalid entity in mapping source");
        }

        let mut sink = TeeSink(CollectingSink::new(), TracingSink);
        let pending = self
            .engine
            .classify(&mapping_file.mappings, &tasks, &milestones, &mut sink)
            .context("classifying mappings")?;
        let system_a_pending = pending.system_a.len();
        let system_b_pending = pending.system_b.len();

        let refreshed_tasks = match &self.config.system_a_refresh {
            Some(path) => Some(self.load_tasks(path).await?),
            None => None,
        };
        let refreshed_milestones = match &self.config.system_b_refresh {
            Some(path) => Some(self.load_milestones(path).await?),
            None => None,
        };
        let mut filter = IdempotenceFilter::new();
        if let Some(tasks) = &refreshed_tasks {
            filter = filter.with_system_a(tasks);
        }
        if let Some(milestones) = &refreshed_milestones {
            filter = filter.with_system_b(milestones);
        }
        let batches = filter.apply(build_batches(pending));
        info!(
            system_a = batches.write_count(SystemId::SystemA),
            system_b = batches.write_count(SystemId::SystemB),
            "final writes after idempotence filter"
        );

        let collected = sink.0;
        let warnings = collected.warnings().count();
        let diagnostics = DiagnosticsReport {
            diagnostics: collected.into_events(),
            invalid_entities: mapping_file.invalid_entities,
        };
        let unmatched_mappings = diagnostics
            .diagnostics
            .iter()
            .filter(|d| matches!(d, Diagnostic::UnmatchedMapping { .. }))
            .count();

        let finished_at = Utc::now();
        let run_dir = self.run_store.run_dir(started_at, run_id);
        let manifest_path = run_dir.join(MANIFEST_FILE);
        let summary = ReconcileRunSummary {
            run_id,
            started_at,
            finished_at,
            mappings: mapping_file.mappings.len(),
            unmatched_mappings,
            system_a_pending,
            system_b_pending,
            system_a_writes: batches.write_count(SystemId::SystemA),
            system_b_writes: batches.write_count(SystemId::SystemB),
            warnings,
            invalid_entities: diagnostics.invalid_entities.len(),
            run_dir: run_dir.display().to_string(),
            manifest: manifest_path.display().to_string(),
        };

        self.write_run_files(&summary, &batches, &diagnostics).await?;
        info!(%run_id, run_dir = summary.run_dir, "reconciliation run complete");
        Ok(summary)
    }

    async fn load_tasks(&self, path: &Path) -> Result<Vec<TaskRecord>> {
        match self.config.snapshot_format {
            SnapshotFormat::Flattened => Ok(load_system_a_snapshot(path)
                .await
                .context("loading System-A snapshot")?
                .tasks),
            SnapshotFormat::Raw => {
                let text = read_raw_export(path).await?;
                flatten_export(&TaskDetailFlattener, &text)
                    .with_context(|| format!("flattening {}", path.display()))
            }
        }
    }

    async fn load_milestones(&self, path: &Path) -> Result<Vec<MilestoneRecord>> {
        match self.config.snapshot_format {
            SnapshotFormat::Flattened => Ok(load_system_b_snapshot(path)
                .await
                .context("loading System-B snapshot")?
                .milestones),
            SnapshotFormat::Raw => {
                let text = read_raw_export(path).await?;
                flatten_export(&MilestoneQueryFlattener, &text)
                    .with_context(|| format!("flattening {}", path.display()))
            }
        }
    }

    async fn write_run_files(
        &self,
        summary: &ReconcileRunSummary,
        batches: &UpdateBatches,
        diagnostics: &DiagnosticsReport,
    ) -> Result<()> {
        let (started_at, run_id) = (summary.started_at, summary.run_id);
        let report = render_run_report(summary, batches, diagnostics);

        let stored = vec![
            self.run_store
                .store_json(started_at, run_id, SYSTEM_A_BATCHES_FILE, &batches.system_a)
                .await?,
            self.run_store
                .store_json(started_at, run_id, SYSTEM_B_BATCHES_FILE, &batches.system_b)
                .await?,
            self.run_store
                .store_json(started_at, run_id, DIAGNOSTICS_FILE, diagnostics)
                .await?,
            self.run_store
                .store_bytes(started_at, run_id, REPORT_FILE, report.as_bytes())
                .await?,
            self.run_store
                .store_json(started_at, run_id, SUMMARY_FILE, summary)
                .await?,
        ];

        let manifest = RunManifest {
            schema_version: 1,
            run_id,
            files: stored.iter().map(RunManifestFile::from).collect(),
        };
        self.run_store
            .store_json(started_at, run_id, MANIFEST_FILE, &manifest)
            .await?;
        Ok(())
    }
}

async fn read_raw_export(path: &Path) -> Result<String> {
    fs::read_to_string(path)
        .await
        .with_context(|| format!("reading raw export {}", path.display()))
}

fn render_run_report(
    summary: &ReconcileRunSummary,
    batches: &UpdateBatches,
    diagnostics: &DiagnosticsReport,
) -> String {
    let mut lines = vec![
        "# Task/Milestone Reconciliation".to_string(),
        String::new(),
        format!("- Run ID: `{}`", summary.run_id),
        format!("- Started: {}", summary.started_at),
        format!("- Finished: {}", summary.finished_at),
        format!("- Mappings: {}", summary.mappings),
        format!("- Unmatched mappings: {}", summary.unmatched_mappings),
        format!(
            "- System-A writes: {} (of {} pending)",
            summary.system_a_writes, summary.system_a_pending
        ),
        format!(
            "- System-B writes: {} (of {} pending)",
            summary.system_b_writes, summary.system_b_pending
        ),
        String::new(),
    ];

    for system in [SystemId::SystemA, SystemId::SystemB] {
        lines.push(format!("## {system} Updates"));
        let system_batches = batches.for_system(system);
        if system_batches.is_empty() {
            lines.push("No updates.".to_string());
            lines.push(String::new());
            continue;
        }
        for batch in system_batches {
            lines.push(format!("### `{}`", batch.group_key));
            lines.push("| Task | Milestone | Field | Old | New | Reason |".to_string());
            lines.push("|---|---|---|---|---|---|".to_string());
            for write in &batch.writes {
                let action = if write.requires_task_action { " (task action)" } else { "" };
                lines.push(format!(
                    "| {} | {} | {} | {} | {} | {}{} |",
                    write.mapping.task.task_name,
                    write.mapping.milestone.milestone_name,
                    write.field,
                    write.old_value.as_deref().unwrap_or(""),
                    write.payload_value,
                    write.reason.describe(),
                    action
                ));
            }
            lines.push(String::new());
        }
    }

    let warnings: Vec<_> = diagnostics.diagnostics.iter().filter(|d| d.is_warning()).collect();
    if !warnings.is_empty() || !diagnostics.invalid_entities.is_empty() {
        lines.push("## Warnings".to_string());
        for diagnostic in warnings {
            lines.push(format!("- {}", describe_warning(diagnostic)));
        }
        for entity in &diagnostics.invalid_entities {
            lines.push(format!("- entity `{}`: {}", entity.entity_id, entity.message));
        }
        lines.push(String::new());
    }

    lines.join("\n")
}

fn describe_warning(diagnostic: &Diagnostic) -> String {
    match diagnostic {
        Diagnostic::UnmatchedMapping {
            mapping_index,
            task_name,
            milestone_name,
            missing,
        } => {
            let missing = missing.iter().map(|s| s.label()).collect::<Vec<_>>().join(", ");
            format!("mapping {mapping_index} ({task_name} / {milestone_name}): no record in {missing}")
        }
        Diagnostic::UnrecognizedField { mapping_index, label } => {
            format!("mapping {mapping_index}: unrecognized field `{label}`")
        }
        Diagnostic::UnresolvedDirection {
            mapping_index,
            source,
            target,
        } => format!("mapping {mapping_index}: cannot resolve `{source}` -> `{target}`"),
        other => format!("mapping {}: {other:?}", other.mapping_index()),
    }
}

pub async fn run_reconcile_once_from_env() -> Result<ReconcileRunSummary> {
    let config = ReconcileConfig::from_env();
    ReconcilePipeline::new(config)?.run_once().await
}

/// Markdown summary of the latest `runs` completed runs under `output_root`.
///
/// Directories without a readable `run_summary.json` (runs that failed while writing
/// their files) are skipped with a warning. Runs are ordered by recorded start time.
pub fn report_runs_markdown(runs: usize, output_root: &Path) -> Result<String> {
    let dirs = std::fs::read_dir(output_root)
        .with_context(|| format!("reading {}", output_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .collect::<Vec<_>>();

    let mut completed = Vec::with_capacity(dirs.len());
    for dir in dirs {
        let summary_path = dir.path().join(SUMMARY_FILE);
        match read_run_summary(&summary_path) {
            Ok(summary) => completed.push((dir, summary)),
            Err(err) => warn!(path = %summary_path.display(), error = %format!("{err:#}"), "skipping incomplete run"),
        }
    }
    completed.sort_by(|(a_dir, a), (b_dir, b)| {
        (b.started_at, b_dir.file_name()).cmp(&(a.started_at, a_dir.file_name()))
    });

    let mut lines = vec!["# Reconciliation Runs".to_string(), String::new()];
    for (dir, summary) in completed.into_iter().take(runs.max(1)) {
        let name = dir.file_name().to_string_lossy().to_string();
        let report_path = dir.path().join(REPORT_FILE);

        lines.push(format!("## Run `{name}`"));
        lines.push(format!("- started: {}", summary.started_at));
        lines.push(format!("- mappings: {}", summary.mappings));
        lines.push(format!("- unmatched: {}", summary.unmatched_mappings));
        lines.push(format!("- System-A writes: {}", summary.system_a_writes));
        lines.push(format!("- System-B writes: {}", summary.system_b_writes));
        lines.push(format!("- warnings: {}", summary.warnings));
        if report_path.exists() {
            lines.push(format!("- report: `{}`", report_path.display()));
        }
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}

fn read_run_summary(path: &Path) -> Result<ReconcileRunSummary> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{mapping, milestone, task, A_EARLY, B_LATE};
    use serde_json::json;
    use tempfile::tempdir;
    use tmsync_core::{FieldCategory, WriteReason};

    fn forecast_fixture() -> (Vec<MappingEntry>, Vec<TaskRecord>, Vec<MilestoneRecord>) {
        let mut mappings = Vec::new();
        let mut tasks = Vec::new();
        let mut milestones = Vec::new();
        for i in 0..12 {
            let mut m = mapping(&format!("Task {i}"), &format!("Milestone {i}"));
            m.task.entity_id = format!("E{}", i % 3);
            mappings.push(m);

            let mut t = task("P1", &format!("E{}", i % 3), "M1", &format!("Task {i}"));
            t.planned_start_time = Some("2024-01-05 00:00:00.000000".into());
            tasks.push(t);

            let mut ms = milestone("SP1", &format!("Milestone {i}"));
            ms.milestone_id = format!("MS-{i}");
            ms.planned_start_time = Some(format!("2024-02-{:02}", i + 1));
            milestones.push(ms);
        }
        (mappings, tasks, milestones)
    }

    #[test]
    fn parallel_and_sequential_passes_agree_on_order() {
        let (mappings, tasks, milestones) = forecast_fixture();
        let sequential = ReconcileEngine::default()
            .classify(&mappings, &tasks, &milestones, CollectingSink::new())
            .expect("sequential");
        let parallel = ReconcileEngine::default()
            .with_parallel(true)
            .classify(&mappings, &tasks, &milestones, CollectingSink::new())
            .expect("parallel");

        assert_eq!(sequential.system_a.len(), 12);
        assert_eq!(sequential, parallel);
        let ids: Vec<_> = parallel.system_a.iter().map(|w| w.milestone_id.as_str()).collect();
        assert_eq!(ids[0], "MS-0");
        assert_eq!(ids[11], "MS-11");
    }

    #[test]
    fn unmatched_mappings_are_reported_not_fatal() {
        let mappings = vec![mapping("Site Survey", "Survey Complete")];
        let tasks = vec![task("P1", "E1", "M1", "Site Survey")];
        let mut sink = CollectingSink::new();
        let pending = ReconcileEngine::default()
            .classify(&mappings, &tasks, &[], &mut sink)
            .expect("classify");

        assert!(pending.is_empty());
        assert_eq!(
            sink.events(),
            [Diagnostic::UnmatchedMapping {
                mapping_index: 0,
                task_name: "Site Survey".into(),
                milestone_name: "Survey Complete".into(),
                missing: vec![SystemId::SystemB],
            }]
        );
    }

    #[test]
    fn malformed_timestamp_aborts_the_whole_pass() {
        for parallel in [false, true] {
            let (mappings, tasks, mut milestones) = forecast_fixture();
            milestones[7].last_modified_time = "yesterday".into();
            let err = ReconcileEngine::default()
                .with_parallel(parallel)
                .classify(&mappings, &tasks, &milestones, CollectingSink::new())
                .expect_err("fatal");
            let ReconcileError::MalformedTimestamp { mapping_index, .. } = err;
            assert_eq!(mapping_index, 7);
        }
    }

    #[test]
    fn workspace_defaults() {
        let config = ReconcileConfig::for_workspace("/srv/tmsync");
        assert_eq!(config.mappings_path, PathBuf::from("/srv/tmsync/snapshots/mappings.json"));
        assert_eq!(config.system_a_snapshot, PathBuf::from("/srv/tmsync/snapshots/system_a.json"));
        assert_eq!(config.output_dir, PathBuf::from("/srv/tmsync/runs"));
        assert_eq!(config.rules_path, PathBuf::from("/srv/tmsync/rules.yaml"));
        assert!(config.system_a_refresh.is_none());
        assert_eq!(config.snapshot_format, SnapshotFormat::Flattened);
        assert_eq!("RAW".parse::<SnapshotFormat>().expect("format"), SnapshotFormat::Raw);
        assert!("csv".parse::<SnapshotFormat>().is_err());
    }

    fn write_json(path: &Path, value: &serde_json::Value) {
        std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        std::fs::write(path, serde_json::to_vec_pretty(value).expect("json")).expect("write fixture");
    }

    fn seed_workspace(root: &Path) {
        let snapshots = root.join("snapshots");
        write_json(
            &snapshots.join("mappings.json"),
            &json!({
                "mappings": [
                    {
                        "task": {"project_id": "P1", "entity_id": "E1", "module_id": "M1",
                                 "task_name": "Site Survey", "task_type": "Task"},
                        "milestone": {"project_id": "SP1", "milestone_name": "Survey Complete"},
                        "target_field": "Actual End Date",
                        "source": "System-A", "target": "System-A"
                    },
                    {
                        "task": {"project_id": "P1", "entity_id": "E1", "module_id": "M1",
                                 "task_name": "Permit"},
                        "milestone": {"project_id": "SP1", "milestone_name": "Permit Filed"},
                        "target_field": "Forecast Start Date",
                        "source": "System-A", "target": "System-A"
                    },
                    {
                        "task": {"project_id": "P1", "entity_id": "E1", "module_id": "M1",
                                 "task_name": "Missing"},
                        "milestone": {"project_id": "SP1", "milestone_name": "Nowhere"},
                        "target_field": "Forecast Start Date",
                        "source": "System-A", "target": "System-A"
                    }
                ],
                "invalid_entities": [
                    {"entity_id": "E9", "message": "entity has no work plan"}
                ]
            }),
        );
        write_json(
            &snapshots.join("system_a.json"),
            &json!({"tasks": [
                {"project_id": "P1", "entity_id": "E1", "module_id": "M1", "task_name": "site survey",
                 "actual_end_time": "null", "last_modified_time": B_LATE},
                {"project_id": "P1", "entity_id": "E1", "module_id": "M1", "task_name": "Permit",
                 "planned_start_time": "2024-01-10 00:00:00.000000", "last_modified_time": B_LATE}
            ]}),
        );
        write_json(
            &snapshots.join("system_b.json"),
            &json!({"milestones": [
                {"project_id": "SP1", "milestone_id": "MS-1", "milestone_name": "Survey Complete",
                 "actual_end_time": "2024-01-06", "last_modified_time": A_EARLY},
                {"project_id": "SP1", "milestone_id": "MS-2", "milestone_name": "Permit Filed",
                 "planned_start_time": "2024-01-03", "last_modified_time": A_EARLY}
            ]}),
        );
    }

    #[tokio::test]
    async fn pipeline_writes_batches_diagnostics_and_manifest() {
        let dir = tempdir().expect("tempdir");
        seed_workspace(dir.path());

        let pipeline = ReconcilePipeline::new(ReconcileConfig::for_workspace(dir.path())).expect("pipeline");
        let summary = pipeline.run_once().await.expect("run");

        assert_eq!(summary.mappings, 3);
        assert_eq!(summary.unmatched_mappings, 1);
        assert_eq!(summary.system_a_writes, 1);
        assert_eq!(summary.system_b_writes, 1);
        assert_eq!(summary.invalid_entities, 1);

        let run_dir = PathBuf::from(&summary.run_dir);
        let a_batches: Vec<WriteBatch> = serde_json::from_str(
            &std::fs::read_to_string(run_dir.join(SYSTEM_A_BATCHES_FILE)).expect("read"),
        )
        .expect("parse");
        let backfill = &a_batches[0].writes[0];
        assert_eq!(a_batches[0].group_key, "E1");
        assert_eq!(backfill.reason, WriteReason::TaskActualEndBackfill);
        assert_eq!(backfill.payload_value, "2024-01-06 12:00:00");
        assert!(backfill.requires_task_action);

        let b_batches: Vec<WriteBatch> = serde_json::from_str(
            &std::fs::read_to_string(run_dir.join(SYSTEM_B_BATCHES_FILE)).expect("read"),
        )
        .expect("parse");
        assert_eq!(b_batches[0].group_key, "SP1");
        assert_eq!(b_batches[0].writes[0].field, FieldCategory::ForecastStartDate);
        assert_eq!(b_batches[0].writes[0].value, "2024-01-10");

        let diagnostics: DiagnosticsReport = serde_json::from_str(
            &std::fs::read_to_string(run_dir.join(DIAGNOSTICS_FILE)).expect("read"),
        )
        .expect("parse");
        assert_eq!(diagnostics.invalid_entities[0].entity_id, "E9");

        let manifest: RunManifest = serde_json::from_str(
            &std::fs::read_to_string(&summary.manifest).expect("read"),
        )
        .expect("parse");
        assert_eq!(manifest.run_id, summary.run_id);
        let names: Vec<_> = manifest.files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(
            names,
            [SYSTEM_A_BATCHES_FILE, SYSTEM_B_BATCHES_FILE, DIAGNOSTICS_FILE, REPORT_FILE, SUMMARY_FILE]
        );
        let report_bytes = std::fs::read(run_dir.join(REPORT_FILE)).expect("report");
        let report_entry = &manifest.files[3];
        assert_eq!(report_entry.sha256, RunStore::sha256_hex(&report_bytes));
        assert_eq!(report_entry.bytes, report_bytes.len() as u64);

        let report = String::from_utf8(report_bytes).expect("utf8");
        assert!(report.contains("(task action)"));
        assert!(report.contains("entity `E9`"));
    }

    #[tokio::test]
    async fn refreshed_snapshot_drops_writes_already_applied() {
        let dir = tempdir().expect("tempdir");
        seed_workspace(dir.path());
        let refresh = dir.path().join("refresh").join("system_b.json");
        write_json(
            &refresh,
            &json!({"milestones": [
                {"project_id": "SP1", "milestone_id": "MS-2", "milestone_name": "Permit Filed",
                 "planned_start_time": "2024-01-10", "last_modified_time": B_LATE}
            ]}),
        );

        let mut config = ReconcileConfig::for_workspace(dir.path());
        config.system_b_refresh = Some(refresh);
        let summary = ReconcilePipeline::new(config)
            .expect("pipeline")
            .run_once()
            .await
            .expect("run");

        assert_eq!(summary.system_b_pending, 1);
        assert_eq!(summary.system_b_writes, 0);
        assert_eq!(summary.system_a_writes, 1);
    }

    #[tokio::test]
    async fn raw_exports_are_flattened_on_load() {
        let dir = tempdir().expect("tempdir");
        seed_workspace(dir.path());
        let snapshots = dir.path().join("snapshots");
        write_json(
            &snapshots.join("raw_a.json"),
            &json!({"task_details": [{
                "request": {"project_id": "P1", "entity_id": "E1", "module_id": "M1", "task_name": "Permit"},
                "response": {"name": "Permit", "plannedStartTime": "2024-01-10 00:00:00.000000",
                             "modifiedTime": B_LATE}
            }]}),
        );
        write_json(
            &snapshots.join("raw_b.json"),
            &json!({"total_size": 1, "records": [{
                "id": "MS-2", "name": "Permit Filed", "project_id": "SP1",
                "forecast_date": "2024-01-03", "last_modified_date": "2024-01-01T10:00:00.000+0000"
            }]}),
        );

        let mut config = ReconcileConfig::for_workspace(dir.path());
        config.snapshot_format = SnapshotFormat::Raw;
        config.system_a_snapshot = snapshots.join("raw_a.json");
        config.system_b_snapshot = snapshots.join("raw_b.json");
        let summary = ReconcilePipeline::new(config)
            .expect("pipeline")
            .run_once()
            .await
            .expect("run");

        assert_eq!(summary.unmatched_mappings, 2);
        assert_eq!(summary.system_b_writes, 1);
    }

    #[tokio::test]
    async fn rules_file_changes_task_type_label() {
        let dir = tempdir().expect("tempdir");
        seed_workspace(dir.path());
        std::fs::write(dir.path().join("rules.yaml"), "task_type_label: Activity\n").expect("rules");

        let pipeline = ReconcilePipeline::new(ReconcileConfig::for_workspace(dir.path())).expect("pipeline");
        assert_eq!(pipeline.engine.rules().task_type_label, "Activity");
        let summary = pipeline.run_once().await.expect("run");
        // "Task" is no longer special: System-A is newer, so nothing flows back to it.
        assert_eq!(summary.system_a_writes, 0);
    }

    #[tokio::test]
    async fn run_history_lists_latest_runs_first() {
        let dir = tempdir().expect("tempdir");
        seed_workspace(dir.path());
        let config = ReconcileConfig::for_workspace(dir.path());
        let output_dir = config.output_dir.clone();
        let pipeline = ReconcilePipeline::new(config).expect("pipeline");
        let first = pipeline.run_once().await.expect("first run");
        let second = pipeline.run_once().await.expect("second run");

        let markdown = report_runs_markdown(1, &output_dir).expect("report");
        assert!(markdown.starts_with("# Reconciliation Runs"));
        assert_eq!(markdown.matches("## Run").count(), 1);
        assert!(markdown.contains(&second.run_id.to_string()));

        let all = report_runs_markdown(5, &output_dir).expect("report");
        assert_eq!(all.matches("## Run").count(), 2);
        assert!(all.contains(&first.run_id.to_string()));
        assert!(all.contains(&second.run_id.to_string()));
        assert!(all.contains("- System-B writes: 1"));
    }

    #[tokio::test]
    async fn run_history_skips_runs_without_summary() {
        let dir = tempdir().expect("tempdir");
        seed_workspace(dir.path());
        let config = ReconcileConfig::for_workspace(dir.path());
        let output_dir = config.output_dir.clone();
        let summary = ReconcilePipeline::new(config)
            .expect("pipeline")
            .run_once()
            .await
            .expect("run");

        // A later run that died before its summary was written.
        let broken = output_dir.join("29991231_235959_00000000-0000-0000-0000-000000000000");
        std::fs::create_dir_all(&broken).expect("mkdir");
        std::fs::write(broken.join(SYSTEM_A_BATCHES_FILE), "[]").expect("write");

        let markdown = report_runs_markdown(5, &output_dir).expect("report");
        assert_eq!(markdown.matches("## Run").count(), 1);
        assert!(markdown.contains(&summary.run_id.to_string()));
        assert!(!markdown.contains("29991231"));
    }

    #[test]
    fn report_on_missing_output_dir_fails_with_path() {
        let dir = tempdir().expect("tempdir");
        let err = report_runs_markdown(3, &dir.path().join("runs")).expect_err("missing");
        assert!(format!("{err:#}").contains("runs"));
    }
}
