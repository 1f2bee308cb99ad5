//! Conflict classification: pick the stale side, then decide whether writing it is necessary.
//!
//! The two halves are separate on purpose: [`select_write_target`] walks the direction and
//! freshness rules, [`check_write_necessity`] compares normalized values for the chosen side.

use std::cmp::Ordering;
use std::path::Path;

use anyhow::Context;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tmsync_core::{
    is_no_data, is_system_a_no_data, is_system_b_no_data, normalize_date, parse_modified_timestamp,
    to_noon_timestamp, FieldCategory, MappingEntry, PendingWrite, ReconciliationCandidate, SystemId,
    WriteReason,
};

use crate::diagnostics::{Diagnostic, SuppressReason};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("mapping {mapping_index}: malformed {system} last modified time {value:?}: {source}")]
    MalformedTimestamp {
        mapping_index: usize,
        system: SystemId,
        value: String,
        #[source]
        source: chrono::ParseError,
    },
}

/// Labels the classifier keys its business rules off.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifierRules {
    /// Task type whose actual end is actualized through task actions.
    #[serde(default = "default_task_type_label")]
    pub task_type_label: String,
    #[serde(default = "default_system_a_labels")]
    pub system_a_labels: Vec<String>,
    #[serde(default = "default_system_b_labels")]
    pub system_b_labels: Vec<String>,
}

fn default_task_type_label() -> String {
    "Task".to_string()
}

fn default_system_a_labels() -> Vec<String> {
    vec![SystemId::SystemA.label().to_string()]
}

fn default_system_b_labels() -> Vec<String> {
    vec![SystemId::SystemB.label().to_string()]
}

impl Default for ClassifierRules {
    fn default() -> Self {
        Self {
            task_type_label: default_task_type_label(),
            system_a_labels: default_system_a_labels(),
            system_b_labels: default_system_b_labels(),
        }
    }
}

impl ClassifierRules {
    pub fn from_yaml_str(text: &str) -> anyhow::Result<Self> {
        serde_yaml::from_str(text).context("parsing classifier rules")
    }

    /// Missing file means defaults.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn resolve(&self, label: &str) -> Option<SystemId> {
        if self.system_a_labels.iter().any(|l| l == label) {
            Some(SystemId::SystemA)
        } else if self.system_b_labels.iter().any(|l| l == label) {
            Some(SystemId::SystemB)
        } else {
            None
        }
    }

    /// Peers when the labels are identical or alias the same system.
    pub fn is_peer(&self, mapping: &MappingEntry) -> bool {
        if mapping.is_peer() {
            return true;
        }
        matches!(
            (self.resolve(&mapping.source), self.resolve(&mapping.target)),
            (Some(a), Some(b)) if a == b
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetSelection {
    pub target: SystemId,
    pub field: FieldCategory,
    pub reason: WriteReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetDecision {
    Write(TargetSelection),
    /// Peer mapping with identical modification instants.
    TimestampsEqual(FieldCategory),
    /// Task-typed actual end writes to System-A outside the backfill override.
    TaskTypeSuppressed,
    UnrecognizedField,
    UnresolvedDirection,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteNecessity {
    Write(Box<PendingWrite>),
    Suppressed(SuppressReason),
}

/// Outcome of classifying one candidate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Classification {
    pub write: Option<PendingWrite>,
    pub diagnostics: Vec<Diagnostic>,
}

fn modified_at(
    candidate: &ReconciliationCandidate,
    system: SystemId,
) -> Result<NaiveDateTime, ReconcileError> {
    let raw = match system {
        SystemId::SystemA => &candidate.system_a.last_modified_time,
        SystemId::SystemB => &candidate.system_b.last_modified_time,
    };
    parse_modified_timestamp(raw).map_err(|source| ReconcileError::MalformedTimestamp {
        mapping_index: candidate.mapping_index,
        system,
        value: raw.clone(),
        source,
    })
}

fn write(target: SystemId, field: FieldCategory, reason: WriteReason) -> TargetDecision {
    TargetDecision::Write(TargetSelection { target, field, reason })
}

/// Decide which side is stale. Only the peer default path reads `last_modified_time`,
/// and a malformed value there is fatal.
pub fn select_write_target(
    candidate: &ReconciliationCandidate,
    rules: &ClassifierRules,
) -> Result<TargetDecision, ReconcileError> {
    let mapping = &candidate.mapping;
    let Some(field) = mapping.target_category() else {
        return Ok(TargetDecision::UnrecognizedField);
    };
    let source_is_actual_end = mapping.source_category() == Some(FieldCategory::ActualEndDate);
    let task_actual_end = field == FieldCategory::ActualEndDate && candidate.is_task_typed(&rules.task_type_label);

    let a = &candidate.system_a;
    let b = &candidate.system_b;
    let backfill = task_actual_end
        && source_is_actual_end
        && is_system_a_no_data(a.actual_end_time.as_deref())
        && !is_system_b_no_data(b.actual_end_time.as_deref());

    if rules.is_peer(mapping) {
        if backfill {
            return Ok(write(SystemId::SystemA, field, WriteReason::TaskActualEndBackfill));
        }
        if source_is_actual_end
            && is_system_b_no_data(b.actual_start_time.as_deref())
            && !is_system_a_no_data(a.actual_start_time.as_deref())
        {
            return Ok(write(SystemId::SystemB, field, WriteReason::MilestoneStartMissing));
        }

        let a_modified = modified_at(candidate, SystemId::SystemA)?;
        let b_modified = modified_at(candidate, SystemId::SystemB)?;
        return Ok(match a_modified.cmp(&b_modified) {
            Ordering::Less if task_actual_end => TargetDecision::TaskTypeSuppressed,
            Ordering::Less => write(SystemId::SystemA, field, WriteReason::SystemBNewer),
            Ordering::Greater => write(SystemId::SystemB, field, WriteReason::SystemANewer),
            Ordering::Equal => TargetDecision::TimestampsEqual(field),
        });
    }

    Ok(
        match (rules.resolve(&mapping.source), rules.resolve(&mapping.target)) {
            (Some(SystemId::SystemB), Some(SystemId::SystemA)) if backfill => {
                write(SystemId::SystemA, field, WriteReason::TaskActualEndBackfill)
            }
            (Some(SystemId::SystemB), Some(SystemId::SystemA)) if task_actual_end => {
                TargetDecision::TaskTypeSuppressed
            }
            (Some(SystemId::SystemB), Some(SystemId::SystemA)) => {
                write(SystemId::SystemA, field, WriteReason::ExplicitDirection)
            }
            (Some(SystemId::SystemA), Some(SystemId::SystemB)) => {
                write(SystemId::SystemB, field, WriteReason::ExplicitDirection)
            }
            _ => TargetDecision::UnresolvedDirection,
        },
    )
}

/// Decide whether the selected write would change anything.
pub fn check_write_necessity(
    candidate: &ReconciliationCandidate,
    selection: TargetSelection,
    rules: &ClassifierRules,
) -> WriteNecessity {
    let TargetSelection { target, field, reason } = selection;
    let source = target.other();
    let a = &candidate.system_a;
    let b = &candidate.system_b;

    let (source_raw, target_raw, target_actual_end) = match target {
        SystemId::SystemA => (b.field_value(field), a.field_value(field), a.actual_end_time.as_deref()),
        SystemId::SystemB => (a.field_value(field), b.field_value(field), b.actual_end_time.as_deref()),
    };

    if is_no_data(source, source_raw) {
        return WriteNecessity::Suppressed(SuppressReason::SourceValueMissing);
    }
    if field == FieldCategory::ForecastStartDate && !is_no_data(target, target_actual_end) {
        return WriteNecessity::Suppressed(SuppressReason::ActualEndTakesPrecedence);
    }
    let Some(value) = normalize_date(source, source_raw) else {
        return WriteNecessity::Suppressed(SuppressReason::SourceValueUnparseable);
    };
    let current = normalize_date(target, target_raw);
    if current.as_deref() == Some(value.as_str()) {
        return WriteNecessity::Suppressed(SuppressReason::AlreadyInSync);
    }

    let payload_value = match target {
        SystemId::SystemA => to_noon_timestamp(&value).unwrap_or_else(|| value.clone()),
        SystemId::SystemB => value.clone(),
    };
    let (system_a_value, system_b_value) = match target {
        SystemId::SystemA => (current, Some(value.clone())),
        SystemId::SystemB => (Some(value.clone()), current),
    };

    WriteNecessity::Write(Box::new(PendingWrite {
        target,
        field,
        reason,
        mapping: candidate.mapping.clone(),
        milestone_id: b.milestone_id.clone(),
        project_number: b.project_number.clone(),
        value,
        payload_value,
        old_value: target_raw.map(ToString::to_string),
        system_a_value,
        system_b_value,
        requires_task_action: target == SystemId::SystemA
            && field == FieldCategory::ActualEndDate
            && candidate.is_task_typed(&rules.task_type_label),
    }))
}

/// Run both halves for one candidate.
pub fn classify_candidate(
    candidate: &ReconciliationCandidate,
    rules: &ClassifierRules,
) -> Result<Classification, ReconcileError> {
    let mapping_index = candidate.mapping_index;
    let mapping = &candidate.mapping;
    let mut out = Classification::default();

    let selection = match select_write_target(candidate, rules)? {
        TargetDecision::Write(selection) => selection,
        TargetDecision::TimestampsEqual(field) => {
            out.diagnostics
                .push(Diagnostic::TimestampsEqual { mapping_index, field });
            return Ok(out);
        }
        TargetDecision::TaskTypeSuppressed => {
            out.diagnostics.push(Diagnostic::TaskTypeSuppressed {
                mapping_index,
                task_name: mapping.task.task_name.clone(),
            });
            return Ok(out);
        }
        TargetDecision::UnrecognizedField => {
            out.diagnostics.push(Diagnostic::UnrecognizedField {
                mapping_index,
                label: mapping.target_field.clone(),
            });
            return Ok(out);
        }
        TargetDecision::UnresolvedDirection => {
            out.diagnostics.push(Diagnostic::UnresolvedDirection {
                mapping_index,
                source: mapping.source.clone(),
                target: mapping.target.clone(),
            });
            return Ok(out);
        }
    };

    match check_write_necessity(candidate, selection, rules) {
        WriteNecessity::Write(pending) => out.write = Some(*pending),
        WriteNecessity::Suppressed(reason) => out.diagnostics.push(Diagnostic::WriteSuppressed {
            mapping_index,
            target: selection.target,
            field: selection.field,
            task_name: mapping.task.task_name.clone(),
            milestone_name: mapping.milestone.milestone_name.clone(),
            reason,
        }),
    }
    Ok(out)
}
