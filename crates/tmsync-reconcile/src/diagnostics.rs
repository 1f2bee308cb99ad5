use serde::{Deserialize, Serialize};
use tmsync_core::{FieldCategory, SystemId};
use tracing::{debug, info, warn};

/// Why a selected write was dropped by the necessity check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuppressReason {
    /// The leading side has no value to propagate.
    SourceValueMissing,
    /// The leading side's value is not a recognizable date.
    SourceValueUnparseable,
    /// Forecast writes are skipped once the target has an actual end.
    ActualEndTakesPrecedence,
    /// Both sides already normalize to the same date.
    AlreadyInSync,
}

impl SuppressReason {
    pub fn describe(self) -> &'static str {
        match self {
            Self::SourceValueMissing => "source value missing",
            Self::SourceValueUnparseable => "source value unparseable",
            Self::ActualEndTakesPrecedence => "actual end takes precedence over forecast",
            Self::AlreadyInSync => "already in sync",
        }
    }
}

/// Structured event emitted while classifying; never an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Diagnostic {
    UnmatchedMapping {
        mapping_index: usize,
        task_name: String,
        milestone_name: String,
        missing: Vec<SystemId>,
    },
    UnrecognizedField {
        mapping_index: usize,
        label: String,
    },
    UnresolvedDirection {
        mapping_index: usize,
        source: String,
        target: String,
    },
    /// Timestamps were equal on a peer mapping.
    TimestampsEqual {
        mapping_index: usize,
        field: FieldCategory,
    },
    /// Task-typed actual end writes to System-A go through task actions, not field updates.
    TaskTypeSuppressed {
        mapping_index: usize,
        task_name: String,
    },
    WriteSuppressed {
        mapping_index: usize,
        target: SystemId,
        field: FieldCategory,
        task_name: String,
        milestone_name: String,
        reason: SuppressReason,
    },
}

impl Diagnostic {
    pub fn mapping_index(&self) -> usize {
        match self {
            Self::UnmatchedMapping { mapping_index, .. }
            | Self::UnrecognizedField { mapping_index, .. }
            | Self::UnresolvedDirection { mapping_index, .. }
            | Self::TimestampsEqual { mapping_index, .. }
            | Self::TaskTypeSuppressed { mapping_index, .. }
            | Self::WriteSuppressed { mapping_index, .. } => *mapping_index,
        }
    }

    /// Unmatched and unresolvable mappings are worth a human's attention.
    pub fn is_warning(&self) -> bool {
        matches!(
            self,
            Self::UnmatchedMapping { .. } | Self::UnrecognizedField { .. } | Self::UnresolvedDirection { .. }
        )
    }
}

pub trait DiagnosticsSink {
    fn record(&mut self, diagnostic: Diagnostic);
}

impl<S: DiagnosticsSink + ?Sized> DiagnosticsSink for &mut S {
    fn record(&mut self, diagnostic: Diagnostic) {
        (**self).record(diagnostic);
    }
}

#[derive(Debug, Default, Clone)]
pub struct CollectingSink {
    events: Vec<Diagnostic>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> &[Diagnostic] {
        &self.events
    }

    pub fn into_events(self) -> Vec<Diagnostic> {
        self.events
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Diagnostic> {
        self.events.iter().filter(|d| d.is_warning())
    }
}

impl DiagnosticsSink for CollectingSink {
    fn record(&mut self, diagnostic: Diagnostic) {
        self.events.push(diagnostic);
    }
}

/// Forwards every event to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DiagnosticsSink for TracingSink {
    fn record(&mut self, diagnostic: Diagnostic) {
        match &diagnostic {
            Diagnostic::UnmatchedMapping {
                mapping_index,
                task_name,
                milestone_name,
                missing,
            } => warn!(mapping_index, task_name, milestone_name, ?missing, "mapping has no candidate"),
            Diagnostic::UnrecognizedField { mapping_index, label } => {
                warn!(mapping_index, label, "unrecognized target field")
            }
            Diagnostic::UnresolvedDirection {
                mapping_index,
                source,
                target,
            } => warn!(mapping_index, source, target, "mapping direction does not resolve"),
            Diagnostic::TimestampsEqual { mapping_index, field } => {
                debug!(mapping_index, %field, "timestamps equal; treated as synchronized")
            }
            Diagnostic::TaskTypeSuppressed { mapping_index, task_name } => {
                info!(mapping_index, task_name, "task actual end left to task actions")
            }
            Diagnostic::WriteSuppressed {
                mapping_index,
                target,
                field,
                task_name,
                milestone_name,
                reason,
            } => debug!(
                mapping_index,
                %target,
                %field,
                task_name,
                milestone_name,
                reason = reason.describe(),
                "write suppressed"
            ),
        }
    }
}

/// Records into both sinks.
#[derive(Debug, Default, Clone)]
pub struct TeeSink<A, B>(pub A, pub B);

impl<A: DiagnosticsSink, B: DiagnosticsSink> DiagnosticsSink for TeeSink<A, B> {
    fn record(&mut self, diagnostic: Diagnostic) {
        self.0.record(diagnostic.clone());
        self.1.record(diagnostic);
    }
}
