//! Core domain model and date normalization for task/milestone reconciliation.

use std::fmt;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "tmsync-core";

/// Sentinel System-A uses for "no value".
pub const SYSTEM_A_NULL_SENTINEL: &str = "null";

/// Canonical calendar-date rendering used for every equality decision.
pub const CANONICAL_DATE_FORMAT: &str = "%Y-%m-%d";

/// Full-precision timestamp shape of `last_modified_time` on both systems.
pub const MODIFIED_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// Timestamp shape written back to systems that reject bare dates.
pub const WRITE_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const SYSTEM_A_DATE_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f"];
const SYSTEM_B_DATE_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f"];
const SYSTEM_B_OFFSET_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f%z", "%Y-%m-%dT%H:%M:%S%.f%:z"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SystemId {
    SystemA,
    SystemB,
}

impl SystemId {
    pub fn label(self) -> &'static str {
        match self {
            Self::SystemA => "System-A",
            Self::SystemB => "System-B",
        }
    }

    pub fn other(self) -> Self {
        match self {
            Self::SystemA => Self::SystemB,
            Self::SystemB => Self::SystemA,
        }
    }
}

impl fmt::Display for SystemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// The two field categories kept in sync between the systems.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FieldCategory {
    #[serde(rename = "Actual End Date")]
    ActualEndDate,
    #[serde(rename = "Forecast Start Date")]
    ForecastStartDate,
}

impl FieldCategory {
    pub const ALL: [Self; 2] = [Self::ActualEndDate, Self::ForecastStartDate];

    pub fn label(self) -> &'static str {
        match self {
            Self::ActualEndDate => "Actual End Date",
            Self::ForecastStartDate => "Forecast Start Date",
        }
    }

    /// Exact-label lookup; anything else is an unrecognized category.
    pub fn parse(label: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.label() == label)
    }
}

impl fmt::Display for FieldCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// System-A side of a mapping: which task instance is being synchronized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TaskRef {
    #[serde(default)]
    pub customer_name: String,
    pub project_id: String,
    /// Work-plan entity the module belongs to; also the batch grouping key.
    pub entity_id: String,
    #[serde(default)]
    pub entity_name: String,
    pub module_id: String,
    #[serde(default)]
    pub module_name: String,
    #[serde(default)]
    pub task_id: Option<String>,
    pub task_name: String,
    #[serde(default)]
    pub task_type: String,
}

/// System-B side of a mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MilestoneRef {
    pub project_id: String,
    pub milestone_name: String,
    #[serde(default)]
    pub milestone_id: Option<String>,
    #[serde(default)]
    pub project_template_id: String,
    #[serde(default)]
    pub project_template_name: String,
}

/// Declared correspondence between one System-A task field and one System-B milestone field.
///
/// `source`/`target` are free-form system labels; equal labels mean the systems are peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingEntry {
    pub task: TaskRef,
    pub milestone: MilestoneRef,
    #[serde(default)]
    pub source_field: Option<String>,
    pub target_field: String,
    pub source: String,
    pub target: String,
}

impl MappingEntry {
    pub fn is_peer(&self) -> bool {
        self.source == self.target
    }

    pub fn target_category(&self) -> Option<FieldCategory> {
        FieldCategory::parse(&self.target_field)
    }

    /// Falls back to the target category when the mapping names no source field.
    pub fn source_category(&self) -> Option<FieldCategory> {
        match self.source_field.as_deref() {
            Some(label) if !label.is_empty() => FieldCategory::parse(label),
            _ => self.target_category(),
        }
    }
}

/// One System-A task instance, flattened.
///
/// Date fields keep their raw representation: `Some("null")` is System-A's sentinel
/// and must survive serialization distinct from `None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub project_id: String,
    pub entity_id: String,
    pub module_id: String,
    #[serde(default)]
    pub task_id: Option<String>,
    pub task_name: String,
    #[serde(default)]
    pub actual_start_time: Option<String>,
    #[serde(default)]
    pub actual_end_time: Option<String>,
    #[serde(default)]
    pub planned_start_time: Option<String>,
    #[serde(default)]
    pub planned_end_time: Option<String>,
    pub last_modified_time: String,
    #[serde(default)]
    pub current_owner_name: Option<String>,
    #[serde(default)]
    pub assignee_user_name: Option<String>,
}

impl TaskRecord {
    pub fn field_value(&self, field: FieldCategory) -> Option<&str> {
        match field {
            FieldCategory::ActualEndDate => self.actual_end_time.as_deref(),
            FieldCategory::ForecastStartDate => self.planned_start_time.as_deref(),
        }
    }
}

/// One System-B milestone instance, flattened. Absence is `None` or `""`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MilestoneRecord {
    pub project_id: String,
    pub milestone_id: String,
    pub milestone_name: String,
    #[serde(default)]
    pub project_number: Option<String>,
    #[serde(default)]
    pub actual_start_time: Option<String>,
    /// Mapped from the milestone's actual-date attribute.
    #[serde(default)]
    pub actual_end_time: Option<String>,
    /// Mapped from the milestone's forecast-date attribute.
    #[serde(default)]
    pub planned_start_time: Option<String>,
    pub last_modified_time: String,
}

impl MilestoneRecord {
    pub fn field_value(&self, field: FieldCategory) -> Option<&str> {
        match field {
            FieldCategory::ActualEndDate => self.actual_end_time.as_deref(),
            FieldCategory::ForecastStartDate => self.planned_start_time.as_deref(),
        }
    }
}

/// A mapping entry merged with both matched records. Lives for one classification pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconciliationCandidate {
    pub mapping_index: usize,
    pub mapping: MappingEntry,
    pub system_a: TaskRecord,
    pub system_b: MilestoneRecord,
}

impl ReconciliationCandidate {
    pub fn is_task_typed(&self, task_type_label: &str) -> bool {
        self.mapping.task.task_type == task_type_label
    }
}

/// Why a write target was selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteReason {
    /// Task-typed entity with no actual end on System-A while System-B has one.
    TaskActualEndBackfill,
    /// System-B milestone never started while the System-A task did.
    MilestoneStartMissing,
    SystemANewer,
    SystemBNewer,
    ExplicitDirection,
}

impl WriteReason {
    pub fn describe(self) -> &'static str {
        match self {
            Self::TaskActualEndBackfill => "task actual end backfilled from milestone",
            Self::MilestoneStartMissing => "milestone has no actual start",
            Self::SystemANewer => "System-A modified more recently",
            Self::SystemBNewer => "System-B modified more recently",
            Self::ExplicitDirection => "mapping declares explicit direction",
        }
    }
}

/// Output instruction: update one field on one target system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingWrite {
    pub target: SystemId,
    pub field: FieldCategory,
    pub reason: WriteReason,
    pub mapping: MappingEntry,
    pub milestone_id: String,
    #[serde(default)]
    pub project_number: Option<String>,
    /// Canonical date being written.
    pub value: String,
    /// Value in the shape the target system accepts.
    pub payload_value: String,
    /// Raw value currently held by the target, for audit.
    #[serde(default)]
    pub old_value: Option<String>,
    #[serde(default)]
    pub system_a_value: Option<String>,
    #[serde(default)]
    pub system_b_value: Option<String>,
    #[serde(default)]
    pub requires_task_action: bool,
}

impl PendingWrite {
    /// Key used to partition batches: entity for System-A, project for System-B.
    pub fn group_key(&self) -> &str {
        match self.target {
            SystemId::SystemA => &self.mapping.task.entity_id,
            SystemId::SystemB => &self.mapping.milestone.project_id,
        }
    }

    /// Normalized value currently held by the target side.
    pub fn target_value(&self) -> Option<&str> {
        match self.target {
            SystemId::SystemA => self.system_a_value.as_deref(),
            SystemId::SystemB => self.system_b_value.as_deref(),
        }
    }
}

/// System-A "no data": absent, empty, or the `"null"` sentinel.
pub fn is_system_a_no_data(value: Option<&str>) -> bool {
    match value {
        None => true,
        Some(v) => v.is_empty() || v == SYSTEM_A_NULL_SENTINEL,
    }
}

/// System-B "no data": absent or empty.
pub fn is_system_b_no_data(value: Option<&str>) -> bool {
    value.map_or(true, str::is_empty)
}

pub fn is_no_data(system: SystemId, value: Option<&str>) -> bool {
    match system {
        SystemId::SystemA => is_system_a_no_data(value),
        SystemId::SystemB => is_system_b_no_data(value),
    }
}

/// Reduce a raw date from `system` to canonical `YYYY-MM-DD`.
///
/// Returns `None` ("unparseable") for no-data inputs and anything outside the system's
/// expected shapes. An already-canonical date is returned unchanged.
pub fn normalize_date(system: SystemId, raw: Option<&str>) -> Option<String> {
    parse_calendar_date(system, raw).map(|d| d.format(CANONICAL_DATE_FORMAT).to_string())
}

pub fn parse_calendar_date(system: SystemId, raw: Option<&str>) -> Option<NaiveDate> {
    if is_no_data(system, raw) {
        return None;
    }
    let raw = raw?.trim();

    if let Ok(date) = NaiveDate::parse_from_str(raw, CANONICAL_DATE_FORMAT) {
        return Some(date);
    }

    let formats = match system {
        SystemId::SystemA => SYSTEM_A_DATE_FORMATS,
        SystemId::SystemB => SYSTEM_B_DATE_FORMATS,
    };
    if let Some(ts) = formats
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
    {
        return Some(ts.date());
    }

    if system == SystemId::SystemB {
        return SYSTEM_B_OFFSET_FORMATS
            .iter()
            .find_map(|fmt| DateTime::<FixedOffset>::parse_from_str(raw, fmt).ok())
            .map(|ts| ts.date_naive());
    }
    None
}

/// Render a canonical date at 12:00:00 for systems that require timestamp-shaped values.
pub fn to_noon_timestamp(date: &str) -> Option<String> {
    let date = NaiveDate::parse_from_str(date.trim(), CANONICAL_DATE_FORMAT).ok()?;
    let noon = NaiveTime::from_hms_opt(12, 0, 0)?;
    Some(date.and_time(noon).format(WRITE_TIMESTAMP_FORMAT).to_string())
}

/// Parse a `last_modified_time` at full precision.
pub fn parse_modified_timestamp(raw: &str) -> Result<NaiveDateTime, chrono::ParseError> {
    NaiveDateTime::parse_from_str(raw.trim(), MODIFIED_TIMESTAMP_FORMAT)
}
