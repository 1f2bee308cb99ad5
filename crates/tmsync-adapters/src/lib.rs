//! Flattening of raw per-system exports into reconciliation records.

use anyhow::Context;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tmsync_core::{MilestoneRecord, SystemId, TaskRecord};
use tracing::debug;

pub const CRATE_NAME: &str = "tmsync-adapters";

/// Length of `YYYY-MM-DD HH:MM:SS.fff`.
const MODIFIED_TIMESTAMP_LEN: usize = 23;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{system} export is missing `{field}` at record {index}")]
    MissingField {
        system: SystemId,
        index: usize,
        field: &'static str,
    },
    #[error("{system} export is not shaped as expected: {message}")]
    Shape { system: SystemId, message: String },
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Converts one system's raw export document into flattened records.
pub trait RecordFlattener: Send + Sync {
    type Record;

    fn system(&self) -> SystemId;
    fn flatten(&self, raw: &JsonValue) -> Result<Vec<Self::Record>, AdapterError>;
}

/// System-A export: a list of task-detail lookups, each the request ids plus the response body.
///
/// ```json
/// {"task_details": [{"request": {"project_id": "..", "entity_id": "..", "module_id": "..",
///   "task_id": "..", "task_name": ".."}, "response": {"name": "..", "modifiedTime": ".."}}]}
/// ```
#[derive(Debug, Default, Clone, Copy)]
pub struct TaskDetailFlattener;

impl RecordFlattener for TaskDetailFlattener {
    type Record = TaskRecord;

    fn system(&self) -> SystemId {
        SystemId::SystemA
    }

    fn flatten(&self, raw: &JsonValue) -> Result<Vec<TaskRecord>, AdapterError> {
        let system = self.system();
        let details = raw
            .get("task_details")
            .and_then(JsonValue::as_array)
            .ok_or_else(|| AdapterError::Shape {
                system,
                message: "expected a `task_details` array".to_string(),
            })?;

        let mut records = Vec::with_capacity(details.len());
        for (index, detail) in details.iter().enumerate() {
            let request = detail.get("request").unwrap_or(&JsonValue::Null);
            let Some(response) = detail.get("response").filter(|r| r.is_object()) else {
                debug!(index, "skipping task detail without response body");
                continue;
            };
            if response.get("errorMessage").is_some() {
                debug!(index, error = ?json_str(response, &["errorMessage"]), "skipping failed task detail");
                continue;
            }

            let required = |value: &JsonValue, path: &[&str], field: &'static str| {
                json_str(value, path)
                    .map(ToString::to_string)
                    .ok_or(AdapterError::MissingField {
                        system,
                        index,
                        field,
                    })
            };

            let task_name = json_str(response, &["name"])
                .or_else(|| json_str(request, &["task_name"]))
                .map(ToString::to_string)
                .ok_or(AdapterError::MissingField {
                    system,
                    index,
                    field: "name",
                })?;

            records.push(TaskRecord {
                project_id: required(request, &["project_id"], "project_id")?,
                entity_id: required(request, &["entity_id"], "entity_id")?,
                module_id: required(request, &["module_id"], "module_id")?,
                task_id: json_str(request, &["task_id"]).map(ToString::to_string),
                task_name,
                actual_start_time: json_opt_string(response, "actualStartTime"),
                actual_end_time: json_opt_string(response, "actualEndTime"),
                planned_start_time: json_opt_string(response, "plannedStartTime"),
                planned_end_time: json_opt_string(response, "plannedEndTime"),
                last_modified_time: required(response, &["modifiedTime"], "modifiedTime")?,
                current_owner_name: json_opt_string(response, "currentOwnerName"),
                assignee_user_name: json_opt_string(response, "assigneeUserName"),
            });
        }
        Ok(records)
    }
}

/// System-B export: a milestone query result.
///
/// ```json
/// {"total_size": 1, "records": [{"id": "..", "name": "..", "project_id": "..",
///   "project": {"number": ".."}, "actual_date": null, "forecast_date": "2024-01-06",
///   "last_modified_date": "2024-01-02T09:00:00.000+0000"}]}
/// ```
#[derive(Debug, Default, Clone, Copy)]
pub struct MilestoneQueryFlattener;

impl RecordFlattener for MilestoneQueryFlattener {
    type Record = MilestoneRecord;

    fn system(&self) -> SystemId {
        SystemId::SystemB
    }

    fn flatten(&self, raw: &JsonValue) -> Result<Vec<MilestoneRecord>, AdapterError> {
        let system = self.system();
        if raw.get("total_size").and_then(JsonValue::as_u64) == Some(0) {
            return Ok(Vec::new());
        }
        let rows = raw
            .get("records")
            .and_then(JsonValue::as_array)
            .ok_or_else(|| AdapterError::Shape {
                system,
                message: "expected a `records` array".to_string(),
            })?;

        rows.iter()
            .enumerate()
            .map(|(index, row)| -> Result<MilestoneRecord, AdapterError> {
                let required = |field: &'static str| {
                    json_str(row, &[field])
                        .map(ToString::to_string)
                        .ok_or(AdapterError::MissingField {
                            system,
                            index,
                            field,
                        })
                };
                Ok(MilestoneRecord {
                    project_id: required("project_id")?,
                    milestone_id: required("id")?,
                    milestone_name: required("name")?,
                    project_number: json_str(row, &["project", "number"]).map(ToString::to_string),
                    actual_start_time: json_opt_string(row, "actual_start_date"),
                    actual_end_time: json_opt_string(row, "actual_date"),
                    planned_start_time: json_opt_string(row, "forecast_date"),
                    last_modified_time: normalize_modified_timestamp(&required("last_modified_date")?),
                })
            })
            .collect()
    }
}

/// Rewrite an ISO `LastModifiedDate` (`2024-01-02T09:00:00.000+0000`) into the
/// millisecond-precision shape both systems' freshness comparison expects.
pub fn normalize_modified_timestamp(iso: &str) -> String {
    iso.replacen('T', " ", 1)
        .chars()
        .take(MODIFIED_TIMESTAMP_LEN)
        .collect()
}

pub fn flatten_system_a_export(raw: &JsonValue) -> Result<Vec<TaskRecord>, AdapterError> {
    TaskDetailFlattener.flatten(raw)
}

pub fn flatten_system_b_export(raw: &JsonValue) -> Result<Vec<MilestoneRecord>, AdapterError> {
    MilestoneQueryFlattener.flatten(raw)
}

pub fn parse_export(text: &str, system: SystemId) -> Result<JsonValue, AdapterError> {
    let value: JsonValue = serde_json::from_str(text).with_context(|| format!("parsing raw {system} export"))?;
    Ok(value)
}

/// Parse one raw export document and flatten it with `flattener`.
pub fn flatten_export<F: RecordFlattener>(flattener: &F, text: &str) -> Result<Vec<F::Record>, AdapterError> {
    let raw = parse_export(text, flattener.system())?;
    let records = flattener.flatten(&raw)?;
    debug!(system = %flattener.system(), records = records.len(), "flattened raw export");
    Ok(records)
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_str()
}

/// JSON `null`/missing become `None`; strings (including `"null"`) are kept verbatim.
fn json_opt_string(value: &JsonValue, key: &str) -> Option<String> {
    match value.get(key)? {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}
