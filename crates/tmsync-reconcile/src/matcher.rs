//! Natural-key lookup of the records a mapping entry refers to.
//!
//! Both lookups are first-match-wins in snapshot order. Duplicate records for the same
//! key are ignored silently, so results depend on the order the snapshot was captured in.

use std::collections::HashMap;

use tmsync_core::{MappingEntry, MilestoneRecord, MilestoneRef, TaskRecord, TaskRef};

pub fn task_matches(task: &TaskRef, record: &TaskRecord) -> bool {
    record.project_id == task.project_id
        && record.entity_id == task.entity_id
        && record.module_id == task.module_id
        && record.task_name.to_lowercase() == task.task_name.to_lowercase()
}

pub fn milestone_matches(milestone: &MilestoneRef, record: &MilestoneRecord) -> bool {
    record.project_id == milestone.project_id && record.milestone_name == milestone.milestone_name
}

pub fn match_task<'a>(task: &TaskRef, records: &'a [TaskRecord]) -> Option<&'a TaskRecord> {
    records.iter().find(|r| task_matches(task, r))
}

pub fn match_milestone<'a>(
    milestone: &MilestoneRef,
    records: &'a [MilestoneRecord],
) -> Option<&'a MilestoneRecord> {
    records.iter().find(|r| milestone_matches(milestone, r))
}

#[derive(Debug, Clone, Copy)]
pub struct MatchedPair<'a> {
    pub task: Option<&'a TaskRecord>,
    pub milestone: Option<&'a MilestoneRecord>,
}

impl<'a> MatchedPair<'a> {
    pub fn both(&self) -> Option<(&'a TaskRecord, &'a MilestoneRecord)> {
        Some((self.task?, self.milestone?))
    }
}

type TaskKey = (String, String, String, String);
type MilestoneKey = (String, String);

fn task_key(project_id: &str, entity_id: &str, module_id: &str, task_name: &str) -> TaskKey {
    (
        project_id.to_string(),
        entity_id.to_string(),
        module_id.to_string(),
        task_name.to_lowercase(),
    )
}

/// Hash index over both snapshots with the same first-match-wins semantics as
/// [`match_task`] / [`match_milestone`].
#[derive(Debug)]
pub struct SnapshotIndex<'a> {
    tasks: HashMap<TaskKey, &'a TaskRecord>,
    milestones: HashMap<MilestoneKey, &'a MilestoneRecord>,
}

impl<'a> SnapshotIndex<'a> {
    pub fn new(tasks: &'a [TaskRecord], milestones: &'a [MilestoneRecord]) -> Self {
        let mut task_index = HashMap::with_capacity(tasks.len());
        for record in tasks {
            task_index
                .entry(task_key(
                    &record.project_id,
                    &record.entity_id,
                    &record.module_id,
                    &record.task_name,
                ))
                .or_insert(record);
        }

        let mut milestone_index = HashMap::with_capacity(milestones.len());
        for record in milestones {
            milestone_index
                .entry((record.project_id.clone(), record.milestone_name.clone()))
                .or_insert(record);
        }

        Self {
            tasks: task_index,
            milestones: milestone_index,
        }
    }

    pub fn task(&self, task: &TaskRef) -> Option<&'a TaskRecord> {
        self.tasks
            .get(&task_key(&task.project_id, &task.entity_id, &task.module_id, &task.task_name))
            .copied()
    }

    pub fn milestone(&self, milestone: &MilestoneRef) -> Option<&'a MilestoneRecord> {
        self.milestones
            .get(&(milestone.project_id.clone(), milestone.milestone_name.clone()))
            .copied()
    }

    pub fn match_mapping(&self, mapping: &MappingEntry) -> MatchedPair<'a> {
        MatchedPair {
            task: self.task(&mapping.task),
            milestone: self.milestone(&mapping.milestone),
        }
    }
}
