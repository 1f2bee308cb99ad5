//! Record and mapping builders shared by the unit tests.

use tmsync_core::{
    MappingEntry, MilestoneRecord, MilestoneRef, ReconciliationCandidate, TaskRecord, TaskRef,
};

pub(crate) const A_EARLY: &str = "2024-01-01 10:00:00.000000";
pub(crate) const B_LATE: &str = "2024-01-02 09:00:00.000000";

pub(crate) fn task(project: &str, entity: &str, module: &str, name: &str) -> TaskRecord {
    TaskRecord {
        project_id: project.into(),
        entity_id: entity.into(),
        module_id: module.into(),
        task_id: None,
        task_name: name.into(),
        actual_start_time: None,
        actual_end_time: None,
        planned_start_time: None,
        planned_end_time: None,
        last_modified_time: A_EARLY.into(),
        current_owner_name: None,
        assignee_user_name: None,
    }
}

pub(crate) fn milestone(project: &str, name: &str) -> MilestoneRecord {
    MilestoneRecord {
        project_id: project.into(),
        milestone_id: "MS-1".into(),
        milestone_name: name.into(),
        project_number: Some("PN-1".into()),
        actual_start_time: None,
        actual_end_time: None,
        planned_start_time: None,
        last_modified_time: B_LATE.into(),
    }
}

/// Peer forecast mapping between task P1/E1/M1 and a milestone on project SP1.
pub(crate) fn mapping(task_name: &str, milestone_name: &str) -> MappingEntry {
    MappingEntry {
        task: TaskRef {
            customer_name: "Acme".into(),
            project_id: "P1".into(),
            entity_id: "E1".into(),
            module_id: "M1".into(),
            task_name: task_name.into(),
            ..TaskRef::default()
        },
        milestone: MilestoneRef {
            project_id: "SP1".into(),
            milestone_name: milestone_name.into(),
            ..MilestoneRef::default()
        },
        source_field: None,
        target_field: "Forecast Start Date".into(),
        source: "System-A".into(),
        target: "System-A".into(),
    }
}

pub(crate) fn candidate(
    source: &str,
    target: &str,
    target_field: &str,
    task_type: &str,
) -> ReconciliationCandidate {
    let mut mapping = mapping("Site Survey", "Survey Complete");
    mapping.source = source.into();
    mapping.target = target.into();
    mapping.target_field = target_field.into();
    mapping.task.task_type = task_type.into();
    ReconciliationCandidate {
        mapping_index: 0,
        mapping,
        system_a: task("P1", "E1", "M1", "Site Survey"),
        system_b: milestone("SP1", "Survey Complete"),
    }
}

pub(crate) fn peer_candidate(target_field: &str, task_type: &str) -> ReconciliationCandidate {
    candidate("System-A", "System-A", target_field, task_type)
}
