//! Grouping of pending writes into per-target batches and the pre-execution recheck.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tmsync_core::{normalize_date, FieldCategory, MilestoneRecord, PendingWrite, SystemId, TaskRecord};
use tracing::debug;

use crate::matcher::SnapshotIndex;

/// The two disjoint write collections produced by one classification pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingWrites {
    pub system_a: Vec<PendingWrite>,
    pub system_b: Vec<PendingWrite>,
}

impl PendingWrites {
    pub fn push(&mut self, write: PendingWrite) {
        match write.target {
            SystemId::SystemA => self.system_a.push(write),
            SystemId::SystemB => self.system_b.push(write),
        }
    }

    pub fn for_system(&self, system: SystemId) -> &[PendingWrite] {
        match system {
            SystemId::SystemA => &self.system_a,
            SystemId::SystemB => &self.system_b,
        }
    }

    pub fn len(&self) -> usize {
        self.system_a.len() + self.system_b.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Writes for one target system sharing a grouping key (entity on System-A, project on System-B).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteBatch {
    pub target: SystemId,
    pub group_key: String,
    pub writes: Vec<PendingWrite>,
}

impl WriteBatch {
    pub fn writes_for(&self, field: FieldCategory) -> impl Iterator<Item = &PendingWrite> {
        self.writes.iter().filter(move |w| w.field == field)
    }

    pub fn field_counts(&self) -> BTreeMap<FieldCategory, usize> {
        let mut counts = BTreeMap::new();
        for write in &self.writes {
            *counts.entry(write.field).or_default() += 1;
        }
        counts
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateBatches {
    pub system_a: Vec<WriteBatch>,
    pub system_b: Vec<WriteBatch>,
}

impl UpdateBatches {
    pub fn for_system(&self, system: SystemId) -> &[WriteBatch] {
        match system {
            SystemId::SystemA => &self.system_a,
            SystemId::SystemB => &self.system_b,
        }
    }

    pub fn write_count(&self, system: SystemId) -> usize {
        self.for_system(system).iter().map(|b| b.writes.len()).sum()
    }

    pub fn total_writes(&self) -> usize {
        self.write_count(SystemId::SystemA) + self.write_count(SystemId::SystemB)
    }

    pub fn is_empty(&self) -> bool {
        self.total_writes() == 0
    }
}

/// Partition one system's writes by grouping key. Groups come out in key order,
/// writes inside a group keep classification order.
pub fn group_writes(target: SystemId, writes: Vec<PendingWrite>) -> Vec<WriteBatch> {
    let mut groups: BTreeMap<String, Vec<PendingWrite>> = BTreeMap::new();
    for write in writes {
        groups.entry(write.group_key().to_string()).or_default().push(write);
    }
    groups
        .into_iter()
        .map(|(group_key, writes)| WriteBatch {
            target,
            group_key,
            writes,
        })
        .collect()
}

pub fn build_batches(pending: PendingWrites) -> UpdateBatches {
    UpdateBatches {
        system_a: group_writes(SystemId::SystemA, pending.system_a),
        system_b: group_writes(SystemId::SystemB, pending.system_b),
    }
}

/// Drops writes whose target already holds the value, judged against refreshed
/// snapshots when provided and against the classification-time value otherwise.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdempotenceFilter<'a> {
    system_a: Option<&'a [TaskRecord]>,
    system_b: Option<&'a [MilestoneRecord]>,
}

impl<'a> IdempotenceFilter<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_system_a(mut self, tasks: &'a [TaskRecord]) -> Self {
        self.system_a = Some(tasks);
        self
    }

    pub fn with_system_b(mut self, milestones: &'a [MilestoneRecord]) -> Self {
        self.system_b = Some(milestones);
        self
    }

    /// Normalized value the target holds right now, as far as this filter knows.
    pub fn current_value(&self, index: &SnapshotIndex<'_>, write: &PendingWrite) -> Option<String> {
        match write.target {
            SystemId::SystemA if self.system_a.is_some() => index
                .task(&write.mapping.task)
                .and_then(|r| normalize_date(SystemId::SystemA, r.field_value(write.field))),
            SystemId::SystemB if self.system_b.is_some() => index
                .milestone(&write.mapping.milestone)
                .and_then(|r| normalize_date(SystemId::SystemB, r.field_value(write.field))),
            _ => write.target_value().map(ToString::to_string),
        }
    }

    pub fn apply(&self, batches: UpdateBatches) -> UpdateBatches {
        let index = SnapshotIndex::new(
            self.system_a.unwrap_or_default(),
            self.system_b.unwrap_or_default(),
        );
        UpdateBatches {
            system_a: self.retain(&index, batches.system_a),
            system_b: self.retain(&index, batches.system_b),
        }
    }

    fn retain(&self, index: &SnapshotIndex<'_>, batches: Vec<WriteBatch>) -> Vec<WriteBatch> {
        batches
            .into_iter()
            .filter_map(|mut batch| {
                batch.writes.retain(|write| {
                    let current = self.current_value(index, write);
                    let differs = current.as_deref() != Some(write.value.as_str());
                    if !differs {
                        debug!(
                            target_system = %write.target,
                            field = %write.field,
                            group_key = write.group_key(),
                            value = write.value,
                            "dropping write already applied upstream"
                        );
                    }
                    differs
                });
                (!batch.writes.is_empty()).then_some(batch)
            })
            .collect()
    }
}
