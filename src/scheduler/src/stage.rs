// Copyright 2023 RisingWave Labs
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Stages: maximal runs of narrow dependencies, cut at shuffle boundaries.
//!
//! A shuffle map stage materializes the map side of one shuffle and may be
//! shared by every job that reads it; a result stage is the terminal stage
//! of exactly one job.

use std::collections::HashSet;

use crate::block_manager::{BlockManagerId, ExecutorId};
use crate::dataset::{DatasetRef, ShuffleDependencyRef, ShuffleId};
use crate::job::JobId;
use crate::map_output::MapStatus;

pub type StageId = u32;
pub type AttemptId = u32;

pub struct Stage {
    pub id: StageId,
    pub dataset: DatasetRef,
    /// Number of tasks a full run of this stage needs: the dataset partition
    /// count for map stages, the job's selected partition count for result
    /// stages.
    pub num_tasks: usize,
    /// Parent shuffle-map stages, one per shuffle dependency reachable from
    /// `dataset` over narrow edges only.
    pub parents: Vec<StageId>,
    /// The job that caused this stage to be created. Used only to order
    /// stage submission deterministically.
    pub first_job_id: JobId,
    /// Every job that (transitively) depends on this stage.
    pub job_ids: HashSet<JobId>,
    /// Partitions dispatched in the current attempt and not yet observed
    /// successful.
    pub pending_partitions: HashSet<usize>,
    next_attempt: AttemptId,
    kind: StageKind,
}

enum StageKind {
    ShuffleMap {
        dep: ShuffleDependencyRef,
        /// Per map partition, the known locations of its output, most recent
        /// first. The head is authoritative.
        output_locs: Vec<Vec<MapStatus>>,
        num_available_outputs: usize,
    },
    Result {
        /// The partitions of `dataset` this job computes, in output order.
        partitions: Vec<usize>,
        /// The job bound to this stage; cleared when the job finishes.
        active_job: Option<JobId>,
    },
}

impl Stage {
    pub fn new_shuffle_map(
        id: StageId,
        dataset: DatasetRef,
        dep: ShuffleDependencyRef,
        first_job_id: JobId,
    ) -> Self {
        let num_tasks = dataset.num_partitions();
        Self {
            id,
            dataset,
            num_tasks,
            parents: vec![],
            first_job_id,
            job_ids: HashSet::new(),
            pending_partitions: HashSet::new(),
            next_attempt: 0,
            kind: StageKind::ShuffleMap {
                dep,
                output_locs: vec![vec![]; num_tasks],
                num_available_outputs: 0,
            },
        }
    }

    pub fn new_result(
        id: StageId,
        dataset: DatasetRef,
        partitions: Vec<usize>,
        job_id: JobId,
    ) -> Self {
        Self {
            id,
            dataset,
            num_tasks: partitions.len(),
            parents: vec![],
            first_job_id: job_id,
            job_ids: HashSet::new(),
            pending_partitions: HashSet::new(),
            next_attempt: 0,
            kind: StageKind::Result {
                partitions,
                active_job: None,
            },
        }
    }

    pub fn is_shuffle_map(&self) -> bool {
        matches!(self.kind, StageKind::ShuffleMap { .. })
    }

    pub fn shuffle_dep(&self) -> Option<&ShuffleDependencyRef> {
        match &self.kind {
            StageKind::ShuffleMap { dep, .. } => Some(dep),
            StageKind::Result { .. } => None,
        }
    }

    pub fn shuffle_id(&self) -> Option<ShuffleId> {
        self.shuffle_dep().map(|dep| dep.shuffle_id())
    }

    /// The partitions a result stage computes. Panics on map stages.
    pub fn result_partitions(&self) -> &[usize] {
        match &self.kind {
            StageKind::Result { partitions, .. } => partitions,
            StageKind::ShuffleMap { .. } => panic!("not a result stage"),
        }
    }

    pub fn active_job(&self) -> Option<JobId> {
        match &self.kind {
            StageKind::Result { active_job, .. } => *active_job,
            StageKind::ShuffleMap { .. } => None,
        }
    }

    pub fn set_active_job(&mut self, job_id: Option<JobId>) {
        match &mut self.kind {
            StageKind::Result { active_job, .. } => *active_job = job_id,
            StageKind::ShuffleMap { .. } => panic!("not a result stage"),
        }
    }

    /// A map stage is available once every partition has a known output
    /// location. Result stages are never "available": their progress lives
    /// in the job's completion bitmap.
    pub fn is_available(&self) -> bool {
        match &self.kind {
            StageKind::ShuffleMap {
                num_available_outputs,
                ..
            } => *num_available_outputs == self.num_tasks,
            StageKind::Result { .. } => false,
        }
    }

    pub fn num_available_outputs(&self) -> usize {
        match &self.kind {
            StageKind::ShuffleMap {
                num_available_outputs,
                ..
            } => *num_available_outputs,
            StageKind::Result { .. } => 0,
        }
    }

    /// Map partitions with no known output.
    pub fn missing_map_partitions(&self) -> Vec<usize> {
        match &self.kind {
            StageKind::ShuffleMap { output_locs, .. } => (0..self.num_tasks)
                .filter(|&p| output_locs[p].is_empty())
                .collect(),
            StageKind::Result { .. } => panic!("not a shuffle map stage"),
        }
    }

    pub fn add_output_loc(&mut self, partition: usize, status: MapStatus) {
        let StageKind::ShuffleMap {
            output_locs,
            num_available_outputs,
            ..
        } = &mut self.kind
        else {
            panic!("not a shuffle map stage");
        };
        let list = &mut output_locs[partition];
        if list.is_empty() {
            *num_available_outputs += 1;
        }
        list.insert(0, status);
    }

    /// Forget the output registered for `partition` at `location`, if any.
    pub fn remove_output_loc(&mut self, partition: usize, location: &BlockManagerId) {
        let StageKind::ShuffleMap {
            output_locs,
            num_available_outputs,
            ..
        } = &mut self.kind
        else {
            panic!("not a shuffle map stage");
        };
        let list = &mut output_locs[partition];
        let was_available = !list.is_empty();
        list.retain(|status| &status.location != location);
        if was_available && list.is_empty() {
            *num_available_outputs -= 1;
        }
    }

    /// Forget every output hosted by the given executor. Returns whether any
    /// location was dropped.
    pub fn remove_outputs_on_executor(&mut self, executor_id: &ExecutorId) -> bool {
        let StageKind::ShuffleMap {
            output_locs,
            num_available_outputs,
            ..
        } = &mut self.kind
        else {
            panic!("not a shuffle map stage");
        };
        let mut changed = false;
        for list in output_locs.iter_mut() {
            let was_available = !list.is_empty();
            let before = list.len();
            list.retain(|status| &status.location.executor_id != executor_id);
            changed |= list.len() != before;
            if was_available && list.is_empty() {
                *num_available_outputs -= 1;
            }
        }
        changed
    }

    /// The authoritative output location per map partition.
    pub fn output_heads(&self) -> Vec<Option<MapStatus>> {
        match &self.kind {
            StageKind::ShuffleMap { output_locs, .. } => output_locs
                .iter()
                .map(|list| list.first().cloned())
                .collect(),
            StageKind::Result { .. } => panic!("not a shuffle map stage"),
        }
    }

    /// Seed outputs recovered from the map-output registry, e.g. when a new
    /// job reuses a shuffle an earlier job already computed.
    pub fn seed_output_locs(&mut self, statuses: Vec<Option<MapStatus>>) {
        for (partition, status) in statuses.into_iter().enumerate() {
            if let Some(status) = status {
                self.add_output_loc(partition, status);
            }
        }
    }

    /// The id the next submission of this stage will run under.
    pub fn new_attempt_id(&mut self) -> AttemptId {
        let attempt = self.next_attempt;
        self.next_attempt += 1;
        attempt
    }

    /// The most recently issued attempt id; 0 before any attempt.
    pub fn latest_attempt_id(&self) -> AttemptId {
        self.next_attempt.saturating_sub(1)
    }
}

impl std::fmt::Debug for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.kind {
            StageKind::ShuffleMap { dep, .. } => format!("ShuffleMap({})", dep.shuffle_id()),
            StageKind::Result { active_job, .. } => format!("Result({:?})", active_job),
        };
        f.debug_struct("Stage")
            .field("id", &self.id)
            .field("kind", &kind)
            .field("num_tasks", &self.num_tasks)
            .field("parents", &self.parents)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::dataset::{Dataset, ShuffleDependency, StorageLevel};

    fn map_stage() -> Stage {
        let dataset = Arc::new(Dataset::new(1, "map-side", 3, vec![], StorageLevel::None));
        let dep = Arc::new(ShuffleDependency::new(0, dataset.clone()));
        Stage::new_shuffle_map(0, dataset, dep, 0)
    }

    fn status(executor: &str) -> MapStatus {
        MapStatus::new(
            BlockManagerId::new(executor, "host-a:7337".parse().unwrap()),
            vec![0; 2],
        )
    }

    #[test]
    fn test_output_loc_accounting() {
        let mut stage = map_stage();
        assert_eq!(stage.missing_map_partitions(), vec![0, 1, 2]);
        assert!(!stage.is_available());

        stage.add_output_loc(0, status("e1"));
        stage.add_output_loc(1, status("e1"));
        stage.add_output_loc(2, status("e2"));
        assert!(stage.is_available());
        assert_eq!(stage.num_available_outputs(), 3);

        // A second location for the same partition becomes the new head but
        // does not change availability.
        stage.add_output_loc(0, status("e3"));
        assert_eq!(stage.num_available_outputs(), 3);
        assert_eq!(
            stage.output_heads()[0].as_ref().unwrap().location.executor_id,
            "e3"
        );

        // Dropping the head falls back to the older location.
        stage.remove_output_loc(0, &status("e3").location);
        assert!(stage.is_available());
        assert_eq!(
            stage.output_heads()[0].as_ref().unwrap().location.executor_id,
            "e1"
        );

        stage.remove_outputs_on_executor(&"e1".to_owned());
        assert_eq!(stage.num_available_outputs(), 1);
        assert_eq!(stage.missing_map_partitions(), vec![0, 1]);
    }

    #[test]
    fn test_attempt_ids_are_monotonic() {
        let mut stage = map_stage();
        assert_eq!(stage.latest_attempt_id(), 0);
        assert_eq!(stage.new_attempt_id(), 0);
        assert_eq!(stage.new_attempt_id(), 1);
        assert_eq!(stage.latest_attempt_id(), 1);
    }
}
