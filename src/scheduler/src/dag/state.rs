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

//! Stage and job bookkeeping: the stage arena, the shuffle and job indices,
//! and the graph traversals that create and look up stages.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::time::Instant;

use itertools::Itertools;

use crate::dag::SchedulerCore;
use crate::dataset::{DatasetId, DatasetRef, Dependency, ShuffleDependencyRef};
use crate::error::SchedulerResult;
use crate::job::{
    JobId, JobListenerRef, PartitionFuncRef, INTERRUPT_ON_CANCEL_PROPERTY, JOB_GROUP_ID_PROPERTY,
};
use crate::stage::{Stage, StageId};

/// A submitted job whose result stage has not reached a terminal state.
pub(crate) struct ActiveJob {
    pub job_id: JobId,
    pub final_stage: StageId,
    /// Partitions of the root dataset this job computes, in output order.
    pub partitions: Vec<usize>,
    /// `finished[i]` is set once output index `i` has been delivered.
    pub finished: Vec<bool>,
    pub num_finished: usize,
    pub func: PartitionFuncRef,
    pub listener: JobListenerRef,
    pub properties: HashMap<String, String>,
    pub call_site: String,
    pub submitted_at: Instant,
}

impl ActiveJob {
    pub fn group_id(&self) -> Option<&str> {
        self.properties.get(JOB_GROUP_ID_PROPERTY).map(|s| s.as_str())
    }

    pub fn interrupt_on_cancel(&self) -> bool {
        self.properties
            .get(INTERRUPT_ON_CANCEL_PROPERTY)
            .is_some_and(|v| v == "true")
    }
}

impl SchedulerCore {
    fn alloc_stage_id(&self) -> StageId {
        self.next_stage_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Create the terminal stage of a job, creating any missing ancestor
    /// shuffle-map stages along the way.
    pub(crate) fn create_result_stage(
        &mut self,
        dataset: DatasetRef,
        partitions: Vec<usize>,
        job_id: JobId,
    ) -> SchedulerResult<StageId> {
        let parents = self.direct_parent_stages(&dataset, job_id);
        let stage_id = self.alloc_stage_id();
        let mut stage = Stage::new_result(stage_id, dataset, partitions, job_id);
        stage.parents = parents;
        self.stages.insert(stage_id, stage);
        self.update_job_stage_maps(job_id, stage_id);
        Ok(stage_id)
    }

    /// The shuffle-map stage writing `dep`, created on first use. Outputs
    /// already known to the map-output registry are adopted, so a shuffle
    /// computed by an earlier job is not recomputed.
    pub(crate) fn get_or_create_shuffle_map_stage(
        &mut self,
        dep: &ShuffleDependencyRef,
        first_job_id: JobId,
    ) -> StageId {
        if let Some(&stage_id) = self.shuffle_to_map_stage.get(&dep.shuffle_id()) {
            return stage_id;
        }
        // Register missing ancestor shuffles first, deepest first, so stage
        // ids grow from the leaves towards this stage.
        for ancestor in self
            .ancestor_shuffle_dependencies(dep.parent())
            .into_iter()
            .rev()
        {
            if !self
                .shuffle_to_map_stage
                .contains_key(&ancestor.shuffle_id())
            {
                self.new_shuffle_map_stage(&ancestor, first_job_id);
            }
        }
        self.new_shuffle_map_stage(dep, first_job_id)
    }

    fn new_shuffle_map_stage(&mut self, dep: &ShuffleDependencyRef, first_job_id: JobId) -> StageId {
        let dataset = dep.parent().clone();
        let parents = self.direct_parent_stages(&dataset, first_job_id);
        let stage_id = self.alloc_stage_id();
        let mut stage = Stage::new_shuffle_map(stage_id, dataset.clone(), dep.clone(), first_job_id);
        stage.parents = parents;

        let shuffle_id = dep.shuffle_id();
        if self.map_output.contains_shuffle(shuffle_id) {
            stage.seed_output_locs(self.map_output.map_outputs(shuffle_id));
            tracing::debug!(
                stage = stage_id,
                shuffle = shuffle_id,
                available = stage.num_available_outputs(),
                "adopted previously registered map outputs",
            );
        } else {
            self.map_output
                .register_shuffle(shuffle_id, dataset.num_partitions());
        }

        self.stages.insert(stage_id, stage);
        self.shuffle_to_map_stage.insert(shuffle_id, stage_id);
        self.update_job_stage_maps(first_job_id, stage_id);
        stage_id
    }

    /// One shuffle-map stage per distinct shuffle dependency reachable from
    /// `dataset` through narrow edges only.
    fn direct_parent_stages(&mut self, dataset: &DatasetRef, first_job_id: JobId) -> Vec<StageId> {
        let mut parents = Vec::new();
        let mut seen_shuffles = HashSet::new();
        let mut visited: HashSet<DatasetId> = HashSet::new();
        let mut stack = vec![dataset.clone()];
        while let Some(ds) = stack.pop() {
            if !visited.insert(ds.id()) {
                continue;
            }
            for dep in ds.dependencies() {
                match dep {
                    Dependency::Shuffle(shuffle) => {
                        if seen_shuffles.insert(shuffle.shuffle_id()) {
                            parents
                                .push(self.get_or_create_shuffle_map_stage(shuffle, first_job_id));
                        }
                    }
                    Dependency::Narrow(narrow) => stack.push(narrow.parent().clone()),
                }
            }
        }
        parents
    }

    /// Every shuffle dependency in the lineage of `dataset` that has no
    /// stage yet, descendants first.
    fn ancestor_shuffle_dependencies(&self, dataset: &DatasetRef) -> Vec<ShuffleDependencyRef> {
        let mut ancestors = Vec::new();
        let mut visited: HashSet<DatasetId> = HashSet::new();
        let mut stack = vec![dataset.clone()];
        while let Some(ds) = stack.pop() {
            if !visited.insert(ds.id()) {
                continue;
            }
            for dep in ds.dependencies() {
                match dep {
                    Dependency::Shuffle(shuffle) => {
                        if !self
                            .shuffle_to_map_stage
                            .contains_key(&shuffle.shuffle_id())
                        {
                            ancestors.push(shuffle.clone());
                        }
                        stack.push(shuffle.parent().clone());
                    }
                    Dependency::Narrow(narrow) => stack.push(narrow.parent().clone()),
                }
            }
        }
        ancestors
    }

    /// Ancestor stages of `stage_id` that still miss outputs, sorted by id
    /// for deterministic submission. Traversal stops at shuffle boundaries
    /// and at datasets whose partitions are all cached.
    pub(crate) fn missing_parent_stages(
        &mut self,
        stage_id: StageId,
    ) -> SchedulerResult<Vec<StageId>> {
        let (dataset, first_job_id) = {
            let stage = &self.stages[&stage_id];
            (stage.dataset.clone(), stage.first_job_id)
        };

        let mut missing = HashSet::new();
        let mut visited: HashSet<DatasetId> = HashSet::new();
        let mut stack = vec![dataset];
        while let Some(ds) = stack.pop() {
            if !visited.insert(ds.id()) {
                continue;
            }
            let cached = self
                .locality
                .cache()
                .locations_of(&ds, &*self.block_manager)?;
            let has_uncached_partition = cached.iter().any(|locations| locations.is_empty());
            if !has_uncached_partition {
                continue;
            }
            for dep in ds.dependencies() {
                match dep {
                    Dependency::Shuffle(shuffle) => {
                        let map_stage = self.get_or_create_shuffle_map_stage(shuffle, first_job_id);
                        if !self.stages[&map_stage].is_available() {
                            missing.insert(map_stage);
                        }
                    }
                    Dependency::Narrow(narrow) => stack.push(narrow.parent().clone()),
                }
            }
        }
        Ok(missing.into_iter().sorted().collect())
    }

    /// Tag `stage_id` and every ancestor not yet tagged with `job_id`.
    pub(crate) fn update_job_stage_maps(&mut self, job_id: JobId, stage_id: StageId) {
        let mut stack = vec![stage_id];
        while let Some(id) = stack.pop() {
            let Some(stage) = self.stages.get_mut(&id) else {
                continue;
            };
            if stage.job_ids.insert(job_id) {
                stack.extend(stage.parents.iter().copied());
                self.job_to_stage_ids.entry(job_id).or_default().insert(id);
            }
        }
    }

    /// The smallest job id that owns the stage and is still active.
    pub(crate) fn earliest_active_job_of(&self, stage_id: StageId) -> Option<JobId> {
        let stage = self.stages.get(&stage_id)?;
        stage
            .job_ids
            .iter()
            .copied()
            .filter(|job_id| self.active_jobs.contains_key(job_id))
            .min()
    }

    /// Whether `stage_id` transitively depends on `target` (or is it).
    pub(crate) fn stage_depends_on(&self, stage_id: StageId, target: StageId) -> bool {
        if stage_id == target {
            return true;
        }
        let mut visited = HashSet::new();
        let mut stack = vec![stage_id];
        while let Some(id) = stack.pop() {
            if !visited.insert(id) {
                continue;
            }
            if let Some(stage) = self.stages.get(&id) {
                if stage.parents.contains(&target) {
                    return true;
                }
                stack.extend(stage.parents.iter().copied());
            }
        }
        false
    }

    /// Untag every stage of a finished or failed job and drop the stages no
    /// remaining job references. Returns the removed job.
    pub(crate) fn cleanup_state_for_job(&mut self, job_id: JobId) -> Option<ActiveJob> {
        let stage_ids = self.job_to_stage_ids.remove(&job_id).unwrap_or_default();
        for stage_id in stage_ids.into_iter().sorted() {
            let Some(stage) = self.stages.get_mut(&stage_id) else {
                continue;
            };
            if !stage.job_ids.remove(&job_id) {
                tracing::error!(
                    stage = stage_id,
                    job = job_id,
                    "stage was indexed for a job it is not tagged with",
                );
            }
            if stage.job_ids.is_empty() {
                self.remove_stage(stage_id);
            }
        }

        let job = self.active_jobs.remove(&job_id);
        if let Some(job) = &job {
            // The result stage may survive if it was shared; unbind it.
            if let Some(stage) = self.stages.get_mut(&job.final_stage) {
                if stage.active_job() == Some(job_id) {
                    stage.set_active_job(None);
                }
            }
        }
        job
    }

    fn remove_stage(&mut self, stage_id: StageId) {
        tracing::debug!(stage = stage_id, "removing stage from all registries");
        if let Some(stage) = self.stages.remove(&stage_id) {
            if let Some(shuffle_id) = stage.shuffle_id() {
                self.shuffle_to_map_stage.remove(&shuffle_id);
            }
        }
        self.waiting_stages.remove(&stage_id);
        self.running_stages.remove(&stage_id);
        self.failed_stages.remove(&stage_id);
    }
}
