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

//! Failure recovery: executor-loss epochs, the debounced resubmission of
//! fetch-failed stages, and stage abort with job fan-out.

use itertools::Itertools;
use thiserror_ext::AsReport;

use crate::block_manager::ExecutorId;
use crate::dag::SchedulerCore;
use crate::error::{SchedulerError, SharedSchedulerError};
use crate::job::JobId;
use crate::listener::ListenerEvent;
use crate::stage::StageId;

impl SchedulerCore {
    /// React to the loss of an executor. `fetch_failed` marks losses
    /// deduced from fetch failures: those invalidate the executor's shuffle
    /// files even when an external shuffle service would normally keep them.
    pub(crate) fn handle_executor_lost(
        &mut self,
        executor_id: &ExecutorId,
        fetch_failed: bool,
        maybe_epoch: Option<u64>,
    ) {
        let current_epoch = maybe_epoch.unwrap_or_else(|| self.map_output.current_epoch());
        let newly_failed = self
            .failure_epochs
            .get(executor_id)
            .map_or(true, |&failed_epoch| failed_epoch < current_epoch);
        if !newly_failed {
            tracing::debug!(
                executor = %executor_id,
                epoch = current_epoch,
                "additional loss report for an already failed executor",
            );
            return;
        }

        self.failure_epochs
            .insert(executor_id.clone(), current_epoch);
        tracing::info!(executor = %executor_id, epoch = current_epoch, "executor lost");
        self.block_manager.remove_executor(executor_id);
        self.listener_bus.post(ListenerEvent::ExecutorLost {
            executor_id: executor_id.clone(),
        });

        if fetch_failed || !self.block_manager.hosts_external_shuffle(executor_id) {
            // The executor's shuffle files are gone with it.
            let map_stage_ids: Vec<StageId> =
                self.shuffle_to_map_stage.values().copied().sorted().collect();
            if map_stage_ids.is_empty() {
                // Nothing to re-register, but reducers must still drop
                // cached output maps naming this executor.
                self.map_output.increment_epoch();
            } else {
                for stage_id in map_stage_ids {
                    let Some(stage) = self.stages.get_mut(&stage_id) else {
                        continue;
                    };
                    let changed = stage.remove_outputs_on_executor(executor_id);
                    let shuffle_id = stage.shuffle_id().unwrap();
                    let heads = stage.output_heads();
                    if changed {
                        tracing::info!(
                            stage = stage_id,
                            shuffle = shuffle_id,
                            "dropped map outputs hosted on the lost executor",
                        );
                    }
                    self.map_output.register_map_outputs(shuffle_id, heads, true);
                }
            }
            self.locality.cache().clear();
        }
    }

    /// A (re-)registered executor reports fresh results again.
    pub(crate) fn handle_executor_added(&mut self, executor_id: &ExecutorId, host: &str) {
        if self.failure_epochs.remove(executor_id).is_some() {
            tracing::info!(
                executor = %executor_id,
                host,
                "executor re-registered, forgetting its recorded failure",
            );
        }
        self.listener_bus.post(ListenerEvent::ExecutorAdded {
            executor_id: executor_id.clone(),
            host: host.to_owned(),
        });
    }

    /// Debounced callback draining `failed_stages` in one pass.
    pub(crate) fn resubmit_failed_stages(&mut self) {
        if self.failed_stages.is_empty() {
            return;
        }
        tracing::info!(stages = ?self.failed_stages, "resubmitting failed stages");
        self.locality.cache().clear();
        let failed: Vec<StageId> = std::mem::take(&mut self.failed_stages)
            .into_iter()
            .sorted_by_key(|stage_id| {
                let first_job = self
                    .stages
                    .get(stage_id)
                    .map(|stage| stage.first_job_id)
                    .unwrap_or(JobId::MAX);
                (first_job, *stage_id)
            })
            .collect();
        for stage_id in failed {
            self.metrics.stage_resubmitted_count.inc();
            self.submit_stage(stage_id);
        }
    }

    /// Terminally fail a stage and every active job depending on it. A
    /// stage that has already been cleaned up is ignored, so repeated fetch
    /// failures after an abort are no-ops.
    pub(crate) fn abort_stage(
        &mut self,
        stage_id: StageId,
        reason: impl Into<String>,
        error: Option<SharedSchedulerError>,
    ) {
        if !self.stages.contains_key(&stage_id) {
            return;
        }
        let reason = reason.into();
        tracing::warn!(stage = stage_id, reason = %reason, "aborting stage");
        self.metrics.stage_aborted_count.inc();

        let dependent_jobs: Vec<JobId> = self
            .active_jobs
            .values()
            .filter(|job| self.stage_depends_on(job.final_stage, stage_id))
            .map(|job| job.job_id)
            .sorted()
            .collect();

        if dependent_jobs.is_empty() {
            if self.running_stages.contains(&stage_id) {
                self.mark_stage_finished(stage_id, Some(reason));
            }
            tracing::info!(
                stage = stage_id,
                "ignoring stage failure, no active job depends on it",
            );
            return;
        }

        // Failing the dependent jobs cancels and ends the stage itself once
        // no other job holds it.
        let error = error
            .unwrap_or_else(|| SchedulerError::StageAborted { stage_id, reason }.into_shared());
        for job_id in dependent_jobs {
            self.fail_job_and_independent_stages(job_id, &error);
        }
    }

    /// Fail one job: kill the running stages no other job shares, clean up
    /// the job's state and notify its listener.
    pub(crate) fn fail_job_and_independent_stages(
        &mut self,
        job_id: JobId,
        error: &SharedSchedulerError,
    ) {
        let Some(job) = self.active_jobs.get(&job_id) else {
            return;
        };
        tracing::info!(
            job = job_id,
            call_site = %job.call_site,
            error = %error.as_report(),
            "failing job and its independent stages",
        );
        let should_interrupt = job.interrupt_on_cancel();

        let stage_ids: Vec<StageId> = self
            .job_to_stage_ids
            .get(&job_id)
            .map(|stages| stages.iter().copied().sorted().collect())
            .unwrap_or_default();
        for stage_id in stage_ids {
            let Some(stage) = self.stages.get(&stage_id) else {
                tracing::error!(job = job_id, stage = stage_id, "job references a missing stage");
                continue;
            };
            if !stage.job_ids.contains(&job_id) {
                tracing::error!(
                    job = job_id,
                    stage = stage_id,
                    "stage was indexed for a job it is not tagged with",
                );
                continue;
            }
            // A stage shared with another job keeps running for that job.
            if stage.job_ids.len() == 1 && self.running_stages.contains(&stage_id) {
                self.task_runner.cancel_tasks(stage_id, should_interrupt);
                self.mark_stage_finished(stage_id, Some(error.to_string()));
            }
        }

        if let Some(job) = self.cleanup_state_for_job(job_id) {
            self.metrics.job_failed_count.inc();
            self.metrics
                .job_latency
                .observe(job.submitted_at.elapsed().as_secs_f64());
            job.listener.job_failed(error);
            self.listener_bus.post(ListenerEvent::JobEnded {
                job_id,
                succeeded: false,
            });
        }
    }
}
