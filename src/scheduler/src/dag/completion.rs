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

//! Interpretation of task outcomes: partition, stage and job state updates,
//! targeted recomputation, and job completion.

use std::time::Duration;

use thiserror_ext::AsReport;

use crate::block_manager::BlockManagerId;
use crate::dag::event::{CompletionEvent, SchedulerEvent, TaskEndReason};
use crate::dag::SchedulerCore;
use crate::dataset::ShuffleId;
use crate::error::SchedulerError;
use crate::job::TaskOutput;
use crate::listener::ListenerEvent;
use crate::map_output::MapStatus;
use crate::task::{ResultTask, ShuffleMapTask, Task};

impl SchedulerCore {
    pub(crate) fn handle_task_completion(&mut self, event: CompletionEvent) {
        let CompletionEvent {
            task,
            reason,
            result,
            accum_updates,
            info,
            metrics,
        } = event;
        let stage_id = task.stage_id();
        let partition = task.partition();

        // Failed outcomes are reported even for stages that are already
        // gone; successes only from within the success branch below.
        if !reason.is_success() {
            self.listener_bus.post(ListenerEvent::TaskEnded {
                stage_id,
                partition,
                successful: false,
                info: info.clone(),
                accum_updates: accum_updates.clone(),
                metrics: metrics.clone(),
            });
        }
        if !self.stages.contains_key(&stage_id) {
            // The stage was cleaned up, e.g. its job was cancelled or
            // aborted; drop the completion without touching job state.
            tracing::debug!(
                stage = stage_id,
                partition,
                "dropping task completion for a removed stage",
            );
            return;
        }

        match reason {
            TaskEndReason::Success => {
                self.listener_bus.post(ListenerEvent::TaskEnded {
                    stage_id,
                    partition,
                    successful: true,
                    info,
                    accum_updates,
                    metrics,
                });
                match task {
                    Task::ShuffleMap(task) => self.handle_map_task_success(task, result),
                    Task::Result(task) => self.handle_result_task_success(task, result),
                }
            }
            TaskEndReason::Resubmitted => {
                tracing::info!(
                    stage = stage_id,
                    partition,
                    "task will be re-run by the runner, marking pending again",
                );
                if let Some(stage) = self.stages.get_mut(&stage_id) {
                    stage.pending_partitions.insert(partition);
                }
            }
            TaskEndReason::FetchFailed {
                bm_address,
                shuffle_id,
                map_index,
                reduce_index,
                message,
            } => self.handle_fetch_failure(
                &task,
                bm_address,
                shuffle_id,
                map_index,
                reduce_index,
                message,
            ),
            // The runner owns per-task retries for these; terminal failure
            // arrives separately as a task-set failure.
            TaskEndReason::ExceptionFailure { description } => {
                tracing::debug!(
                    stage = stage_id,
                    partition,
                    description = %description,
                    "task failed with an exception, runner will retry",
                );
            }
            TaskEndReason::TaskResultLost
            | TaskEndReason::TaskCommitDenied
            | TaskEndReason::TaskKilled
            | TaskEndReason::ExecutorLost { .. } => {
                tracing::debug!(
                    stage = stage_id,
                    partition,
                    "non-terminal task failure, runner will retry",
                );
            }
        }
    }

    fn handle_map_task_success(&mut self, task: ShuffleMapTask, result: Option<TaskOutput>) {
        let status = match result.map(|r| r.downcast::<MapStatus>()) {
            Some(Ok(status)) => *status,
            Some(Err(_)) | None => {
                tracing::error!(
                    stage = task.stage_id,
                    partition = task.partition,
                    "map task success carried no map status, dropping",
                );
                return;
            }
        };
        let executor_id = status.location.executor_id.clone();

        let stale = self
            .failure_epochs
            .get(&executor_id)
            .is_some_and(|&failed_epoch| task.epoch <= failed_epoch);
        {
            let stage = self.stages.get_mut(&task.stage_id).unwrap();
            stage.pending_partitions.remove(&task.partition);
            if stale {
                tracing::info!(
                    stage = task.stage_id,
                    partition = task.partition,
                    executor = %executor_id,
                    epoch = task.epoch,
                    "ignoring possibly bogus map output from a failed executor",
                );
                self.metrics.stale_map_output_count.inc();
            } else {
                stage.add_output_loc(task.partition, status);
            }
        }

        let stage_done = self.running_stages.contains(&task.stage_id)
            && self.stages[&task.stage_id].pending_partitions.is_empty();
        if !stage_done {
            return;
        }

        self.mark_stage_finished(task.stage_id, None);
        let (shuffle_id, heads, available) = {
            let stage = &self.stages[&task.stage_id];
            (
                stage.shuffle_id().unwrap(),
                stage.output_heads(),
                stage.is_available(),
            )
        };
        tracing::info!(
            stage = task.stage_id,
            shuffle = shuffle_id,
            "map stage completed, registering outputs",
        );
        self.map_output.register_map_outputs(shuffle_id, heads, true);
        self.locality.cache().clear();

        if !available {
            // Some tasks reported success without usable output (e.g. on a
            // failed executor); run them again.
            tracing::info!(
                stage = task.stage_id,
                "resubmitting map stage, some partitions have no output",
            );
            self.metrics.stage_resubmitted_count.inc();
            self.submit_stage(task.stage_id);
        }
        // Stages waiting on this one are picked up by the post-event
        // `submit_waiting_stages` pass.
    }

    fn handle_result_task_success(&mut self, task: ResultTask, result: Option<TaskOutput>) {
        let job_id = {
            let stage = self.stages.get_mut(&task.stage_id).unwrap();
            stage.pending_partitions.remove(&task.partition);
            match stage.active_job() {
                Some(job_id) => job_id,
                None => {
                    tracing::info!(
                        stage = task.stage_id,
                        partition = task.partition,
                        "ignoring result task success, its job has already finished",
                    );
                    return;
                }
            }
        };
        let Some(result) = result else {
            tracing::error!(
                stage = task.stage_id,
                partition = task.partition,
                "result task success carried no result, dropping",
            );
            return;
        };

        let Some(job) = self.active_jobs.get_mut(&job_id) else {
            tracing::error!(job = job_id, "result stage is bound to a job that is not active");
            return;
        };
        if job.finished[task.output_index] {
            // A speculative or duplicated attempt delivered first.
            return;
        }
        job.finished[task.output_index] = true;
        job.num_finished += 1;
        let listener = job.listener.clone();
        let job_done = job.num_finished == job.partitions.len();

        if job_done {
            self.mark_stage_finished(task.stage_id, None);
            if let Some(job) = self.cleanup_state_for_job(job_id) {
                self.metrics
                    .job_latency
                    .observe(job.submitted_at.elapsed().as_secs_f64());
            }
            self.metrics.job_succeeded_count.inc();
            tracing::info!(job = job_id, "job finished");
            self.listener_bus.post(ListenerEvent::JobEnded {
                job_id,
                succeeded: true,
            });
        }

        if let Err(e) = listener.task_succeeded(task.output_index, result) {
            // Fail the job, but partitions already delivered stay delivered.
            let error = SchedulerError::ResultHandler {
                job_id,
                partition: task.output_index,
                source: e,
            }
            .into_shared();
            tracing::warn!(job = job_id, error = %error.as_report(), "result handler failed");
            listener.job_failed(&error);
        }
    }

    fn handle_fetch_failure(
        &mut self,
        task: &Task,
        bm_address: Option<BlockManagerId>,
        shuffle_id: ShuffleId,
        map_index: Option<usize>,
        reduce_index: usize,
        message: String,
    ) {
        self.metrics.fetch_failed_count.inc();
        let failed_stage_id = task.stage_id();

        let latest_attempt = self.stages[&failed_stage_id].latest_attempt_id();
        if latest_attempt != task.stage_attempt() {
            tracing::info!(
                stage = failed_stage_id,
                attempt = task.stage_attempt(),
                latest_attempt,
                "ignoring fetch failure from a superseded stage attempt",
            );
            return;
        }
        let Some(&map_stage_id) = self.shuffle_to_map_stage.get(&shuffle_id) else {
            tracing::error!(
                shuffle = shuffle_id,
                "fetch failure names a shuffle with no registered map stage",
            );
            return;
        };

        if self.running_stages.contains(&failed_stage_id) {
            self.mark_stage_finished(
                failed_stage_id,
                Some(format!(
                    "failed to fetch shuffle {} for reduce partition {}: {}",
                    shuffle_id, reduce_index, message
                )),
            );
        } else {
            tracing::debug!(
                stage = failed_stage_id,
                "fetch failure from a stage that is no longer running",
            );
        }

        if self.config.no_stage_retry {
            self.abort_stage(
                failed_stage_id,
                format!("fetch failure will not retry stage: {}", message),
                None,
            );
        } else {
            if self.failed_stages.is_empty() {
                // First failure of a burst arms the debounce timer; the
                // stages accumulated until it fires resubmit in one pass.
                tracing::info!(
                    failed_stage = failed_stage_id,
                    map_stage = map_stage_id,
                    resubmit_in_ms = self.config.resubmit_timeout_ms,
                    "resubmitting stages after fetch failure",
                );
                let tx = self.event_tx.clone();
                let timeout = Duration::from_millis(self.config.resubmit_timeout_ms);
                tokio::spawn(async move {
                    tokio::time::sleep(timeout).await;
                    let _ = tx.send(SchedulerEvent::ResubmitFailedStages);
                });
            }
            self.failed_stages.insert(failed_stage_id);
            self.failed_stages.insert(map_stage_id);
        }

        // Forget the lost output so only it is recomputed.
        if let (Some(map_index), Some(bm)) = (map_index, bm_address.as_ref()) {
            if let Some(stage) = self.stages.get_mut(&map_stage_id) {
                stage.remove_output_loc(map_index, bm);
            }
            self.map_output.unregister_map_output(shuffle_id, map_index, bm);
        }

        if let Some(bm) = bm_address {
            self.handle_executor_lost(&bm.executor_id, true, Some(task.epoch()));
        }
    }
}
