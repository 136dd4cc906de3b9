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

//! The stage-oriented DAG scheduler.
//!
//! [`DagScheduler`] is the caller-side facade: it validates submissions,
//! allocates job ids and enqueues events. All scheduler state lives in
//! [`SchedulerCore`] and is mutated exclusively by the single event-loop
//! task, which makes every handler reviewable as sequential code. The task
//! runner reports back by enqueuing events through the same channel.

mod cache;
mod completion;
mod event;
mod locality;
mod recovery;
mod state;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub use cache::CacheLocationCache;
use eddy_common::config::SchedulerConfig;
pub use event::{CompletionEvent, SchedulerEvent, TaskEndReason};
use itertools::Itertools;
pub use locality::LocalityResolver;
use parking_lot::Mutex;
use thiserror_ext::AsReport;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use self::state::ActiveJob;
use crate::block_manager::{BlockManagerId, BlockManagerMasterRef, ExecutorId};
use crate::dataset::{DatasetRef, ShuffleId};
use crate::error::{SchedulerError, SchedulerResult, SharedSchedulerError};
use crate::job::{
    ApproximateEvaluator, ApproximateListener, JobId, JobResult, JobWaiter, PartialResult,
    PartitionFuncRef, ResultHandler,
};
use crate::listener::{ListenerBusRef, ListenerEvent};
use crate::map_output::MapOutputRegistryRef;
use crate::metrics::SchedulerMetricsRef;
use crate::stage::{Stage, StageId};
use crate::task::{
    ResultTask, ShuffleMapTask, Task, TaskBinary, TaskId, TaskInfo, TaskLocation, TaskMetrics,
    TaskSet,
};
use crate::task_runner::TaskRunnerRef;

/// All mutable scheduler state plus the collaborators the handlers drive.
/// Owned by the event-loop task; handlers take `&mut self`.
pub(crate) struct SchedulerCore {
    pub(crate) config: Arc<SchedulerConfig>,
    pub(crate) task_runner: TaskRunnerRef,
    pub(crate) map_output: MapOutputRegistryRef,
    pub(crate) block_manager: BlockManagerMasterRef,
    pub(crate) listener_bus: ListenerBusRef,
    pub(crate) metrics: SchedulerMetricsRef,
    pub(crate) locality: LocalityResolver,
    /// For self-scheduled events, e.g. the debounced resubmission pass.
    pub(crate) event_tx: UnboundedSender<SchedulerEvent>,

    pub(crate) next_stage_id: AtomicU32,
    pub(crate) stages: HashMap<StageId, Stage>,
    pub(crate) shuffle_to_map_stage: HashMap<ShuffleId, StageId>,
    pub(crate) job_to_stage_ids: HashMap<JobId, HashSet<StageId>>,
    pub(crate) active_jobs: HashMap<JobId, ActiveJob>,
    pub(crate) waiting_stages: HashSet<StageId>,
    pub(crate) running_stages: HashSet<StageId>,
    pub(crate) failed_stages: HashSet<StageId>,
    /// Per executor, the map-output epoch at which its failure was observed.
    /// Map outputs reported with an older epoch are discarded as stale.
    pub(crate) failure_epochs: HashMap<ExecutorId, u64>,

    pub(crate) any_task_started: Arc<AtomicBool>,
    pub(crate) first_task_set_submitted: Arc<AtomicBool>,
}

impl SchedulerCore {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: Arc<SchedulerConfig>,
        task_runner: TaskRunnerRef,
        map_output: MapOutputRegistryRef,
        block_manager: BlockManagerMasterRef,
        listener_bus: ListenerBusRef,
        metrics: SchedulerMetricsRef,
        locality: LocalityResolver,
        event_tx: UnboundedSender<SchedulerEvent>,
        any_task_started: Arc<AtomicBool>,
        first_task_set_submitted: Arc<AtomicBool>,
    ) -> Self {
        Self {
            config,
            task_runner,
            map_output,
            block_manager,
            listener_bus,
            metrics,
            locality,
            event_tx,
            next_stage_id: AtomicU32::new(0),
            stages: HashMap::new(),
            shuffle_to_map_stage: HashMap::new(),
            job_to_stage_ids: HashMap::new(),
            active_jobs: HashMap::new(),
            waiting_stages: HashSet::new(),
            running_stages: HashSet::new(),
            failed_stages: HashSet::new(),
            failure_epochs: HashMap::new(),
            any_task_started,
            first_task_set_submitted,
        }
    }

    /// Process one event. After every event, waiting stages whose parents
    /// have since completed are resubmitted.
    pub(crate) fn handle_event(&mut self, event: SchedulerEvent) {
        match event {
            SchedulerEvent::JobSubmitted {
                job_id,
                dataset,
                func,
                partitions,
                call_site,
                listener,
                properties,
            } => self.handle_job_submitted(
                job_id, dataset, func, partitions, call_site, listener, properties,
            ),
            SchedulerEvent::StageCancelled { stage_id } => self.handle_stage_cancellation(stage_id),
            SchedulerEvent::JobCancelled { job_id } => self.handle_job_cancellation(job_id, None),
            SchedulerEvent::JobGroupCancelled { group_id } => {
                self.handle_job_group_cancelled(&group_id)
            }
            SchedulerEvent::AllJobsCancelled => self.handle_all_jobs_cancelled(),
            SchedulerEvent::ExecutorAdded { executor_id, host } => {
                self.handle_executor_added(&executor_id, &host)
            }
            SchedulerEvent::ExecutorLost { executor_id } => {
                self.handle_executor_lost(&executor_id, false, None)
            }
            SchedulerEvent::TaskStarted { task, info } => self.handle_task_started(&task, info),
            SchedulerEvent::TaskGettingResult { info } => {
                self.listener_bus
                    .post(ListenerEvent::TaskGettingResult { info });
            }
            SchedulerEvent::TaskCompleted(completion) => self.handle_task_completion(*completion),
            SchedulerEvent::TaskSetFailed { stage_id, reason } => {
                self.handle_task_set_failed(stage_id, reason)
            }
            SchedulerEvent::ResubmitFailedStages => self.resubmit_failed_stages(),
        }
        self.submit_waiting_stages();
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_job_submitted(
        &mut self,
        job_id: JobId,
        dataset: DatasetRef,
        func: PartitionFuncRef,
        partitions: Vec<usize>,
        call_site: String,
        listener: crate::job::JobListenerRef,
        properties: HashMap<String, String>,
    ) {
        let num_outputs = partitions.len();
        let final_stage = match self.create_result_stage(dataset, partitions.clone(), job_id) {
            Ok(stage_id) => stage_id,
            Err(e) => {
                tracing::warn!(job = job_id, error = %e.as_report(), "failed to build the stage graph");
                self.metrics.job_failed_count.inc();
                listener.job_failed(&e.into_shared());
                return;
            }
        };
        // Cached locations recorded before this job may be stale.
        self.locality.cache().clear();

        tracing::info!(
            job = job_id,
            stage = final_stage,
            partitions = num_outputs,
            call_site = %call_site,
            "got job",
        );

        let job = ActiveJob {
            job_id,
            final_stage,
            finished: vec![false; num_outputs],
            num_finished: 0,
            partitions,
            func,
            listener,
            properties,
            call_site,
            submitted_at: Instant::now(),
        };
        self.stages
            .get_mut(&final_stage)
            .unwrap()
            .set_active_job(Some(job_id));
        self.active_jobs.insert(job_id, job);
        self.metrics.job_submitted_count.inc();

        let stage_ids = self
            .job_to_stage_ids
            .get(&job_id)
            .map(|stages| stages.iter().copied().sorted().collect())
            .unwrap_or_default();
        self.listener_bus
            .post(ListenerEvent::JobStarted { job_id, stage_ids });

        self.submit_stage(final_stage);
    }

    /// Submit a stage once its parents are available, otherwise submit the
    /// missing parents and park the stage in `waiting_stages`.
    pub(crate) fn submit_stage(&mut self, stage_id: StageId) {
        if !self.stages.contains_key(&stage_id) {
            return;
        }
        let Some(job_id) = self.earliest_active_job_of(stage_id) else {
            self.abort_stage(stage_id, "no active job for stage", None);
            return;
        };
        if self.waiting_stages.contains(&stage_id)
            || self.running_stages.contains(&stage_id)
            || self.failed_stages.contains(&stage_id)
        {
            return;
        }
        match self.missing_parent_stages(stage_id) {
            Ok(missing) if missing.is_empty() => {
                tracing::debug!(stage = stage_id, "submitting stage, no missing parents");
                self.submit_missing_tasks(stage_id, job_id);
            }
            Ok(missing) => {
                tracing::debug!(stage = stage_id, ?missing, "stage blocked on missing parents");
                for parent in missing {
                    self.submit_stage(parent);
                }
                self.waiting_stages.insert(stage_id);
            }
            Err(e) => {
                self.abort_stage(
                    stage_id,
                    format!("failed to resolve parent stages: {}", e.as_report()),
                    None,
                );
            }
        }
    }

    /// Re-attempt every waiting stage; the ones still blocked on parents put
    /// themselves back into the waiting set.
    pub(crate) fn submit_waiting_stages(&mut self) {
        if self.waiting_stages.is_empty() {
            return;
        }
        let waiting = std::mem::take(&mut self.waiting_stages);
        let ordered: Vec<StageId> = waiting
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
        for stage_id in ordered {
            self.submit_stage(stage_id);
        }
    }

    /// Build and dispatch one task per missing partition of the stage.
    fn submit_missing_tasks(&mut self, stage_id: StageId, job_id: JobId) {
        let (dataset, shuffle) = {
            let stage = self.stages.get_mut(&stage_id).unwrap();
            stage.pending_partitions.clear();
            (stage.dataset.clone(), stage.shuffle_dep().cloned())
        };

        // `(partition, output index)` pairs; the output index is only
        // meaningful for result tasks.
        let missing: Vec<(usize, usize)> = match &shuffle {
            Some(_) => self.stages[&stage_id]
                .missing_map_partitions()
                .into_iter()
                .map(|partition| (partition, partition))
                .collect(),
            None => {
                let job = &self.active_jobs[&job_id];
                job.partitions
                    .iter()
                    .enumerate()
                    .filter(|(output_index, _)| !job.finished[*output_index])
                    .map(|(output_index, &partition)| (partition, output_index))
                    .collect()
            }
        };
        if missing.is_empty() {
            tracing::debug!(stage = stage_id, "no missing partitions, marking finished");
            self.mark_stage_finished(stage_id, None);
            return;
        }

        let mut locations = Vec::with_capacity(missing.len());
        for (partition, _) in &missing {
            match self.locality.preferred_locations(&dataset, *partition) {
                Ok(locs) => locations.push(locs),
                Err(e) => {
                    self.abort_stage(
                        stage_id,
                        format!(
                            "failure computing preferred locations: {}",
                            e.as_report()
                        ),
                        None,
                    );
                    return;
                }
            }
        }

        // Serialize the closure once; every task of this attempt shares it.
        let binary = match &shuffle {
            Some(dep) => TaskBinary::for_shuffle_map(stage_id, dataset.id(), dep.shuffle_id()),
            None => self.active_jobs[&job_id]
                .func
                .encode()
                .map_err(|source| SchedulerError::ClosureSerialization { stage_id, source })
                .and_then(|bytes| TaskBinary::for_result(stage_id, dataset.id(), &bytes)),
        };
        let binary = match binary {
            Ok(binary) => binary,
            Err(e) => {
                let reason = format!("task serialization failed: {}", e.as_report());
                self.abort_stage(stage_id, reason, Some(e.into_shared()));
                return;
            }
        };

        let epoch = self.map_output.current_epoch();
        let attempt = self.stages.get_mut(&stage_id).unwrap().new_attempt_id();
        let tasks: Vec<Task> = missing
            .iter()
            .zip(locations)
            .map(|(&(partition, output_index), preferred_locations)| match &shuffle {
                Some(_) => Task::ShuffleMap(ShuffleMapTask {
                    stage_id,
                    stage_attempt: attempt,
                    partition,
                    binary: binary.clone(),
                    preferred_locations,
                    epoch,
                }),
                None => Task::Result(ResultTask {
                    stage_id,
                    stage_attempt: attempt,
                    partition,
                    output_index,
                    binary: binary.clone(),
                    preferred_locations,
                    epoch,
                }),
            })
            .collect();

        {
            let stage = self.stages.get_mut(&stage_id).unwrap();
            stage
                .pending_partitions
                .extend(missing.iter().map(|(partition, _)| *partition));
        }
        self.running_stages.insert(stage_id);

        tracing::info!(
            stage = stage_id,
            attempt,
            tasks = tasks.len(),
            "submitting task set",
        );
        // The stage-submitted event must precede any task-start event of
        // this attempt, so post before handing tasks to the runner.
        self.listener_bus.post(ListenerEvent::StageSubmitted {
            stage_id,
            attempt,
            num_tasks: tasks.len(),
        });
        self.metrics.stage_submitted_count.inc();
        self.metrics.task_launched_count.inc_by(tasks.len() as u64);

        let properties = self
            .active_jobs
            .get(&job_id)
            .map(|job| job.properties.clone())
            .unwrap_or_default();
        self.first_task_set_submitted.store(true, Ordering::Relaxed);
        self.task_runner.submit(TaskSet {
            stage_id,
            stage_attempt: attempt,
            job_id,
            tasks,
            properties,
        });
    }

    pub(crate) fn mark_stage_finished(&mut self, stage_id: StageId, failure: Option<String>) {
        let attempt = self
            .stages
            .get(&stage_id)
            .map(|stage| stage.latest_attempt_id())
            .unwrap_or(0);
        match &failure {
            None => tracing::info!(stage = stage_id, attempt, "stage finished"),
            Some(reason) => {
                tracing::info!(stage = stage_id, attempt, reason = %reason, "stage failed")
            }
        }
        self.running_stages.remove(&stage_id);
        self.metrics.stage_completed_count.inc();
        self.listener_bus.post(ListenerEvent::StageCompleted {
            stage_id,
            attempt,
            failure,
        });
    }

    fn handle_task_started(&mut self, task: &Task, info: TaskInfo) {
        self.any_task_started.store(true, Ordering::Relaxed);
        self.listener_bus.post(ListenerEvent::TaskStarted {
            stage_id: task.stage_id(),
            info,
        });
    }

    fn handle_task_set_failed(&mut self, stage_id: StageId, reason: String) {
        let error = SchedulerError::TaskSetFailed {
            stage_id,
            reason: reason.clone(),
        };
        self.abort_stage(stage_id, reason, Some(error.into_shared()));
    }

    fn handle_job_cancellation(&mut self, job_id: JobId, reason: Option<String>) {
        if !self.active_jobs.contains_key(&job_id) {
            tracing::debug!(job = job_id, "ignoring cancellation of unknown or finished job");
            return;
        }
        let reason = reason.unwrap_or_else(|| "cancelled by user".to_owned());
        tracing::info!(job = job_id, reason = %reason, "cancelling job");
        let error = SchedulerError::JobCancelled { job_id, reason }.into_shared();
        self.fail_job_and_independent_stages(job_id, &error);
    }

    fn handle_stage_cancellation(&mut self, stage_id: StageId) {
        let Some(stage) = self.stages.get(&stage_id) else {
            tracing::info!(stage = stage_id, "no active jobs to cancel for stage");
            return;
        };
        let jobs: Vec<JobId> = stage.job_ids.iter().copied().sorted().collect();
        for job_id in jobs {
            self.handle_job_cancellation(
                job_id,
                Some(format!("because stage {} was cancelled", stage_id)),
            );
        }
    }

    fn handle_job_group_cancelled(&mut self, group_id: &str) {
        let jobs: Vec<JobId> = self
            .active_jobs
            .values()
            .filter(|job| job.group_id() == Some(group_id))
            .map(|job| job.job_id)
            .sorted()
            .collect();
        if jobs.is_empty() {
            tracing::debug!(group = group_id, "no active jobs in cancelled job group");
            return;
        }
        for job_id in jobs {
            self.handle_job_cancellation(
                job_id,
                Some(format!("as part of cancelled job group {}", group_id)),
            );
        }
    }

    fn handle_all_jobs_cancelled(&mut self) {
        let jobs: Vec<JobId> = self.active_jobs.keys().copied().sorted().collect();
        for job_id in jobs {
            self.handle_job_cancellation(
                job_id,
                Some("as part of cancellation of all jobs".to_owned()),
            );
        }
    }

    /// Scheduler stop: fail every active job, end every running stage and
    /// release the task runner.
    pub(crate) fn on_stop(&mut self) {
        let job_ids: Vec<JobId> = self.active_jobs.keys().copied().sorted().collect();
        if !job_ids.is_empty() {
            tracing::info!(jobs = job_ids.len(), "failing active jobs on scheduler stop");
        }
        let error = SchedulerError::ContextShutdown.into_shared();
        for job_id in job_ids {
            let Some(job) = self.cleanup_state_for_job(job_id) else {
                continue;
            };
            self.metrics.job_failed_count.inc();
            job.listener.job_failed(&error);
            self.listener_bus.post(ListenerEvent::JobEnded {
                job_id,
                succeeded: false,
            });
        }
        let running: Vec<StageId> = self.running_stages.iter().copied().sorted().collect();
        for stage_id in running {
            self.mark_stage_finished(stage_id, Some("scheduler stopped".to_owned()));
        }
        self.task_runner.stop();
    }
}

struct SchedulerEventLoop {
    core: SchedulerCore,
    event_rx: UnboundedReceiver<SchedulerEvent>,
    shutdown_rx: oneshot::Receiver<()>,
}

impl SchedulerEventLoop {
    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;

                _ = &mut self.shutdown_rx => {
                    tracing::info!("scheduler event loop is stopped");
                    break;
                }
                event = self.event_rx.recv() => {
                    let Some(event) = event else { break };
                    self.core.handle_event(event);
                }
            }
        }
        self.core.on_stop();
    }
}

async fn starvation_watchdog(
    interval: Duration,
    first_task_set_submitted: Arc<AtomicBool>,
    any_task_started: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
) {
    loop {
        tokio::time::sleep(interval).await;
        if stopped.load(Ordering::Relaxed) || any_task_started.load(Ordering::Relaxed) {
            return;
        }
        if first_task_set_submitted.load(Ordering::Relaxed) {
            tracing::warn!(
                "task sets have been submitted but no task has started; \
                 check that workers are registered and have sufficient resources",
            );
        }
    }
}

/// Caller-side handle of the scheduler. Mutating entry points enqueue
/// events; blocking callers go through the returned [`JobWaiter`].
pub struct DagScheduler {
    event_tx: UnboundedSender<SchedulerEvent>,
    next_job_id: AtomicU64,
    locality: LocalityResolver,
    block_manager: BlockManagerMasterRef,
    listener_bus: ListenerBusRef,
    task_runner: TaskRunnerRef,
    stopped: Arc<AtomicBool>,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    join_handle: Mutex<Option<JoinHandle<()>>>,
}

impl DagScheduler {
    /// Spawns the event loop onto the current tokio runtime.
    pub fn new(
        config: SchedulerConfig,
        task_runner: TaskRunnerRef,
        map_output: MapOutputRegistryRef,
        block_manager: BlockManagerMasterRef,
        listener_bus: ListenerBusRef,
        metrics: SchedulerMetricsRef,
    ) -> Self {
        let config = Arc::new(config);
        let locality = LocalityResolver::new(
            config.clone(),
            CacheLocationCache::new(),
            block_manager.clone(),
            map_output.clone(),
        );
        let (event_tx, event_rx) = unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let any_task_started = Arc::new(AtomicBool::new(false));
        let first_task_set_submitted = Arc::new(AtomicBool::new(false));
        let stopped = Arc::new(AtomicBool::new(false));

        let core = SchedulerCore::new(
            config.clone(),
            task_runner.clone(),
            map_output,
            block_manager.clone(),
            listener_bus.clone(),
            metrics,
            locality.clone(),
            event_tx.clone(),
            any_task_started.clone(),
            first_task_set_submitted.clone(),
        );
        let join_handle = tokio::spawn(
            SchedulerEventLoop {
                core,
                event_rx,
                shutdown_rx,
            }
            .run(),
        );
        tokio::spawn(starvation_watchdog(
            Duration::from_millis(config.starvation_timeout_ms),
            first_task_set_submitted,
            any_task_started,
            stopped.clone(),
        ));

        Self {
            event_tx,
            next_job_id: AtomicU64::new(0),
            locality,
            block_manager,
            listener_bus,
            task_runner,
            stopped,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            join_handle: Mutex::new(Some(join_handle)),
        }
    }

    /// Submit a job over the given partitions of `dataset` and return
    /// without waiting. An empty partition list completes immediately and
    /// touches nothing else.
    pub fn submit_job(
        &self,
        dataset: &DatasetRef,
        func: PartitionFuncRef,
        partitions: Vec<usize>,
        call_site: impl Into<String>,
        handler: ResultHandler,
        properties: HashMap<String, String>,
    ) -> SchedulerResult<JobWaiter> {
        for &partition in &partitions {
            if partition >= dataset.num_partitions() {
                return Err(SchedulerError::PartitionOutOfRange {
                    dataset_id: dataset.id(),
                    partition,
                    num_partitions: dataset.num_partitions(),
                });
            }
        }
        let job_id = self.next_job_id.fetch_add(1, Ordering::Relaxed);
        let (waiter, listener) = JobWaiter::new(job_id, partitions.len(), handler);
        if partitions.is_empty() {
            return Ok(waiter);
        }
        self.event_tx
            .send(SchedulerEvent::JobSubmitted {
                job_id,
                dataset: dataset.clone(),
                func,
                partitions,
                call_site: call_site.into(),
                listener,
                properties,
            })
            .map_err(|_| SchedulerError::ContextShutdown)?;
        Ok(waiter)
    }

    /// Submit and block until the job completes.
    pub async fn run_job(
        &self,
        dataset: &DatasetRef,
        func: PartitionFuncRef,
        partitions: Vec<usize>,
        call_site: impl Into<String>,
        handler: ResultHandler,
        properties: HashMap<String, String>,
    ) -> JobResult {
        let waiter = self
            .submit_job(dataset, func, partitions, call_site, handler, properties)
            .map_err(SchedulerError::into_shared)?;
        waiter.await_completion().await
    }

    /// Run a job over every partition of `dataset`, returning the
    /// evaluator's value once all partitions report or `timeout` elapses,
    /// whichever comes first.
    pub async fn run_approximate_job<U, R, E>(
        &self,
        dataset: &DatasetRef,
        func: PartitionFuncRef,
        evaluator: E,
        call_site: impl Into<String>,
        timeout: Duration,
        properties: HashMap<String, String>,
    ) -> Result<PartialResult<R>, SharedSchedulerError>
    where
        U: Send + 'static,
        R: 'static,
        E: ApproximateEvaluator<U, R> + Send + 'static,
    {
        let partitions: Vec<usize> = (0..dataset.num_partitions()).collect();
        let evaluator = Arc::new(Mutex::new(evaluator));
        let (listener, done_rx) =
            ApproximateListener::<U, R, E>::new(evaluator.clone(), partitions.len());

        let job_id = self.next_job_id.fetch_add(1, Ordering::Relaxed);
        if !partitions.is_empty() {
            self.event_tx
                .send(SchedulerEvent::JobSubmitted {
                    job_id,
                    dataset: dataset.clone(),
                    func,
                    partitions,
                    call_site: call_site.into(),
                    listener,
                    properties,
                })
                .map_err(|_| SchedulerError::ContextShutdown.into_shared())?;
        }

        match tokio::time::timeout(timeout, done_rx).await {
            Ok(Ok(Ok(()))) => Ok(PartialResult {
                value: evaluator.lock().current_result(),
                is_final: true,
            }),
            Ok(Ok(Err(error))) => Err(error),
            Ok(Err(_)) => Err(SchedulerError::ContextShutdown.into_shared()),
            Err(_elapsed) => Ok(PartialResult {
                value: evaluator.lock().current_result(),
                is_final: false,
            }),
        }
    }

    pub fn cancel_job(&self, job_id: JobId) {
        self.post(SchedulerEvent::JobCancelled { job_id });
    }

    pub fn cancel_job_group(&self, group_id: impl Into<String>) {
        self.post(SchedulerEvent::JobGroupCancelled {
            group_id: group_id.into(),
        });
    }

    pub fn cancel_stage(&self, stage_id: StageId) {
        self.post(SchedulerEvent::StageCancelled { stage_id });
    }

    pub fn cancel_all_jobs(&self) {
        self.post(SchedulerEvent::AllJobsCancelled);
    }

    /// Kill a single task attempt, e.g. a superseded speculative copy.
    pub fn kill_task(&self, task_id: TaskId, executor_id: &ExecutorId, interrupt: bool) {
        self.task_runner.kill_task(task_id, executor_id, interrupt);
    }

    /// Forward an executor heartbeat: publishes the carried task metrics and
    /// relays liveness to the block manager. Returns `false` iff the block
    /// manager asks the executor to re-register.
    pub fn executor_heartbeat_received(
        &self,
        executor_id: &ExecutorId,
        task_metrics: Vec<(TaskId, TaskMetrics)>,
        block_manager_id: &BlockManagerId,
    ) -> bool {
        self.listener_bus.post(ListenerEvent::ExecutorMetrics {
            executor_id: executor_id.clone(),
            task_metrics,
        });
        self.block_manager.heartbeat(block_manager_id)
    }

    /// Preferred locations for one partition, resolvable from any thread.
    pub fn preferred_locations(
        &self,
        dataset: &DatasetRef,
        partition: usize,
    ) -> SchedulerResult<Vec<TaskLocation>> {
        self.locality.preferred_locations(dataset, partition)
    }

    // Inbound notifications from the task runner (§ external interface):
    // fire-and-forget enqueues.

    pub fn task_started(&self, task: Task, info: TaskInfo) {
        self.post(SchedulerEvent::TaskStarted { task, info });
    }

    pub fn task_getting_result(&self, info: TaskInfo) {
        self.post(SchedulerEvent::TaskGettingResult { info });
    }

    pub fn task_ended(&self, completion: CompletionEvent) {
        self.post(SchedulerEvent::TaskCompleted(Box::new(completion)));
    }

    pub fn task_set_failed(&self, stage_id: StageId, reason: impl Into<String>) {
        self.post(SchedulerEvent::TaskSetFailed {
            stage_id,
            reason: reason.into(),
        });
    }

    pub fn executor_lost(&self, executor_id: impl Into<ExecutorId>) {
        self.post(SchedulerEvent::ExecutorLost {
            executor_id: executor_id.into(),
        });
    }

    pub fn executor_added(&self, executor_id: impl Into<ExecutorId>, host: impl Into<String>) {
        self.post(SchedulerEvent::ExecutorAdded {
            executor_id: executor_id.into(),
            host: host.into(),
        });
    }

    /// Stop the event loop, failing all active jobs with a shutdown error.
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
        if let Some(tx) = self.shutdown_tx.lock().take() {
            let _ = tx.send(());
        }
        let join_handle = self.join_handle.lock().take();
        if let Some(join_handle) = join_handle {
            let _ = join_handle.await;
        }
    }

    fn post(&self, event: SchedulerEvent) {
        if self.event_tx.send(event).is_err() {
            tracing::warn!("scheduler event loop has stopped, dropping event");
        }
    }
}
