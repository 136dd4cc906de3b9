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

//! Events processed by the scheduler loop, in FIFO submission order.

use std::collections::HashMap;

use crate::block_manager::{BlockManagerId, ExecutorId};
use crate::dataset::{DatasetRef, ShuffleId};
use crate::job::{JobId, JobListenerRef, PartitionFuncRef, TaskOutput};
use crate::stage::StageId;
use crate::task::{AccumUpdate, Task, TaskInfo, TaskMetrics};

/// The sole way anything — callers, the task runner, internal timers —
/// mutates scheduler state.
pub enum SchedulerEvent {
    JobSubmitted {
        job_id: JobId,
        dataset: DatasetRef,
        func: PartitionFuncRef,
        partitions: Vec<usize>,
        call_site: String,
        listener: JobListenerRef,
        properties: HashMap<String, String>,
    },
    StageCancelled {
        stage_id: StageId,
    },
    JobCancelled {
        job_id: JobId,
    },
    JobGroupCancelled {
        group_id: String,
    },
    AllJobsCancelled,
    ExecutorAdded {
        executor_id: ExecutorId,
        host: String,
    },
    ExecutorLost {
        executor_id: ExecutorId,
    },
    TaskStarted {
        task: Task,
        info: TaskInfo,
    },
    TaskGettingResult {
        info: TaskInfo,
    },
    TaskCompleted(Box<CompletionEvent>),
    TaskSetFailed {
        stage_id: StageId,
        reason: String,
    },
    /// Fired by the debounce timer after fetch failures; drains
    /// `failed_stages` in one pass.
    ResubmitFailedStages,
}

/// Terminal outcome of one task attempt, reported by the task runner.
pub struct CompletionEvent {
    pub task: Task,
    pub reason: TaskEndReason,
    /// For successes: the `MapStatus` of a map task, or the computed value
    /// of a result task.
    pub result: Option<TaskOutput>,
    pub accum_updates: Vec<AccumUpdate>,
    pub info: TaskInfo,
    pub metrics: Option<TaskMetrics>,
}

#[derive(Clone, Debug)]
pub enum TaskEndReason {
    Success,
    /// The runner re-enqueued the attempt, e.g. after losing its executor
    /// before the result was fetched.
    Resubmitted,
    /// The task failed to read the map output of an earlier stage.
    FetchFailed {
        /// The block manager the fetch was issued against, when known.
        bm_address: Option<BlockManagerId>,
        shuffle_id: ShuffleId,
        /// The map partition whose output could not be read; `None` when the
        /// failure could not be pinned to one map output.
        map_index: Option<usize>,
        reduce_index: usize,
        message: String,
    },
    ExceptionFailure {
        description: String,
    },
    TaskResultLost,
    TaskCommitDenied,
    TaskKilled,
    ExecutorLost {
        executor_id: ExecutorId,
    },
}

impl TaskEndReason {
    pub fn is_success(&self) -> bool {
        matches!(self, TaskEndReason::Success)
    }
}
