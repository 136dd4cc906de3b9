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

use std::sync::Arc;

use thiserror::Error;

use crate::dataset::DatasetId;
use crate::job::JobId;
use crate::stage::StageId;

pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// A scheduler error shared among every job that failed for the same root
/// cause, e.g. all jobs depending on an aborted stage.
pub type SharedSchedulerError = Arc<SchedulerError>;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error(
        "partition index {partition} is out of range for dataset {dataset_id} \
         with {num_partitions} partitions"
    )]
    PartitionOutOfRange {
        dataset_id: DatasetId,
        partition: usize,
        num_partitions: usize,
    },

    #[error("failed to serialize the task closure of stage {stage_id}")]
    ClosureSerialization {
        stage_id: StageId,
        #[source]
        source: anyhow::Error,
    },

    #[error("job {job_id} cancelled: {reason}")]
    JobCancelled { job_id: JobId, reason: String },

    #[error("stage {stage_id} aborted: {reason}")]
    StageAborted { stage_id: StageId, reason: String },

    #[error("task set of stage {stage_id} failed: {reason}")]
    TaskSetFailed { stage_id: StageId, reason: String },

    #[error("the result handler of job {job_id} failed on partition {partition}")]
    ResultHandler {
        job_id: JobId,
        partition: usize,
        #[source]
        source: anyhow::Error,
    },

    #[error("scheduler is shutting down")]
    ContextShutdown,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl SchedulerError {
    pub fn into_shared(self) -> SharedSchedulerError {
        Arc::new(self)
    }
}
