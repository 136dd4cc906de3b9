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

//! Tasks: the unit of work the scheduler hands to the task runner, one per
//! missing partition of a submitted stage attempt.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::block_manager::ExecutorId;
use crate::dataset::{DatasetId, ShuffleId};
use crate::error::{SchedulerError, SchedulerResult};
use crate::job::JobId;
use crate::stage::{AttemptId, StageId};

/// Runner-assigned id of a single task attempt, unique across the
/// application.
pub type TaskId = u64;

/// A location a task prefers to run at, strongest form first.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub enum TaskLocation {
    /// Anywhere on the host.
    Host(String),
    /// The process that holds the data, e.g. a cached partition.
    Executor { host: String, executor_id: ExecutorId },
}

impl TaskLocation {
    pub fn host(&self) -> &str {
        match self {
            TaskLocation::Host(host) => host,
            TaskLocation::Executor { host, .. } => host,
        }
    }
}

/// The closure bytes shared by every task of one stage attempt. Serialized
/// once on the driver; workers fetch the bytes through this handle.
#[derive(Debug)]
pub struct TaskBinary {
    bytes: Bytes,
}

pub type TaskBinaryRef = Arc<TaskBinary>;

impl TaskBinary {
    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }
}

/// Wire form of a shuffle map task closure: which dataset to iterate and
/// which shuffle to write into.
#[derive(Serialize, Deserialize)]
struct ShuffleMapClosure {
    dataset_id: DatasetId,
    shuffle_id: ShuffleId,
}

/// Wire form of a result task closure: which dataset to iterate and the
/// encoded user function to apply.
#[derive(Serialize, Deserialize)]
struct ResultClosure {
    dataset_id: DatasetId,
    func: Vec<u8>,
}

impl TaskBinary {
    pub fn for_shuffle_map(
        stage_id: StageId,
        dataset_id: DatasetId,
        shuffle_id: ShuffleId,
    ) -> SchedulerResult<TaskBinaryRef> {
        let closure = ShuffleMapClosure {
            dataset_id,
            shuffle_id,
        };
        let bytes = bincode::serialize(&closure)
            .context("encode shuffle map closure")
            .map_err(|source| SchedulerError::ClosureSerialization { stage_id, source })?;
        Ok(Arc::new(TaskBinary {
            bytes: bytes.into(),
        }))
    }

    pub fn for_result(
        stage_id: StageId,
        dataset_id: DatasetId,
        func: &[u8],
    ) -> SchedulerResult<TaskBinaryRef> {
        let closure = ResultClosure {
            dataset_id,
            func: func.to_vec(),
        };
        let bytes = bincode::serialize(&closure)
            .context("encode result closure")
            .map_err(|source| SchedulerError::ClosureSerialization { stage_id, source })?;
        Ok(Arc::new(TaskBinary {
            bytes: bytes.into(),
        }))
    }
}

/// Produces shuffle output for one map partition.
#[derive(Clone, Debug)]
pub struct ShuffleMapTask {
    pub stage_id: StageId,
    pub stage_attempt: AttemptId,
    pub partition: usize,
    pub binary: TaskBinaryRef,
    pub preferred_locations: Vec<TaskLocation>,
    /// Map-output registry epoch at dispatch time. Results reported with an
    /// epoch at or below an observed executor failure are discarded.
    pub epoch: u64,
}

/// Computes the user function over one partition and delivers the value to
/// the driver.
#[derive(Clone, Debug)]
pub struct ResultTask {
    pub stage_id: StageId,
    pub stage_attempt: AttemptId,
    pub partition: usize,
    /// Offset of `partition` in the job's partition list; results are
    /// reported to the caller under this index.
    pub output_index: usize,
    pub binary: TaskBinaryRef,
    pub preferred_locations: Vec<TaskLocation>,
    pub epoch: u64,
}

#[derive(Clone, Debug)]
pub enum Task {
    ShuffleMap(ShuffleMapTask),
    Result(ResultTask),
}

impl Task {
    pub fn stage_id(&self) -> StageId {
        match self {
            Task::ShuffleMap(t) => t.stage_id,
            Task::Result(t) => t.stage_id,
        }
    }

    pub fn stage_attempt(&self) -> AttemptId {
        match self {
            Task::ShuffleMap(t) => t.stage_attempt,
            Task::Result(t) => t.stage_attempt,
        }
    }

    pub fn partition(&self) -> usize {
        match self {
            Task::ShuffleMap(t) => t.partition,
            Task::Result(t) => t.partition,
        }
    }

    pub fn epoch(&self) -> u64 {
        match self {
            Task::ShuffleMap(t) => t.epoch,
            Task::Result(t) => t.epoch,
        }
    }
}

/// One batch of tasks submitted to the task runner: every still-missing
/// partition of a single stage attempt.
#[derive(Clone, Debug)]
pub struct TaskSet {
    pub stage_id: StageId,
    pub stage_attempt: AttemptId,
    /// The job this submission runs under; used by the runner for pooling
    /// and priorities.
    pub job_id: JobId,
    pub tasks: Vec<Task>,
    pub properties: HashMap<String, String>,
}

/// Runner-reported details of one task attempt.
#[derive(Clone, Debug)]
pub struct TaskInfo {
    pub task_id: TaskId,
    pub executor_id: ExecutorId,
    pub host: String,
}

/// Execution metrics of a finished task, forwarded to the listener bus.
#[derive(Clone, Debug, Default)]
pub struct TaskMetrics {
    pub run_time_ms: u64,
    pub result_size_bytes: u64,
}

/// An opaque accumulator delta reported by a task. The scheduler forwards
/// these with task-end telemetry and never interprets them.
#[derive(Clone, Debug)]
pub struct AccumUpdate {
    pub id: u64,
    pub delta: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_binary_round_trip() {
        let binary = TaskBinary::for_shuffle_map(3, 7, 11).unwrap();
        let closure: ShuffleMapClosure = bincode::deserialize(binary.bytes()).unwrap();
        assert_eq!(closure.dataset_id, 7);
        assert_eq!(closure.shuffle_id, 11);

        let binary = TaskBinary::for_result(4, 9, b"fn-bytes").unwrap();
        let closure: ResultClosure = bincode::deserialize(binary.bytes()).unwrap();
        assert_eq!(closure.dataset_id, 9);
        assert_eq!(closure.func, b"fn-bytes");
    }
}
