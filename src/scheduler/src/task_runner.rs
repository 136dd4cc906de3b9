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

//! Interface to the lower-level task runner, which places tasks on executors,
//! retries individual failures up to its budget, and reports outcomes back
//! to the scheduler by enqueuing events.

use std::sync::Arc;

use crate::block_manager::ExecutorId;
use crate::stage::StageId;
use crate::task::{TaskId, TaskSet};

pub type TaskRunnerRef = Arc<dyn TaskRunner>;

/// Only the scheduler event loop calls into this trait; implementations may
/// be freely multi-threaded internally.
pub trait TaskRunner: Send + Sync {
    /// Hand over one stage attempt's batch of tasks for execution.
    fn submit(&self, task_set: TaskSet);

    /// Kill the running tasks of a stage, e.g. on job cancellation.
    fn cancel_tasks(&self, stage_id: StageId, interrupt: bool);

    /// Kill one task attempt on a specific executor.
    fn kill_task(&self, task_id: TaskId, executor_id: &ExecutorId, interrupt: bool);

    /// Release runner resources; no completions are reported afterwards.
    fn stop(&self);
}
