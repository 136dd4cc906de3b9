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

//! Telemetry fan-out. Listener events are informational only: a failing or
//! panicking listener is logged and never affects scheduling.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::block_manager::ExecutorId;
use crate::job::JobId;
use crate::stage::{AttemptId, StageId};
use crate::task::{AccumUpdate, TaskId, TaskInfo, TaskMetrics};

pub type ListenerBusRef = Arc<ListenerBus>;

/// Scheduler telemetry, in emission order per entity.
#[derive(Clone, Debug)]
pub enum ListenerEvent {
    JobStarted {
        job_id: JobId,
        stage_ids: Vec<StageId>,
    },
    JobEnded {
        job_id: JobId,
        succeeded: bool,
    },
    StageSubmitted {
        stage_id: StageId,
        attempt: AttemptId,
        num_tasks: usize,
    },
    StageCompleted {
        stage_id: StageId,
        attempt: AttemptId,
        failure: Option<String>,
    },
    TaskStarted {
        stage_id: StageId,
        info: TaskInfo,
    },
    TaskGettingResult {
        info: TaskInfo,
    },
    TaskEnded {
        stage_id: StageId,
        partition: usize,
        successful: bool,
        info: TaskInfo,
        accum_updates: Vec<AccumUpdate>,
        metrics: Option<TaskMetrics>,
    },
    ExecutorAdded {
        executor_id: ExecutorId,
        host: String,
    },
    ExecutorLost {
        executor_id: ExecutorId,
    },
    ExecutorMetrics {
        executor_id: ExecutorId,
        task_metrics: Vec<(TaskId, TaskMetrics)>,
    },
}

pub trait SchedulerListener: Send + Sync {
    fn on_event(&self, event: &ListenerEvent);
}

/// Delivers each posted event to every registered listener, isolating the
/// scheduler from listener misbehavior.
#[derive(Default)]
pub struct ListenerBus {
    listeners: RwLock<Vec<Arc<dyn SchedulerListener>>>,
}

impl ListenerBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, listener: Arc<dyn SchedulerListener>) {
        self.listeners.write().push(listener);
    }

    pub fn post(&self, event: ListenerEvent) {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener.on_event(&event))).is_err() {
                tracing::warn!(?event, "scheduler listener panicked, event dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;

    struct Panicking;

    impl SchedulerListener for Panicking {
        fn on_event(&self, _: &ListenerEvent) {
            panic!("listener bug")
        }
    }

    #[derive(Default)]
    struct Counting {
        seen: Mutex<usize>,
    }

    impl SchedulerListener for Counting {
        fn on_event(&self, _: &ListenerEvent) {
            *self.seen.lock() += 1;
        }
    }

    #[test]
    fn test_panicking_listener_does_not_poison_the_bus() {
        let bus = ListenerBus::new();
        let counting = Arc::new(Counting::default());
        bus.register(Arc::new(Panicking));
        bus.register(counting.clone());

        bus.post(ListenerEvent::JobStarted {
            job_id: 1,
            stage_ids: vec![0],
        });
        bus.post(ListenerEvent::JobEnded {
            job_id: 1,
            succeeded: true,
        });

        // The panicking listener never prevented delivery to the next one.
        assert_eq!(*counting.seen.lock(), 2);
    }
}
