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

use prometheus::core::{AtomicU64, GenericCounter};
use prometheus::{
    register_histogram_with_registry, register_int_counter_with_registry, Histogram, Registry,
};

pub type SchedulerMetricsRef = Arc<SchedulerMetrics>;

pub struct SchedulerMetrics {
    pub registry: Registry,

    pub job_submitted_count: GenericCounter<AtomicU64>,
    pub job_succeeded_count: GenericCounter<AtomicU64>,
    pub job_failed_count: GenericCounter<AtomicU64>,
    pub job_latency: Histogram,

    pub stage_submitted_count: GenericCounter<AtomicU64>,
    pub stage_completed_count: GenericCounter<AtomicU64>,
    pub stage_resubmitted_count: GenericCounter<AtomicU64>,
    pub stage_aborted_count: GenericCounter<AtomicU64>,

    pub task_launched_count: GenericCounter<AtomicU64>,
    pub fetch_failed_count: GenericCounter<AtomicU64>,
    pub stale_map_output_count: GenericCounter<AtomicU64>,
}

impl SchedulerMetrics {
    pub fn new(registry: Registry) -> Self {
        let job_submitted_count = register_int_counter_with_registry!(
            "scheduler_job_submitted_count",
            "total number of jobs submitted to the scheduler",
            &registry
        )
        .unwrap();
        let job_succeeded_count = register_int_counter_with_registry!(
            "scheduler_job_succeeded_count",
            "total number of jobs that completed successfully",
            &registry
        )
        .unwrap();
        let job_failed_count = register_int_counter_with_registry!(
            "scheduler_job_failed_count",
            "total number of jobs that failed or were cancelled",
            &registry
        )
        .unwrap();
        let job_latency = register_histogram_with_registry!(
            "scheduler_job_latency",
            "seconds between job submission and completion",
            &registry
        )
        .unwrap();

        let stage_submitted_count = register_int_counter_with_registry!(
            "scheduler_stage_submitted_count",
            "total number of stage attempts submitted to the task runner",
            &registry
        )
        .unwrap();
        let stage_completed_count = register_int_counter_with_registry!(
            "scheduler_stage_completed_count",
            "total number of stage attempts that finished",
            &registry
        )
        .unwrap();
        let stage_resubmitted_count = register_int_counter_with_registry!(
            "scheduler_stage_resubmitted_count",
            "total number of stages resubmitted after failures or lost outputs",
            &registry
        )
        .unwrap();
        let stage_aborted_count = register_int_counter_with_registry!(
            "scheduler_stage_aborted_count",
            "total number of stages aborted without retry",
            &registry
        )
        .unwrap();

        let task_launched_count = register_int_counter_with_registry!(
            "scheduler_task_launched_count",
            "total number of tasks handed to the task runner",
            &registry
        )
        .unwrap();
        let fetch_failed_count = register_int_counter_with_registry!(
            "scheduler_fetch_failed_count",
            "total number of shuffle fetch failures observed",
            &registry
        )
        .unwrap();
        let stale_map_output_count = register_int_counter_with_registry!(
            "scheduler_stale_map_output_count",
            "map outputs discarded because the reporting executor had failed",
            &registry
        )
        .unwrap();

        Self {
            registry,
            job_submitted_count,
            job_succeeded_count,
            job_failed_count,
            job_latency,
            stage_submitted_count,
            stage_completed_count,
            stage_resubmitted_count,
            stage_aborted_count,
            task_launched_count,
            fetch_failed_count,
            stale_map_output_count,
        }
    }

    /// Create a new `SchedulerMetrics` instance used in tests or other places.
    pub fn for_test() -> Self {
        Self::new(Registry::new())
    }
}
