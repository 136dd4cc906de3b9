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

//! The driver-side stage scheduler of the eddy engine.
//!
//! A submitted job names a root [`dataset::Dataset`] and a function to apply
//! to a chosen set of its partitions. [`DagScheduler`] decomposes the job
//! into stages delimited by shuffle dependencies, submits ready stages as
//! task batches to the [`task_runner::TaskRunner`], tracks materialized
//! shuffle outputs and cached partition locations, recomputes the minimal
//! set of lost partitions after task, executor, or shuffle-fetch failures,
//! and reports job completion through a [`job::JobWaiter`].
//!
//! All scheduler state is mutated on a single event-loop task; callers
//! interact with it exclusively by enqueuing [`dag::SchedulerEvent`]s.

pub mod block_manager;
pub mod dag;
pub mod dataset;
pub mod error;
pub mod job;
pub mod listener;
pub mod map_output;
pub mod metrics;
pub mod stage;
pub mod task;
pub mod task_runner;

pub use dag::DagScheduler;
pub use error::{SchedulerError, SchedulerResult};
