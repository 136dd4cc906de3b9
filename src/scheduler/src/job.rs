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

//! Caller-side job handles: the blocking [`JobWaiter`] and the listener
//! plumbing through which the scheduler reports per-partition results.

use std::any::Any;
use std::marker::PhantomData;
use std::sync::Arc;

use anyhow::anyhow;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{SchedulerError, SharedSchedulerError};

pub type JobId = u64;

/// Property key grouping jobs for [`crate::DagScheduler::cancel_job_group`].
pub const JOB_GROUP_ID_PROPERTY: &str = "scheduler.job_group_id";
/// Property key: interrupt task threads when cancelling the job's stages.
pub const INTERRUPT_ON_CANCEL_PROPERTY: &str = "scheduler.interrupt_on_cancel";

/// A deserialized task result. The scheduler never looks inside; result
/// handlers and evaluators downcast it to the job's concrete result type.
pub type TaskOutput = Box<dyn Any + Send>;

/// Invoked once per output index with the partition's result.
pub type ResultHandler = Box<dyn FnMut(usize, TaskOutput) -> anyhow::Result<()> + Send>;

pub type JobResult = Result<(), SharedSchedulerError>;

/// The user function a job applies to each of its partitions, in a form the
/// driver can ship to workers. The scheduler never invokes it; it only
/// encodes it into the broadcast task closure.
pub trait PartitionFunc: Send + Sync + std::fmt::Debug {
    fn encode(&self) -> anyhow::Result<Bytes>;
}

pub type PartitionFuncRef = Arc<dyn PartitionFunc>;

/// A [`PartitionFunc`] that was serialized ahead of time.
#[derive(Debug)]
pub struct EncodedPartitionFunc(Bytes);

impl EncodedPartitionFunc {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }
}

impl PartitionFunc for EncodedPartitionFunc {
    fn encode(&self) -> anyhow::Result<Bytes> {
        Ok(self.0.clone())
    }
}

/// How the scheduler reports job progress. `task_succeeded` is called at
/// most once per output index; `job_failed` at most once and is terminal:
/// successes delivered afterwards are dropped by the implementation.
pub trait JobListener: Send + Sync {
    fn task_succeeded(&self, output_index: usize, result: TaskOutput) -> anyhow::Result<()>;

    fn job_failed(&self, error: &SharedSchedulerError);
}

pub type JobListenerRef = Arc<dyn JobListener>;

/// Blocking handle on a submitted job.
pub struct JobWaiter {
    job_id: JobId,
    total_tasks: usize,
    rx: oneshot::Receiver<JobResult>,
}

impl JobWaiter {
    /// Returns the waiter and the listener half handed to the scheduler. A
    /// zero-partition job completes right away.
    pub(crate) fn new(
        job_id: JobId,
        total_tasks: usize,
        handler: ResultHandler,
    ) -> (Self, Arc<WaiterListener>) {
        let (tx, rx) = oneshot::channel();
        let mut state = WaiterState {
            handler,
            finished: 0,
            failed: false,
            done_tx: Some(tx),
        };
        if total_tasks == 0 {
            let _ = state.done_tx.take().unwrap().send(Ok(()));
        }
        let waiter = Self {
            job_id,
            total_tasks,
            rx,
        };
        let listener = Arc::new(WaiterListener {
            total_tasks,
            state: Mutex::new(state),
        });
        (waiter, listener)
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn total_tasks(&self) -> usize {
        self.total_tasks
    }

    pub async fn await_completion(self) -> JobResult {
        self.rx
            .await
            .unwrap_or_else(|_| Err(SchedulerError::ContextShutdown.into_shared()))
    }
}

struct WaiterState {
    handler: ResultHandler,
    finished: usize,
    failed: bool,
    done_tx: Option<oneshot::Sender<JobResult>>,
}

pub struct WaiterListener {
    total_tasks: usize,
    state: Mutex<WaiterState>,
}

impl JobListener for WaiterListener {
    fn task_succeeded(&self, output_index: usize, result: TaskOutput) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        if state.failed {
            return Ok(());
        }
        // A handler error is propagated to the scheduler, which fails the
        // job; the partition is not counted as finished.
        (state.handler)(output_index, result)?;
        state.finished += 1;
        if state.finished == self.total_tasks {
            if let Some(tx) = state.done_tx.take() {
                let _ = tx.send(Ok(()));
            }
        }
        Ok(())
    }

    fn job_failed(&self, error: &SharedSchedulerError) {
        let mut state = self.state.lock();
        if state.failed {
            return;
        }
        state.failed = true;
        if let Some(tx) = state.done_tx.take() {
            let _ = tx.send(Err(error.clone()));
        }
    }
}

/// Merges per-partition results into a running approximation, so a caller
/// can read a usable value before every partition has reported.
pub trait ApproximateEvaluator<U, R>: Send {
    fn merge(&mut self, output_index: usize, result: U);

    fn current_result(&self) -> R;
}

/// Outcome of [`crate::DagScheduler::run_approximate_job`]: the evaluator's
/// value at either full completion or timeout.
#[derive(Debug)]
pub struct PartialResult<R> {
    pub value: R,
    pub is_final: bool,
}

pub(crate) struct ApproximateListener<U, R, E> {
    evaluator: Arc<Mutex<E>>,
    total_tasks: usize,
    state: Mutex<ApproximateState>,
    _result: PhantomData<fn(U) -> R>,
}

struct ApproximateState {
    finished: usize,
    failed: bool,
    done_tx: Option<oneshot::Sender<JobResult>>,
}

impl<U, R, E> ApproximateListener<U, R, E> {
    pub fn new(
        evaluator: Arc<Mutex<E>>,
        total_tasks: usize,
    ) -> (Arc<Self>, oneshot::Receiver<JobResult>) {
        let (tx, rx) = oneshot::channel();
        let mut state = ApproximateState {
            finished: 0,
            failed: false,
            done_tx: Some(tx),
        };
        if total_tasks == 0 {
            let _ = state.done_tx.take().unwrap().send(Ok(()));
        }
        let listener = Arc::new(Self {
            evaluator,
            total_tasks,
            state: Mutex::new(state),
            _result: PhantomData,
        });
        (listener, rx)
    }
}

impl<U, R, E> JobListener for ApproximateListener<U, R, E>
where
    U: Send + 'static,
    E: ApproximateEvaluator<U, R> + Send,
    R: 'static,
{
    fn task_succeeded(&self, output_index: usize, result: TaskOutput) -> anyhow::Result<()> {
        let result = result
            .downcast::<U>()
            .map_err(|_| anyhow!("task result has an unexpected type"))?;

        let mut state = self.state.lock();
        if state.failed {
            return Ok(());
        }
        self.evaluator.lock().merge(output_index, *result);
        state.finished += 1;
        if state.finished == self.total_tasks {
            if let Some(tx) = state.done_tx.take() {
                let _ = tx.send(Ok(()));
            }
        }
        Ok(())
    }

    fn job_failed(&self, error: &SharedSchedulerError) {
        let mut state = self.state.lock();
        if state.failed {
            return;
        }
        state.failed = true;
        if let Some(tx) = state.done_tx.take() {
            let _ = tx.send(Err(error.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collecting_waiter(total: usize) -> (JobWaiter, Arc<WaiterListener>, Arc<Mutex<Vec<usize>>>) {
        let delivered = Arc::new(Mutex::new(Vec::new()));
        let sink = delivered.clone();
        let (waiter, listener) = JobWaiter::new(
            1,
            total,
            Box::new(move |index, _| {
                sink.lock().push(index);
                Ok(())
            }),
        );
        (waiter, listener, delivered)
    }

    #[tokio::test]
    async fn test_waiter_succeeds_after_all_tasks() {
        let (waiter, listener, delivered) = collecting_waiter(3);
        for index in 0..3 {
            listener
                .task_succeeded(index, Box::new(index as u32))
                .unwrap();
        }
        waiter.await_completion().await.unwrap();
        assert_eq!(*delivered.lock(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_empty_job_completes_immediately() {
        let (waiter, _listener, delivered) = collecting_waiter(0);
        waiter.await_completion().await.unwrap();
        assert!(delivered.lock().is_empty());
    }

    #[tokio::test]
    async fn test_first_failure_wins() {
        let (waiter, listener, delivered) = collecting_waiter(2);
        listener.task_succeeded(0, Box::new(0u32)).unwrap();

        let error = SchedulerError::JobCancelled {
            job_id: 1,
            reason: "cancelled by user".to_owned(),
        }
        .into_shared();
        listener.job_failed(&error);
        // Late success and a second failure are both ignored.
        listener.task_succeeded(1, Box::new(1u32)).unwrap();
        listener.job_failed(&SchedulerError::ContextShutdown.into_shared());

        let err = waiter.await_completion().await.unwrap_err();
        assert_matches::assert_matches!(&*err, SchedulerError::JobCancelled { job_id: 1, .. });
        assert_eq!(*delivered.lock(), vec![0]);
    }

    struct CountEvaluator {
        sum: u64,
    }

    impl ApproximateEvaluator<u64, u64> for CountEvaluator {
        fn merge(&mut self, _output_index: usize, result: u64) {
            self.sum += result;
        }

        fn current_result(&self) -> u64 {
            self.sum
        }
    }

    #[tokio::test]
    async fn test_approximate_listener_merges_results() {
        let evaluator = Arc::new(Mutex::new(CountEvaluator { sum: 0 }));
        let (listener, rx) = ApproximateListener::<u64, u64, _>::new(evaluator.clone(), 2);

        listener.task_succeeded(0, Box::new(40u64)).unwrap();
        assert_eq!(evaluator.lock().current_result(), 40);

        listener.task_succeeded(1, Box::new(2u64)).unwrap();
        rx.await.unwrap().unwrap();
        assert_eq!(evaluator.lock().current_result(), 42);

        // A result of the wrong type is a driver-side bug, not a panic.
        let (listener, _rx) = ApproximateListener::<u64, u64, _>::new(evaluator, 1);
        assert!(listener.task_succeeded(0, Box::new("oops")).is_err());
    }
}
