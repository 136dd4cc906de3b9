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

//! Interface to the cluster-wide block manager, which tracks where cached
//! partitions and shuffle files physically live.

use std::sync::Arc;

use eddy_common::util::addr::HostAddr;
use serde::{Deserialize, Serialize};

use crate::dataset::DatasetId;
use crate::error::SchedulerResult;

pub type ExecutorId = String;

pub type BlockManagerMasterRef = Arc<dyn BlockManagerMaster>;

/// Identity of one block manager instance: the executor it serves and the
/// address its block transfer service listens on.
#[derive(Clone, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockManagerId {
    pub executor_id: ExecutorId,
    pub addr: HostAddr,
}

impl BlockManagerId {
    pub fn new(executor_id: impl Into<ExecutorId>, addr: HostAddr) -> Self {
        Self {
            executor_id: executor_id.into(),
            addr,
        }
    }

    pub fn host(&self) -> &str {
        &self.addr.host
    }
}

impl std::fmt::Display for BlockManagerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BlockManagerId({}, {})", self.executor_id, self.addr)
    }
}

/// The block holding one cached partition of a dataset.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub struct PartitionBlockId {
    pub dataset_id: DatasetId,
    pub partition: usize,
}

/// Driver-side endpoint of the block manager. Calls are bounded-time RPCs
/// issued synchronously from the scheduler.
pub trait BlockManagerMaster: Send + Sync {
    /// Current replica locations for each queried block, in query order.
    fn get_locations(
        &self,
        block_ids: &[PartitionBlockId],
    ) -> SchedulerResult<Vec<Vec<BlockManagerId>>>;

    /// Drop all state held for an executor that left the cluster.
    fn remove_executor(&self, executor_id: &ExecutorId);

    /// Whether shuffle files written by the executor outlive the executor
    /// process (i.e. an external shuffle service serves them).
    fn hosts_external_shuffle(&self, executor_id: &ExecutorId) -> bool;

    /// Relays an executor heartbeat. Returns `false` iff the block manager
    /// does not know the sender, which asks the executor to re-register.
    fn heartbeat(&self, block_manager_id: &BlockManagerId) -> bool;
}
