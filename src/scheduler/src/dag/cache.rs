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

//! Memoized per-dataset partition cache locations.
//!
//! Entries are filled from the block manager on first use and invalidated
//! wholesale whenever they could have gone stale: on job submission, on
//! fetch-failure resubmission, on executor loss that affects shuffle
//! outputs, and when a map stage registers new outputs.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::block_manager::{BlockManagerMaster, PartitionBlockId};
use crate::dataset::{Dataset, DatasetId, StorageLevel};
use crate::error::SchedulerResult;
use crate::task::TaskLocation;

/// Shared between the scheduler loop and caller threads resolving preferred
/// locations, hence the lock.
#[derive(Clone, Default)]
pub struct CacheLocationCache {
    inner: Arc<Mutex<HashMap<DatasetId, Vec<Vec<TaskLocation>>>>>,
}

impl CacheLocationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached locations of every partition of `dataset`, one (possibly
    /// empty) list per partition.
    pub fn locations_of(
        &self,
        dataset: &Dataset,
        block_manager: &dyn BlockManagerMaster,
    ) -> SchedulerResult<Vec<Vec<TaskLocation>>> {
        let mut cache = self.inner.lock();
        if let Some(locations) = cache.get(&dataset.id()) {
            return Ok(locations.clone());
        }

        let locations = if dataset.storage_level() == StorageLevel::None {
            // Never materialized, skip the block manager round trip.
            vec![vec![]; dataset.num_partitions()]
        } else {
            let block_ids: Vec<_> = (0..dataset.num_partitions())
                .map(|partition| PartitionBlockId {
                    dataset_id: dataset.id(),
                    partition,
                })
                .collect();
            block_manager
                .get_locations(&block_ids)?
                .into_iter()
                .map(|replicas| {
                    replicas
                        .into_iter()
                        .map(|bm| TaskLocation::Executor {
                            host: bm.host().to_owned(),
                            executor_id: bm.executor_id,
                        })
                        .collect()
                })
                .collect()
        };
        cache.insert(dataset.id(), locations.clone());
        Ok(locations)
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;
    use crate::block_manager::{BlockManagerId, ExecutorId};

    #[derive(Default)]
    struct CountingBlockManager {
        lookups: Mutex<usize>,
    }

    impl BlockManagerMaster for CountingBlockManager {
        fn get_locations(
            &self,
            block_ids: &[PartitionBlockId],
        ) -> SchedulerResult<Vec<Vec<BlockManagerId>>> {
            *self.lookups.lock() += 1;
            Ok(block_ids
                .iter()
                .map(|block| {
                    if block.partition == 0 {
                        vec![BlockManagerId::new("e1", "host-a:7337".parse().unwrap())]
                    } else {
                        vec![]
                    }
                })
                .collect())
        }

        fn remove_executor(&self, _executor_id: &ExecutorId) {}

        fn hosts_external_shuffle(&self, _executor_id: &ExecutorId) -> bool {
            false
        }

        fn heartbeat(&self, _block_manager_id: &BlockManagerId) -> bool {
            true
        }
    }

    #[test]
    fn test_uncached_dataset_skips_block_manager() {
        let cache = CacheLocationCache::new();
        let block_manager = CountingBlockManager::default();
        let dataset = Dataset::new(1, "source", 2, vec![], StorageLevel::None);

        let locations = cache.locations_of(&dataset, &block_manager).unwrap();
        assert_eq!(locations, vec![vec![], vec![]]);
        assert_eq!(*block_manager.lookups.lock(), 0);
    }

    #[test]
    fn test_lookup_memoized_until_cleared() {
        let cache = CacheLocationCache::new();
        let block_manager = CountingBlockManager::default();
        let dataset = Dataset::new(1, "cached", 2, vec![], StorageLevel::Cached);

        let locations = cache.locations_of(&dataset, &block_manager).unwrap();
        assert_eq!(locations[0].len(), 1);
        assert!(locations[1].is_empty());

        cache.locations_of(&dataset, &block_manager).unwrap();
        assert_eq!(*block_manager.lookups.lock(), 1);

        cache.clear();
        cache.locations_of(&dataset, &block_manager).unwrap();
        assert_eq!(*block_manager.lookups.lock(), 2);
    }
}
