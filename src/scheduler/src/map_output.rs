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

//! The map-output registry: the authority on where each shuffle's map
//! outputs live. The scheduler writes completed map outputs into it and
//! reads it for recomputation and reduce-side locality; reducer workers read
//! it to locate their inputs.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::block_manager::BlockManagerId;
use crate::dataset::ShuffleId;
use crate::error::SchedulerResult;

pub type MapOutputRegistryRef = Arc<dyn MapOutputRegistry>;

/// Location and size summary of one map task's shuffle output.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapStatus {
    pub location: BlockManagerId,
    /// Estimated output bytes per reduce partition, used to weigh reduce
    /// locality preferences.
    pub reduce_sizes: Vec<u64>,
}

impl MapStatus {
    pub fn new(location: BlockManagerId, reduce_sizes: Vec<u64>) -> Self {
        Self {
            location,
            reduce_sizes,
        }
    }
}

/// Driver-side interface of the map-output registry.
///
/// The `epoch` is a monotonic counter bumped whenever registered outputs are
/// invalidated (typically on executor loss); workers discard their cached
/// output maps when they observe a newer epoch.
pub trait MapOutputRegistry: Send + Sync {
    fn contains_shuffle(&self, shuffle_id: ShuffleId) -> bool;

    /// Introduce a shuffle with the given map-side partition count. Must be
    /// called exactly once per shuffle before outputs are registered.
    fn register_shuffle(&self, shuffle_id: ShuffleId, num_partitions: usize);

    /// Replace the registered outputs of a shuffle wholesale.
    fn register_map_outputs(
        &self,
        shuffle_id: ShuffleId,
        statuses: Vec<Option<MapStatus>>,
        change_epoch: bool,
    );

    /// Drop a single registered output, keeping the slot empty for
    /// recomputation.
    fn unregister_map_output(
        &self,
        shuffle_id: ShuffleId,
        map_index: usize,
        location: &BlockManagerId,
    );

    /// Currently registered outputs of a shuffle, one slot per map
    /// partition. Empty vec if the shuffle is unknown.
    fn map_outputs(&self, shuffle_id: ShuffleId) -> Vec<Option<MapStatus>>;

    /// The wire form of a shuffle's output map, as served to workers.
    fn serialized_map_outputs(&self, shuffle_id: ShuffleId) -> SchedulerResult<Bytes>;

    /// Block-manager locations that hold at least `fraction` of the given
    /// reduce partition's input by size. `None` when no location qualifies
    /// or the shuffle has unregistered outputs.
    fn locations_with_largest_outputs(
        &self,
        shuffle_id: ShuffleId,
        reduce_partition: usize,
        fraction: f64,
    ) -> Option<Vec<BlockManagerId>>;

    fn current_epoch(&self) -> u64;

    fn increment_epoch(&self);
}

/// Single-process implementation of the registry, used by tests and by
/// deployments that colocate the driver with the registry.
pub struct InMemoryMapOutputRegistry {
    inner: Mutex<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    shuffles: HashMap<ShuffleId, Vec<Option<MapStatus>>>,
    epoch: u64,
}

impl InMemoryMapOutputRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
        }
    }
}

impl Default for InMemoryMapOutputRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MapOutputRegistry for InMemoryMapOutputRegistry {
    fn contains_shuffle(&self, shuffle_id: ShuffleId) -> bool {
        self.inner.lock().shuffles.contains_key(&shuffle_id)
    }

    fn register_shuffle(&self, shuffle_id: ShuffleId, num_partitions: usize) {
        let mut inner = self.inner.lock();
        let prev = inner.shuffles.insert(shuffle_id, vec![None; num_partitions]);
        assert!(prev.is_none(), "shuffle {} registered twice", shuffle_id);
    }

    fn register_map_outputs(
        &self,
        shuffle_id: ShuffleId,
        statuses: Vec<Option<MapStatus>>,
        change_epoch: bool,
    ) {
        let mut inner = self.inner.lock();
        inner.shuffles.insert(shuffle_id, statuses);
        if change_epoch {
            inner.epoch += 1;
        }
    }

    fn unregister_map_output(
        &self,
        shuffle_id: ShuffleId,
        map_index: usize,
        location: &BlockManagerId,
    ) {
        let mut inner = self.inner.lock();
        if let Some(statuses) = inner.shuffles.get_mut(&shuffle_id) {
            if let Some(slot) = statuses.get_mut(map_index) {
                if slot.as_ref().is_some_and(|s| &s.location == location) {
                    *slot = None;
                }
            }
        }
        inner.epoch += 1;
    }

    fn map_outputs(&self, shuffle_id: ShuffleId) -> Vec<Option<MapStatus>> {
        self.inner
            .lock()
            .shuffles
            .get(&shuffle_id)
            .cloned()
            .unwrap_or_default()
    }

    fn serialized_map_outputs(&self, shuffle_id: ShuffleId) -> SchedulerResult<Bytes> {
        let statuses = self.map_outputs(shuffle_id);
        let bytes = bincode::serialize(&statuses)
            .with_context(|| format!("encode map outputs of shuffle {}", shuffle_id))?;
        Ok(bytes.into())
    }

    fn locations_with_largest_outputs(
        &self,
        shuffle_id: ShuffleId,
        reduce_partition: usize,
        fraction: f64,
    ) -> Option<Vec<BlockManagerId>> {
        let inner = self.inner.lock();
        let statuses = inner.shuffles.get(&shuffle_id)?;

        let mut total: u64 = 0;
        let mut by_location: HashMap<&BlockManagerId, u64> = HashMap::new();
        for status in statuses {
            let status = status.as_ref()?;
            let size = status.reduce_sizes.get(reduce_partition).copied()?;
            total += size;
            *by_location.entry(&status.location).or_default() += size;
        }
        if total == 0 {
            return None;
        }

        let threshold = total as f64 * fraction;
        let locations: Vec<_> = by_location
            .into_iter()
            .filter(|(_, size)| *size as f64 >= threshold)
            .map(|(location, _)| location.clone())
            .collect();
        if locations.is_empty() {
            None
        } else {
            Some(locations)
        }
    }

    fn current_epoch(&self) -> u64 {
        self.inner.lock().epoch
    }

    fn increment_epoch(&self) {
        self.inner.lock().epoch += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bm(executor: &str) -> BlockManagerId {
        BlockManagerId::new(executor, format!("{}-host:7337", executor).parse().unwrap())
    }

    fn status(executor: &str, reduce_sizes: Vec<u64>) -> MapStatus {
        MapStatus::new(bm(executor), reduce_sizes)
    }

    #[test]
    fn test_register_and_unregister() {
        let registry = InMemoryMapOutputRegistry::new();
        registry.register_shuffle(0, 2);
        assert!(registry.contains_shuffle(0));
        assert!(!registry.contains_shuffle(1));
        assert_eq!(registry.map_outputs(0), vec![None, None]);

        registry.register_map_outputs(
            0,
            vec![
                Some(status("e1", vec![10])),
                Some(status("e2", vec![20])),
            ],
            true,
        );
        assert_eq!(registry.current_epoch(), 1);

        // Unregistering with a non-matching location keeps the slot.
        registry.unregister_map_output(0, 0, &bm("e9"));
        assert!(registry.map_outputs(0)[0].is_some());

        registry.unregister_map_output(0, 0, &bm("e1"));
        assert!(registry.map_outputs(0)[0].is_none());
        assert!(registry.map_outputs(0)[1].is_some());
        // Every unregistration advances the epoch.
        assert_eq!(registry.current_epoch(), 3);
    }

    #[test]
    fn test_locations_with_largest_outputs() {
        let registry = InMemoryMapOutputRegistry::new();
        registry.register_shuffle(5, 3);
        registry.register_map_outputs(
            5,
            vec![
                Some(status("e1", vec![80, 0])),
                Some(status("e1", vec![10, 0])),
                Some(status("e2", vec![10, 0])),
            ],
            false,
        );

        // e1 holds 90% of reducer 0, e2 only 10%.
        let locations = registry
            .locations_with_largest_outputs(5, 0, 0.2)
            .unwrap();
        assert_eq!(locations, vec![bm("e1")]);

        // Reducer 1 has no bytes at all.
        assert!(registry.locations_with_largest_outputs(5, 1, 0.2).is_none());

        // Missing outputs disable the heuristic.
        registry.unregister_map_output(5, 0, &bm("e1"));
        assert!(registry.locations_with_largest_outputs(5, 0, 0.2).is_none());
    }
}
