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

//! Preferred-location resolution for tasks.
//!
//! Preference order: cached partition locations, then the dataset's own
//! hints, then locations inherited through narrow parents, then (when
//! enabled) the hosts holding the bulk of a reducer's shuffle input.

use std::collections::HashSet;
use std::sync::Arc;

use eddy_common::config::SchedulerConfig;

use crate::block_manager::BlockManagerMasterRef;
use crate::dag::cache::CacheLocationCache;
use crate::dataset::{Dataset, DatasetId, DatasetRef, Dependency};
use crate::error::SchedulerResult;
use crate::map_output::MapOutputRegistryRef;
use crate::task::TaskLocation;

#[derive(Clone)]
pub struct LocalityResolver {
    config: Arc<SchedulerConfig>,
    cache: CacheLocationCache,
    block_manager: BlockManagerMasterRef,
    map_output: MapOutputRegistryRef,
}

impl LocalityResolver {
    pub fn new(
        config: Arc<SchedulerConfig>,
        cache: CacheLocationCache,
        block_manager: BlockManagerMasterRef,
        map_output: MapOutputRegistryRef,
    ) -> Self {
        Self {
            config,
            cache,
            block_manager,
            map_output,
        }
    }

    pub fn cache(&self) -> &CacheLocationCache {
        &self.cache
    }

    /// Ordered locations the task for `(dataset, partition)` should prefer.
    /// Empty when the task may run anywhere.
    pub fn preferred_locations(
        &self,
        dataset: &DatasetRef,
        partition: usize,
    ) -> SchedulerResult<Vec<TaskLocation>> {
        let mut visited = HashSet::new();
        self.preferred_locations_internal(dataset, partition, &mut visited)
    }

    fn preferred_locations_internal(
        &self,
        dataset: &DatasetRef,
        partition: usize,
        visited: &mut HashSet<(DatasetId, usize)>,
    ) -> SchedulerResult<Vec<TaskLocation>> {
        // Guards against revisiting a partition through diamond-shaped
        // narrow lineage.
        if !visited.insert((dataset.id(), partition)) {
            return Ok(vec![]);
        }

        let cached = self.cache.locations_of(dataset, &*self.block_manager)?;
        if let Some(locations) = cached.get(partition) {
            if !locations.is_empty() {
                return Ok(locations.clone());
            }
        }

        let hinted = dataset.preferred_locations(partition);
        if !hinted.is_empty() {
            return Ok(hinted.to_vec());
        }

        for dep in dataset.dependencies() {
            if let Dependency::Narrow(narrow) = dep {
                for parent_partition in narrow.parent_partitions(partition) {
                    let locations = self.preferred_locations_internal(
                        narrow.parent(),
                        parent_partition,
                        visited,
                    )?;
                    if !locations.is_empty() {
                        return Ok(locations);
                    }
                }
            }
        }

        if self.config.reduce_locality_enabled {
            if let Some(locations) = self.reduce_preferred_locations(dataset, partition) {
                return Ok(locations);
            }
        }

        Ok(vec![])
    }

    /// Hosts holding at least `reducer_pref_locs_fraction` of this reduce
    /// partition's input, when both sides of the shuffle are small enough
    /// for the preference to matter.
    fn reduce_preferred_locations(
        &self,
        dataset: &Dataset,
        partition: usize,
    ) -> Option<Vec<TaskLocation>> {
        if dataset.num_partitions() >= self.config.pref_reduce_threshold {
            return None;
        }
        for dep in dataset.dependencies() {
            let Dependency::Shuffle(shuffle) = dep else {
                continue;
            };
            if shuffle.parent().num_partitions() >= self.config.pref_map_threshold {
                continue;
            }
            let locations = self.map_output.locations_with_largest_outputs(
                shuffle.shuffle_id(),
                partition,
                self.config.reducer_pref_locs_fraction,
            )?;
            return Some(
                locations
                    .into_iter()
                    .map(|bm| TaskLocation::Executor {
                        host: bm.host().to_owned(),
                        executor_id: bm.executor_id,
                    })
                    .collect(),
            );
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_manager::{
        BlockManagerId, BlockManagerMaster, ExecutorId, PartitionBlockId,
    };
    use crate::dataset::{NarrowDependency, NarrowKind, ShuffleDependency, StorageLevel};
    use crate::map_output::{InMemoryMapOutputRegistry, MapOutputRegistry, MapStatus};

    struct StaticBlockManager {
        cached: Vec<(PartitionBlockId, BlockManagerId)>,
    }

    impl BlockManagerMaster for StaticBlockManager {
        fn get_locations(
            &self,
            block_ids: &[PartitionBlockId],
        ) -> SchedulerResult<Vec<Vec<BlockManagerId>>> {
            Ok(block_ids
                .iter()
                .map(|id| {
                    self.cached
                        .iter()
                        .filter(|(cached_id, _)| cached_id == id)
                        .map(|(_, bm)| bm.clone())
                        .collect()
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

    fn resolver(
        config: SchedulerConfig,
        cached: Vec<(PartitionBlockId, BlockManagerId)>,
        map_output: MapOutputRegistryRef,
    ) -> LocalityResolver {
        LocalityResolver::new(
            Arc::new(config),
            CacheLocationCache::new(),
            Arc::new(StaticBlockManager { cached }),
            map_output,
        )
    }

    fn bm(executor: &str, host: &str) -> BlockManagerId {
        BlockManagerId::new(executor, format!("{}:7337", host).parse().unwrap())
    }

    #[test]
    fn test_cached_location_wins_over_hints() {
        let registry = Arc::new(InMemoryMapOutputRegistry::new());
        let resolver = resolver(
            SchedulerConfig::default(),
            vec![(
                PartitionBlockId {
                    dataset_id: 1,
                    partition: 0,
                },
                bm("e1", "host-a"),
            )],
            registry,
        );

        let dataset = Arc::new(
            Dataset::new(1, "cached", 1, vec![], StorageLevel::Cached).with_preferred_locations(
                vec![vec![TaskLocation::Host("host-z".to_owned())]],
            ),
        );
        assert_eq!(
            resolver.preferred_locations(&dataset, 0).unwrap(),
            vec![TaskLocation::Executor {
                host: "host-a".to_owned(),
                executor_id: "e1".to_owned(),
            }]
        );
    }

    #[test]
    fn test_locations_inherited_through_narrow_chain() {
        let registry = Arc::new(InMemoryMapOutputRegistry::new());
        let resolver = resolver(SchedulerConfig::default(), vec![], registry);

        let source = Arc::new(
            Dataset::new(1, "source", 2, vec![], StorageLevel::None).with_preferred_locations(
                vec![
                    vec![TaskLocation::Host("host-a".to_owned())],
                    vec![TaskLocation::Host("host-b".to_owned())],
                ],
            ),
        );
        let mapped = Arc::new(Dataset::new(
            2,
            "mapped",
            2,
            vec![Dependency::Narrow(NarrowDependency::new(
                source,
                NarrowKind::OneToOne,
            ))],
            StorageLevel::None,
        ));

        assert_eq!(
            resolver.preferred_locations(&mapped, 1).unwrap(),
            vec![TaskLocation::Host("host-b".to_owned())]
        );
    }

    #[test]
    fn test_reduce_locality_respects_config() {
        let registry: Arc<InMemoryMapOutputRegistry> = Arc::new(InMemoryMapOutputRegistry::new());
        registry.register_shuffle(7, 1);
        registry.register_map_outputs(
            7,
            vec![Some(MapStatus::new(bm("e2", "host-b"), vec![100, 0]))],
            false,
        );

        let map_side = Arc::new(Dataset::new(1, "map-side", 1, vec![], StorageLevel::None));
        let reduced = Arc::new(Dataset::new(
            2,
            "reduced",
            2,
            vec![Dependency::Shuffle(Arc::new(ShuffleDependency::new(
                7, map_side,
            )))],
            StorageLevel::None,
        ));

        // Disabled by default.
        let off = resolver(SchedulerConfig::default(), vec![], registry.clone());
        assert!(off.preferred_locations(&reduced, 0).unwrap().is_empty());

        let config = SchedulerConfig {
            reduce_locality_enabled: true,
            ..Default::default()
        };
        let on = resolver(config, vec![], registry.clone());
        assert_eq!(
            on.preferred_locations(&reduced, 0).unwrap(),
            vec![TaskLocation::Executor {
                host: "host-b".to_owned(),
                executor_id: "e2".to_owned(),
            }]
        );
        // Reducer 1 receives no bytes, so no preference.
        assert!(on.preferred_locations(&reduced, 1).unwrap().is_empty());

        // Oversized map side disables the heuristic.
        let tiny_threshold = SchedulerConfig {
            reduce_locality_enabled: true,
            pref_map_threshold: 0,
            ..Default::default()
        };
        let capped = resolver(tiny_threshold, vec![], registry);
        assert!(capped.preferred_locations(&reduced, 0).unwrap().is_empty());
    }
}
