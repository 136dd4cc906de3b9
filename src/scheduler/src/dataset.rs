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

//! Descriptors of the dataset graph the scheduler walks.
//!
//! Datasets themselves (partition contents, iterators, compute functions)
//! live outside the scheduler. What the scheduler needs is the shape of the
//! graph: how many partitions each dataset has, which parents it depends on,
//! whether each edge is narrow or requires a shuffle, and optional locality
//! hints.

use std::sync::Arc;

use crate::task::TaskLocation;

pub type DatasetId = u32;
pub type ShuffleId = u32;

pub type DatasetRef = Arc<Dataset>;
pub type ShuffleDependencyRef = Arc<ShuffleDependency>;

/// Whether partitions of a dataset may be materialized by the block manager.
/// The scheduler only cares about the `None` case, which lets it skip cache
/// lookups entirely.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageLevel {
    None,
    Cached,
}

/// A dependency of a dataset on one of its parents.
#[derive(Clone, Debug)]
pub enum Dependency {
    Narrow(NarrowDependency),
    Shuffle(ShuffleDependencyRef),
}

/// Each child partition reads a bounded, locally computable set of parent
/// partitions. No data movement across the cluster is required.
#[derive(Clone, Debug)]
pub struct NarrowDependency {
    parent: DatasetRef,
    kind: NarrowKind,
}

#[derive(Clone, Copy, Debug)]
pub enum NarrowKind {
    /// Child partition `i` reads exactly parent partition `i`.
    OneToOne,
    /// Child partitions `[out_start, out_start + length)` read parent
    /// partitions `[in_start, in_start + length)`, index-shifted.
    Range {
        in_start: usize,
        out_start: usize,
        length: usize,
    },
}

impl NarrowDependency {
    pub fn new(parent: DatasetRef, kind: NarrowKind) -> Self {
        Self { parent, kind }
    }

    pub fn parent(&self) -> &DatasetRef {
        &self.parent
    }

    /// Parent partitions the given child partition reads.
    pub fn parent_partitions(&self, partition: usize) -> Vec<usize> {
        match self.kind {
            NarrowKind::OneToOne => vec![partition],
            NarrowKind::Range {
                in_start,
                out_start,
                length,
            } => {
                if partition >= out_start && partition < out_start + length {
                    vec![partition - out_start + in_start]
                } else {
                    vec![]
                }
            }
        }
    }
}

/// An all-to-all redistribution edge. The map side writes one output per
/// `(map partition, reduce partition)` pair under `shuffle_id`; the reduce
/// side fetches them through the map-output registry.
#[derive(Debug)]
pub struct ShuffleDependency {
    shuffle_id: ShuffleId,
    parent: DatasetRef,
}

impl ShuffleDependency {
    pub fn new(shuffle_id: ShuffleId, parent: DatasetRef) -> Self {
        Self { shuffle_id, parent }
    }

    pub fn shuffle_id(&self) -> ShuffleId {
        self.shuffle_id
    }

    pub fn parent(&self) -> &DatasetRef {
        &self.parent
    }
}

/// The scheduler-facing descriptor of a dataset.
pub struct Dataset {
    id: DatasetId,
    name: String,
    num_partitions: usize,
    dependencies: Vec<Dependency>,
    storage_level: StorageLevel,
    /// Per-partition placement hints declared by the dataset, e.g. the block
    /// locations of an HDFS file. Empty when the dataset declares none.
    preferred_locations: Vec<Vec<TaskLocation>>,
}

impl Dataset {
    pub fn new(
        id: DatasetId,
        name: impl Into<String>,
        num_partitions: usize,
        dependencies: Vec<Dependency>,
        storage_level: StorageLevel,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            num_partitions,
            dependencies,
            storage_level,
            preferred_locations: vec![],
        }
    }

    pub fn with_preferred_locations(mut self, locations: Vec<Vec<TaskLocation>>) -> Self {
        assert_eq!(locations.len(), self.num_partitions);
        self.preferred_locations = locations;
        self
    }

    pub fn id(&self) -> DatasetId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_partitions(&self) -> usize {
        self.num_partitions
    }

    pub fn dependencies(&self) -> &[Dependency] {
        &self.dependencies
    }

    pub fn storage_level(&self) -> StorageLevel {
        self.storage_level
    }

    pub fn preferred_locations(&self, partition: usize) -> &[TaskLocation] {
        self.preferred_locations
            .get(partition)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

impl std::fmt::Debug for Dataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dataset")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("num_partitions", &self.num_partitions)
            .field("storage_level", &self.storage_level)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_narrow_partition_mapping() {
        let parent = Arc::new(Dataset::new(1, "parent", 8, vec![], StorageLevel::None));

        let one_to_one = NarrowDependency::new(parent.clone(), NarrowKind::OneToOne);
        assert_eq!(one_to_one.parent_partitions(3), vec![3]);

        let range = NarrowDependency::new(
            parent,
            NarrowKind::Range {
                in_start: 4,
                out_start: 0,
                length: 4,
            },
        );
        assert_eq!(range.parent_partitions(0), vec![4]);
        assert_eq!(range.parent_partitions(3), vec![7]);
        // Out of the mapped window.
        assert_eq!(range.parent_partitions(4), Vec::<usize>::new());
    }
}
