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

use serde::Deserialize;

/// Configuration of the stage scheduler, deserialized from the `[scheduler]`
/// section of the engine config file. Unrecognized fields are rejected so that
/// typos do not silently fall back to defaults.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchedulerConfig {
    /// Whether reduce tasks prefer the hosts holding the largest share of
    /// their shuffle input.
    #[serde(default = "default::reduce_locality_enabled")]
    pub reduce_locality_enabled: bool,

    /// Reduce-side locality is skipped when the map side of the shuffle has
    /// at least this many partitions.
    #[serde(default = "default::pref_map_threshold")]
    pub pref_map_threshold: usize,

    /// Reduce-side locality is skipped when the reduce side of the shuffle
    /// has at least this many partitions.
    #[serde(default = "default::pref_reduce_threshold")]
    pub pref_reduce_threshold: usize,

    /// A host is preferred for a reducer only if it holds at least this
    /// fraction of the reducer's input by size.
    #[serde(default = "default::reducer_pref_locs_fraction")]
    pub reducer_pref_locs_fraction: f64,

    /// Debounce window for resubmitting stages after fetch failures, so that
    /// a burst of failures coalesces into one resubmission pass.
    #[serde(default = "default::resubmit_timeout_ms")]
    pub resubmit_timeout_ms: u64,

    /// Emit a diagnostic when a job has been submitted for this long without
    /// any of its tasks starting.
    #[serde(default = "default::starvation_timeout_ms")]
    pub starvation_timeout_ms: u64,

    /// Abort a stage on the first fetch failure instead of resubmitting it.
    /// Only meant for fault-injection tests.
    #[serde(default = "default::no_stage_retry")]
    pub no_stage_retry: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            reduce_locality_enabled: default::reduce_locality_enabled(),
            pref_map_threshold: default::pref_map_threshold(),
            pref_reduce_threshold: default::pref_reduce_threshold(),
            reducer_pref_locs_fraction: default::reducer_pref_locs_fraction(),
            resubmit_timeout_ms: default::resubmit_timeout_ms(),
            starvation_timeout_ms: default::starvation_timeout_ms(),
            no_stage_retry: default::no_stage_retry(),
        }
    }
}

mod default {
    pub fn reduce_locality_enabled() -> bool {
        false
    }

    pub fn pref_map_threshold() -> usize {
        1000
    }

    pub fn pref_reduce_threshold() -> usize {
        1000
    }

    pub fn reducer_pref_locs_fraction() -> f64 {
        0.2
    }

    pub fn resubmit_timeout_ms() -> u64 {
        200
    }

    pub fn starvation_timeout_ms() -> u64 {
        15_000
    }

    pub fn no_stage_retry() -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SchedulerConfig::default();
        assert!(!config.reduce_locality_enabled);
        assert_eq!(config.pref_map_threshold, 1000);
        assert_eq!(config.pref_reduce_threshold, 1000);
        assert_eq!(config.reducer_pref_locs_fraction, 0.2);
        assert_eq!(config.resubmit_timeout_ms, 200);
        assert_eq!(config.starvation_timeout_ms, 15_000);
        assert!(!config.no_stage_retry);
    }
}
